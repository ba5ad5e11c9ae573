//! In-memory [`ClusterApi`] for tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard},
};

use dynakube_base::consts::{CLUSTER_ID_NAMESPACE, labels};
use k8s_openapi::{
    ByteString,
    api::core::v1::{ConfigMap, Namespace, ObjectReference, Secret},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::ResourceExt;

use super::{ClusterApi, Error, object_key};
use crate::{
    crd::{Condition, DynaKube},
    events::InjectionEvent,
};

pub const OPERATOR_NAMESPACE: &str = "dynatrace";
pub const CLUSTER_UID: &str = "9f1b0b36-7c5d-4a4e-9b0f-1a2b3c4d5e6f";

type Key = (String, String);

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    dynakubes: BTreeMap<String, DynaKube>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    owners: BTreeMap<(String, String, String), ObjectMeta>,
    crds: BTreeSet<String>,
    events: Vec<(String, InjectionEvent)>,
    next_resource_version: u64,
    config_map_conflicts: usize,
    secret_writes: usize,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }
}

pub struct FakeCluster {
    operator_namespace: String,
    state: Mutex<State>,
}

impl Default for FakeCluster {
    fn default() -> Self { Self::new() }
}

impl FakeCluster {
    /// A cluster holding the operator namespace and `kube-system`.
    pub fn new() -> Self {
        let cluster = Self {
            operator_namespace: OPERATOR_NAMESPACE.to_string(),
            state: Mutex::new(State::default()),
        };
        cluster.add_namespace(OPERATOR_NAMESPACE, &[]);
        {
            let mut state = cluster.state();
            let mut kube_system = namespace(CLUSTER_ID_NAMESPACE, &[]);
            kube_system.metadata.uid = Some(CLUSTER_UID.to_string());
            let _unused = state.namespaces.insert(CLUSTER_ID_NAMESPACE.to_string(), kube_system);
        }
        cluster
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn add_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        let mut state = self.state();
        let mut ns = namespace(name, labels);
        ns.metadata.uid = Some(format!("uid-{name}"));
        ns.metadata.resource_version = Some(state.bump());
        let _unused = state.namespaces.insert(name.to_string(), ns);
    }

    pub fn remove_namespace(&self, name: &str) {
        let _unused = self.state().namespaces.remove(name);
    }

    pub fn add_dynakube(&self, mut dynakube: DynaKube) {
        dynakube.metadata.namespace = Some(self.operator_namespace.clone());
        let _unused = self.state().dynakubes.insert(dynakube.name_any(), dynakube);
    }

    pub fn remove_dynakube(&self, name: &str) {
        let _unused = self.state().dynakubes.remove(name);
    }

    pub fn add_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(
                data.iter()
                    .map(|(key, value)| ((*key).to_string(), ByteString(value.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Secret::default()
        };
        let mut state = self.state();
        let mut secret = secret;
        secret.metadata.resource_version = Some(state.bump());
        let _unused = state.secrets.insert((namespace.to_string(), name.to_string()), secret);
    }

    pub fn add_config_map(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let mut state = self.state();
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some(state.bump()),
                ..ObjectMeta::default()
            },
            data: Some(
                data.iter()
                    .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                    .collect(),
            ),
            ..ConfigMap::default()
        };
        let _unused =
            state.config_maps.insert((namespace.to_string(), name.to_string()), config_map);
    }

    /// Registers a workload object that owner references may point to.
    pub fn add_owner(&self, namespace: &str, kind: &str, name: &str, owners: Vec<OwnerReference>) {
        let metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: (!owners.is_empty()).then_some(owners),
            ..ObjectMeta::default()
        };
        let _unused = self
            .state()
            .owners
            .insert((namespace.to_string(), kind.to_string(), name.to_string()), metadata);
    }

    pub fn add_crd(&self, name: &str) {
        let _unused = self.state().crds.insert(name.to_string());
    }

    /// Makes the next `count` config map replacements fail with a conflict.
    pub fn inject_config_map_conflicts(&self, count: usize) {
        self.state().config_map_conflicts = count;
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state().secrets.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn secret_string(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        self.secret(namespace, name)
            .and_then(|secret| secret.data)
            .and_then(|data| data.get(key).cloned())
            .map(|ByteString(bytes)| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn secret_writes(&self) -> usize { self.state().secret_writes }

    pub fn config_map_data(&self, name: &str) -> BTreeMap<String, String> {
        self.state()
            .config_maps
            .get(&(self.operator_namespace.clone(), name.to_string()))
            .and_then(|config_map| config_map.data.clone())
            .unwrap_or_default()
    }

    pub fn namespace_label(&self, namespace: &str, key: &str) -> Option<String> {
        self.state()
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.metadata.labels.as_ref())
            .and_then(|labels| labels.get(key).cloned())
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.state().namespaces.get(name).cloned()
    }

    pub fn dynakube(&self, name: &str) -> Option<DynaKube> {
        self.state().dynakubes.get(name).cloned()
    }

    /// Recorded events as `(regarding object name, event)`.
    pub fn events(&self) -> Vec<(String, InjectionEvent)> { self.state().events.clone() }
}

pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: (!labels.is_empty()).then(|| {
                labels.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
            }),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

fn key_of(namespace: Option<String>, name: Option<String>) -> Key {
    (namespace.unwrap_or_default(), name.unwrap_or_default())
}

impl ClusterApi for FakeCluster {
    fn operator_namespace(&self) -> &str { &self.operator_namespace }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        Ok(self.state().namespaces.get(name).cloned())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, Error> {
        Ok(self.state().namespaces.values().cloned().collect())
    }

    async fn set_namespace_instance_label(
        &self,
        name: &str,
        instance: Option<&str>,
    ) -> Result<(), Error> {
        let mut state = self.state();
        let Some(ns) = state.namespaces.get_mut(name) else {
            return Ok(());
        };
        let ns_labels = ns.metadata.labels.get_or_insert_with(BTreeMap::new);
        let _unused = match instance {
            Some(instance) => ns_labels.insert(labels::INSTANCE.to_string(), instance.to_string()),
            None => ns_labels.remove(labels::INSTANCE),
        };
        Ok(())
    }

    async fn get_dynakube(&self, name: &str) -> Result<Option<DynaKube>, Error> {
        Ok(self.state().dynakubes.get(name).cloned())
    }

    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>, Error> {
        Ok(self.state().dynakubes.values().cloned().collect())
    }

    async fn add_dynakube_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        if let Some(dynakube) = self.state().dynakubes.get_mut(name) {
            let finalizers = dynakube.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|existing| existing == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        }
        Ok(())
    }

    async fn remove_dynakube_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        if let Some(dynakube) = self.state().dynakubes.get_mut(name) {
            if let Some(finalizers) = dynakube.metadata.finalizers.as_mut() {
                finalizers.retain(|existing| existing != finalizer);
            }
        }
        Ok(())
    }

    async fn update_dynakube_conditions(
        &self,
        name: &str,
        conditions: &[Condition],
    ) -> Result<(), Error> {
        if let Some(dynakube) = self.state().dynakubes.get_mut(name) {
            dynakube.status.get_or_insert_with(Default::default).conditions = conditions.to_vec();
        }
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let key = key_of(secret.metadata.namespace.clone(), secret.metadata.name.clone());
        let mut state = self.state();
        if state.secrets.contains_key(&key) {
            return Err(Error::AlreadyExists { kind: "Secret", key: object_key(&key.0, &key.1) });
        }
        let mut secret = secret.clone();
        secret.metadata.resource_version = Some(state.bump());
        state.secret_writes += 1;
        let _unused = state.secrets.insert(key, secret);
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<(), Error> {
        let key = key_of(secret.metadata.namespace.clone(), secret.metadata.name.clone());
        let mut state = self.state();
        let current = state.secrets.get(&key).and_then(|s| s.metadata.resource_version.clone());
        if current.is_none() || current != secret.metadata.resource_version {
            return Err(Error::Conflict { kind: "Secret", key: object_key(&key.0, &key.1) });
        }
        let mut secret = secret.clone();
        secret.metadata.resource_version = Some(state.bump());
        state.secret_writes += 1;
        let _unused = state.secrets.insert(key, secret);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self.state().secrets.remove(&(namespace.to_string(), name.to_string())).is_some())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self.state().config_maps.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let key = key_of(config_map.metadata.namespace.clone(), config_map.metadata.name.clone());
        let mut state = self.state();
        if state.config_maps.contains_key(&key) {
            return Err(Error::AlreadyExists { kind: "ConfigMap", key: object_key(&key.0, &key.1) });
        }
        let mut config_map = config_map.clone();
        config_map.metadata.resource_version = Some(state.bump());
        let _unused = state.config_maps.insert(key, config_map);
        Ok(())
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let key = key_of(config_map.metadata.namespace.clone(), config_map.metadata.name.clone());
        let mut state = self.state();
        if state.config_map_conflicts > 0 {
            state.config_map_conflicts -= 1;
            // a concurrent writer bumps the version
            let version = state.bump();
            if let Some(current) = state.config_maps.get_mut(&key) {
                current.metadata.resource_version = Some(version);
            }
            return Err(Error::Conflict { kind: "ConfigMap", key: object_key(&key.0, &key.1) });
        }
        let current = state.config_maps.get(&key).and_then(|c| c.metadata.resource_version.clone());
        if current.is_none() || current != config_map.metadata.resource_version {
            return Err(Error::Conflict { kind: "ConfigMap", key: object_key(&key.0, &key.1) });
        }
        let mut config_map = config_map.clone();
        config_map.metadata.resource_version = Some(state.bump());
        let _unused = state.config_maps.insert(key, config_map);
        Ok(())
    }

    async fn get_owner_metadata(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<Option<ObjectMeta>, Error> {
        Ok(self
            .state()
            .owners
            .get(&(namespace.to_string(), owner.kind.clone(), owner.name.clone()))
            .cloned())
    }

    async fn custom_resource_definition_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.state().crds.contains(name))
    }

    async fn publish_event(&self, regarding: &ObjectReference, event: &InjectionEvent) {
        let name = regarding.name.clone().unwrap_or_default();
        self.state().events.push((name, event.clone()));
    }
}

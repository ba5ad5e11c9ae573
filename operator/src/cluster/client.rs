use std::collections::BTreeMap;

use dynakube_base::consts::{CONTROLLER_NAME, labels};
use k8s_openapi::{
    api::core::v1::{ConfigMap, Namespace, ObjectReference, Secret},
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::{
    Api, Client, ResourceExt,
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
        PostParams,
    },
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use snafu::ResultExt;

use super::{ClusterApi, Error, error, object_key};
use crate::{
    crd::{Condition, DynaKube},
    events::InjectionEvent,
};

const STATUS_CONFLICT: u16 = 409;
const STATUS_NOT_FOUND: u16 = 404;

/// [`ClusterApi`] backed by the API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    operator_namespace: String,
    recorder: Recorder,
}

impl KubeCluster {
    pub fn new(client: Client, operator_namespace: impl Into<String>) -> Self {
        let reporter = Reporter { controller: CONTROLLER_NAME.to_string(), instance: None };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, operator_namespace: operator_namespace.into(), recorder }
    }

    #[inline]
    pub fn client(&self) -> Client { self.client.clone() }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn dynakubes(&self) -> Api<DynaKube> {
        Api::namespaced(self.client.clone(), &self.operator_namespace)
    }

    async fn patch_dynakube_finalizers(
        &self,
        name: &str,
        finalizers: &[String],
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        let _dynakube = self
            .dynakubes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|_| error::PatchResourceSnafu {
                kind: "DynaKube",
                key: object_key(&self.operator_namespace, name),
            })?;
        Ok(())
    }
}

fn status_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

impl ClusterApi for KubeCluster {
    fn operator_namespace(&self) -> &str { &self.operator_namespace }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        Api::<Namespace>::all(self.client.clone())
            .get_opt(name)
            .await
            .with_context(|_| error::GetResourceSnafu { kind: "Namespace", key: name.to_string() })
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, Error> {
        Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .context(error::ListResourcesSnafu { kind: "Namespace" })
    }

    async fn set_namespace_instance_label(
        &self,
        name: &str,
        instance: Option<&str>,
    ) -> Result<(), Error> {
        let labels = BTreeMap::from([(labels::INSTANCE, instance)]);
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        let _namespace = Api::<Namespace>::all(self.client.clone())
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|_| error::PatchResourceSnafu {
                kind: "Namespace",
                key: name.to_string(),
            })?;
        Ok(())
    }

    async fn get_dynakube(&self, name: &str) -> Result<Option<DynaKube>, Error> {
        self.dynakubes().get_opt(name).await.with_context(|_| error::GetResourceSnafu {
            kind: "DynaKube",
            key: object_key(&self.operator_namespace, name),
        })
    }

    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>, Error> {
        self.dynakubes()
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .context(error::ListResourcesSnafu { kind: "DynaKube" })
    }

    async fn add_dynakube_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let Some(dynakube) = self.get_dynakube(name).await? else {
            return Ok(());
        };
        let mut finalizers = dynakube.finalizers().to_vec();
        if finalizers.iter().any(|existing| existing == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_dynakube_finalizers(name, &finalizers).await
    }

    async fn remove_dynakube_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let Some(dynakube) = self.get_dynakube(name).await? else {
            return Ok(());
        };
        if !dynakube.finalizers().iter().any(|existing| existing == finalizer) {
            return Ok(());
        }
        let finalizers: Vec<String> = dynakube
            .finalizers()
            .iter()
            .filter(|existing| existing.as_str() != finalizer)
            .cloned()
            .collect();
        self.patch_dynakube_finalizers(name, &finalizers).await
    }

    async fn update_dynakube_conditions(
        &self,
        name: &str,
        conditions: &[Condition],
    ) -> Result<(), Error> {
        let key = object_key(&self.operator_namespace, name);
        let conditions = serde_json::to_value(conditions)
            .with_context(|_| error::SerializeResourceSnafu {
                kind: "DynaKube",
                key: key.clone(),
            })?;
        let patch = serde_json::json!({ "status": { "conditions": conditions } });
        let _dynakube = self
            .dynakubes()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::PatchResourceSnafu { kind: "DynaKube", key })?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        self.secrets(namespace).get_opt(name).await.with_context(|_| {
            error::GetResourceSnafu { kind: "Secret", key: object_key(namespace, name) }
        })
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.namespace().unwrap_or_default();
        let key = object_key(&namespace, &secret.name_any());
        match self.secrets(&namespace).create(&PostParams::default(), secret).await {
            Ok(_secret) => Ok(()),
            Err(err) if status_code(&err) == Some(STATUS_CONFLICT) => {
                error::AlreadyExistsSnafu { kind: "Secret", key }.fail()
            }
            Err(err) => Err(err).context(error::CreateResourceSnafu { kind: "Secret", key }),
        }
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        let key = object_key(&namespace, &name);
        match self.secrets(&namespace).replace(&name, &PostParams::default(), secret).await {
            Ok(_secret) => Ok(()),
            Err(err) if status_code(&err) == Some(STATUS_CONFLICT) => {
                error::ConflictSnafu { kind: "Secret", key }.fail()
            }
            Err(err) => Err(err).context(error::ReplaceResourceSnafu { kind: "Secret", key }),
        }
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        match self.secrets(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_response) => Ok(true),
            Err(err) if status_code(&err) == Some(STATUS_NOT_FOUND) => Ok(false),
            Err(err) => Err(err).context(error::DeleteResourceSnafu {
                kind: "Secret",
                key: object_key(namespace, name),
            }),
        }
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        self.config_maps(namespace).get_opt(name).await.with_context(|_| {
            error::GetResourceSnafu { kind: "ConfigMap", key: object_key(namespace, name) }
        })
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = config_map.namespace().unwrap_or_default();
        let key = object_key(&namespace, &config_map.name_any());
        match self.config_maps(&namespace).create(&PostParams::default(), config_map).await {
            Ok(_config_map) => Ok(()),
            Err(err) if status_code(&err) == Some(STATUS_CONFLICT) => {
                error::AlreadyExistsSnafu { kind: "ConfigMap", key }.fail()
            }
            Err(err) => Err(err).context(error::CreateResourceSnafu { kind: "ConfigMap", key }),
        }
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = config_map.namespace().unwrap_or_default();
        let name = config_map.name_any();
        let key = object_key(&namespace, &name);
        match self.config_maps(&namespace).replace(&name, &PostParams::default(), config_map).await
        {
            Ok(_config_map) => Ok(()),
            Err(err) if status_code(&err) == Some(STATUS_CONFLICT) => {
                error::ConflictSnafu { kind: "ConfigMap", key }.fail()
            }
            Err(err) => Err(err).context(error::ReplaceResourceSnafu { kind: "ConfigMap", key }),
        }
    }

    async fn get_owner_metadata(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<Option<ObjectMeta>, Error> {
        let (group, version) = split_api_version(&owner.api_version);
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &owner.kind));
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        api.get_metadata_opt(&owner.name)
            .await
            .map(|object| object.map(|object| object.metadata))
            .with_context(|_| error::GetResourceSnafu {
                kind: "owner",
                key: format!("{} {}", owner.kind, object_key(namespace, &owner.name)),
            })
    }

    async fn custom_resource_definition_exists(&self, name: &str) -> Result<bool, Error> {
        Api::<CustomResourceDefinition>::all(self.client.clone())
            .get_opt(name)
            .await
            .map(|crd| crd.is_some())
            .with_context(|_| error::GetResourceSnafu {
                kind: "CustomResourceDefinition",
                key: name.to_string(),
            })
    }

    async fn publish_event(&self, regarding: &ObjectReference, event: &InjectionEvent) {
        let InjectionEvent { reason, note } = event;
        let event = Event {
            type_: if reason.is_warning() { EventType::Warning } else { EventType::Normal },
            reason: reason.as_str().to_string(),
            note: Some(note.clone()),
            action: reason.as_str().to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, regarding).await {
            tracing::warn!(reason = %reason, error = %err, "Failed to publish event");
        }
    }
}

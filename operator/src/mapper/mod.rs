//! The selector index: which `DynaKube` claims which namespace.
//!
//! Two config maps in the operator namespace, one per [`MapKind`], map a
//! namespace name to the name of the `DynaKube` whose selector matches it.
//! A namespace matched by two enabled `DynaKube`s of the same kind is never
//! written.

mod error;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use dynakube_base::consts::{CONTROLLER_NAME, labels, names};
use k8s_openapi::{
    api::core::v1::{ConfigMap, Namespace},
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt};

pub use self::error::Error;
use crate::{cluster::ClusterApi, consts::MAX_CONFLICT_RETRIES, crd::DynaKube, selector};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MapKind {
    CodeModules,
    MetadataEnrichment,
}

impl MapKind {
    pub const ALL: [Self; 2] = [Self::CodeModules, Self::MetadataEnrichment];

    #[must_use]
    pub const fn config_map_name(self) -> &'static str {
        match self {
            Self::CodeModules => names::CODE_MODULES_MAP,
            Self::MetadataEnrichment => names::METADATA_ENRICHMENT_MAP,
        }
    }

    #[must_use]
    pub const fn is_enabled(self, dynakube: &DynaKube) -> bool {
        match self {
            Self::CodeModules => dynakube.code_modules_enabled(),
            Self::MetadataEnrichment => dynakube.metadata_enrichment_enabled(),
        }
    }

    /// The effective selector. A disabled sub-spec selects nothing.
    #[must_use]
    pub fn selector(self, dynakube: &DynaKube) -> Option<&LabelSelector> {
        if !self.is_enabled(dynakube) {
            return None;
        }
        match self {
            Self::CodeModules => dynakube.spec.code_modules.namespace_selector.as_ref(),
            Self::MetadataEnrichment => {
                dynakube.spec.metadata_enrichment.namespace_selector.as_ref()
            }
        }
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CodeModules => "code modules",
            Self::MetadataEnrichment => "metadata enrichment",
        })
    }
}

/// Namespaces of one map that point to a `DynaKube` after an update, and
/// those that stopped pointing to it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MapChanges {
    pub mapped: BTreeSet<String>,
    pub unmapped: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DynaKubeMapping {
    pub code_modules: MapChanges,
    pub metadata_enrichment: MapChanges,
}

impl DynaKubeMapping {
    fn changes_mut(&mut self, kind: MapKind) -> &mut MapChanges {
        match kind {
            MapKind::CodeModules => &mut self.code_modules,
            MapKind::MetadataEnrichment => &mut self.metadata_enrichment,
        }
    }

    /// Namespaces mapped to the `DynaKube` in at least one map.
    #[must_use]
    pub fn mapped(&self) -> BTreeSet<String> {
        self.code_modules.mapped.union(&self.metadata_enrichment.mapped).cloned().collect()
    }

    /// Namespaces no longer mapped to the `DynaKube` in any map.
    #[must_use]
    pub fn unmapped(&self) -> BTreeSet<String> {
        let mapped = self.mapped();
        self.code_modules
            .unmapped
            .union(&self.metadata_enrichment.unmapped)
            .filter(|namespace| !mapped.contains(*namespace))
            .cloned()
            .collect()
    }
}

/// The `DynaKube`s a namespace is mapped to.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NamespaceMapping {
    pub code_modules: Option<String>,
    pub metadata_enrichment: Option<String>,
}

impl NamespaceMapping {
    #[must_use]
    pub fn get(&self, kind: MapKind) -> Option<&str> {
        match kind {
            MapKind::CodeModules => self.code_modules.as_deref(),
            MapKind::MetadataEnrichment => self.metadata_enrichment.as_deref(),
        }
    }

    fn set(&mut self, kind: MapKind, dynakube: Option<String>) {
        match kind {
            MapKind::CodeModules => self.code_modules = dynakube,
            MapKind::MetadataEnrichment => self.metadata_enrichment = dynakube,
        }
    }

    /// The `DynaKube` the namespace belongs to, code modules first.
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.code_modules.as_deref().or(self.metadata_enrichment.as_deref())
    }
}

pub struct NamespaceMapper<'a, C> {
    cluster: &'a C,
}

impl<'a, C> NamespaceMapper<'a, C>
where
    C: ClusterApi,
{
    pub const fn new(cluster: &'a C) -> Self { Self { cluster } }

    /// Rescans all namespaces and points every namespace matched by
    /// `dynakube` to it in both maps, dropping entries that no longer match.
    ///
    /// # Errors
    ///
    /// Fails when a matched namespace is also matched by another enabled
    /// `DynaKube` (that map is left unchanged) or when the cluster rejects
    /// a read or write.
    pub async fn map_from_dynakube(&self, dynakube: &DynaKube) -> Result<DynaKubeMapping, Error> {
        let namespaces = self.cluster.list_namespaces().await.context(error::ListNamespacesSnafu)?;
        let dynakubes = self.cluster.list_dynakubes().await.context(error::ListDynaKubesSnafu)?;

        let mut mapping = DynaKubeMapping::default();
        let mut errors = Vec::new();
        for kind in MapKind::ALL {
            match self.map_kind_from_dynakube(kind, dynakube, &namespaces, &dynakubes).await {
                Ok(changes) => *mapping.changes_mut(kind) = changes,
                Err(err) => errors.push(err),
            }
        }
        Error::combine(errors).map_or(Ok(mapping), Err)
    }

    async fn map_kind_from_dynakube(
        &self,
        kind: MapKind,
        dynakube: &DynaKube,
        namespaces: &[Namespace],
        dynakubes: &[DynaKube],
    ) -> Result<MapChanges, Error> {
        let name = dynakube.name_any();
        let others: Vec<&DynaKube> =
            dynakubes.iter().filter(|other| other.name_any() != name).collect();

        let mut matching = BTreeSet::new();
        for namespace in namespaces {
            let ns_labels = namespace.labels();
            let selected = selector::matches(kind.selector(dynakube), ns_labels)
                .with_context(|_| error::EvaluateSelectorSnafu { kind, dynakube: name.clone() })?;
            if !selected {
                continue;
            }

            let claimants: Vec<String> = others
                .iter()
                .filter(|other| selects(kind, other, ns_labels))
                .map(|other| other.name_any())
                .collect();
            if !claimants.is_empty() {
                let mut dynakubes = vec![name];
                dynakubes.extend(claimants);
                return error::AmbiguousNamespaceSnafu {
                    kind,
                    namespace: namespace.name_any(),
                    dynakubes,
                }
                .fail();
            }
            let _unused = matching.insert(namespace.name_any());
        }

        let changes = self
            .update_map(kind, |data| {
                let mut changes = MapChanges::default();
                data.retain(|namespace, owner| {
                    let stale = *owner == name && !matching.contains(namespace);
                    if stale {
                        let _unused = changes.unmapped.insert(namespace.clone());
                    }
                    !stale
                });
                for namespace in &matching {
                    let _unused = data.insert(namespace.clone(), name.clone());
                    let _unused = changes.mapped.insert(namespace.clone());
                }
                Ok(changes)
            })
            .await?;

        tracing::debug!(
            dynakube = %name,
            %kind,
            mapped = changes.mapped.len(),
            unmapped = changes.unmapped.len(),
            "Updated namespace map"
        );
        Ok(changes)
    }

    /// Recomputes the entries of one namespace against all enabled
    /// `DynaKube`s.
    ///
    /// # Errors
    ///
    /// Fails when more than one `DynaKube` matches the namespace for a kind;
    /// the entry of that kind is left unchanged while the other kind is
    /// still processed.
    pub async fn map_from_namespace(
        &self,
        namespace: &Namespace,
    ) -> Result<NamespaceMapping, Error> {
        let dynakubes = self.cluster.list_dynakubes().await.context(error::ListDynaKubesSnafu)?;
        let namespace_name = namespace.name_any();
        let ns_labels = namespace.labels();

        let mut mapping = NamespaceMapping::default();
        let mut errors = Vec::new();
        for kind in MapKind::ALL {
            let matched: Vec<String> = dynakubes
                .iter()
                .filter(|dynakube| selects(kind, dynakube, ns_labels))
                .map(ResourceExt::name_any)
                .collect();

            let target = match matched.as_slice() {
                [] => None,
                [dynakube] => Some(dynakube.clone()),
                _ => {
                    errors.push(Error::AmbiguousNamespace {
                        kind,
                        namespace: namespace_name.clone(),
                        dynakubes: matched,
                    });
                    continue;
                }
            };

            let result = self
                .update_map(kind, |data| {
                    let _unused = match &target {
                        Some(dynakube) => data.insert(namespace_name.clone(), dynakube.clone()),
                        None => data.remove(&namespace_name),
                    };
                    Ok(())
                })
                .await;
            match result {
                Ok(()) => mapping.set(kind, target),
                Err(err) => errors.push(err),
            }
        }
        Error::combine(errors).map_or(Ok(mapping), Err)
    }

    /// Removes every entry pointing to `dynakube` from both maps.
    ///
    /// # Errors
    ///
    /// Fails when the cluster rejects a read or write.
    pub async fn unmap_dynakube(&self, dynakube: &str) -> Result<DynaKubeMapping, Error> {
        let mut mapping = DynaKubeMapping::default();
        let mut errors = Vec::new();
        for kind in MapKind::ALL {
            let result = self
                .update_map(kind, |data| {
                    let mut unmapped = BTreeSet::new();
                    data.retain(|namespace, owner| {
                        let stale = owner.as_str() == dynakube;
                        if stale {
                            let _unused = unmapped.insert(namespace.clone());
                        }
                        !stale
                    });
                    Ok(unmapped)
                })
                .await;
            match result {
                Ok(unmapped) => mapping.changes_mut(kind).unmapped = unmapped,
                Err(err) => errors.push(err),
            }
        }
        Error::combine(errors).map_or(Ok(mapping), Err)
    }

    /// Removes a namespace from both maps.
    ///
    /// # Errors
    ///
    /// Fails when the cluster rejects a read or write.
    pub async fn unmap_namespace(&self, namespace: &str) -> Result<NamespaceMapping, Error> {
        let mut previous = NamespaceMapping::default();
        let mut errors = Vec::new();
        for kind in MapKind::ALL {
            match self.update_map(kind, |data| Ok(data.remove(namespace))).await {
                Ok(dynakube) => previous.set(kind, dynakube),
                Err(err) => errors.push(err),
            }
        }
        Error::combine(errors).map_or(Ok(previous), Err)
    }

    /// Reads the entries of a namespace without writing anything.
    ///
    /// # Errors
    ///
    /// Fails when a map cannot be read.
    pub async fn lookup(&self, namespace: &str) -> Result<NamespaceMapping, Error> {
        let mut mapping = NamespaceMapping::default();
        for kind in MapKind::ALL {
            let name = kind.config_map_name();
            let dynakube = self
                .cluster
                .get_config_map(self.cluster.operator_namespace(), name)
                .await
                .context(error::ReadConfigMapSnafu { name })?
                .and_then(|config_map| config_map.data)
                .and_then(|mut data| data.remove(namespace));
            mapping.set(kind, dynakube);
        }
        Ok(mapping)
    }

    /// Applies `update` to the data of a map and writes it back,
    /// conditional on the version that was read.
    ///
    /// `update` runs again on a fresh copy after every conflict. Nothing is
    /// written when it leaves the data unchanged.
    async fn update_map<T, F>(&self, kind: MapKind, mut update: F) -> Result<T, Error>
    where
        F: FnMut(&mut BTreeMap<String, String>) -> Result<T, Error> + Send,
        T: Send,
    {
        let name = kind.config_map_name();
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let mut config_map = self.get_or_create_map(name).await?;
            let mut data = config_map.data.take().unwrap_or_default();
            let original = data.clone();
            let output = update(&mut data)?;
            if data == original {
                return Ok(output);
            }

            config_map.data = Some(data);
            match self.cluster.replace_config_map(&config_map).await {
                Ok(()) => return Ok(output),
                Err(err) if err.is_conflict() => {
                    tracing::debug!(config_map = name, attempt, "Retrying conflicting write");
                }
                Err(source) => return Err(Error::WriteConfigMap { name, source }),
            }
        }
        error::ConflictRetriesExhaustedSnafu { name, attempts: MAX_CONFLICT_RETRIES }.fail()
    }

    async fn get_or_create_map(&self, name: &'static str) -> Result<ConfigMap, Error> {
        let namespace = self.cluster.operator_namespace();
        if let Some(config_map) = self
            .cluster
            .get_config_map(namespace, name)
            .await
            .context(error::ReadConfigMapSnafu { name })?
        {
            return Ok(config_map);
        }

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    labels::MANAGED_BY.to_string(),
                    CONTROLLER_NAME.to_string(),
                )])),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::new()),
            ..ConfigMap::default()
        };
        match self.cluster.create_config_map(&config_map).await {
            Ok(()) => tracing::info!(config_map = name, "Created namespace map"),
            Err(err) if err.is_already_exists() => {}
            Err(source) => return Err(Error::WriteConfigMap { name, source }),
        }

        self.cluster
            .get_config_map(namespace, name)
            .await
            .context(error::ReadConfigMapSnafu { name })?
            .context(error::ConfigMapVanishedSnafu { name })
    }
}

fn selects(kind: MapKind, dynakube: &DynaKube, labels: &BTreeMap<String, String>) -> bool {
    selector::matches(kind.selector(dynakube), labels).unwrap_or_else(|err| {
        tracing::warn!(
            dynakube = %dynakube.name_any(),
            %kind,
            "Ignoring namespace selector: {err}"
        );
        false
    })
}

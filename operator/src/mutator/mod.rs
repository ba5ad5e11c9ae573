//! Pod mutators.
//!
//! Each [`Mutator`] either injects a pod for the first time
//! ([`Mutator::mutate`]) or catches up with containers added after an
//! earlier pass ([`Mutator::reinvoke`]). Mutators only add to the pod; on
//! error the caller discards the mutated copy.

mod code_modules;
mod error;
mod image;
mod init_container;
mod metadata;
mod owner;

use std::fmt;

use dynakube_base::consts::annotations;
use k8s_openapi::api::core::v1::{Container, EnvVar, Namespace, Pod};
use kube::ResourceExt;

pub use self::{
    error::Error,
    image::ImageReference,
    init_container::{ContainerAttributes, InstallContainer, PodAttributes, failure_policy},
    owner::{Workload, resolve_workload},
};
use crate::{
    cluster::ClusterApi,
    consts::injection::INIT_CONTAINER_NAME,
    crd::{DynaKube, is_container_excluded},
    mapper::{MapKind, NamespaceMapping},
};

/// Why a pod was not injected, recorded in the reason annotation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reason {
    NoBootstrapperConfig,
    NoCodeModulesImage,
    NoMutationNeeded,
    OwnerLookupFailed,
}

impl Reason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoBootstrapperConfig => "NoBootstrapperConfig",
            Self::NoCodeModulesImage => "NoCodeModulesImage",
            Self::NoMutationNeeded => "NoMutationNeeded",
            Self::OwnerLookupFailed => "OwnerLookupFailed",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// State of one admission request, handed from mutator to mutator.
pub struct MutationRequest<'a> {
    pub pod: Pod,
    pub namespace: &'a Namespace,
    pub dynakube: &'a DynaKube,
    pub mapping: &'a NamespaceMapping,

    /// The init container, once the code modules mutator created or found
    /// it.
    pub install: Option<InstallContainer>,
}

impl<'a> MutationRequest<'a> {
    #[must_use]
    pub const fn new(
        pod: Pod,
        namespace: &'a Namespace,
        dynakube: &'a DynaKube,
        mapping: &'a NamespaceMapping,
    ) -> Self {
        Self { pod, namespace, dynakube, mapping, install: None }
    }

    #[must_use]
    pub fn namespace_name(&self) -> String { self.namespace.name_any() }

    /// Whether the namespace is mapped to the request's `DynaKube` for
    /// `kind`.
    #[must_use]
    pub fn is_mapped(&self, kind: MapKind) -> bool {
        self.mapping.get(kind) == Some(self.dynakube.name_any().as_str())
    }

    /// Puts the init container back onto the pod: in place if the pod
    /// already had one, first otherwise.
    ///
    /// # Errors
    ///
    /// Fails when the init container arguments cannot be serialized.
    pub fn finish(mut self) -> Result<Pod, Error> {
        let Some(install) = self.install.take() else {
            return Ok(self.pod);
        };
        let container = install.finish()?;
        let spec = self.pod.spec.get_or_insert_with(Default::default);
        let init_containers = spec.init_containers.get_or_insert_with(Vec::new);
        match init_containers.iter_mut().find(|existing| existing.name == INIT_CONTAINER_NAME) {
            Some(existing) => *existing = container,
            None => init_containers.insert(0, container),
        }
        Ok(self.pod)
    }
}

/// The mutators, in the order they run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mutator {
    CodeModules,
    MetadataEnrichment,
}

impl Mutator {
    pub const ALL: [Self; 2] = [Self::CodeModules, Self::MetadataEnrichment];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CodeModules => "code-modules",
            Self::MetadataEnrichment => "metadata-enrichment",
        }
    }

    #[must_use]
    pub fn is_enabled(self, request: &MutationRequest<'_>) -> bool {
        match self {
            Self::CodeModules => code_modules::is_enabled(request),
            Self::MetadataEnrichment => metadata::is_enabled(request),
        }
    }

    #[must_use]
    pub fn is_injected(self, request: &MutationRequest<'_>) -> bool {
        match self {
            Self::CodeModules => code_modules::is_injected(&request.pod),
            Self::MetadataEnrichment => metadata::is_injected(&request.pod),
        }
    }

    /// Injects a pod seen for the first time.
    ///
    /// # Errors
    ///
    /// Fails when the `DynaKube` configuration or the cluster does not allow
    /// injecting the pod.
    pub async fn mutate<C>(
        self,
        cluster: &C,
        request: &mut MutationRequest<'_>,
    ) -> Result<(), Error>
    where
        C: ClusterApi,
    {
        match self {
            Self::CodeModules => code_modules::mutate(cluster, request).await,
            Self::MetadataEnrichment => metadata::mutate(cluster, request).await,
        }
    }

    /// Updates containers added since the pod was injected. Returns whether
    /// the pod changed.
    ///
    /// # Errors
    ///
    /// See [`Self::mutate`].
    pub async fn reinvoke<C>(
        self,
        cluster: &C,
        request: &mut MutationRequest<'_>,
    ) -> Result<bool, Error>
    where
        C: ClusterApi,
    {
        match self {
            Self::CodeModules => code_modules::reinvoke(cluster, request).await,
            Self::MetadataEnrichment => metadata::reinvoke(cluster, request).await,
        }
    }
}

impl fmt::Display for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Whether the pod carries the init container.
#[must_use]
pub fn has_init_container(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.init_containers.as_ref())
        .is_some_and(|containers| containers.iter().any(|c| c.name == INIT_CONTAINER_NAME))
}

/// Whether an earlier pass injected the pod.
#[must_use]
pub fn is_pod_injected(pod: &Pod) -> bool {
    has_init_container(pod) || annotation_is_true(pod, annotations::INJECTED)
}

/// Application containers not excluded by the pod or the `DynaKube`.
#[must_use]
pub fn is_container_eligible(pod: &Pod, dynakube: &DynaKube, container: &Container) -> bool {
    !is_container_excluded(pod.annotations(), &container.name)
        && !dynakube.excludes_container(&container.name)
}

#[must_use]
pub fn has_eligible_container(pod: &Pod, dynakube: &DynaKube) -> bool {
    pod.spec
        .as_ref()
        .is_some_and(|spec| spec.containers.iter().any(|c| is_container_eligible(pod, dynakube, c)))
}

/// Names of eligible containers matching `filter`.
fn eligible_container_names(
    pod: &Pod,
    dynakube: &DynaKube,
    filter: impl Fn(&Container) -> bool,
) -> Vec<String> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .filter(|container| is_container_eligible(pod, dynakube, container) && filter(container))
        .map(|container| container.name.clone())
        .collect()
}

fn container_mut<'p>(pod: &'p mut Pod, name: &str) -> Option<&'p mut Container> {
    pod.spec.as_mut()?.containers.iter_mut().find(|container| container.name == name)
}

fn annotation_is_true(pod: &Pod, key: &str) -> bool {
    pod.annotations().get(key).is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

fn set_annotation(pod: &mut Pod, key: &str, value: impl Into<String>) {
    let _unused = pod.annotations_mut().insert(key.to_string(), value.into());
}

fn has_env(container: &Container, name: &str) -> bool {
    container.env.iter().flatten().any(|var| var.name == name)
}

/// Adds `var` unless the container already sets a variable of that name.
fn add_env(container: &mut Container, var: EnvVar) {
    if !has_env(container, &var.name) {
        container.env.get_or_insert_with(Vec::new).push(var);
    }
}

fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.into()), ..EnvVar::default() }
}

//! Access to the Kubernetes API used by the mapper, the bootstrapper, the
//! webhook and the controllers.
//!
//! Everything goes through [`ClusterApi`], implemented by [`KubeCluster`] on
//! top of `kube::Client`, and by an in-memory cluster in tests.

mod client;
mod error;
#[cfg(test)]
pub mod fake;

use std::future::Future;

use k8s_openapi::{
    api::core::v1::{ConfigMap, Namespace, ObjectReference, Secret},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};

pub use self::{client::KubeCluster, error::Error};
use crate::{crd::{Condition, DynaKube}, events::InjectionEvent};

pub trait ClusterApi: Send + Sync {
    /// Namespace the operator, its `DynaKube`s and its state live in.
    fn operator_namespace(&self) -> &str;

    fn get_namespace(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Namespace>, Error>> + Send;

    fn list_namespaces(&self) -> impl Future<Output = Result<Vec<Namespace>, Error>> + Send;

    /// Sets the instance label of a namespace, or removes it on `None`.
    fn set_namespace_instance_label(
        &self,
        name: &str,
        instance: Option<&str>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn get_dynakube(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<DynaKube>, Error>> + Send;

    fn list_dynakubes(&self) -> impl Future<Output = Result<Vec<DynaKube>, Error>> + Send;

    /// Adds `finalizer` to the `DynaKube` unless present.
    fn add_dynakube_finalizer(
        &self,
        name: &str,
        finalizer: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Removes `finalizer` from the `DynaKube`. A missing `DynaKube` is not an
    /// error.
    fn remove_dynakube_finalizer(
        &self,
        name: &str,
        finalizer: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn update_dynakube_conditions(
        &self,
        name: &str,
        conditions: &[Condition],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Secret>, Error>> + Send;

    /// Creates the secret in the namespace named by its metadata.
    ///
    /// Fails with [`Error::AlreadyExists`] if it exists.
    fn create_secret(&self, secret: &Secret) -> impl Future<Output = Result<(), Error>> + Send;

    /// Replaces the secret, conditional on its `resourceVersion`.
    ///
    /// Fails with [`Error::Conflict`] if the version is stale.
    fn replace_secret(&self, secret: &Secret) -> impl Future<Output = Result<(), Error>> + Send;

    /// Deletes the secret. Returns `false` if it did not exist.
    fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<ConfigMap>, Error>> + Send;

    fn create_config_map(
        &self,
        config_map: &ConfigMap,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn replace_config_map(
        &self,
        config_map: &ConfigMap,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Fetches the metadata of the object an owner reference points to.
    fn get_owner_metadata(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> impl Future<Output = Result<Option<ObjectMeta>, Error>> + Send;

    fn custom_resource_definition_exists(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Publishes an event. Failures are logged and otherwise ignored.
    fn publish_event(
        &self,
        regarding: &ObjectReference,
        event: &InjectionEvent,
    ) -> impl Future<Output = ()> + Send;
}

pub(crate) fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() { name.to_string() } else { format!("{namespace}/{name}") }
}

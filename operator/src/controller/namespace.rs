use std::{future::Future, sync::Arc};

use dynakube_base::consts::labels;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    Api, Resource, ResourceExt,
    runtime::{Controller, controller::Action, watcher::Config as WatcherConfig},
};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use super::{
    Context, Error, Requeue, error, log_reconcile_result, run_until_shutdown, sync_instance_label,
    write_bootstrap,
};
use crate::{
    bootstrap::Bootstrapper,
    cluster::{ClusterApi, KubeCluster},
    config::ControllerConfig,
    mapper::{NamespaceMapper, NamespaceMapping},
};

/// Reconciles one namespace: its entries in the namespace maps, its instance
/// label and its init secret.
pub struct NamespaceReconciler<'a, C> {
    cluster: &'a C,
}

impl<'a, C> NamespaceReconciler<'a, C>
where
    C: ClusterApi,
{
    pub const fn new(cluster: &'a C) -> Self { Self { cluster } }

    /// # Errors
    ///
    /// Fails when a step could not be completed; independent steps still run.
    pub async fn reconcile(&self, namespace: &Namespace) -> Result<Requeue, Error> {
        let name = namespace.name_any();
        let mapper = NamespaceMapper::new(self.cluster);

        if self.is_gone(namespace).await? {
            let previous = mapper
                .unmap_namespace(&name)
                .await
                .context(error::MapNamespaceSnafu { namespace: name.clone() })?;
            if previous != NamespaceMapping::default() {
                tracing::info!(namespace = %name, "Removed deleted namespace from namespace maps");
            }
            return Ok(Requeue::AwaitChange);
        }

        let mut errors = Vec::new();
        let mapping = match mapper.map_from_namespace(namespace).await {
            Ok(mapping) => mapping,
            Err(source) => {
                errors.push(Error::MapNamespace { namespace: name.clone(), source });
                mapper
                    .lookup(&name)
                    .await
                    .context(error::LookupMappingSnafu { namespace: name.clone() })?
            }
        };

        if let Err(err) = sync_instance_label(self.cluster, &name, mapping.instance()).await {
            errors.push(err);
        }

        let was_labeled = namespace.labels().contains_key(labels::INSTANCE);
        let result = match mapping.code_modules.as_deref() {
            Some(dynakube) => self.ensure_init_secret(dynakube, &name).await,
            None if was_labeled => Bootstrapper::new(self.cluster)
                .delete_init_secret(&name)
                .await
                .map(|_deleted| ())
                .context(error::DeleteInitSecretSnafu { namespace: name.clone() }),
            None => Ok(()),
        };
        if let Err(err) = result {
            errors.push(err);
        }

        Error::combine(errors)?;
        Ok(Requeue::Resync)
    }

    async fn is_gone(&self, namespace: &Namespace) -> Result<bool, Error> {
        if namespace.meta().deletion_timestamp.is_some() {
            return Ok(true);
        }
        let name = namespace.name_any();
        self.cluster
            .get_namespace(&name)
            .await
            .map(|current| current.is_none())
            .context(error::GetNamespaceSnafu { namespace: name })
    }

    async fn ensure_init_secret(&self, dynakube_name: &str, namespace: &str) -> Result<(), Error> {
        let Some(dynakube) = self
            .cluster
            .get_dynakube(dynakube_name)
            .await
            .with_context(|_| error::GetDynaKubeSnafu { dynakube: dynakube_name.to_string() })?
        else {
            tracing::debug!(namespace, dynakube = dynakube_name, "Mapped DynaKube is gone");
            return Ok(());
        };

        let bootstrapper = Bootstrapper::new(self.cluster);
        match bootstrapper.prepare_init_secret(&dynakube).await {
            Ok(data) => write_bootstrap(&bootstrapper, &dynakube, namespace, &data).await,
            Err(err) if err.is_source_missing() => {
                tracing::warn!(
                    namespace,
                    dynakube = dynakube_name,
                    "Not writing init secret, error: {err}"
                );
                Ok(())
            }
            Err(source) => {
                Err(Error::PrepareInitSecret { dynakube: dynakube_name.to_string(), source })
            }
        }
    }
}

async fn reconcile<C>(namespace: Arc<Namespace>, context: Arc<Context<C>>) -> Result<Action, Error>
where
    C: ClusterApi,
{
    let requeue = NamespaceReconciler::new(&context.cluster).reconcile(&namespace).await?;
    Ok(context.on_success(&namespace.name_any(), requeue))
}

fn error_policy<C>(namespace: Arc<Namespace>, err: &Error, context: Arc<Context<C>>) -> Action {
    context.on_error(&namespace.name_any(), err)
}

/// Watches all namespaces until `shutdown_signal` resolves.
pub async fn run_namespace_controller(
    cluster: KubeCluster,
    config: ControllerConfig,
    shutdown_signal: impl Future<Output = ()> + Send + Unpin + 'static,
) {
    let namespaces = Api::<Namespace>::all(cluster.client());
    let watcher_config = WatcherConfig::default().timeout(config.watcher_timeout_secs);
    let token = CancellationToken::new();
    let shutdown = token.clone();
    let context = Arc::new(Context::new(cluster, &config));

    tracing::info!("Starting Namespace controller");
    let controller = Controller::new(namespaces, watcher_config)
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, context)
        .for_each(log_reconcile_result("Namespace"));
    run_until_shutdown(controller, token, shutdown_signal).await;
    tracing::info!("Namespace controller stopped");
}

#[cfg(test)]
mod tests {
    use dynakube_base::consts::names;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::{
        cluster::fake::{FakeCluster, OPERATOR_NAMESPACE},
        testing,
    };

    fn inject_label() -> [(&'static str, &'static str); 1] { [("inject", "true")] }

    fn cluster() -> FakeCluster {
        let cluster = FakeCluster::new();
        cluster.add_secret(OPERATOR_NAMESPACE, "dk1", &[("apiToken", "84")]);
        cluster.add_dynakube(testing::code_modules_dynakube("dk1", &inject_label(), None));
        cluster.add_dynakube(testing::metadata_enrichment_dynakube("dk2", &[("team", "a")]));
        cluster
    }

    async fn reconcile(cluster: &FakeCluster, name: &str) -> Result<Requeue, Error> {
        let namespace = cluster.namespace(name).unwrap();
        NamespaceReconciler::new(cluster).reconcile(&namespace).await
    }

    #[tokio::test]
    async fn test_new_namespace_is_mapped_and_bootstrapped() {
        let cluster = cluster();
        cluster.add_namespace("app", &[("inject", "true"), ("team", "a")]);

        assert_eq!(reconcile(&cluster, "app").await.unwrap(), Requeue::Resync);
        assert_eq!(
            cluster.config_map_data(names::CODE_MODULES_MAP),
            testing::string_map(&[("app", "dk1")])
        );
        assert_eq!(
            cluster.config_map_data(names::METADATA_ENRICHMENT_MAP),
            testing::string_map(&[("app", "dk2")])
        );
        assert_eq!(cluster.namespace_label("app", labels::INSTANCE).as_deref(), Some("dk1"));
        assert!(cluster.secret_string("app", names::INIT_SECRET, "init.sh").is_some());
    }

    #[tokio::test]
    async fn test_metadata_only_namespace_has_no_init_secret() {
        let cluster = cluster();
        cluster.add_namespace("app", &[("team", "a")]);

        let _requeue = reconcile(&cluster, "app").await.unwrap();
        assert_eq!(cluster.namespace_label("app", labels::INSTANCE).as_deref(), Some("dk2"));
        assert!(cluster.secret("app", names::INIT_SECRET).is_none());
    }

    #[tokio::test]
    async fn test_unlabeled_namespace_is_unmapped() {
        let cluster = cluster();
        cluster.add_namespace("app", &inject_label());
        let _requeue = reconcile(&cluster, "app").await.unwrap();

        cluster.add_namespace("app", &[(labels::INSTANCE, "dk1")]);
        let _requeue = reconcile(&cluster, "app").await.unwrap();
        assert!(cluster.config_map_data(names::CODE_MODULES_MAP).is_empty());
        assert_eq!(cluster.namespace_label("app", labels::INSTANCE), None);
        assert!(cluster.secret("app", names::INIT_SECRET).is_none());
    }

    #[tokio::test]
    async fn test_deleted_namespace_is_unmapped() {
        let cluster = cluster();
        cluster.add_namespace("app", &inject_label());
        let _requeue = reconcile(&cluster, "app").await.unwrap();

        let mut namespace = cluster.namespace("app").unwrap();
        namespace.metadata.deletion_timestamp = Some(
            serde_json::from_value::<Time>(serde_json::json!("2024-01-01T00:00:00Z")).unwrap(),
        );
        let requeue = NamespaceReconciler::new(&cluster).reconcile(&namespace).await.unwrap();
        assert_eq!(requeue, Requeue::AwaitChange);
        assert!(cluster.config_map_data(names::CODE_MODULES_MAP).is_empty());

        cluster.add_namespace("gone", &inject_label());
        let namespace = cluster.namespace("gone").unwrap();
        let _requeue = NamespaceReconciler::new(&cluster).reconcile(&namespace).await.unwrap();
        cluster.remove_namespace("gone");
        let requeue = NamespaceReconciler::new(&cluster).reconcile(&namespace).await.unwrap();
        assert_eq!(requeue, Requeue::AwaitChange);
        assert!(cluster.config_map_data(names::CODE_MODULES_MAP).is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_namespace_keeps_other_kind() {
        let cluster = cluster();
        cluster.add_dynakube(testing::code_modules_dynakube("dk3", &inject_label(), None));
        cluster.add_namespace("app", &[("inject", "true"), ("team", "a")]);

        let err = reconcile(&cluster, "app").await.unwrap_err();
        assert!(err.to_string().contains("more than one DynaKube"));
        assert!(cluster.config_map_data(names::CODE_MODULES_MAP).is_empty());
        assert_eq!(
            cluster.config_map_data(names::METADATA_ENRICHMENT_MAP),
            testing::string_map(&[("app", "dk2")])
        );
        assert_eq!(cluster.namespace_label("app", labels::INSTANCE).as_deref(), Some("dk2"));
    }

    #[tokio::test]
    async fn test_missing_tokens_do_not_fail_reconcile() {
        let cluster = FakeCluster::new();
        cluster.add_dynakube(testing::code_modules_dynakube("dk1", &inject_label(), None));
        cluster.add_namespace("app", &inject_label());

        assert_eq!(reconcile(&cluster, "app").await.unwrap(), Requeue::Resync);
        assert!(cluster.secret("app", names::INIT_SECRET).is_none());
        assert_eq!(cluster.namespace_label("app", labels::INSTANCE).as_deref(), Some("dk1"));
    }
}

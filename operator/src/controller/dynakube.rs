use std::{collections::BTreeSet, future::Future, sync::Arc};

use dynakube_base::consts::crd::FINALIZER;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Resource, ResourceExt,
    runtime::{
        Controller, controller::Action, reflector::ObjectRef, watcher::Config as WatcherConfig,
    },
};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use super::{
    Context, Error, Requeue, error, log_reconcile_result, run_until_shutdown, sync_instance_label,
    tokens, write_bootstrap,
};
use crate::{
    bootstrap::Bootstrapper,
    cluster::{ClusterApi, KubeCluster},
    config::ControllerConfig,
    crd::DynaKube,
    mapper::{MapChanges, NamespaceMapper},
};

/// Reconciles one `DynaKube`: token conditions, namespace maps, init secrets
/// and instance labels, plus their removal once the `DynaKube` is deleted.
pub struct DynaKubeReconciler<'a, C> {
    cluster: &'a C,
}

impl<'a, C> DynaKubeReconciler<'a, C>
where
    C: ClusterApi,
{
    pub const fn new(cluster: &'a C) -> Self { Self { cluster } }

    /// # Errors
    ///
    /// Fails when a step could not be completed; independent steps still run.
    pub async fn reconcile(&self, dynakube: &DynaKube) -> Result<Requeue, Error> {
        let name = dynakube.name_any();
        if dynakube.meta().deletion_timestamp.is_some() {
            self.cleanup(dynakube).await?;
            return Ok(Requeue::AwaitChange);
        }

        if !has_finalizer(dynakube) {
            self.cluster
                .add_dynakube_finalizer(&name, FINALIZER)
                .await
                .context(error::UpdateFinalizerSnafu { dynakube: name.clone() })?;
        }

        let mut errors = Vec::new();
        if let Err(err) = self.update_token_conditions(dynakube).await {
            errors.push(err);
        }

        match NamespaceMapper::new(self.cluster).map_from_dynakube(dynakube).await {
            Ok(mapping) => {
                tracing::debug!(
                    dynakube = %name,
                    mapped = mapping.mapped().len(),
                    unmapped = mapping.unmapped().len(),
                    "Mapped namespaces"
                );
                if let Err(err) = self.sync_init_secrets(dynakube, &mapping.code_modules).await {
                    errors.push(err);
                }
                let touched = mapping.mapped().into_iter().chain(mapping.unmapped()).collect();
                if let Err(err) = self.sync_instance_labels(&touched).await {
                    errors.push(err);
                }
            }
            Err(source) => errors.push(Error::MapDynaKube { dynakube: name, source }),
        }

        Error::combine(errors)?;
        Ok(Requeue::Resync)
    }

    async fn cleanup(&self, dynakube: &DynaKube) -> Result<(), Error> {
        if !has_finalizer(dynakube) {
            return Ok(());
        }
        let name = dynakube.name_any();
        tracing::info!(dynakube = %name, "Cleaning up after deleted DynaKube");

        let mapping = NamespaceMapper::new(self.cluster)
            .unmap_dynakube(&name)
            .await
            .context(error::MapDynaKubeSnafu { dynakube: name.clone() })?;

        let bootstrapper = Bootstrapper::new(self.cluster);
        for namespace in &mapping.code_modules.unmapped {
            let _deleted = bootstrapper
                .delete_init_secret(namespace)
                .await
                .with_context(|_| error::DeleteInitSecretSnafu { namespace: namespace.clone() })?;
        }
        self.sync_instance_labels(&mapping.unmapped()).await?;

        self.cluster
            .remove_dynakube_finalizer(&name, FINALIZER)
            .await
            .context(error::UpdateFinalizerSnafu { dynakube: name })
    }

    async fn update_token_conditions(&self, dynakube: &DynaKube) -> Result<(), Error> {
        let name = dynakube.name_any();
        let secret_name = dynakube.tokens_secret_name();
        let secret = self
            .cluster
            .get_secret(self.cluster.operator_namespace(), &secret_name)
            .await
            .with_context(|_| error::GetTokensSnafu { secret: secret_name.clone() })?;

        let current = dynakube.conditions();
        let desired = tokens::token_conditions(&secret_name, secret.as_ref(), current);
        let Some(conditions) = tokens::merge_token_conditions(current, desired, &tokens::now())
        else {
            return Ok(());
        };
        self.cluster
            .update_dynakube_conditions(&name, &conditions)
            .await
            .context(error::UpdateConditionsSnafu { dynakube: name.clone() })?;
        tracing::info!(dynakube = %name, "Updated token conditions");
        Ok(())
    }

    /// Writes the init secret into every namespace mapped for code modules
    /// and removes it from those that lost the mapping.
    async fn sync_init_secrets(
        &self,
        dynakube: &DynaKube,
        changes: &MapChanges,
    ) -> Result<(), Error> {
        let bootstrapper = Bootstrapper::new(self.cluster);
        let mut errors = Vec::new();
        for namespace in &changes.unmapped {
            if let Err(source) = bootstrapper.delete_init_secret(namespace).await {
                errors.push(Error::DeleteInitSecret { namespace: namespace.clone(), source });
            }
        }

        if !changes.mapped.is_empty() {
            match bootstrapper.prepare_init_secret(dynakube).await {
                Ok(data) => {
                    for namespace in &changes.mapped {
                        if let Err(err) =
                            write_bootstrap(&bootstrapper, dynakube, namespace, &data).await
                        {
                            errors.push(err);
                        }
                    }
                }
                Err(err) if err.is_source_missing() => {
                    tracing::warn!(
                        dynakube = %dynakube.name_any(),
                        "Not replicating init secrets, error: {err}"
                    );
                }
                Err(source) => errors.push(Error::PrepareInitSecret {
                    dynakube: dynakube.name_any(),
                    source,
                }),
            }
        }
        Error::combine(errors)
    }

    /// Re-derives the instance label of each namespace from the maps.
    async fn sync_instance_labels(&self, namespaces: &BTreeSet<String>) -> Result<(), Error> {
        let mapper = NamespaceMapper::new(self.cluster);
        let mut errors = Vec::new();
        for namespace in namespaces {
            let result = match mapper.lookup(namespace).await {
                Ok(mapping) => {
                    sync_instance_label(self.cluster, namespace, mapping.instance()).await
                }
                Err(source) => Err(Error::LookupMapping { namespace: namespace.clone(), source }),
            };
            if let Err(err) = result {
                errors.push(err);
            }
        }
        Error::combine(errors)
    }
}

fn has_finalizer(dynakube: &DynaKube) -> bool {
    dynakube.finalizers().iter().any(|finalizer| finalizer == FINALIZER)
}

/// The `DynaKube`s reading secret `secret_name` of the operator namespace.
fn referencing_dynakubes(
    dynakubes: &[Arc<DynaKube>],
    secret_name: &str,
) -> Vec<ObjectRef<DynaKube>> {
    dynakubes
        .iter()
        .filter(|dynakube| {
            dynakube.tokens_secret_name() == secret_name
                || dynakube.custom_pull_secret_name() == Some(secret_name)
                || dynakube
                    .spec
                    .proxy
                    .as_ref()
                    .and_then(|proxy| proxy.value_from.as_deref())
                    == Some(secret_name)
        })
        .map(|dynakube| ObjectRef::from_obj(dynakube.as_ref()))
        .collect()
}

async fn reconcile<C>(dynakube: Arc<DynaKube>, context: Arc<Context<C>>) -> Result<Action, Error>
where
    C: ClusterApi,
{
    let requeue = DynaKubeReconciler::new(&context.cluster).reconcile(&dynakube).await?;
    Ok(context.on_success(&dynakube.name_any(), requeue))
}

fn error_policy<C>(dynakube: Arc<DynaKube>, err: &Error, context: Arc<Context<C>>) -> Action {
    context.on_error(&dynakube.name_any(), err)
}

/// Watches the `DynaKube`s of the operator namespace, and the secrets they
/// read, until `shutdown_signal` resolves.
pub async fn run_dynakube_controller(
    cluster: KubeCluster,
    config: ControllerConfig,
    shutdown_signal: impl Future<Output = ()> + Send + Unpin + 'static,
) {
    let client = cluster.client();
    let namespace = cluster.operator_namespace().to_string();
    let watcher_config = WatcherConfig::default().timeout(config.watcher_timeout_secs);

    let controller = Controller::new(
        Api::<DynaKube>::namespaced(client.clone(), &namespace),
        watcher_config.clone(),
    );
    let store = controller.store();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    let context = Arc::new(Context::new(cluster, &config));

    tracing::info!(namespace = %namespace, "Starting DynaKube controller");
    let controller = controller
        .watches(Api::<Secret>::namespaced(client, &namespace), watcher_config, move |secret| {
            referencing_dynakubes(&store.state(), &secret.name_any())
        })
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, context)
        .for_each(log_reconcile_result("DynaKube"));
    run_until_shutdown(controller, token, shutdown_signal).await;
    tracing::info!("DynaKube controller stopped");
}

#[cfg(test)]
mod tests {
    use dynakube_base::consts::{labels, names};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::{
        cluster::fake::{FakeCluster, OPERATOR_NAMESPACE},
        crd::ConditionStatus,
        testing,
    };

    fn inject_label() -> [(&'static str, &'static str); 1] { [("inject", "true")] }

    fn cluster_with_dynakube() -> FakeCluster {
        let cluster = FakeCluster::new();
        cluster.add_namespace("app", &inject_label());
        cluster.add_namespace("other", &[]);
        cluster.add_secret(OPERATOR_NAMESPACE, "dk1", &[("apiToken", "84"), ("paasToken", "42")]);
        cluster.add_dynakube(testing::code_modules_dynakube("dk1", &inject_label(), None));
        cluster
    }

    async fn reconcile_dk1(cluster: &FakeCluster) -> Requeue {
        let dynakube = cluster.dynakube("dk1").unwrap();
        DynaKubeReconciler::new(cluster).reconcile(&dynakube).await.unwrap()
    }

    #[tokio::test]
    async fn test_reconcile_maps_and_bootstraps() {
        let cluster = cluster_with_dynakube();
        assert_eq!(reconcile_dk1(&cluster).await, Requeue::Resync);

        let dynakube = cluster.dynakube("dk1").unwrap();
        assert!(has_finalizer(&dynakube));
        assert_eq!(
            cluster.config_map_data(names::CODE_MODULES_MAP),
            testing::string_map(&[("app", "dk1")])
        );
        assert!(cluster.secret("app", names::INIT_SECRET).is_some());
        assert!(cluster.secret("other", names::INIT_SECRET).is_none());
        assert_eq!(cluster.namespace_label("app", labels::INSTANCE).as_deref(), Some("dk1"));
        assert_eq!(cluster.namespace_label("other", labels::INSTANCE), None);

        let conditions = dynakube.conditions();
        assert_eq!(conditions.len(), 3);
        assert_eq!(conditions[0].type_, "APIToken");
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(conditions[2].reason, "TokenMissing");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let cluster = cluster_with_dynakube();
        let _requeue = reconcile_dk1(&cluster).await;
        let writes = cluster.secret_writes();
        let conditions = cluster.dynakube("dk1").unwrap().conditions().to_vec();

        let _requeue = reconcile_dk1(&cluster).await;
        assert_eq!(cluster.secret_writes(), writes);
        assert_eq!(cluster.dynakube("dk1").unwrap().conditions(), conditions.as_slice());
    }

    #[tokio::test]
    async fn test_reconcile_removes_unmapped_namespace() {
        let cluster = cluster_with_dynakube();
        let _requeue = reconcile_dk1(&cluster).await;

        cluster.add_namespace("app", &[(labels::INSTANCE, "dk1")]);
        let _requeue = reconcile_dk1(&cluster).await;

        assert!(cluster.config_map_data(names::CODE_MODULES_MAP).is_empty());
        assert!(cluster.secret("app", names::INIT_SECRET).is_none());
        assert_eq!(cluster.namespace_label("app", labels::INSTANCE), None);
    }

    #[tokio::test]
    async fn test_missing_tokens_secret() {
        let cluster = FakeCluster::new();
        cluster.add_namespace("app", &inject_label());
        cluster.add_dynakube(testing::code_modules_dynakube("dk1", &inject_label(), None));

        assert_eq!(reconcile_dk1(&cluster).await, Requeue::Resync);
        assert_eq!(
            cluster.config_map_data(names::CODE_MODULES_MAP),
            testing::string_map(&[("app", "dk1")])
        );
        assert!(cluster.secret("app", names::INIT_SECRET).is_none());
        let dynakube = cluster.dynakube("dk1").unwrap();
        assert!(dynakube.conditions().iter().all(|c| c.reason == "TokenSecretNotFound"));
    }

    #[tokio::test]
    async fn test_custom_pull_secret_is_replicated() {
        let cluster = cluster_with_dynakube();
        let mut dynakube = cluster.dynakube("dk1").unwrap();
        dynakube.spec.custom_pull_secret = Some("registry".to_string());
        cluster.add_dynakube(dynakube);
        cluster.add_secret(OPERATOR_NAMESPACE, "registry", &[(".dockerconfigjson", "{}")]);

        let _requeue = reconcile_dk1(&cluster).await;
        assert_eq!(
            cluster.secret_string("app", names::PULL_SECRET, ".dockerconfigjson").as_deref(),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn test_deletion_cleans_up() {
        let cluster = cluster_with_dynakube();
        let _requeue = reconcile_dk1(&cluster).await;

        let mut dynakube = cluster.dynakube("dk1").unwrap();
        let deleted_at: Time = serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z"))
            .unwrap();
        dynakube.metadata.deletion_timestamp = Some(deleted_at);
        cluster.add_dynakube(dynakube);

        assert_eq!(reconcile_dk1(&cluster).await, Requeue::AwaitChange);
        assert!(cluster.config_map_data(names::CODE_MODULES_MAP).is_empty());
        assert!(cluster.secret("app", names::INIT_SECRET).is_none());
        assert_eq!(cluster.namespace_label("app", labels::INSTANCE), None);
        assert!(!has_finalizer(&cluster.dynakube("dk1").unwrap()));
    }

    #[test]
    fn test_referencing_dynakubes() {
        let mut with_tokens = testing::dynakube("dk1");
        with_tokens.spec.tokens = Some("shared".to_string());
        let mut with_pull_secret = testing::dynakube("dk2");
        with_pull_secret.spec.custom_pull_secret = Some("shared".to_string());
        let unrelated = testing::dynakube("dk3");
        let dynakubes =
            vec![Arc::new(with_tokens), Arc::new(with_pull_secret), Arc::new(unrelated)];

        let names: Vec<String> = referencing_dynakubes(&dynakubes, "shared")
            .into_iter()
            .map(|object| object.name)
            .collect();
        assert_eq!(names, vec!["dk1".to_string(), "dk2".to_string()]);
        assert_eq!(referencing_dynakubes(&dynakubes, "dk3").len(), 1);
    }
}

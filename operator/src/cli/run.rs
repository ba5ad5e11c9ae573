use sigfinn::{ExitStatus, LifecycleManager};

use super::Error;
use crate::{
    cluster::KubeCluster,
    config::Config,
    controller::{run_dynakube_controller, run_namespace_controller},
    webhook::{InjectionHandler, WebhookServer},
};

/// Runs the admission webhook and both controllers until a termination
/// signal arrives or one of them fails.
pub async fn run_operator(kube_client: kube::Client, config: Config) -> Result<(), Error> {
    // Another crate may have installed a provider already.
    let _unused = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let Config { operator_namespace, webhook, controller, log: _ } = config;
    tracing::info!(
        version = dynakube_base::PROJECT_VERSION,
        namespace = %operator_namespace,
        "Starting {}",
        dynakube_base::PROJECT_NAME_WITH_INITIAL_CAPITAL
    );

    let cluster = KubeCluster::new(kube_client, operator_namespace);
    let handler = InjectionHandler::new(cluster.clone(), webhook.request_timeout()).await;
    let server = WebhookServer::new(webhook, handler);

    let lifecycle_manager = LifecycleManager::<Error>::new();
    let _handle = lifecycle_manager.spawn("webhook-server", move |shutdown_signal| async move {
        match server.serve(shutdown_signal).await {
            Ok(()) => ExitStatus::Success,
            Err(err) => ExitStatus::Error(Error::from(err)),
        }
    });

    let dynakube_cluster = cluster.clone();
    let dynakube_config = controller.clone();
    let _handle = lifecycle_manager.spawn("dynakube-controller", move |shutdown_signal| async move {
        run_dynakube_controller(dynakube_cluster, dynakube_config, shutdown_signal).await;
        ExitStatus::Success
    });

    let _handle =
        lifecycle_manager.spawn("namespace-controller", move |shutdown_signal| async move {
            run_namespace_controller(cluster, controller, shutdown_signal).await;
            ExitStatus::Success
        });

    if let Ok(Err(err)) = lifecycle_manager.serve().await {
        tracing::error!("{err}");
        Err(err)
    } else {
        Ok(())
    }
}

//! Reconcilers keeping the namespace maps, the namespace instance labels and
//! the replicated init secrets in line with `DynaKube`s and namespaces.

mod dynakube;
mod error;
mod namespace;
mod tokens;

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use dynakube_base::consts::{labels, names};
use kube::{ResourceExt, runtime::controller::Action};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

pub use self::{
    dynakube::{DynaKubeReconciler, run_dynakube_controller},
    error::Error,
    namespace::{NamespaceReconciler, run_namespace_controller},
};
use crate::{
    bootstrap::{Bootstrapper, InitSecretData},
    cluster::ClusterApi,
    config::ControllerConfig,
    crd::DynaKube,
};

/// What to do with an object after a successful reconcile.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Requeue {
    /// Reconcile again after the resync interval.
    Resync,
    /// Wait for the next change of the object.
    AwaitChange,
}

/// Per-key exponential backoff: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(HashMap::new()) }
    }

    /// Records a failure of `key` and returns the delay before the retry.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let factor = 1_u32.checked_shl(*count - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&self, key: &str) {
        let _unused = self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }
}

/// State shared by all reconciles of one controller.
pub struct Context<C> {
    cluster: C,
    backoff: Backoff,
    resync_interval: Duration,
}

impl<C> Context<C> {
    pub fn new(cluster: C, config: &ControllerConfig) -> Self {
        Self {
            cluster,
            backoff: Backoff::new(config.backoff_base(), config.backoff_max()),
            resync_interval: config.resync_interval(),
        }
    }

    fn on_success(&self, key: &str, requeue: Requeue) -> Action {
        self.backoff.reset(key);
        match requeue {
            Requeue::Resync => Action::requeue(self.resync_interval),
            Requeue::AwaitChange => Action::await_change(),
        }
    }

    fn on_error(&self, key: &str, err: &Error) -> Action {
        let delay = self.backoff.next_delay(key);
        tracing::warn!(object = key, ?delay, "Reconcile failed, error: {err}");
        Action::requeue(delay)
    }
}

/// Writes the init secret into `namespace` and replicates the custom pull
/// secret next to it. A missing pull secret source is only logged.
async fn write_bootstrap<C>(
    bootstrapper: &Bootstrapper<'_, C>,
    dynakube: &DynaKube,
    namespace: &str,
    data: &InitSecretData,
) -> Result<(), Error>
where
    C: ClusterApi,
{
    let _outcome = bootstrapper
        .write_init_secret(dynakube, namespace, data)
        .await
        .with_context(|_| error::WriteInitSecretSnafu { namespace: namespace.to_string() })?;

    let Some(pull_secret) = dynakube.custom_pull_secret_name() else {
        return Ok(());
    };
    match bootstrapper.replicate(dynakube, pull_secret, names::PULL_SECRET, namespace).await {
        Ok(_outcome) => Ok(()),
        Err(err) if err.is_source_missing() => {
            tracing::warn!(dynakube = %dynakube.name_any(), namespace, "{err}");
            Ok(())
        }
        Err(source) => Err(Error::WriteInitSecret { namespace: namespace.to_string(), source }),
    }
}

/// Points the instance label of `namespace` to `instance`, or removes it.
async fn sync_instance_label<C>(
    cluster: &C,
    namespace: &str,
    instance: Option<&str>,
) -> Result<(), Error>
where
    C: ClusterApi,
{
    let Some(current) = cluster
        .get_namespace(namespace)
        .await
        .with_context(|_| error::GetNamespaceSnafu { namespace: namespace.to_string() })?
    else {
        return Ok(());
    };
    if current.labels().get(labels::INSTANCE).map(String::as_str) == instance {
        return Ok(());
    }

    cluster
        .set_namespace_instance_label(namespace, instance)
        .await
        .with_context(|_| error::LabelNamespaceSnafu { namespace: namespace.to_string() })?;
    tracing::info!(namespace, ?instance, "Updated namespace instance label");
    Ok(())
}

/// Runs `controller` until it ends on its own or `shutdown_signal` resolves.
/// On shutdown, `token` is cancelled and in-flight reconciles are awaited.
async fn run_until_shutdown<S>(
    controller: S,
    token: CancellationToken,
    shutdown_signal: impl Future<Output = ()> + Send + Unpin,
) where
    S: Future<Output = ()>,
{
    tokio::pin!(controller);
    tokio::select! {
        () = &mut controller => return,
        () = shutdown_signal => {}
    }
    token.cancel();
    controller.await;
}

fn log_reconcile_result<T, E>(
    controller: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()>
where
    T: fmt::Debug,
    E: fmt::Display,
{
    move |result| {
        match result {
            Ok(object) => tracing::debug!(?object, "{controller} reconciled"),
            Err(err) => tracing::warn!("{controller} reconcile error: {err}"),
        }
        std::future::ready(())
    }
}

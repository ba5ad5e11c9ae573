//! HTTPS admission server.

mod error;
mod handler;
mod manifest;

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    routing::{get, post},
};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use kube::core::{DynamicObject, admission::AdmissionReview};
use snafu::ResultExt;

pub use self::{error::Error, handler::InjectionHandler, manifest::webhook_configuration};
use crate::{cluster::ClusterApi, config::WebhookConfig};

pub const INJECT_PATH: &str = "/inject";
pub const LIVENESS_PATH: &str = "/livez";

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebhookServer<C> {
    config: WebhookConfig,
    handler: Arc<InjectionHandler<C>>,
}

impl<C> WebhookServer<C>
where
    C: ClusterApi + 'static,
{
    pub fn new(config: WebhookConfig, handler: InjectionHandler<C>) -> Self {
        Self { config, handler: Arc::new(handler) }
    }

    /// Serves until `shutdown_signal` resolves, reloading the certificate
    /// periodically.
    ///
    /// # Errors
    ///
    /// Fails when the certificate cannot be loaded at start-up or the listener
    /// fails.
    pub async fn serve(
        self,
        shutdown_signal: impl Future<Output = ()> + Send + Unpin + 'static,
    ) -> Result<(), Error> {
        let Self { config, handler } = self;
        let listen_address = config.listen_address;
        let (cert, key) = (config.certificate_path(), config.key_path());

        let tls_config = RustlsConfig::from_pem_file(&cert, &key)
            .await
            .with_context(|_| error::LoadCertificateSnafu {
                cert: cert.clone(),
                key: key.clone(),
            })?;

        let handle = Handle::new();
        let server = axum_server::bind_rustls(listen_address, tls_config.clone())
            .handle(handle.clone())
            .serve(router(handler).into_make_service());
        tokio::pin!(server);

        tracing::info!("Serving admission webhook on {listen_address}");
        tokio::select! {
            result = &mut server => {
                return result.context(error::ServeSnafu { listen_address });
            }
            () = reload_certificate(
                tls_config,
                cert,
                key,
                config.certificate_reload_interval(),
            ) => {}
            () = shutdown_signal => {
                tracing::info!("Shutting down admission webhook");
            }
        }

        handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
        server.await.context(error::ServeSnafu { listen_address })
    }
}

fn router<C>(handler: Arc<InjectionHandler<C>>) -> Router
where
    C: ClusterApi + 'static,
{
    Router::new()
        .route(INJECT_PATH, post(inject::<C>))
        .route(LIVENESS_PATH, get(livez))
        .with_state(handler)
}

async fn inject<C>(
    State(handler): State<Arc<InjectionHandler<C>>>,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>>
where
    C: ClusterApi + 'static,
{
    Json(handler.review(&body).await)
}

async fn livez() -> &'static str { "ok" }

/// Re-reads the certificate and key every `interval`. Never returns.
async fn reload_certificate(
    tls_config: RustlsConfig,
    cert: PathBuf,
    key: PathBuf,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    let _unused = ticker.tick().await;
    loop {
        let _unused = ticker.tick().await;
        match tls_config.reload_from_pem_file(&cert, &key).await {
            Ok(()) => tracing::debug!("Reloaded webhook certificate from {}", cert.display()),
            Err(err) => tracing::warn!(
                "Failed to reload webhook certificate from {}, error: {err}",
                cert.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::{cluster::fake::FakeCluster, mapper::NamespaceMapper, testing};

    async fn app() -> Router {
        let cluster = FakeCluster::new();
        cluster.add_namespace("app", &[]);
        let dynakube = testing::metadata_enrichment_dynakube("dk1", &[]);
        cluster.add_dynakube(dynakube.clone());
        let _unused = NamespaceMapper::new(&cluster).map_from_dynakube(&dynakube).await.unwrap();
        router(Arc::new(InjectionHandler::new(cluster, Duration::from_secs(10)).await))
    }

    #[tokio::test]
    async fn test_livez() {
        let request = Request::builder().uri(LIVENESS_PATH).body(Body::empty()).unwrap();
        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_inject_route_answers_review() {
        let pod = testing::pod("app", "web-0", &[("web", "nginx:1.25")]);
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "namespace": "app",
                "operation": "CREATE",
                "userInfo": { "username": "system:admin" },
                "object": pod,
                "dryRun": false
            }
        });
        let request = Request::builder()
            .method("POST")
            .uri(INJECT_PATH)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&review).unwrap()))
            .unwrap();

        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let review: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(review["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(review["response"]["allowed"], true);
        assert_eq!(review["response"]["patchType"], "JSONPatch");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let request = Request::builder().uri("/mutate").body(Body::empty()).unwrap();
        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

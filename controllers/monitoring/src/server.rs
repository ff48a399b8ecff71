//! HTTP surfaces: `/health`, `/metrics` and the validating admission webhook.
//!
//! The webhook listener terminates TLS itself with the provisioned
//! certificate. The acceptor lives in a watch channel so renewal can swap it
//! without restarting the listener; connections in progress keep the acceptor
//! they were accepted with.

use crate::builder::MAX_INSTANCE_NAME;
use crate::certs::{publish_ca_bundle, CertificateManager, RENEWAL_CHECK_INTERVAL, RENEWAL_RETRY_INTERVAL};
use crate::cluster::ClusterClient;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use crds::{CrdError, MonitoringInstance};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperAcceptor;
use hyper_util::service::TowerToHyperService;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use openssl::ssl::{Ssl, SslAcceptor};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_openssl::SslStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Resolves once shutdown has been signalled (or the sender is gone).
pub async fn shutdown_signalled(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub fn health_router() -> Router {
    Router::new().route("/health", get(health))
}

pub fn metrics_router(metrics: Metrics) -> Router {
    Router::new().route("/metrics", get(serve_metrics)).with_state(metrics)
}

pub fn webhook_router() -> Router {
    Router::new()
        .route("/validate", post(validate))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn serve_metrics(State(metrics): State<Metrics>) -> Response {
    match metrics.gather() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn validate(Json(body): Json<AdmissionReview<MonitoringInstance>>) -> Json<AdmissionReview<DynamicObject>> {
    Json(review(body))
}

/// Admission rules for a MonitoringInstance.
pub fn admit(instance: &MonitoringInstance) -> Result<(), CrdError> {
    let name = instance.metadata.name.as_deref().unwrap_or_default();
    if name.len() > MAX_INSTANCE_NAME {
        return Err(CrdError::invalid(
            "metadata.name",
            format!("must be at most {MAX_INSTANCE_NAME} characters"),
        ));
    }
    instance.spec.validate()
}

/// Answers one admission review. Deletes carry no object and are always allowed.
pub fn review(review: AdmissionReview<MonitoringInstance>) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<MonitoringInstance> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(context = "webhook", "Malformed admission review: {}", e);
            return AdmissionResponse::invalid(e.to_string()).into_review();
        }
    };

    let mut response = AdmissionResponse::from(&request);
    if let Some(instance) = &request.object {
        if let Err(e) = admit(instance) {
            info!(
                context = "webhook",
                namespace = request.namespace.as_deref().unwrap_or_default(),
                name = %request.name,
                "Rejected MonitoringInstance: {}",
                e
            );
            response = response.deny(e.to_string());
        }
    }
    response.into_review()
}

/// Serves a plain HTTP router until shutdown.
pub async fn serve_http(
    addr: SocketAddr,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Server(format!("cannot bind {addr}: {e}")))?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signalled(shutdown))
        .await
        .map_err(|e| ControllerError::Server(format!("HTTP server on {addr} failed: {e}")))
}

async fn accept_tls(acceptor: &SslAcceptor, stream: TcpStream) -> Result<SslStream<TcpStream>, ControllerError> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut tls_stream = SslStream::new(ssl, stream)?;
    Pin::new(&mut tls_stream)
        .accept()
        .await
        .map_err(|e| ControllerError::Server(format!("TLS handshake failed: {e}")))?;
    Ok(tls_stream)
}

/// Serves the webhook router over TLS until shutdown.
pub async fn serve_webhook(
    addr: SocketAddr,
    router: Router,
    acceptors: watch::Receiver<Arc<SslAcceptor>>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Server(format!("cannot bind {addr}: {e}")))?;
    info!(context = "webhook", "Webhook server listening on {}", addr);

    let stopped = shutdown_signalled(shutdown);
    tokio::pin!(stopped);
    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => accepted
                .map_err(|e| ControllerError::Server(format!("accept on {addr} failed: {e}")))?,
            () = &mut stopped => {
                info!(context = "webhook", "Webhook server stopping");
                return Ok(());
            }
        };

        let acceptor = Arc::clone(&acceptors.borrow());
        let service = router.clone();
        tokio::spawn(async move {
            let tls_stream = match accept_tls(&acceptor, stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(context = "webhook", remote = %remote_addr, "{}", e);
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(service);
            if let Err(e) = HyperAcceptor::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!(context = "webhook", remote = %remote_addr, "Connection error: {}", e);
            }
        });
    }
}

/// Periodically renews the webhook certificate, keeps the CA bundle published
/// and swaps in the new acceptor.
pub async fn renew_certificates(
    manager: CertificateManager,
    cluster: Arc<dyn ClusterClient>,
    webhook_config: String,
    acceptors: watch::Sender<Arc<SslAcceptor>>,
    shutdown: watch::Receiver<bool>,
) {
    let stopped = shutdown_signalled(shutdown);
    tokio::pin!(stopped);
    // The first check runs shortly after startup.
    let mut delay = RENEWAL_RETRY_INTERVAL;
    loop {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = &mut stopped => return,
        }

        delay = match refresh_certificate(&manager, cluster.as_ref(), &webhook_config, &acceptors).await {
            Ok(true) => {
                info!(context = "webhook", "Webhook certificate renewed");
                RENEWAL_CHECK_INTERVAL
            }
            Ok(false) => {
                debug!(context = "webhook", "Webhook certificate not due for renewal");
                RENEWAL_CHECK_INTERVAL
            }
            Err(e) => {
                error!(context = "webhook", "Webhook certificate check failed: {}", e);
                RENEWAL_RETRY_INTERVAL
            }
        };
    }
}

/// One renewal check. Returns whether the certificate was renewed.
///
/// On renewal the published bundle holds the new and the previous CA until
/// the next check, so handshakes still presenting the old leaf verify.
pub async fn refresh_certificate(
    manager: &CertificateManager,
    cluster: &dyn ClusterClient,
    webhook_config: &str,
    acceptors: &watch::Sender<Arc<SslAcceptor>>,
) -> Result<bool, ControllerError> {
    let previous_ca = manager.current_ca()?;
    let Some(material) = manager.renew_if_due()? else {
        if let Some(ca) = previous_ca {
            publish_ca_bundle(cluster, webhook_config, &ca).await?;
        }
        return Ok(false);
    };

    let acceptor = material.acceptor()?;
    let mut bundle = material.ca_pem.clone();
    if let Some(old) = previous_ca {
        bundle.extend_from_slice(&old);
    }
    let published = publish_ca_bundle(cluster, webhook_config, &bundle).await;
    acceptors.send_replace(Arc::new(acceptor));
    published.map(|_| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{minimal_spec, test_instance, webhook_config, MockClusterClient};
    use std::fs;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn admission_review(instance: &MonitoringInstance, operation: &str) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "monitoring.microscaler.io", "version": "v1alpha1", "kind": "MonitoringInstance"},
                "resource": {"group": "monitoring.microscaler.io", "version": "v1alpha1", "resource": "monitoringinstances"},
                "name": "logs",
                "namespace": "observability",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": serde_json::to_value(instance).expect("instance json"),
                "dryRun": false
            }
        })
    }

    fn decide(body: Value) -> Value {
        let review: AdmissionReview<MonitoringInstance> = serde_json::from_value(body).expect("review");
        serde_json::to_value(super::review(review)).expect("response json")
    }

    #[test]
    fn test_valid_instance_admitted() {
        let response = decide(admission_review(&test_instance(minimal_spec()), "CREATE"));
        assert_eq!(response["response"]["allowed"], json!(true));
        assert_eq!(response["response"]["uid"], json!("705ab4f5-6393-11e8-b7cc-42010a800002"));
    }

    #[test]
    fn test_invalid_instance_denied() {
        let mut spec = minimal_spec();
        spec.search.version = String::new();
        let response = decide(admission_review(&test_instance(spec), "UPDATE"));
        assert_eq!(response["response"]["allowed"], json!(false));
    }

    #[test]
    fn test_long_name_denied() {
        let mut instance = test_instance(minimal_spec());
        instance.metadata.name = Some("a".repeat(MAX_INSTANCE_NAME + 1));
        assert!(admit(&instance).is_err());
    }

    #[tokio::test]
    async fn test_health() {
        let response = health_router()
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Metrics::new().expect("metrics");
        metrics.record_write("Secret", "create");
        let response = metrics_router(metrics)
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("monitoring_resource_writes_total"), "{text}");
    }

    #[tokio::test]
    async fn test_webhook_route() {
        let body = admission_review(&test_instance(minimal_spec()), "CREATE").to_string();
        let response = webhook_router()
            .oneshot(
                Request::post("/validate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["response"]["allowed"], json!(true));
    }

    #[tokio::test]
    async fn test_renewal_publishes_old_and_new_ca() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CertificateManager::new(dir.path(), "monitoring-operator-webhook", "monitoring", "cluster.local");
        let client = MockClusterClient::new();
        client.put_webhook_config(webhook_config("monitoring-operator-webhook", 1));
        let bundle = |client: &MockClusterClient| {
            client
                .webhook_config("monitoring-operator-webhook")
                .and_then(|c| c.webhooks)
                .and_then(|mut w| w.pop())
                .and_then(|w| w.client_config.ca_bundle)
                .map(|b| b.0)
        };

        let first = manager.ensure().expect("ensure");
        let (acceptors, current) = watch::channel(Arc::new(first.acceptor().expect("acceptor")));

        // Not due: the current CA is published and the acceptor stays.
        let renewed = refresh_certificate(&manager, &client, "monitoring-operator-webhook", &acceptors)
            .await
            .expect("check");
        assert!(!renewed);
        assert_eq!(bundle(&client), Some(first.ca_pem.clone()));
        assert!(!current.has_changed().expect("sender alive"));

        // Renewal: both CAs are trusted and the new acceptor is swapped in.
        fs::remove_file(dir.path().join(crate::certs::TLS_CERT_FILE)).expect("remove leaf");
        let renewed = refresh_certificate(&manager, &client, "monitoring-operator-webhook", &acceptors)
            .await
            .expect("renew");
        assert!(renewed);
        assert!(current.has_changed().expect("sender alive"));
        let second = manager.load().expect("load").expect("material");
        assert_ne!(second.ca_pem, first.ca_pem);
        let mut both = second.ca_pem.clone();
        both.extend_from_slice(&first.ca_pem);
        assert_eq!(bundle(&client), Some(both));

        // Next check narrows the bundle to the new CA.
        let renewed = refresh_certificate(&manager, &client, "monitoring-operator-webhook", &acceptors)
            .await
            .expect("check");
        assert!(!renewed);
        assert_eq!(bundle(&client), Some(second.ca_pem));
    }

    #[tokio::test]
    async fn test_shutdown_signal_resolves() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(shutdown_signalled(rx));
        tx.send_replace(true);
        waiter.await.expect("join");
    }
}

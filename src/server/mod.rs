//! HTTP surface of the gateway.

mod activation;
mod embedded;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::activation::{ProblemDetail, TenantResolver};
use crate::broker::WorkQueueClient;
use crate::config::{ActivationConfig, ServerConfig};

pub use embedded::embedded_broker_router;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind HTTP server on {address}: {source}")]
    Bind { address: String, source: io::Error },
    #[error("failed to read bound address: {source}")]
    LocalAddr { source: io::Error },
    #[error("HTTP server terminated: {source}")]
    Serve { source: io::Error },
}

#[derive(Clone)]
pub struct GatewayState {
    pub broker: Arc<dyn WorkQueueClient>,
    pub tenants: Arc<dyn TenantResolver>,
    pub activation: ActivationConfig,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/jobs/activation", post(activation::activate_numeric))
        .route("/v2/jobs/activation", post(activation::activate_string))
        .route(
            "/v2/tenants/:tenant_id/jobs/activation",
            post(activation::activate_for_tenant),
        )
        .with_state(state)
}

pub async fn bind(config: &ServerConfig) -> Result<(TcpListener, SocketAddr), ServerError> {
    let address = config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| ServerError::Bind { address, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    Ok((listener, local_addr))
}

pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|source| ServerError::Serve { source })
}

impl IntoResponse for ProblemDetail {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)], Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::response::IntoResponse;
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::activation::{ProblemDetail, StaticTenantResolver};
    use crate::broker::memory::InMemoryBroker;
    use crate::config::{ActivationConfig, ServerConfig};

    use super::{bind, build_router, embedded_broker_router, GatewayState, PROBLEM_CONTENT_TYPE};

    const ACTIVATION: ActivationConfig = ActivationConfig {
        long_polling_enabled: true,
        default_request_timeout_ms: 5_000,
        response_grace_ms: 1_000,
        max_response_size_bytes: 1_048_576,
    };

    fn gateway(broker: &InMemoryBroker) -> Router {
        build_router(GatewayState {
            broker: Arc::new(broker.clone()),
            tenants: Arc::new(StaticTenantResolver::default()),
            activation: ACTIVATION,
        })
        .merge(embedded_broker_router(broker.clone()))
    }

    async fn post(router: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("router should respond");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn problem_detail_renders_as_problem_json() {
        let response = ProblemDetail::new(429, "RESOURCE_EXHAUSTED", "slow down")
            .with_instance("/v2/jobs/activation")
            .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PROBLEM_CONTENT_TYPE
        );
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let body: Value = serde_json::from_slice(&bytes).expect("body should be JSON");
        assert_eq!(body["status"], 429);
        assert_eq!(body["instance"], "/v2/jobs/activation");
    }

    #[tokio::test]
    async fn binds_ephemeral_port_and_builds_router() {
        let (_listener, address) = bind(&ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
        })
        .await
        .expect("ephemeral bind should succeed");
        assert_ne!(address.port(), 0);

        let broker = InMemoryBroker::new(1).expect("broker");
        let _router = gateway(&broker);
    }

    #[tokio::test]
    async fn publish_activate_and_complete_round_trip() {
        let broker = InMemoryBroker::new(3).expect("broker");
        let router = gateway(&broker);

        let long_poll = tokio::spawn(post(
            router.clone(),
            "/v2/jobs/activation",
            json!({"type": "invoice", "worker": "w", "timeout": 30_000, "maxJobsToActivate": 2}),
        ));
        tokio::task::yield_now().await;

        let (status, published) = post(
            router.clone(),
            "/v2/jobs",
            json!({"type": "invoice", "variables": {"total": 12}}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let job_key = published["jobKey"].as_str().expect("job key").to_owned();

        let (status, activated) = long_poll.await.expect("long poll task");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(activated["jobs"][0]["key"], job_key.as_str());
        assert_eq!(activated["jobs"][0]["variables"]["total"], 12);

        let (status, _) = post(
            router.clone(),
            &format!("/v2/jobs/{job_key}/completion"),
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(broker.leased_count() + broker.pending_count(), 0);
    }
}

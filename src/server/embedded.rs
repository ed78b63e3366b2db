//! Routes that only exist while the gateway runs on the embedded broker:
//! publishing jobs and completing leased ones.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::activation::criteria::DEFAULT_TENANT_ID;
use crate::activation::ProblemDetail;
use crate::broker::memory::{BrokerError, InMemoryBroker, NewJob};
use crate::broker::JobKey;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishJobRequest {
    #[serde(rename = "type")]
    job_type: String,
    process_definition_id: Option<String>,
    process_definition_version: Option<i32>,
    element_id: Option<String>,
    retries: Option<i32>,
    #[serde(default)]
    variables: Map<String, Value>,
    #[serde(default)]
    custom_headers: Map<String, Value>,
    tenant_id: Option<String>,
}

impl From<PublishJobRequest> for NewJob {
    fn from(request: PublishJobRequest) -> Self {
        let defaults = NewJob::new(request.job_type);
        Self {
            process_definition_id: request
                .process_definition_id
                .unwrap_or(defaults.process_definition_id),
            process_definition_version: request
                .process_definition_version
                .unwrap_or(defaults.process_definition_version),
            element_id: request.element_id.unwrap_or(defaults.element_id),
            retries: request.retries.unwrap_or(defaults.retries),
            variables: request.variables,
            custom_headers: request.custom_headers,
            tenant_id: request
                .tenant_id
                .unwrap_or_else(|| DEFAULT_TENANT_ID.to_owned()),
            job_type: defaults.job_type,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishJobResponse {
    job_key: String,
}

pub fn embedded_broker_router(broker: InMemoryBroker) -> Router {
    Router::new()
        .route("/v2/jobs", post(publish_job))
        .route("/v2/jobs/:job_key/completion", post(complete_job))
        .with_state(broker)
}

async fn publish_job(
    State(broker): State<InMemoryBroker>,
    uri: Uri,
    body: Result<Json<PublishJobRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return ProblemDetail::new(400, "INVALID_ARGUMENT", rejection.body_text())
                .with_instance(uri.path())
                .into_response();
        }
    };
    if request.job_type.trim().is_empty() {
        return ProblemDetail::new(400, "INVALID_ARGUMENT", "expected a non-blank job type")
            .with_instance(uri.path())
            .into_response();
    }

    let key = broker.publish(request.into());
    tracing::debug!(target: "jobgate::server", job_key = key, "job published");
    (
        StatusCode::CREATED,
        Json(PublishJobResponse {
            job_key: key.to_string(),
        }),
    )
        .into_response()
}

async fn complete_job(
    State(broker): State<InMemoryBroker>,
    Path(job_key): Path<String>,
    uri: Uri,
) -> Response {
    let Ok(key) = job_key.parse::<JobKey>() else {
        return ProblemDetail::new(
            400,
            "INVALID_ARGUMENT",
            format!("'{job_key}' is not a valid job key"),
        )
        .with_instance(uri.path())
        .into_response();
    };

    match broker.complete(key) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error @ (BrokerError::NotLeased { .. } | BrokerError::UnknownPartition { .. })) => {
            ProblemDetail::new(404, "NOT_FOUND", error.to_string())
                .with_instance(uri.path())
                .into_response()
        }
        Err(error) => ProblemDetail::new(500, "INTERNAL_ERROR", error.to_string())
            .with_instance(uri.path())
            .into_response(),
    }
}

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::activation::problem::{gateway_timeout_problem, validation_problem};
use crate::activation::{
    ActivationCriteria, ActivationRequest, ActivationSession, EncodedJob, JobEncoding,
    NumericKeys, ProblemDetail, SessionOutcome, StringKeys, ValidationError, WireKey,
};
use crate::server::GatewayState;
use crate::utils::timing::ScopedExecutionTimer;

const EMPTY_ENVELOPE_BYTES: usize = r#"{"jobs":[]}"#.len();

#[derive(Debug, Serialize)]
struct JobsResponse<K> {
    jobs: Vec<EncodedJob<K>>,
}

pub(super) async fn activate_numeric(
    State(state): State<GatewayState>,
    uri: Uri,
    body: Result<Json<ActivationRequest>, JsonRejection>,
) -> Response {
    activate_jobs(&state, NumericKeys, uri.path(), body.map(|Json(request)| request)).await
}

pub(super) async fn activate_string(
    State(state): State<GatewayState>,
    uri: Uri,
    body: Result<Json<ActivationRequest>, JsonRejection>,
) -> Response {
    activate_jobs(&state, StringKeys, uri.path(), body.map(|Json(request)| request)).await
}

pub(super) async fn activate_for_tenant(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    uri: Uri,
    body: Result<Json<ActivationRequest>, JsonRejection>,
) -> Response {
    let body = body.map(|Json(request)| ActivationRequest {
        tenant_ids: Some(vec![tenant_id]),
        ..request
    });
    activate_jobs(&state, StringKeys, uri.path(), body).await
}

/// Validates, dispatches and awaits one activation session, then maps its
/// outcome onto an HTTP response.
async fn activate_jobs<E: JobEncoding>(
    state: &GatewayState,
    encoding: E,
    instance: &str,
    body: Result<ActivationRequest, JsonRejection>,
) -> Response {
    let _timer = ScopedExecutionTimer::new("jobs.activate");

    let request = match body {
        Ok(request) => request,
        Err(rejection) => {
            let error = ValidationError::MalformedBody {
                reason: rejection.body_text(),
            };
            return validation_problem(&error).with_instance(instance).into_response();
        }
    };
    let criteria = match ActivationCriteria::from_request(
        request,
        state.tenants.as_ref(),
        state.activation.long_polling(),
    ) {
        Ok(criteria) => criteria,
        Err(error) => {
            tracing::debug!(target: "jobgate::server", %error, "activation request rejected");
            return validation_problem(&error).with_instance(instance).into_response();
        }
    };

    let limit = criteria
        .request_timeout()
        .unwrap_or(Duration::ZERO)
        .saturating_add(state.activation.response_grace());
    let session = ActivationSession::new(criteria, encoding);
    let session_id = session.id();
    let guard = session.cancel_on_drop();
    session.dispatch(state.broker.as_ref());
    let outcome = session.wait_for(limit).await;
    guard.disarm();

    match outcome {
        SessionOutcome::Jobs(jobs) => jobs_response(state, jobs),
        SessionOutcome::Rejected(problem) => problem.with_instance(instance).into_response(),
        SessionOutcome::TimedOut(waited) => gateway_timeout_problem(waited)
            .with_instance(instance)
            .into_response(),
        SessionOutcome::Cancelled => {
            tracing::error!(
                target: "jobgate::server",
                session = %session_id,
                "activation session was cancelled while its caller was still waiting"
            );
            ProblemDetail::new(
                500,
                "INTERNAL_ERROR",
                "activation request was cancelled before it resolved",
            )
            .with_instance(instance)
            .into_response()
        }
    }
}

fn jobs_response<K: WireKey>(state: &GatewayState, jobs: Vec<EncodedJob<K>>) -> Response {
    let (sent, deferred) = split_by_size(jobs, state.activation.max_response_size_bytes);
    if !deferred.is_empty() {
        let mut keys = Vec::with_capacity(deferred.len());
        for job in &deferred {
            match job.key.to_job_key() {
                Some(key) => keys.push(key),
                None => tracing::warn!(
                    target: "jobgate::server",
                    key = ?job.key,
                    "cannot recover job key; job stays leased until its deadline"
                ),
            }
        }
        tracing::info!(
            target: "jobgate::server",
            sent = sent.len(),
            deferred = deferred.len(),
            "activation response exceeded the size limit; returning excess jobs"
        );
        state.broker.defer(keys);
    }
    Json(JobsResponse { jobs: sent }).into_response()
}

/// Splits `jobs` into those whose serialized response fits into `max_bytes`
/// and those that do not. A job that does not fit is set aside and later,
/// smaller jobs are still considered. Both lists keep delivery order.
fn split_by_size<K: Serialize>(
    jobs: Vec<EncodedJob<K>>,
    max_bytes: usize,
) -> (Vec<EncodedJob<K>>, Vec<EncodedJob<K>>) {
    let mut used = EMPTY_ENVELOPE_BYTES;
    let mut fitting = Vec::with_capacity(jobs.len());
    let mut exceeding = Vec::new();
    for job in jobs {
        let separator = usize::from(!fitting.is_empty());
        let size = serde_json::to_vec(&job)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        match used.checked_add(size.saturating_add(separator)) {
            Some(total) if total <= max_bytes => {
                used = total;
                fitting.push(job);
            }
            _ => exceeding.push(job),
        }
    }
    (fitting, exceeding)
}

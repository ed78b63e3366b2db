use std::time::Duration;

use serde::Serialize;

use crate::activation::criteria::ValidationError;
use crate::broker::{BrokerFault, FaultCategory};

pub const PROBLEM_TYPE_BLANK: &str = "about:blank";

/// Structured error document returned instead of raw fault text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProblemDetail {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetail {
    pub fn new(status: u16, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            problem_type: PROBLEM_TYPE_BLANK.to_owned(),
            title: title.into(),
            status,
            detail: detail.into(),
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

/// Maps every broker fault to a stable problem document. Total: unknown
/// categories become a generic internal error.
pub fn translate_fault(fault: &BrokerFault) -> ProblemDetail {
    let (status, title) = match &fault.category {
        FaultCategory::InvalidArgument => (400, "INVALID_ARGUMENT"),
        FaultCategory::ResourceExhausted => (429, "RESOURCE_EXHAUSTED"),
        FaultCategory::NotFound => (404, "NOT_FOUND"),
        FaultCategory::Unauthorized => (403, "UNAUTHORIZED"),
        FaultCategory::Internal => (500, "INTERNAL_ERROR"),
        FaultCategory::Other(code) => {
            return ProblemDetail::new(
                500,
                "INTERNAL_ERROR",
                format!("Unexpected broker error {code}: {}", fault.message),
            );
        }
    };
    ProblemDetail::new(status, title, fault.message.clone())
}

pub fn validation_problem(error: &ValidationError) -> ProblemDetail {
    let title = match error.status() {
        403 => "UNAUTHORIZED",
        _ => "INVALID_ARGUMENT",
    };
    ProblemDetail::new(error.status(), title, error.to_string())
}

pub fn gateway_timeout_problem(waited: Duration) -> ProblemDetail {
    ProblemDetail::new(
        504,
        "GATEWAY_TIMEOUT",
        format!(
            "broker did not answer the activation request within {} ms",
            waited.as_millis()
        ),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::activation::criteria::ValidationError;
    use crate::broker::{BrokerFault, FaultCategory};

    use super::{gateway_timeout_problem, translate_fault, validation_problem, ProblemDetail};

    #[test]
    fn closed_fault_set_maps_to_stable_statuses() {
        let cases = [
            (FaultCategory::InvalidArgument, 400, "INVALID_ARGUMENT"),
            (FaultCategory::ResourceExhausted, 429, "RESOURCE_EXHAUSTED"),
            (FaultCategory::NotFound, 404, "NOT_FOUND"),
            (FaultCategory::Unauthorized, 403, "UNAUTHORIZED"),
            (FaultCategory::Internal, 500, "INTERNAL_ERROR"),
        ];

        for (category, status, title) in cases {
            let problem = translate_fault(&BrokerFault::new(category, "boom"));
            assert_eq!(problem.status, status);
            assert_eq!(problem.title, title);
            assert_eq!(problem.detail, "boom");
            assert_eq!(problem.problem_type, "about:blank");
        }
    }

    #[test]
    fn unknown_category_becomes_generic_internal_error() {
        let fault = BrokerFault::new(FaultCategory::Other("PARTITION_LEAVING".to_owned()), "bye");
        let problem = translate_fault(&fault);

        assert_eq!(problem.status, 500);
        assert_eq!(problem.title, "INTERNAL_ERROR");
        assert!(problem.detail.contains("PARTITION_LEAVING"));
    }

    #[test]
    fn validation_errors_stay_in_client_error_range() {
        let problem = validation_problem(&ValidationError::MissingJobType);
        assert_eq!(problem.status, 400);

        let problem = validation_problem(&ValidationError::UnauthorizedTenants {
            tenant_ids: vec!["acme".to_owned()],
        });
        assert_eq!(problem.status, 403);
        assert_eq!(problem.title, "UNAUTHORIZED");
    }

    #[test]
    fn serializes_with_instance_only_when_present() {
        let bare = serde_json::to_value(ProblemDetail::new(404, "NOT_FOUND", "gone"))
            .expect("problem serializes");
        assert_eq!(
            bare,
            json!({"type":"about:blank","title":"NOT_FOUND","status":404,"detail":"gone"})
        );

        let located = serde_json::to_value(
            gateway_timeout_problem(Duration::from_millis(1500)).with_instance("/v2/jobs/activation"),
        )
        .expect("problem serializes");
        assert_eq!(located["instance"], "/v2/jobs/activation");
        assert_eq!(located["status"], 504);
    }
}

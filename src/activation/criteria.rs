use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_TENANT_ID: &str = "<default>";
pub const MAX_TENANT_ID_LENGTH: usize = 31;

/// Activation request body as sent by workers.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivationRequest {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub worker: Option<String>,
    pub timeout: Option<i64>,
    pub max_jobs_to_activate: Option<i64>,
    pub fetch_variable: Option<Vec<String>>,
    pub tenant_ids: Option<Vec<String>>,
    pub request_timeout: Option<i64>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request body could not be read: {reason}")]
    MalformedBody { reason: String },
    #[error("expected a non-blank job type, but none was provided")]
    MissingJobType,
    #[error("expected to activate at least one job, but maxJobsToActivate was {value}")]
    InvalidMaxJobs { value: i64 },
    #[error("expected a non-negative job timeout, but timeout was {value}")]
    NegativeTimeout { value: i64 },
    #[error("tenant identifier '{tenant_id}' must be at most 31 characters of [A-Za-z0-9_.-]")]
    InvalidTenantId { tenant_id: String },
    #[error("tenant identifiers {tenant_ids:?} were provided, but multi-tenancy is disabled")]
    MultiTenancyDisabled { tenant_ids: Vec<String> },
    #[error("multi-tenancy is enabled, but the caller is not authorized for any tenant")]
    NoAuthorizedTenants,
    #[error("caller is not authorized for tenants {tenant_ids:?}")]
    UnauthorizedTenants { tenant_ids: Vec<String> },
}

impl ValidationError {
    pub fn status(&self) -> u16 {
        match self {
            Self::UnauthorizedTenants { .. } => 403,
            _ => 400,
        }
    }
}

/// Answers the per-request tenant questions. Authentication itself lives
/// outside the gateway.
pub trait TenantResolver: Send + Sync {
    fn checks_enabled(&self) -> bool;
    fn authorized_tenants(&self) -> BTreeSet<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StaticTenantResolver {
    checks_enabled: bool,
    authorized: BTreeSet<String>,
}

impl StaticTenantResolver {
    pub fn new(checks_enabled: bool, authorized: impl IntoIterator<Item = String>) -> Self {
        Self {
            checks_enabled,
            authorized: authorized.into_iter().collect(),
        }
    }
}

impl TenantResolver for StaticTenantResolver {
    fn checks_enabled(&self) -> bool {
        self.checks_enabled
    }

    fn authorized_tenants(&self) -> BTreeSet<String> {
        self.authorized.clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LongPollingPolicy {
    pub enabled: bool,
    pub default_timeout: Duration,
}

/// Immutable description of one activation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationCriteria {
    job_type: String,
    worker: String,
    max_jobs_to_activate: u32,
    timeout: Duration,
    tenant_ids: BTreeSet<String>,
    fetch_variables: Option<BTreeSet<String>>,
    request_timeout: Option<Duration>,
}

impl ActivationCriteria {
    pub fn from_request(
        request: ActivationRequest,
        tenants: &dyn TenantResolver,
        long_polling: LongPollingPolicy,
    ) -> Result<Self, ValidationError> {
        let job_type = request
            .job_type
            .filter(|value| !value.trim().is_empty())
            .ok_or(ValidationError::MissingJobType)?;

        let max_jobs = request.max_jobs_to_activate.unwrap_or(0);
        if max_jobs < 1 {
            return Err(ValidationError::InvalidMaxJobs { value: max_jobs });
        }
        let max_jobs_to_activate = u32::try_from(max_jobs).unwrap_or(u32::MAX);

        let timeout_ms = request.timeout.unwrap_or(0);
        if timeout_ms < 0 {
            return Err(ValidationError::NegativeTimeout { value: timeout_ms });
        }

        let tenant_ids = resolve_tenants(request.tenant_ids.unwrap_or_default(), tenants)?;

        let request_timeout = match request.request_timeout {
            _ if !long_polling.enabled => None,
            Some(value) if value < 0 => None,
            None | Some(0) => Some(long_polling.default_timeout),
            Some(value) => Some(Duration::from_millis(value as u64)),
        };

        Ok(Self {
            job_type,
            worker: request.worker.unwrap_or_default(),
            max_jobs_to_activate,
            timeout: Duration::from_millis(timeout_ms as u64),
            tenant_ids,
            fetch_variables: request
                .fetch_variable
                .map(|names| names.into_iter().collect()),
            request_timeout,
        })
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn max_jobs_to_activate(&self) -> u32 {
        self.max_jobs_to_activate
    }

    /// Lease duration granted to each activated job.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn tenant_ids(&self) -> &BTreeSet<String> {
        &self.tenant_ids
    }

    pub fn fetch_variables(&self) -> Option<&BTreeSet<String>> {
        self.fetch_variables.as_ref()
    }

    /// How long the broker may park the request; `None` disables long polling.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}

fn resolve_tenants(
    requested: Vec<String>,
    tenants: &dyn TenantResolver,
) -> Result<BTreeSet<String>, ValidationError> {
    if let Some(invalid) = requested.iter().find(|tenant| !is_valid_tenant_id(tenant)) {
        return Err(ValidationError::InvalidTenantId {
            tenant_id: invalid.clone(),
        });
    }

    if !tenants.checks_enabled() {
        if requested.iter().any(|tenant| tenant != DEFAULT_TENANT_ID) {
            return Err(ValidationError::MultiTenancyDisabled {
                tenant_ids: requested,
            });
        }
        return Ok(BTreeSet::from([DEFAULT_TENANT_ID.to_owned()]));
    }

    let authorized = tenants.authorized_tenants();
    if requested.is_empty() {
        if authorized.is_empty() {
            return Err(ValidationError::NoAuthorizedTenants);
        }
        return Ok(authorized);
    }

    let unauthorized = requested
        .iter()
        .filter(|tenant| !authorized.contains(*tenant))
        .cloned()
        .collect::<Vec<_>>();
    if !unauthorized.is_empty() {
        return Err(ValidationError::UnauthorizedTenants {
            tenant_ids: unauthorized,
        });
    }

    Ok(requested.into_iter().collect())
}

fn is_valid_tenant_id(tenant_id: &str) -> bool {
    if tenant_id == DEFAULT_TENANT_ID {
        return true;
    }
    !tenant_id.is_empty()
        && tenant_id.len() <= MAX_TENANT_ID_LENGTH
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

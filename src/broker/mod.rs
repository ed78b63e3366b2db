//! Broker boundary.
//!
//! The gateway never talks to partitions directly. It hands an activation
//! request to a [`WorkQueueClient`] together with a [`JobSink`] and a
//! [`CancelRegistrar`], and the client calls back into the sink from its own
//! tasks until the quota is filled, the long-poll times out, an error occurs,
//! or the sink reports cancellation.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::activation::criteria::ActivationCriteria;

/// Job keys carry the owning partition in their high bits.
pub const PARTITION_KEY_SHIFT: u32 = 51;

pub type JobKey = i64;

pub fn partition_of(key: JobKey) -> u32 {
    (key >> PARTITION_KEY_SHIFT) as u32
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActivatedJob {
    pub key: JobKey,
    pub job_type: String,
    pub process_instance_key: JobKey,
    pub process_definition_key: JobKey,
    pub element_instance_key: JobKey,
    pub process_definition_id: String,
    pub process_definition_version: i32,
    pub element_id: String,
    pub worker: String,
    pub retries: i32,
    pub deadline: DateTime<Utc>,
    pub variables: Map<String, Value>,
    pub custom_headers: Map<String, Value>,
    pub tenant_id: String,
}

/// Jobs delivered atomically by one producer invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobBatch {
    pub partition_id: u32,
    pub jobs: Vec<ActivatedJob>,
}

impl JobBatch {
    pub fn new(partition_id: u32, jobs: Vec<ActivatedJob>) -> Self {
        Self { partition_id, jobs }
    }

    pub fn keys(&self) -> Vec<JobKey> {
        self.jobs.iter().map(|job| job.key).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaultCategory {
    InvalidArgument,
    ResourceExhausted,
    NotFound,
    Unauthorized,
    Internal,
    /// Any category the gateway does not know about.
    Other(String),
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            Self::ResourceExhausted => write!(f, "RESOURCE_EXHAUSTED"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Unauthorized => write!(f, "UNAUTHORIZED"),
            Self::Internal => write!(f, "INTERNAL"),
            Self::Other(code) => write!(f, "{code}"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("broker fault {category}: {message}")]
pub struct BrokerFault {
    pub category: FaultCategory,
    pub message: String,
}

impl BrokerFault {
    pub fn new(category: FaultCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FaultCategory::Internal, message)
    }
}

/// Receives activation results from the broker's dispatch tasks.
///
/// `on_next` may be called concurrently by distinct partitions. It returns
/// `false` when the batch was dropped because the session is already terminal;
/// the producer then still owns the leases it granted.
pub trait JobSink: Send + Sync {
    fn on_next(&self, batch: JobBatch) -> bool;
    fn on_completed(&self);
    fn on_error(&self, fault: BrokerFault);
    fn is_cancelled(&self) -> bool;
}

pub type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

/// Lets the dispatch loop learn that the session no longer wants batches.
pub trait CancelRegistrar: Send + Sync {
    fn register(&self, callback: CancelCallback);
}

pub trait WorkQueueClient: Send + Sync {
    /// Fire-and-forget: returns immediately, results arrive through `sink`.
    fn activate(
        &self,
        criteria: Arc<ActivationCriteria>,
        sink: Arc<dyn JobSink>,
        cancellation: Arc<dyn CancelRegistrar>,
    );

    /// Hands back leased jobs that were never sent to the worker.
    fn defer(&self, keys: Vec<JobKey>);
}

#[cfg(test)]
mod tests {
    use super::{partition_of, BrokerFault, FaultCategory, PARTITION_KEY_SHIFT};

    #[test]
    fn partition_is_recovered_from_key_high_bits() {
        let key = (3_i64 << PARTITION_KEY_SHIFT) | 42;
        assert_eq!(partition_of(key), 3);
        assert!(key <= 9_007_199_254_740_991);

        let key = (4_i64 << PARTITION_KEY_SHIFT) | 1;
        assert_eq!(partition_of(key), 4);
        assert!(key > 9_007_199_254_740_991, "partition 4 keys exceed the JS safe integer range");
    }

    #[test]
    fn fault_display_names_category() {
        let fault = BrokerFault::new(FaultCategory::NotFound, "no such job type");
        assert_eq!(fault.to_string(), "broker fault NOT_FOUND: no such job type");

        let unknown = BrokerFault::new(FaultCategory::Other("PARTITION_LEAVING".to_owned()), "x");
        assert_eq!(unknown.category.to_string(), "PARTITION_LEAVING");
    }
}

use std::fmt::Debug;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::broker::{ActivatedJob, JobKey};

/// Representation of a key-shaped field on the wire.
pub trait WireKey: Serialize + Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Recovers the broker key, if the wire form still parses as one.
    fn to_job_key(&self) -> Option<JobKey>;
}

impl WireKey for i64 {
    fn to_job_key(&self) -> Option<JobKey> {
        Some(*self)
    }
}

impl WireKey for String {
    fn to_job_key(&self) -> Option<JobKey> {
        self.parse().ok()
    }
}

/// Wire projection of an [`ActivatedJob`]. Both encodings share this field
/// set and order; only `K` differs.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedJob<K> {
    pub key: K,
    #[serde(rename = "type")]
    pub job_type: String,
    pub process_instance_key: K,
    pub process_definition_key: K,
    pub element_instance_key: K,
    pub process_definition_id: String,
    pub process_definition_version: i32,
    pub element_id: String,
    pub worker: String,
    pub retries: i32,
    pub deadline: i64,
    pub variables: Map<String, Value>,
    pub custom_headers: Map<String, Value>,
    pub tenant_id: String,
}

pub trait JobEncoding: Send + Sync + 'static {
    type Key: WireKey;

    fn name(&self) -> &'static str;

    fn encode_key(&self, key: JobKey) -> Self::Key;

    fn encode(&self, job: &ActivatedJob) -> EncodedJob<Self::Key> {
        EncodedJob {
            key: self.encode_key(job.key),
            job_type: job.job_type.clone(),
            process_instance_key: self.encode_key(job.process_instance_key),
            process_definition_key: self.encode_key(job.process_definition_key),
            element_instance_key: self.encode_key(job.element_instance_key),
            process_definition_id: job.process_definition_id.clone(),
            process_definition_version: job.process_definition_version,
            element_id: job.element_id.clone(),
            worker: job.worker.clone(),
            retries: job.retries,
            deadline: job.deadline.timestamp_millis(),
            variables: job.variables.clone(),
            custom_headers: job.custom_headers.clone(),
            tenant_id: job.tenant_id.clone(),
        }
    }
}

/// Legacy contract: keys as JSON numbers.
#[derive(Clone, Copy, Debug, Default)]
pub struct NumericKeys;

impl JobEncoding for NumericKeys {
    type Key = i64;

    fn name(&self) -> &'static str {
        "numeric"
    }

    fn encode_key(&self, key: JobKey) -> i64 {
        key
    }
}

/// Current contract: keys as decimal strings, safe for clients whose number
/// type is an IEEE double.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringKeys;

impl JobEncoding for StringKeys {
    type Key = String;

    fn name(&self) -> &'static str {
        "string"
    }

    fn encode_key(&self, key: JobKey) -> String {
        key.to_string()
    }
}

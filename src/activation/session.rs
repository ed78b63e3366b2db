use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::activation::aggregator::{ActivationResult, ResponseAggregator};
use crate::activation::cancellation::CancellationCoordinator;
use crate::activation::criteria::ActivationCriteria;
use crate::activation::encoding::{EncodedJob, JobEncoding};
use crate::activation::problem::ProblemDetail;
use crate::broker::{CancelRegistrar, JobSink, WorkQueueClient};

#[derive(Debug, PartialEq)]
pub enum SessionOutcome<K> {
    Jobs(Vec<EncodedJob<K>>),
    Rejected(ProblemDetail),
    /// The broker did not resolve the session within the enclosing limit.
    TimedOut(Duration),
    Cancelled,
}

/// One in-flight activation request: criteria, aggregator, coordinator and
/// the completion handle the caller awaits.
pub struct ActivationSession<E: JobEncoding> {
    id: Uuid,
    criteria: Arc<ActivationCriteria>,
    aggregator: Arc<ResponseAggregator<E>>,
    cancellation: Arc<CancellationCoordinator>,
    completion: oneshot::Receiver<ActivationResult<E::Key>>,
}

impl<E: JobEncoding> ActivationSession<E> {
    pub fn new(criteria: ActivationCriteria, encoding: E) -> Self {
        let (sender, completion) = oneshot::channel();
        let cancellation = Arc::new(CancellationCoordinator::new());
        let aggregator = Arc::new(ResponseAggregator::new(
            encoding,
            sender,
            Arc::clone(&cancellation),
        ));
        Self {
            id: Uuid::new_v4(),
            criteria: Arc::new(criteria),
            aggregator,
            cancellation,
            completion,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    #[cfg(test)]
    pub fn aggregator(&self) -> &Arc<ResponseAggregator<E>> {
        &self.aggregator
    }

    /// Hands the session to the broker. Returns without waiting.
    pub fn dispatch(&self, client: &dyn WorkQueueClient) {
        tracing::debug!(
            target: "jobgate::activation",
            session = %self.id,
            job_type = self.criteria.job_type(),
            max_jobs = self.criteria.max_jobs_to_activate(),
            encoding = self.aggregator.encoding().name(),
            "dispatching activation request"
        );
        let sink: Arc<dyn JobSink> = self.aggregator.clone();
        let registrar: Arc<dyn CancelRegistrar> = self.cancellation.clone();
        client.activate(Arc::clone(&self.criteria), sink, registrar);
    }

    /// Guard that cancels the session when dropped, e.g. when the HTTP
    /// connection goes away while the handler is still awaiting.
    pub fn cancel_on_drop(&self) -> CancelOnDrop<E> {
        CancelOnDrop {
            aggregator: Some(Arc::clone(&self.aggregator)),
        }
    }

    pub async fn wait(self) -> SessionOutcome<E::Key> {
        outcome_of(self.completion.await.ok())
    }

    /// Waits at most `limit`; past that the session is cancelled and reported
    /// as timed out unless the broker resolved it in the meantime.
    pub async fn wait_for(mut self, limit: Duration) -> SessionOutcome<E::Key> {
        match tokio::time::timeout(limit, &mut self.completion).await {
            Ok(received) => outcome_of(received.ok()),
            Err(_) => {
                if self.aggregator.cancel() {
                    tracing::warn!(
                        target: "jobgate::activation",
                        session = %self.id,
                        waited_ms = limit.as_millis() as u64,
                        "activation request was not resolved in time"
                    );
                    return SessionOutcome::TimedOut(limit);
                }
                outcome_of(self.completion.try_recv().ok())
            }
        }
    }
}

fn outcome_of<K>(received: Option<ActivationResult<K>>) -> SessionOutcome<K> {
    match received {
        Some(Ok(jobs)) => SessionOutcome::Jobs(jobs),
        Some(Err(problem)) => SessionOutcome::Rejected(problem),
        None => SessionOutcome::Cancelled,
    }
}

pub struct CancelOnDrop<E: JobEncoding> {
    aggregator: Option<Arc<ResponseAggregator<E>>>,
}

impl<E: JobEncoding> CancelOnDrop<E> {
    pub fn disarm(mut self) {
        self.aggregator = None;
    }
}

impl<E: JobEncoding> Drop for CancelOnDrop<E> {
    fn drop(&mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            if aggregator.cancel() {
                tracing::debug!(
                    target: "jobgate::activation",
                    "caller went away before the activation request resolved"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::Map;

    use crate::activation::aggregator::Terminal;
    use crate::activation::criteria::{
        ActivationCriteria, ActivationRequest, LongPollingPolicy, StaticTenantResolver,
    };
    use crate::activation::encoding::NumericKeys;
    use crate::broker::{
        ActivatedJob, BrokerFault, CancelRegistrar, FaultCategory, JobBatch, JobKey, JobSink,
        WorkQueueClient,
    };

    use super::{ActivationSession, SessionOutcome};

    enum Script {
        Jobs(Vec<JobKey>),
        Fault(FaultCategory),
        Silent,
    }

    struct ScriptedClient {
        script: Script,
        parked: Mutex<Option<Arc<dyn JobSink>>>,
        cancel_seen: Arc<AtomicBool>,
    }

    impl ScriptedClient {
        fn new(script: Script) -> Self {
            Self {
                script,
                parked: Mutex::new(None),
                cancel_seen: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl WorkQueueClient for ScriptedClient {
        fn activate(
            &self,
            _criteria: Arc<ActivationCriteria>,
            sink: Arc<dyn JobSink>,
            cancellation: Arc<dyn CancelRegistrar>,
        ) {
            let seen = Arc::clone(&self.cancel_seen);
            cancellation.register(Box::new(move || seen.store(true, Ordering::SeqCst)));
            match &self.script {
                Script::Jobs(keys) => {
                    sink.on_next(JobBatch::new(1, keys.iter().copied().map(job).collect()));
                    sink.on_completed();
                }
                Script::Fault(category) => {
                    sink.on_error(BrokerFault::new(category.clone(), "scripted"));
                }
                Script::Silent => {
                    *self.parked.lock().expect("parked lock poisoned") = Some(sink);
                }
            }
        }

        fn defer(&self, _keys: Vec<JobKey>) {}
    }

    fn job(key: JobKey) -> ActivatedJob {
        ActivatedJob {
            key,
            job_type: "payment".to_owned(),
            process_instance_key: 1,
            process_definition_key: 2,
            element_instance_key: 3,
            process_definition_id: "order".to_owned(),
            process_definition_version: 1,
            element_id: "charge".to_owned(),
            worker: "w".to_owned(),
            retries: 3,
            deadline: Utc::now(),
            variables: Map::new(),
            custom_headers: Map::new(),
            tenant_id: "<default>".to_owned(),
        }
    }

    fn session() -> ActivationSession<NumericKeys> {
        let request = ActivationRequest {
            job_type: Some("payment".to_owned()),
            max_jobs_to_activate: Some(10),
            ..ActivationRequest::default()
        };
        let criteria = ActivationCriteria::from_request(
            request,
            &StaticTenantResolver::default(),
            LongPollingPolicy {
                enabled: true,
                default_timeout: Duration::from_millis(100),
            },
        )
        .expect("criteria should build");
        ActivationSession::new(criteria, NumericKeys)
    }

    #[tokio::test]
    async fn resolves_with_jobs_and_fires_coordinator() {
        let client = ScriptedClient::new(Script::Jobs(vec![5, 6]));
        let session = session();
        session.dispatch(&client);

        match session.wait().await {
            SessionOutcome::Jobs(jobs) => {
                assert_eq!(jobs.iter().map(|job| job.key).collect::<Vec<_>>(), vec![5, 6]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(client.cancel_seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn broker_fault_becomes_rejection() {
        let client = ScriptedClient::new(Script::Fault(FaultCategory::ResourceExhausted));
        let session = session();
        session.dispatch(&client);

        match session.wait().await {
            SessionOutcome::Rejected(problem) => assert_eq!(problem.status, 429),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_broker_is_timed_out_and_later_batches_are_refused() {
        let client = ScriptedClient::new(Script::Silent);
        let session = session();
        session.dispatch(&client);

        let outcome = session.wait_for(Duration::from_secs(1)).await;
        assert_eq!(outcome, SessionOutcome::TimedOut(Duration::from_secs(1)));
        assert!(client.cancel_seen.load(Ordering::SeqCst));

        let parked = client
            .parked
            .lock()
            .expect("parked lock poisoned")
            .take()
            .expect("sink parked");
        assert!(parked.is_cancelled());
        assert!(!parked.on_next(JobBatch::new(1, vec![job(1)])));
    }

    #[tokio::test]
    async fn dropping_the_guard_cancels_a_pending_session() {
        let client = ScriptedClient::new(Script::Silent);
        let session = session();
        session.dispatch(&client);
        let aggregator = Arc::clone(session.aggregator());

        drop(session.cancel_on_drop());

        assert_eq!(aggregator.terminal(), Terminal::Cancelled);
        assert!(client.cancel_seen.load(Ordering::SeqCst));
        assert_eq!(session.wait().await, SessionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn disarmed_guard_leaves_resolved_session_alone() {
        let client = ScriptedClient::new(Script::Jobs(vec![1]));
        let session = session();
        let guard = session.cancel_on_drop();
        session.dispatch(&client);

        let outcome = session.wait().await;
        guard.disarm();

        assert!(matches!(outcome, SessionOutcome::Jobs(ref jobs) if jobs.len() == 1));
    }
}

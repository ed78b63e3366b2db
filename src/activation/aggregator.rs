use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::activation::cancellation::CancellationCoordinator;
use crate::activation::encoding::{EncodedJob, JobEncoding};
use crate::activation::problem::{translate_fault, ProblemDetail};
use crate::broker::{BrokerFault, JobBatch, JobSink};

pub type ActivationResult<K> = Result<Vec<EncodedJob<K>>, ProblemDetail>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

struct AggregationState<K> {
    accumulated: Vec<EncodedJob<K>>,
    terminal: Terminal,
    completion: Option<oneshot::Sender<ActivationResult<K>>>,
}

/// Collects batches pushed by partition tasks and resolves the session's
/// completion handle exactly once.
///
/// All mutation happens under one mutex per session. `terminal` is
/// write-once: after it leaves `Pending`, batches are dropped and the
/// accumulated jobs are no longer reachable.
pub struct ResponseAggregator<E: JobEncoding> {
    encoding: E,
    state: Mutex<AggregationState<E::Key>>,
    cancellation: Arc<CancellationCoordinator>,
}

impl<E: JobEncoding> ResponseAggregator<E> {
    pub fn new(
        encoding: E,
        completion: oneshot::Sender<ActivationResult<E::Key>>,
        cancellation: Arc<CancellationCoordinator>,
    ) -> Self {
        Self {
            encoding,
            state: Mutex::new(AggregationState {
                accumulated: Vec::new(),
                terminal: Terminal::Pending,
                completion: Some(completion),
            }),
            cancellation,
        }
    }

    pub fn encoding(&self) -> &E {
        &self.encoding
    }

    #[cfg(test)]
    pub fn terminal(&self) -> Terminal {
        self.lock_state().terminal
    }

    #[cfg(test)]
    pub fn accumulated_len(&self) -> usize {
        self.lock_state().accumulated.len()
    }

    /// Resolves the session from outside the broker (client gone, enclosing
    /// timeout). Returns `false` if the session was already terminal.
    pub fn cancel(&self) -> bool {
        let dropped = {
            let mut state = self.lock_state();
            if state.terminal != Terminal::Pending {
                return false;
            }
            state.terminal = Terminal::Cancelled;
            let _ = state.completion.take();
            mem::take(&mut state.accumulated)
        };
        if !dropped.is_empty() {
            tracing::debug!(
                target: "jobgate::activation",
                dropped_jobs = dropped.len(),
                "session cancelled with undelivered jobs; they stay leased until expiry"
            );
        }
        self.cancellation.fire();
        true
    }

    fn resolve(
        &self,
        terminal: Terminal,
        outcome: impl FnOnce(Vec<EncodedJob<E::Key>>) -> ActivationResult<E::Key>,
    ) {
        let (completion, accumulated) = {
            let mut state = self.lock_state();
            if state.terminal != Terminal::Pending {
                return;
            }
            state.terminal = terminal;
            (state.completion.take(), mem::take(&mut state.accumulated))
        };

        if let Some(completion) = completion {
            if completion.send(outcome(accumulated)).is_err() {
                tracing::debug!(
                    target: "jobgate::activation",
                    ?terminal,
                    "completion handle was already dropped by the caller"
                );
            }
        }
        self.cancellation.fire();
    }

    fn lock_state(&self) -> MutexGuard<'_, AggregationState<E::Key>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: JobEncoding> JobSink for ResponseAggregator<E> {
    fn on_next(&self, batch: JobBatch) -> bool {
        let encoded = batch
            .jobs
            .iter()
            .map(|job| self.encoding.encode(job))
            .collect::<Vec<_>>();

        let mut state = self.lock_state();
        if state.terminal != Terminal::Pending {
            tracing::debug!(
                target: "jobgate::activation",
                partition_id = batch.partition_id,
                jobs = batch.jobs.len(),
                terminal = ?state.terminal,
                "dropping batch delivered after the session resolved"
            );
            return false;
        }
        state.accumulated.extend(encoded);
        true
    }

    fn on_completed(&self) {
        self.resolve(Terminal::Completed, Ok);
    }

    fn on_error(&self, fault: BrokerFault) {
        tracing::warn!(
            target: "jobgate::activation",
            category = %fault.category,
            message = %fault.message,
            "broker failed the activation request"
        );
        self.resolve(Terminal::Failed, |_discarded| Err(translate_fault(&fault)));
    }

    fn is_cancelled(&self) -> bool {
        let state = self.lock_state();
        match state.terminal {
            Terminal::Cancelled => true,
            Terminal::Pending => state
                .completion
                .as_ref()
                .is_some_and(oneshot::Sender::is_closed),
            Terminal::Completed | Terminal::Failed => false,
        }
    }
}

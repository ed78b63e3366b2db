//! Job activation bridge.
//!
//! A request becomes an [`ActivationSession`]: validated criteria, a
//! [`ResponseAggregator`] that the broker pushes batches into, and a
//! [`CancellationCoordinator`] that tells the broker to stop. The session
//! resolves exactly once, with jobs, a problem document, a timeout or a
//! cancellation.

pub mod aggregator;
pub mod cancellation;
pub mod criteria;
pub mod encoding;
pub mod problem;
pub mod session;

pub use cancellation::CancellationCoordinator;
pub use criteria::{
    ActivationCriteria, ActivationRequest, LongPollingPolicy, StaticTenantResolver,
    TenantResolver, ValidationError,
};
pub use encoding::{EncodedJob, JobEncoding, NumericKeys, StringKeys, WireKey};
pub use problem::ProblemDetail;
pub use session::{ActivationSession, SessionOutcome};

//! fileflow-core: shared building blocks for the FileFlow upload platform.
//!
//! Everything here is infrastructure the domain crates lean on: the
//! key/value configuration store, error classification, an injectable
//! clock, tenant ids and the periodic job runner.

pub mod clock;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod tenant;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, FlowConfig, FlowConfigSnapshot};
pub use errors::{Classified, ErrorKind};
pub use jobs::{spawn_periodic, JobHandle, PeriodicJob, SingleFlight, SingleFlightGuard};
pub use tenant::TenantId;

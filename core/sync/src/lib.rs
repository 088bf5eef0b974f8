//! docmirror sync engine
//!
//! This crate keeps local mirrors of remote collections up to date:
//! - Per-collection reconciliation passes with a persisted attempt history
//! - Retry with exponential backoff and per-collection circuit breakers
//! - A scheduler loop with periodic ticks, forced runs and a worker cap
//! - Local edits pushed back to the remote, with conflict tracking

pub mod circuit;
pub mod config;
pub mod engine;
pub mod events;
pub mod reconcile;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use circuit::{CircuitBreakers, CircuitConfig, CircuitState, CircuitStatus};
pub use config::MirrorConfig;
pub use engine::{CollectionStatusView, ConflictEntry, MirrorEngine, Resolution};
pub use events::{EventBus, SyncEvent};
pub use reconcile::{ReconcileReport, ReconcileSettings, Reconciler};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
pub use scheduler::{SchedulerConfig, SyncScheduler, SyncSchedulerHandle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = MirrorConfig::default();
        let _retry_config = RetryConfig::default();
        let _circuit_config = CircuitConfig::default();
        let _scheduler_config = SchedulerConfig::default();
        let _bus = EventBus::default();
    }
}

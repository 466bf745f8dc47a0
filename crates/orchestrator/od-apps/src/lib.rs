//! App supervisor: lifecycle state machine, git deploy pipeline,
//! zero-downtime redeploy, runtime port discovery, env resolution and the
//! 1 Hz watchdog reconciliation.

pub mod buildlog;
pub mod envres;
pub mod guards;
pub mod ports;
pub mod supervisor;

pub use guards::GuardSets;
pub use supervisor::{AppError, AppSupervisor, CreateGitRequest};

//! External job scheduling: admission under CPU and memory budgets,
//! process launch, channel-driven output collection, critical-path
//! progress, and the primitives that surface job stages to programs.

pub mod prims;
pub mod signal;
pub mod status;
pub mod table;
pub mod usage;

pub use prims::register_job_prims;
pub use signal::{exit_asap, install_exit_signals};
pub use status::{CriticalJob, StatusState};
pub use table::{JobCache, JobServices, JobStreams, JobTable, Task, CTOR_USAGE};
pub use usage::{Usage, DEFAULT_PHYS_USAGE};

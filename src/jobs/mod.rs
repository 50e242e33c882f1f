//! Jobs - state machines, durable event log and live fan-out
//!
//! - [`model`]: `Job`, `JobStatus`, `Event`, `EventKind`
//! - [`store`]: `JobStore` backends (memory, JSON files)
//! - [`bus`]: `JobEventBus`, the single append + broadcast path
//! - [`manager`]: `JobManager`, which drives a [`JobWork`] per job

pub mod bus;
pub mod manager;
pub mod model;
pub mod store;

pub use bus::{JobEventBus, JobEvents, Subscription};
pub use manager::{JobContext, JobManager, JobWork};
pub use model::{Event, EventKind, Job, JobStatus};
pub use store::{FileJobStore, JobStore, MemoryJobStore};

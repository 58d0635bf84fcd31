//! Data model and task store for courier.
//!
//! `models` defines the Task / Plan / Step shapes shared by every crate;
//! `store` is the authoritative in-process store, optionally fronted by a
//! Redis key-value layer (`kv`) for crash recovery and multi-instance reads.

pub mod kv;
pub mod models;
pub mod store;

pub use models::{
    Action, EventKind, ExecutorKind, OutputFormat, Plan, Step, StepStatus, Task, TaskEvent,
    TaskStatus,
};
pub use store::TaskStore;

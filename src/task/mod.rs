// src/task/mod.rs

//! Task records, the task state machine and the store that owns them.

pub mod cancel;
pub mod model;
pub mod state;
pub mod store;

pub use cancel::CancelSignal;
pub use model::{NewTask, StateRecord, StatusReason, Task};
pub use state::TaskState;
pub use store::TaskStore;

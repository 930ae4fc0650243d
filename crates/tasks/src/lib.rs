//! Task-tracking records (users and their tasks).
//!
//! These are the entity shapes stored through the repository layer. The crate
//! holds schema and small helpers only (no IO, no storage).

pub mod task;
pub mod user;

pub use task::{NewTask, Task, TaskId, TaskStatus};
pub use user::{NewUser, User, UserId};

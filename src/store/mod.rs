//! Persistent record of jobs and tasks, backed by SQLite.

pub mod db;
pub mod models;

pub use db::{MIGRATIONS, Migration, Store, StoreHandle};
pub use models::{Job, NewTask, Provenance, Task, TaskStatus, TaskType};

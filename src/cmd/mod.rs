//! CLI command implementations.
//!
//! | Module   | Commands handled                          |
//! |----------|-------------------------------------------|
//! | `run`    | `Run`, `Retry`, `Address`, `FixChecks`    |
//! | `jobs`   | `Jobs`, `Tasks`                           |
//! | `config` | `Config`                                  |

pub mod config;
pub mod jobs;
pub mod run;

pub use config::cmd_config;
pub use jobs::{cmd_jobs, cmd_tasks};
pub use run::{cmd_address, cmd_fix_checks, cmd_retry, cmd_run};

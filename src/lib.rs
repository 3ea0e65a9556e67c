pub mod cancel;
pub mod config;
pub mod errors;
pub mod executor;
pub mod generate;
pub mod git;
pub mod github;
pub mod logging;
pub mod orchestrator;
pub mod store;
pub mod util;

pub use errors::{IvanError, IvanResult};

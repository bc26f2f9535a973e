//! Compose projects
//!
//! Loads a compose file and drives its services through the container
//! manager. Parsing and validation live in [`parser`], the file model in
//! [`config`] and the verbs in [`orchestrator`].

pub mod config;
pub mod orchestrator;
pub mod parser;

pub use config::{ComposeConfig, ServiceConfig};
pub use orchestrator::{ComposeOrchestrator, DownOptions, RunOptions, UpOptions};
pub use parser::{project_name, ComposeParser};

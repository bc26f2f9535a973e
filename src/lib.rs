//! runectl - a Docker-compatible command-line client
//!
//! runectl drives a containerd-style runtime daemon the way `docker` drives
//! dockerd. The daemon only knows about containers, tasks, images and
//! snapshots; everything else lives on the client side:
//!
//! - Container lifecycle: create, run, start, stop, kill, rm and friends
//! - Spec assembly from image config, flags and host defaults
//! - CNI networking driven from OCI hooks, with `/etc/hosts` management
//! - Volumes, name reservation and the json-file/journald log drivers
//! - Registry pulls and pushes, and builds through a build daemon
//! - Compose projects ordered by the dependency sequencer

pub mod cleanup;
pub mod compose;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod logging;
pub mod network;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod sequencer;
pub mod signals;
pub mod spec;
pub mod store;
pub mod task;

pub use error::{CtlError, Result};

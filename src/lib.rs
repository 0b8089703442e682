//! Keeps the containers of a docker host on the newest version of their images.
//!
//! Stale containers are replaced in the order their links demand and rolled back
//! when the replacement does not come up.
pub mod config;
pub mod container;
pub mod docker;
pub mod graph;
#[cfg(feature = "chatterbox")]
pub mod notifications;
pub mod report;
pub mod runtime;
pub mod session;
pub mod staleness;

use crate::runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("container runtime unreachable: {0}")]
    RuntimeUnreachable(RuntimeError),
    #[error("failed to list containers: {0}")]
    ListContainers(RuntimeError),
    #[error(transparent)]
    Config(#[from] figment2::Error),
}

use crate::container::{ContainerId, RecreateSpec};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerInspectResponse, ImageInspect};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Docker(BollardError),
}

impl From<BollardError> for RuntimeError {
    fn from(error: BollardError) -> Self {
        match error {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            } => RuntimeError::Conflict(message),
            other => RuntimeError::Docker(other),
        }
    }
}

/// Which containers a session looks at.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Only list containers labelled `refit.enable=true`.
    pub label_enable: bool,
    pub include_stopped: bool,
}

// A container runtime lists, inspects and replaces containers
pub trait ContainerRuntime: Send + Sync {
    fn ping(&self) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn list_containers(
        &self,
        selection: &Selection,
    ) -> impl Future<Output = Result<Vec<ContainerInspectResponse>, RuntimeError>> + Send;

    fn inspect_container(
        &self,
        id: &ContainerId,
    ) -> impl Future<Output = Result<ContainerInspectResponse, RuntimeError>> + Send;

    /// `reference` is an image ID or a `repo:tag` name.
    fn inspect_image(
        &self,
        reference: &str,
    ) -> impl Future<Output = Result<ImageInspect, RuntimeError>> + Send;

    fn pull_image(&self, reference: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// The runtime kills the container once `timeout` passes.
    fn stop_container(
        &self,
        id: &ContainerId,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove_container(
        &self,
        id: &ContainerId,
        force: bool,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn create_container(
        &self,
        spec: &RecreateSpec,
    ) -> impl Future<Output = Result<ContainerId, RuntimeError>> + Send;

    fn start_container(
        &self,
        id: &ContainerId,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove_image(&self, id: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;
}

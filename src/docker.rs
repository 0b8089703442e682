use crate::container::{ContainerId, ENABLE_LABEL, ImageName, RecreateSpec};
use crate::runtime::{ContainerRuntime, RuntimeError, Selection};
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ImageInspect, NetworkingConfig,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RemoveImageOptions, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::time::Duration;

pub struct DockerHandler {
    docker: Docker,
}

impl DockerHandler {
    pub fn new() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

impl ContainerRuntime for DockerHandler {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let version = self.docker.ping().await?;
        trace!("docker ping: {version}");
        Ok(())
    }

    async fn list_containers(
        &self,
        selection: &Selection,
    ) -> Result<Vec<ContainerInspectResponse>, RuntimeError> {
        let mut filters = HashMap::new();
        if selection.label_enable {
            filters.insert("label".to_string(), vec![format!("{ENABLE_LABEL}=true")]);
        }
        let options = ListContainersOptions {
            all: selection.include_stopped,
            filters: Some(filters),
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;
        debug!("found {} containers", summaries.len());

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else {
                continue;
            };
            // containers may vanish between listing and inspecting
            match self
                .docker
                .inspect_container(&id, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => containers.push(inspect),
                Err(e) => error!("Error inspecting container {id}: {e}"),
            }
        }
        Ok(containers)
    }

    async fn inspect_container(
        &self,
        id: &ContainerId,
    ) -> Result<ContainerInspectResponse, RuntimeError> {
        Ok(self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await?)
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, RuntimeError> {
        Ok(self.docker.inspect_image(reference).await?)
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let image = ImageName::new(reference);
        let (image_name, image_tag) = image.split();
        info!("Pulling {image_name}:{image_tag}");

        let options = CreateImageOptions {
            from_image: Some(image_name.to_owned()),
            tag: Some(image_tag.to_owned()),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        let mut failure = None;
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(output) => {
                    trace!("{output:?}");
                    if let Some(status) = &output.status
                        && status.contains("Downloaded newer image for")
                    {
                        info!("New image pulled for {reference}");
                    }
                }
                Err(e) => {
                    error!("Error pulling image: {e:?}");
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn stop_container(&self, id: &ContainerId, timeout: Duration) -> Result<(), RuntimeError> {
        let seconds = i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX);
        let options = StopContainerOptionsBuilder::new().t(seconds).build();
        match self.docker.stop_container(id.as_str(), Some(options)).await {
            // already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            result => Ok(result?),
        }
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            v: false,
            force,
            link: false,
        };
        self.docker
            .remove_container(id.as_str(), Some(options))
            .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &RecreateSpec) -> Result<ContainerId, RuntimeError> {
        let body = create_body(spec);
        trace!(
            "create body: {}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), body).await?;
        for warning in &response.warnings {
            warn!("creating {}: {warning}", spec.name);
        }
        Ok(ContainerId::new(response.id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        let deleted = self
            .docker
            .remove_image(id, None::<RemoveImageOptions>, None)
            .await?;
        debug!("removed image {id}: {} layers", deleted.len());
        Ok(())
    }
}

fn create_body(spec: &RecreateSpec) -> ContainerCreateBody {
    let config = spec.config.clone();
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        host_config: Some(spec.host_config.clone()),
        networking_config: (!spec.networks.is_empty()).then(|| NetworkingConfig {
            endpoints_config: Some(spec.networks.clone()),
        }),
        hostname: config.hostname,
        domainname: config.domainname,
        user: config.user,
        attach_stdin: config.attach_stdin,
        attach_stdout: config.attach_stdout,
        attach_stderr: config.attach_stderr,
        exposed_ports: config.exposed_ports,
        tty: config.tty,
        open_stdin: config.open_stdin,
        stdin_once: config.stdin_once,
        env: config.env,
        cmd: config.cmd,
        healthcheck: config.healthcheck,
        args_escaped: config.args_escaped,
        volumes: config.volumes,
        working_dir: config.working_dir,
        entrypoint: config.entrypoint,
        network_disabled: config.network_disabled,
        mac_address: config.mac_address,
        on_build: config.on_build,
        labels: config.labels,
        stop_signal: config.stop_signal,
        stop_timeout: config.stop_timeout,
        shell: config.shell,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, EndpointSettings, HostConfig};

    #[test]
    fn test_create_body_carries_recreate_spec() {
        let spec = RecreateSpec {
            name: "web".to_string(),
            image: "web:latest".to_string(),
            config: ContainerConfig {
                image: Some("web:latest".to_string()),
                env: Some(vec!["MODE=prod".to_string()]),
                labels: Some(HashMap::from([("team".to_string(), "ops".to_string())])),
                shell: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                on_build: Some(vec!["RUN true".to_string()]),
                network_disabled: Some(false),
                ..Default::default()
            },
            host_config: HostConfig {
                links: Some(vec!["/db:/web/db".to_string()]),
                ..Default::default()
            },
            networks: HashMap::from([(
                "backend".to_string(),
                EndpointSettings {
                    aliases: Some(vec!["web".to_string()]),
                    ..Default::default()
                },
            )]),
        };
        let body = create_body(&spec.with_image("sha256:abc"));

        assert_eq!(body.image.as_deref(), Some("sha256:abc"));
        assert_eq!(body.env, spec.config.env);
        assert_eq!(body.labels, spec.config.labels);
        assert_eq!(body.shell, spec.config.shell);
        assert_eq!(body.on_build, spec.config.on_build);
        assert_eq!(body.network_disabled, Some(false));
        assert_eq!(
            body.networking_config
                .and_then(|n| n.endpoints_config)
                .and_then(|mut endpoints| endpoints.remove("backend"))
                .and_then(|endpoint| endpoint.aliases),
            Some(vec!["web".to_string()])
        );
        assert_eq!(
            body.host_config.and_then(|h| h.links),
            Some(vec!["/db:/web/db".to_string()])
        );
    }
}

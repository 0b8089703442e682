//! An in-memory container runtime that behaves like a docker engine for the calls refit makes.
#![allow(dead_code)]

use bollard::models::{
    ContainerConfig, ContainerInspectResponse, ContainerState, ContainerStateStatusEnum,
    EndpointSettings, Health, HealthConfig, HealthStatusEnum, HostConfig, ImageConfig,
    ImageInspect, NetworkSettings,
};
use refit::container::{ContainerId, RecreateSpec};
use refit::runtime::{ContainerRuntime, RuntimeError, Selection};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub networks: HashMap<String, EndpointSettings>,
    pub running: bool,
}

#[derive(Debug, Default)]
pub struct State {
    pub containers: Vec<FakeContainer>,
    pub images: HashMap<String, ImageInspect>,
    /// Local tags, `repo:tag` to image ID.
    pub tags: HashMap<String, String>,
    /// What a pull of `repo:tag` resolves to.
    pub registry: HashMap<String, String>,
    pub unreachable: bool,
    /// Container names.
    pub fail_stop: HashSet<String>,
    /// Container names.
    pub fail_remove: HashSet<String>,
    /// Container names whose forced removal fails.
    pub fail_force_remove: HashSet<String>,
    /// Image references as given in the create request.
    pub fail_create: HashSet<String>,
    /// Image IDs whose containers cannot be started.
    pub fail_start: HashSet<String>,
    /// Image IDs whose containers exit right after starting.
    pub exit_on_start: HashSet<String>,
    /// Health reported by running containers of an image ID.
    pub health: HashMap<String, HealthStatusEnum>,
    /// Every state changing call, e.g. `stop web`.
    pub calls: Vec<String>,
    /// Raises the flag once a call of this kind is made, e.g. `stop`.
    pub cancel_on: Option<(String, Arc<AtomicBool>)>,
    next_id: usize,
}

#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn add_image(state: &mut State, id: &str) {
        state
            .images
            .entry(id.to_string())
            .or_insert_with(|| ImageInspect {
                id: Some(id.to_string()),
                config: Some(ImageConfig::default()),
                ..Default::default()
            });
    }

    /// Tags `id` as `reference` locally and in the registry.
    pub fn image(&self, reference: &str, id: &str) {
        self.with_state(|state| {
            Self::add_image(state, id);
            state.tags.insert(reference.to_string(), id.to_string());
            state.registry.insert(reference.to_string(), id.to_string());
        });
    }

    /// Pushes a newer image for `reference` to the registry.
    pub fn publish(&self, reference: &str, id: &str) {
        self.with_state(|state| {
            Self::add_image(state, id);
            state.registry.insert(reference.to_string(), id.to_string());
        });
    }

    pub fn image_health_check(&self, id: &str, test: &[&str]) {
        self.with_state(|state| {
            if let Some(config) = state.images.get_mut(id).and_then(|i| i.config.as_mut()) {
                config.healthcheck = Some(HealthConfig {
                    test: Some(test.iter().map(|s| s.to_string()).collect()),
                    ..Default::default()
                });
            }
        });
    }

    /// Starts a container on the image `reference` resolves to, linked to `links`.
    pub fn run(&self, name: &str, reference: &str, links: &[&str]) -> String {
        let links = links
            .iter()
            .map(|target| format!("/{target}:/{name}/{target}"))
            .collect::<Vec<_>>();
        self.with_state(|state| {
            let image_id = Self::resolve(state, reference).unwrap_or_default();
            let id = Self::next_id(state);
            state.containers.push(FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                image_id,
                config: ContainerConfig {
                    image: Some(reference.to_string()),
                    env: Some(vec![format!("SERVICE={name}")]),
                    ..Default::default()
                },
                host_config: HostConfig {
                    links: (!links.is_empty()).then_some(links),
                    ..Default::default()
                },
                networks: HashMap::new(),
                running: true,
            });
            id
        })
    }

    /// Connects a container to `network` the way docker reports it, with assigned addresses
    /// and the short ID alias.
    pub fn attach(&self, name: &str, network: &str, aliases: &[&str]) {
        self.with_state(|state| {
            if let Some(container) = state.containers.iter_mut().find(|c| c.name == name) {
                let mut all_aliases: Vec<String> = aliases.iter().map(|a| a.to_string()).collect();
                all_aliases.push(container.id[..12].to_string());
                container.networks.insert(
                    network.to_string(),
                    EndpointSettings {
                        aliases: Some(all_aliases),
                        network_id: Some(format!("{network}-id")),
                        ip_address: Some("172.18.0.2".to_string()),
                        ..Default::default()
                    },
                );
            }
        });
    }

    /// Raises `flag` as soon as a call of `kind` reaches the runtime.
    pub fn cancel_on(&self, kind: &str, flag: Arc<AtomicBool>) {
        self.with_state(|state| state.cancel_on = Some((kind.to_string(), flag)));
    }

    pub fn set_label(&self, name: &str, key: &str, value: &str) {
        self.with_state(|state| {
            if let Some(container) = state.containers.iter_mut().find(|c| c.name == name) {
                container
                    .config
                    .labels
                    .get_or_insert_with(HashMap::new)
                    .insert(key.to_string(), value.to_string());
            }
        });
    }

    pub fn stop(&self, name: &str) {
        self.with_state(|state| {
            if let Some(container) = state.containers.iter_mut().find(|c| c.name == name) {
                container.running = false;
            }
        });
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.with_state(|state| state.containers.iter().find(|c| c.name == name).cloned())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|state| state.calls.clone())
    }

    /// Calls of one kind, e.g. all `stop` calls, as the names they were made for.
    pub fn calls_of(&self, kind: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| {
                call.strip_prefix(kind)
                    .and_then(|rest| rest.strip_prefix(' '))
                    .map(str::to_string)
            })
            .collect()
    }

    fn log(state: &mut State, call: String) {
        if let Some((kind, flag)) = &state.cancel_on
            && call.starts_with(&format!("{kind} "))
        {
            flag.store(true, Ordering::SeqCst);
        }
        state.calls.push(call);
    }

    fn next_id(state: &mut State) -> String {
        state.next_id += 1;
        format!("{:064x}", state.next_id)
    }

    fn find<'a>(state: &'a mut State, id: &ContainerId) -> Result<&'a mut FakeContainer, RuntimeError> {
        state
            .containers
            .iter_mut()
            .find(|c| c.id == id.as_str())
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {id}")))
    }

    fn inspect(state: &State, container: &FakeContainer) -> ContainerInspectResponse {
        let health = state
            .health
            .get(&container.image_id)
            .filter(|_| container.running)
            .map(|status| Health {
                status: Some(status.clone()),
                ..Default::default()
            });
        ContainerInspectResponse {
            id: Some(container.id.clone()),
            name: Some(format!("/{}", container.name)),
            image: Some(container.image_id.clone()),
            config: Some(container.config.clone()),
            host_config: Some(container.host_config.clone()),
            network_settings: Some(NetworkSettings {
                networks: Some(container.networks.clone()),
                ..Default::default()
            }),
            state: Some(ContainerState {
                running: Some(container.running),
                status: Some(if container.running {
                    ContainerStateStatusEnum::RUNNING
                } else {
                    ContainerStateStatusEnum::EXITED
                }),
                health,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn resolve(state: &State, reference: &str) -> Option<String> {
        state
            .tags
            .get(reference)
            .cloned()
            .or_else(|| state.images.contains_key(reference).then(|| reference.to_string()))
    }
}

impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.with_state(|state| state.unreachable) {
            return Err(RuntimeError::Failed("connection refused".to_string()));
        }
        Ok(())
    }

    async fn list_containers(
        &self,
        selection: &Selection,
    ) -> Result<Vec<ContainerInspectResponse>, RuntimeError> {
        self.with_state(|state| {
            let state = &*state;
            Ok(state
                .containers
                .iter()
                .filter(|c| c.running || selection.include_stopped)
                .filter(|c| {
                    !selection.label_enable
                        || c.config
                            .labels
                            .as_ref()
                            .and_then(|labels| labels.get("refit.enable"))
                            .is_some_and(|value| value == "true")
                })
                .map(|c| Self::inspect(state, c))
                .collect())
        })
    }

    async fn inspect_container(
        &self,
        id: &ContainerId,
    ) -> Result<ContainerInspectResponse, RuntimeError> {
        self.with_state(|state| {
            let container = Self::find(state, id)?.clone();
            Ok(Self::inspect(state, &container))
        })
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, RuntimeError> {
        self.with_state(|state| {
            Self::resolve(state, reference)
                .and_then(|id| state.images.get(&id).cloned())
                .ok_or_else(|| RuntimeError::NotFound(format!("No such image: {reference}")))
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.with_state(|state| match state.registry.get(reference).cloned() {
            Some(id) => {
                state.tags.insert(reference.to_string(), id);
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("manifest unknown: {reference}"))),
        })
    }

    async fn stop_container(&self, id: &ContainerId, _timeout: Duration) -> Result<(), RuntimeError> {
        // lets other link groups make progress, like a real stop would
        tokio::task::yield_now().await;
        self.with_state(|state| {
            let fail = state.fail_stop.clone();
            let container = Self::find(state, id)?;
            let name = container.name.clone();
            if fail.contains(&name) {
                Self::log(state, format!("stop {name}"));
                return Err(RuntimeError::Failed(format!("cannot stop {name}")));
            }
            container.running = false;
            Self::log(state, format!("stop {name}"));
            Ok(())
        })
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<(), RuntimeError> {
        self.with_state(|state| {
            let container = Self::find(state, id)?.clone();
            Self::log(state, format!("remove {}", container.name));
            if state.fail_remove.contains(&container.name)
                || (force && state.fail_force_remove.contains(&container.name))
            {
                return Err(RuntimeError::Failed(format!("cannot remove {}", container.name)));
            }
            if container.running && !force {
                return Err(RuntimeError::Conflict(format!(
                    "container {} is running",
                    container.name
                )));
            }
            state.containers.retain(|c| c.id != container.id);
            Ok(())
        })
    }

    async fn create_container(&self, spec: &RecreateSpec) -> Result<ContainerId, RuntimeError> {
        self.with_state(|state| {
            Self::log(state, format!("create {}", spec.name));
            if state.fail_create.contains(&spec.image) {
                return Err(RuntimeError::Failed(format!("cannot create {}", spec.image)));
            }
            if state.containers.iter().any(|c| c.name == spec.name) {
                return Err(RuntimeError::Conflict(format!(
                    "name {} already in use",
                    spec.name
                )));
            }
            let image_id = Self::resolve(state, &spec.image)
                .ok_or_else(|| RuntimeError::NotFound(format!("No such image: {}", spec.image)))?;
            let id = Self::next_id(state);
            state.containers.push(FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image_id,
                config: spec.config.clone(),
                host_config: spec.host_config.clone(),
                networks: spec.networks.clone(),
                running: false,
            });
            Ok(ContainerId::new(id))
        })
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            let fail_start = state.fail_start.clone();
            let exit_on_start = state.exit_on_start.clone();
            let container = Self::find(state, id)?;
            let name = container.name.clone();
            if fail_start.contains(&container.image_id) {
                Self::log(state, format!("start {name}"));
                return Err(RuntimeError::Failed(format!("cannot start {name}")));
            }
            container.running = !exit_on_start.contains(&container.image_id);
            Self::log(state, format!("start {name}"));
            Ok(())
        })
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_state(|state| {
            Self::log(state, format!("remove_image {id}"));
            if state.containers.iter().any(|c| c.image_id == id) {
                return Err(RuntimeError::Conflict(format!("image {id} is in use")));
            }
            state.images.remove(id);
            Ok(())
        })
    }
}

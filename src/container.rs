use bollard::models::{
    ContainerConfig, ContainerInspectResponse, ContainerState, ContainerStateStatusEnum,
    EndpointSettings, HealthConfig, HostConfig, ImageInspect, PortBinding,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use thiserror::Error;

pub const ENABLE_LABEL: &str = "refit.enable";
pub const MONITOR_ONLY_LABEL: &str = "refit.monitor-only";
pub const DEPENDS_ON_LABEL: &str = "refit.depends-on";
/// The `repo:tag` a container follows while it runs pinned to an image ID after a rollback.
pub const IMAGE_LABEL: &str = "refit.image";

#[derive(Debug, Error, PartialEq)]
pub enum EntityError {
    #[error("malformed inspection of container {container}: missing {field}")]
    MissingField {
        container: String,
        field: &'static str,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 12 character prefix docker uses in listings and as default hostname.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ImageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repo qualified content digest, e.g. "emrius11/example@sha256:4f2c..."
#[derive(Deserialize, Serialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ImageDigest(pub String);

impl ImageDigest {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The name of an image as used in docker in the form `repo:tag`. E.g. "emrius11/example:latest"
#[derive(Deserialize, Serialize, Debug, Clone, Hash, Eq, PartialEq)]
pub struct ImageName(pub String);

impl ImageName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn split(&self) -> (&str, &str) {
        let name = self.0.split('@').next().unwrap_or(&self.0);
        match name.rsplit_once(':') {
            // a colon followed by a slash belongs to a registry port
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (name, "latest"),
        }
    }

    /// Image IDs and digest references always resolve to the same image.
    pub fn is_pinned(&self) -> bool {
        self.0.starts_with("sha256:") || self.0.contains("@sha256:")
    }
}

impl Display for ImageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunState {
    Running,
    Restarting,
    Stopped,
    Other,
}

impl RunState {
    pub fn from_state(state: Option<&ContainerState>) -> Self {
        let Some(state) = state else {
            return RunState::Stopped;
        };
        if state.running.unwrap_or(false) {
            return RunState::Running;
        }
        if state.restarting.unwrap_or(false) {
            return RunState::Restarting;
        }
        match state.status {
            None
            | Some(ContainerStateStatusEnum::CREATED)
            | Some(ContainerStateStatusEnum::EXITED) => RunState::Stopped,
            Some(ContainerStateStatusEnum::RUNNING) => RunState::Running,
            Some(ContainerStateStatusEnum::RESTARTING) => RunState::Restarting,
            Some(_) => RunState::Other,
        }
    }
}

/// A declared legacy link, `target[:alias]`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Link {
    pub target: String,
    pub alias: Option<String>,
}

impl Link {
    /// Accepts both the docker inspect form `/db:/app/db` and the short form `db:database`.
    pub fn parse(raw: &str) -> Self {
        let (target, alias) = match raw.split_once(':') {
            Some((target, alias)) => (target, alias.rsplit('/').next()),
            None => (raw, None),
        };
        Link {
            target: target.trim_start_matches('/').to_string(),
            alias: alias.filter(|a| !a.is_empty()).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Image {
    id: ImageId,
    digests: BTreeSet<ImageDigest>,
    health_check: Option<HealthConfig>,
    env: Vec<String>,
    labels: HashMap<String, String>,
    entrypoint: Vec<String>,
    cmd: Vec<String>,
}

impl Image {
    pub fn new<D: Into<String>>(id: impl Into<String>, digests: impl IntoIterator<Item = D>) -> Self {
        Self {
            id: ImageId::new(id),
            digests: digests.into_iter().map(ImageDigest::new).collect(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &ImageId {
        &self.id
    }

    pub fn digests(&self) -> &BTreeSet<ImageDigest> {
        &self.digests
    }

    pub fn health_check(&self) -> Option<&HealthConfig> {
        self.health_check.as_ref()
    }
}

impl From<ImageInspect> for Image {
    fn from(inspect: ImageInspect) -> Self {
        let config = inspect.config.unwrap_or_default();
        Self {
            id: ImageId::new(inspect.id.unwrap_or_default()),
            digests: inspect
                .repo_digests
                .unwrap_or_default()
                .into_iter()
                .map(ImageDigest::new)
                .collect(),
            health_check: config.healthcheck,
            env: config.env.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
        }
    }
}

/// Everything needed to bring a container back after it was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecreateSpec {
    pub name: String,
    pub image: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    /// Endpoint settings per attached network.
    pub networks: HashMap<String, EndpointSettings>,
}

fn health_check_active(check: Option<&HealthConfig>) -> bool {
    check
        .and_then(|check| check.test.as_ref())
        .and_then(|test| test.first())
        .is_some_and(|kind| kind != "NONE")
}

impl RecreateSpec {
    /// Whether a container created from this spec on `image` runs a health check.
    pub fn has_health_check(&self, image: &Image) -> bool {
        health_check_active(self.config.healthcheck.as_ref().or(image.health_check()))
    }

    pub fn with_image(&self, image: impl Into<String>) -> Self {
        let image = image.into();
        let mut spec = self.clone();
        spec.config.image = Some(image.clone());
        spec.image = image;
        spec
    }
}

/// Snapshot of a container as observed at one point in time.
#[derive(Debug, Clone)]
pub struct Container {
    id: ContainerId,
    name: String,
    created: String,
    image_name: ImageName,
    image: Image,
    state: RunState,
    env: Vec<String>,
    labels: HashMap<String, String>,
    exposed_ports: BTreeSet<String>,
    port_bindings: HashMap<String, Vec<PortBinding>>,
    links: Vec<Link>,
    network_mode: Option<String>,
    networks: HashMap<String, EndpointSettings>,
    health_check: Option<HealthConfig>,
    config: ContainerConfig,
    host_config: HostConfig,
}

impl Container {
    pub fn new(info: ContainerInspectResponse, image: ImageInspect) -> Result<Self, EntityError> {
        let name = info
            .name
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let missing = |field| EntityError::MissingField {
            container: if name.is_empty() {
                "<unnamed>".to_string()
            } else {
                name.clone()
            },
            field,
        };

        let id = info
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| missing("Id"))?;
        let config = info.config.unwrap_or_default();
        let mut image_name = config
            .image
            .clone()
            .filter(|image| !image.is_empty())
            .ok_or_else(|| missing("Config.Image"))?;
        // rolled back containers run on an image ID but keep following their tag
        if image_name.starts_with("sha256:")
            && let Some(followed) = config
                .labels
                .as_ref()
                .and_then(|labels| labels.get(IMAGE_LABEL))
                .filter(|followed| !followed.is_empty())
        {
            image_name = followed.clone();
        }
        let host_config = info.host_config.unwrap_or_default();

        let port_bindings = host_config
            .port_bindings
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| (port, bindings.unwrap_or_default()))
            .collect();
        let links = host_config
            .links
            .iter()
            .flatten()
            .map(|link| Link::parse(link))
            .collect();

        Ok(Self {
            id: ContainerId::new(id),
            created: info.created.unwrap_or_default(),
            image_name: ImageName::new(image_name),
            image: image.into(),
            state: RunState::from_state(info.state.as_ref()),
            env: config.env.clone().unwrap_or_default(),
            labels: config.labels.clone().unwrap_or_default(),
            exposed_ports: config
                .exposed_ports
                .clone()
                .unwrap_or_default()
                .into_keys()
                .collect(),
            port_bindings,
            links,
            network_mode: host_config.network_mode.clone(),
            networks: info
                .network_settings
                .and_then(|settings| settings.networks)
                .unwrap_or_default(),
            health_check: config.healthcheck.clone(),
            config,
            host_config,
            name,
        })
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created(&self) -> &str {
        &self.created
    }

    pub fn image_name(&self) -> &ImageName {
        &self.image_name
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn image_id(&self) -> &ImageId {
        self.image.id()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running | RunState::Restarting)
    }

    pub fn env(&self) -> &[String] {
        &self.env
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn exposed_ports(&self) -> &BTreeSet<String> {
        &self.exposed_ports
    }

    pub fn port_bindings(&self) -> &HashMap<String, Vec<PortBinding>> {
        &self.port_bindings
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// The container's own health check, or the image default when it has none.
    pub fn health_check(&self) -> Option<&HealthConfig> {
        self.health_check.as_ref().or(self.image.health_check())
    }

    pub fn has_health_check(&self) -> bool {
        health_check_active(self.health_check())
    }

    pub fn networks(&self) -> &HashMap<String, EndpointSettings> {
        &self.networks
    }

    /// `None` when the enable label is absent or not a boolean.
    pub fn is_enabled(&self) -> Option<bool> {
        self.label(ENABLE_LABEL).and_then(|v| v.parse().ok())
    }

    pub fn is_monitor_only(&self) -> bool {
        self.label(MONITOR_ONLY_LABEL) == Some("true")
    }

    /// Names of the containers this one needs to be reachable.
    pub fn dependencies(&self) -> Vec<String> {
        let mut dependencies: Vec<String> = match self.label(DEPENDS_ON_LABEL) {
            Some(depends_on) => depends_on
                .split(',')
                .map(|name| name.trim().trim_start_matches('/'))
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            None => self.links.iter().map(|link| link.target.clone()).collect(),
        };
        if let Some(target) = self
            .network_mode
            .as_deref()
            .and_then(|mode| mode.strip_prefix("container:"))
        {
            dependencies.push(target.to_string());
        }
        dependencies
    }

    /// Configuration for recreating this container on its image reference.
    ///
    /// Values that merely repeat the image's defaults are dropped so a newer image can
    /// change them.
    pub fn recreate_spec(&self) -> RecreateSpec {
        let defaults = &self.image;
        let mut config = self.config.clone();

        if let Some(env) = config.env.take() {
            let env: Vec<String> = env
                .into_iter()
                .filter(|entry| !defaults.env.contains(entry))
                .collect();
            config.env = (!env.is_empty()).then_some(env);
        }
        if let Some(labels) = config.labels.take() {
            let labels: HashMap<String, String> = labels
                .into_iter()
                .filter(|(key, _)| key != IMAGE_LABEL)
                .filter(|(key, value)| defaults.labels.get(key) != Some(value))
                .collect();
            config.labels = (!labels.is_empty()).then_some(labels);
        }
        if config.healthcheck.is_some() && config.healthcheck == defaults.health_check {
            config.healthcheck = None;
        }
        if config.entrypoint.as_deref().unwrap_or_default() == defaults.entrypoint.as_slice() {
            config.entrypoint = None;
            if config.cmd.as_deref().unwrap_or_default() == defaults.cmd.as_slice() {
                config.cmd = None;
            }
        }
        if config.hostname.as_deref() == Some(self.id.short()) {
            config.hostname = None;
        }
        config.image = Some(self.image_name.as_str().to_string());

        RecreateSpec {
            name: self.name.clone(),
            image: self.image_name.as_str().to_string(),
            config,
            host_config: self.host_config.clone(),
            networks: self.recreate_networks(),
        }
    }

    /// User settings of each attached network. Addresses and IDs the runtime assigned
    /// are left out, as is the alias docker derives from the short container ID.
    fn recreate_networks(&self) -> HashMap<String, EndpointSettings> {
        let shared_stack = self
            .network_mode
            .as_deref()
            .is_some_and(|mode| mode == "host" || mode.starts_with("container:"));
        if shared_stack {
            return HashMap::new();
        }
        self.networks
            .iter()
            .map(|(network, endpoint)| {
                let aliases = endpoint.aliases.as_ref().map(|aliases| {
                    aliases
                        .iter()
                        .filter(|alias| alias.as_str() != self.id.short())
                        .cloned()
                        .collect::<Vec<_>>()
                });
                let settings = EndpointSettings {
                    ipam_config: endpoint.ipam_config.clone(),
                    links: endpoint.links.clone(),
                    aliases: aliases.filter(|aliases| !aliases.is_empty()),
                    driver_opts: endpoint.driver_opts.clone(),
                    ..Default::default()
                };
                (network.clone(), settings)
            })
            .collect()
    }

    /// The recreate spec pinned to the image this container runs right now.
    ///
    /// After a pull the tag already points at the new image, only the ID still names
    /// the old one.
    ///
    /// The `repo:tag` goes into [`IMAGE_LABEL`] so later sessions keep following it.
    pub fn rollback_spec(&self) -> RecreateSpec {
        let mut spec = self.recreate_spec().with_image(self.image_id().as_str());
        spec.config
            .labels
            .get_or_insert_with(HashMap::new)
            .insert(IMAGE_LABEL.to_string(), self.image_name.as_str().to_string());
        spec
    }
}

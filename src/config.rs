use crate::UpdaterError;
use crate::runtime::Selection;
use crate::session::{LinkPolicy, UpdateOptions};
use crate::staleness::Exclusions;
use figment2::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Schedule {
    /// Seconds between two update sessions. Runs once when unset.
    pub interval: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Update {
    pub stop_timeout: u64,
    /// Seconds a new container may take to become healthy. 0 only checks it runs.
    pub health_grace: u64,
    pub health_poll_interval: u64,
    pub concurrency: usize,
    pub monitor_only: bool,
    pub no_pull: bool,
    pub cleanup: bool,
    pub revive_stopped: bool,
    pub link_policy: LinkPolicy,
}

impl Default for Update {
    fn default() -> Self {
        Self {
            stop_timeout: 30,
            health_grace: 0,
            health_poll_interval: 1,
            concurrency: 4,
            monitor_only: false,
            no_pull: false,
            cleanup: false,
            revive_stopped: false,
            link_policy: LinkPolicy::Independent,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ContainerSelection {
    pub label_enable: bool,
    pub include_stopped: bool,
    /// Container names that are never updated.
    pub exclude: Vec<String>,
    /// `key=value` or `key` labels marking containers that are never updated.
    pub exclude_labels: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub schedule: Schedule,
    pub update: Update,
    pub selection: ContainerSelection,
}

impl Config {
    pub fn update_options(&self) -> UpdateOptions {
        let update = &self.update;
        UpdateOptions {
            stop_timeout: Duration::from_secs(update.stop_timeout),
            health_grace: (update.health_grace > 0)
                .then(|| Duration::from_secs(update.health_grace)),
            health_poll_interval: Duration::from_secs(update.health_poll_interval.max(1)),
            concurrency: update.concurrency.max(1),
            monitor_only: update.monitor_only,
            no_pull: update.no_pull,
            cleanup: update.cleanup,
            revive_stopped: update.revive_stopped,
            link_policy: update.link_policy,
            selection: Selection {
                label_enable: self.selection.label_enable,
                include_stopped: self.selection.include_stopped,
            },
            exclusions: Exclusions::new(
                self.selection.exclude.iter().cloned(),
                &self.selection.exclude_labels,
            ),
        }
    }
}

/// Reads `config_path` if it exists and lets `REFIT_` variables override it,
/// e.g. `REFIT_UPDATE__STOP_TIMEOUT=10`.
pub fn load_config(config_path: &Path) -> Result<Config, UpdaterError> {
    let config: Config = Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("REFIT_").split("__"))
        .extract()?;
    Ok(config)
}

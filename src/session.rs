//! One pass over the containers of a host: find stale ones and replace them in link order.
//!
//! Replacing a container means destroying it and creating a new one under the same name.
//! Once the old container is removed only its [`RecreateSpec`](crate::container::RecreateSpec)
//! remains, so every failure after that point rolls back by recreating it on the original
//! image.
use crate::UpdaterError;
use crate::container::{Container, ContainerId, Image, RunState};
use crate::graph::DependencyGraph;
use crate::report::{MalformedEntry, Outcome, ReportLog, SessionReport, SkipReason, UpdateRecord};
use crate::runtime::{ContainerRuntime, RuntimeError, Selection};
use crate::staleness::{Exclusions, Staleness, classify};
use bollard::models::{ContainerInspectResponse, HealthStatusEnum, ImageInspect};
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// What happens to a fresh container linking to a container that gets updated.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LinkPolicy {
    /// It is left alone. A failed dependency only keeps stale dependents from updating.
    #[default]
    Independent,
    /// It is recreated as well so it picks up the new dependency.
    Cascade,
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub stop_timeout: Duration,
    /// How long a new container with a health check may take to report healthy.
    pub health_grace: Option<Duration>,
    pub health_poll_interval: Duration,
    /// Upper bound for concurrent runtime calls and concurrently updated link groups.
    pub concurrency: usize,
    /// Detect and report stale containers without touching them.
    pub monitor_only: bool,
    pub no_pull: bool,
    /// Remove the images of updated containers afterwards.
    pub cleanup: bool,
    /// Start updated containers that were not running before.
    pub revive_stopped: bool,
    pub link_policy: LinkPolicy,
    pub selection: Selection,
    pub exclusions: Exclusions,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            health_grace: None,
            health_poll_interval: Duration::from_secs(1),
            concurrency: 4,
            monitor_only: false,
            no_pull: false,
            cleanup: false,
            revive_stopped: false,
            link_policy: LinkPolicy::default(),
            selection: Selection::default(),
            exclusions: Exclusions::default(),
        }
    }
}

#[derive(Debug)]
enum Verdict {
    Excluded,
    Pinned,
    Fresh,
    Stale(Image),
    Unresolved(String),
}

#[derive(Debug)]
struct Assessment {
    container: Container,
    verdict: Verdict,
}

enum Replacement<'a> {
    Update(&'a Image),
    Restart,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Stopping,
    Removing,
    Creating,
    Starting,
    Verifying,
    RollingBack,
}

pub struct UpdateSession<R: ContainerRuntime> {
    runtime: Arc<R>,
    options: UpdateOptions,
    cancelled: Arc<AtomicBool>,
}

impl<R: ContainerRuntime> UpdateSession<R> {
    pub fn new(runtime: Arc<R>, options: UpdateOptions) -> Self {
        Self {
            runtime,
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a flag that aborts the session once set. Containers already being replaced
    /// are finished, everything else is skipped.
    pub fn with_cancellation(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn concurrency(&self) -> usize {
        self.options.concurrency.max(1)
    }

    pub async fn run(&self) -> Result<SessionReport, UpdaterError> {
        self.runtime
            .ping()
            .await
            .map_err(UpdaterError::RuntimeUnreachable)?;
        let listed = self
            .runtime
            .list_containers(&self.options.selection)
            .await
            .map_err(UpdaterError::ListContainers)?;
        info!("checking {} containers for updates", listed.len());

        let (containers, malformed) = self.load(listed).await;
        let graph = DependencyGraph::build(&containers);
        let order = graph.start_order();
        if let Some(cycle) = order.cycle_members() {
            warn!("containers {cycle:?} link to each other in a cycle, ordering them by name");
        }
        debug!("start order: {:?}", order.names());

        let assessments: HashMap<String, Assessment> = stream::iter(containers)
            .map(|container| self.assess(container))
            .buffered(self.concurrency())
            .map(|assessment| (assessment.container.name().to_string(), assessment))
            .collect()
            .await;

        let log = ReportLog::default();
        stream::iter(graph.components())
            .map(|members| self.update_component(&graph, members, &assessments, &log))
            .buffer_unordered(self.concurrency())
            .collect::<Vec<()>>()
            .await;

        let report = log.finish(
            malformed,
            order.cycle_members().cloned().unwrap_or_default(),
        );
        if self.options.cleanup {
            self.cleanup(&report).await;
        }
        info!("update session finished: {report}");
        Ok(report)
    }

    async fn load(
        &self,
        listed: Vec<ContainerInspectResponse>,
    ) -> (Vec<Container>, Vec<MalformedEntry>) {
        let loaded: Vec<Result<Container, MalformedEntry>> = stream::iter(listed)
            .map(|info| self.load_one(info))
            .buffered(self.concurrency())
            .collect()
            .await;

        let mut containers = Vec::with_capacity(loaded.len());
        let mut malformed = Vec::new();
        for entry in loaded {
            match entry {
                Ok(container) => containers.push(container),
                Err(entry) => {
                    error!("skipping container {}: {}", entry.container, entry.error);
                    malformed.push(entry);
                }
            }
        }
        (containers, malformed)
    }

    async fn load_one(&self, info: ContainerInspectResponse) -> Result<Container, MalformedEntry> {
        let name = info
            .name
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let image = match info.image.as_deref() {
            Some(image_id) => self
                .runtime
                .inspect_image(image_id)
                .await
                .inspect_err(|e| warn!("{name}: cannot inspect image {image_id}: {e}"))
                .unwrap_or_else(|_| ImageInspect {
                    id: Some(image_id.to_string()),
                    ..Default::default()
                }),
            None => ImageInspect::default(),
        };
        Container::new(info, image).map_err(|e| MalformedEntry {
            container: name,
            error: e.to_string(),
        })
    }

    async fn assess(&self, container: Container) -> Assessment {
        let verdict = if self.options.exclusions.excludes(&container) {
            debug!("{}: excluded from updates", container.name());
            Verdict::Excluded
        } else if container.image_name().is_pinned() {
            debug!(
                "{}: image {} is pinned, nothing to update",
                container.name(),
                container.image_name()
            );
            Verdict::Pinned
        } else {
            match self.resolve_candidate(&container).await {
                Ok(candidate) => match classify(container.image(), &candidate) {
                    Staleness::Fresh => Verdict::Fresh,
                    Staleness::Stale => {
                        info!(
                            "{}: {} has a newer image {}",
                            container.name(),
                            container.image_name(),
                            candidate.id()
                        );
                        Verdict::Stale(candidate)
                    }
                },
                Err(e) => {
                    error!(
                        "{}: cannot resolve {}: {e}",
                        container.name(),
                        container.image_name()
                    );
                    Verdict::Unresolved(format!("resolving {} failed: {e}", container.image_name()))
                }
            }
        };
        Assessment { container, verdict }
    }

    async fn resolve_candidate(&self, container: &Container) -> Result<Image, RuntimeError> {
        let reference = container.image_name().as_str();
        if !self.options.no_pull {
            self.runtime.pull_image(reference).await?;
        }
        Ok(self.runtime.inspect_image(reference).await?.into())
    }

    /// Updates one link group. Targets are stopped dependents first, then replaced
    /// dependencies first.
    async fn update_component(
        &self,
        graph: &DependencyGraph,
        members: Vec<String>,
        assessments: &HashMap<String, Assessment>,
        log: &ReportLog,
    ) {
        let mut settled: HashMap<&str, UpdateRecord> = HashMap::new();
        let mut targets: HashMap<&str, Replacement<'_>> = HashMap::new();
        let mut restartable = Vec::new();

        for name in &members {
            let Some(Assessment { container, verdict }) = assessments.get(name) else {
                continue;
            };
            match verdict {
                Verdict::Excluded | Verdict::Pinned => {}
                Verdict::Fresh => {
                    if !container.is_monitor_only() {
                        restartable.push(name.as_str());
                    }
                }
                Verdict::Stale(candidate)
                    if self.options.monitor_only || container.is_monitor_only() =>
                {
                    let mut record = record_of(container, Outcome::Skipped(SkipReason::MonitorOnly));
                    record.new_image = Some(candidate.id().clone());
                    settled.insert(name, record);
                }
                Verdict::Stale(candidate) => {
                    targets.insert(name, Replacement::Update(candidate));
                }
                Verdict::Unresolved(error) => {
                    let mut record = record_of(container, Outcome::Failed);
                    record.error = Some(error.clone());
                    settled.insert(name, record);
                }
            }
        }

        if self.options.link_policy == LinkPolicy::Cascade && !targets.is_empty() {
            let downstream = graph.downstream(targets.keys().copied());
            for name in restartable {
                if downstream.contains(name) {
                    targets.insert(name, Replacement::Restart);
                }
            }
        }

        // dependents of containers that failed before anything was stopped are left running
        for name in &members {
            if !targets.contains_key(name.as_str()) {
                continue;
            }
            let failed_dependency = graph.dependencies(name).find(|dep| {
                settled
                    .get(dep)
                    .is_some_and(|record| record.outcome.breaks_dependents())
            });
            if let Some(dependency) = failed_dependency {
                targets.remove(name.as_str());
                let container = &assessments[name].container;
                let mut record =
                    record_of(container, Outcome::Skipped(SkipReason::DependencyFailed));
                record.error = Some(format!("dependency {dependency} failed to update"));
                settled.insert(name, record);
            }
        }

        let mut stopped: HashMap<&str, bool> = HashMap::new();
        for name in members.iter().rev() {
            if !targets.contains_key(name.as_str()) {
                continue;
            }
            let container = &assessments[name].container;
            if self.is_cancelled() {
                settled.insert(name, record_of(container, Outcome::Skipped(SkipReason::Cancelled)));
                continue;
            }
            if !container.is_running() {
                stopped.insert(name, false);
                continue;
            }
            transition(container, Step::Stopping);
            match self
                .runtime
                .stop_container(container.id(), self.options.stop_timeout)
                .await
            {
                Ok(()) => {
                    stopped.insert(name, true);
                }
                Err(e) => {
                    let mut record = record_of(container, Outcome::Failed);
                    record.error = Some(format!("stopping failed: {e}"));
                    settled.insert(name, record);
                }
            }
        }

        let mut outcomes: HashMap<&str, Outcome> = HashMap::new();
        for name in &members {
            let Some(assessment) = assessments.get(name) else {
                continue;
            };
            let container = &assessment.container;
            let record = if let Some(record) = settled.remove(name.as_str()) {
                record
            } else if let Some(&was_running) = stopped.get(name.as_str()) {
                let failed_dependency = graph
                    .dependencies(name)
                    .find(|dep| outcomes.get(dep).is_some_and(Outcome::breaks_dependents));
                match failed_dependency {
                    Some(dependency) => self.hold_back(container, dependency, was_running).await,
                    None => {
                        self.replace(container, &targets[name.as_str()], was_running)
                            .await
                    }
                }
            } else {
                record_of(container, Outcome::Fresh)
            };

            match record.outcome {
                Outcome::Fresh => debug!("{}: {}", record.name, record.outcome),
                Outcome::Updated | Outcome::Restarted | Outcome::Skipped(_) => {
                    info!("{}: {}", record.name, record.outcome)
                }
                _ => warn!(
                    "{}: {} ({})",
                    record.name,
                    record.outcome,
                    record.error.as_deref().unwrap_or_default()
                ),
            }
            outcomes.insert(name, record.outcome);
            log.append(record).await;
        }
    }

    /// A dependency failed: the stopped original comes back instead of being replaced.
    async fn hold_back(&self, container: &Container, dependency: &str, was_running: bool) -> UpdateRecord {
        let mut record = record_of(container, Outcome::Skipped(SkipReason::DependencyFailed));
        let mut error = format!("dependency {dependency} failed to update");
        if was_running
            && let Err(e) = self.runtime.start_container(container.id()).await
        {
            error.push_str(&format!("; restarting the original failed: {e}"));
        }
        record.error = Some(error);
        record
    }

    async fn replace(
        &self,
        container: &Container,
        replacement: &Replacement<'_>,
        was_running: bool,
    ) -> UpdateRecord {
        let (outcome, image) = match replacement {
            Replacement::Update(candidate) => (Outcome::Updated, *candidate),
            Replacement::Restart => (Outcome::Restarted, container.image()),
        };
        let mut record = record_of(container, outcome);
        if let Replacement::Update(candidate) = replacement {
            record.new_image = Some(candidate.id().clone());
        }
        let spec = container.recreate_spec();
        let health_checked = spec.has_health_check(image);

        transition(container, Step::Removing);
        if let Err(e) = self.runtime.remove_container(container.id(), false).await {
            return self
                .restore_stopped(container, record, was_running, format!("removing failed: {e}"))
                .await;
        }

        transition(container, Step::Creating);
        let new_id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                return self
                    .roll_back(container, record, None, was_running, format!("creating failed: {e}"))
                    .await;
            }
        };
        debug!("{}: created {}", container.name(), new_id);

        if was_running || self.options.revive_stopped {
            transition(container, Step::Starting);
            if let Err(e) = self.runtime.start_container(&new_id).await {
                return self
                    .roll_back(container, record, Some(new_id), was_running, format!("starting failed: {e}"))
                    .await;
            }
            transition(container, Step::Verifying);
            if let Err(cause) = self.verify(container, &new_id, health_checked).await {
                return self
                    .roll_back(container, record, Some(new_id), was_running, cause)
                    .await;
            }
        }

        record.new_container_id = Some(new_id);
        record
    }

    /// The old container still exists, it only has to run again.
    async fn restore_stopped(
        &self,
        container: &Container,
        mut record: UpdateRecord,
        was_running: bool,
        cause: String,
    ) -> UpdateRecord {
        transition(container, Step::RollingBack);
        if was_running
            && let Err(e) = self.runtime.start_container(container.id()).await
        {
            record.outcome = Outcome::FailedPermanently;
            record.error = Some(format!("{cause}; restarting the original failed: {e}"));
            return record;
        }
        record.outcome = Outcome::RolledBack;
        record.error = Some(cause);
        record
    }

    /// Brings back the original container after it was removed.
    ///
    /// Afterwards either the original runs again or nothing exists under its name.
    async fn roll_back(
        &self,
        container: &Container,
        mut record: UpdateRecord,
        replacement: Option<ContainerId>,
        was_running: bool,
        cause: String,
    ) -> UpdateRecord {
        transition(container, Step::RollingBack);
        warn!("{}: {cause}, rolling back to {}", container.name(), container.image_id());
        record.outcome = Outcome::FailedPermanently;

        if let Some(replacement) = replacement
            && let Err(e) = self.runtime.remove_container(&replacement, true).await
        {
            // the failed replacement still holds the name
            record.new_container_id = Some(replacement);
            record.error = Some(format!("{cause}; removing the replacement failed: {e}"));
            return record;
        }

        let original = match self.runtime.create_container(&container.rollback_spec()).await {
            Ok(id) => id,
            Err(e) => {
                record.error = Some(format!("{cause}; recreating the original failed: {e}"));
                return record;
            }
        };
        if was_running && let Err(e) = self.runtime.start_container(&original).await {
            if let Err(remove_error) = self.runtime.remove_container(&original, true).await {
                error!(
                    "{}: could not clean up rollback container {original}: {remove_error}",
                    container.name()
                );
            }
            record.error = Some(format!("{cause}; restarting the original failed: {e}"));
            return record;
        }

        record.outcome = Outcome::RolledBack;
        record.new_container_id = Some(original);
        record.error = Some(cause);
        record
    }

    /// The new container has to be running. With a grace period and a health check it
    /// also has to report healthy before the grace period ends.
    async fn verify(
        &self,
        container: &Container,
        id: &ContainerId,
        health_checked: bool,
    ) -> Result<(), String> {
        let grace = self.options.health_grace.filter(|_| health_checked);
        let deadline = grace.map(|grace| Instant::now() + grace);

        loop {
            let info = self
                .runtime
                .inspect_container(id)
                .await
                .map_err(|e| format!("inspecting the new container failed: {e}"))?;
            let state = info.state.as_ref();
            if RunState::from_state(state) != RunState::Running {
                return Err("the new container is not running".to_string());
            }
            let Some(deadline) = deadline else {
                return Ok(());
            };

            match state
                .and_then(|state| state.health.as_ref())
                .and_then(|health| health.status.as_ref())
            {
                Some(HealthStatusEnum::HEALTHY) => return Ok(()),
                Some(HealthStatusEnum::UNHEALTHY) => {
                    return Err("the new container reported unhealthy".to_string());
                }
                _ => {}
            }
            if self.is_cancelled() {
                warn!(
                    "{}: cancelled while waiting for a health signal, keeping the running container",
                    container.name()
                );
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "no healthy signal within {:?}",
                    grace.unwrap_or_default()
                ));
            }
            sleep(self.options.health_poll_interval.min(deadline - now)).await;
        }
    }

    async fn cleanup(&self, report: &SessionReport) {
        let images: BTreeSet<&str> = report
            .records()
            .iter()
            .filter(|record| record.outcome == Outcome::Updated)
            .map(|record| record.old_image.as_str())
            .filter(|image| !image.is_empty())
            .collect();
        for image in images {
            match self.runtime.remove_image(image).await {
                Ok(()) => info!("removed old image {image}"),
                Err(e) => warn!("could not remove old image {image}: {e}"),
            }
        }
    }
}

fn transition(container: &Container, step: Step) {
    debug!("{} ({}): {step:?}", container.name(), container.id().short());
}

fn record_of(container: &Container, outcome: Outcome) -> UpdateRecord {
    UpdateRecord {
        name: container.name().to_string(),
        container_id: container.id().clone(),
        image_name: container.image_name().clone(),
        outcome,
        old_image: container.image_id().clone(),
        new_image: None,
        new_container_id: None,
        error: None,
    }
}

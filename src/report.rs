use crate::container::{ContainerId, ImageId, ImageName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use tokio::sync::Mutex;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum SkipReason {
    DependencyFailed,
    Cancelled,
    MonitorOnly,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum Outcome {
    Fresh,
    Updated,
    /// Recreated on the same image because something it links to was updated.
    Restarted,
    /// Nothing destructive happened, the original container is untouched.
    Failed,
    /// The replacement failed and the original configuration runs again.
    RolledBack,
    /// Neither the replacement nor the original could be brought back. Unless
    /// `new_container_id` names a leftover replacement, nothing exists under the name.
    FailedPermanently,
    Skipped(SkipReason),
}

impl Outcome {
    /// Whether containers linking to this one must be left alone.
    pub fn breaks_dependents(&self) -> bool {
        matches!(self, Outcome::Failed | Outcome::FailedPermanently)
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Fresh => write!(f, "Up to date"),
            Outcome::Updated => write!(f, "Update Successful ✅"),
            Outcome::Restarted => write!(f, "Restarted for updated dependency"),
            Outcome::Failed => write!(f, "Update Failed ❌"),
            Outcome::RolledBack => write!(f, "Update rolled back 🔁"),
            Outcome::FailedPermanently => write!(f, "Update and rollback failed ❌"),
            Outcome::Skipped(SkipReason::DependencyFailed) => {
                write!(f, "Skipped, a dependency failed to update")
            }
            Outcome::Skipped(SkipReason::Cancelled) => write!(f, "Skipped, session cancelled"),
            Outcome::Skipped(SkipReason::MonitorOnly) => write!(f, "Update available"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UpdateRecord {
    pub name: String,
    pub container_id: ContainerId,
    pub image_name: ImageName,
    pub outcome: Outcome,
    pub old_image: ImageId,
    pub new_image: Option<ImageId>,
    pub new_container_id: Option<ContainerId>,
    pub error: Option<String>,
}

impl Display for UpdateRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "container {} ({})\nimage {} from {}",
            self.name,
            self.outcome,
            self.image_name,
            self.old_image
        )?;
        if let Some(new_image) = &self.new_image {
            write!(f, " to {new_image}")?;
        }
        if let Some(error) = &self.error {
            write!(f, "\nerror: {error}")?;
        }
        Ok(())
    }
}

/// A container that could not be turned into an entity.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MalformedEntry {
    pub container: String,
    pub error: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Counts {
    pub fresh: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Display for Counts {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} fresh, {} updated, {} failed, {} skipped",
            self.fresh, self.updated, self.failed, self.skipped
        )
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SessionReport {
    records: Vec<UpdateRecord>,
    malformed: Vec<MalformedEntry>,
    cycle_members: BTreeSet<String>,
}

impl SessionReport {
    pub fn records(&self) -> &[UpdateRecord] {
        &self.records
    }

    pub fn record(&self, name: &str) -> Option<&UpdateRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    pub fn malformed(&self) -> &[MalformedEntry] {
        &self.malformed
    }

    /// Containers whose links form a cycle; their relative order was chosen by name.
    pub fn cycle_members(&self) -> &BTreeSet<String> {
        &self.cycle_members
    }

    pub fn counts(&self) -> Counts {
        let mut counts = Counts {
            failed: self.malformed.len(),
            ..Default::default()
        };
        for record in &self.records {
            match record.outcome {
                Outcome::Fresh => counts.fresh += 1,
                Outcome::Updated | Outcome::Restarted => counts.updated += 1,
                Outcome::Failed | Outcome::RolledBack | Outcome::FailedPermanently => {
                    counts.failed += 1
                }
                Outcome::Skipped(_) => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn has_failures(&self) -> bool {
        self.counts().failed > 0
    }

    /// Everything a notification is worth sending for.
    pub fn changes(&self) -> impl Iterator<Item = &UpdateRecord> {
        self.records
            .iter()
            .filter(|record| record.outcome != Outcome::Fresh)
    }
}

impl Display for SessionReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.counts())
    }
}

/// Records of a running session. Components running concurrently append here.
#[derive(Debug, Default)]
pub(crate) struct ReportLog {
    records: Mutex<Vec<UpdateRecord>>,
}

impl ReportLog {
    pub(crate) async fn append(&self, record: UpdateRecord) {
        self.records.lock().await.push(record);
    }

    pub(crate) fn finish(
        self,
        malformed: Vec<MalformedEntry>,
        cycle_members: BTreeSet<String>,
    ) -> SessionReport {
        SessionReport {
            records: self.records.into_inner(),
            malformed,
            cycle_members,
        }
    }
}

use crate::container::{Container, Image};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum Staleness {
    Fresh,
    Stale,
}

/// Compares the image a container runs with the latest resolved image for its reference.
///
/// Digests are authoritative when both sides carry them, otherwise the image IDs are
/// compared as plain strings.
pub fn classify(current: &Image, candidate: &Image) -> Staleness {
    let fresh = if !current.digests().is_empty() && !candidate.digests().is_empty() {
        !current.digests().is_disjoint(candidate.digests())
    } else {
        current.id() == candidate.id()
    };
    if fresh {
        Staleness::Fresh
    } else {
        Staleness::Stale
    }
}

/// Containers the caller does not want updated. Excluded containers count as fresh.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    names: BTreeSet<String>,
    labels: Vec<(String, Option<String>)>,
}

impl Exclusions {
    /// `labels` entries are either `key=value` or a bare `key` matching any value.
    pub fn new(
        names: impl IntoIterator<Item = impl Into<String>>,
        labels: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        Self {
            names: names
                .into_iter()
                .map(|name| name.into().trim_start_matches('/').to_string())
                .collect(),
            labels: labels
                .into_iter()
                .map(|label| match label.as_ref().split_once('=') {
                    Some((key, value)) => (key.to_string(), Some(value.to_string())),
                    None => (label.as_ref().to_string(), None),
                })
                .collect(),
        }
    }

    pub fn excludes(&self, container: &Container) -> bool {
        if container.is_enabled() == Some(false) || self.names.contains(container.name()) {
            return true;
        }
        self.labels
            .iter()
            .any(|(key, value)| match (container.label(key), value) {
                (Some(actual), Some(expected)) => actual == expected,
                (Some(_), None) => true,
                (None, _) => false,
            })
    }
}

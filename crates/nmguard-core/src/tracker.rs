//! Interface State Tracker
//!
//! Answers "does this named connection exist, and is it running?" for a
//! fixed set of connection names. Every call re-reads the network manager:
//! snapshots are values, never cached across a state-changing operation.

use crate::port::{NetworkControl, PortError};
use std::fmt;
use tracing::debug;

/// State of one logical connection at the time of the query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub name: String,
    pub exists: bool,
    pub active: bool,
}

/// Result of one [`InterfaceStateTracker::refresh`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSnapshot {
    records: Vec<InterfaceRecord>,
}

impl InterfaceSnapshot {
    pub fn record(&self, name: &str) -> Option<&InterfaceRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Untracked names read as absent
    pub fn exists(&self, name: &str) -> bool {
        self.record(name).is_some_and(|r| r.exists)
    }

    pub fn active(&self, name: &str) -> bool {
        self.record(name).is_some_and(|r| r.active)
    }

    pub fn records(&self) -> &[InterfaceRecord] {
        &self.records
    }
}

impl fmt::Display for InterfaceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.records.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}(exists={}, active={})", r.name, r.exists, r.active)?;
        }
        Ok(())
    }
}

/// Tracks a fixed set of connection names
#[derive(Debug, Clone)]
pub struct InterfaceStateTracker {
    names: Vec<String>,
}

impl InterfaceStateTracker {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Query the network manager for the current state of every tracked name
    ///
    /// Objects that vanish between listing and introspection are skipped.
    pub fn refresh(&self, network: &dyn NetworkControl) -> Result<InterfaceSnapshot, PortError> {
        let mut records: Vec<InterfaceRecord> = self
            .names
            .iter()
            .map(|name| InterfaceRecord {
                name: name.clone(),
                exists: false,
                active: false,
            })
            .collect();

        for conn in network.list_connections()? {
            let Ok(settings) = network.connection_settings(&conn) else {
                continue;
            };
            if let Some(r) = records.iter_mut().find(|r| r.name == settings.id) {
                r.exists = true;
            }
        }

        for active in network.list_active_connections()? {
            let Ok(props) = network.active_properties(&active) else {
                continue;
            };
            if let Some(r) = records.iter_mut().find(|r| r.name == props.id) {
                r.active = true;
            }
        }

        let snapshot = InterfaceSnapshot { records };
        debug!("Tracker info: {}", snapshot);
        Ok(snapshot)
    }
}

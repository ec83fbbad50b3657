//! Worker configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::transport::{HelperSpawner, LauncherSpawner};

/// Default round-trip timeout for one helper command.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(4000);

/// Allow-list restricting which system interfaces are exposed through the
/// public API.
///
/// `All` exposes everything the helper reports; a configured empty list
/// means the same thing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ManagedInterfaces {
    #[default]
    All,
    Named(Vec<String>),
}

impl ManagedInterfaces {
    /// Build from a list of names; an empty list collapses to `All`.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            Self::All
        } else {
            Self::Named(names)
        }
    }

    pub fn is_managed(&self, ifname: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(allowed) => allowed.iter().any(|name| name == ifname),
        }
    }

    /// Intersect the helper-reported names with the allow-list, preserving
    /// the reported order.
    pub fn filter(&self, reported: Vec<String>) -> Vec<String> {
        match self {
            Self::All => reported,
            Self::Named(_) => reported
                .into_iter()
                .filter(|name| self.is_managed(name))
                .collect(),
        }
    }
}

/// Configuration for one worker instance.
pub struct WorkerConfig {
    pub(crate) spawner: Arc<dyn HelperSpawner>,
    pub(crate) call_timeout: Duration,
    pub(crate) managed: ManagedInterfaces,
}

impl WorkerConfig {
    /// Configure a worker that spawns the helper binary through the
    /// restricted-privilege launcher.
    pub fn new(launcher: impl Into<PathBuf>, helper: impl Into<PathBuf>) -> Self {
        Self::with_spawner(Arc::new(LauncherSpawner::new(launcher, helper)))
    }

    /// Configure a worker with a custom spawn strategy.
    pub fn with_spawner(spawner: Arc<dyn HelperSpawner>) -> Self {
        Self {
            spawner,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            managed: ManagedInterfaces::All,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_managed_interfaces(mut self, managed: ManagedInterfaces) -> Self {
        self.managed = managed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_passes_everything_through() {
        let managed = ManagedInterfaces::All;
        assert_eq!(
            managed.filter(names(&["eth0", "lo"])),
            names(&["eth0", "lo"])
        );
    }

    #[test]
    fn allow_list_intersects_reported_set() {
        let managed = ManagedInterfaces::from_names(["eth0", "eth1"]);
        assert_eq!(
            managed.filter(names(&["eth0", "eth1", "lo"])),
            names(&["eth0", "eth1"])
        );
    }

    #[test]
    fn empty_allow_list_means_all() {
        let managed = ManagedInterfaces::from_names(Vec::<String>::new());
        assert_eq!(managed, ManagedInterfaces::All);
        assert!(managed.is_managed("anything"));
    }

    #[test]
    fn allow_list_entries_missing_from_reported_set_are_not_invented() {
        let managed = ManagedInterfaces::from_names(["eth0", "eth9"]);
        assert_eq!(managed.filter(names(&["eth0", "lo"])), names(&["eth0"]));
    }

    #[test]
    fn default_call_timeout_is_four_seconds() {
        let config = WorkerConfig::new("/usr/lib/ifbroker/launcher", "/usr/lib/ifbroker/helper");
        assert_eq!(config.call_timeout, Duration::from_millis(4000));
    }
}

//! Execution environment.
//!
//! Built once by the binary and handed to every component by reference.
//! Components clone the `Arc`s they need; there is no global lookup.

use crate::catalog::ServerCatalog;
use crate::config::DaemonConfig;
use crate::ipv6_leak::Ipv6LeakGuard;
use crate::kill_switch::{KillSwitchManager, KillSwitchPolicy};
use crate::metadata::MetadataStore;
use crate::port::{CommandRunner, NetworkControl, SessionControl};
use crate::selection::SelectionPolicy;
use std::sync::Arc;
use tracing::warn;

pub struct Environment {
    pub network: Arc<dyn NetworkControl>,
    pub session: Arc<dyn SessionControl>,
    pub runner: Arc<dyn CommandRunner>,
    pub metadata: Arc<dyn MetadataStore>,
    pub config: DaemonConfig,
}

impl Environment {
    /// Opens the metadata backend named in `config`
    pub fn new(
        network: Arc<dyn NetworkControl>,
        session: Arc<dyn SessionControl>,
        runner: Arc<dyn CommandRunner>,
        config: DaemonConfig,
    ) -> Self {
        let metadata = config.metadata.open();
        Self {
            network,
            session,
            runner,
            metadata,
            config,
        }
    }

    pub fn kill_switch(&self) -> KillSwitchManager {
        KillSwitchManager::new(
            Arc::clone(&self.network),
            Arc::clone(&self.runner),
            self.config.interfaces.clone(),
        )
    }

    pub fn ipv6_guard(&self) -> Ipv6LeakGuard {
        Ipv6LeakGuard::new(
            Arc::clone(&self.network),
            Arc::clone(&self.runner),
            self.config.interfaces.clone(),
        )
    }

    pub fn killswitch_policy(&self) -> KillSwitchPolicy {
        self.config.killswitch
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy::from_config(&self.config)
    }

    /// The configured server cache, if there is one and it loads
    pub fn load_catalog(&self) -> Option<ServerCatalog> {
        let path = self.config.server_cache.as_ref()?;
        match ServerCatalog::load_cache(path) {
            Ok(catalog) => Some(catalog),
            Err(e) => {
                warn!("Unable to load server cache {}: {}", path.display(), e);
                None
            }
        }
    }
}

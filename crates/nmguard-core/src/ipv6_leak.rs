//! IPv6 Leak Protection
//!
//! The tunnel only carries IPv4. A dummy interface with a private IPv6
//! block, a preferred route metric and a `::1` DNS override keeps IPv6
//! traffic from leaving through the physical uplink.

use crate::config::InterfaceConfig;
use crate::connectivity::{self, ConnectivityCheckError};
use crate::nmcli::{self, DummyConnection};
use crate::port::{self, CommandRunner, NetworkControl, PortError};
use crate::tracker::InterfaceStateTracker;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LeakProtectionError {
    #[error("Unable to add IPv6 leak protection (nmcli exit code {code})")]
    Enable { code: i32 },

    #[error("Unable to remove IPv6 leak protection (nmcli exit code {code})")]
    Disable { code: i32 },

    #[error(transparent)]
    ConnectivityCheck(#[from] ConnectivityCheckError),

    #[error("Port error: {0}")]
    Port(#[from] PortError),
}

/// Manages the IPv6 guard interface
pub struct Ipv6LeakGuard {
    network: Arc<dyn NetworkControl>,
    runner: Arc<dyn CommandRunner>,
    interfaces: InterfaceConfig,
    tracker: InterfaceStateTracker,
}

impl Ipv6LeakGuard {
    pub fn new(
        network: Arc<dyn NetworkControl>,
        runner: Arc<dyn CommandRunner>,
        interfaces: InterfaceConfig,
    ) -> Self {
        let tracker = InterfaceStateTracker::new([interfaces.ipv6_guard.connection.clone()]);
        info!("Initialized IPv6 leak protection manager");
        if let Err(e) = connectivity::status(network.as_ref()) {
            warn!("Unable to read connectivity check status: {}", e);
        }
        Self {
            network,
            runner,
            interfaces,
            tracker,
        }
    }

    fn name(&self) -> &str {
        &self.interfaces.ipv6_guard.connection
    }

    /// Whether the guard interface is up
    pub fn is_active(&self) -> Result<bool, PortError> {
        Ok(self.tracker.refresh(self.network.as_ref())?.active(self.name()))
    }

    /// Bring up the guard. An instance that is already up is kept; a
    /// stale one is removed and recreated.
    pub fn enable(&self) -> Result<(), LeakProtectionError> {
        info!("Adding IPv6 leak protection");
        connectivity::ensure_disabled(self.network.as_ref())?;

        let snap = self.tracker.refresh(self.network.as_ref())?;
        if snap.exists(self.name()) && snap.active(self.name()) {
            debug!("IPv6 leak protection already active");
            return Ok(());
        }
        self.remove()?;

        let cfg = &self.interfaces;
        let args = DummyConnection::new(&cfg.ipv6_guard.interface, &cfg.ipv6_guard.connection)
            .ipv6(&cfg.ipv6_address, &cfg.ipv6_gateway)
            .set("ipv6.route-metric", cfg.ipv6_metric.to_string())
            .set("ipv6.dns-priority", cfg.dns_priority.to_string())
            .set("ipv6.ignore-auto-dns", "yes")
            .set("ipv6.dns", "::1")
            .into_args();

        let out = nmcli::run(self.runner.as_ref(), &args)?;
        if !nmcli::is_success(out.code) {
            return Err(LeakProtectionError::Enable { code: out.code });
        }
        Ok(())
    }

    /// Remove the guard, falling back to deactivating it
    pub fn disable(&self) -> Result<(), LeakProtectionError> {
        info!("Removing IPv6 leak protection");
        connectivity::ensure_disabled(self.network.as_ref())?;
        self.remove()
    }

    fn remove(&self) -> Result<(), LeakProtectionError> {
        let snap = self.tracker.refresh(self.network.as_ref())?;
        if !snap.exists(self.name()) {
            return Ok(());
        }

        let code = match nmcli::run(self.runner.as_ref(), &nmcli::delete_args(self.name())) {
            Ok(out) if nmcli::is_success(out.code) => return Ok(()),
            Ok(out) => out.code,
            Err(e) => {
                error!("Unable to run nmcli: {}", e);
                -1
            }
        };

        warn!("Deleting {} failed, deactivating instead", self.name());
        self.deactivate().map_err(|e| {
            error!("Unable to deactivate {}: {}", self.name(), e);
            LeakProtectionError::Disable { code }
        })
    }

    fn deactivate(&self) -> Result<(), PortError> {
        if !self.is_active()? {
            return Ok(());
        }
        match port::find_active_connection(self.network.as_ref(), self.name())? {
            Some(active) => self.network.deactivate(&active),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNetwork;

    const GUARD: &str = "pvpn-ipv6leak-protection";

    fn setup() -> (Arc<FakeNetwork>, Ipv6LeakGuard) {
        let net = Arc::new(FakeNetwork::new());
        let guard = Ipv6LeakGuard::new(net.clone(), net.clone(), InterfaceConfig::default());
        (net, guard)
    }

    #[test]
    fn test_enable_creates_interface() {
        let (net, guard) = setup();

        guard.enable().unwrap();

        assert!(net.is_active(GUARD));
        let cmd = net.commands().pop().unwrap();
        assert_eq!(nmcli::property(&cmd, "ifname"), Some("ipv6leakintrf0"));
        assert_eq!(nmcli::property(&cmd, "ipv6.addresses"), Some("fdeb:446c:912d:08da::/64"));
        assert_eq!(nmcli::property(&cmd, "ipv6.route-metric"), Some("95"));
        assert_eq!(nmcli::property(&cmd, "ipv6.dns"), Some("::1"));
        assert_eq!(nmcli::property(&cmd, "ipv4.method"), None);
    }

    #[test]
    fn test_enable_keeps_active_guard() {
        let (net, guard) = setup();
        net.add_dummy(GUARD, true);

        guard.enable().unwrap();

        assert!(net.commands().is_empty());
        assert!(guard.is_active().unwrap());
    }

    #[test]
    fn test_enable_recreates_stale_guard() {
        let (net, guard) = setup();
        net.add_dummy(GUARD, false);

        guard.enable().unwrap();

        let cmds = net.commands();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0][1], "delete");
        assert_eq!(cmds[1][1], "a");
        assert!(net.is_active(GUARD));
    }

    #[test]
    fn test_enable_failure() {
        let (net, guard) = setup();
        net.script_exit_code(GUARD, 1);

        assert!(matches!(guard.enable(), Err(LeakProtectionError::Enable { code: 1 })));
    }

    #[test]
    fn test_disable() {
        let (net, guard) = setup();
        net.add_dummy(GUARD, true);

        guard.disable().unwrap();
        assert!(!net.exists(GUARD));

        // Nothing left to remove
        guard.disable().unwrap();
        assert_eq!(net.commands().len(), 1);
    }

    #[test]
    fn test_disable_falls_back_to_deactivate() {
        let (net, guard) = setup();
        net.add_dummy(GUARD, true);
        net.script_exit_code(GUARD, 1);

        guard.disable().unwrap();

        assert!(net.exists(GUARD));
        assert!(!net.is_active(GUARD));
    }
}

//! Kill Switch
//!
//! System-wide kill switch built from two NetworkManager dummy interfaces:
//!
//! - **blocking**: addresses with no usable route and a DNS override;
//!   everything goes into a black hole
//! - **routed**: routes `0.0.0.0/0` minus the VPN server, so only the
//!   tunnel handshake can leave the machine
//!
//! # Choreography
//!
//! | Phase | Before | After |
//! |-------|--------|-------|
//! | pre-connection | blocking up | routed up, blocking down |
//! | post-connection | routed up | blocking up (behind the tunnel), routed gone |
//!
//! Each switch brings the new interface up before taking the old one
//! down. Both are up for exactly one step in between, and once either
//! is up there is no step with neither. Every step re-reads the
//! interface state; nothing is cached between operations.
//!
//! Setup runs as a bounded convergence loop: each round either finds the
//! expected state or applies one corrective step.

use crate::cidr;
use crate::config::InterfaceConfig;
use crate::connectivity::{self, ConnectivityCheckError};
use crate::nmcli::{self, DummyConnection};
use crate::port::{self, CommandRunner, NetworkControl, PortError, NO_OBJECT};
use crate::tracker::{InterfaceSnapshot, InterfaceStateTracker};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Convergence rounds before a setup phase gives up
pub const MAX_SETUP_ATTEMPTS: u32 = 5;

/// User's kill switch setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillSwitchPolicy {
    /// No interfaces are ever created
    #[default]
    Disabled,
    /// Armed while connecting, torn down after disconnect
    Soft,
    /// Never torn down, even with no tunnel
    Hard,
}

impl KillSwitchPolicy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, KillSwitchPolicy::Disabled)
    }
}

impl fmt::Display for KillSwitchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KillSwitchPolicy::Disabled => "disabled",
            KillSwitchPolicy::Soft => "soft",
            KillSwitchPolicy::Hard => "hard",
        };
        f.write_str(s)
    }
}

/// Which setup loop ran out of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    PreConnection,
    PostConnection,
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupPhase::PreConnection => f.write_str("pre-connection"),
            SetupPhase::PostConnection => f.write_str("post-connection"),
        }
    }
}

/// Kill switch errors
#[derive(Debug, thiserror::Error)]
pub enum KillSwitchError {
    #[error("Unable to create {connection} (nmcli exit code {code})")]
    Create { connection: String, code: i32 },

    #[error("Unable to activate {0}")]
    Activate(String),

    #[error("Unable to deactivate {0}")]
    Deactivate(String),

    #[error("Unable to delete {0}")]
    Delete(String),

    #[error(transparent)]
    ConnectivityCheck(#[from] ConnectivityCheckError),

    #[error("Kill switch {0} setup did not converge")]
    SetupExhausted(SetupPhase),

    #[error("Routed interface is missing during post-connection setup")]
    RoutedMissing,

    #[error("Port error: {0}")]
    Port(#[from] PortError),
}

/// Drives the blocking and routed interfaces
pub struct KillSwitchManager {
    network: Arc<dyn NetworkControl>,
    runner: Arc<dyn CommandRunner>,
    interfaces: InterfaceConfig,
    tracker: InterfaceStateTracker,
}

impl KillSwitchManager {
    pub fn new(
        network: Arc<dyn NetworkControl>,
        runner: Arc<dyn CommandRunner>,
        interfaces: InterfaceConfig,
    ) -> Self {
        let tracker = InterfaceStateTracker::new([
            interfaces.blocking.connection.clone(),
            interfaces.routed.connection.clone(),
        ]);
        info!("Initialized kill switch manager");
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

    fn blocking(&self) -> &str {
        &self.interfaces.blocking.connection
    }

    fn routed(&self) -> &str {
        &self.interfaces.routed.connection
    }

    /// Current state of both interfaces
    pub fn snapshot(&self) -> Result<InterfaceSnapshot, PortError> {
        self.tracker.refresh(self.network.as_ref())
    }

    fn prepare(&self) -> Result<InterfaceSnapshot, KillSwitchError> {
        connectivity::ensure_disabled(self.network.as_ref())?;
        Ok(self.snapshot()?)
    }

    /// Restrict traffic to `server_ip` while the tunnel is being set up
    pub fn arm_before_connect(&self, server_ip: Ipv4Addr) -> Result<(), KillSwitchError> {
        info!("Kill switch: pre-connection setup for {}", server_ip);
        self.prepare()?;
        let (ks, routed) = (self.blocking(), self.routed());

        for attempt in 0..MAX_SETUP_ATTEMPTS {
            let snap = self.snapshot()?;
            debug!(attempt, "Pre-connection round: {}", snap);

            if snap.active(ks) && !snap.exists(routed) {
                info!("Pre-connection: switching from blocking to routed");
                self.create_routed(server_ip)?;
                self.deactivate(ks)?;
                return Ok(());
            }
            if !snap.active(ks) && snap.active(routed) {
                info!("Pre-connection: routed interface already up");
                return Ok(());
            }

            if snap.exists(routed) && snap.active(routed) {
                self.delete(routed)?;
            }
            if snap.exists(ks) {
                self.activate(ks)?;
            } else {
                self.create_blocking()?;
            }
        }

        error!("Pre-connection setup gave up after {} attempts", MAX_SETUP_ATTEMPTS);
        Err(KillSwitchError::SetupExhausted(SetupPhase::PreConnection))
    }

    /// Put the blocking interface behind the now-active tunnel
    pub fn arm_after_connect(&self) -> Result<(), KillSwitchError> {
        info!("Kill switch: post-connection setup");
        self.prepare()?;
        self.converge_post_connection(false)
    }

    /// Bring up the blocking interface without a tunnel
    pub fn enable_soft(&self) -> Result<(), KillSwitchError> {
        info!("Kill switch: soft activation");
        self.prepare()?;
        self.create_blocking()?;
        self.converge_post_connection(true)
    }

    fn converge_post_connection(&self, soft: bool) -> Result<(), KillSwitchError> {
        let (ks, routed) = (self.blocking(), self.routed());

        for attempt in 0..MAX_SETUP_ATTEMPTS {
            let snap = self.snapshot()?;
            debug!(attempt, soft, "Post-connection round: {}", snap);

            if !snap.active(ks) && snap.active(routed) {
                info!("Post-connection: switching from routed to blocking");
                self.activate(ks)?;
                self.delete(routed)?;
                return Ok(());
            }
            if soft && (!snap.active(routed) || !snap.exists(routed)) {
                self.activate(ks)?;
                return Ok(());
            }
            if snap.active(ks) && (!snap.exists(routed) || !snap.active(routed)) {
                info!("Post-connection: blocking interface already up");
                return Ok(());
            }

            if snap.active(ks) {
                self.deactivate(ks)?;
            }
            if snap.exists(routed) {
                self.activate(routed)?;
            } else {
                error!("Routed interface not found during post-connection setup");
                return Err(KillSwitchError::RoutedMissing);
            }
        }

        error!("Post-connection setup gave up after {} attempts", MAX_SETUP_ATTEMPTS);
        Err(KillSwitchError::SetupExhausted(SetupPhase::PostConnection))
    }

    /// Apply a policy change made outside of a connection
    ///
    /// `Hard` brings the blocking interface up, then removes routed;
    /// `Soft` and `Disabled` remove both interfaces.
    pub fn set_mode(&self, policy: KillSwitchPolicy) -> Result<(), KillSwitchError> {
        info!("Kill switch: set mode {}", policy);
        let snap = self.prepare()?;

        match policy {
            KillSwitchPolicy::Hard => {
                if snap.exists(self.blocking()) {
                    self.activate(self.blocking())?;
                } else {
                    self.create_blocking()?;
                }
                if let Err(e) = self.delete(self.routed()) {
                    warn!("Ignoring routed interface removal failure: {}", e);
                }
                Ok(())
            }
            KillSwitchPolicy::Soft | KillSwitchPolicy::Disabled => self.remove_interfaces(),
        }
    }

    /// Remove both interfaces. Absent interfaces are left alone.
    pub fn disable(&self) -> Result<(), KillSwitchError> {
        info!("Kill switch: disable");
        self.prepare()?;
        self.remove_interfaces()
    }

    fn remove_interfaces(&self) -> Result<(), KillSwitchError> {
        self.delete(self.blocking())?;
        self.delete(self.routed())
    }

    fn create_blocking(&self) -> Result<(), KillSwitchError> {
        let cfg = &self.interfaces;
        let args = self
            .common_dns(
                DummyConnection::new(&cfg.blocking.interface, &cfg.blocking.connection)
                    .ipv4(&cfg.ipv4_address, Some(&cfg.ipv4_gateway))
                    .ipv6(&cfg.ipv6_address, &cfg.ipv6_gateway)
                    .set("ipv4.route-metric", cfg.blocking_metric.to_string())
                    .set("ipv6.route-metric", cfg.blocking_metric.to_string()),
            )
            .into_args();
        self.create(self.blocking(), &args).map_err(|code| KillSwitchError::Create {
            connection: self.blocking().to_string(),
            code,
        })
    }

    fn create_routed(&self, server_ip: Ipv4Addr) -> Result<(), KillSwitchError> {
        let routes = cidr::join(&cidr::everything_except(server_ip));
        let cfg = &self.interfaces;
        let base = || DummyConnection::new(&cfg.routed.interface, &cfg.routed.connection);
        let metrics = |b: DummyConnection| {
            b.set("ipv4.route-metric", cfg.routed_metric.to_string())
                .set("ipv6.route-metric", cfg.routed_metric.to_string())
        };

        let with_routes = self
            .common_dns(
                metrics(
                    base()
                        .ipv4(&cfg.ipv4_address, None)
                        .ipv6(&cfg.ipv6_address, &cfg.ipv6_gateway),
                )
                .set("ipv4.routes", routes.as_str()),
            )
            .into_args();

        let code = match self.create(self.routed(), &with_routes) {
            Ok(()) => return Ok(()),
            Err(code) => code,
        };
        if code != nmcli::RC_INVALID_ARGUMENT {
            return Err(KillSwitchError::Create {
                connection: self.routed().to_string(),
                code,
            });
        }

        // Some NetworkManager versions reject long route lists; carry the
        // excluded networks as addresses instead
        warn!("Route list rejected, retrying routed interface with address list");
        let with_addresses = self
            .common_dns(metrics(
                base()
                    .ipv4(&routes, None)
                    .ipv6(&cfg.ipv6_address, &cfg.ipv6_gateway),
            ))
            .into_args();
        self.create(self.routed(), &with_addresses)
            .map_err(|code| KillSwitchError::Create {
                connection: self.routed().to_string(),
                code,
            })
    }

    fn common_dns(&self, builder: DummyConnection) -> DummyConnection {
        let priority = self.interfaces.dns_priority.to_string();
        builder
            .set("ipv4.dns-priority", priority.as_str())
            .set("ipv6.dns-priority", priority)
            .set("ipv4.ignore-auto-dns", "yes")
            .set("ipv6.ignore-auto-dns", "yes")
            .set("ipv4.dns", "0.0.0.0")
            .set("ipv6.dns", "::1")
    }

    /// Run a create command unless `name` already exists. `Err` carries
    /// the exit code.
    fn create(&self, name: &str, args: &[String]) -> Result<(), i32> {
        match self.snapshot() {
            Ok(snap) if snap.exists(name) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                error!("Unable to read interface state before creating {}: {}", name, e);
                return Err(-1);
            }
        }
        match nmcli::run(self.runner.as_ref(), args) {
            Ok(out) if nmcli::is_success(out.code) => Ok(()),
            Ok(out) => Err(out.code),
            Err(e) => {
                error!("Unable to run nmcli for {}: {}", name, e);
                Err(-1)
            }
        }
    }

    fn activate(&self, name: &str) -> Result<(), KillSwitchError> {
        let snap = self.snapshot()?;
        if !snap.exists(name) || snap.active(name) {
            return Ok(());
        }
        let Some(conn) = port::find_connection(self.network.as_ref(), name)? else {
            return Ok(());
        };
        match self.network.activate(&conn, NO_OBJECT, NO_OBJECT) {
            Ok(Some(active)) => {
                debug!("Activated {} as {}", name, active);
                Ok(())
            }
            Ok(None) => {
                error!("Network manager returned no active connection for {}", name);
                Err(KillSwitchError::Activate(name.to_string()))
            }
            Err(e) => {
                error!("Unable to activate {}: {}", name, e);
                Err(KillSwitchError::Activate(name.to_string()))
            }
        }
    }

    fn deactivate(&self, name: &str) -> Result<(), KillSwitchError> {
        if !self.snapshot()?.active(name) {
            return Ok(());
        }
        let Some(active) = port::find_active_connection(self.network.as_ref(), name)? else {
            return Ok(());
        };
        self.network.deactivate(&active).map_err(|e| {
            error!("Unable to deactivate {}: {}", name, e);
            KillSwitchError::Deactivate(name.to_string())
        })
    }

    fn delete(&self, name: &str) -> Result<(), KillSwitchError> {
        if !self.snapshot()?.exists(name) {
            return Ok(());
        }
        let out = nmcli::run(self.runner.as_ref(), &nmcli::delete_args(name))?;
        if nmcli::is_success(out.code) {
            Ok(())
        } else {
            Err(KillSwitchError::Delete(name.to_string()))
        }
    }
}

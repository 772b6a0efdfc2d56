//! System Ports
//!
//! The core never talks to the OS directly. Everything it needs from
//! NetworkManager, systemd-logind and the process table goes through
//! the three traits in this module:
//!
//! - [`NetworkControl`]: connection CRUD, activation and signals
//! - [`SessionControl`]: session state, lock/sleep/shutdown signals, inhibitors
//! - [`CommandRunner`]: the subprocess call used to add/remove dummy interfaces
//!
//! The daemon binary provides D-Bus backed implementations; tests use the
//! in-memory fakes from the `testing` module.

use crate::state::DaemonEvent;
use crossbeam_channel::Sender;
use std::fmt;
use std::net::IpAddr;
use std::process::Command;
use tracing::debug;

/// Path of a connection settings object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

/// Path of an active connection object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActiveId(pub String);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ActiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The "no object" path, used for device and specific-object arguments
pub const NO_OBJECT: &str = "/";

/// Settings of a stored connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// `connection.id`
    pub id: String,
    /// `connection.type` ("vpn", "dummy", "802-3-ethernet", ...)
    pub kind: String,
    /// `vpn.data.dev` for VPN connections
    pub vpn_device: Option<String>,
}

/// NMActiveConnectionState values we care about
pub mod active_state {
    pub const ACTIVATING: u32 = 1;
    pub const ACTIVATED: u32 = 2;
}

/// Properties of an active connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveProperties {
    pub id: String,
    pub kind: String,
    /// NMActiveConnectionState
    pub state: u32,
    /// Settings object this active connection was started from
    pub connection: ConnectionId,
    /// Carries the IPv4 default route
    pub default4: bool,
    /// Carries the IPv6 default route
    pub default6: bool,
}

/// Global NetworkManager properties
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalProperties {
    /// NMState
    pub state: u32,
    pub connectivity_check_available: bool,
    pub connectivity_check_enabled: bool,
}

/// NMState value for full (global) connectivity
pub const NM_STATE_CONNECTED_GLOBAL: u32 = 70;

/// Tunnel connection to be added to the network manager
///
/// Only the data the core owns is carried here; turning it into a
/// protocol-specific profile is the port's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: String,
    pub device: String,
    pub remote: IpAddr,
    pub domain: String,
    pub protocol: String,
    pub username: String,
    pub password: String,
}

/// Signals emitted by network manager objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
    /// Global `StateChanged(u32)` on the manager object
    StateChanged,
    /// `VpnStateChanged(u32, u32)` on an active VPN connection
    VpnStateChanged,
}

/// Signals emitted by the current login session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Lock,
    Unlock,
}

/// Signals emitted by the login manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerSignal {
    PrepareForShutdown,
    PrepareForSleep,
}

/// Port errors
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Access to the OS network manager
pub trait NetworkControl: Send + Sync {
    fn list_connections(&self) -> Result<Vec<ConnectionId>, PortError>;

    fn list_active_connections(&self) -> Result<Vec<ActiveId>, PortError>;

    fn connection_settings(&self, id: &ConnectionId) -> Result<ConnectionSettings, PortError>;

    fn active_properties(&self, id: &ActiveId) -> Result<ActiveProperties, PortError>;

    /// Activate a stored connection. `None` means the manager returned
    /// an empty path.
    fn activate(
        &self,
        connection: &ConnectionId,
        device: &str,
        specific_object: &str,
    ) -> Result<Option<ActiveId>, PortError>;

    fn deactivate(&self, active: &ActiveId) -> Result<(), PortError>;

    fn delete(&self, connection: &ConnectionId) -> Result<(), PortError>;

    fn create(&self, spec: &TunnelSpec) -> Result<ConnectionId, PortError>;

    /// Forward `signal` emitted by `object` into `sink`.
    /// `object` is ignored for manager-wide signals.
    fn subscribe(
        &self,
        object: &str,
        signal: NetworkSignal,
        sink: Sender<DaemonEvent>,
    ) -> Result<(), PortError>;

    fn global_properties(&self) -> Result<GlobalProperties, PortError>;

    fn set_connectivity_check(&self, enabled: bool) -> Result<(), PortError>;
}

/// Properties of the current login session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProperties {
    /// "active", "online" or "closing"
    pub state: String,
}

impl SessionProperties {
    pub fn is_active(&self) -> bool {
        self.state == "active"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InhibitKind {
    Sleep,
    Shutdown,
}

impl InhibitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InhibitKind::Sleep => "sleep",
            InhibitKind::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InhibitMode {
    Block,
    Delay,
}

impl InhibitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InhibitMode::Block => "block",
            InhibitMode::Delay => "delay",
        }
    }
}

/// Backend handle behind an [`InhibitorLock`]
pub trait InhibitHandle: Send {
    fn release(self: Box<Self>) -> Result<(), PortError>;
}

/// An inhibitor lock held on behalf of the daemon
///
/// Releasing consumes the lock, so it can only happen once.
pub struct InhibitorLock {
    kind: InhibitKind,
    handle: Box<dyn InhibitHandle>,
}

impl InhibitorLock {
    pub fn new(kind: InhibitKind, handle: Box<dyn InhibitHandle>) -> Self {
        Self { kind, handle }
    }

    pub fn kind(&self) -> InhibitKind {
        self.kind
    }

    pub fn release(self) -> Result<(), PortError> {
        debug!("Releasing {} inhibitor lock", self.kind.as_str());
        self.handle.release()
    }
}

impl fmt::Debug for InhibitorLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InhibitorLock({})", self.kind.as_str())
    }
}

/// Access to the login manager
pub trait SessionControl: Send + Sync {
    fn session_properties(&self) -> Result<SessionProperties, PortError>;

    fn subscribe_session(
        &self,
        signal: SessionSignal,
        sink: Sender<DaemonEvent>,
    ) -> Result<(), PortError>;

    fn subscribe_manager(
        &self,
        signal: ManagerSignal,
        sink: Sender<DaemonEvent>,
    ) -> Result<(), PortError>;

    fn inhibit(
        &self,
        kind: InhibitKind,
        who: &str,
        why: &str,
        mode: InhibitMode,
    ) -> Result<InhibitorLock, PortError>;
}

/// Result of a finished subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs a program to completion
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, PortError>;
}

/// [`CommandRunner`] backed by `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, PortError> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            // Killed by a signal: report as a generic failure
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Find a stored connection by its `connection.id`
pub fn find_connection(
    network: &dyn NetworkControl,
    name: &str,
) -> Result<Option<ConnectionId>, PortError> {
    for conn in network.list_connections()? {
        match network.connection_settings(&conn) {
            Ok(settings) if settings.id == name => return Ok(Some(conn)),
            Ok(_) => {}
            Err(e) => debug!("Skipping connection {}: {}", conn, e),
        }
    }
    Ok(None)
}

/// Find the active connection whose id is `name`
pub fn find_active_connection(
    network: &dyn NetworkControl,
    name: &str,
) -> Result<Option<ActiveId>, PortError> {
    for active in network.list_active_connections()? {
        match network.active_properties(&active) {
            Ok(props) if props.id == name => return Ok(Some(active)),
            Ok(_) => {}
            Err(e) => debug!("Skipping active connection {}: {}", active, e),
        }
    }
    Ok(None)
}

/// Find the stored VPN connection bound to the virtual `device`
pub fn find_tunnel_connection(
    network: &dyn NetworkControl,
    device: &str,
) -> Result<Option<ConnectionId>, PortError> {
    for conn in network.list_connections()? {
        let settings = match network.connection_settings(&conn) {
            Ok(settings) => settings,
            Err(e) => {
                debug!("Skipping connection {}: {}", conn, e);
                continue;
            }
        };
        if settings.kind == "vpn" && settings.vpn_device.as_deref() == Some(device) {
            return Ok(Some(conn));
        }
    }
    Ok(None)
}

/// Find the active VPN connection bound to `device`, with its state
pub fn find_active_tunnel(
    network: &dyn NetworkControl,
    device: &str,
) -> Result<Option<(ActiveId, ActiveProperties)>, PortError> {
    for active in network.list_active_connections()? {
        let props = match network.active_properties(&active) {
            Ok(props) => props,
            Err(e) => {
                debug!("Skipping active connection {}: {}", active, e);
                continue;
            }
        };
        if props.kind != "vpn" {
            continue;
        }
        let settings = match network.connection_settings(&props.connection) {
            Ok(settings) => settings,
            Err(_) => continue,
        };
        if settings.vpn_device.as_deref() == Some(device) {
            return Ok(Some((active, props)));
        }
    }
    Ok(None)
}

/// The active connection that carries the default route
pub fn primary_connection(
    network: &dyn NetworkControl,
) -> Result<Option<(ActiveId, ActiveProperties)>, PortError> {
    for active in network.list_active_connections()? {
        match network.active_properties(&active) {
            Ok(props) if props.default4 || props.default6 => return Ok(Some((active, props))),
            Ok(_) => {}
            Err(e) => debug!("Skipping active connection {}: {}", active, e),
        }
    }
    Ok(None)
}

//! Tunnel states and daemon events.

use std::fmt;

/// VPN tunnel state (NMVpnConnectionState)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VpnState {
    Unknown,
    PreparingToConnect,
    NeedsCredentials,
    BeingEstablished,
    GettingIpAddress,
    Active,
    Failed,
    Disconnected,
}

impl VpnState {
    /// Decode a NetworkManager state code. Unknown codes map to `Unknown`.
    pub fn from_u32(code: u32) -> Self {
        match code {
            1 => VpnState::PreparingToConnect,
            2 => VpnState::NeedsCredentials,
            3 => VpnState::BeingEstablished,
            4 => VpnState::GettingIpAddress,
            5 => VpnState::Active,
            6 => VpnState::Failed,
            7 => VpnState::Disconnected,
            _ => VpnState::Unknown,
        }
    }

    /// Check if the tunnel is up
    pub fn is_active(&self) -> bool {
        matches!(self, VpnState::Active)
    }

    /// Check if this state ends a connection attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VpnState::Active | VpnState::Failed | VpnState::Disconnected
        )
    }
}

impl fmt::Display for VpnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Reason attached to a tunnel state change (NMVpnConnectionStateReason)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VpnStateReason {
    Unknown,
    NotProvided,
    UserDisconnected,
    DeviceDisconnected,
    ServiceStopped,
    IpConfigInvalid,
    ConnectTimeout,
    ServiceStartTimeout,
    ServiceStartFailed,
    NoSecrets,
    LoginFailed,
    ConnectionRemoved,
    MasterFailed,
    DeviceLinkFailed,
    DeviceDisappeared,
}

impl VpnStateReason {
    pub fn from_u32(code: u32) -> Self {
        match code {
            1 => VpnStateReason::NotProvided,
            2 => VpnStateReason::UserDisconnected,
            3 => VpnStateReason::DeviceDisconnected,
            4 => VpnStateReason::ServiceStopped,
            5 => VpnStateReason::IpConfigInvalid,
            6 => VpnStateReason::ConnectTimeout,
            7 => VpnStateReason::ServiceStartTimeout,
            8 => VpnStateReason::ServiceStartFailed,
            9 => VpnStateReason::NoSecrets,
            10 => VpnStateReason::LoginFailed,
            11 => VpnStateReason::ConnectionRemoved,
            12 => VpnStateReason::MasterFailed,
            13 => VpnStateReason::DeviceLinkFailed,
            14 => VpnStateReason::DeviceDisappeared,
            _ => VpnStateReason::Unknown,
        }
    }
}

/// Everything the reconnect supervisor reacts to
///
/// Port subscriptions push these into the daemon's channel; the loop
/// handles them one at a time in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// The monitored tunnel changed state
    VpnStateChanged {
        state: VpnState,
        reason: VpnStateReason,
    },
    /// Global network state changed (NMState code)
    NetworkStateChanged(u32),
    SessionLocked,
    SessionUnlocked,
    /// `true` when shutdown is about to start
    PrepareForShutdown(bool),
    /// `true` before sleep, `false` after resume
    PrepareForSleep(bool),
    /// Scheduled reconnect attempt is due
    RetryActivation,
}

impl DaemonEvent {
    pub fn vpn(state: u32, reason: u32) -> Self {
        DaemonEvent::VpnStateChanged {
            state: VpnState::from_u32(state),
            reason: VpnStateReason::from_u32(reason),
        }
    }
}

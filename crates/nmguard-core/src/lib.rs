//! nmguard core - NetworkManager VPN client engine
//!
//! Keeps a single tunnel connection alive and stops traffic from leaking
//! around it. Everything talks to the system through the ports in
//! [`port`], so the whole engine runs against in-memory fakes in tests.
//!
//! # Architecture
//!
//! ```text
//!  logind signals     NetworkManager signals
//!        │                    │
//!        ▼                    ▼
//! ┌──────────────────────────────────────────┐
//! │   ReconnectSupervisor (one event loop)   │
//! └──────┬───────────────┬───────────────┬───┘
//!        │               │               │
//!        ▼               ▼               ▼
//! ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//! │ Kill switch │ │ IPv6 guard  │ │  Metadata   │
//! │ (2 dummies) │ │ (1 dummy)   │ │   store     │
//! └──────┬──────┘ └──────┬──────┘ └─────────────┘
//!        └───────┬───────┘
//!                ▼
//!          nmcli / D-Bus
//! ```
//!
//! # Features
//!
//! - **Kill switch**: blocking and routed dummy interfaces with
//!   make-before-break transitions
//! - **IPv6 leak guard**: blackholes IPv6 while the tunnel is up
//! - **Reconnect supervisor**: bounded retries, suspend/shutdown inhibitors
//! - **Server catalog**: tier-aware selection over the cached server list

pub mod catalog;
pub mod cidr;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod ipv6_leak;
pub mod kill_switch;
pub mod metadata;
pub mod nmcli;
pub mod port;
pub mod reconnector;
pub mod selection;
pub mod servers;
pub mod state;
pub mod tracker;

#[cfg(test)]
pub mod testing;

pub use catalog::ServerCatalog;
pub use client::{ClientError, ConnectionClient, ConnectionTarget, Credentials};
pub use config::{ConfigError, DaemonConfig, InterfaceConfig};
pub use context::Environment;
pub use ipv6_leak::{Ipv6LeakGuard, LeakProtectionError};
pub use kill_switch::{KillSwitchError, KillSwitchManager, KillSwitchPolicy};
pub use metadata::{MetadataBackend, MetadataError, MetadataStore};
pub use port::{
    CommandRunner, InhibitHandle, InhibitKind, InhibitMode, InhibitorLock, NetworkControl,
    PortError, SessionControl, SystemCommandRunner,
};
pub use reconnector::{ActivationError, ReconnectState, ReconnectSupervisor};
pub use selection::{SelectionPolicy, ServerQuery};
pub use servers::{Features, LogicalServer, PhysicalServer, ServerListError};
pub use state::{DaemonEvent, VpnState, VpnStateReason};

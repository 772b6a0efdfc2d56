//! systemd-logind adapter

use super::{bus_error, forward, get_property, proxy};
use crossbeam_channel::Sender;
use nmguard_core::port::{
    InhibitHandle, InhibitKind, InhibitMode, InhibitorLock, ManagerSignal, PortError,
    SessionControl, SessionProperties, SessionSignal,
};
use nmguard_core::state::DaemonEvent;
use tracing::{debug, info};
use zbus::blocking::Connection;
use zbus::zvariant::{OwnedFd, OwnedObjectPath};

const LOGIN1_BUS: &str = "org.freedesktop.login1";
const LOGIN1_PATH: &str = "/org/freedesktop/login1";
const MANAGER_IFACE: &str = "org.freedesktop.login1.Manager";
const SESSION_IFACE: &str = "org.freedesktop.login1.Session";

/// Resolves to the caller's session, or the user's display session
const AUTO_SESSION_PATH: &str = "/org/freedesktop/login1/session/auto";

/// [`SessionControl`] over the logind D-Bus API
pub struct Login1Port {
    conn: Connection,
    session: String,
}

impl Login1Port {
    /// Resolve the current session once; signals are only emitted on the
    /// real session object, not on the `auto` alias.
    pub fn new(conn: Connection) -> Result<Self, PortError> {
        let id: String = get_property(&conn, LOGIN1_BUS, AUTO_SESSION_PATH, SESSION_IFACE, "Id")?;
        let path: OwnedObjectPath = proxy(&conn, LOGIN1_BUS, LOGIN1_PATH.to_string(), MANAGER_IFACE)?
            .call("GetSession", &(id.as_str(),))
            .map_err(bus_error)?;
        info!("Using login session {} ({})", id, path.as_str());

        Ok(Self {
            conn,
            session: path.as_str().to_string(),
        })
    }
}

/// The inhibitor is held for as long as its file descriptor stays open
struct FdInhibitor(OwnedFd);

impl InhibitHandle for FdInhibitor {
    fn release(self: Box<Self>) -> Result<(), PortError> {
        drop(self.0);
        Ok(())
    }
}

impl SessionControl for Login1Port {
    fn session_properties(&self) -> Result<SessionProperties, PortError> {
        let state = get_property(&self.conn, LOGIN1_BUS, &self.session, SESSION_IFACE, "State")?;
        Ok(SessionProperties { state })
    }

    fn subscribe_session(
        &self,
        signal: SessionSignal,
        sink: Sender<DaemonEvent>,
    ) -> Result<(), PortError> {
        let (name, event) = match signal {
            SessionSignal::Lock => ("Lock", DaemonEvent::SessionLocked),
            SessionSignal::Unlock => ("Unlock", DaemonEvent::SessionUnlocked),
        };
        let signals = proxy(&self.conn, LOGIN1_BUS, self.session.clone(), SESSION_IFACE)?
            .receive_signal(name)
            .map_err(bus_error)?;
        forward(name.to_lowercase(), signals, sink, move |_| Ok(event.clone()))
    }

    fn subscribe_manager(
        &self,
        signal: ManagerSignal,
        sink: Sender<DaemonEvent>,
    ) -> Result<(), PortError> {
        let name = match signal {
            ManagerSignal::PrepareForShutdown => "PrepareForShutdown",
            ManagerSignal::PrepareForSleep => "PrepareForSleep",
        };
        let signals = proxy(&self.conn, LOGIN1_BUS, LOGIN1_PATH.to_string(), MANAGER_IFACE)?
            .receive_signal(name)
            .map_err(bus_error)?;
        forward(name.to_string(), signals, sink, move |msg| {
            let start: bool = msg.body().deserialize()?;
            Ok(match signal {
                ManagerSignal::PrepareForShutdown => DaemonEvent::PrepareForShutdown(start),
                ManagerSignal::PrepareForSleep => DaemonEvent::PrepareForSleep(start),
            })
        })
    }

    fn inhibit(
        &self,
        kind: InhibitKind,
        who: &str,
        why: &str,
        mode: InhibitMode,
    ) -> Result<InhibitorLock, PortError> {
        debug!(what = kind.as_str(), mode = mode.as_str(), "Inhibit");
        let fd: OwnedFd = proxy(&self.conn, LOGIN1_BUS, LOGIN1_PATH.to_string(), MANAGER_IFACE)?
            .call("Inhibit", &(kind.as_str(), who, why, mode.as_str()))
            .map_err(bus_error)?;
        Ok(InhibitorLock::new(kind, Box::new(FdInhibitor(fd))))
    }
}

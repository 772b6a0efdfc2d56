//! In-memory ports for tests.
//!
//! [`FakeNetwork`] is both the network manager and the `nmcli` runner, so
//! interfaces created through commands show up in connection listings
//! exactly like they would on a real system.

use crate::config::DaemonConfig;
use crate::context::Environment;
use crate::metadata::MetadataBackend;
use crate::nmcli;
use crate::port::{
    active_state, ActiveId, ActiveProperties, CommandOutput, CommandRunner, ConnectionId,
    ConnectionSettings, GlobalProperties, InhibitHandle, InhibitKind, InhibitMode, InhibitorLock,
    ManagerSignal, NetworkControl, NetworkSignal, PortError, SessionControl, SessionProperties,
    SessionSignal, TunnelSpec, NM_STATE_CONNECTED_GLOBAL,
};
use crate::state::DaemonEvent;
use crossbeam_channel::Sender;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

struct FakeConnection {
    path: ConnectionId,
    settings: ConnectionSettings,
    active: Option<ActiveId>,
    state: u32,
    default_route: bool,
}

#[derive(Default)]
struct NetInner {
    next: u32,
    connections: Vec<FakeConnection>,
    global: GlobalProperties,
    check_sticky: bool,
    check_writes: usize,
    scripted: HashMap<String, VecDeque<i32>>,
    commands: Vec<Vec<String>>,
    history: Vec<Vec<(String, bool)>>,
    subscriptions: Vec<(String, NetworkSignal, Sender<DaemonEvent>)>,
    failing_activations: HashSet<String>,
    empty_activations: HashSet<String>,
    tunnel_activation_state: u32,
    created: Vec<TunnelSpec>,
    activations: Vec<(String, String)>,
}

impl NetInner {
    fn next_path(&mut self, prefix: &str) -> String {
        self.next += 1;
        format!("/org/freedesktop/NetworkManager/{}/{}", prefix, self.next)
    }

    fn add(&mut self, settings: ConnectionSettings, active: bool, state: u32) -> ConnectionId {
        let path = ConnectionId(self.next_path("Settings"));
        let active = active.then(|| ActiveId(self.next_path("ActiveConnection")));
        self.connections.push(FakeConnection {
            path: path.clone(),
            settings,
            active,
            state,
            default_route: false,
        });
        self.record();
        path
    }

    fn by_name(&mut self, name: &str) -> Option<&mut FakeConnection> {
        self.connections.iter_mut().find(|c| c.settings.id == name)
    }

    fn record(&mut self) {
        let step = self
            .connections
            .iter()
            .map(|c| (c.settings.id.clone(), c.active.is_some()))
            .collect();
        self.history.push(step);
    }
}

/// In-memory network manager and `nmcli`
pub struct FakeNetwork {
    inner: Mutex<NetInner>,
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNetwork {
    pub fn new() -> Self {
        let inner = NetInner {
            global: GlobalProperties {
                state: NM_STATE_CONNECTED_GLOBAL,
                connectivity_check_available: true,
                connectivity_check_enabled: false,
            },
            tunnel_activation_state: active_state::ACTIVATING,
            ..Default::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetInner> {
        self.inner.lock().unwrap()
    }

    pub fn add_dummy(&self, name: &str, active: bool) -> ConnectionId {
        let settings = ConnectionSettings {
            id: name.to_string(),
            kind: "dummy".to_string(),
            vpn_device: None,
        };
        self.lock().add(settings, active, active_state::ACTIVATED)
    }

    /// Physical uplink; `default_route` makes it the primary connection
    pub fn add_ethernet(&self, name: &str, default_route: bool) -> ActiveId {
        let mut inner = self.lock();
        let settings = ConnectionSettings {
            id: name.to_string(),
            kind: "802-3-ethernet".to_string(),
            vpn_device: None,
        };
        inner.add(settings, true, active_state::ACTIVATED);
        let conn = inner.by_name(name).unwrap();
        conn.default_route = default_route;
        conn.active.clone().unwrap()
    }

    /// Make `name` carry (or stop carrying) the default route
    pub fn set_default_route(&self, name: &str, default_route: bool) {
        if let Some(conn) = self.lock().by_name(name) {
            conn.default_route = default_route;
        }
    }

    /// Stored, inactive VPN profile bound to `device`
    pub fn add_tunnel(&self, name: &str, device: &str) -> ConnectionId {
        let settings = ConnectionSettings {
            id: name.to_string(),
            kind: "vpn".to_string(),
            vpn_device: Some(device.to_string()),
        };
        self.lock().add(settings, false, active_state::ACTIVATING)
    }

    /// State given to VPN connections when they are activated
    pub fn set_tunnel_activation_state(&self, state: u32) {
        self.lock().tunnel_activation_state = state;
    }

    pub fn set_active_state(&self, name: &str, state: u32) {
        if let Some(conn) = self.lock().by_name(name) {
            conn.state = state;
        }
    }

    /// Bring a connection up or down behind the daemon's back
    pub fn set_active(&self, name: &str, active: bool) {
        let mut inner = self.lock();
        let path = inner.next_path("ActiveConnection");
        if let Some(conn) = inner.by_name(name) {
            conn.active = active.then(|| ActiveId(path));
        }
        inner.record();
    }

    pub fn remove(&self, name: &str) {
        let mut inner = self.lock();
        inner.connections.retain(|c| c.settings.id != name);
        inner.record();
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().by_name(name).is_some()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active_id(name).is_some()
    }

    pub fn active_id(&self, name: &str) -> Option<ActiveId> {
        self.lock().by_name(name).and_then(|c| c.active.clone())
    }

    /// The next `nmcli` command targeting `name` exits with `code` and
    /// has no effect
    pub fn script_exit_code(&self, name: &str, code: i32) {
        self.lock()
            .scripted
            .entry(name.to_string())
            .or_default()
            .push_back(code);
    }

    /// Activating `name` fails with a bus error
    pub fn fail_activation(&self, name: &str) {
        self.lock().failing_activations.insert(name.to_string());
    }

    /// Activating `name` returns an empty path
    pub fn empty_activation(&self, name: &str) {
        self.lock().empty_activations.insert(name.to_string());
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.lock().commands.clone()
    }

    /// Active flags of `names` after every state change, in order
    pub fn history_of(&self, names: &[&str]) -> Vec<Vec<bool>> {
        self.lock()
            .history
            .iter()
            .map(|step| {
                names
                    .iter()
                    .map(|n| step.iter().any(|(name, active)| name == n && *active))
                    .collect()
            })
            .collect()
    }

    pub fn set_connectivity_check_state(&self, enabled: bool, available: bool) {
        let mut inner = self.lock();
        inner.global.connectivity_check_enabled = enabled;
        inner.global.connectivity_check_available = available;
    }

    /// Writes to the connectivity check are ignored
    pub fn set_connectivity_check_sticky(&self, sticky: bool) {
        self.lock().check_sticky = sticky;
    }

    pub fn connectivity_check_writes(&self) -> usize {
        self.lock().check_writes
    }

    pub fn subscriptions(&self) -> Vec<(String, NetworkSignal)> {
        self.lock()
            .subscriptions
            .iter()
            .map(|(o, s, _)| (o.clone(), *s))
            .collect()
    }

    /// Deliver `event` to every sink subscribed to `signal`
    pub fn emit(&self, signal: NetworkSignal, event: DaemonEvent) -> usize {
        let inner = self.lock();
        let mut sent = 0;
        for (_, s, sink) in inner.subscriptions.iter() {
            if *s == signal && sink.send(event.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub fn created_tunnels(&self) -> Vec<TunnelSpec> {
        self.lock().created.clone()
    }

    /// `(connection id, specific object)` of every activation
    pub fn activations(&self) -> Vec<(String, String)> {
        self.lock().activations.clone()
    }
}

impl NetworkControl for FakeNetwork {
    fn list_connections(&self) -> Result<Vec<ConnectionId>, PortError> {
        Ok(self.lock().connections.iter().map(|c| c.path.clone()).collect())
    }

    fn list_active_connections(&self) -> Result<Vec<ActiveId>, PortError> {
        Ok(self
            .lock()
            .connections
            .iter()
            .filter_map(|c| c.active.clone())
            .collect())
    }

    fn connection_settings(&self, id: &ConnectionId) -> Result<ConnectionSettings, PortError> {
        self.lock()
            .connections
            .iter()
            .find(|c| &c.path == id)
            .map(|c| c.settings.clone())
            .ok_or_else(|| PortError::NotFound(id.to_string()))
    }

    fn active_properties(&self, id: &ActiveId) -> Result<ActiveProperties, PortError> {
        self.lock()
            .connections
            .iter()
            .find(|c| c.active.as_ref() == Some(id))
            .map(|c| ActiveProperties {
                id: c.settings.id.clone(),
                kind: c.settings.kind.clone(),
                state: c.state,
                connection: c.path.clone(),
                default4: c.default_route,
                default6: false,
            })
            .ok_or_else(|| PortError::NotFound(id.to_string()))
    }

    fn activate(
        &self,
        connection: &ConnectionId,
        _device: &str,
        specific_object: &str,
    ) -> Result<Option<ActiveId>, PortError> {
        let mut inner = self.lock();
        let path = ActiveId(inner.next_path("ActiveConnection"));
        let tunnel_state = inner.tunnel_activation_state;
        let name = inner
            .connections
            .iter()
            .find(|c| &c.path == connection)
            .map(|c| c.settings.id.clone())
            .ok_or_else(|| PortError::NotFound(connection.to_string()))?;
        if inner.failing_activations.contains(&name) {
            return Err(PortError::Bus(format!("cannot activate {}", name)));
        }
        let empty = inner.empty_activations.contains(&name);

        let conn = inner.by_name(&name).unwrap();
        if conn.settings.kind == "vpn" {
            conn.state = tunnel_state;
        }
        let result = if empty {
            None
        } else {
            Some(conn.active.get_or_insert(path).clone())
        };
        inner.activations.push((name, specific_object.to_string()));
        inner.record();
        Ok(result)
    }

    fn deactivate(&self, active: &ActiveId) -> Result<(), PortError> {
        let mut inner = self.lock();
        let conn = inner
            .connections
            .iter_mut()
            .find(|c| c.active.as_ref() == Some(active))
            .ok_or_else(|| PortError::NotFound(active.to_string()))?;
        conn.active = None;
        inner.record();
        Ok(())
    }

    fn delete(&self, connection: &ConnectionId) -> Result<(), PortError> {
        let mut inner = self.lock();
        let before = inner.connections.len();
        inner.connections.retain(|c| &c.path != connection);
        if inner.connections.len() == before {
            return Err(PortError::NotFound(connection.to_string()));
        }
        inner.record();
        Ok(())
    }

    fn create(&self, spec: &TunnelSpec) -> Result<ConnectionId, PortError> {
        let mut inner = self.lock();
        inner.created.push(spec.clone());
        let settings = ConnectionSettings {
            id: spec.name.clone(),
            kind: "vpn".to_string(),
            vpn_device: Some(spec.device.clone()),
        };
        Ok(inner.add(settings, false, active_state::ACTIVATING))
    }

    fn subscribe(
        &self,
        object: &str,
        signal: NetworkSignal,
        sink: Sender<DaemonEvent>,
    ) -> Result<(), PortError> {
        self.lock()
            .subscriptions
            .push((object.to_string(), signal, sink));
        Ok(())
    }

    fn global_properties(&self) -> Result<GlobalProperties, PortError> {
        Ok(self.lock().global)
    }

    fn set_connectivity_check(&self, enabled: bool) -> Result<(), PortError> {
        let mut inner = self.lock();
        inner.check_writes += 1;
        if !inner.check_sticky {
            inner.global.connectivity_check_enabled = enabled;
        }
        Ok(())
    }
}

impl CommandRunner for FakeNetwork {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, PortError> {
        let mut inner = self.lock();
        inner.commands.push(args.to_vec());
        let output = |code: i32| CommandOutput {
            code,
            stdout: String::new(),
            stderr: String::new(),
        };

        if program != nmcli::NMCLI {
            return Ok(output(127));
        }
        let Some(name) = nmcli::target_connection(args).map(str::to_string) else {
            return Ok(output(1));
        };
        if let Some(code) = inner.scripted.get_mut(&name).and_then(|q| q.pop_front()) {
            return Ok(output(code));
        }

        match args.get(1).map(String::as_str) {
            Some("a") => {
                let settings = ConnectionSettings {
                    id: name,
                    kind: "dummy".to_string(),
                    vpn_device: None,
                };
                inner.add(settings, true, active_state::ACTIVATED);
                Ok(output(0))
            }
            Some("delete") => {
                if inner.by_name(&name).is_none() {
                    return Ok(output(nmcli::RC_NOT_FOUND));
                }
                inner.connections.retain(|c| c.settings.id != name);
                inner.record();
                Ok(output(0))
            }
            _ => Ok(output(1)),
        }
    }
}

struct SessionInner {
    state: String,
    session_subs: Vec<(SessionSignal, Sender<DaemonEvent>)>,
    manager_subs: Vec<(ManagerSignal, Sender<DaemonEvent>)>,
    inhibits: Vec<(InhibitKind, InhibitMode)>,
    fail_release: bool,
}

/// In-memory login manager
pub struct FakeSession {
    inner: Mutex<SessionInner>,
    released: Arc<Mutex<Vec<InhibitKind>>>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: "active".to_string(),
                session_subs: Vec::new(),
                manager_subs: Vec::new(),
                inhibits: Vec::new(),
                fail_release: false,
            }),
            released: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_state(&self, state: &str) {
        self.inner.lock().unwrap().state = state.to_string();
    }

    /// Releasing locks handed out from now on fails
    pub fn fail_release(&self, fail: bool) {
        self.inner.lock().unwrap().fail_release = fail;
    }

    pub fn inhibited(&self) -> Vec<(InhibitKind, InhibitMode)> {
        self.inner.lock().unwrap().inhibits.clone()
    }

    pub fn released(&self) -> Vec<InhibitKind> {
        self.released.lock().unwrap().clone()
    }

    pub fn session_subscriptions(&self) -> Vec<SessionSignal> {
        let inner = self.inner.lock().unwrap();
        inner.session_subs.iter().map(|(s, _)| *s).collect()
    }

    pub fn manager_subscriptions(&self) -> Vec<ManagerSignal> {
        let inner = self.inner.lock().unwrap();
        inner.manager_subs.iter().map(|(s, _)| *s).collect()
    }

    /// Deliver `event` to sinks subscribed to the session `signal`
    pub fn emit_session(&self, signal: SessionSignal, event: DaemonEvent) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .session_subs
            .iter()
            .filter(|(s, sink)| *s == signal && sink.send(event.clone()).is_ok())
            .count()
    }

    /// Deliver `event` to sinks subscribed to the manager `signal`
    pub fn emit_manager(&self, signal: ManagerSignal, event: DaemonEvent) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .manager_subs
            .iter()
            .filter(|(s, sink)| *s == signal && sink.send(event.clone()).is_ok())
            .count()
    }
}

impl SessionControl for FakeSession {
    fn session_properties(&self) -> Result<SessionProperties, PortError> {
        Ok(SessionProperties {
            state: self.inner.lock().unwrap().state.clone(),
        })
    }

    fn subscribe_session(
        &self,
        signal: SessionSignal,
        sink: Sender<DaemonEvent>,
    ) -> Result<(), PortError> {
        self.inner.lock().unwrap().session_subs.push((signal, sink));
        Ok(())
    }

    fn subscribe_manager(
        &self,
        signal: ManagerSignal,
        sink: Sender<DaemonEvent>,
    ) -> Result<(), PortError> {
        self.inner.lock().unwrap().manager_subs.push((signal, sink));
        Ok(())
    }

    fn inhibit(
        &self,
        kind: InhibitKind,
        _who: &str,
        _why: &str,
        mode: InhibitMode,
    ) -> Result<InhibitorLock, PortError> {
        let mut inner = self.inner.lock().unwrap();
        inner.inhibits.push((kind, mode));
        let handle = FakeInhibit {
            kind,
            fail: inner.fail_release,
            released: Arc::clone(&self.released),
        };
        Ok(InhibitorLock::new(kind, Box::new(handle)))
    }
}

struct FakeInhibit {
    kind: InhibitKind,
    fail: bool,
    released: Arc<Mutex<Vec<InhibitKind>>>,
}

impl InhibitHandle for FakeInhibit {
    fn release(self: Box<Self>) -> Result<(), PortError> {
        if self.fail {
            return Err(PortError::Bus("inhibitor already gone".to_string()));
        }
        self.released.lock().unwrap().push(self.kind);
        Ok(())
    }
}

/// Environment over fresh fakes with an in-memory metadata store
pub fn environment(mut config: DaemonConfig) -> (Arc<FakeNetwork>, Arc<FakeSession>, Environment) {
    config.metadata = MetadataBackend::Memory;
    let net = Arc::new(FakeNetwork::new());
    let session = Arc::new(FakeSession::new());
    let env = Environment::new(net.clone(), session.clone(), net.clone(), config);
    (net, session, env)
}

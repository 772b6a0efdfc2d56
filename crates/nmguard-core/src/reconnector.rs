//! Reconnect Supervisor
//!
//! Long-running state machine that keeps the tunnel up. Every signal the
//! daemon listens to ends up as a [`DaemonEvent`] on one channel, and the
//! loop handles them one at a time in arrival order:
//!
//! | Event | Reaction |
//! |-------|----------|
//! | tunnel `Active` | reset counter, IPv6 guard, kill switch post-connection |
//! | tunnel `Disconnected` by the user | tear down and stop the loop |
//! | tunnel `Failed` / `Disconnected` | schedule a retry, up to `max_attempts` |
//! | network connected globally | activation attempt |
//! | session lock / unlock | suppress / resume reconnection |
//! | prepare for shutdown | best-effort teardown, release shutdown lock |
//! | prepare for sleep | treat as locked, release sleep lock |
//!
//! Retries are deadlines kept by the loop; the loop sleeps on the channel
//! until the earliest one. Nothing in here propagates an error past the
//! loop: failures are logged and become `Failed` transitions.

use crate::catalog::ServerCatalog;
use crate::context::Environment;
use crate::ipv6_leak::Ipv6LeakGuard;
use crate::kill_switch::{KillSwitchError, KillSwitchManager, KillSwitchPolicy};
use crate::metadata::{MetadataError, MetadataStore};
use crate::port::{
    self, active_state, ActiveId, InhibitKind, InhibitMode, InhibitorLock, ManagerSignal,
    NetworkControl, NetworkSignal, PortError, SessionControl, SessionSignal,
    NM_STATE_CONNECTED_GLOBAL, NO_OBJECT,
};
use crate::state::{DaemonEvent, VpnState, VpnStateReason};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const INHIBIT_WHO: &str = "nmguard";

/// Why an activation attempt did not start a tunnel
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("No active base connection to tunnel over")]
    NoBaseConnection,

    #[error("No tunnel connection for device {0}")]
    NoTunnelConnection(String),

    #[error("Activation returned no active connection")]
    EmptyActivation,

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Kill switch error: {0}")]
    KillSwitch(#[from] KillSwitchError),

    #[error("Port error: {0}")]
    Port(#[from] PortError),
}

impl ActivationError {
    /// Nothing to start yet; polling again later may succeed
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ActivationError::NoBaseConnection | ActivationError::NoTunnelConnection(_)
        )
    }
}

/// Retry bookkeeping, owned by the loop
#[derive(Debug)]
pub struct ReconnectState {
    pub failed_attempts: u32,
    /// 0 = unlimited
    pub max_attempts: u32,
    pub delay: Duration,
    pub session_locked: bool,
    suspend_lock: Option<InhibitorLock>,
    shutdown_lock: Option<InhibitorLock>,
}

impl ReconnectState {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            failed_attempts: 0,
            max_attempts,
            delay,
            session_locked: false,
            suspend_lock: None,
            shutdown_lock: None,
        }
    }

    pub fn suspend_inhibited(&self) -> bool {
        self.suspend_lock.is_some()
    }

    pub fn shutdown_inhibited(&self) -> bool {
        self.shutdown_lock.is_some()
    }

    fn can_retry(&self) -> bool {
        self.max_attempts == 0 || self.failed_attempts < self.max_attempts
    }

    fn lock_slot(&mut self, kind: InhibitKind) -> &mut Option<InhibitorLock> {
        match kind {
            InhibitKind::Sleep => &mut self.suspend_lock,
            InhibitKind::Shutdown => &mut self.shutdown_lock,
        }
    }
}

pub struct ReconnectSupervisor {
    network: Arc<dyn NetworkControl>,
    session: Arc<dyn SessionControl>,
    metadata: Arc<dyn MetadataStore>,
    kill_switch: KillSwitchManager,
    ipv6_guard: Ipv6LeakGuard,
    catalog: Option<ServerCatalog>,
    policy: KillSwitchPolicy,
    ipv6_leak_protection: bool,
    virtual_device: String,
    state: ReconnectState,
    /// Pending retry deadlines
    retries: Vec<Instant>,
    /// Active tunnels we already listen on
    listening: HashSet<ActiveId>,
    tx: Sender<DaemonEvent>,
    rx: Receiver<DaemonEvent>,
}

impl ReconnectSupervisor {
    pub fn new(env: &Environment) -> Self {
        let config = &env.config;
        info!(
            device = %config.virtual_device,
            max_attempts = config.max_attempts,
            delay_ms = config.retry_delay_ms,
            "Initializing reconnect supervisor"
        );
        let (tx, rx) = unbounded();

        Self {
            network: Arc::clone(&env.network),
            session: Arc::clone(&env.session),
            metadata: Arc::clone(&env.metadata),
            kill_switch: env.kill_switch(),
            ipv6_guard: env.ipv6_guard(),
            catalog: env.load_catalog(),
            policy: config.killswitch,
            ipv6_leak_protection: config.ipv6_leak_protection,
            virtual_device: config.virtual_device.clone(),
            state: ReconnectState::new(config.max_attempts, config.retry_delay()),
            retries: Vec::new(),
            listening: HashSet::new(),
            tx,
            rx,
        }
    }

    /// Sink for events from outside the port subscriptions
    pub fn sender(&self) -> Sender<DaemonEvent> {
        self.tx.clone()
    }

    pub fn state(&self) -> &ReconnectState {
        &self.state
    }

    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Subscribe to every signal, take the inhibitor locks and make the
    /// first activation attempt
    pub fn start(&mut self) -> Result<(), PortError> {
        self.session
            .subscribe_session(SessionSignal::Lock, self.tx.clone())?;
        self.session
            .subscribe_session(SessionSignal::Unlock, self.tx.clone())?;
        self.session
            .subscribe_manager(ManagerSignal::PrepareForShutdown, self.tx.clone())?;
        self.session
            .subscribe_manager(ManagerSignal::PrepareForSleep, self.tx.clone())?;
        self.network
            .subscribe(NO_OBJECT, NetworkSignal::StateChanged, self.tx.clone())?;

        self.take_inhibitor(InhibitKind::Sleep);
        self.take_inhibitor(InhibitKind::Shutdown);

        self.state.session_locked = match self.session.session_properties() {
            Ok(props) => !props.is_active(),
            Err(e) => {
                warn!("Unable to read session state, assuming unlocked: {}", e);
                false
            }
        };
        info!(locked = self.state.session_locked, "Session state");

        self.activate(false);
        Ok(())
    }

    /// Run until the user disconnects the tunnel
    pub fn run(mut self) -> Result<(), PortError> {
        self.start()?;
        while let Some(event) = self.next_event() {
            if self.handle(event).is_break() {
                break;
            }
        }
        info!("Reconnect supervisor stopped");
        Ok(())
    }

    /// Wait for the next event, turning an expired retry deadline into
    /// [`DaemonEvent::RetryActivation`]
    pub fn next_event(&mut self) -> Option<DaemonEvent> {
        let Some(deadline) = self.retries.iter().min().copied() else {
            return self.rx.recv().ok();
        };
        match self.rx.recv_deadline(deadline) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => {
                if let Some(pos) = self.retries.iter().position(|d| *d == deadline) {
                    self.retries.swap_remove(pos);
                }
                Some(DaemonEvent::RetryActivation)
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Handle one event. `Break` means the loop should stop.
    pub fn handle(&mut self, event: DaemonEvent) -> ControlFlow<()> {
        match event {
            DaemonEvent::VpnStateChanged { state, reason } => {
                return self.on_vpn_state_changed(state, reason);
            }
            DaemonEvent::NetworkStateChanged(code) => {
                info!(code, "Network state changed");
                if code == NM_STATE_CONNECTED_GLOBAL {
                    self.activate(false);
                }
            }
            DaemonEvent::SessionLocked => {
                self.state.session_locked = true;
                info!("Session state: locked");
            }
            DaemonEvent::SessionUnlocked => {
                self.state.session_locked = false;
                info!("Session state: unlocked");
                self.activate(false);
            }
            DaemonEvent::PrepareForShutdown(starting) => self.on_prepare_for_shutdown(starting),
            DaemonEvent::PrepareForSleep(sleeping) => self.on_prepare_for_sleep(sleeping),
            DaemonEvent::RetryActivation => self.activate(true),
        }
        ControlFlow::Continue(())
    }

    fn on_vpn_state_changed(&mut self, state: VpnState, reason: VpnStateReason) -> ControlFlow<()> {
        info!(%state, ?reason, "Tunnel state changed");
        if self.state.session_locked {
            debug!("Session locked, ignoring tunnel state change");
            return ControlFlow::Continue(());
        }

        match state {
            VpnState::Active => self.on_active(),
            VpnState::Disconnected if reason == VpnStateReason::UserDisconnected => {
                self.on_user_disconnect();
                return ControlFlow::Break(());
            }
            VpnState::Failed | VpnState::Disconnected => {
                self.prune_listeners();
                self.schedule_retry();
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn on_active(&mut self) {
        info!(device = %self.virtual_device, "Tunnel is up");
        self.state.failed_attempts = 0;

        if let Err(e) = self.metadata.save_connect_time() {
            warn!("Unable to save connect time: {}", e);
        }
        if self.ipv6_leak_protection {
            if let Err(e) = self.ipv6_guard.enable() {
                error!("Unable to enable IPv6 leak protection: {}", e);
            }
        }
        if self.policy.is_enabled() {
            match self.kill_switch.arm_after_connect() {
                Ok(()) => info!("Kill switch running in post-connection mode"),
                Err(e) => error!("Kill switch post-connection setup failed: {}", e),
            }
        }
    }

    fn on_user_disconnect(&mut self) {
        info!("Tunnel was disconnected by the user");
        self.state.failed_attempts = 0;

        match port::find_tunnel_connection(self.network.as_ref(), &self.virtual_device) {
            Ok(Some(conn)) => match self.network.delete(&conn) {
                Ok(()) => info!("Tunnel connection removed"),
                Err(e) => error!("Unable to remove tunnel connection: {}", e),
            },
            Ok(None) => debug!("No tunnel connection left to remove"),
            Err(e) => error!("Unable to look up tunnel connection: {}", e),
        }

        if let Err(e) = self.ipv6_guard.disable() {
            error!("Unable to disable IPv6 leak protection: {}", e);
        }
        if self.policy != KillSwitchPolicy::Hard {
            if let Err(e) = self.kill_switch.disable() {
                error!("Unable to remove kill switch: {}", e);
            }
        }
    }

    fn schedule_retry(&mut self) {
        if !self.state.can_retry() {
            warn!(
                "Connection failed, exceeded {} max attempts",
                self.state.max_attempts
            );
            return;
        }
        self.state.failed_attempts += 1;
        info!(
            attempt = self.state.failed_attempts,
            max_attempts = self.state.max_attempts,
            "Connection failed, reconnecting in {:?}",
            self.state.delay
        );
        self.retries.push(Instant::now() + self.state.delay);
    }

    fn activate(&mut self, retry: bool) {
        info!(
            device = %self.virtual_device,
            attempt = self.state.failed_attempts,
            max_attempts = self.state.max_attempts,
            retry,
            "Activation attempt"
        );
        if self.state.session_locked {
            debug!("Session locked, not activating");
            return;
        }

        match self.try_activate() {
            Ok(()) => {}
            Err(e) if retry && e.is_waiting() => {
                info!("{}, checking again in {:?}", e, self.state.delay);
                self.retries.push(Instant::now() + self.state.delay);
            }
            Err(e) => {
                error!("Unable to start tunnel: {}", e);
                // Same as a Failed transition; the session is unlocked here
                self.schedule_retry();
            }
        }
    }

    fn try_activate(&mut self) -> Result<(), ActivationError> {
        let network = Arc::clone(&self.network);
        let tunnel = port::find_tunnel_connection(network.as_ref(), &self.virtual_device)?
            .ok_or_else(|| ActivationError::NoTunnelConnection(self.virtual_device.clone()))?;

        if let Some((active, props)) = port::find_active_tunnel(network.as_ref(), &self.virtual_device)? {
            match props.state {
                active_state::ACTIVATED => {
                    info!("Tunnel {} is already active", props.id);
                    self.attach_listener(&active);
                    return Ok(());
                }
                active_state::ACTIVATING => {
                    info!("Tunnel {} is being prepared", props.id);
                    if self.policy.is_enabled() {
                        let ip = self.server_ip()?;
                        self.kill_switch.arm_before_connect(ip)?;
                    }
                    self.attach_listener(&active);
                    return Ok(());
                }
                other => debug!(state = other, "Ignoring tunnel in state"),
            }
        }

        let (base, base_props) =
            port::primary_connection(network.as_ref())?.ok_or(ActivationError::NoBaseConnection)?;

        if self.policy.is_enabled() {
            let ip = self.server_ip()?;
            info!("Reconnecting to server IP {}", ip);
            self.kill_switch.arm_before_connect(ip)?;
        }

        info!("Starting tunnel over {}", base_props.id);
        let active = network
            .activate(&tunnel, NO_OBJECT, &base.0)?
            .ok_or(ActivationError::EmptyActivation)?;
        self.attach_listener(&active);
        info!("Tunnel connection started on {}", self.virtual_device);
        Ok(())
    }

    /// Entry IP of the last connection, or the cached catalog's entry
    /// for the last server name
    fn server_ip(&self) -> Result<Ipv4Addr, ActivationError> {
        match self.metadata.server_ip() {
            Ok(ip) => Ok(ip),
            Err(e) => {
                let name = self
                    .metadata
                    .last_connection()
                    .ok()
                    .and_then(|m| m.connected_server);
                name.as_deref()
                    .and_then(|n| self.resolve_server(n))
                    .ok_or(ActivationError::Metadata(e))
            }
        }
    }

    fn resolve_server(&self, name: &str) -> Option<Ipv4Addr> {
        let catalog = self.catalog.as_ref()?;
        let logical = catalog
            .servers()
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))?;
        let ip = logical.random_physical_server().ok()?.entry_ipv4()?;
        info!("Resolved {} to {} from the server cache", name, ip);
        Some(ip)
    }

    /// Forget listeners on active connections that no longer exist
    fn prune_listeners(&mut self) {
        if self.listening.is_empty() {
            return;
        }
        match self.network.list_active_connections() {
            Ok(live) => {
                let before = self.listening.len();
                self.listening.retain(|id| live.contains(id));
                let dropped = before - self.listening.len();
                if dropped > 0 {
                    debug!(dropped, "Dropped listeners of vanished tunnels");
                }
            }
            Err(e) => warn!("Unable to list active connections: {}", e),
        }
    }

    fn attach_listener(&mut self, active: &ActiveId) {
        self.prune_listeners();
        if self.listening.contains(active) {
            debug!("Already listening on {}", active);
            return;
        }
        match self.network.active_properties(active) {
            Ok(props) => info!("Adding listener to active {} connection at {}", props.id, active),
            Err(e) => {
                info!("{} is not an active connection: {}", active, e);
                return;
            }
        }
        match self
            .network
            .subscribe(&active.0, NetworkSignal::VpnStateChanged, self.tx.clone())
        {
            Ok(()) => {
                self.listening.insert(active.clone());
            }
            Err(e) => error!("Unable to listen on {}: {}", active, e),
        }
    }

    fn on_prepare_for_shutdown(&mut self, starting: bool) {
        if !starting {
            info!("Shutdown cancelled");
            self.take_inhibitor(InhibitKind::Shutdown);
            return;
        }
        info!("Preparing for shutdown");

        if self.policy != KillSwitchPolicy::Hard {
            info!("Removing kill switch interfaces");
            if let Err(e) = self.kill_switch.disable() {
                error!("Unable to remove kill switch: {}", e);
            }
        }
        info!("Removing IPv6 leak protection");
        if let Err(e) = self.ipv6_guard.disable() {
            error!("Unable to remove IPv6 leak protection: {}", e);
        }

        self.release_inhibitor(InhibitKind::Shutdown);
    }

    fn on_prepare_for_sleep(&mut self, sleeping: bool) {
        if !sleeping {
            info!("Resumed from sleep");
            self.take_inhibitor(InhibitKind::Sleep);
            return;
        }
        info!("Preparing for sleep");
        self.state.session_locked = true;
        info!("Session state: locked");
        self.release_inhibitor(InhibitKind::Sleep);
    }

    fn take_inhibitor(&mut self, kind: InhibitKind) {
        let slot = self.state.lock_slot(kind);
        if slot.is_some() {
            return;
        }
        let why = match kind {
            InhibitKind::Sleep => "Update session lock status",
            InhibitKind::Shutdown => "Remove VPN interfaces",
        };
        match self.session.inhibit(kind, INHIBIT_WHO, why, InhibitMode::Delay) {
            Ok(lock) => {
                info!("Created {} inhibitor lock", kind.as_str());
                *slot = Some(lock);
            }
            Err(e) => error!("Unable to create {} inhibitor lock: {}", kind.as_str(), e),
        }
    }

    fn release_inhibitor(&mut self, kind: InhibitKind) {
        let Some(lock) = self.state.lock_slot(kind).take() else {
            return;
        };
        match lock.release() {
            Ok(()) => info!("Released {} inhibitor lock", kind.as_str()),
            Err(e) => error!("Unable to release {} inhibitor lock: {}", kind.as_str(), e),
        }
    }
}

//! Connection Client
//!
//! The interactive path: pick a server, arm the guards, add the tunnel
//! connection, then start it and wait for the outcome. Unlike the
//! supervisor, errors here go straight back to the caller.

use crate::catalog::ServerCatalog;
use crate::context::Environment;
use crate::ipv6_leak::{Ipv6LeakGuard, LeakProtectionError};
use crate::kill_switch::{KillSwitchError, KillSwitchManager, KillSwitchPolicy};
use crate::metadata::{MetadataError, MetadataStore};
use crate::port::{self, ConnectionId, NetworkControl, NetworkSignal, PortError, TunnelSpec, NO_OBJECT};
use crate::selection::{SelectionPolicy, ServerQuery};
use crate::servers::ServerListError;
use crate::state::{DaemonEvent, VpnState, VpnStateReason};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    ServerList(#[from] ServerListError),

    #[error("Kill switch error: {0}")]
    KillSwitch(#[from] KillSwitchError),

    #[error("IPv6 leak protection error: {0}")]
    LeakProtection(#[from] LeakProtectionError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("VPN connection was not found")]
    ConnectionNotFound,

    #[error("Server has no usable entry IP: {0:?}")]
    InvalidServer(String),

    #[error("Tunnel did not come up within {0:?}")]
    Timeout(Duration),

    #[error("Tunnel ended in state {state} ({reason:?})")]
    TunnelFailed {
        state: VpnState,
        reason: VpnStateReason,
    },
}

/// Account credentials for the tunnel
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Everything one connect attempt needs, fixed at setup time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    entry_ip: Ipv4Addr,
    domain: String,
    servername: String,
    credentials: Credentials,
    protocol: String,
}

impl ConnectionTarget {
    pub fn entry_ip(&self) -> Ipv4Addr {
        self.entry_ip
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn servername(&self) -> &str {
        &self.servername
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    fn tunnel_spec(&self, device: &str) -> TunnelSpec {
        TunnelSpec {
            name: self.servername.clone(),
            device: device.to_string(),
            remote: IpAddr::V4(self.entry_ip),
            domain: self.domain.clone(),
            protocol: self.protocol.clone(),
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
        }
    }
}

pub struct ConnectionClient {
    network: Arc<dyn NetworkControl>,
    metadata: Arc<dyn MetadataStore>,
    kill_switch: KillSwitchManager,
    ipv6_guard: Ipv6LeakGuard,
    policy: KillSwitchPolicy,
    selection: SelectionPolicy,
    ipv6_leak_protection: bool,
    virtual_device: String,
    connect_timeout: Duration,
}

impl ConnectionClient {
    pub fn new(env: &Environment) -> Self {
        Self {
            network: Arc::clone(&env.network),
            metadata: Arc::clone(&env.metadata),
            kill_switch: env.kill_switch(),
            ipv6_guard: env.ipv6_guard(),
            policy: env.killswitch_policy(),
            selection: env.selection_policy(),
            ipv6_leak_protection: env.config.ipv6_leak_protection,
            virtual_device: env.config.virtual_device.clone(),
            connect_timeout: env.config.connect_timeout(),
        }
    }

    /// Select a server, arm the guards and add the tunnel connection
    pub fn setup(
        &self,
        catalog: &mut ServerCatalog,
        query: &ServerQuery,
        protocol: &str,
        credentials: &Credentials,
    ) -> Result<ConnectionTarget, ClientError> {
        info!("Setting up connection ({})", query);
        let server = catalog.select(query, &self.selection)?;
        let mut physical = server.random_physical_server()?.clone();
        catalog.match_server_domain(&mut physical);

        let entry_ip = physical
            .entry_ipv4()
            .ok_or_else(|| ClientError::InvalidServer(physical.entry_ip.clone()))?;

        let mut credentials = credentials.clone();
        if !physical.label.is_empty() {
            credentials.username = format!("{}+b:{}", credentials.username, physical.label);
            info!("Appended server label");
        }

        let target = ConnectionTarget {
            entry_ip,
            domain: physical.domain.clone(),
            servername: server.name.clone(),
            credentials,
            protocol: protocol.to_string(),
        };

        self.metadata.save_servername(&target.servername)?;
        self.metadata.save_protocol(protocol)?;
        self.metadata.save_display_server_ip(&physical.exit_ip)?;
        self.metadata.save_server_ip(&physical.entry_ip)?;
        info!("Stored metadata");

        // One tunnel connection per device
        while let Some(stale) = port::find_tunnel_connection(self.network.as_ref(), &self.virtual_device)? {
            debug!("Removing previous tunnel connection {}", stale);
            self.network.delete(&stale)?;
        }

        info!("Running pre-setup connection");
        if self.ipv6_leak_protection {
            self.ipv6_guard.enable()?;
        }
        if self.policy.is_enabled() {
            self.kill_switch.arm_before_connect(entry_ip)?;
        }

        let conn = self.network.create(&target.tunnel_spec(&self.virtual_device))?;
        info!("Added tunnel connection {} for {}", conn, target.servername);
        Ok(target)
    }

    /// Start the tunnel and wait for its first terminal state
    ///
    /// Anything but `Active` restores the guards to the configured policy
    /// and removes the tunnel connection.
    pub fn connect(&self) -> Result<VpnState, ClientError> {
        info!("Starting VPN connection");
        let conn = port::find_tunnel_connection(self.network.as_ref(), &self.virtual_device)?
            .ok_or(ClientError::ConnectionNotFound)?;

        let outcome = self.start_and_wait(&conn);
        match outcome {
            Ok(VpnState::Active) => {
                if let Err(e) = self.metadata.save_connect_time() {
                    warn!("Unable to save connect time: {}", e);
                }
                info!("Tunnel is up");
                Ok(VpnState::Active)
            }
            Ok(state) => Err(self.abort(ClientError::TunnelFailed {
                state,
                reason: VpnStateReason::Unknown,
            })),
            Err(e) => Err(self.abort(e)),
        }
    }

    fn start_and_wait(&self, conn: &ConnectionId) -> Result<VpnState, ClientError> {
        let (tx, rx) = unbounded();
        let Some(active) = self.network.activate(conn, NO_OBJECT, NO_OBJECT)? else {
            error!("Activation of {} returned no active connection", conn);
            return Ok(VpnState::Failed);
        };
        self.network
            .subscribe(&active.0, NetworkSignal::VpnStateChanged, tx)?;

        let deadline = Instant::now() + self.connect_timeout;
        loop {
            match rx.recv_deadline(deadline) {
                Ok(DaemonEvent::VpnStateChanged { state, reason }) if state.is_terminal() => {
                    info!(%state, ?reason, "Tunnel reached terminal state");
                    if state.is_active() {
                        return Ok(state);
                    }
                    return Err(ClientError::TunnelFailed { state, reason });
                }
                Ok(event) => debug!(?event, "Waiting for tunnel"),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ClientError::Timeout(self.connect_timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(VpnState::Failed),
            }
        }
    }

    /// Undo a failed connect; returns `err` for the caller
    fn abort(&self, err: ClientError) -> ClientError {
        warn!("Unable to connect: {}", err);
        info!("Restoring kill switch to previous state");
        if self.policy == KillSwitchPolicy::Hard {
            if let Err(e) = self.kill_switch.set_mode(KillSwitchPolicy::Hard) {
                error!("Unable to restore kill switch: {}", e);
            }
        } else {
            if let Err(e) = self.kill_switch.set_mode(KillSwitchPolicy::Disabled) {
                error!("Unable to remove kill switch: {}", e);
            }
            if let Err(e) = self.ipv6_guard.disable() {
                error!("Unable to remove IPv6 leak protection: {}", e);
            }
        }

        match port::find_tunnel_connection(self.network.as_ref(), &self.virtual_device) {
            Ok(Some(conn)) => {
                if let Err(e) = self.network.delete(&conn) {
                    error!("Unable to remove tunnel connection: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => error!("Unable to look up tunnel connection: {}", e),
        }
        err
    }

    /// Remove the tunnel connection and the guards the policy does not
    /// keep
    pub fn disconnect(&self) -> Result<(), ClientError> {
        info!("Disconnecting");
        let network = self.network.as_ref();
        let conn = match port::find_active_tunnel(network, &self.virtual_device)? {
            Some((_, props)) => Some(props.connection),
            None => port::find_tunnel_connection(network, &self.virtual_device)?,
        };
        let conn = conn.ok_or(ClientError::ConnectionNotFound)?;
        self.network.delete(&conn)?;

        info!("Running post disconnect");
        self.ipv6_guard.disable()?;
        if self.policy == KillSwitchPolicy::Soft {
            self.kill_switch.disable()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::catalog_json;
    use crate::config::DaemonConfig;
    use crate::testing::{self, FakeNetwork};
    use std::thread;

    const BLOCKING: &str = "pvpn-killswitch";
    const ROUTED: &str = "pvpn-routed-killswitch";
    const GUARD: &str = "pvpn-ipv6leak-protection";

    fn creds() -> Credentials {
        Credentials {
            username: "user".into(),
            password: "secret".into(),
        }
    }

    fn client(policy: KillSwitchPolicy) -> (Arc<FakeNetwork>, Environment, ConnectionClient) {
        let config = DaemonConfig {
            killswitch: policy,
            user_tier: 2,
            ..Default::default()
        };
        let (net, _session, env) = testing::environment(config);
        net.add_ethernet("Wired", true);
        let client = ConnectionClient::new(&env);
        (net, env, client)
    }

    fn servers() -> ServerCatalog {
        ServerCatalog::from_json(&catalog_json(&[
            ("CH#1", 2, 1.0, 1, 0, "CH"),
            ("SE#1", 2, 3.0, 1, 0, "SE"),
        ]))
        .unwrap()
    }

    /// Emit `event` on the tunnel as soon as someone listens
    fn emit_when_listening(net: Arc<FakeNetwork>, event: DaemonEvent) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for _ in 0..400 {
                if net.emit(NetworkSignal::VpnStateChanged, event.clone()) > 0 {
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        })
    }

    #[test]
    fn test_setup_builds_target() {
        let (net, env, client) = client(KillSwitchPolicy::Hard);

        let target = client
            .setup(&mut servers(), &ServerQuery::Fastest, "udp", &creds())
            .unwrap();

        assert_eq!(target.servername(), "CH#1");
        assert_eq!(target.entry_ip(), Ipv4Addr::new(185, 0, 0, 1));
        assert_eq!(target.domain(), "ch-1.example.net");
        assert_eq!(target.credentials().username, "user");

        let spec = net.created_tunnels().pop().unwrap();
        assert_eq!(spec.device, "proton0");
        assert_eq!(spec.remote, IpAddr::V4(Ipv4Addr::new(185, 0, 0, 1)));
        assert_eq!(spec.protocol, "udp");

        // Guards armed before the tunnel exists
        assert!(net.is_active(ROUTED));
        assert!(!net.is_active(BLOCKING));
        assert!(net.is_active(GUARD));

        let last = env.metadata.last_connection().unwrap();
        assert_eq!(last.connected_server.as_deref(), Some("CH#1"));
        assert_eq!(last.last_connect_ip.as_deref(), Some("185.0.0.1"));
        assert_eq!(
            env.metadata.current_connection().unwrap().display_server_ip.as_deref(),
            Some("185.1.0.1")
        );
    }

    #[test]
    fn test_setup_appends_label() {
        let (_net, _env, client) = client(KillSwitchPolicy::Disabled);
        let json = catalog_json(&[("CH#1", 0, 1.0, 1, 0, "CH")]).replace(r#""Label":"""#, r#""Label":"4""#);
        let mut catalog = ServerCatalog::from_json(&json).unwrap();

        let target = client
            .setup(&mut catalog, &ServerQuery::Fastest, "tcp", &creds())
            .unwrap();

        assert_eq!(target.credentials().username, "user+b:4");
        assert_eq!(target.credentials().password, "secret");
    }

    #[test]
    fn test_setup_matches_domain() {
        let (_net, _env, client) = client(KillSwitchPolicy::Disabled);
        // Secure-core entry sharing the direct server's exit IP
        let json = catalog_json(&[("CH#1", 2, 1.0, 1, 0, "CH"), ("IS-CH#1", 2, 1.0, 1, 1, "CH")])
            .replace("185.1.0.2", "185.1.0.1");
        let mut catalog = ServerCatalog::from_json(&json).unwrap();

        let target = client
            .setup(&mut catalog, &ServerQuery::Name("IS-CH#1".into()), "udp", &creds())
            .unwrap();

        assert_eq!(target.servername(), "IS-CH#1");
        assert_eq!(target.domain(), "ch-1.example.net");
    }

    #[test]
    fn test_setup_selection_error() {
        let (net, _env, client) = client(KillSwitchPolicy::Hard);

        let err = client
            .setup(&mut servers(), &ServerQuery::Country("JP".into()), "udp", &creds())
            .unwrap_err();

        assert!(matches!(err, ClientError::ServerList(ServerListError::CountryNotFound(_))));
        assert!(!net.exists(ROUTED));
        assert!(net.created_tunnels().is_empty());
    }

    #[test]
    fn test_setup_replaces_previous_tunnel() {
        let (net, _env, client) = client(KillSwitchPolicy::Disabled);
        net.add_tunnel("old", "proton0");

        client
            .setup(&mut servers(), &ServerQuery::Fastest, "udp", &creds())
            .unwrap();

        assert!(!net.exists("old"));
        assert!(net.exists("CH#1"));
    }

    #[test]
    fn test_connect_active() {
        let (net, env, client) = client(KillSwitchPolicy::Disabled);
        client
            .setup(&mut servers(), &ServerQuery::Fastest, "udp", &creds())
            .unwrap();

        let emitter = emit_when_listening(net.clone(), DaemonEvent::vpn(5, 0));
        let state = client.connect().unwrap();
        emitter.join().unwrap();

        assert_eq!(state, VpnState::Active);
        assert!(net.is_active("CH#1"));
        assert!(env.metadata.current_connection().unwrap().connected_time.is_some());
    }

    #[test]
    fn test_connect_failure_restores_soft() {
        let (net, _env, client) = client(KillSwitchPolicy::Soft);
        client
            .setup(&mut servers(), &ServerQuery::Fastest, "udp", &creds())
            .unwrap();
        assert!(net.is_active(ROUTED));

        let emitter = emit_when_listening(net.clone(), DaemonEvent::vpn(6, 10));
        let err = client.connect().unwrap_err();
        emitter.join().unwrap();

        assert!(matches!(
            err,
            ClientError::TunnelFailed {
                state: VpnState::Failed,
                reason: VpnStateReason::LoginFailed
            }
        ));
        assert!(!net.exists(ROUTED));
        assert!(!net.exists(BLOCKING));
        assert!(!net.exists(GUARD));
        assert!(!net.exists("CH#1"));
    }

    #[test]
    fn test_connect_failure_keeps_hard_blocking() {
        let (net, _env, client) = client(KillSwitchPolicy::Hard);
        client
            .setup(&mut servers(), &ServerQuery::Fastest, "udp", &creds())
            .unwrap();

        let emitter = emit_when_listening(net.clone(), DaemonEvent::vpn(7, 3));
        assert!(client.connect().is_err());
        emitter.join().unwrap();

        assert!(net.is_active(BLOCKING));
        assert!(!net.exists(ROUTED));
    }

    #[test]
    fn test_connect_timeout() {
        let config = DaemonConfig {
            killswitch: KillSwitchPolicy::Soft,
            connect_timeout_secs: 0,
            ..Default::default()
        };
        let (net, _session, env) = testing::environment(config);
        net.add_ethernet("Wired", true);
        let client = ConnectionClient::new(&env);
        net.add_tunnel("manual", "proton0");

        let err = client.connect().unwrap_err();

        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(!net.exists("manual"));
    }

    #[test]
    fn test_connect_without_tunnel() {
        let (_net, _env, client) = client(KillSwitchPolicy::Disabled);

        assert!(matches!(client.connect(), Err(ClientError::ConnectionNotFound)));
    }

    #[test]
    fn test_disconnect() {
        let (net, _env, client) = client(KillSwitchPolicy::Soft);
        client
            .setup(&mut servers(), &ServerQuery::Fastest, "udp", &creds())
            .unwrap();
        net.set_active("CH#1", true);

        client.disconnect().unwrap();

        assert!(!net.exists("CH#1"));
        assert!(!net.exists(GUARD));
        assert!(!net.exists(ROUTED));
        assert!(matches!(client.disconnect(), Err(ClientError::ConnectionNotFound)));
    }

    #[test]
    fn test_disconnect_keeps_hard_kill_switch() {
        let (net, _env, client) = client(KillSwitchPolicy::Hard);
        client
            .setup(&mut servers(), &ServerQuery::Fastest, "udp", &creds())
            .unwrap();
        client.kill_switch.arm_after_connect().unwrap();

        client.disconnect().unwrap();

        assert!(!net.exists("CH#1"));
        assert!(net.is_active(BLOCKING));
    }
}

//! NetworkManager adapter

use super::{bus_error, forward, get_all, get_property, proxy, set_property, take};
use crossbeam_channel::Sender;
use nmguard_core::port::{
    ActiveId, ActiveProperties, ConnectionId, ConnectionSettings, GlobalProperties,
    NetworkControl, NetworkSignal, PortError, TunnelSpec, NO_OBJECT,
};
use nmguard_core::state::DaemonEvent;
use std::collections::HashMap;
use tracing::debug;
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

const NM_BUS: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_IFACE: &str = "org.freedesktop.NetworkManager";
const SETTINGS_PATH: &str = "/org/freedesktop/NetworkManager/Settings";
const SETTINGS_IFACE: &str = "org.freedesktop.NetworkManager.Settings";
const CONNECTION_IFACE: &str = "org.freedesktop.NetworkManager.Settings.Connection";
const ACTIVE_IFACE: &str = "org.freedesktop.NetworkManager.Connection.Active";
const VPN_IFACE: &str = "org.freedesktop.NetworkManager.VPN.Connection";

const OPENVPN_SERVICE: &str = "org.freedesktop.NetworkManager.openvpn";

type SettingsMap = HashMap<String, HashMap<String, OwnedValue>>;

/// [`NetworkControl`] over the NetworkManager D-Bus API
pub struct NetworkManagerPort {
    conn: Connection,
}

impl NetworkManagerPort {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    fn proxy(&self, path: &str, iface: &'static str) -> Result<Proxy<'static>, PortError> {
        proxy(&self.conn, NM_BUS, path.to_string(), iface)
    }
}

fn object_path(path: &str) -> Result<ObjectPath<'_>, PortError> {
    ObjectPath::try_from(path).map_err(bus_error)
}

fn take_string(section: &mut HashMap<String, OwnedValue>, key: &str) -> String {
    section
        .remove(key)
        .and_then(|v| String::try_from(v).ok())
        .unwrap_or_default()
}

/// OpenVPN profile for `spec`, in `a{sa{sv}}` form
fn openvpn_settings(spec: &TunnelSpec) -> HashMap<&'static str, HashMap<&'static str, Value<'_>>> {
    let tcp = spec.protocol.eq_ignore_ascii_case("tcp");

    let mut data: HashMap<&str, String> = HashMap::new();
    data.insert("dev", spec.device.clone());
    data.insert("dev-type", "tun".to_string());
    data.insert("remote", spec.remote.to_string());
    data.insert("proto-tcp", if tcp { "yes" } else { "no" }.to_string());
    data.insert("connection-type", "password".to_string());
    data.insert("username", spec.username.clone());
    data.insert("password-flags", "0".to_string());
    if !spec.domain.is_empty() {
        data.insert("verify-x509-name", format!("name:{}", spec.domain));
    }

    let mut secrets: HashMap<&str, String> = HashMap::new();
    secrets.insert("password", spec.password.clone());

    let connection = HashMap::from([
        ("id", Value::from(spec.name.as_str())),
        ("type", Value::from("vpn")),
        ("autoconnect", Value::from(false)),
    ]);
    let vpn = HashMap::from([
        ("service-type", Value::from(OPENVPN_SERVICE)),
        ("data", Value::from(data)),
        ("secrets", Value::from(secrets)),
    ]);
    let ipv4 = HashMap::from([("method", Value::from("auto"))]);

    HashMap::from([("connection", connection), ("vpn", vpn), ("ipv4", ipv4)])
}

impl NetworkControl for NetworkManagerPort {
    fn list_connections(&self) -> Result<Vec<ConnectionId>, PortError> {
        let paths: Vec<OwnedObjectPath> = self
            .proxy(SETTINGS_PATH, SETTINGS_IFACE)?
            .call("ListConnections", &())
            .map_err(bus_error)?;
        Ok(paths.iter().map(|p| ConnectionId(p.as_str().to_string())).collect())
    }

    fn list_active_connections(&self) -> Result<Vec<ActiveId>, PortError> {
        let paths: Vec<OwnedObjectPath> =
            get_property(&self.conn, NM_BUS, NM_PATH, NM_IFACE, "ActiveConnections")?;
        Ok(paths.iter().map(|p| ActiveId(p.as_str().to_string())).collect())
    }

    fn connection_settings(&self, id: &ConnectionId) -> Result<ConnectionSettings, PortError> {
        let mut settings: SettingsMap = self
            .proxy(&id.0, CONNECTION_IFACE)?
            .call("GetSettings", &())
            .map_err(bus_error)?;

        let mut connection = settings.remove("connection").unwrap_or_default();
        let vpn_device = settings
            .remove("vpn")
            .and_then(|mut vpn| vpn.remove("data"))
            .and_then(|data| HashMap::<String, String>::try_from(data).ok())
            .and_then(|mut data| data.remove("dev"));

        Ok(ConnectionSettings {
            id: take_string(&mut connection, "id"),
            kind: take_string(&mut connection, "type"),
            vpn_device,
        })
    }

    fn active_properties(&self, id: &ActiveId) -> Result<ActiveProperties, PortError> {
        let mut props = get_all(&self.conn, NM_BUS, &id.0, ACTIVE_IFACE)?;
        let connection: OwnedObjectPath = take(&mut props, "Connection")?;

        Ok(ActiveProperties {
            id: take(&mut props, "Id")?,
            kind: take(&mut props, "Type")?,
            state: take(&mut props, "State")?,
            connection: ConnectionId(connection.as_str().to_string()),
            default4: take(&mut props, "Default")?,
            default6: take(&mut props, "Default6")?,
        })
    }

    fn activate(
        &self,
        connection: &ConnectionId,
        device: &str,
        specific_object: &str,
    ) -> Result<Option<ActiveId>, PortError> {
        debug!(connection = %connection, "ActivateConnection");
        let args = (
            object_path(&connection.0)?,
            object_path(device)?,
            object_path(specific_object)?,
        );
        let active: OwnedObjectPath = self
            .proxy(NM_PATH, NM_IFACE)?
            .call("ActivateConnection", &args)
            .map_err(bus_error)?;

        if active.as_str() == NO_OBJECT {
            return Ok(None);
        }
        Ok(Some(ActiveId(active.as_str().to_string())))
    }

    fn deactivate(&self, active: &ActiveId) -> Result<(), PortError> {
        debug!(active = %active, "DeactivateConnection");
        self.proxy(NM_PATH, NM_IFACE)?
            .call::<_, _, ()>("DeactivateConnection", &(object_path(&active.0)?,))
            .map_err(bus_error)
    }

    fn delete(&self, connection: &ConnectionId) -> Result<(), PortError> {
        debug!(connection = %connection, "Delete");
        self.proxy(&connection.0, CONNECTION_IFACE)?
            .call::<_, _, ()>("Delete", &())
            .map_err(bus_error)
    }

    fn create(&self, spec: &TunnelSpec) -> Result<ConnectionId, PortError> {
        let path: OwnedObjectPath = self
            .proxy(SETTINGS_PATH, SETTINGS_IFACE)?
            .call("AddConnection", &(openvpn_settings(spec),))
            .map_err(bus_error)?;
        Ok(ConnectionId(path.as_str().to_string()))
    }

    fn subscribe(
        &self,
        object: &str,
        signal: NetworkSignal,
        sink: Sender<DaemonEvent>,
    ) -> Result<(), PortError> {
        match signal {
            NetworkSignal::StateChanged => {
                let signals = self
                    .proxy(NM_PATH, NM_IFACE)?
                    .receive_signal("StateChanged")
                    .map_err(bus_error)?;
                forward("nm-state".to_string(), signals, sink, |msg| {
                    let state: u32 = msg.body().deserialize()?;
                    Ok(DaemonEvent::NetworkStateChanged(state))
                })
            }
            NetworkSignal::VpnStateChanged => {
                let signals = self
                    .proxy(object, VPN_IFACE)?
                    .receive_signal("VpnStateChanged")
                    .map_err(bus_error)?;
                forward(format!("vpn-state {}", object), signals, sink, |msg| {
                    let (state, reason): (u32, u32) = msg.body().deserialize()?;
                    Ok(DaemonEvent::vpn(state, reason))
                })
            }
        }
    }

    fn global_properties(&self) -> Result<GlobalProperties, PortError> {
        let mut props = get_all(&self.conn, NM_BUS, NM_PATH, NM_IFACE)?;
        Ok(GlobalProperties {
            state: take(&mut props, "State")?,
            connectivity_check_available: take(&mut props, "ConnectivityCheckAvailable")?,
            connectivity_check_enabled: take(&mut props, "ConnectivityCheckEnabled")?,
        })
    }

    fn set_connectivity_check(&self, enabled: bool) -> Result<(), PortError> {
        debug!(enabled, "Setting ConnectivityCheckEnabled");
        set_property(
            &self.conn,
            NM_BUS,
            NM_PATH,
            NM_IFACE,
            "ConnectivityCheckEnabled",
            Value::from(enabled),
        )
    }
}

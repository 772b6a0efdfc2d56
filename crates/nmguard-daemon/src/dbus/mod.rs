//! D-Bus adapters
//!
//! Port implementations over the system bus, using the blocking zbus API.
//! Calls go through plain [`Proxy`] objects; properties are read with
//! `org.freedesktop.DBus.Properties` calls so every read is fresh.
//!
//! Signal subscriptions each get a forwarding thread that decodes the
//! message body into a [`DaemonEvent`] and pushes it into the caller's
//! channel. A forwarder stops once its receiver is gone.

mod login1;
mod network_manager;

pub use login1::Login1Port;
pub use network_manager::NetworkManagerPort;

use crossbeam_channel::Sender;
use nmguard_core::port::PortError;
use nmguard_core::state::DaemonEvent;
use std::collections::HashMap;
use std::fmt;
use std::thread;
use tracing::{debug, warn};
use zbus::blocking::proxy::SignalIterator;
use zbus::blocking::{Connection, Proxy};
use zbus::Message;
use zbus::zvariant::{OwnedValue, Value};

const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

pub(crate) type PropertyMap = HashMap<String, OwnedValue>;

pub(crate) fn bus_error<E: fmt::Display>(e: E) -> PortError {
    PortError::Bus(e.to_string())
}

/// Proxy for `iface` on `path` of `destination`
pub(crate) fn proxy(
    conn: &Connection,
    destination: &'static str,
    path: String,
    iface: &'static str,
) -> Result<Proxy<'static>, PortError> {
    Proxy::new(conn, destination, path, iface).map_err(bus_error)
}

pub(crate) fn get_property<T>(
    conn: &Connection,
    destination: &'static str,
    path: &str,
    iface: &str,
    name: &str,
) -> Result<T, PortError>
where
    T: TryFrom<OwnedValue>,
    T::Error: fmt::Display,
{
    let props = proxy(conn, destination, path.to_string(), PROPERTIES_IFACE)?;
    let value: OwnedValue = props.call("Get", &(iface, name)).map_err(bus_error)?;
    T::try_from(value).map_err(|e| PortError::Bus(format!("{}.{}: {}", iface, name, e)))
}

pub(crate) fn get_all(
    conn: &Connection,
    destination: &'static str,
    path: &str,
    iface: &str,
) -> Result<PropertyMap, PortError> {
    let props = proxy(conn, destination, path.to_string(), PROPERTIES_IFACE)?;
    props.call("GetAll", &(iface,)).map_err(bus_error)
}

pub(crate) fn set_property(
    conn: &Connection,
    destination: &'static str,
    path: &str,
    iface: &str,
    name: &str,
    value: Value<'_>,
) -> Result<(), PortError> {
    let props = proxy(conn, destination, path.to_string(), PROPERTIES_IFACE)?;
    props
        .call::<_, _, ()>("Set", &(iface, name, value))
        .map_err(bus_error)
}

/// Remove `name` from a `GetAll` result
pub(crate) fn take<T>(props: &mut PropertyMap, name: &str) -> Result<T, PortError>
where
    T: TryFrom<OwnedValue>,
    T::Error: fmt::Display,
{
    let value = props
        .remove(name)
        .ok_or_else(|| PortError::Bus(format!("missing property {}", name)))?;
    T::try_from(value).map_err(|e| PortError::Bus(format!("{}: {}", name, e)))
}

/// Forward decoded signals into `sink` from a dedicated thread
pub(crate) fn forward<F>(
    what: String,
    signals: SignalIterator<'static>,
    sink: Sender<DaemonEvent>,
    decode: F,
) -> Result<(), PortError>
where
    F: Fn(&Message) -> zbus::Result<DaemonEvent> + Send + 'static,
{
    debug!("Forwarding {} signals", what);
    thread::Builder::new()
        .name(format!("signal-{}", what))
        .spawn(move || {
            for msg in signals {
                match decode(&msg) {
                    Ok(event) => {
                        if sink.send(event).is_err() {
                            debug!("Receiver dropped, stopping {} forwarder", what);
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed {} signal: {}", what, e),
                }
            }
        })?;
    Ok(())
}

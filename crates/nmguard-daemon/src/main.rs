//! nmguardd: VPN connection guard daemon
//!
//! Loads the configuration, connects the ports to NetworkManager and
//! logind over the system bus, and runs the reconnect supervisor until
//! the user disconnects the tunnel.

mod dbus;
mod logging;

use anyhow::{Context, Result};
use dbus::{Login1Port, NetworkManagerPort};
use nmguard_core::{DaemonConfig, Environment, ReconnectSupervisor, SystemCommandRunner};
use std::sync::Arc;
use tracing::info;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    logging::init();
    info!("nmguardd starting...");

    let config = DaemonConfig::from_env().context("loading configuration")?;
    info!(
        device = %config.virtual_device,
        killswitch = %config.killswitch,
        max_attempts = config.max_attempts,
        "Configuration loaded"
    );

    let bus = zbus::blocking::Connection::system().context("connecting to the system bus")?;
    let network = Arc::new(NetworkManagerPort::new(bus.clone()));
    let session = Arc::new(Login1Port::new(bus).context("resolving the login session")?);
    let env = Environment::new(network, session, Arc::new(SystemCommandRunner), config);

    ReconnectSupervisor::new(&env)
        .run()
        .context("starting the reconnect supervisor")?;

    info!("nmguardd shutting down");
    Ok(())
}

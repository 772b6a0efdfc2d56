//! NetworkManager connectivity check.
//!
//! The periodic connectivity check fights with dummy-interface routing,
//! so every Kill-Switch and IPv6 guard operation turns it off first.

use crate::port::{GlobalProperties, NetworkControl, PortError};
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum ConnectivityCheckError {
    #[error("Connectivity check is enabled but cannot be changed")]
    Unavailable,

    #[error("Connectivity check is still enabled after disabling it")]
    NotDisabled,

    #[error("Port error: {0}")]
    Port(#[from] PortError),
}

/// Read and log the connectivity check status
pub fn status(network: &dyn NetworkControl) -> Result<GlobalProperties, PortError> {
    let props = network.global_properties()?;
    info!(
        "Conn check available ({}) - Conn check enabled ({})",
        props.connectivity_check_available, props.connectivity_check_enabled
    );
    Ok(props)
}

/// Turn the check off if it is on, and verify by re-reading
pub fn ensure_disabled(network: &dyn NetworkControl) -> Result<(), ConnectivityCheckError> {
    let props = status(network)?;
    if !props.connectivity_check_enabled {
        return Ok(());
    }
    if !props.connectivity_check_available {
        error!("Unable to change connectivity check");
        return Err(ConnectivityCheckError::Unavailable);
    }

    info!("Disabling connectivity check");
    network.set_connectivity_check(false)?;

    if network.global_properties()?.connectivity_check_enabled {
        error!("Can not disable connectivity check");
        return Err(ConnectivityCheckError::NotDisabled);
    }
    info!("Connectivity check has been disabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNetwork;

    #[test]
    fn test_disables_enabled_check() {
        let net = FakeNetwork::new();
        net.set_connectivity_check_state(true, true);

        ensure_disabled(&net).unwrap();
        assert!(!net.global_properties().unwrap().connectivity_check_enabled);
    }

    #[test]
    fn test_noop_when_already_disabled() {
        let net = FakeNetwork::new();
        net.set_connectivity_check_state(false, false);

        ensure_disabled(&net).unwrap();
        assert_eq!(net.connectivity_check_writes(), 0);
    }

    #[test]
    fn test_unavailable_check() {
        let net = FakeNetwork::new();
        net.set_connectivity_check_state(true, false);

        assert!(matches!(
            ensure_disabled(&net),
            Err(ConnectivityCheckError::Unavailable)
        ));
    }

    #[test]
    fn test_write_is_verified() {
        let net = FakeNetwork::new();
        net.set_connectivity_check_state(true, true);
        net.set_connectivity_check_sticky(true);

        assert!(matches!(
            ensure_disabled(&net),
            Err(ConnectivityCheckError::NotDisabled)
        ));
    }
}

//! `nmcli` invocations for dummy interfaces.
//!
//! Interface creation and deletion go through the command runner rather
//! than the bus so that the interfaces are created exactly as a user
//! would create them by hand.

use crate::port::{CommandOutput, CommandRunner, PortError};
use tracing::{debug, error};

pub const NMCLI: &str = "nmcli";

/// "Connection, device, or access point does not exist"; the object is
/// already in the state we wanted
pub const RC_NOT_FOUND: i32 = 10;

/// Invalid user input (rejected property value)
pub const RC_INVALID_ARGUMENT: i32 = 2;

/// Builder for `nmcli connection add type dummy ...`
#[derive(Debug, Clone)]
pub struct DummyConnection {
    args: Vec<String>,
}

impl DummyConnection {
    pub fn new(interface: &str, connection: &str) -> Self {
        let args = ["c", "a", "type", "dummy", "ifname", interface, "con-name", connection]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self { args }
    }

    /// Append a `property value` pair
    pub fn set(mut self, property: &str, value: impl Into<String>) -> Self {
        self.args.push(property.to_string());
        self.args.push(value.into());
        self
    }

    /// Static IPv4 addressing
    pub fn ipv4(self, addresses: &str, gateway: Option<&str>) -> Self {
        let b = self.set("ipv4.method", "manual").set("ipv4.addresses", addresses);
        match gateway {
            Some(gw) => b.set("ipv4.gateway", gw),
            None => b,
        }
    }

    /// Static IPv6 addressing
    pub fn ipv6(self, addresses: &str, gateway: &str) -> Self {
        self.set("ipv6.method", "manual")
            .set("ipv6.addresses", addresses)
            .set("ipv6.gateway", gateway)
    }

    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}

/// `nmcli connection delete <name>`
pub fn delete_args(connection: &str) -> Vec<String> {
    vec!["c".into(), "delete".into(), connection.into()]
}

/// Run an nmcli command, logging failures
pub fn run(runner: &dyn CommandRunner, args: &[String]) -> Result<CommandOutput, PortError> {
    debug!("nmcli {}", args.join(" "));
    let output = runner.run(NMCLI, args)?;
    if !is_success(output.code) {
        error!(
            code = output.code,
            stderr = %output.stderr.trim(),
            "nmcli {} failed",
            args.first().map(String::as_str).unwrap_or("")
        );
    }
    Ok(output)
}

/// Exit codes that leave the object in the desired state
pub fn is_success(code: i32) -> bool {
    code == 0 || code == RC_NOT_FOUND
}

/// Name given after `con-name` in an add command, or after `delete`
pub fn target_connection(args: &[String]) -> Option<&str> {
    if let Some(pos) = args.iter().position(|a| a == "con-name") {
        return args.get(pos + 1).map(String::as_str);
    }
    if args.get(1).map(String::as_str) == Some("delete") {
        return args.get(2).map(String::as_str);
    }
    None
}

/// Value following `property` in an add command
pub fn property<'a>(args: &'a [String], property: &str) -> Option<&'a str> {
    let pos = args.iter().position(|a| a == property)?;
    args.get(pos + 1).map(String::as_str)
}

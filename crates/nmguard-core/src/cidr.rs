//! Address exclusion for the routed interface.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// `network` minus `excluded`, as the list of disjoint networks that
/// cover what is left, largest first.
///
/// Returns `network` unchanged when it does not contain `excluded`.
pub fn exclude(network: Ipv4Net, excluded: Ipv4Net) -> Vec<Ipv4Net> {
    let network = network.trunc();
    let excluded = excluded.trunc();
    if !network.contains(&excluded) {
        return vec![network];
    }

    let mut remaining = Vec::new();
    let mut current = network;
    while current.prefix_len() < excluded.prefix_len() {
        let Ok(mut halves) = current.subnets(current.prefix_len() + 1) else {
            break;
        };
        let (Some(lower), Some(upper)) = (halves.next(), halves.next()) else {
            break;
        };
        if lower.contains(&excluded) {
            remaining.push(upper);
            current = lower;
        } else {
            remaining.push(lower);
            current = upper;
        }
    }
    remaining
}

/// Every IPv4 network except the single host `server`
pub fn everything_except(server: Ipv4Addr) -> Vec<Ipv4Net> {
    let all = Ipv4Net::default();
    match Ipv4Net::new(server, 32) {
        Ok(host) => exclude(all, host),
        Err(_) => vec![all],
    }
}

/// Comma separated list, the form nmcli expects
pub fn join(networks: &[Ipv4Net]) -> String {
    networks
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

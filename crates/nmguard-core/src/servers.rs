//! Server Model
//!
//! Logical and physical servers in the API's JSON shape (PascalCase
//! field names), plus the feature bitmask and tier constants.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::BitOr;
use tracing::error;

/// Subscription tiers
pub mod tier {
    pub const FREE: u8 = 0;
    pub const BASIC: u8 = 1;
    pub const PLUS: u8 = 2;
    pub const PM: u8 = 3;
}

/// Server feature bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(u32);

impl Features {
    pub const NORMAL: Features = Features(0);
    pub const SECURE_CORE: Features = Features(1);
    pub const TOR: Features = Features(2);
    pub const P2P: Features = Features(4);
    pub const STREAMING: Features = Features(8);
    pub const IPV6: Features = Features(16);

    const KNOWN: [(Features, &'static str); 5] = [
        (Features::SECURE_CORE, "SecureCore"),
        (Features::TOR, "Tor"),
        (Features::P2P, "P2P"),
        (Features::STREAMING, "Streaming"),
        (Features::IPV6, "IPv6"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Features(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is set. `NORMAL` is contained in
    /// every mask.
    pub const fn contains(&self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    /// Known flags present in the mask, always starting with `NORMAL`
    pub fn unpack(&self) -> Vec<Features> {
        let mut out = vec![Features::NORMAL];
        out.extend(
            Self::KNOWN
                .iter()
                .filter(|(f, _)| self.0 & f.0 != 0)
                .map(|(f, _)| *f),
        );
        out
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::KNOWN
            .iter()
            .filter(|(flag, _)| self.0 & flag.0 != 0)
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("Normal")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Location {
    pub lat: f64,
    pub long: f64,
}

/// One machine behind a logical server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhysicalServer {
    #[serde(rename = "EntryIP")]
    pub entry_ip: String,
    #[serde(rename = "ExitIP")]
    pub exit_ip: String,
    pub domain: String,
    /// 1 = enabled
    pub status: u8,
    #[serde(default)]
    pub generation: u32,
    /// Non-empty for servers that need the `+b:<label>` username suffix
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services_down_reason: Option<String>,
}

impl PhysicalServer {
    pub fn enabled(&self) -> bool {
        self.status == 1
    }

    pub fn entry_ipv4(&self) -> Option<Ipv4Addr> {
        self.entry_ip.parse().ok()
    }
}

impl fmt::Display for PhysicalServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "PhysicalServer<{}>", self.domain)
        } else {
            write!(f, "PhysicalServer<{}+b:{}>", self.domain, self.label)
        }
    }
}

/// A named endpoint backed by one or more physical servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogicalServer {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub entry_country: String,
    pub exit_country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_country: Option<String>,
    pub tier: u8,
    #[serde(default)]
    pub load: u32,
    /// Lower is better
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub features: Features,
    pub status: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default)]
    pub servers: Vec<PhysicalServer>,
}

impl LogicalServer {
    /// Status 1 and at least one enabled physical server
    pub fn enabled(&self) -> bool {
        self.status == 1 && self.servers.iter().any(PhysicalServer::enabled)
    }

    pub fn has_feature(&self, feature: Features) -> bool {
        self.features.contains(feature)
    }

    /// Uniform pick among the enabled physical servers
    pub fn random_physical_server(&self) -> Result<&PhysicalServer, ServerListError> {
        let enabled: Vec<&PhysicalServer> = self.servers.iter().filter(|s| s.enabled()).collect();
        match enabled.choose(&mut rand::thread_rng()) {
            Some(server) => Ok(*server),
            None => {
                error!("No enabled physical server behind {}", self.name);
                Err(ServerListError::EmptyServerList)
            }
        }
    }
}

impl fmt::Display for LogicalServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalServer<{}>", self.name)
    }
}

/// Server list errors
#[derive(Debug, thiserror::Error)]
pub enum ServerListError {
    #[error("No servers could be found")]
    EmptyServerList,

    #[error("Fastest server could not be found")]
    FastestNotFound,

    #[error("No server found in country {0}")]
    CountryNotFound(String),

    #[error("No server found with features {0}")]
    FeatureNotFound(Features),

    #[error("Server {0} could not be found")]
    NameNotFound(String),

    #[error("Random server could not be found")]
    RandomNotFound,

    #[error("Server cache not found")]
    CacheNotFound,

    #[error("Invalid server list response code {0}")]
    InvalidCode(i64),

    #[error("Unknown or released server view")]
    UnknownView,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerListError {
    /// An empty selection result, whatever the query was
    pub fn is_empty_list(&self) -> bool {
        matches!(
            self,
            ServerListError::EmptyServerList
                | ServerListError::FastestNotFound
                | ServerListError::CountryNotFound(_)
                | ServerListError::FeatureNotFound(_)
                | ServerListError::NameNotFound(_)
                | ServerListError::RandomNotFound
        )
    }
}

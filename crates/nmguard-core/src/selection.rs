//! Server Selection
//!
//! Picks connection targets from the [`ServerCatalog`]. Every selection
//! is limited to servers the account's tier may use, and an empty result
//! is an error; nothing here retries.

use crate::catalog::{by_score, ServerCatalog};
use crate::config::DaemonConfig;
use crate::servers::{tier, Features, LogicalServer, ServerListError};
use rand::seq::SliceRandom;
use std::fmt;
use tracing::{error, info};

/// Account-level selection settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub user_tier: u8,
    /// Route through secure-core servers only
    pub secure_core: bool,
}

impl SelectionPolicy {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            user_tier: config.user_tier,
            secure_core: config.secure_core,
        }
    }
}

/// What the user asked to connect to
#[derive(Debug, Clone, PartialEq)]
pub enum ServerQuery {
    Fastest,
    FastestFree,
    /// Fastest server exiting in this country code
    Country(String),
    /// Fastest server carrying all of these features
    Features(Features),
    /// Case-insensitive server name
    Name(String),
    Random,
}

impl fmt::Display for ServerQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerQuery::Fastest => f.write_str("fastest"),
            ServerQuery::FastestFree => f.write_str("fastest free"),
            ServerQuery::Country(c) => write!(f, "country {}", c),
            ServerQuery::Features(feat) => write!(f, "features {}", feat),
            ServerQuery::Name(n) => write!(f, "name {}", n),
            ServerQuery::Random => f.write_str("random"),
        }
    }
}

/// Secure-core servers only, or neither secure-core nor Tor
fn core_filter(secure_core: bool) -> impl Fn(&LogicalServer) -> bool + Send + Sync + 'static {
    move |s: &LogicalServer| {
        if secure_core {
            s.has_feature(Features::SECURE_CORE)
        } else {
            !s.has_feature(Features::SECURE_CORE) && !s.has_feature(Features::TOR)
        }
    }
}

fn first(
    servers: Result<Vec<LogicalServer>, ServerListError>,
) -> Result<LogicalServer, ServerListError> {
    servers?.into_iter().next().ok_or(ServerListError::EmptyServerList)
}

fn specialise(err: ServerListError, to: ServerListError) -> ServerListError {
    if err.is_empty_list() { to } else { err }
}

impl ServerCatalog {
    /// Up to `n` enabled servers matching `extra`, fastest first
    pub fn fastest_servers_matching<F>(
        &mut self,
        user_tier: u8,
        n: usize,
        extra: F,
    ) -> Result<Vec<LogicalServer>, ServerListError>
    where
        F: Fn(&LogicalServer) -> bool + Send + Sync + 'static,
    {
        self.ensure_loaded()?;
        let outer = self.filter(extra);
        let usable = self.filter_view(outer, move |s| s.enabled() && s.tier <= user_tier);
        let result = usable.and_then(|view| {
            self.sort_by(view, Some(by_score()), false)?;
            let picked: Vec<LogicalServer> = self
                .view_servers(view)?
                .into_iter()
                .take(n)
                .cloned()
                .collect();
            self.release_view(view)?;
            Ok(picked)
        });
        self.release_view(outer)?;

        let picked = result?;
        if picked.is_empty() {
            error!("List of logical servers is empty");
            return Err(ServerListError::EmptyServerList);
        }
        Ok(picked)
    }

    /// Up to `n` enabled servers, fastest first
    pub fn fastest_servers(
        &mut self,
        user_tier: u8,
        n: usize,
    ) -> Result<Vec<LogicalServer>, ServerListError> {
        self.fastest_servers_matching(user_tier, n, |_| true)
    }

    pub fn fastest_server(&mut self, user_tier: u8) -> Result<LogicalServer, ServerListError> {
        let servers = self.fastest_servers(user_tier, 1);
        first(servers)
    }

    /// Up to `n` free-tier servers, fastest first
    pub fn fastest_free_servers(
        &mut self,
        user_tier: u8,
        n: usize,
    ) -> Result<Vec<LogicalServer>, ServerListError> {
        self.fastest_servers_matching(user_tier, n, |s| s.tier == tier::FREE)
            .map_err(|e| specialise(e, ServerListError::FastestNotFound))
    }

    /// Up to `n` free-tier servers entering in `country`, fastest first
    pub fn fastest_free_servers_in_country(
        &mut self,
        user_tier: u8,
        country: &str,
        n: usize,
    ) -> Result<Vec<LogicalServer>, ServerListError> {
        let code = country.to_string();
        self.fastest_servers_matching(user_tier, n, move |s| {
            s.entry_country == code && s.tier == tier::FREE
        })
        .map_err(|e| specialise(e, ServerListError::FastestNotFound))
    }

    /// Uniform pick among the servers the tier allows, enabled or not
    pub fn random_server(&mut self, user_tier: u8) -> Result<LogicalServer, ServerListError> {
        self.ensure_loaded()?;
        let picked = self.with_view(
            move |s| s.tier <= user_tier,
            None,
            |servers| servers.choose(&mut rand::thread_rng()).map(|s| (*s).clone()),
        )?;
        picked.ok_or(ServerListError::EmptyServerList)
    }

    /// Resolve a query to one logical server
    pub fn select(
        &mut self,
        query: &ServerQuery,
        policy: &SelectionPolicy,
    ) -> Result<LogicalServer, ServerListError> {
        info!("Selecting {} server (secure core: {})", query, policy.secure_core);
        let tier = policy.user_tier;

        match query {
            ServerQuery::Fastest => {
                let found = self.fastest_servers_matching(tier, 1, core_filter(policy.secure_core));
                first(found)
                    .map_err(|e| specialise(e, ServerListError::FastestNotFound))
            }
            ServerQuery::FastestFree => {
                let found = self.fastest_free_servers(tier, 1);
                first(found)
                    .map_err(|e| specialise(e, ServerListError::FastestNotFound))
            }
            ServerQuery::Country(code) => {
                let wanted = code.to_lowercase();
                let core = core_filter(policy.secure_core);
                let found = self.fastest_servers_matching(tier, 1, move |s| {
                    s.exit_country.to_lowercase() == wanted && core(s)
                });
                first(found)
                    .map_err(|e| specialise(e, ServerListError::CountryNotFound(code.clone())))
            }
            ServerQuery::Features(features) => {
                let mask = *features;
                let found = self.fastest_servers_matching(tier, 1, move |s| s.features.contains(mask));
                first(found)
                    .map_err(|e| specialise(e, ServerListError::FeatureNotFound(mask)))
            }
            ServerQuery::Name(name) => {
                let wanted = name.to_lowercase();
                let found =
                    self.fastest_servers_matching(tier, 1, move |s| s.name.to_lowercase() == wanted);
                first(found)
                    .map_err(|e| specialise(e, ServerListError::NameNotFound(name.clone())))
            }
            ServerQuery::Random => self
                .random_server(tier)
                .map_err(|e| specialise(e, ServerListError::RandomNotFound)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::catalog;

    const SC: u32 = 1;
    const TOR: u32 = 2;
    const P2P: u32 = 4;

    fn names(servers: &[LogicalServer]) -> Vec<&str> {
        servers.iter().map(|s| s.name.as_str()).collect()
    }

    fn policy(user_tier: u8, secure_core: bool) -> SelectionPolicy {
        SelectionPolicy {
            user_tier,
            secure_core,
        }
    }

    #[test]
    fn test_fastest_two_of_two() {
        let mut c = catalog(&[("A", 0, 10.0, 1, 0, "CH"), ("B", 0, 5.0, 1, 0, "CH")]);

        let picked = c.fastest_servers(tier::FREE, 2).unwrap();
        assert_eq!(names(&picked), ["B", "A"]);
    }

    #[test]
    fn test_fastest_n_respects_tier_and_status() {
        let mut c = catalog(&[
            ("Slow", 0, 9.0, 1, 0, "CH"),
            ("Plus", 2, 0.1, 1, 0, "CH"),
            ("Down", 0, 0.2, 0, 0, "CH"),
            ("Fast", 1, 1.0, 1, 0, "CH"),
        ]);

        let picked = c.fastest_servers(tier::BASIC, 10).unwrap();
        assert_eq!(names(&picked), ["Fast", "Slow"]);

        let picked = c.fastest_servers(tier::PLUS, 2).unwrap();
        assert_eq!(names(&picked), ["Plus", "Fast"]);

        // Temporary views are released
        assert_eq!(c.live_views(), 0);
    }

    #[test]
    fn test_fastest_server() {
        let mut c = catalog(&[
            ("A", 0, 10.0, 1, 0, "CH"),
            ("B", 0, 5.0, 1, 0, "CH"),
            ("Plus", 2, 1.0, 1, 0, "CH"),
        ]);

        assert_eq!(c.fastest_server(tier::FREE).unwrap().name, "B");
        assert_eq!(c.fastest_server(tier::PLUS).unwrap().name, "Plus");
        assert_eq!(c.live_views(), 0);
    }

    #[test]
    fn test_fastest_empty() {
        let mut c = catalog(&[("Plus", 2, 1.0, 1, 0, "CH")]);
        let err = c.fastest_servers(tier::FREE, 1).unwrap_err();
        assert!(matches!(err, ServerListError::EmptyServerList));

        let mut empty = ServerCatalog::new();
        assert!(matches!(empty.fastest_server(3), Err(ServerListError::CacheNotFound)));
    }

    #[test]
    fn test_select_fastest_secure_core() {
        let mut c = catalog(&[
            ("CH#1", 2, 3.0, 1, 0, "CH"),
            ("IS-CH#1", 2, 1.0, 1, SC, "CH"),
            ("CH-TOR#1", 2, 0.5, 1, TOR, "CH"),
        ]);

        let s = c.select(&ServerQuery::Fastest, &policy(tier::PLUS, false)).unwrap();
        assert_eq!(s.name, "CH#1");

        let s = c.select(&ServerQuery::Fastest, &policy(tier::PLUS, true)).unwrap();
        assert_eq!(s.name, "IS-CH#1");

        let err = c.select(&ServerQuery::Fastest, &policy(tier::FREE, false)).unwrap_err();
        assert!(matches!(err, ServerListError::FastestNotFound));
    }

    #[test]
    fn test_select_country() {
        let mut c = catalog(&[
            ("SE#1", 0, 3.0, 1, 0, "SE"),
            ("SE#2", 0, 2.0, 1, 0, "SE"),
            ("CH#1", 0, 1.0, 1, 0, "CH"),
        ]);

        let s = c
            .select(&ServerQuery::Country("se".into()), &policy(tier::FREE, false))
            .unwrap();
        assert_eq!(s.name, "SE#2");

        let err = c
            .select(&ServerQuery::Country("JP".into()), &policy(tier::FREE, false))
            .unwrap_err();
        assert!(matches!(err, ServerListError::CountryNotFound(ref code) if code == "JP"));
    }

    #[test]
    fn test_select_features_need_all_bits() {
        let mut c = catalog(&[
            ("P2P#1", 2, 1.0, 1, P2P, "NL"),
            ("P2P-TOR#1", 2, 5.0, 1, P2P | TOR, "NL"),
        ]);
        let p = policy(tier::PLUS, false);

        let s = c.select(&ServerQuery::Features(Features::P2P), &p).unwrap();
        assert_eq!(s.name, "P2P#1");

        let s = c
            .select(&ServerQuery::Features(Features::P2P | Features::TOR), &p)
            .unwrap();
        assert_eq!(s.name, "P2P-TOR#1");

        let err = c
            .select(&ServerQuery::Features(Features::SECURE_CORE), &p)
            .unwrap_err();
        assert!(matches!(err, ServerListError::FeatureNotFound(_)));
    }

    #[test]
    fn test_select_by_name() {
        let mut c = catalog(&[("CH#1", 0, 1.0, 1, 0, "CH"), ("CH#2", 2, 1.0, 1, 0, "CH")]);

        let s = c.select(&ServerQuery::Name("ch#1".into()), &policy(0, false)).unwrap();
        assert_eq!(s.name, "CH#1");

        // Exists, but not for this tier
        let err = c
            .select(&ServerQuery::Name("CH#2".into()), &policy(0, false))
            .unwrap_err();
        assert!(matches!(err, ServerListError::NameNotFound(_)));
    }

    #[test]
    fn test_select_free() {
        let mut c = catalog(&[("FREE#1", 0, 4.0, 1, 0, "NL"), ("PLUS#1", 2, 1.0, 1, 0, "NL")]);

        let s = c.select(&ServerQuery::FastestFree, &policy(tier::PLUS, false)).unwrap();
        assert_eq!(s.name, "FREE#1");

        let picked = c.fastest_free_servers_in_country(tier::PLUS, "NL", 5).unwrap();
        assert_eq!(names(&picked), ["FREE#1"]);
        assert!(matches!(
            c.fastest_free_servers_in_country(tier::PLUS, "US", 5),
            Err(ServerListError::FastestNotFound)
        ));
    }

    #[test]
    fn test_select_random() {
        let mut c = catalog(&[("A", 0, 1.0, 0, 0, "CH"), ("B", 2, 1.0, 1, 0, "CH")]);

        // Disabled servers are still candidates
        for _ in 0..10 {
            let s = c.select(&ServerQuery::Random, &policy(tier::FREE, false)).unwrap();
            assert_eq!(s.name, "A");
        }

        let mut none = catalog(&[("B", 2, 1.0, 1, 0, "CH")]);
        let err = none
            .select(&ServerQuery::Random, &policy(tier::FREE, false))
            .unwrap_err();
        assert!(matches!(err, ServerListError::RandomNotFound));
    }
}

//! Server Catalog
//!
//! The catalog owns every [`LogicalServer`] in one vector. Views are
//! filtered (and optionally sorted) lists of indices into that vector,
//! kept in an arena and addressed by [`ViewId`] handles.
//!
//! Whenever the backing data changes (full reload, load update, cache
//! restore) every live view is rebuilt from its predicate and re-sorted
//! before anything can read it, so a view always equals
//! `sort(filter(predicate, data))`.

use crate::servers::{Features, LogicalServer, PhysicalServer, ServerListError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// API success code
pub const API_CODE_OK: i64 = 1000;

/// View membership test
pub type Predicate = Arc<dyn Fn(&LogicalServer) -> bool + Send + Sync>;

/// View ordering
pub type Comparator = Arc<dyn Fn(&LogicalServer, &LogicalServer) -> Ordering + Send + Sync>;

/// Ascending by score (fastest first)
pub fn by_score() -> Comparator {
    Arc::new(|a: &LogicalServer, b: &LogicalServer| a.score.total_cmp(&b.score))
}

/// Ascending by load
pub fn by_load() -> Comparator {
    Arc::new(|a: &LogicalServer, b: &LogicalServer| a.load.cmp(&b.load))
}

/// Alphabetical by name
pub fn by_name() -> Comparator {
    Arc::new(|a: &LogicalServer, b: &LogicalServer| a.name.cmp(&b.name))
}

/// Handle to a live view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId {
    slot: usize,
    generation: u32,
}

struct View {
    predicate: Predicate,
    sort: Option<Comparator>,
    reverse: bool,
    ids: Vec<usize>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    view: Option<View>,
}

/// Serialized catalog, as cached on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogData {
    #[serde(default)]
    logical_servers: Vec<LogicalServer>,
    #[serde(default)]
    logicals_update_timestamp: f64,
    #[serde(default)]
    loads_update_timestamp: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LogicalsResponse {
    code: i64,
    logical_servers: Vec<LogicalServer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadsResponse {
    code: i64,
    logical_servers: Vec<LoadUpdate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadUpdate {
    #[serde(rename = "ID")]
    id: String,
    load: Option<u32>,
    score: Option<f64>,
    status: Option<u8>,
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// The full server list and its views
#[derive(Default)]
pub struct ServerCatalog {
    data: CatalogData,
    loaded: bool,
    by_id: HashMap<String, usize>,
    slots: Vec<Slot>,
}

impl ServerCatalog {
    /// Empty catalog with no data loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any server list has been loaded
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn ensure_loaded(&self) -> Result<(), ServerListError> {
        if !self.loaded {
            error!("Server cache not found");
            return Err(ServerListError::CacheNotFound);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.logical_servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.logical_servers.is_empty()
    }

    pub fn servers(&self) -> &[LogicalServer] {
        &self.data.logical_servers
    }

    pub fn get(&self, id: &str) -> Option<&LogicalServer> {
        self.by_id.get(id).map(|&i| &self.data.logical_servers[i])
    }

    pub fn logicals_update_timestamp(&self) -> f64 {
        self.data.logicals_update_timestamp
    }

    pub fn loads_update_timestamp(&self) -> f64 {
        self.data.loads_update_timestamp
    }

    /// Replace the whole list with an API `logicals` response
    pub fn update_logical_data(&mut self, json: &str) -> Result<(), ServerListError> {
        let resp: LogicalsResponse =
            serde_json::from_str(json).map_err(|e| ServerListError::Parse(e.to_string()))?;
        if resp.code != API_CODE_OK {
            return Err(ServerListError::InvalidCode(resp.code));
        }

        let stamp = now();
        self.data = CatalogData {
            logical_servers: resp.logical_servers,
            logicals_update_timestamp: stamp,
            // Logicals carry loads too
            loads_update_timestamp: stamp,
        };
        self.loaded = true;
        info!("Loaded {} logical servers", self.len());
        self.refresh_indexes();
        Ok(())
    }

    /// Apply an API `loads` response to the servers already known
    pub fn update_load_data(&mut self, json: &str) -> Result<(), ServerListError> {
        let resp: LoadsResponse =
            serde_json::from_str(json).map_err(|e| ServerListError::Parse(e.to_string()))?;
        if resp.code != API_CODE_OK {
            return Err(ServerListError::InvalidCode(resp.code));
        }

        self.data.loads_update_timestamp = now();
        let mut updated = 0;
        for update in resp.logical_servers {
            let Some(&idx) = self.by_id.get(&update.id) else {
                continue;
            };
            let server = &mut self.data.logical_servers[idx];
            server.load = update.load.unwrap_or(server.load);
            server.score = update.score.unwrap_or(server.score);
            server.status = update.status.unwrap_or(server.status);
            updated += 1;
        }
        debug!("Updated load data for {} servers", updated);
        self.refresh_indexes();
        Ok(())
    }

    /// Restore from the cache format produced by [`to_json`](Self::to_json)
    pub fn from_json(json: &str) -> Result<Self, ServerListError> {
        let data: CatalogData =
            serde_json::from_str(json).map_err(|e| ServerListError::Parse(e.to_string()))?;
        let mut catalog = Self {
            data,
            loaded: true,
            ..Self::default()
        };
        catalog.refresh_indexes();
        Ok(catalog)
    }

    pub fn to_json(&self) -> Result<String, ServerListError> {
        serde_json::to_string(&self.data).map_err(|e| ServerListError::Parse(e.to_string()))
    }

    pub fn load_cache(path: &Path) -> Result<Self, ServerListError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServerListError::CacheNotFound
            } else {
                ServerListError::Io(e)
            }
        })?;
        let catalog = Self::from_json(&content)?;
        info!("Loaded {} servers from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn save_cache(&self, path: &Path) -> Result<(), ServerListError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Rebuild the id index and every live view
    pub fn refresh_indexes(&mut self) {
        self.by_id = self
            .data
            .logical_servers
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let servers = &self.data.logical_servers;
        for view in self.slots.iter_mut().filter_map(|s| s.view.as_mut()) {
            view.ids = Self::evaluate(servers, &view.predicate);
            Self::apply_sort(servers, view);
        }
    }

    fn evaluate(servers: &[LogicalServer], predicate: &Predicate) -> Vec<usize> {
        servers
            .iter()
            .enumerate()
            .filter(|(_, s)| predicate(s))
            .map(|(i, _)| i)
            .collect()
    }

    fn apply_sort(servers: &[LogicalServer], view: &mut View) {
        let reverse = view.reverse;
        match &view.sort {
            Some(cmp) => view.ids.sort_by(|&a, &b| {
                let o = cmp(&servers[a], &servers[b]);
                if reverse { o.reverse() } else { o }
            }),
            None => view.ids.sort_by(|a, b| if reverse { b.cmp(a) } else { a.cmp(b) }),
        }
    }

    fn view(&self, id: ViewId) -> Result<&View, ServerListError> {
        self.slots
            .get(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.view.as_ref())
            .ok_or(ServerListError::UnknownView)
    }

    fn view_mut(&mut self, id: ViewId) -> Result<&mut View, ServerListError> {
        self.slots
            .get_mut(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.view.as_mut())
            .ok_or(ServerListError::UnknownView)
    }

    /// New view over the whole catalog
    pub fn filter<F>(&mut self, predicate: F) -> ViewId
    where
        F: Fn(&LogicalServer) -> bool + Send + Sync + 'static,
    {
        self.insert_view(Arc::new(predicate))
    }

    /// New view restricted by both `parent`'s predicate and `predicate`
    pub fn filter_view<F>(&mut self, parent: ViewId, predicate: F) -> Result<ViewId, ServerListError>
    where
        F: Fn(&LogicalServer) -> bool + Send + Sync + 'static,
    {
        let outer = Arc::clone(&self.view(parent)?.predicate);
        let combined: Predicate = Arc::new(move |s: &LogicalServer| outer(s) && predicate(s));
        Ok(self.insert_view(combined))
    }

    fn insert_view(&mut self, predicate: Predicate) -> ViewId {
        let mut view = View {
            ids: Self::evaluate(&self.data.logical_servers, &predicate),
            predicate,
            sort: None,
            reverse: false,
        };
        Self::apply_sort(&self.data.logical_servers, &mut view);

        let slot = match self.slots.iter().position(|s| s.view.is_none()) {
            Some(free) => free,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let entry = &mut self.slots[slot];
        entry.view = Some(view);
        ViewId {
            slot,
            generation: entry.generation,
        }
    }

    /// Sort a view in place. `None` restores catalog order. The ordering
    /// is kept and re-applied on every refresh.
    pub fn sort_by(
        &mut self,
        id: ViewId,
        cmp: Option<Comparator>,
        reverse: bool,
    ) -> Result<(), ServerListError> {
        let servers = &self.data.logical_servers;
        let view = self
            .slots
            .get_mut(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.view.as_mut())
            .ok_or(ServerListError::UnknownView)?;
        view.sort = cmp;
        view.reverse = reverse;
        Self::apply_sort(servers, view);
        Ok(())
    }

    /// Drop a view. Its handle becomes invalid.
    pub fn release_view(&mut self, id: ViewId) -> Result<(), ServerListError> {
        self.view_mut(id)?;
        let slot = &mut self.slots[id.slot];
        slot.view = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    pub fn view_len(&self, id: ViewId) -> Result<usize, ServerListError> {
        Ok(self.view(id)?.ids.len())
    }

    /// Servers of a view, in view order
    pub fn view_servers(&self, id: ViewId) -> Result<Vec<&LogicalServer>, ServerListError> {
        let view = self.view(id)?;
        Ok(view.ids.iter().map(|&i| &self.data.logical_servers[i]).collect())
    }

    /// Number of live views
    pub fn live_views(&self) -> usize {
        self.slots.iter().filter(|s| s.view.is_some()).count()
    }

    /// Run `f` on a temporary view that is released afterwards
    pub fn with_view<F, R>(
        &mut self,
        predicate: F,
        sort: Option<Comparator>,
        f: impl FnOnce(Vec<&LogicalServer>) -> R,
    ) -> Result<R, ServerListError>
    where
        F: Fn(&LogicalServer) -> bool + Send + Sync + 'static,
    {
        let id = self.filter(predicate);
        if sort.is_some() {
            self.sort_by(id, sort, false)?;
        }
        let result = f(self.view_servers(id)?);
        self.release_view(id)?;
        Ok(result)
    }

    /// Give `physical` the canonical domain of a non secure-core server
    /// sharing its exit IP
    ///
    /// Secure-core entries reuse exit IPs under a different domain than
    /// the direct entry; the certificate is issued for the direct one.
    pub fn match_server_domain(&self, physical: &mut PhysicalServer) {
        for logical in &self.data.logical_servers {
            if logical.has_feature(Features::SECURE_CORE) {
                continue;
            }
            let matched = logical
                .servers
                .iter()
                .filter(|p| p.exit_ip == physical.exit_ip)
                .last();
            if let Some(found) = matched {
                if found.domain != physical.domain {
                    debug!("Domain {} replaced with {}", physical.domain, found.domain);
                }
                physical.domain = found.domain.clone();
                return;
            }
        }
    }
}

impl fmt::Debug for ServerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerCatalog<{} servers, {} views>", self.len(), self.live_views())
    }
}

//! A persisted, user-managed list of servers
//!
//! This is the model behind an interactive front end (a tray menu in the
//! desktop program): entries can be created, started, stopped, restarted,
//! re-pointed at another directory and flagged for auto start. The supervisor
//! itself never touches the filesystem; the fleet converts between
//! [`ServerInstance`]s and the descriptors stored by [`ConfigStore`].

use crate::config::{ConfigIoError, ConfigStore, FleetConfig, PortConfig, ServerDescriptor};
use crate::error::ServerError;
use crate::instance::ServerInstance;
use crate::listener::Serve;
use futures::future::join_all;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// First HTTP port handed to servers created through [`Fleet::create_server`]
pub const FIRST_CREATED_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("unknown server id '{0}'")]
    UnknownServer(String),

    #[error("a server with id '{0}' already exists")]
    DuplicateServer(String),

    #[error(transparent)]
    Server(#[from] ServerError),
}

#[derive(Debug)]
pub struct FleetEntry {
    pub id: String,
    pub server: ServerInstance,
    pub auto_start: bool,
    /// Last startup failure, cleared by the next successful start
    pub warning: Option<String>,
}

impl FleetEntry {
    pub fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor {
            name: self.server.name().to_string(),
            path: self.server.path().to_path_buf(),
            port: PortConfig {
                http: self.server.http_port(),
                https: self.server.https_port(),
            },
            auto_start: self.auto_start,
        }
    }
}

/// What a front end needs to render one entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuItem {
    pub id: String,
    pub label: String,
    pub running: bool,
    pub path: PathBuf,
    pub auto_start: bool,
    pub warning: Option<String>,
}

pub struct Fleet {
    entries: Vec<FleetEntry>,
    serve: Option<Arc<dyn Serve>>,
}

impl Fleet {
    /// Empty fleet using the process-wide static server
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            serve: None,
        }
    }

    /// Empty fleet whose servers use `serve` to start listeners
    pub fn with_server(serve: Arc<dyn Serve>) -> Self {
        Self {
            entries: Vec::new(),
            serve: Some(serve),
        }
    }

    pub fn from_config(config: &FleetConfig) -> Result<Self, FleetError> {
        let mut fleet = Self::new();
        fleet.load(config)?;
        Ok(fleet)
    }

    pub fn from_config_with_server(
        config: &FleetConfig,
        serve: Arc<dyn Serve>,
    ) -> Result<Self, FleetError> {
        let mut fleet = Self::with_server(serve);
        fleet.load(config)?;
        Ok(fleet)
    }

    /// Append the servers described by `config`
    pub fn load(&mut self, config: &FleetConfig) -> Result<(), FleetError> {
        for descriptor in &config.server_list {
            self.add(descriptor.clone())?;
        }
        Ok(())
    }

    /// Current state as a descriptor list, ready to be saved
    pub fn to_config(&self) -> FleetConfig {
        FleetConfig {
            server_list: self.entries.iter().map(FleetEntry::descriptor).collect(),
        }
    }

    pub fn entries(&self) -> &[FleetEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&FleetEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut FleetEntry, FleetError> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| FleetError::UnknownServer(id.to_string()))
    }

    /// Add a server; its id is derived from the name and must be unique
    pub fn add(&mut self, descriptor: ServerDescriptor) -> Result<&FleetEntry, FleetError> {
        let id = server_id(&descriptor.name);
        if self.get(&id).is_some() {
            return Err(FleetError::DuplicateServer(id));
        }

        let server = match &self.serve {
            Some(serve) => ServerInstance::with_server(
                descriptor.name,
                descriptor.path,
                descriptor.port.http,
                descriptor.port.https,
                Arc::clone(serve),
            ),
            None => ServerInstance::new(
                descriptor.name,
                descriptor.path,
                descriptor.port.http,
                descriptor.port.https,
            ),
        };

        self.entries.push(FleetEntry {
            id,
            server,
            auto_start: descriptor.auto_start,
            warning: None,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// New server named after its position, on the next free default port
    pub fn create_server(&mut self, path: impl Into<PathBuf>) -> Result<&FleetEntry, FleetError> {
        let count = self.entries.len();
        let port = u16::try_from(count)
            .ok()
            .and_then(|n| FIRST_CREATED_PORT.checked_add(n))
            .ok_or_else(|| ServerError::validation("no default port left for a new server"))?;

        self.add(ServerDescriptor {
            name: count.to_string(),
            path: path.into(),
            port: PortConfig {
                http: Some(port),
                https: None,
            },
            auto_start: false,
        })
    }

    /// Stop and forget a server
    pub fn remove(&mut self, id: &str) -> Result<FleetEntry, FleetError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| FleetError::UnknownServer(id.to_string()))?;

        let mut entry = self.entries.remove(index);
        if entry.server.alive() {
            entry.server.disconnect();
        }
        Ok(entry)
    }

    /// Point a server at another directory, restarting it if it was running
    pub async fn change_path(&mut self, id: &str, path: impl AsRef<Path>) -> Result<(), FleetError> {
        let entry = self.get_mut(id)?;
        entry.server.set_directory(path.as_ref());
        let result = entry_reconnect(entry).await;
        record(entry, result)
    }

    /// Start a stopped server or stop a running one
    pub async fn toggle(&mut self, id: &str) -> Result<(), FleetError> {
        let entry = self.get_mut(id)?;
        if entry.server.alive() {
            entry.server.disconnect();
            Ok(())
        } else {
            let result = entry.server.connect().await.map(|_| ());
            record(entry, result)
        }
    }

    pub async fn restart(&mut self, id: &str) -> Result<(), FleetError> {
        let entry = self.get_mut(id)?;
        let result = entry_reconnect(entry).await;
        record(entry, result)
    }

    pub fn set_auto_start(&mut self, id: &str, auto_start: bool) -> Result<(), FleetError> {
        self.get_mut(id)?.auto_start = auto_start;
        Ok(())
    }

    /// Connect every auto-start entry concurrently; failures become warnings
    pub async fn auto_start(&mut self) {
        let starts = self
            .entries
            .iter_mut()
            .filter(|e| e.auto_start && !e.server.alive())
            .map(|entry| async move {
                let result = entry.server.connect().await.map(|_| ());
                let _ = record(entry, result);
            });

        join_all(starts).await;
    }

    /// Stop every server in construction order
    pub fn disconnect_all(&mut self) {
        for entry in &mut self.entries {
            entry.server.disconnect();
        }
    }

    /// Save the current state; the fleet is left untouched on failure
    pub fn persist(&self, store: &ConfigStore) -> Result<(), ConfigIoError> {
        store.save(&self.to_config()).map_err(|e| {
            error!(path = %store.path().display(), error = %e, "Error occurred while updating the config file");
            e
        })
    }

    pub fn menu(&self) -> Vec<MenuItem> {
        self.entries
            .iter()
            .map(|entry| MenuItem {
                id: entry.id.clone(),
                label: format!(
                    "Server \"{}\" : {}",
                    entry.server.name(),
                    entry
                        .server
                        .port()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string())
                ),
                running: entry.server.alive(),
                path: entry.server.path().to_path_buf(),
                auto_start: entry.auto_start,
                warning: entry.warning.clone(),
            })
            .collect()
    }
}

impl Default for Fleet {
    fn default() -> Self {
        Self::new()
    }
}

async fn entry_reconnect(entry: &mut FleetEntry) -> Result<(), ServerError> {
    entry.server.reconnect().await.map(|_| ())
}

/// Store the outcome of a start on the entry and pass it on
fn record(entry: &mut FleetEntry, result: Result<(), ServerError>) -> Result<(), FleetError> {
    match result {
        Ok(()) => {
            if entry.warning.take().is_some() {
                info!(id = %entry.id, "Server recovered from previous failure");
            }
            Ok(())
        }
        Err(e) => {
            warn!(id = %entry.id, error = %e, "Server failed to start");
            entry.warning = Some(e.to_string());
            Err(e.into())
        }
    }
}

/// `server_<snake_case name>`, safe as a config key and in URLs
pub fn server_id(name: &str) -> String {
    let mut snake = String::with_capacity(name.len() + 8);
    let mut prev: Option<char> = None;

    for c in name.chars() {
        if c.is_alphanumeric() {
            let boundary = match prev {
                Some(p) => {
                    (c.is_uppercase() && (p.is_lowercase() || p.is_ascii_digit()))
                        || (c.is_ascii_digit() && p.is_alphabetic())
                        || (c.is_alphabetic() && p.is_ascii_digit())
                }
                None => false,
            };
            if boundary && !snake.is_empty() && !snake.ends_with('_') {
                snake.push('_');
            }
            snake.extend(c.to_lowercase());
        } else if !snake.is_empty() && !snake.ends_with('_') {
            snake.push('_');
        }
        prev = Some(c);
    }

    let snake = snake.trim_end_matches('_');
    format!("server_{}", snake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServeError;
    use crate::listener::{Listener, ListenerConfig, ListenerSink};
    use parking_lot::Mutex;

    /// Listens on every port except the ones marked busy
    #[derive(Default)]
    struct FakeServe {
        busy: Mutex<Vec<u16>>,
        sinks: Mutex<Vec<ListenerSink>>,
    }

    impl Serve for FakeServe {
        fn serve(&self, config: ListenerConfig) -> Listener {
            let (listener, sink) = Listener::channel(config.protocol);
            if self.busy.lock().contains(&config.port) {
                sink.failed(ServeError::Bind {
                    addr: format!("0.0.0.0:{}", config.port),
                    source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
                });
            } else {
                sink.listening(vec![format!("http://127.0.0.1:{}", config.port)]);
            }
            self.sinks.lock().push(sink);
            listener
        }
    }

    fn descriptor(name: &str, http: u16, auto_start: bool) -> ServerDescriptor {
        ServerDescriptor {
            name: name.to_string(),
            path: PathBuf::from(format!("/srv/{}", name)),
            port: PortConfig {
                http: Some(http),
                https: None,
            },
            auto_start,
        }
    }

    fn fleet(fake: &Arc<FakeServe>) -> Fleet {
        Fleet::with_server(Arc::clone(fake) as Arc<dyn Serve>)
    }

    #[test]
    fn test_server_id() {
        assert_eq!(server_id("player"), "server_player");
        assert_eq!(server_id("Player Assets"), "server_player_assets");
        assert_eq!(server_id("editorAssets"), "server_editor_assets");
        assert_eq!(server_id("WM.Editor"), "server_wm_editor");
        assert_eq!(server_id("0"), "server_0");
        assert_eq!(server_id("version2"), "server_version_2");
    }

    #[test]
    fn test_config_round_trip_preserves_order() {
        let fake = Arc::new(FakeServe::default());
        let mut fleet = fleet(&fake);
        let config = FleetConfig {
            server_list: vec![descriptor("player", 8001, true), descriptor("editor", 8002, false)],
        };

        fleet.load(&config).unwrap();
        assert_eq!(fleet.to_config(), config);
        assert_eq!(fleet.entries()[0].id, "server_player");
        assert_eq!(fleet.entries()[1].id, "server_editor");
    }

    #[test]
    fn test_from_config() {
        let config = FleetConfig {
            server_list: vec![descriptor("player", 8001, true), descriptor("editor", 8002, false)],
        };

        let fleet = Fleet::from_config(&config).unwrap();
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet.to_config(), config);

        let duplicated = FleetConfig {
            server_list: vec![descriptor("player", 8001, true), descriptor("Player", 8002, false)],
        };
        assert!(matches!(
            Fleet::from_config(&duplicated),
            Err(FleetError::DuplicateServer(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_with_server_uses_injected_server() {
        let fake = Arc::new(FakeServe::default());
        let config = FleetConfig {
            server_list: vec![descriptor("player", 8001, true)],
        };

        let mut fleet =
            Fleet::from_config_with_server(&config, Arc::clone(&fake) as Arc<dyn Serve>).unwrap();
        fleet.auto_start().await;

        assert!(fleet.get("server_player").unwrap().server.alive());
        assert_eq!(fake.sinks.lock().len(), 1);
        fleet.disconnect_all();
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let fake = Arc::new(FakeServe::default());
        let mut fleet = fleet(&fake);

        fleet.add(descriptor("Main Server", 8001, false)).unwrap();
        let err = fleet.add(descriptor("main_server", 8002, false)).unwrap_err();
        assert!(matches!(err, FleetError::DuplicateServer(ref id) if id == "server_main_server"));
        assert_eq!(fleet.len(), 1);
    }

    #[test]
    fn test_create_server_uses_next_port() {
        let fake = Arc::new(FakeServe::default());
        let mut fleet = fleet(&fake);

        let first = fleet.create_server("/srv/a").unwrap();
        assert_eq!(first.server.name(), "0");
        assert_eq!(first.server.http_port(), Some(8080));

        let second = fleet.create_server("/srv/b").unwrap();
        assert_eq!(second.id, "server_1");
        assert_eq!(second.server.http_port(), Some(8081));
        assert!(!second.auto_start);
    }

    #[tokio::test]
    async fn test_toggle_records_warning() {
        let fake = Arc::new(FakeServe::default());
        fake.busy.lock().push(8001);
        let mut fleet = fleet(&fake);
        fleet.add(descriptor("player", 8001, false)).unwrap();

        let err = fleet.toggle("server_player").await.unwrap_err();
        assert!(matches!(err, FleetError::Server(ServerError::Startup { .. })));
        let entry = fleet.get("server_player").unwrap();
        assert!(!entry.server.alive());
        assert!(entry.warning.as_deref().unwrap().contains("player"));

        fake.busy.lock().clear();
        fleet.toggle("server_player").await.unwrap();
        let entry = fleet.get("server_player").unwrap();
        assert!(entry.server.alive());
        assert!(entry.warning.is_none());

        fleet.toggle("server_player").await.unwrap();
        assert!(!fleet.get("server_player").unwrap().server.alive());
    }

    #[tokio::test]
    async fn test_auto_start_only_flagged_entries() {
        let fake = Arc::new(FakeServe::default());
        fake.busy.lock().push(8003);
        let mut fleet = fleet(&fake);
        fleet.add(descriptor("player", 8001, true)).unwrap();
        fleet.add(descriptor("editor", 8002, false)).unwrap();
        fleet.add(descriptor("broken", 8003, true)).unwrap();

        fleet.auto_start().await;

        let menu = fleet.menu();
        assert!(menu[0].running);
        assert!(!menu[1].running);
        assert!(!menu[2].running);
        assert!(menu[2].warning.is_some());
        assert_eq!(menu[0].label, "Server \"player\" : 8001");

        fleet.disconnect_all();
        assert!(fleet.menu().iter().all(|item| !item.running));
    }

    #[tokio::test]
    async fn test_change_path_restarts_running_server() {
        let fake = Arc::new(FakeServe::default());
        let mut fleet = fleet(&fake);
        fleet.add(descriptor("player", 8001, false)).unwrap();

        fleet.change_path("server_player", "/srv/elsewhere").await.unwrap();
        let entry = fleet.get("server_player").unwrap();
        assert_eq!(entry.server.path(), Path::new("/srv/elsewhere"));
        assert!(!entry.server.alive());

        fleet.toggle("server_player").await.unwrap();
        fleet.change_path("server_player", "/srv/third").await.unwrap();
        let entry = fleet.get("server_player").unwrap();
        assert!(entry.server.alive());
        assert_eq!(fake.sinks.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_and_unknown_ids() {
        let fake = Arc::new(FakeServe::default());
        let mut fleet = fleet(&fake);
        fleet.add(descriptor("player", 8001, false)).unwrap();
        fleet.toggle("server_player").await.unwrap();

        let removed = fleet.remove("server_player").unwrap();
        assert!(!removed.server.alive());
        assert!(fleet.is_empty());

        assert!(matches!(
            fleet.toggle("server_player").await,
            Err(FleetError::UnknownServer(_))
        ));
        assert!(fleet.set_auto_start("server_nope", true).is_err());
    }

    #[test]
    fn test_persist_writes_current_state() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ConfigStore::new(tmp.path().join("config.json"));
        let fake = Arc::new(FakeServe::default());
        let mut fleet = fleet(&fake);
        fleet.add(descriptor("player", 8001, false)).unwrap();
        fleet.set_auto_start("server_player", true).unwrap();

        fleet.persist(&store).unwrap();
        let saved = store.load().unwrap();
        assert!(saved.server_list[0].auto_start);
        assert_eq!(saved.server_list[0].port.http, Some(8001));
    }
}

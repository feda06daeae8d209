//! Supervisor for one named static/proxy server
//!
//! A [`ServerInstance`] owns the desired configuration of a logical server
//! (directory, optional HTTP and HTTPS ports, alias rewrite rules) and drives
//! up to two listeners through an injected [`Serve`] primitive.
//!
//! ```ignore
//! let mut player = ServerInstance::new("player", "../player", Some(8001), None);
//! player.connect().await?;
//!
//! let mut main = ServerInstance::new("main", "public", Some(80), None);
//! main.add_alias_path("mt", &player)?;
//! main.connect().await?;
//! ```
//!
//! Aliases capture the target's listen URL when they are registered. If the
//! target later restarts on another address the alias keeps pointing at the
//! old one until it is registered again.

use crate::error::{ServeError, ServerError};
use crate::listener::{Listener, ListenerConfig, Protocol, Serve};
use crate::rewrite::{is_absolute_url, RewriteRule, RewriteRules};
use crate::server::StaticServer;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Not listening
    Configured,
    /// Listeners are being started
    Connecting,
    /// At least one listener is bound
    Running,
    /// Listeners are being shut down
    Disconnecting,
}

/// Target of an alias path
#[derive(Clone, Copy)]
pub enum AliasTarget<'a> {
    /// Another instance; it must be alive
    Instance(&'a ServerInstance),
    /// Any absolute http(s) URL
    Url(&'a str),
}

impl<'a> From<&'a ServerInstance> for AliasTarget<'a> {
    fn from(instance: &'a ServerInstance) -> Self {
        AliasTarget::Instance(instance)
    }
}

impl<'a> From<&'a str> for AliasTarget<'a> {
    fn from(url: &'a str) -> Self {
        AliasTarget::Url(url)
    }
}

pub struct ServerInstance {
    name: String,
    directory: PathBuf,
    http_port: Option<u16>,
    https_port: Option<u16>,
    rewrite_rules: RewriteRules,
    listen_addresses: Vec<String>,
    listeners: Vec<Listener>,
    state: InstanceState,
    serve: Arc<dyn Serve>,
}

impl ServerInstance {
    /// Create an instance served by the process-wide [`StaticServer`]
    pub fn new(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        http_port: Option<u16>,
        https_port: Option<u16>,
    ) -> Self {
        Self::with_server(name, directory, http_port, https_port, StaticServer::shared())
    }

    pub fn with_server(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        http_port: Option<u16>,
        https_port: Option<u16>,
        serve: Arc<dyn Serve>,
    ) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            http_port,
            https_port,
            rewrite_rules: RewriteRules::new(),
            listen_addresses: Vec::new(),
            listeners: Vec::new(),
            state: InstanceState::Configured,
            serve,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Same as [`directory`](Self::directory), the name used by the fleet config
    pub fn path(&self) -> &Path {
        &self.directory
    }

    pub fn http_port(&self) -> Option<u16> {
        self.http_port
    }

    pub fn https_port(&self) -> Option<u16> {
        self.https_port
    }

    /// HTTP port if set, otherwise the HTTPS port; used for display
    pub fn port(&self) -> Option<u16> {
        self.http_port.or(self.https_port)
    }

    pub fn http(&self) -> bool {
        self.http_port.is_some()
    }

    pub fn https(&self) -> bool {
        self.https_port.is_some()
    }

    pub fn alive(&self) -> bool {
        !self.listen_addresses.is_empty()
    }

    pub fn listen_url(&self) -> Option<&str> {
        self.listen_addresses.first().map(String::as_str)
    }

    pub fn listen_addresses(&self) -> &[String] {
        &self.listen_addresses
    }

    pub fn rewrite_rules(&self) -> &RewriteRules {
        &self.rewrite_rules
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn enable_http(&mut self, port: u16) -> &mut Self {
        self.http_port = Some(port);
        self
    }

    pub fn enable_https(&mut self, port: u16) -> &mut Self {
        self.https_port = Some(port);
        self
    }

    pub fn disable_http(&mut self) -> &mut Self {
        self.http_port = None;
        self
    }

    pub fn disable_https(&mut self) -> &mut Self {
        self.https_port = None;
        self
    }

    pub fn set_directory(&mut self, directory: impl Into<PathBuf>) -> &mut Self {
        self.directory = directory.into();
        self
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    /// Route `/{prefix}/...` to the target's current listen URL
    pub fn add_alias_path<'a>(
        &mut self,
        prefix: &str,
        target: impl Into<AliasTarget<'a>>,
    ) -> Result<&mut Self, ServerError> {
        let target_url = alias_target_url(target.into())?.to_string();
        self.push_alias(prefix, &target_url)
    }

    /// Like [`add_alias_path`](Self::add_alias_path) but forwarding to `redirect_url`.
    ///
    /// The target is still checked, so an instance target must be alive.
    pub fn add_alias_path_with_url<'a>(
        &mut self,
        prefix: &str,
        target: impl Into<AliasTarget<'a>>,
        redirect_url: &str,
    ) -> Result<&mut Self, ServerError> {
        alias_target_url(target.into())?;
        self.push_alias(prefix, redirect_url)
    }

    /// Add a `"<from> -> <to>"` rule, where `to` is a local path or an absolute http(s) URL.
    ///
    /// Rules and aliases share one list; the first match wins.
    pub fn add_rewrite_rule(&mut self, rule: &str) -> Result<&mut Self, ServerError> {
        let rule = RewriteRule::parse(rule).map_err(|e| ServerError::validation(e.to_string()))?;
        if is_absolute_url(rule.to()) {
            validate_url(rule.to())?;
        } else if !rule.to().starts_with('/') {
            return Err(ServerError::validation(format!(
                "rewrite target must be an absolute path or URL: '{}'",
                rule.to()
            )));
        }

        info!(name = %self.name, rule = %rule, "Rewrite rule added");
        self.rewrite_rules.push(rule);
        Ok(self)
    }

    fn push_alias(&mut self, prefix: &str, target_url: &str) -> Result<&mut Self, ServerError> {
        validate_url(target_url)?;
        let rule = RewriteRule::alias(prefix, target_url)
            .map_err(|e| ServerError::validation(e.to_string()))?;

        info!(name = %self.name, rule = %rule, "Path alias added");
        self.rewrite_rules.push(rule);
        Ok(self)
    }

    /// Start every enabled listener.
    ///
    /// Both listeners are started together and awaited; if either fails the
    /// other is closed before the error is returned, so a failed connect never
    /// leaves a listener behind.
    pub async fn connect(&mut self) -> Result<&mut Self, ServerError> {
        if !self.http() && !self.https() {
            debug!(name = %self.name, "No protocol enabled, nothing to start");
            return Ok(self);
        }

        info!(name = %self.name, http_port = ?self.http_port, https_port = ?self.https_port, "Creating server");
        self.state = InstanceState::Connecting;

        let mut http = self.http_port.map(|port| self.start(Protocol::Http, port));
        let mut https = self.https_port.map(|port| self.start(Protocol::Https, port));

        let (http_result, https_result) = tokio::join!(
            settle(http.as_mut()),
            settle(https.as_mut())
        );

        let mut addresses = Vec::new();
        let mut failure: Option<ServeError> = None;
        for result in [http_result, https_result] {
            match result {
                Ok(urls) => addresses.extend(urls),
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        let listeners: Vec<Listener> = http.into_iter().chain(https).collect();

        if let Some(cause) = failure {
            for listener in listeners {
                release(&self.name, listener);
            }
            // Listeners from an earlier connect keep running
            self.state = if self.listeners.is_empty() {
                InstanceState::Configured
            } else {
                InstanceState::Running
            };
            warn!(name = %self.name, error = %cause, "Unable to start the server");
            return Err(ServerError::Startup {
                name: self.name.clone(),
                cause,
            });
        }

        self.listeners.extend(listeners);
        self.listen_addresses.extend(addresses);
        self.state = InstanceState::Running;
        info!(name = %self.name, addresses = %self.listen_addresses.join(", "), "Server is listening");

        Ok(self)
    }

    fn start(&self, protocol: Protocol, port: u16) -> Listener {
        self.serve.serve(ListenerConfig {
            name: self.name.clone(),
            directory: self.directory.clone(),
            port,
            protocol,
            rewrite: self.rewrite_rules.clone(),
        })
    }

    /// Stop all listeners. Never fails; the sockets are released asynchronously.
    pub fn disconnect(&mut self) -> &mut Self {
        info!(name = %self.name, "Stopping server");
        self.state = InstanceState::Disconnecting;

        for listener in std::mem::take(&mut self.listeners) {
            debug!(name = %self.name, protocol = %listener.protocol(), "Closing listener");
            release(&self.name, listener);
        }
        self.listen_addresses.clear();

        self.state = InstanceState::Configured;
        info!(name = %self.name, "Server stopped");
        self
    }

    pub fn close(&mut self) -> &mut Self {
        self.disconnect()
    }

    /// Disconnect and connect again; does nothing unless alive
    pub async fn reconnect(&mut self) -> Result<&mut Self, ServerError> {
        if !self.alive() {
            return Ok(self);
        }

        self.disconnect();
        self.connect().await
    }
}

impl fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInstance")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("http_port", &self.http_port)
            .field("https_port", &self.https_port)
            .field("rewrite_rules", &self.rewrite_rules.len())
            .field("listen_addresses", &self.listen_addresses)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if !self.listeners.is_empty() {
            warn!(name = %self.name, "Server dropped while running, closing listeners");
            for listener in &self.listeners {
                listener.close();
            }
        }
    }
}

/// Request shutdown and log once the listener task reports it has stopped
fn release(name: &str, listener: Listener) {
    listener.close();
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };

    let name = name.to_string();
    let protocol = listener.protocol();
    handle.spawn(async move {
        listener.closed().await;
        debug!(name = %name, protocol = %protocol, "Listener closed");
    });
}

async fn settle(listener: Option<&mut Listener>) -> Result<Vec<String>, ServeError> {
    match listener {
        Some(listener) => listener.listening().await,
        None => Ok(Vec::new()),
    }
}

fn alias_target_url<'a>(target: AliasTarget<'a>) -> Result<&'a str, ServerError> {
    match target {
        AliasTarget::Instance(instance) => instance
            .listen_url()
            .ok_or_else(|| ServerError::Precondition(instance.name().to_string())),
        AliasTarget::Url(url) => Ok(url),
    }
}

fn validate_url(url: &str) -> Result<(), ServerError> {
    if !is_absolute_url(url) {
        return Err(ServerError::validation(format!(
            "alias target must be an absolute http(s) URL: '{}'",
            url
        )));
    }
    let uri: hyper::Uri = url
        .parse()
        .map_err(|e| ServerError::validation(format!("invalid alias target '{}': {}", url, e)))?;
    if uri.authority().is_none() {
        return Err(ServerError::validation(format!(
            "alias target has no host: '{}'",
            url
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerSink;
    use crate::rewrite::Rewritten;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Serve primitive that never touches the network
    #[derive(Default)]
    struct FakeServe {
        /// Ports that fail to bind
        busy: Mutex<HashSet<u16>>,
        started: Mutex<Vec<ListenerConfig>>,
        sinks: Mutex<Vec<ListenerSink>>,
    }

    impl FakeServe {
        fn busy(ports: &[u16]) -> Arc<Self> {
            let fake = FakeServe::default();
            fake.busy.lock().extend(ports.iter().copied());
            Arc::new(fake)
        }

        fn started(&self) -> usize {
            self.started.lock().len()
        }

        fn closed(&self) -> usize {
            self.sinks
                .lock()
                .iter()
                .filter(|sink| *sink.shutdown().borrow())
                .count()
        }
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
                sink.listening(vec![format!(
                    "{}://127.0.0.1:{}",
                    config.protocol.scheme(),
                    config.port
                )]);
            }
            self.started.lock().push(config);
            self.sinks.lock().push(sink);
            listener
        }
    }

    fn instance(fake: &Arc<FakeServe>, name: &str, http: Option<u16>, https: Option<u16>) -> ServerInstance {
        let serve: Arc<dyn Serve> = Arc::clone(fake) as Arc<dyn Serve>;
        ServerInstance::with_server(name, "/srv", http, https, serve)
    }

    #[test]
    fn test_accessors() {
        let fake = FakeServe::busy(&[]);
        let mut server = instance(&fake, "player", None, Some(8443));

        assert_eq!(server.name(), "player");
        assert_eq!(server.path(), Path::new("/srv"));
        assert!(!server.http());
        assert!(server.https());
        assert_eq!(server.port(), Some(8443));
        assert!(!server.alive());
        assert_eq!(server.listen_url(), None);
        assert_eq!(server.state(), InstanceState::Configured);

        server.enable_http(8001).set_name("editor").set_directory("/editor");
        assert_eq!(server.port(), Some(8001));
        assert_eq!(server.name(), "editor");
        assert_eq!(server.directory(), Path::new("/editor"));

        server.disable_http().disable_https();
        assert_eq!(server.port(), None);
    }

    #[tokio::test]
    async fn test_connect_without_ports_is_noop() {
        let fake = FakeServe::busy(&[]);
        let mut server = instance(&fake, "idle", None, None);

        server.connect().await.unwrap();
        assert!(!server.alive());
        assert_eq!(fake.started(), 0);
        assert_eq!(server.state(), InstanceState::Configured);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let fake = FakeServe::busy(&[]);
        let mut server = instance(&fake, "main", Some(8080), Some(8443));

        server.connect().await.unwrap();
        assert!(server.alive());
        assert_eq!(server.state(), InstanceState::Running);
        assert_eq!(server.listen_url(), Some("http://127.0.0.1:8080"));
        assert_eq!(
            server.listen_addresses(),
            &["http://127.0.0.1:8080".to_string(), "https://127.0.0.1:8443".to_string()]
        );

        server.disconnect();
        assert!(!server.alive());
        assert_eq!(server.state(), InstanceState::Configured);
        assert_eq!(fake.closed(), 2);
    }

    #[tokio::test]
    async fn test_failed_listener_rolls_back_the_other() {
        let fake = FakeServe::busy(&[80]);
        let mut server = instance(&fake, "main", Some(80), Some(443));

        let err = server.connect().await.unwrap_err();
        match err {
            ServerError::Startup { name, cause } => {
                assert_eq!(name, "main");
                assert!(matches!(cause, ServeError::Bind { .. }));
            }
            other => panic!("expected startup error, got {:?}", other),
        }

        assert!(!server.alive());
        assert_eq!(server.state(), InstanceState::Configured);
        assert_eq!(fake.started(), 2);
        assert_eq!(fake.closed(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_running_listeners() {
        let fake = FakeServe::busy(&[80]);
        let mut server = instance(&fake, "main", Some(8001), None);

        server.connect().await.unwrap();
        server.enable_http(80);
        assert!(server.connect().await.unwrap_err().is_startup());

        assert!(server.alive());
        assert_eq!(server.state(), InstanceState::Running);
        assert_eq!(server.listen_addresses(), &["http://127.0.0.1:8001".to_string()]);
        assert_eq!(fake.closed(), 1);

        server.disconnect();
        assert_eq!(server.state(), InstanceState::Configured);
        assert_eq!(fake.closed(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_when_not_alive_is_noop() {
        let fake = FakeServe::busy(&[]);
        let mut server = instance(&fake, "player", Some(8001), None);

        server.reconnect().await.unwrap();
        assert!(!server.alive());
        assert_eq!(fake.started(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_picks_up_new_directory() {
        let fake = FakeServe::busy(&[]);
        let mut server = instance(&fake, "player", Some(8001), None);

        server.connect().await.unwrap();
        server.set_directory("/other");
        server.reconnect().await.unwrap();

        assert!(server.alive());
        assert_eq!(server.listen_addresses().len(), 1);
        let started = fake.started.lock();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].directory, PathBuf::from("/other"));
        drop(started);
        assert_eq!(fake.closed(), 1);
    }

    #[test]
    fn test_alias_requires_alive_target() {
        let fake = FakeServe::busy(&[]);
        let player = instance(&fake, "player", Some(8001), None);
        let mut main = instance(&fake, "main", Some(8080), None);

        let err = main.add_alias_path("mt", &player).unwrap_err();
        assert!(matches!(err, ServerError::Precondition(ref name) if name == "player"));
        assert!(main.rewrite_rules().is_empty());
    }

    #[tokio::test]
    async fn test_alias_to_alive_target() {
        let fake = FakeServe::busy(&[]);
        let mut player = instance(&fake, "player", Some(8001), None);
        let mut main = instance(&fake, "main", Some(8080), None);

        player.connect().await.unwrap();
        main.add_alias_path("mt", &player)
            .unwrap()
            .add_alias_path("WM.Editor", "http://localhost:8002")
            .unwrap();

        let rules: Vec<String> = main.rewrite_rules().iter().map(|r| r.to_string()).collect();
        assert_eq!(
            rules,
            vec![
                "/mt/(.*) -> http://127.0.0.1:8001/$1".to_string(),
                "/WM.Editor/(.*) -> http://localhost:8002/$1".to_string(),
            ]
        );

        main.connect().await.unwrap();
        let started = fake.started.lock();
        assert_eq!(started.last().unwrap().rewrite.len(), 2);
    }

    #[tokio::test]
    async fn test_alias_is_point_in_time() {
        let fake = FakeServe::busy(&[]);
        let mut player = instance(&fake, "player", Some(8001), None);
        let mut main = instance(&fake, "main", Some(8080), None);

        player.connect().await.unwrap();
        main.add_alias_path("mt", &player).unwrap();

        player.disconnect().enable_http(9001);
        player.connect().await.unwrap();

        let rule = main.rewrite_rules().iter().next().unwrap();
        assert_eq!(rule.to(), "http://127.0.0.1:8001/$1");
    }

    #[tokio::test]
    async fn test_alias_with_explicit_url() {
        let fake = FakeServe::busy(&[]);
        let mut player = instance(&fake, "player", Some(8001), None);
        let mut main = instance(&fake, "main", Some(8080), None);

        assert!(matches!(
            main.add_alias_path_with_url("mt", &player, "http://player.local:8001"),
            Err(ServerError::Precondition(_))
        ));

        player.connect().await.unwrap();
        main.add_alias_path_with_url("mt", &player, "http://player.local:8001")
            .unwrap();
        assert_eq!(
            main.rewrite_rules().iter().next().unwrap().to(),
            "http://player.local:8001/$1"
        );
    }

    #[test]
    fn test_add_rewrite_rule() {
        let fake = FakeServe::busy(&[]);
        let mut main = instance(&fake, "main", Some(8080), None);

        main.add_rewrite_rule("/old/:file -> /new/$1")
            .unwrap()
            .add_rewrite_rule("/cdn/(.*) -> http://127.0.0.1:8001/$1")
            .unwrap();

        let rules = main.rewrite_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules.resolve("/old/a.txt"),
            Some(Rewritten::Local("/new/a.txt".to_string()))
        );
        assert_eq!(
            rules.resolve("/cdn/x.js"),
            Some(Rewritten::Proxy("http://127.0.0.1:8001/x.js".to_string()))
        );

        assert!(matches!(
            main.add_rewrite_rule("/no-arrow"),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            main.add_rewrite_rule("/a -> relative/path"),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            main.add_rewrite_rule("/a -> ftp://host/x"),
            Err(ServerError::Validation(_))
        ));
        assert_eq!(main.rewrite_rules().len(), 2);
    }

    #[test]
    fn test_alias_validation() {
        let fake = FakeServe::busy(&[]);
        let mut main = instance(&fake, "main", Some(8080), None);

        assert!(matches!(
            main.add_alias_path("", "http://127.0.0.1:8001"),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            main.add_alias_path("..", "http://127.0.0.1:8001"),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            main.add_alias_path("mt", "not a url"),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            main.add_alias_path("mt", "ftp://127.0.0.1"),
            Err(ServerError::Validation(_))
        ));
        assert!(main.rewrite_rules().is_empty());
    }
}

//! Static file listener with rewrite-rule proxying, the default [`Serve`] implementation
//!
//! Each call to [`StaticServer::serve`] binds one socket on a spawned task and
//! serves HTTP/1.1 and HTTP/2 (over TLS for HTTPS listeners). Requests are
//! matched against the listener's rewrite rules first; absolute-URL targets are
//! forwarded upstream, path targets are served locally, and everything else
//! falls through to the static directory.

use crate::error::{json_error_response, ServeError, ServeErrorCode};
use crate::listener::{listen_urls, Listener, ListenerConfig, ListenerSink, Serve};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::rewrite::{RewriteRules, Rewritten};
use crate::tls::{TlsIdentity, TlsSettings};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const INDEX_FILE: &str = "index.html";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Settings shared by every listener a [`StaticServer`] starts
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Bind address (default: 0.0.0.0)
    pub bind: IpAddr,
    pub tls: TlsSettings,
    pub pool: PoolConfig,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tls: TlsSettings::default(),
            pool: PoolConfig::default(),
        }
    }
}

pub struct StaticServer {
    options: ServeOptions,
    pool: Arc<ConnectionPool>,
    identity: Mutex<Option<Arc<TlsIdentity>>>,
}

impl StaticServer {
    pub fn new(options: ServeOptions) -> Self {
        let pool = Arc::new(ConnectionPool::new(options.pool.clone()));
        Self {
            options,
            pool,
            identity: Mutex::new(None),
        }
    }

    /// Process-wide server with default options
    pub fn shared() -> Arc<StaticServer> {
        static SHARED: OnceLock<Arc<StaticServer>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(StaticServer::new(ServeOptions::default()))))
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Load or generate the TLS identity once; failures are retried on next use
    fn identity(&self) -> Result<Arc<TlsIdentity>, ServeError> {
        let mut slot = self.identity.lock();
        if let Some(identity) = slot.as_ref() {
            return Ok(Arc::clone(identity));
        }
        let identity = Arc::new(TlsIdentity::load(&self.options.tls)?);
        *slot = Some(Arc::clone(&identity));
        Ok(identity)
    }
}

impl Serve for StaticServer {
    fn serve(&self, config: ListenerConfig) -> Listener {
        let (listener, sink) = Listener::channel(config.protocol);

        let tls_acceptor = if config.tls() {
            match self.identity() {
                Ok(identity) => Some(identity.acceptor()),
                Err(e) => {
                    error!(name = %config.name, error = %e, "Unable to set up TLS");
                    sink.failed(e);
                    return listener;
                }
            }
        } else {
            None
        };

        let tls_connector = if config.rewrite.has_https_target() {
            match self.identity() {
                Ok(identity) => Some(identity.connector()),
                Err(e) => {
                    // The listener still serves; HTTPS rewrites answer 502
                    warn!(name = %config.name, error = %e, "Unable to set up TLS for upstream requests");
                    None
                }
            }
        } else {
            None
        };

        let context = Arc::new(RequestContext {
            directory: config.directory.clone(),
            rewrite: config.rewrite.clone(),
            pool: Arc::clone(&self.pool),
            tls_connector,
            is_tls: config.tls(),
        });

        let bind_addr = SocketAddr::new(self.options.bind, config.port);
        tokio::spawn(run_listener(bind_addr, config, context, tls_acceptor, sink));

        listener
    }
}

struct RequestContext {
    directory: PathBuf,
    rewrite: RewriteRules,
    pool: Arc<ConnectionPool>,
    tls_connector: Option<TlsConnector>,
    is_tls: bool,
}

async fn run_listener(
    bind_addr: SocketAddr,
    config: ListenerConfig,
    context: Arc<RequestContext>,
    tls_acceptor: Option<TlsAcceptor>,
    sink: ListenerSink,
) {
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(name = %config.name, addr = %bind_addr, protocol = %config.protocol, error = %e, "Failed to bind listener");
            sink.failed(ServeError::Bind {
                addr: bind_addr.to_string(),
                source: e,
            });
            return;
        }
    };

    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            sink.failed(ServeError::Bind {
                addr: bind_addr.to_string(),
                source: e,
            });
            return;
        }
    };

    info!(
        name = %config.name,
        addr = %local_addr,
        protocol = %config.protocol,
        directory = %config.directory.display(),
        rules = config.rewrite.len(),
        "Listener bound (HTTP/1.1 and HTTP/2)"
    );
    sink.listening(listen_urls(config.protocol, local_addr.ip(), local_addr.port()));

    let mut shutdown_rx = sink.shutdown();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let context = Arc::clone(&context);
                        let tls_acceptor = tls_acceptor.clone();

                        tokio::spawn(async move {
                            if let Some(acceptor) = tls_acceptor {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        if let Err(e) = handle_connection(tls_stream, addr, context).await {
                                            debug!(addr = %addr, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => {
                                        debug!(addr = %addr, error = %e, "TLS handshake failed");
                                    }
                                }
                            } else if let Err(e) = handle_connection(stream, addr, context).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped handle also means nobody owns this listener anymore
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    info!(name = %config.name, addr = %local_addr, protocol = %config.protocol, "Listener closed");
    sink.closed();
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    context: Arc<RequestContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<RequestContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();

    match context.rewrite.resolve(&path) {
        Some(Rewritten::Proxy(target)) => {
            let target = with_query(target, req.uri());
            let target: Uri = match target.parse() {
                Ok(uri) => uri,
                Err(e) => {
                    error!(path, target, error = %e, "Rewrite produced an invalid URL");
                    return Ok(json_error_response(
                        ServeErrorCode::BadRewrite,
                        "Rewrite target is not a valid URL",
                    ));
                }
            };

            set_forwarded_headers(&mut req, client_addr, context.is_tls);
            debug!(path, target = %target, method = %req.method(), "Proxying request");

            match context
                .pool
                .send_request(req, &target, context.tls_connector.as_ref())
                .await
            {
                Ok(response) => Ok(response),
                Err(e) => {
                    // Log detailed error internally, return generic message externally
                    error!(path, target = %target, error = %e, "Failed to forward request");
                    Ok(json_error_response(
                        ServeErrorCode::UpstreamFailed,
                        "Failed to reach rewrite target",
                    ))
                }
            }
        }
        Some(Rewritten::Local(local)) => {
            debug!(from = path, to = local, "Rewriting request locally");
            Ok(serve_static(req.method(), &context.directory, &local).await)
        }
        None => Ok(serve_static(req.method(), &context.directory, &path).await),
    }
}

/// Keep the original query string unless the rewrite target carries its own
fn with_query(target: String, original: &Uri) -> String {
    match original.query() {
        Some(query) if !target.contains('?') => format!("{}?{}", target, query),
        _ => target,
    }
}

fn set_forwarded_headers(req: &mut Request<Incoming>, client_addr: SocketAddr, is_tls: bool) {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

async fn serve_static(
    method: &Method,
    directory: &Path,
    request_path: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if method != Method::GET && method != Method::HEAD {
        return json_error_response(
            ServeErrorCode::MethodNotAllowed,
            "Only GET and HEAD are supported for static files",
        );
    }

    let relative = match resolve_static_path(request_path) {
        Ok(relative) => relative,
        Err(StaticPathError::Undecodable) => {
            return json_error_response(ServeErrorCode::BadRequest, "Malformed percent-encoding in path");
        }
        Err(StaticPathError::OutsideRoot) => {
            return json_error_response(ServeErrorCode::Forbidden, "Path is outside the served directory");
        }
    };

    let mut file_path = directory.join(relative);
    if tokio::fs::metadata(&file_path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        file_path.push(INDEX_FILE);
    }

    let contents = match tokio::fs::read(&file_path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return json_error_response(ServeErrorCode::NotFound, format!("Not found: {}", request_path));
        }
        Err(e) => {
            error!(path = %file_path.display(), error = %e, "Failed to read file");
            return json_error_response(ServeErrorCode::InternalError, "Failed to read file");
        }
    };

    let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
    let length = contents.len();
    let body = if method == Method::HEAD {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    } else {
        Full::new(Bytes::from(contents)).map_err(|never| match never {}).boxed()
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, mime.as_ref())
        .header(hyper::header::CONTENT_LENGTH, length)
        .body(body)
        .expect("valid response builder")
}

#[derive(Debug, PartialEq, Eq)]
enum StaticPathError {
    /// Percent-decoding did not yield UTF-8
    Undecodable,
    /// The decoded path tries to leave the directory
    OutsideRoot,
}

/// Map a request path onto a path relative to the served directory
fn resolve_static_path(request_path: &str) -> Result<PathBuf, StaticPathError> {
    let decoded = urlencoding::decode(request_path).map_err(|_| StaticPathError::Undecodable)?;
    let mut relative = PathBuf::new();

    for component in Path::new(decoded.as_ref()).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return Err(StaticPathError::OutsideRoot),
        }
    }

    Ok(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_static_path() {
        assert_eq!(resolve_static_path("/"), Ok(PathBuf::new()));
        assert_eq!(
            resolve_static_path("/img/logo.png"),
            Ok(PathBuf::from("img/logo.png"))
        );
        assert_eq!(
            resolve_static_path("/a%20b.txt"),
            Ok(PathBuf::from("a b.txt"))
        );
        assert_eq!(
            resolve_static_path("/../etc/passwd"),
            Err(StaticPathError::OutsideRoot)
        );
        assert_eq!(
            resolve_static_path("/img/%2e%2e/%2e%2e/secret"),
            Err(StaticPathError::OutsideRoot)
        );
        assert_eq!(resolve_static_path("/%ff"), Err(StaticPathError::Undecodable));
    }

    #[test]
    fn test_with_query() {
        let original: Uri = "/mt/a.js?v=2".parse().unwrap();
        assert_eq!(
            with_query("http://127.0.0.1:8001/a.js".to_string(), &original),
            "http://127.0.0.1:8001/a.js?v=2"
        );
        assert_eq!(
            with_query("http://127.0.0.1:8001/a.js?x=1".to_string(), &original),
            "http://127.0.0.1:8001/a.js?x=1"
        );

        let plain: Uri = "/mt/a.js".parse().unwrap();
        assert_eq!(
            with_query("http://127.0.0.1:8001/a.js".to_string(), &plain),
            "http://127.0.0.1:8001/a.js"
        );
    }

    #[tokio::test]
    async fn test_serve_static_file_and_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();

        let response = serve_static(&Method::GET, dir.path(), "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<h1>home</h1>");

        let response = serve_static(&Method::HEAD, dir.path(), "/app.js").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_LENGTH).unwrap(),
            "14"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_serve_static_errors() {
        let dir = tempfile::tempdir().unwrap();

        let response = serve_static(&Method::GET, dir.path(), "/missing.png").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = serve_static(&Method::POST, dir.path(), "/").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = serve_static(&Method::GET, dir.path(), "/../secret").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = serve_static(&Method::GET, dir.path(), "/%ff").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("x-server-error").unwrap(),
            "BAD_REQUEST"
        );
    }

    #[tokio::test]
    async fn test_serve_reports_bound_address() {
        let server = StaticServer::new(ServeOptions {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServeOptions::default()
        });
        let dir = tempfile::tempdir().unwrap();

        let mut listener = server.serve(ListenerConfig {
            name: "test".to_string(),
            directory: dir.path().to_path_buf(),
            port: 0,
            protocol: crate::listener::Protocol::Http,
            rewrite: RewriteRules::new(),
        });

        let urls = listener.listening().await.unwrap();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].starts_with("http://127.0.0.1:"));
        listener.close();
    }
}

//! The serve primitive used by [`ServerInstance`](crate::instance::ServerInstance)
//!
//! A [`Serve`] implementation starts one listener per call and reports its
//! progress as [`ListenerEvent`]s over a channel. The supervisor only waits for
//! the first outcome (listening or error), later requests shutdown through
//! [`Listener::close`] and logs once [`Listener::closed`] resolves.

use crate::error::ServeError;
use crate::rewrite::RewriteRules;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("HTTP"),
            Protocol::Https => f.write_str("HTTPS"),
        }
    }
}

/// Everything a listener needs to start serving
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Name of the owning instance, for logging
    pub name: String,
    /// Static root
    pub directory: PathBuf,
    /// Port to bind (0 picks an ephemeral port)
    pub port: u16,
    pub protocol: Protocol,
    /// Ordered rewrite rules, applied before static lookup
    pub rewrite: RewriteRules,
}

impl ListenerConfig {
    pub fn tls(&self) -> bool {
        self.protocol == Protocol::Https
    }
}

#[derive(Debug)]
pub enum ListenerEvent {
    /// Bound successfully, with the URLs it can be reached at
    Listening(Vec<String>),
    /// Failed to start
    Error(ServeError),
    /// Stopped accepting connections
    Closed,
}

/// Starts listeners. Implementations must not block; binding happens on a task.
pub trait Serve: Send + Sync {
    fn serve(&self, config: ListenerConfig) -> Listener;
}

/// Handle held by the supervisor for one running (or starting) listener
pub struct Listener {
    protocol: Protocol,
    events: mpsc::UnboundedReceiver<ListenerEvent>,
    shutdown_tx: watch::Sender<bool>,
}

/// Producer side handed to the task that drives the listener
pub struct ListenerSink {
    events: mpsc::UnboundedSender<ListenerEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Listener {
    pub fn channel(protocol: Protocol) -> (Listener, ListenerSink) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            Listener {
                protocol,
                events: events_rx,
                shutdown_tx,
            },
            ListenerSink {
                events: events_tx,
                shutdown_rx,
            },
        )
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Wait until the listener is bound or has failed
    pub async fn listening(&mut self) -> Result<Vec<String>, ServeError> {
        match self.events.recv().await {
            Some(ListenerEvent::Listening(addresses)) => Ok(addresses),
            Some(ListenerEvent::Error(e)) => Err(e),
            Some(ListenerEvent::Closed) | None => Err(ServeError::Closed),
        }
    }

    /// Request shutdown; does not wait for the socket to be released
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until the listener task reports it stopped (or goes away)
    pub async fn closed(mut self) {
        while let Some(event) = self.events.recv().await {
            if matches!(event, ListenerEvent::Closed) {
                break;
            }
        }
    }
}

impl ListenerSink {
    pub fn listening(&self, addresses: Vec<String>) {
        let _ = self.events.send(ListenerEvent::Listening(addresses));
    }

    pub fn failed(&self, error: ServeError) {
        let _ = self.events.send(ListenerEvent::Error(error));
    }

    pub fn closed(&self) {
        let _ = self.events.send(ListenerEvent::Closed);
    }

    /// Receiver that flips to `true` once [`Listener::close`] is called
    pub fn shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

/// Format the URLs a listener bound to `bind:port` can be reached at
pub fn listen_urls(protocol: Protocol, bind: IpAddr, port: u16) -> Vec<String> {
    let host = if bind.is_unspecified() || bind.is_loopback() {
        match bind {
            IpAddr::V4(_) => "127.0.0.1".to_string(),
            IpAddr::V6(_) => "[::1]".to_string(),
        }
    } else {
        match bind {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
        }
    };

    let mut urls = vec![format!("{}://{}:{}", protocol.scheme(), host, port)];
    if bind.is_unspecified() {
        urls.push(format!("{}://localhost:{}", protocol.scheme(), port));
    }
    urls
}

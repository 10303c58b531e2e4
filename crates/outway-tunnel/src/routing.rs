//! Routing daemon adapter.
//!
//! The privileged helper that manipulates routing tables and the TUN
//! device runs outside this process. This module defines the contract the
//! orchestrator consumes ([`RoutingService`]) and a client speaking the
//! helper's newline-delimited JSON protocol over a local socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use outway_core::{Error, Result, TunnelStatus};

use crate::events::EVENT_CHANNEL_CAPACITY;

/// Events pushed by the routing daemon while a session is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    /// The OS reported a network transition; carries `Connected` or
    /// `Reconnecting`.
    NetworkChanged(TunnelStatus),
    /// The daemon went away unexpectedly. Emitted at most once per
    /// daemon instance.
    Disconnected,
}

/// Contract between the orchestrator and the privileged routing helper.
pub trait RoutingService: Send + Sync {
    /// Establish OS routing/TUN configuration for the session's proxy IP.
    fn start(&self) -> impl Future<Output = Result<()>> + Send;

    /// Revert routing/TUN configuration.
    fn stop(&self) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe to network-change and disconnect events.
    fn subscribe(&self) -> broadcast::Receiver<RoutingEvent>;
}

/// How long to wait for the daemon to answer one request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DaemonRequest<'a> {
    action: &'a str,
    parameters: serde_json::Value,
}

/// One line from the daemon: either a reply to our last request
/// (`status_code` present) or an unsolicited `statusChanged` notification.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DaemonMessage {
    action: Option<String>,
    status_code: Option<i32>,
    error_message: Option<String>,
    connection_status: Option<i32>,
}

// connectionStatus values in statusChanged notifications.
const DAEMON_STATUS_CONNECTED: i32 = 0;
const DAEMON_STATUS_DISCONNECTED: i32 = 1;
const DAEMON_STATUS_RECONNECTING: i32 = 2;

/// Client for the OS routing daemon over a unix socket.
pub struct OsRoutingDaemon {
    socket_path: PathBuf,
    proxy_ip: String,
    auto_connect: bool,
    event_tx: broadcast::Sender<RoutingEvent>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    responses: Mutex<Option<mpsc::Receiver<DaemonMessage>>>,
    /// Set by `stop()` so a socket close is not reported as a daemon loss.
    stopping: Arc<AtomicBool>,
}

impl OsRoutingDaemon {
    /// Create a client for the daemon at `socket_path`, routing to
    /// `proxy_ip`. `auto_connect` tells the daemon this is a reconnect at
    /// startup rather than a user action.
    pub fn new(socket_path: PathBuf, proxy_ip: String, auto_connect: bool) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            socket_path,
            proxy_ip,
            auto_connect,
            event_tx,
            writer: Mutex::new(None),
            responses: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn request(&self, action: &str, parameters: serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(&DaemonRequest { action, parameters })?;
        {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(Error::RoutingService("daemon is not connected".to_string()));
            };
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }

        let mut responses = self.responses.lock().await;
        let Some(responses) = responses.as_mut() else {
            return Err(Error::RoutingService("daemon is not connected".to_string()));
        };
        let reply = tokio::time::timeout(REQUEST_TIMEOUT, responses.recv())
            .await
            .map_err(|_| Error::RoutingService(format!("{action}: daemon did not reply")))?
            .ok_or_else(|| Error::RoutingService(format!("{action}: daemon closed connection")))?;

        if reply.status_code == Some(0) {
            Ok(())
        } else {
            let message = reply
                .error_message
                .unwrap_or_else(|| format!("status code {:?}", reply.status_code));
            Err(Error::RoutingService(format!("{action}: {message}")))
        }
    }
}

impl RoutingService for OsRoutingDaemon {
    async fn start(&self) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::RoutingService(format!(
                "cannot reach routing service at {}: {e}",
                self.socket_path.display()
            ))
        })?;
        let (read_half, write_half) = stream.into_split();
        let (response_tx, response_rx) = mpsc::channel(8);
        *self.writer.lock().await = Some(write_half);
        *self.responses.lock().await = Some(response_rx);

        let event_tx = self.event_tx.clone();
        let stopping = Arc::clone(&self.stopping);
        tokio::spawn(async move {
            read_daemon_messages(read_half, response_tx, event_tx, stopping).await;
        });

        info!(proxy_ip = %self.proxy_ip, "configuring routing");
        self.request(
            "configureRouting",
            serde_json::json!({
                "proxyIp": self.proxy_ip,
                "isAutoConnect": self.auto_connect,
            }),
        )
        .await
    }

    async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        if self.writer.lock().await.is_none() {
            // Never started or already torn down.
            return Ok(());
        }
        let result = self.request("resetRouting", serde_json::json!({})).await;
        *self.writer.lock().await = None;
        *self.responses.lock().await = None;
        result
    }

    fn subscribe(&self) -> broadcast::Receiver<RoutingEvent> {
        self.event_tx.subscribe()
    }
}

async fn read_daemon_messages(
    read_half: tokio::net::unix::OwnedReadHalf,
    response_tx: mpsc::Sender<DaemonMessage>,
    event_tx: broadcast::Sender<RoutingEvent>,
    stopping: Arc<AtomicBool>,
) {
    let mut disconnect_sent = false;
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let message: DaemonMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unparseable daemon message");
                continue;
            }
        };
        if message.action.as_deref() == Some("statusChanged") {
            match message.connection_status {
                Some(DAEMON_STATUS_CONNECTED) => {
                    let _ = event_tx.send(RoutingEvent::NetworkChanged(TunnelStatus::Connected));
                }
                Some(DAEMON_STATUS_RECONNECTING) => {
                    let _ = event_tx.send(RoutingEvent::NetworkChanged(TunnelStatus::Reconnecting));
                }
                Some(DAEMON_STATUS_DISCONNECTED) => {
                    if !disconnect_sent {
                        disconnect_sent = true;
                        let _ = event_tx.send(RoutingEvent::Disconnected);
                    }
                }
                other => debug!(?other, "unknown connection status"),
            }
        } else if message.status_code.is_some() {
            if response_tx.send(message).await.is_err() {
                break;
            }
        } else {
            debug!(?message, "ignoring daemon message");
        }
    }
    if !stopping.load(Ordering::SeqCst) && !disconnect_sent {
        warn!("routing daemon connection lost");
        let _ = event_tx.send(RoutingEvent::Disconnected);
    }
    debug!("daemon reader finished");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let line = serde_json::to_string(&DaemonRequest {
            action: "configureRouting",
            parameters: serde_json::json!({"proxyIp": "203.0.113.5", "isAutoConnect": false}),
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"action":"configureRouting","parameters":{"isAutoConnect":false,"proxyIp":"203.0.113.5"}}"#
        );
    }

    #[test]
    fn parses_status_notification() {
        let message: DaemonMessage =
            serde_json::from_str(r#"{"action":"statusChanged","connectionStatus":2}"#).unwrap();
        assert_eq!(message.action.as_deref(), Some("statusChanged"));
        assert_eq!(message.connection_status, Some(2));
        assert!(message.status_code.is_none());
    }

    #[test]
    fn parses_error_reply() {
        let message: DaemonMessage = serde_json::from_str(
            r#"{"action":"configureRouting","statusCode":1,"errorMessage":"no such device"}"#,
        )
        .unwrap();
        assert_eq!(message.status_code, Some(1));
        assert_eq!(message.error_message.as_deref(), Some("no such device"));
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let daemon = OsRoutingDaemon::new("/tmp/nonexistent.sock".into(), "1.2.3.4".into(), false);
        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_against_missing_socket_fails() {
        let daemon = OsRoutingDaemon::new(
            "/tmp/outway-test-definitely-missing.sock".into(),
            "1.2.3.4".into(),
            false,
        );
        let err = daemon.start().await.unwrap_err();
        assert!(matches!(err, Error::RoutingService(_)));
    }
}

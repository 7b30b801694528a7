//! Report listener: WebSocket server feeding the history buffer.
//!
//! Each reporting client holds one persistent WebSocket connection and sends
//! one JSON frame per error event. Every connection runs in its own task; all
//! of them append to the same [`HistoryBuffer`]. Frames that fail to parse or
//! validate are dropped without a reply.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, trace, warn};

use crate::error::ListenerError;
use crate::history::HistoryBuffer;
use crate::record::{RejectReason, parse_report};

/// Largest accepted frame; error reports are small.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Pause after a failed `accept()` (e.g. EMFILE) before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of the single bind attempt a relay makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Unbound,
    Binding,
    Listening,
    /// Terminal for this process; no rebinding is attempted.
    BindFailed,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbound => write!(f, "unbound"),
            Self::Binding => write!(f, "binding"),
            Self::Listening => write!(f, "listening"),
            Self::BindFailed => write!(f, "bind_failed"),
        }
    }
}

/// Frame and connection counters.
#[derive(Debug, Default)]
pub struct ListenerStats {
    connections: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerCounters {
    pub connections: u64,
    pub accepted: u64,
    pub dropped: u64,
}

impl ListenerStats {
    #[must_use]
    pub fn counters(&self) -> ListenerCounters {
        ListenerCounters {
            connections: self.connections.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Parse one frame and append it to the history when valid.
pub fn ingest_frame(history: &HistoryBuffer, text: &str) -> Result<(), RejectReason> {
    let record = parse_report(text)?;
    history.record(record);
    Ok(())
}

/// A bound report listener.
pub struct ReportListener {
    listener: TcpListener,
    history: Arc<HistoryBuffer>,
    stats: Arc<ListenerStats>,
}

impl ReportListener {
    /// Bind the report port.
    pub async fn bind(
        addr: SocketAddr,
        history: Arc<HistoryBuffer>,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::AddrInUse {
                ListenerError::AddrInUse {
                    addr: addr.to_string(),
                }
            } else {
                ListenerError::BindFailed {
                    addr: addr.to_string(),
                    source,
                }
            }
        })?;
        Ok(Self {
            listener,
            history,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let local = self.listener.local_addr().ok();
        info!(addr = ?local, "Report listener accepting connections");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(addr = ?local, "Report listener stopping");
                    break;
                }

                conn = self.listener.accept() => {
                    let (stream, peer) = match conn {
                        Ok(c) => c,
                        Err(e) => {
                            accept_backoff(&e).await;
                            continue;
                        }
                    };
                    debug!(%peer, "Reporting client connected");
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);
                    let history = Arc::clone(&self.history);
                    let stats = Arc::clone(&self.stats);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, history, stats).await;
                    });
                }
            }
        }
    }

    /// Accept connections for the rest of the process lifetime.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await;
    }
}

async fn accept_backoff(error: &std::io::Error) {
    warn!(error = %error, backoff_ms = ACCEPT_ERROR_BACKOFF.as_millis() as u64, "Accept failed");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    history: Arc<HistoryBuffer>,
    stats: Arc<ListenerStats>,
) {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_FRAME_BYTES);
    ws_config.max_frame_size = Some(MAX_FRAME_BYTES);

    let mut ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await
    {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let mut accepted = 0_u64;
    let mut dropped = 0_u64;

    while let Some(message) = ws.next().await {
        let outcome = match message {
            Ok(Message::Text(text)) => ingest_frame(&history, text.as_str()),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => ingest_frame(&history, text),
                Err(e) => Err(RejectReason::Malformed(e.to_string())),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%peer, error = %e, "Reporting connection error");
                break;
            }
        };

        match outcome {
            Ok(()) => {
                accepted += 1;
                stats.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(reason) => {
                dropped += 1;
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(%peer, %reason, "Dropped report frame");
            }
        }
    }

    debug!(%peer, accepted, dropped, "Reporting client disconnected");
}

//! Relay startup sequence and lifetime.
//!
//! ```text
//! arbitrate port ──► bind listener ──► listener task ─┐
//!                                                     ├─► HistoryBuffer
//!                    MCP stdio (query surface) ◄──────┘
//! ```
//!
//! A failed bind is not fatal: the query surface still runs against an empty
//! buffer so the consumer gets the guidance text instead of a dead server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::arbiter::{ArbitrationReport, PortInspector, arbitrate_port, system_inspector};
use crate::config::Config;
use crate::history::HistoryBuffer;
use crate::listener::{ListenerState, ReportListener};
use crate::mcp::McpServer;
use crate::query::QueryInterface;

/// What happened while bringing the relay up.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub addr: SocketAddr,
    /// `None` when arbitration is disabled
    pub arbitration: Option<ArbitrationReport>,
    pub listener: ListenerState,
    pub listener_error: Option<String>,
}

impl StartupReport {
    /// Human-readable status lines for the operator.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match &self.arbitration {
            Some(report) => lines.push(report.summary()),
            None => lines.push(format!(
                "Port arbitration disabled for port {}",
                self.addr.port()
            )),
        }
        match self.listener {
            ListenerState::Listening => {
                lines.push(format!("Listening for error reports on {}", self.addr));
            }
            _ => lines.push(format!(
                "Error report listener not running on {}: {}. Queries will return an empty history.",
                self.addr,
                self.listener_error.as_deref().unwrap_or("not bound")
            )),
        }
        lines
    }
}

/// The relay process: shared history plus the two surfaces around it.
pub struct Relay {
    config: Config,
    history: Arc<HistoryBuffer>,
    inspector: Arc<dyn PortInspector>,
}

impl Relay {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_inspector(config, system_inspector())
    }

    #[must_use]
    pub fn with_inspector(config: Config, inspector: Arc<dyn PortInspector>) -> Self {
        Self {
            config,
            history: Arc::new(HistoryBuffer::new()),
            inspector,
        }
    }

    #[must_use]
    pub fn history(&self) -> Arc<HistoryBuffer> {
        Arc::clone(&self.history)
    }

    #[must_use]
    pub fn query(&self) -> QueryInterface {
        QueryInterface::new(self.history())
    }

    /// Arbitrate the port, then make the single bind attempt.
    pub async fn start(&self) -> (StartupReport, Option<ReportListener>) {
        let addr = self.config.relay.socket_addr();

        let arbitration = if self.config.arbiter.enabled {
            Some(
                arbitrate_port(
                    addr,
                    Arc::clone(&self.inspector),
                    self.config.arbiter.clone(),
                )
                .await,
            )
        } else {
            None
        };

        let mut state = ListenerState::Binding;
        info!(%addr, state = %state, "Binding report listener");
        let (listener, listener_error) =
            match ReportListener::bind(addr, Arc::clone(&self.history)).await {
                Ok(listener) => {
                    state = ListenerState::Listening;
                    info!(%addr, "Report listener bound");
                    (Some(listener), None)
                }
                Err(e) => {
                    state = ListenerState::BindFailed;
                    warn!(%addr, error = %e, "Report listener could not bind; continuing without it");
                    (None, Some(e.to_string()))
                }
            };

        let addr = listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .unwrap_or(addr);

        (
            StartupReport {
                addr,
                arbitration,
                listener: state,
                listener_error,
            },
            listener,
        )
    }

    /// Start up, then serve MCP on stdio until stdin closes or Ctrl-C.
    ///
    /// Stdin reads run on a blocking thread that outlives this future; the
    /// caller must shut its runtime down with a timeout after an interrupt.
    pub async fn run(self) -> crate::Result<StartupReport> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.run_with(stdin, tokio::io::stdout(), interrupted())
            .await
    }

    /// Start up, then serve MCP over `reader`/`writer` until the reader hits
    /// EOF or `shutdown` resolves.
    pub async fn run_with<R, W, S>(
        self,
        reader: R,
        writer: W,
        shutdown: S,
    ) -> crate::Result<StartupReport>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        let (report, listener) = self.start().await;
        for line in report.lines() {
            info!("{line}");
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let listener_task = listener.map(|listener| {
            tokio::spawn(listener.run_until(async move {
                let _ = stop_rx.await;
            }))
        });

        let server = McpServer::new(self.query());
        let served = tokio::select! {
            result = server.serve(reader, writer) => result,
            () = shutdown => Ok(()),
        };

        let _ = stop_tx.send(());
        if let Some(task) = listener_task {
            task.await
                .map_err(|e| crate::Error::Runtime(format!("listener task failed: {e}")))?;
        }

        let stats = self.history.stats();
        info!(
            recorded = stats.total_recorded,
            evicted = stats.total_evicted,
            "Relay stopped"
        );

        served?;
        Ok(report)
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received"),
        Err(e) => {
            warn!(error = %e, "Could not install interrupt handler");
            std::future::pending::<()>().await;
        }
    }
}

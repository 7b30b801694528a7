//! Startup port arbitration.
//!
//! Before the report listener binds, the relay checks whether its port is
//! already held. If it is, the owning processes are looked up and classified
//! by process name. Only when **every** owner looks like a prior relay
//! instance are they killed; a single foreign owner aborts the takeover and
//! nothing is touched.
//!
//! The sequence is strictly linear (probe, enumerate, classify, kill, wait)
//! and runs once per process start. Process-table access goes through
//! [`PortInspector`] so the algorithm is written once for every platform.

mod platform;

use std::collections::BTreeSet;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ArbiterConfig;
use crate::error::ArbiterError;

pub use platform::{SystemInspector, system_inspector};

/// Classification of a single owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessClass {
    /// Looks like a prior relay instance; safe to terminate
    Compatible,
    /// Anything else; never terminated
    Foreign,
}

/// A process found holding the relay port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerProcess {
    pub pid: u32,
    /// Image or command name, when it could be resolved
    pub name: Option<String>,
    pub class: ProcessClass,
}

/// Who currently holds the relay port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PortOwnership {
    /// The probe bind succeeded
    Unbound,
    /// The probe failed but no owning process could be found
    NoOwnerFound,
    /// Every owner is a prior relay instance
    OwnedByCompatible { owners: Vec<OwnerProcess> },
    /// At least one owner is foreign
    OwnedByForeign { owners: Vec<OwnerProcess> },
}

/// A compatible owner that could not be terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillFailure {
    pub pid: u32,
    pub reason: String,
}

/// Result of one arbitration pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TakeoverOutcome {
    /// Nothing held the port
    PortFree,
    /// The port looked busy but no owner was found
    NoProcess,
    /// Every compatible owner was terminated
    Success { pids: Vec<u32> },
    /// A foreign owner holds the port; nothing was killed
    ForeignOwner { owners: Vec<OwnerProcess> },
    /// At least one compatible owner survived termination
    KillFailed { failures: Vec<KillFailure> },
    /// Process inspection itself failed
    InspectionFailed { reason: String },
}

impl TakeoverOutcome {
    /// Stable short code for logs and machine output.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PortFree => "port_free",
            Self::NoProcess => "no_process",
            Self::Success { .. } => "success",
            Self::ForeignOwner { .. } => "foreign_owner",
            Self::KillFailed { .. } => "kill_failed",
            Self::InspectionFailed { .. } => "inspection_failed",
        }
    }

    /// Whether the listener can expect the port to be bindable.
    #[must_use]
    pub const fn port_available(&self) -> bool {
        matches!(self, Self::PortFree | Self::NoProcess | Self::Success { .. })
    }
}

/// Everything one arbitration pass observed and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbitrationReport {
    pub port: u16,
    pub outcome: TakeoverOutcome,
    /// Number of termination calls issued
    pub terminations: usize,
}

impl ArbitrationReport {
    /// One human-readable status line.
    #[must_use]
    pub fn summary(&self) -> String {
        let port = self.port;
        match &self.outcome {
            TakeoverOutcome::PortFree => format!("Port {port} is free"),
            TakeoverOutcome::NoProcess => {
                format!("Port {port} looked busy but no owning process was found")
            }
            TakeoverOutcome::Success { pids } => format!(
                "Took over port {port} from previous relay instance(s) {}",
                join_pids(pids.iter().copied())
            ),
            TakeoverOutcome::ForeignOwner { owners } => format!(
                "Port {port} is held by a foreign owner, not reclaimed: {}",
                describe_owners(owners)
            ),
            TakeoverOutcome::KillFailed { failures } => format!(
                "Takeover of port {port} failed: {}",
                failures
                    .iter()
                    .map(|f| format!("pid {} ({})", f.pid, f.reason))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            TakeoverOutcome::InspectionFailed { reason } => {
                format!("Could not inspect owner of port {port}: {reason}")
            }
        }
    }
}

fn join_pids(pids: impl Iterator<Item = u32>) -> String {
    pids.map(|pid| pid.to_string()).collect::<Vec<_>>().join(", ")
}

fn describe_owners(owners: &[OwnerProcess]) -> String {
    owners
        .iter()
        .map(|owner| {
            format!(
                "pid {} ({}, {})",
                owner.pid,
                owner.name.as_deref().unwrap_or("unknown"),
                match owner.class {
                    ProcessClass::Compatible => "compatible",
                    ProcessClass::Foreign => "foreign",
                }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Platform capability used by arbitration.
pub trait PortInspector: Send + Sync {
    /// Transient bind probe; the socket is released before returning.
    fn port_is_free(&self, addr: SocketAddr) -> bool {
        probe_port(addr)
    }

    /// PIDs holding a listening TCP socket on `port`.
    fn enumerate_owners(&self, port: u16) -> Result<Vec<u32>, ArbiterError>;

    /// Image or command name of `pid`.
    fn process_name(&self, pid: u32) -> Option<String>;

    /// Forcibly terminate `pid`.
    fn terminate(&self, pid: u32) -> Result<(), String>;

    /// Whether `pid` still exists (zombies count as gone).
    fn is_alive(&self, pid: u32) -> bool;

    /// Classify `pid` against the compatible process names.
    fn classify(&self, pid: u32, compatible_names: &[String]) -> OwnerProcess {
        let name = self.process_name(pid);
        let class = match &name {
            Some(name) if name_matches(name, compatible_names) => ProcessClass::Compatible,
            _ => ProcessClass::Foreign,
        };
        OwnerProcess { pid, name, class }
    }
}

/// Case-insensitive substring match against any non-empty candidate.
#[must_use]
pub fn name_matches(process_name: &str, compatible_names: &[String]) -> bool {
    let lower = process_name.to_lowercase();
    compatible_names
        .iter()
        .map(|candidate| candidate.trim().to_lowercase())
        .any(|candidate| !candidate.is_empty() && lower.contains(&candidate))
}

/// Attempt a bind on `addr` and release it immediately.
#[must_use]
pub fn probe_port(addr: SocketAddr) -> bool {
    match TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) => {
            debug!(%addr, error = %e, "Port probe bind failed");
            false
        }
    }
}

/// Inspect who holds `addr` without terminating anything.
pub fn inspect(
    addr: SocketAddr,
    inspector: &dyn PortInspector,
    compatible_names: &[String],
) -> Result<PortOwnership, ArbiterError> {
    if inspector.port_is_free(addr) {
        return Ok(PortOwnership::Unbound);
    }

    let own_pid = std::process::id();
    let pids: BTreeSet<u32> = inspector
        .enumerate_owners(addr.port())?
        .into_iter()
        .filter(|pid| *pid != 0 && *pid != own_pid)
        .collect();

    if pids.is_empty() {
        return Ok(PortOwnership::NoOwnerFound);
    }

    let owners: Vec<OwnerProcess> = pids
        .into_iter()
        .map(|pid| inspector.classify(pid, compatible_names))
        .collect();

    if owners
        .iter()
        .all(|owner| owner.class == ProcessClass::Compatible)
    {
        Ok(PortOwnership::OwnedByCompatible { owners })
    } else {
        Ok(PortOwnership::OwnedByForeign { owners })
    }
}

fn wait_for_exit(inspector: &dyn PortInspector, pid: u32, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !inspector.is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(poll);
    }
}

fn terminate_owner(
    inspector: &dyn PortInspector,
    pid: u32,
    config: &ArbiterConfig,
) -> Result<(), KillFailure> {
    if let Err(reason) = inspector.terminate(pid) {
        // Exiting on its own between classification and kill still frees the port.
        if inspector.is_alive(pid) {
            return Err(KillFailure { pid, reason });
        }
        debug!(pid, %reason, "Kill failed but process is already gone");
        return Ok(());
    }

    if wait_for_exit(inspector, pid, config.exit_timeout(), config.exit_poll()) {
        Ok(())
    } else {
        Err(KillFailure {
            pid,
            reason: format!(
                "still running {} ms after kill",
                config.exit_timeout().as_millis()
            ),
        })
    }
}

/// Run one arbitration pass for `addr` (blocking).
pub fn arbitrate(
    addr: SocketAddr,
    inspector: &dyn PortInspector,
    config: &ArbiterConfig,
) -> ArbitrationReport {
    let port = addr.port();
    let mut terminations = 0;

    let outcome = match inspect(addr, inspector, &config.compatible_process_names) {
        Err(e) => TakeoverOutcome::InspectionFailed {
            reason: e.to_string(),
        },
        Ok(PortOwnership::Unbound) => TakeoverOutcome::PortFree,
        Ok(PortOwnership::NoOwnerFound) => TakeoverOutcome::NoProcess,
        Ok(PortOwnership::OwnedByForeign { owners }) => TakeoverOutcome::ForeignOwner { owners },
        Ok(PortOwnership::OwnedByCompatible { owners }) => {
            let mut failures = Vec::new();
            let mut pids = Vec::with_capacity(owners.len());
            for owner in &owners {
                info!(port, pid = owner.pid, name = ?owner.name, "Terminating previous relay instance");
                terminations += 1;
                match terminate_owner(inspector, owner.pid, config) {
                    Ok(()) => pids.push(owner.pid),
                    Err(failure) => failures.push(failure),
                }
            }

            if failures.is_empty() {
                std::thread::sleep(config.grace());
                TakeoverOutcome::Success { pids }
            } else {
                TakeoverOutcome::KillFailed { failures }
            }
        }
    };

    let report = ArbitrationReport {
        port,
        outcome,
        terminations,
    };

    if report.outcome.port_available() {
        info!(port, outcome = report.outcome.code(), "{}", report.summary());
    } else {
        warn!(port, outcome = report.outcome.code(), "{}", report.summary());
    }

    report
}

/// Run arbitration on the blocking pool.
pub async fn arbitrate_port(
    addr: SocketAddr,
    inspector: Arc<dyn PortInspector>,
    config: ArbiterConfig,
) -> ArbitrationReport {
    tokio::task::spawn_blocking(move || arbitrate(addr, inspector.as_ref(), &config))
        .await
        .unwrap_or_else(|e| ArbitrationReport {
            port: addr.port(),
            outcome: TakeoverOutcome::InspectionFailed {
                reason: format!("spawn_blocking failed: {e}"),
            },
            terminations: 0,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_matching_is_case_insensitive_substring() {
        let names = vec!["errorrelay".to_string()];
        assert!(name_matches("errorrelay", &names));
        assert!(name_matches("ErrorRelay.exe", &names));
        assert!(name_matches("/usr/local/bin/errorrelay", &names));
        assert!(!name_matches("postgres", &names));
        assert!(!name_matches("anything", &["  ".to_string()]));
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(TakeoverOutcome::PortFree.code(), "port_free");
        assert_eq!(TakeoverOutcome::NoProcess.code(), "no_process");
        assert_eq!(TakeoverOutcome::Success { pids: vec![] }.code(), "success");
        assert_eq!(
            TakeoverOutcome::ForeignOwner { owners: vec![] }.code(),
            "foreign_owner"
        );
        assert_eq!(
            TakeoverOutcome::KillFailed { failures: vec![] }.code(),
            "kill_failed"
        );
    }

    #[test]
    fn summary_names_foreign_owner() {
        let report = ArbitrationReport {
            port: 9277,
            outcome: TakeoverOutcome::ForeignOwner {
                owners: vec![OwnerProcess {
                    pid: 42,
                    name: Some("postgres".into()),
                    class: ProcessClass::Foreign,
                }],
            },
            terminations: 0,
        };
        let summary = report.summary();
        assert!(summary.contains("foreign owner, not reclaimed"));
        assert!(summary.contains("pid 42 (postgres, foreign)"));
    }

    #[test]
    fn report_serializes_with_outcome_tag() {
        let report = ArbitrationReport {
            port: 9277,
            outcome: TakeoverOutcome::Success { pids: vec![7] },
            terminations: 1,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"]["outcome"], "success");
        assert_eq!(json["outcome"]["pids"][0], 7);
        assert_eq!(json["terminations"], 1);
    }

    #[test]
    fn probe_detects_bound_port() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = held.local_addr().unwrap();
        assert!(!probe_port(addr));
        drop(held);
        assert!(probe_port(addr));
    }
}

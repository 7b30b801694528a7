//! Host process inspection for port arbitration.
//!
//! - **Linux**: `/proc/net/tcp{,6}` for listening sockets, `/proc/<pid>/fd`
//!   to map socket inodes to PIDs, `/proc/<pid>/comm` for names, `kill -9`
//! - **macOS / other Unix**: `lsof`, `ps`, `kill -9`
//! - **Windows**: `netstat -ano`, `tasklist`, `taskkill /F`
//!
//! All introspection shells out or reads files; there is no FFI.

use std::process::Command;
use std::sync::Arc;

use super::PortInspector;
use crate::error::ArbiterError;

/// Inspector backed by the host's process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInspector;

/// The inspector for the platform this binary was built for.
#[must_use]
pub fn system_inspector() -> Arc<dyn PortInspector> {
    Arc::new(SystemInspector)
}

#[cfg(not(target_os = "linux"))]
fn run_tool(tool: &str, args: &[&str]) -> Result<std::process::Output, ArbiterError> {
    Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| ArbiterError::ToolUnavailable {
            tool: tool.to_string(),
            reason: e.to_string(),
        })
}

// =============================================================================
// Linux: /proc filesystem
// =============================================================================

#[cfg(target_os = "linux")]
impl PortInspector for SystemInspector {
    fn enumerate_owners(&self, port: u16) -> Result<Vec<u32>, ArbiterError> {
        let mut inodes = Vec::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(contents) = std::fs::read_to_string(table) {
                inodes.extend(parse_proc_net_tcp(&contents, port));
            }
        }
        if inodes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(pids_holding_inodes(&inodes))
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok();
        if let Some(comm) = comm.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()) {
            return Some(comm);
        }
        let cmdline = std::fs::read_to_string(format!("/proc/{pid}/cmdline")).ok()?;
        cmdline
            .split('\0')
            .next()
            .filter(|arg0| !arg0.is_empty())
            .map(|arg0| basename(arg0).to_string())
    }

    fn terminate(&self, pid: u32) -> Result<(), String> {
        kill_unix(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        // "pid (name) state ..."; name may contain spaces and parens.
        stat.rfind(')')
            .and_then(|end| stat[end + 1..].split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X")
    }
}

#[cfg(target_os = "linux")]
fn pids_holding_inodes(inodes: &[u64]) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let holds = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .ok()
                .and_then(|target| parse_socket_link(&target.to_string_lossy()))
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if holds {
            pids.push(pid);
        }
    }
    pids
}

/// Inodes of sockets listening on `port` in a `/proc/net/tcp` table.
#[cfg(any(target_os = "linux", test))]
fn parse_proc_net_tcp(contents: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            if local_port != port || *state != TCP_LISTEN {
                return None;
            }
            inode.parse::<u64>().ok().filter(|inode| *inode != 0)
        })
        .collect()
}

/// Parse `socket:[12345]` fd link targets.
#[cfg(any(target_os = "linux", test))]
fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

// =============================================================================
// macOS and other Unix: lsof / ps
// =============================================================================

#[cfg(all(unix, not(target_os = "linux")))]
impl PortInspector for SystemInspector {
    fn enumerate_owners(&self, port: u16) -> Result<Vec<u32>, ArbiterError> {
        let spec = format!("-iTCP:{port}");
        let output = run_tool("lsof", &["-nP", "-t", &spec, "-sTCP:LISTEN"])?;
        // lsof exits 1 with empty output when nothing matches.
        if !output.status.success() && !output.stdout.is_empty() {
            return Err(ArbiterError::ParseError {
                tool: "lsof".to_string(),
                detail: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        parse_pid_lines(&String::from_utf8_lossy(&output.stdout))
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let output = run_tool("ps", &["-p", &pid.to_string(), "-o", "comm="]).ok()?;
        if !output.status.success() {
            return None;
        }
        let comm = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!comm.is_empty()).then(|| basename(&comm).to_string())
    }

    fn terminate(&self, pid: u32) -> Result<(), String> {
        kill_unix(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(output) = run_tool("ps", &["-p", &pid.to_string(), "-o", "stat="]) else {
            return false;
        };
        let stat = String::from_utf8_lossy(&output.stdout);
        let stat = stat.trim();
        output.status.success() && !stat.is_empty() && !stat.starts_with('Z')
    }
}

/// One PID per line (`lsof -t` output).
#[cfg(any(all(unix, not(target_os = "linux")), test))]
fn parse_pid_lines(stdout: &str) -> Result<Vec<u32>, ArbiterError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<u32>().map_err(|e| ArbiterError::ParseError {
                tool: "lsof".to_string(),
                detail: format!("{line:?}: {e}"),
            })
        })
        .collect()
}

/// Send SIGKILL via the `kill` command.
#[cfg(unix)]
fn kill_unix(pid: u32) -> Result<(), String> {
    let output = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .output()
        .map_err(|e| format!("kill command failed: {e}"))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

#[cfg(any(unix, test))]
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// =============================================================================
// Windows: netstat / tasklist / taskkill
// =============================================================================

#[cfg(windows)]
impl PortInspector for SystemInspector {
    fn enumerate_owners(&self, port: u16) -> Result<Vec<u32>, ArbiterError> {
        let output = run_tool("netstat", &["-ano", "-p", "TCP"])?;
        if !output.status.success() {
            return Err(ArbiterError::ParseError {
                tool: "netstat".to_string(),
                detail: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let mut pids = parse_netstat(&String::from_utf8_lossy(&output.stdout), port);
        // IPv6 listeners are reported separately.
        if let Ok(v6) = run_tool("netstat", &["-ano", "-p", "TCPv6"]) {
            pids.extend(parse_netstat(&String::from_utf8_lossy(&v6.stdout), port));
        }
        Ok(pids)
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let filter = format!("PID eq {pid}");
        let output = run_tool("tasklist", &["/FI", &filter, "/FO", "CSV", "/NH"]).ok()?;
        parse_tasklist_name(&String::from_utf8_lossy(&output.stdout))
    }

    fn terminate(&self, pid: u32) -> Result<(), String> {
        let output = Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
            .map_err(|e| format!("taskkill failed: {e}"))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.process_name(pid).is_some()
    }
}

/// PIDs with a listening socket on `port` in `netstat -ano` output.
#[cfg(any(windows, test))]
fn parse_netstat(stdout: &str, port: u16) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            let (_, local_port) = fields[1].rsplit_once(':')?;
            let (_, remote_port) = fields[2].rsplit_once(':')?;
            // Listening sockets have no remote endpoint; the state column is localized.
            if local_port.parse::<u16>().ok()? != port || remote_port != "0" {
                return None;
            }
            fields[4].parse::<u32>().ok().filter(|pid| *pid != 0)
        })
        .collect()
}

/// Image name from `tasklist /FO CSV /NH` output.
#[cfg(any(windows, test))]
fn parse_tasklist_name(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| l.starts_with('"'))?;
    let name = line.strip_prefix('"')?.split('"').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

// =============================================================================
// Unsupported platforms
// =============================================================================

#[cfg(not(any(unix, windows)))]
impl PortInspector for SystemInspector {
    fn enumerate_owners(&self, _port: u16) -> Result<Vec<u32>, ArbiterError> {
        Err(ArbiterError::Unsupported)
    }

    fn process_name(&self, _pid: u32) -> Option<String> {
        None
    }

    fn terminate(&self, _pid: u32) -> Result<(), String> {
        Err("kill not supported on this platform".to_string())
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

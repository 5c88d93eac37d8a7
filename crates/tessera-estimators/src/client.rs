//! JSON-over-stdio child-process estimator clients.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use tessera_types::MetaMap;

use crate::{DramAccess, NocCycleEstimator};

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("failed to launch estimator {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("estimator handshake failed")]
    Handshake,
}

#[derive(Debug, Serialize)]
struct PingRequest {
    op: &'static str,
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    cycles: i64,
}

/// Shared process plumbing: spawn, a reader thread feeding a channel, and a
/// request/reply exchange with timeout.
struct Pipe {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<String>,
    timeout: Duration,
}

impl Pipe {
    fn spawn(path: &Path, timeout: Duration) -> Result<Self, EstimatorError> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| EstimatorError::Spawn {
                path: path.display().to_string(),
                source,
            })?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let (tx, replies) = mpsc::channel();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        let mut pipe = Self {
            child,
            stdin,
            replies,
            timeout,
        };
        // Handshake before the first estimate so a broken binary is caught at
        // startup rather than mid-run.
        let ping = serde_json::to_string(&PingRequest { op: "ping" }).expect("serialize ping");
        match pipe.exchange(&ping) {
            Some(reply) if reply.ok => Ok(pipe),
            _ => {
                pipe.shutdown();
                Err(EstimatorError::Handshake)
            }
        }
    }

    /// One request/reply round trip. `None` covers write failures, timeouts,
    /// EOF, and unparsable replies alike; the caller disables itself on any.
    fn exchange(&mut self, request: &str) -> Option<Reply> {
        if writeln!(self.stdin, "{request}").is_err() {
            return None;
        }
        if self.stdin.flush().is_err() {
            return None;
        }
        match self.replies.recv_timeout(self.timeout) {
            Ok(line) => serde_json::from_str::<Reply>(&line).ok(),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn shutdown(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Serialize)]
struct DramRequest<'a> {
    op: &'static str,
    bytes: u64,
    access: &'static str,
    burst_bytes: u64,
    base_addr: u64,
    max_cycles: u64,
    drain_cycles: u64,
    metadata: &'a MetaMap,
}

/// DRAM timing client. One instance per run; estimates flow through the host
/// DMA controller.
pub struct RamulatorClient {
    pipe: Option<Pipe>,
}

impl RamulatorClient {
    pub fn spawn(path: &Path, timeout: Duration) -> Result<Self, EstimatorError> {
        Ok(Self {
            pipe: Some(Pipe::spawn(path, timeout)?),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.pipe.is_some()
    }

    pub fn estimate(
        &mut self,
        bytes: u64,
        access: DramAccess,
        burst_bytes: u64,
        base_addr: u64,
        metadata: &MetaMap,
    ) -> Option<u64> {
        let pipe = self.pipe.as_mut()?;
        let request = DramRequest {
            op: "estimate",
            bytes,
            access: access.wire_name(),
            burst_bytes,
            base_addr,
            max_cycles: 0,
            drain_cycles: 0,
            metadata,
        };
        let text = serde_json::to_string(&request).expect("serialize dram request");
        let reply = pipe.exchange(&text);
        match reply {
            Some(r) if r.ok && r.cycles >= 0 => Some(r.cycles as u64),
            _ => {
                warn!("ramulator protocol failure, disabling for the rest of the run");
                self.close();
                None
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            pipe.shutdown();
        }
    }
}

#[derive(Debug, Serialize)]
struct NocRequest<'a> {
    op: &'static str,
    src_node: u64,
    dst_node: u64,
    bytes: u64,
    metadata: &'a MetaMap,
}

/// Interconnect timing client.
pub struct BookSimClient {
    pipe: Option<Pipe>,
}

impl BookSimClient {
    pub fn spawn(path: &Path, timeout: Duration) -> Result<Self, EstimatorError> {
        Ok(Self {
            pipe: Some(Pipe::spawn(path, timeout)?),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.pipe.is_some()
    }
}

impl NocCycleEstimator for BookSimClient {
    fn estimate(
        &mut self,
        src_node: u64,
        dst_node: u64,
        bytes: u64,
        metadata: &MetaMap,
    ) -> Option<u64> {
        let pipe = self.pipe.as_mut()?;
        let request = NocRequest {
            op: "estimate",
            src_node,
            dst_node,
            bytes,
            metadata,
        };
        let text = serde_json::to_string(&request).expect("serialize noc request");
        match pipe.exchange(&text) {
            Some(r) if r.ok && r.cycles >= 0 => Some(r.cycles as u64),
            _ => {
                warn!("booksim protocol failure, disabling for the rest of the run");
                self.close();
                None
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            pipe.shutdown();
        }
    }
}

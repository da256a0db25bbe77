//! Cache client: key discovery, connection with backoff, daemon spawning,
//! and the two RPCs.

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::db::CacheError;
use crate::types::{AddJobRequest, CacheMessage, FindJobRequest, FindJobResponse};
use crate::wire::{send_message, MessageParser};

pub struct Cache {
    stream: UnixStream,
}

fn try_connect(dir: &Path) -> Option<UnixStream> {
    let key = std::fs::read_to_string(dir.join(".key")).ok()?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let addr = SocketAddr::from_abstract_name(key.as_bytes()).ok()?;
    UnixStream::connect_addr(&addr).ok()
}

impl Cache {
    /// Connect to a daemon already serving `dir`, retrying with
    /// exponential backoff plus jitter.
    pub fn connect(dir: &Path) -> Result<Cache, CacheError> {
        let mut backoff = Duration::from_millis(1);
        for _ in 0..10 {
            if let Some(stream) = try_connect(dir) {
                return Ok(Cache { stream });
            }
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64);
            std::thread::sleep(backoff + Duration::from_millis(jitter));
            backoff *= 2;
        }
        Err(CacheError::Unreachable(format!(
            "no daemon serving {}",
            dir.display()
        )))
    }

    /// Connect, spawning `daemon_bin dir low max` detached (stdout and
    /// stderr appended to `.log` / `.error.log`) when no daemon answers.
    pub fn connect_or_spawn(
        dir: &Path,
        low_bytes: u64,
        max_bytes: u64,
        daemon_bin: &Path,
    ) -> Result<Cache, CacheError> {
        if let Some(stream) = try_connect(dir) {
            return Ok(Cache { stream });
        }
        std::fs::create_dir_all(dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(".log"))?;
        let error_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(".error.log"))?;
        let child = Command::new(daemon_bin)
            .arg(dir)
            .arg(low_bytes.to_string())
            .arg(max_bytes.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(error_log))
            .spawn()?;
        info!(
            target: "cache.client",
            pid = child.id(),
            daemon = %daemon_bin.display(),
            "spawned cache daemon"
        );
        // The daemon lives on after us; losing the Child handle is the
        // point. If it lost the .lock race it exits on its own.
        drop(child);
        Self::connect(dir)
    }

    pub fn read(&mut self, request: &FindJobRequest) -> Result<FindJobResponse, CacheError> {
        let body = serde_json::to_string(&CacheMessage::Read(request.clone()))
            .map_err(|e| CacheError::Protocol(e.to_string()))?;
        send_message(&mut self.stream, &body)?;

        let reply_stream = self.stream.try_clone()?;
        let mut parser = MessageParser::new(reply_stream);
        let Some(reply) = parser.read_one()? else {
            return Err(CacheError::Unreachable(
                "daemon exited without responding".into(),
            ));
        };
        debug!(target: "cache.client", bytes = reply.len(), "read reply");
        serde_json::from_str(&reply).map_err(|e| CacheError::Protocol(e.to_string()))
    }

    pub fn add(&mut self, request: &AddJobRequest) -> Result<(), CacheError> {
        let body = serde_json::to_string(&CacheMessage::Add(request.clone()))
            .map_err(|e| CacheError::Protocol(e.to_string()))?;
        send_message(&mut self.stream, &body)?;
        Ok(())
    }
}

/// JSON-string adapter for the scheduler's cache hook: failures are
/// misses, never errors, so a broken daemon only costs re-execution.
impl core_jobs::JobCache for Cache {
    fn read(&mut self, request_json: &str) -> Option<String> {
        let req: FindJobRequest = match serde_json::from_str(request_json) {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "cache.client", error = %e, "bad cache/read request from program");
                return None;
            }
        };
        match Cache::read(self, &req) {
            Ok(resp) => serde_json::to_string(&resp).ok(),
            Err(e) => {
                warn!(target: "cache.client", error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    fn add(&mut self, request_json: &str) {
        let req: AddJobRequest = match serde_json::from_str(request_json) {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "cache.client", error = %e, "bad cache/add request from program");
                return;
            }
        };
        if let Err(e) = Cache::add(self, &req) {
            warn!(target: "cache.client", error = %e, "cache add failed; dropping");
        }
    }
}

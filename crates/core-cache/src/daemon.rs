//! The cache daemon: an abstract-socket server over the store.
//!
//! One daemon serves a cache directory at a time, enforced by an exclusive
//! lock on `.lock` held for the daemon's lifetime. The
//! socket name is a fresh random key published atomically as `.key`;
//! clients read the key and connect. Messages are NUL-terminated JSON.
//! Per-client reader threads parse frames and forward them to the single
//! service loop that owns the database, so clients never block each other
//! while no concurrent mutation is possible. Ten idle minutes with no
//! connected client shuts the daemon down.

use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError};
use rand::RngCore;
use tracing::{error, info, warn};

use crate::db::CacheError;
use crate::fsutil::create_file_atomic;
use crate::store::{CacheStore, EvictionSink};
use crate::types::{CacheMessage, EvictionCommand, FindJobResponse};
use crate::wire::{send_message, MessageParser, ParserState};

const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Where eviction commands go.
pub enum EvictHandle {
    /// A spawned worker process fed on stdin.
    Worker { child: Child, stdin: std::process::ChildStdin },
    /// No worker (tests, or caches that never evict).
    Disabled,
}

impl EvictionSink for EvictHandle {
    fn send(&mut self, cmd: EvictionCommand) {
        let EvictHandle::Worker { stdin, .. } = self else {
            return;
        };
        let body = match serde_json::to_string(&cmd) {
            Ok(b) => b,
            Err(e) => {
                error!(target: "cache.daemon", error = %e, "eviction command serialize failed");
                return;
            }
        };
        if let Err(e) = stdin
            .write_all(body.as_bytes())
            .and_then(|_| stdin.write_all(&[0]))
        {
            warn!(target: "cache.daemon", error = %e, "failed to send eviction update");
        }
    }
}

pub struct DaemonCache {
    dir: PathBuf,
    store: CacheStore,
    key: String,
    listener: Option<UnixListener>,
    evict: EvictHandle,
    // Held for the daemon's lifetime; dropping releases the flock lock.
    _lock: File,
}

impl DaemonCache {
    /// Bind the socket, publish the key, and (optionally) start the
    /// eviction worker — re-invoking the current executable with
    /// `--evict <dir> <low> <max>`.
    pub fn new(
        dir: &Path,
        max_bytes: u64,
        low_bytes: u64,
        spawn_evict: bool,
    ) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir)?;
        let lock = acquire_lock(dir)?;
        let store = CacheStore::open(dir)?;

        // A stale key would make clients retry a dead socket; replace it
        // only after the new socket is listening.
        let _ = std::fs::remove_file(dir.join(".key"));
        let key = fresh_key();
        let addr = SocketAddr::from_abstract_name(key.as_bytes())?;
        let listener = UnixListener::bind_addr(&addr)?;
        create_file_atomic(dir, ".key", key.as_bytes())?;
        info!(target: "cache.daemon", key = %key, dir = %dir.display(), "daemon listening");

        let evict = if spawn_evict {
            spawn_evict_worker(dir, max_bytes, low_bytes)?
        } else {
            EvictHandle::Disabled
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            store,
            key,
            listener: Some(listener),
            evict,
            _lock: lock,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serve until fatally errored or idle past the timeout.
    pub fn run(&mut self) -> Result<(), CacheError> {
        let (tx, rx) = unbounded::<(UnixStream, String)>();
        let clients = Arc::new(AtomicUsize::new(0));

        let listener = self.listener.take().expect("run called twice");
        {
            let tx = tx.clone();
            let clients = clients.clone();
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { continue };
                    clients.fetch_add(1, Ordering::SeqCst);
                    let tx = tx.clone();
                    let clients = clients.clone();
                    std::thread::spawn(move || {
                        let reply = match stream.try_clone() {
                            Ok(r) => r,
                            Err(_) => {
                                clients.fetch_sub(1, Ordering::SeqCst);
                                return;
                            }
                        };
                        let mut parser = MessageParser::new(stream);
                        let mut msgs = Vec::new();
                        loop {
                            let state = parser.read_messages(&mut msgs);
                            for msg in msgs.drain(..) {
                                let Ok(reply) = reply.try_clone() else { break };
                                if tx.send((reply, msg)).is_err() {
                                    break;
                                }
                            }
                            if state != ParserState::Continue {
                                break;
                            }
                        }
                        clients.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            });
        }
        drop(tx);

        let result = loop {
            match rx.recv_timeout(IDLE_TIMEOUT) {
                Ok((reply, msg)) => {
                    if let Err(e) = self.handle(reply, &msg) {
                        break Err(e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if clients.load(Ordering::SeqCst) == 0 {
                        info!(target: "cache.daemon", "no connection for 10 minutes, exiting");
                        break Ok(());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break Ok(()),
            }
        };

        let _ = std::fs::remove_file(self.dir.join(".key"));
        result
    }

    fn handle(&mut self, mut reply: UnixStream, msg: &str) -> Result<(), CacheError> {
        // Unknown methods and unparsable frames are fatal: a confused
        // client cannot be reasoned with, and clients know to respawn us.
        let message: CacheMessage = serde_json::from_str(msg)
            .map_err(|e| CacheError::Protocol(format!("bad message: {e}")))?;
        match message {
            CacheMessage::Read(req) => {
                let response = match self.store.read(&req, &mut self.evict) {
                    Ok(Some(m)) => FindJobResponse::hit(m),
                    Ok(None) => FindJobResponse::miss(),
                    // Restoration I/O trouble is a miss; the job reruns.
                    Err(CacheError::Io(e)) => {
                        warn!(target: "cache.daemon", error = %e, "read downgraded to miss");
                        FindJobResponse::miss()
                    }
                    Err(other) => return Err(other),
                };
                let body = serde_json::to_string(&response)
                    .map_err(|e| CacheError::Protocol(e.to_string()))?;
                if let Err(e) = send_message(&mut reply, &body) {
                    warn!(target: "cache.daemon", error = %e, "client went away before reply");
                }
                Ok(())
            }
            CacheMessage::Add(req) => {
                match self.store.add(&req, &mut self.evict) {
                    Ok(_) => Ok(()),
                    // One lost insertion is tolerable; a failed commit of
                    // the database itself is not.
                    Err(CacheError::Io(e)) => {
                        warn!(target: "cache.daemon", error = %e, "dropping failed insertion");
                        Ok(())
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }
}

fn fresh_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Take the exclusive daemon lock, failing fast when another daemon
/// already serves this directory. `flock` rather than `fcntl` record
/// locks: the lock belongs to the open file description, so even a second
/// daemon within the same process loses the race.
fn acquire_lock(dir: &Path) -> Result<File, CacheError> {
    let file = File::create(dir.join(".lock"))?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == -1 {
        return Err(CacheError::Unreachable(
            "another daemon holds the cache lock".into(),
        ));
    }
    Ok(file)
}

fn spawn_evict_worker(dir: &Path, max: u64, low: u64) -> Result<EvictHandle, CacheError> {
    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .arg("--evict")
        .arg(dir)
        .arg(low.to_string())
        .arg(max.to_string())
        .stdin(Stdio::piped())
        .spawn()?;
    let stdin = child.stdin.take().expect("stdin was piped");
    info!(target: "cache.daemon", pid = child.id(), "eviction worker started");
    Ok(EvictHandle::Worker { child, stdin })
}

impl Drop for DaemonCache {
    fn drop(&mut self) {
        if let EvictHandle::Worker { child, .. } = &mut self.evict {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

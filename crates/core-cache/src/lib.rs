//! Persistent job cache: a SQLite row store plus content-addressed output
//! blobs under group-sharded directories, fronted by a socket daemon and
//! trimmed by a separate eviction worker process.
//!
//! Layout under the cache root:
//! * `cache.db` — the row store;
//! * `.lock`, `.log`, `.error.log`, `.key` — daemon coordination;
//! * `<xx>/<job_id>/<hex-hash>` — output blobs, sharded by `job_id & 0xFF`;
//! * `tmp_<rng>/`, `tmp_outputs_<rng>/` — transient staging.

pub mod bloom;
pub mod client;
pub mod daemon;
pub mod db;
pub mod eviction;
pub mod fsutil;
pub mod store;
pub mod trie;
pub mod types;
pub mod wire;

pub use bloom::BloomFilter;
pub use client::Cache;
pub use daemon::DaemonCache;
pub use db::{CacheError, Database};
pub use eviction::{eviction_loop, EvictionPolicy, LruEvictionPolicy, NilEvictionPolicy};
pub use store::{CacheStore, EvictionSink, NullSink};
pub use trie::PathTrie;
pub use types::{
    AddJobRequest, CacheMessage, CachedOutputFile, EvictionCommand, FindJobRequest,
    FindJobResponse, InputDir, InputFile, JobOutputInfo, MatchingJob, OutputDirectory, OutputFile,
    OutputSymlink,
};

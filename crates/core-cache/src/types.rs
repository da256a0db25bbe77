//! Wire and store types of the job cache.
//!
//! These travel as JSON over the daemon socket, so every field name here
//! is protocol surface. Content hashes are lowercase hex; command lines
//! and environments are NUL-separated strings exactly as the scheduler
//! uses them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::bloom::BloomFilter;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputFile {
    pub path: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputDir {
    pub path: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputFile {
    /// Where the bytes currently live (the sandbox), for insertion.
    pub source: String,
    /// The path the job recorded.
    pub path: String,
    pub hash: String,
    pub mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputDirectory {
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSymlink {
    pub path: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedOutputFile {
    pub path: String,
    pub hash: String,
    pub mode: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOutputInfo {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
    pub runtime: f64,
    pub cputime: f64,
    pub mem: u64,
    pub ibytes: u64,
    pub obytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchingJob {
    pub output_files: Vec<CachedOutputFile>,
    pub output_dirs: Vec<OutputDirectory>,
    pub output_symlinks: Vec<OutputSymlink>,
    pub input_files: Vec<String>,
    pub input_dirs: Vec<String>,
    pub output_info: JobOutputInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindJobRequest {
    pub cwd: String,
    pub command_line: String,
    pub environment: String,
    pub stdin: String,
    pub bloom_filter: BloomFilter,
    /// Every file the requester can see: path → content hash. Ordered so
    /// derived directory hashes are repeatable.
    #[serde(default)]
    pub visible: BTreeMap<String, String>,
    #[serde(default)]
    pub dir_hashes: HashMap<String, String>,
    /// Sandbox directory → real directory, longest prefix wins.
    #[serde(default)]
    pub dir_redirects: BTreeMap<String, String>,
    #[serde(default)]
    pub client_cwd: String,
}

impl FindJobRequest {
    /// Fold the visible hashes into the request's bloom filter, matching
    /// how insertion folds input hashes.
    pub fn seal_bloom(&mut self) {
        for hash in self.visible.values() {
            self.bloom_filter.add_hex(hash);
        }
        for hash in self.dir_hashes.values() {
            self.bloom_filter.add_hex(hash);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddJobRequest {
    pub cwd: String,
    pub command_line: String,
    pub environment: String,
    pub stdin: String,
    pub bloom_filter: BloomFilter,
    #[serde(default)]
    pub inputs: Vec<InputFile>,
    #[serde(default)]
    pub input_dirs: Vec<InputDir>,
    #[serde(default)]
    pub outputs: Vec<OutputFile>,
    #[serde(default)]
    pub output_dirs: Vec<OutputDirectory>,
    #[serde(default)]
    pub output_symlinks: Vec<OutputSymlink>,
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
    pub runtime: f64,
    pub cputime: f64,
    pub mem: u64,
    pub ibytes: u64,
    pub obytes: u64,
    #[serde(default)]
    pub client_cwd: String,
}

impl AddJobRequest {
    /// Recompute the bloom filter from the recorded inputs.
    pub fn seal_bloom(&mut self) {
        self.bloom_filter = BloomFilter::new();
        for f in &self.inputs {
            self.bloom_filter.add_hex(&f.hash);
        }
        for d in &self.input_dirs {
            self.bloom_filter.add_hex(&d.hash);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindJobResponse {
    pub found: bool,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none", default)]
    pub matched: Option<MatchingJob>,
}

impl FindJobResponse {
    pub fn hit(job: MatchingJob) -> Self {
        Self {
            found: true,
            matched: Some(job),
        }
    }

    pub fn miss() -> Self {
        Self {
            found: false,
            matched: None,
        }
    }
}

/// Socket message envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum CacheMessage {
    #[serde(rename = "cache/read")]
    Read(FindJobRequest),
    #[serde(rename = "cache/add")]
    Add(AddJobRequest),
}

/// Commands to the eviction worker. The `write` command's `size` field
/// carries the job id of the inserted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum EvictionCommand {
    Read { job_id: i64 },
    Write { size: i64 },
}

//! Filesystem helpers shared by the store and the eviction worker.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Streamed content hash of one file, hex encoded.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut f = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Random 32-character name for transient files and directories.
pub fn unique_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn mkdir_p(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Write a file under a temporary name, then atomically rename into place
/// so readers only ever observe whole contents.
pub fn create_file_atomic(dir: &Path, final_name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    let tmp = dir.join(format!("{final_name}.{}", unique_name()));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
    }
    let dst = dir.join(final_name);
    fs::rename(&tmp, &dst)?;
    Ok(dst)
}

/// Copy `src` to `dst` preserving the recorded mode. A reflink would be
/// cheaper where the filesystem supports one; a plain copy is always
/// correct.
pub fn copy_with_mode(src: &Path, dst: &Path, mode: u32) -> std::io::Result<()> {
    fs::copy(src, dst)?;
    fs::set_permissions(dst, fs::Permissions::from_mode(mode))
}

/// Two lowercase hex chars of a job's shard directory: `job_id & 0xFF`.
pub fn group_name(job_id: i64) -> String {
    format!("{:02x}", (job_id as u64) & 0xFF)
}

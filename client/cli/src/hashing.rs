//! Streaming SHA-256 over files and directory trees.
//!
//! Mirrors the server's `pipeline/hash.rs` exactly: same read granularity,
//! same sorted-path tree digest, so both sides agree on every hash the
//! manifest carries.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::InstallError;

/// Read buffer for hashing; fixed so independent implementations produce
/// identical digests even under partial reads.
pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;
/// Network read granularity for progress accounting.
pub const DOWNLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// SHA-256 of a single file, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String, InstallError> {
    let mut hasher = Sha256::new();
    feed_file(&mut hasher, path)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over the concatenated contents of every regular file beneath
/// `root`, in byte-wise sorted order of `/`-normalized relative paths.
pub fn sha256_tree(root: &Path) -> Result<String, InstallError> {
    let canonical_root = root.canonicalize()?;
    let mut files: Vec<(String, PathBuf)> = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        if file_type.is_symlink() {
            let target = entry.path().canonicalize()?;
            if !target.starts_with(&canonical_root) {
                return Err(InstallError::Integrity(entry.path().to_path_buf()));
            }
            if target.is_file() {
                files.push((rel, entry.path().to_path_buf()));
            }
        } else if file_type.is_file() {
            files.push((rel, entry.path().to_path_buf()));
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (_, path) in &files {
        feed_file(&mut hasher, path)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn feed_file(hasher: &mut Sha256, path: &Path) -> Result<(), InstallError> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

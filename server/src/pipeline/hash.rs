//! Streaming SHA-256 over files and whole directory trees.
//!
//! Tree hashes feed every regular file under the root into a single digest,
//! visiting paths in byte-wise sorted order of their `/`-normalized relative
//! form, so the result is independent of filesystem enumeration order. The
//! read granularity is fixed so independent implementations produce identical
//! digests even under partial reads.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::error::PipelineError;

/// Uncompressed payload target for a packed small chunk, and the part size
/// for split large files.
pub const PREFERRED_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
/// Files at or above this size are split into parts.
pub const LARGE_FILE_SIZE: u64 = 32 * 1024 * 1024;
/// Read buffer for hashing.
pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// SHA-256 of a single file, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String, PipelineError> {
    let mut hasher = Sha256::new();
    feed_file(&mut hasher, path)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over the concatenated contents of every regular file beneath
/// `root`, in sorted path order. Directories contribute no bytes. Symlinks
/// are followed only when they resolve to a regular file inside the tree.
pub fn sha256_tree(root: &Path) -> Result<String, PipelineError> {
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
                return Err(PipelineError::Integrity(entry.path().to_path_buf()));
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

fn feed_file(hasher: &mut Sha256, path: &Path) -> Result<(), PipelineError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn file_hash_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn empty_tree_hashes_to_empty_digest() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("root")).unwrap();
        assert_eq!(sha256_tree(dir.path()).unwrap(), EMPTY_SHA256);
    }

    #[test]
    fn tree_hash_is_order_independent() {
        let a = tempfile::tempdir().unwrap();
        fs::create_dir_all(a.path().join("sub")).unwrap();
        fs::write(a.path().join("b.bin"), b"second").unwrap();
        fs::write(a.path().join("sub/a.bin"), b"third").unwrap();
        fs::write(a.path().join("a.bin"), b"first").unwrap();

        // Same digest as concatenating contents in sorted path order:
        // a.bin, b.bin, sub/a.bin
        let mut hasher = Sha256::new();
        hasher.update(b"first");
        hasher.update(b"second");
        hasher.update(b"third");
        let expected = hex::encode(hasher.finalize());

        assert_eq!(sha256_tree(a.path()).unwrap(), expected);
    }

    #[cfg(unix)]
    #[test]
    fn out_of_tree_symlink_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), b"nope").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link"))
            .unwrap();

        match sha256_tree(dir.path()) {
            Err(PipelineError::Integrity(_)) => {}
            other => panic!("expected integrity error, got {other:?}"),
        }
    }
}

//! Chunk verification and extraction into the staging pool.
//!
//! `process_chunk` is a pure function of its inputs, safe to run in parallel
//! workers: verify the chunk blob, extract it into a per-chunk scratch
//! directory, verify and pool each member by stored name (small/medium) or
//! route parts into the large-file staging area, then remove both scratch
//! and the downloaded archive.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use xz2::read::XzDecoder;

use crate::error::InstallError;
use crate::hashing::sha256_file;
use crate::manifest::{Category, ChunkEntry, FileEntry};

/// On-disk layout of one job's staging directory.
#[derive(Debug, Clone)]
pub struct StagingPaths {
    /// Raw downloaded chunk archives.
    pub chunks: PathBuf,
    /// Per-chunk extraction scratch for small/medium.
    pub tmp_small: PathBuf,
    /// Per-large-file part staging: `<storedname>/<storedname>.partN`.
    pub tmp_large: PathBuf,
    /// Flat pool of fully reconstructed files keyed by stored name.
    pub items: PathBuf,
}

impl StagingPaths {
    pub fn new(job_dir: &Path) -> Self {
        Self {
            chunks: job_dir.join("chunks"),
            tmp_small: job_dir.join("tmp_small"),
            tmp_large: job_dir.join("tmp_large"),
            items: job_dir.join("items"),
        }
    }

    pub fn create_all(&self) -> std::io::Result<()> {
        for dir in [&self.chunks, &self.tmp_small, &self.tmp_large, &self.items] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

pub fn process_chunk(
    chunk_path: &Path,
    meta: &ChunkEntry,
    files: &HashMap<String, FileEntry>,
    staging: &StagingPaths,
) -> Result<(), InstallError> {
    if sha256_file(chunk_path)? != meta.hash {
        return Err(InstallError::ChunkIntegrity {
            name: meta.name.clone(),
        });
    }

    let scratch_root = match meta.category {
        Category::Small | Category::Medium => &staging.tmp_small,
        Category::Large => &staging.tmp_large,
    };
    let scratch = scratch_root.join(&meta.name);
    if scratch.exists() {
        fs::remove_dir_all(&scratch)?;
    }
    fs::create_dir_all(&scratch)?;

    let mut archive = tar::Archive::new(XzDecoder::new(File::open(chunk_path)?));
    archive.unpack(&scratch)?;

    match meta.category {
        Category::Small | Category::Medium => {
            for entry in fs::read_dir(&scratch)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let member = entry.file_name().to_string_lossy().into_owned();
                let Some(file_meta) = files.get(&member) else {
                    return Err(InstallError::UnknownMember { name: member });
                };
                if sha256_file(&path)? != file_meta.hash {
                    return Err(InstallError::FileIntegrity {
                        path: file_meta.path.clone(),
                    });
                }
                fs::rename(&path, staging.items.join(&file_meta.name))?;
            }
        }
        Category::Large => {
            for entry in fs::read_dir(&scratch)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let member = entry.file_name().to_string_lossy().into_owned();
                let stored_name = member.split(".part").next().unwrap_or(&member);
                let parts_dir = staging.tmp_large.join(stored_name);
                fs::create_dir_all(&parts_dir)?;
                fs::rename(&path, parts_dir.join(&member))?;
            }
        }
    }

    fs::remove_dir_all(&scratch)?;
    fs::remove_file(chunk_path)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use xz2::write::XzEncoder;

    /// Build a `chunk_<index>.tar.xz` from (member name, content) pairs the
    /// way the server packer does.
    pub(crate) fn write_test_chunk(
        dir: &Path,
        index: u32,
        members: &[(&str, &[u8])],
    ) -> PathBuf {
        let staging = dir.join("members");
        fs::create_dir_all(&staging).unwrap();

        let name = format!("chunk_{index}.tar.xz");
        let path = dir.join(&name);
        let encoder = XzEncoder::new(File::create(&path).unwrap(), 6);
        let mut builder = tar::Builder::new(encoder);
        for (member, content) in members {
            let src = staging.join(member);
            fs::write(&src, content).unwrap();
            builder.append_path_with_name(&src, *member).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        fs::remove_dir_all(&staging).unwrap();
        path
    }

    pub(crate) fn chunk_entry(path: &Path, index: u32, category: Category) -> ChunkEntry {
        ChunkEntry {
            name: format!("chunk_{index}.tar.xz"),
            chunk_index: index,
            files: Vec::new(),
            hash: sha256_file(path).unwrap(),
            category,
        }
    }

    pub(crate) fn file_entry(path: &str, name: &str, content: &[u8]) -> FileEntry {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(content);
        FileEntry {
            path: path.into(),
            name: name.into(),
            size: content.len() as u64,
            hash: hex::encode(hasher.finalize()),
            category: Category::Small,
        }
    }

    fn staged(dir: &Path) -> StagingPaths {
        let staging = StagingPaths::new(dir);
        staging.create_all().unwrap();
        staging
    }

    #[test]
    fn pools_verified_small_members() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staged(dir.path());
        let chunk = write_test_chunk(&staging.chunks, 0, &[("0", b"alpha"), ("1", b"beta")]);
        let meta = chunk_entry(&chunk, 0, Category::Small);
        let files = HashMap::from([
            ("0".to_string(), file_entry("root/a", "0", b"alpha")),
            ("1".to_string(), file_entry("root/b", "1", b"beta")),
        ]);

        process_chunk(&chunk, &meta, &files, &staging).unwrap();

        assert_eq!(fs::read(staging.items.join("0")).unwrap(), b"alpha");
        assert_eq!(fs::read(staging.items.join("1")).unwrap(), b"beta");
        assert!(!chunk.exists());
        assert!(!staging.tmp_small.join(&meta.name).exists());
    }

    #[test]
    fn corrupt_chunk_is_rejected_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staged(dir.path());
        let chunk = write_test_chunk(&staging.chunks, 2, &[("0", b"alpha")]);
        let meta = chunk_entry(&chunk, 2, Category::Small);

        // Flip the first byte of the blob after its hash was recorded.
        let mut bytes = fs::read(&chunk).unwrap();
        bytes[0] = 0;
        fs::write(&chunk, &bytes).unwrap();

        let files = HashMap::new();
        match process_chunk(&chunk, &meta, &files, &staging) {
            Err(InstallError::ChunkIntegrity { name }) => {
                assert_eq!(name, "chunk_2.tar.xz")
            }
            other => panic!("expected chunk integrity error, got {other:?}"),
        }
        // Nothing was pooled.
        assert!(fs::read_dir(&staging.items).unwrap().next().is_none());
    }

    #[test]
    fn member_missing_from_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staged(dir.path());
        let chunk = write_test_chunk(&staging.chunks, 0, &[("7", b"stray")]);
        let meta = chunk_entry(&chunk, 0, Category::Small);

        match process_chunk(&chunk, &meta, &HashMap::new(), &staging) {
            Err(InstallError::UnknownMember { name }) => assert_eq!(name, "7"),
            other => panic!("expected unknown member error, got {other:?}"),
        }
    }

    #[test]
    fn tampered_member_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staged(dir.path());
        let chunk = write_test_chunk(&staging.chunks, 0, &[("0", b"evil")]);
        let meta = chunk_entry(&chunk, 0, Category::Small);
        let files = HashMap::from([("0".to_string(), file_entry("root/a", "0", b"good"))]);

        match process_chunk(&chunk, &meta, &files, &staging) {
            Err(InstallError::FileIntegrity { path }) => assert_eq!(path, "root/a"),
            other => panic!("expected file integrity error, got {other:?}"),
        }
    }

    #[test]
    fn large_parts_are_routed_by_stored_name() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staged(dir.path());
        let chunk = write_test_chunk(&staging.chunks, 5, &[("3.part1", b"bbbb")]);
        let meta = chunk_entry(&chunk, 5, Category::Large);

        process_chunk(&chunk, &meta, &HashMap::new(), &staging).unwrap();

        assert_eq!(
            fs::read(staging.tmp_large.join("3").join("3.part1")).unwrap(),
            b"bbbb"
        );
        assert!(!chunk.exists());
    }
}

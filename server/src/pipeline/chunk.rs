//! Chunk packing.
//!
//! Three passes over the manifest, in pass order: small files batched
//! together until the uncompressed payload reaches the preferred chunk size,
//! one medium file per chunk, and large files split into fixed-size parts
//! with one part per chunk. Chunk indices are assigned monotonically across
//! the passes. Each pass moves its inputs into a category scratch directory
//! before packing.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use xz2::write::XzEncoder;

use super::error::PipelineError;
use super::hash::{sha256_file, PREFERRED_CHUNK_SIZE};
use super::manifest::{Category, ChunkEntry, FileEntry, Manifest};
use super::{CHUNKS_DIR, OUT_DIR};
use crate::progress::{ProgressSink, Stage};

/// Fixed xz preset so chunk blobs (and therefore chunk hashes) are
/// reproducible across builds.
const XZ_PRESET: u32 = 6;

const SMALL_SCRATCH: &str = "scratch_small";
const MEDIUM_SCRATCH: &str = "scratch_medium";
const LARGE_SCRATCH: &str = "scratch_large";
const PARTS_SCRATCH: &str = "scratch_parts";

pub fn pack_chunks(
    work: &Path,
    manifest: &mut Manifest,
    progress: &ProgressSink,
) -> Result<(), PipelineError> {
    let out = work.join(OUT_DIR);
    let chunks_dir = work.join(CHUNKS_DIR);
    fs::create_dir_all(&chunks_dir)?;

    restore_inputs(work, manifest)?;

    let mut next_index: u32 = 0;

    // Pass 1: small.
    let small: Vec<FileEntry> = files_of(manifest, Category::Small);
    let scratch = work.join(SMALL_SCRATCH);
    fs::create_dir_all(&scratch)?;
    for meta in &small {
        fs::rename(out.join(&meta.path), scratch.join(&meta.name))?;
    }

    let sizes: Vec<u64> = small.iter().map(|f| f.size).collect();
    let batches = plan_batches(&sizes, PREFERRED_CHUNK_SIZE);
    let total_batches = batches.len();
    for (done, batch) in batches.iter().enumerate() {
        let members: Vec<(PathBuf, String)> = batch
            .iter()
            .map(|&i| (scratch.join(&small[i].name), small[i].name.clone()))
            .collect();
        let entry = write_chunk(&chunks_dir, next_index, Category::Small, &members)?;
        manifest.chunks.push(entry);
        next_index += 1;
        progress.report(Stage::SmallChunks, done + 1, total_batches);
    }
    progress.report(Stage::SmallChunks, 1, 1);
    fs::remove_dir_all(&scratch)?;

    // Pass 2: medium, one file per chunk, workers bounded by cores.
    let medium: Vec<FileEntry> = files_of(manifest, Category::Medium);
    let scratch = work.join(MEDIUM_SCRATCH);
    fs::create_dir_all(&scratch)?;
    for meta in &medium {
        fs::rename(out.join(&meta.path), scratch.join(&meta.name))?;
    }

    let tasks: Vec<(PathBuf, String, u32)> = medium
        .iter()
        .enumerate()
        .map(|(i, meta)| {
            (
                scratch.join(&meta.name),
                meta.name.clone(),
                next_index + i as u32,
            )
        })
        .collect();
    next_index += medium.len() as u32;
    let entries = run_workers(&tasks, Stage::MediumChunks, progress, |(src, name, index)| {
        write_chunk(
            &chunks_dir,
            *index,
            Category::Medium,
            &[(src.clone(), name.clone())],
        )
    })?;
    manifest.chunks.extend(entries);
    progress.report(Stage::MediumChunks, 1, 1);
    fs::remove_dir_all(&scratch)?;

    // Pass 3: large. Split every file first, then pack one part per chunk.
    let large: Vec<FileEntry> = files_of(manifest, Category::Large);
    let scratch = work.join(LARGE_SCRATCH);
    let parts_root = work.join(PARTS_SCRATCH);
    fs::create_dir_all(&scratch)?;
    fs::create_dir_all(&parts_root)?;
    for meta in &large {
        let staged = scratch.join(&meta.name);
        fs::rename(out.join(&meta.path), &staged)?;
        split_file(&staged, &parts_root, &meta.name, PREFERRED_CHUNK_SIZE as usize)?;
        fs::remove_file(&staged)?;
    }
    fs::remove_dir_all(&scratch)?;

    // Sorted by (stored name, part index) so every file's part chunks form
    // one contiguous index run.
    let mut parts: Vec<(u64, u64, PathBuf, String)> = Vec::new();
    for entry in fs::read_dir(&parts_root)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let (Some(stem), Some(index)) = (file_name.split(".part").next(), part_index(&file_name))
        else {
            continue;
        };
        let Ok(file_no) = stem.parse::<u64>() else {
            continue;
        };
        parts.push((file_no, index, entry.path(), file_name));
    }
    parts.sort_by_key(|p| (p.0, p.1));

    let tasks: Vec<(PathBuf, String, u32)> = parts
        .into_iter()
        .enumerate()
        .map(|(i, (_, _, path, name))| (path, name, next_index + i as u32))
        .collect();
    let entries = run_workers(&tasks, Stage::LargeChunks, progress, |(src, name, index)| {
        write_chunk(
            &chunks_dir,
            *index,
            Category::Large,
            &[(src.clone(), name.clone())],
        )
    })?;
    manifest.chunks.extend(entries);
    progress.report(Stage::LargeChunks, 1, 1);
    fs::remove_dir_all(&parts_root)?;

    manifest.chunks.sort_by_key(|c| c.chunk_index);
    Ok(())
}

/// Run `job` over `tasks` on a scoped worker pool bounded by the host's
/// cores. The first failure wins; remaining workers stop at their next
/// task boundary.
fn run_workers<T, F>(
    tasks: &[T],
    stage: Stage,
    progress: &ProgressSink,
    job: F,
) -> Result<Vec<ChunkEntry>, PipelineError>
where
    T: Sync,
    F: Fn(&T) -> Result<ChunkEntry, PipelineError> + Sync,
{
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(tasks.len());

    let next = AtomicUsize::new(0);
    let done = AtomicUsize::new(0);
    let results: Mutex<Vec<ChunkEntry>> = Mutex::new(Vec::with_capacity(tasks.len()));
    let failure: Mutex<Option<PipelineError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if failure.lock().unwrap().is_some() {
                    break;
                }
                let i = next.fetch_add(1, Ordering::SeqCst);
                if i >= tasks.len() {
                    break;
                }
                match job(&tasks[i]) {
                    Ok(entry) => {
                        results.lock().unwrap().push(entry);
                        let completed = done.fetch_add(1, Ordering::SeqCst) + 1;
                        progress.report(stage, completed, tasks.len());
                    }
                    Err(e) => {
                        failure.lock().unwrap().get_or_insert(e);
                        break;
                    }
                }
            });
        }
    });

    if let Some(err) = failure.into_inner().unwrap() {
        return Err(err);
    }
    Ok(results.into_inner().unwrap())
}

fn files_of(manifest: &Manifest, category: Category) -> Vec<FileEntry> {
    manifest
        .files
        .iter()
        .filter(|f| f.category == category)
        .cloned()
        .collect()
}

/// Group small-file indices into batches. A batch closes as soon as its
/// cumulative size after appending reaches the threshold, so the final batch
/// of a run may exceed it by up to one file.
fn plan_batches(sizes: &[u64], threshold: u64) -> Vec<Vec<usize>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0u64;

    for (i, size) in sizes.iter().enumerate() {
        current.push(i);
        current_size += size;
        if current_size >= threshold {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Write one `chunk_<index>.tar.xz` containing `members` flat under their
/// stored names, and return its manifest entry.
fn write_chunk(
    chunks_dir: &Path,
    index: u32,
    category: Category,
    members: &[(PathBuf, String)],
) -> Result<ChunkEntry, PipelineError> {
    let name = format!("chunk_{index}.tar.xz");
    let path = chunks_dir.join(&name);

    let encoder = XzEncoder::new(File::create(&path)?, XZ_PRESET);
    let mut builder = tar::Builder::new(encoder);
    for (src, arcname) in members {
        builder.append_path_with_name(src, arcname)?;
    }
    builder.into_inner()?.finish()?;

    Ok(ChunkEntry {
        hash: sha256_file(&path)?,
        name,
        chunk_index: index,
        files: members.iter().map(|(_, n)| n.clone()).collect(),
        category,
    })
}

/// Write `<stored_name>.part<i>` slices of `src` into `parts_dir`. Every
/// part is exactly `part_size` bytes except possibly the last.
fn split_file(
    src: &Path,
    parts_dir: &Path,
    stored_name: &str,
    part_size: usize,
) -> Result<(), PipelineError> {
    let mut file = File::open(src)?;
    let mut buf = vec![0u8; part_size];
    let mut index = 0u64;

    loop {
        let mut filled = 0;
        while filled < part_size {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        fs::write(parts_dir.join(format!("{stored_name}.part{index}")), &buf[..filled])?;
        index += 1;
        if filled < part_size {
            break;
        }
    }
    Ok(())
}

/// Parse the integer suffix of `<name>.part<i>`. Part order is by this
/// integer, never lexicographic.
fn part_index(file_name: &str) -> Option<u64> {
    file_name.rsplit(".part").next()?.parse().ok()
}

/// After an interrupted run some inputs may already sit in the category
/// scratch directories, or exist only as split parts. Move them back under
/// the extracted tree so the passes start from a consistent state.
fn restore_inputs(work: &Path, manifest: &Manifest) -> Result<(), PipelineError> {
    let out = work.join(OUT_DIR);
    let parts_root = work.join(PARTS_SCRATCH);

    for meta in &manifest.files {
        let dest = out.join(&meta.path);
        if dest.exists() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let scratch = match meta.category {
            Category::Small => SMALL_SCRATCH,
            Category::Medium => MEDIUM_SCRATCH,
            Category::Large => LARGE_SCRATCH,
        };
        let staged = work.join(scratch).join(&meta.name);
        if staged.exists() {
            fs::rename(&staged, &dest)?;
            continue;
        }
        if meta.category == Category::Large && parts_root.exists() {
            rejoin_parts(&parts_root, &meta.name, &dest)?;
        }
    }
    Ok(())
}

fn rejoin_parts(
    parts_root: &Path,
    stored_name: &str,
    dest: &Path,
) -> Result<(), PipelineError> {
    let prefix = format!("{stored_name}.part");
    let mut parts: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(parts_root)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(rest) = file_name.strip_prefix(&prefix) {
            if let Ok(i) = rest.parse::<u64>() {
                parts.push((i, entry.path()));
            }
        }
    }
    if parts.is_empty() {
        // Input genuinely missing; the pack pass surfaces the error.
        return Ok(());
    }
    parts.sort_by_key(|p| p.0);

    let mut output = File::create(dest)?;
    for (_, path) in &parts {
        io::copy(&mut File::open(path)?, &mut output)?;
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::manifest::FolderEntry;
    use xz2::read::XzDecoder;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn batches_close_on_threshold() {
        let sizes = vec![MIB; 20];
        let batches = plan_batches(&sizes, 8 * MIB);
        let lens: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(lens, vec![8, 8, 4]);
    }

    #[test]
    fn final_batch_may_exceed_threshold() {
        // 7 MiB accumulated, then a 4 MiB file pushes past the threshold;
        // the batch closes only after appending.
        let sizes = vec![7 * MIB, 4 * MIB, MIB];
        let batches = plan_batches(&sizes, 8 * MIB);
        assert_eq!(batches, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn single_file_at_threshold_is_one_batch() {
        assert_eq!(plan_batches(&[8 * MIB], 8 * MIB).len(), 1);
        assert!(plan_batches(&[], 8 * MIB).is_empty());
    }

    #[test]
    fn split_produces_fixed_size_parts() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big");
        fs::write(&src, [7u8; 10]).unwrap();
        let parts = dir.path().join("parts");
        fs::create_dir(&parts).unwrap();

        split_file(&src, &parts, "3", 4).unwrap();

        assert_eq!(fs::read(parts.join("3.part0")).unwrap().len(), 4);
        assert_eq!(fs::read(parts.join("3.part1")).unwrap().len(), 4);
        assert_eq!(fs::read(parts.join("3.part2")).unwrap().len(), 2);
        assert!(!parts.join("3.part3").exists());
    }

    #[test]
    fn split_exact_multiple_has_no_empty_tail() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big");
        fs::write(&src, [1u8; 8]).unwrap();
        let parts = dir.path().join("parts");
        fs::create_dir(&parts).unwrap();

        split_file(&src, &parts, "0", 4).unwrap();
        assert!(parts.join("0.part1").exists());
        assert!(!parts.join("0.part2").exists());
    }

    #[test]
    fn part_suffix_parses_as_integer() {
        assert_eq!(part_index("3.part10"), Some(10));
        assert_eq!(part_index("0.part0"), Some(0));
        assert_eq!(part_index("banana"), None);
    }

    fn entry(path: &str, name: &str, size: u64, category: Category) -> FileEntry {
        FileEntry {
            path: path.into(),
            name: name.into(),
            size,
            hash: String::new(),
            category,
        }
    }

    fn test_manifest(files: Vec<FileEntry>) -> Manifest {
        Manifest {
            name: "G".into(),
            root: "root".into(),
            run: String::new(),
            save_in_game_folder: false,
            save_path: None,
            folders: vec![FolderEntry { path: "root".into() }],
            files,
            chunks: Vec::new(),
            hash: String::new(),
        }
    }

    fn chunk_member_names(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(XzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[test]
    fn packs_all_three_categories_in_pass_order() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let out = work.join(OUT_DIR);
        fs::create_dir_all(out.join("root")).unwrap();
        fs::write(out.join("root/tiny_a"), b"aaaa").unwrap();
        fs::write(out.join("root/tiny_b"), b"bbbb").unwrap();
        fs::write(out.join("root/mid"), b"mmmm").unwrap();
        fs::write(out.join("root/big"), b"gggg").unwrap();

        // Categories come from the manifest, so small fixtures can exercise
        // the medium and large passes too.
        let mut manifest = test_manifest(vec![
            entry("root/tiny_a", "0", 4, Category::Small),
            entry("root/tiny_b", "1", 4, Category::Small),
            entry("root/mid", "2", 4, Category::Medium),
            entry("root/big", "3", 4, Category::Large),
        ]);

        pack_chunks(work, &mut manifest, &ProgressSink::discard()).unwrap();

        let indices: Vec<u32> = manifest.chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        assert_eq!(manifest.chunks[0].category, Category::Small);
        assert_eq!(manifest.chunks[0].files, vec!["0", "1"]);
        assert_eq!(manifest.chunks[1].category, Category::Medium);
        assert_eq!(manifest.chunks[1].files, vec!["2"]);
        assert_eq!(manifest.chunks[2].category, Category::Large);
        assert_eq!(manifest.chunks[2].files, vec!["3.part0"]);

        for chunk in &manifest.chunks {
            let path = work.join(CHUNKS_DIR).join(&chunk.name);
            assert_eq!(sha256_file(&path).unwrap(), chunk.hash);
        }
        assert_eq!(
            chunk_member_names(&work.join(CHUNKS_DIR).join("chunk_0.tar.xz")),
            vec!["0", "1"]
        );

        // Inputs were consumed by the passes.
        assert!(!out.join("root/tiny_a").exists());
        assert!(!work.join(SMALL_SCRATCH).exists());
        assert!(!work.join(PARTS_SCRATCH).exists());
    }

    #[test]
    fn resumes_with_inputs_left_in_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let out = work.join(OUT_DIR);
        fs::create_dir_all(out.join("root")).unwrap();
        fs::write(out.join("root/kept"), b"kept").unwrap();

        // Simulate a crash that already moved one input into scratch.
        let scratch = work.join(SMALL_SCRATCH);
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("1"), b"moved").unwrap();

        let mut manifest = test_manifest(vec![
            entry("root/kept", "0", 4, Category::Small),
            entry("root/moved", "1", 5, Category::Small),
        ]);

        pack_chunks(work, &mut manifest, &ProgressSink::discard()).unwrap();
        assert_eq!(manifest.chunks.len(), 1);
        assert_eq!(manifest.chunks[0].files, vec!["0", "1"]);
    }
}

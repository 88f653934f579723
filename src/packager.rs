// Output packaging.
//
// Either hand back whatever ComfyUI wrote, or (for TensorRT engines, which are huge) bundle the
// matching files into one stored zip and cut that into fixed-size parts. Putting the parts back
// together is the caller's problem: `cat engines.zip.part* > engines.zip`.

use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::config::PackagingConfig;

/// All files under `dir`, recursively, in sorted order.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
            let file_type = entry.file_type().context("failed to stat output")?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Writes `files` into an uncompressed zip at `archive`. Entry names are relative to `base`.
pub fn archive_files(files: &[PathBuf], base: &Path, archive: &Path) -> Result<u64> {
    let out = File::create(archive).with_context(|| format!("failed to create {}", archive.display()))?;
    let mut zip = ZipWriter::new(out);
    // Engines don't compress, and large_file lifts the 4GiB limit.
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);
    for path in files {
        let name = path.strip_prefix(base).unwrap_or(path).to_string_lossy().into_owned();
        debug!("Archiving {}", name);
        zip.start_file(name, options)
            .with_context(|| format!("failed to add {} to archive", path.display()))?;
        let mut src = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        std::io::copy(&mut src, &mut zip)
            .with_context(|| format!("failed to archive {}", path.display()))?;
    }
    let mut out = zip.finish().context("failed to finish archive")?;
    out.flush().context("failed to flush archive")?;
    let size = out.metadata().context("failed to stat archive")?.len();
    info!("Archived {} files into {} ({} bytes)", files.len(), archive.display(), size);
    Ok(size)
}

/// `engines.zip` -> `engines.zip.part1`, `engines.zip.part2`, ...
pub fn chunk_path(archive: &Path, index: u64) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(format!(".part{index}"));
    PathBuf::from(name)
}

/// Cuts `path` into `chunk_size` pieces next to it. The last piece may be short.
pub fn split_file(path: &Path, chunk_size: u64) -> Result<Vec<PathBuf>> {
    if chunk_size == 0 {
        bail!("chunk size must be positive");
    }
    let mut src = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let size = src.metadata().context("failed to stat archive")?.len();
    let count = size.div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(count as usize);
    for index in 1..=count {
        let chunk = chunk_path(path, index);
        let mut out =
            File::create(&chunk).with_context(|| format!("failed to create {}", chunk.display()))?;
        let written = std::io::copy(&mut (&mut src).take(chunk_size), &mut out)
            .with_context(|| format!("failed to write {}", chunk.display()))?;
        let expected = chunk_size.min(size - (index - 1) * chunk_size);
        if written != expected {
            bail!("{} changed while splitting it", path.display());
        }
        debug!("Wrote {} ({} bytes)", chunk.display(), written);
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Everything ComfyUI left in `output_dir`, in sorted order.
pub async fn collect(output_dir: &Path) -> Result<Vec<PathBuf>> {
    let output_dir = output_dir.to_owned();
    let files = tokio::task::spawn_blocking(move || list_files(&output_dir))
        .await
        .context("listing task panicked")??;
    info!("Collected {} output files", files.len());
    Ok(files)
}

fn package_blocking(
    config: &PackagingConfig,
    files: Vec<PathBuf>,
    output_dir: &Path,
    package_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let (matching, skipped): (Vec<_>, Vec<_>) = files.into_iter().partition(|f| {
        f.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&config.extension))
    });
    if !skipped.is_empty() {
        debug!("Leaving out {} files without {}", skipped.len(), config.extension);
    }
    if matching.is_empty() {
        warn!("No {} files in {}; nothing to package", config.extension, output_dir.display());
        return Ok(vec![]);
    }
    std::fs::create_dir_all(package_dir)
        .with_context(|| format!("failed to create {}", package_dir.display()))?;
    let archive = package_dir.join(&config.archive_name);
    archive_files(&matching, output_dir, &archive)?;
    let chunks = split_file(&archive, config.chunk_size)?;
    std::fs::remove_file(&archive).with_context(|| format!("failed to remove {}", archive.display()))?;
    info!("Split {} into {} chunks", config.archive_name, chunks.len());
    Ok(chunks)
}

/// Archives the files carrying the configured extension into `package_dir` and splits the
/// archive. Returns the chunks in order. Entry names are relative to `output_dir`.
pub async fn package(
    config: &PackagingConfig,
    files: Vec<PathBuf>,
    output_dir: &Path,
    package_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let config = config.clone();
    let output_dir = output_dir.to_owned();
    let package_dir = package_dir.to_owned();
    tokio::task::spawn_blocking(move || package_blocking(&config, files, &output_dir, &package_dir))
        .await
        .context("packaging task panicked")?
}

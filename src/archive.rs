//! Zip archive builder

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{PipelineError, Result};
use crate::mail::{candidate_name, split_filename};

/// Compress `file_paths` into a deflate zip at `output_path`
///
/// Dropping the returned future stops the blocking writer at the next entry
/// and removes its partial file.
pub async fn compress(file_paths: &[PathBuf], output_path: &Path) -> Result<PathBuf> {
    let sources = file_paths.to_vec();
    let output = output_path.to_path_buf();
    let guard = CancelOnDrop::default();
    let cancel = Arc::clone(&guard.0);

    let result = tokio::task::spawn_blocking(move || compress_blocking(&sources, &output, &cancel))
        .await
        .map_err(|e| PipelineError::Unhandled(format!("Archive task failed: {}", e)))?;
    guard.disarm();
    result
}

/// Raises its flag when dropped before [`CancelOnDrop::disarm`]
#[derive(Default)]
struct CancelOnDrop(Arc<AtomicBool>, bool);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.1 = true;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.1 {
            self.0.store(true, Ordering::Relaxed);
        }
    }
}

/// Blocking body of [`compress`]; stops between entries once `cancel` is set
pub fn compress_blocking(
    file_paths: &[PathBuf],
    output_path: &Path,
    cancel: &AtomicBool,
) -> Result<PathBuf> {
    if let Some(missing) = file_paths.iter().find(|path| !path.is_file()) {
        return Err(PipelineError::SourceMissing(missing.clone()));
    }
    if cancel.load(Ordering::Relaxed) {
        return Err(cancelled().into());
    }

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let partial = partial_path(output_path);
    let written = write_archive(file_paths, &partial, cancel).and_then(|()| {
        if cancel.load(Ordering::Relaxed) {
            Err(cancelled())
        } else {
            Ok(())
        }
    });
    if let Err(e) = written {
        if let Err(cleanup) = std::fs::remove_file(&partial) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove partial archive {:?}: {}", partial, cleanup);
            }
        }
        return Err(e.into());
    }
    std::fs::rename(&partial, output_path)?;

    info!(
        "Created {} with {} entries",
        output_path.display(),
        file_paths.len()
    );
    Ok(output_path.to_path_buf())
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "archive cancelled")
}

fn partial_path(output_path: &Path) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    output_path.with_file_name(name)
}

fn write_archive(file_paths: &[PathBuf], target: &Path, cancel: &AtomicBool) -> io::Result<()> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(target)?));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut used = HashSet::new();

    for path in file_paths {
        if cancel.load(Ordering::Relaxed) {
            return Err(cancelled());
        }
        let entry = entry_name(path, &mut used);
        debug!("Adding {} as {}", path.display(), entry);
        zip.start_file(entry.as_str(), options)?;
        let mut source = File::open(path)?;
        io::copy(&mut source, &mut zip)?;
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    Ok(())
}

/// Base name of `path`, suffixed `_N` when an earlier entry already took it
fn entry_name(path: &Path, used: &mut HashSet<String>) -> String {
    let base = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let (stem, extension) = split_filename(&base);

    let mut n = 0;
    loop {
        let candidate = candidate_name(stem, extension, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

//! Static asset copying.
//!
//! Walks the static source directory in file-name order and copies every
//! non-directory entry to the same relative path under the output directory.
//! Each file is one executor operation; walk errors become failing operations
//! so they surface the same way copy errors do.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_exec::{Executor, RunStats};
use walkdir::WalkDir;

use crate::Error;

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("{} is outside the source directory", .0.display())]
    OutsideSource(PathBuf),

    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy {} to {}: {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a successful [`copy_tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    pub stats: RunStats,
    pub bytes: u64,
}

impl CopyReport {
    pub fn files(&self) -> usize {
        self.stats.succeeded
    }
}

/// Copy every file under `src` into `dst` through `executor`.
pub async fn copy_tree(src: &Path, dst: &Path, executor: Executor) -> Result<CopyReport, Error> {
    if !src.is_dir() {
        return Err(Error::MissingSource(src.to_path_buf()));
    }
    let resolved_src = resolve(src).map_err(|source| Error::Resolve {
        path: src.to_path_buf(),
        source,
    })?;
    let resolved_dst = resolve(dst).map_err(|source| Error::Resolve {
        path: dst.to_path_buf(),
        source,
    })?;
    if resolved_dst.starts_with(&resolved_src) {
        return Err(Error::NestedOutput {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
    }

    tracing::info!(
        src = %src.display(),
        dst = %dst.display(),
        limit = executor.config().limit.get(),
        "Copying static assets"
    );

    let entries = WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter(|entry| !matches!(entry, Ok(e) if e.file_type().is_dir()));

    let bytes = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&bytes);
    let src_root = src.to_path_buf();
    let dst_root = dst.to_path_buf();

    let stats = executor
        .run_iter(entries, move |entry| {
            let src_root = src_root.clone();
            let dst_root = dst_root.clone();
            let counter = Arc::clone(&counter);
            async move {
                let entry = entry?;
                let copied = copy_file(&src_root, &dst_root, entry.path()).await?;
                counter.fetch_add(copied, Ordering::Relaxed);
                Ok::<_, AssetError>(())
            }
        })
        .await?;

    Ok(CopyReport {
        stats,
        bytes: bytes.load(Ordering::Relaxed),
    })
}

/// Absolute, symlink-free form of `path`, which need not exist yet.
///
/// The longest existing ancestor is canonicalized; the missing tail is
/// normalized lexically.
fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;

    let mut existing = absolute.clone();
    let mut missing = Vec::new();
    while !existing.exists() {
        let Some(last) = existing.components().next_back() else {
            break;
        };
        let last = last.as_os_str().to_os_string();
        if !existing.pop() {
            break;
        }
        missing.push(last);
    }

    let mut resolved = existing.canonicalize()?;
    for name in missing.into_iter().rev() {
        for component in Path::new(&name).components() {
            match component {
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir => {}
                other => resolved.push(other),
            }
        }
    }
    Ok(resolved)
}

async fn copy_file(src_root: &Path, dst_root: &Path, path: &Path) -> Result<u64, AssetError> {
    let relative = path
        .strip_prefix(src_root)
        .map_err(|_| AssetError::OutsideSource(path.to_path_buf()))?;
    let target = dst_root.join(relative);

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| AssetError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let bytes = tokio::fs::copy(path, &target)
        .await
        .map_err(|source| AssetError::Copy {
            from: path.to_path_buf(),
            to: target.clone(),
            source,
        })?;

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    tracing::debug!(path = %relative.display(), %mime, bytes, "Copied asset");
    Ok(bytes)
}

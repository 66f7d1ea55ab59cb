//! Error types at the pipeline seams.
//!
//! Plumbing inside the crate uses `anyhow`; these enums exist where callers
//! need to tell a fatal failure from a per-item one.

use std::path::PathBuf;
use thiserror::Error;

/// A failure that ends a scan run.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("face detector failed to load: {0:#}")]
    ModelInit(anyhow::Error),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("scan cancelled")]
    Cancelled,
}

/// A failure that ends a clustering run without committing an epoch.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("clustering cancelled")]
    Cancelled,
    #[error("no embeddings of dimension {expected} could be loaded")]
    DimensionMismatch { expected: usize },
}

/// A failure local to one photo. Recorded as `scan_status = error` and
/// retried on the next scan.
#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("file not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {}: {message}", path.display())]
    Decode { path: PathBuf, message: String },
    #[error("detection failed for {}: {message}", path.display())]
    Detect { path: PathBuf, message: String },
}

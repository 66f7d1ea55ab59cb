//! Incremental face scan.
//!
//! A run discovers images under the configured roots, drops photos that
//! vanished from disk, and detects faces in every photo that is new or whose
//! last attempt did not complete. Photos already `completed` are never
//! detected again.

pub mod decode;
pub mod discovery;
pub mod filter;
pub mod hashing;
pub mod throttle;

use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;

use crate::config::ConfigProvider;
use crate::db::{Database, EmbeddingStore, NewFace, ScanStatus, ScannedPhoto};
use crate::error::{PhotoError, ScanError};
use crate::faces::{l2_normalize, DetectorFactory, FaceDetector};
use crate::tasks::{report, report_warning, StatusSink};

pub use discovery::discover_images;
pub use filter::PathFilter;
pub use throttle::Throttle;

/// Names listed individually in the new/retry status lines.
const LISTED_NAMES: usize = 10;

/// Counters for one scan run.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Images on disk after exclusions.
    pub total_found: usize,
    /// Images on disk not yet `completed`, retries included.
    pub new_photos: usize,
    /// Of those, photos with an earlier failed or unfinished attempt.
    pub retried: usize,
    pub deleted: usize,
    /// Photos that reached `completed` in this run.
    pub processed: usize,
    /// Photos found already completed at upsert time.
    pub skipped: usize,
    pub faces_found: usize,
    pub errors: usize,
}

impl ScanOutcome {
    /// Photos not yet completed, or deletions, change what clustering
    /// would produce.
    pub fn needs_clustering(&self) -> bool {
        self.new_photos > 0 || self.deleted > 0
    }
}

/// A photo read and decoded, ready for detection.
struct Prepared {
    path: PathBuf,
    hash: String,
    image: DynamicImage,
}

pub struct ScanPipeline {
    db: Arc<Database>,
    store: Arc<EmbeddingStore>,
    config: Arc<dyn ConfigProvider>,
    detectors: Arc<dyn DetectorFactory>,
}

impl ScanPipeline {
    pub fn new(
        db: Arc<Database>,
        store: Arc<EmbeddingStore>,
        config: Arc<dyn ConfigProvider>,
        detectors: Arc<dyn DetectorFactory>,
    ) -> Self {
        Self {
            db,
            store,
            config,
            detectors,
        }
    }

    /// Run one scan. Per-photo failures are recorded as `error` and counted;
    /// only a detector that fails to load, a storage failure outside a batch
    /// commit, or cancellation end the run early.
    pub fn run(&self, sink: &dyn StatusSink, cancel: &AtomicBool) -> Result<ScanOutcome, ScanError> {
        let include = self.config.include_folders();
        if include.is_empty() {
            report(sink, "No folders configured for scanning");
            return Ok(ScanOutcome::default());
        }

        let filter = PathFilter::new(
            &include,
            &self.config.exclude_folders(),
            &self.config.wildcard_exclusions(),
        );
        let settings = self.config.snapshot().scanner;

        report(sink, "Discovering photos...");
        let (images, missing_roots) = discover_images(&filter, &settings.image_extensions);
        for root in &missing_roots {
            report_warning(sink, format!("WARNING: Folder does not exist: {}", root.display()));
        }
        report(sink, format!("Found {} images after applying exclusions", images.len()));

        let mut outcome = ScanOutcome {
            total_found: images.len(),
            ..Default::default()
        };

        let live: HashSet<String> = images.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        outcome.deleted = self.db.remove_deleted_photos(&live)?;
        if outcome.deleted > 0 {
            report(sink, format!("Removed {} deleted photos from database", outcome.deleted));
            self.db.prune_stale_assignments()?;
        }

        if cancel.load(Ordering::SeqCst) {
            return Err(ScanError::Cancelled);
        }

        let completed = self.db.completed_paths()?;
        let unscanned: BTreeSet<PathBuf> = images
            .iter()
            .filter(|p| !completed.contains(p.to_string_lossy().as_ref()))
            .cloned()
            .collect();

        let retry_all = self.db.pending_and_error_paths()?;
        let retry_total = retry_all.len();
        let retry: BTreeSet<PathBuf> = retry_all
            .into_iter()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .collect();
        let stale = retry_total - retry.len();
        if stale > 0 {
            report(sink, format!("Ignoring {} pending files that no longer exist", stale));
        }

        // Pending rows for files discovered again are listed as retries.
        let new: BTreeSet<PathBuf> = unscanned.difference(&retry).cloned().collect();
        outcome.new_photos = unscanned.len();
        outcome.retried = retry.len();

        let to_scan: Vec<PathBuf> = new.iter().chain(retry.iter()).cloned().collect();
        if to_scan.is_empty() {
            report(sink, "No new photos to scan");
            return Ok(outcome);
        }

        report(
            sink,
            format!("Found {} new photos, {} incomplete", new.len(), retry.len()),
        );
        list_names(sink, "NEW", &new);
        list_names(sink, "RETRY", &retry);

        let mut detector = self
            .detectors
            .create()
            .map_err(ScanError::ModelInit)?;

        let total = to_scan.len();
        let already_done = outcome.total_found.saturating_sub(total);
        let batch_size = settings.batch_size.max(1);
        let throttle = Throttle::new(settings.throttle_factor, settings.max_throttle_ms);

        report(sink, format!("Starting scan of {} photos...", total));

        for (batch_index, chunk) in to_scan.chunks(batch_size).enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Err(ScanError::Cancelled);
            }

            let prep_started = Instant::now();
            let prepared: Vec<(PathBuf, Result<Prepared, PhotoError>)> = chunk
                .par_iter()
                .map(|path| (path.clone(), prepare(path)))
                .collect();
            let prep_share = prep_started.elapsed() / chunk.len() as u32;

            let mut batch = Vec::with_capacity(chunk.len());
            let mut cancelled = false;

            for (i, (path, prepared)) in prepared.into_iter().enumerate() {
                if cancel.load(Ordering::SeqCst) {
                    cancelled = true;
                    break;
                }

                let index = batch_index * batch_size + i;
                sink.on_progress(already_done + index + 1, outcome.total_found);
                if index == 0 || (index + 1) % 10 == 0 || index + 1 == total {
                    let kind = if new.contains(&path) { "NEW" } else { "RETRY" };
                    report(
                        sink,
                        format!("Scanning {}: {} ({}/{})", kind, file_name(&path), index + 1, total),
                    );
                }

                let started = Instant::now();
                match self.detect_photo(&mut *detector, prepared) {
                    Ok(Some(scanned)) => batch.push(scanned),
                    Ok(None) => outcome.skipped += 1,
                    Err(e) => {
                        outcome.errors += 1;
                        report_warning(sink, format!("ERROR: {}", e));
                        self.record_error(&path)?;
                    }
                }

                throttle.pause(started.elapsed() + prep_share, self.config.as_ref(), cancel);
            }

            self.commit_batch(&batch, &mut outcome, sink)?;

            if cancelled {
                return Err(ScanError::Cancelled);
            }
        }

        Ok(outcome)
    }

    /// Upsert the photo row and detect its faces. `None` when the row was
    /// already completed and detection is skipped.
    fn detect_photo(
        &self,
        detector: &mut dyn FaceDetector,
        prepared: Result<Prepared, PhotoError>,
    ) -> Result<Option<ScannedPhoto>, PhotoError> {
        let prepared = prepared?;
        let path_str = prepared.path.to_string_lossy();

        let (photo_id, status) = self
            .db
            .upsert_photo(&path_str, &prepared.hash)
            .map_err(|e| PhotoError::Detect {
                path: prepared.path.clone(),
                message: format!("{:#}", e),
            })?;
        if status == ScanStatus::Completed {
            return Ok(None);
        }

        let detected = detector
            .detect(&prepared.image)
            .map_err(|e| PhotoError::Detect {
                path: prepared.path.clone(),
                message: format!("{:#}", e),
            })?;

        let mut faces = Vec::with_capacity(detected.len());
        for face in detected {
            match l2_normalize(&face.embedding) {
                Some(embedding) => faces.push(NewFace {
                    bbox: face.bbox,
                    embedding,
                }),
                None => tracing::warn!(path = %path_str, "Dropping face with degenerate embedding"),
            }
        }
        tracing::debug!(path = %path_str, faces = faces.len(), "Faces detected");

        Ok(Some(ScannedPhoto { photo_id, faces }))
    }

    /// Record a per-photo failure. Files without a row get one so the retry
    /// list picks them up next time.
    fn record_error(&self, path: &Path) -> Result<(), ScanError> {
        let path_str = path.to_string_lossy();
        let photo_id = match self.db.photo_id_for_path(&path_str)? {
            Some(id) => id,
            None if path.exists() => self.db.upsert_photo(&path_str, "")?.0,
            None => return Ok(()),
        };
        self.db.set_photo_status(photo_id, ScanStatus::Error)?;
        Ok(())
    }

    fn commit_batch(
        &self,
        batch: &[ScannedPhoto],
        outcome: &mut ScanOutcome,
        sink: &dyn StatusSink,
    ) -> Result<(), ScanError> {
        if batch.is_empty() {
            return Ok(());
        }

        match self.db.commit_scanned_batch(batch, &self.store) {
            Ok(ids) => {
                outcome.processed += batch.len();
                outcome.faces_found += ids.iter().map(Vec::len).sum::<usize>();
            }
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), photos = batch.len(), "Batch commit failed");
                report_warning(
                    sink,
                    format!("ERROR: Failed to save {} photos, will retry next scan", batch.len()),
                );
                let ids: Vec<i64> = batch.iter().map(|p| p.photo_id).collect();
                self.db.mark_photos_error(&ids)?;
                outcome.errors += batch.len();
            }
        }
        Ok(())
    }
}

fn prepare(path: &Path) -> Result<Prepared, PhotoError> {
    if !path.exists() {
        return Err(PhotoError::Missing(path.to_path_buf()));
    }
    let hash = hashing::file_md5(path)?;
    let image = decode::load_oriented(path)?;
    Ok(Prepared {
        path: path.to_path_buf(),
        hash,
        image,
    })
}

fn list_names(sink: &dyn StatusSink, label: &str, paths: &BTreeSet<PathBuf>) {
    for path in paths.iter().take(LISTED_NAMES) {
        report(sink, format!("  {}: {}", label, file_name(path)));
    }
    if paths.len() > LISTED_NAMES {
        report(sink, format!("  ... and {} more", paths.len() - LISTED_NAMES));
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db::BoundingBox;
    use crate::faces::DetectedFace;
    use anyhow::{anyhow, Result};
    use image::{GenericImageView, Rgb, RgbImage};
    use std::sync::atomic::AtomicUsize;

    /// Detector keyed on the red channel of pixel (0, 0): red 0 means no
    /// face, anything else is one face whose embedding encodes that value.
    pub struct FakeDetector {
        calls: Arc<AtomicUsize>,
    }

    impl FaceDetector for FakeDetector {
        fn detect(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let red = img.get_pixel(0, 0).0[0];
            if red == 0 {
                return Ok(Vec::new());
            }
            Ok(vec![DetectedFace {
                bbox: BoundingBox::new(0.0, 0.0, 4.0, 4.0),
                embedding: vec![1.0, red as f32 / 255.0, 0.0],
                confidence: 0.99,
            }])
        }
    }

    pub struct FakeFactory {
        pub calls: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl FakeFactory {
        pub fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        pub fn detections(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DetectorFactory for FakeFactory {
        fn create(&self) -> Result<Box<dyn FaceDetector>> {
            if self.fail {
                return Err(anyhow!("model file is corrupt"));
            }
            Ok(Box::new(FakeDetector {
                calls: self.calls.clone(),
            }))
        }
    }

    /// Write an 8x8 PNG whose pixels all have red channel `red`.
    pub fn write_photo(path: &Path, red: u8) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        RgbImage::from_pixel(8, 8, Rgb([red, 0, 0])).save(path).unwrap();
    }
}

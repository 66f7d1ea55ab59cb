//! Starts scan and clustering workers and chains them.

use std::sync::Arc;
use std::time::Duration;

use super::{report, report_warning, BackgroundTaskManager, StatusSink, TaskTicket, TaskType};
use crate::config::ConfigProvider;
use crate::db::{Database, EmbeddingStore};
use crate::error::{ClusterError, ScanError};
use crate::faces::{ClusterEngine, ClusterParams, DetectorFactory};
use crate::scanner::{ScanOutcome, ScanPipeline};

const IDLE_POLL: Duration = Duration::from_millis(100);

struct Shared {
    db: Arc<Database>,
    store: Arc<EmbeddingStore>,
    config: Arc<dyn ConfigProvider>,
    sink: Arc<dyn StatusSink>,
    detectors: Arc<dyn DetectorFactory>,
    tasks: BackgroundTaskManager,
}

/// Entry point for the UI: start, recalibrate and cancel background work.
///
/// A finished scan starts clustering when photos were added or removed,
/// when no clustering exists yet, or when the active epoch is missing faces
/// committed by an earlier scan that was cancelled or failed; otherwise the
/// existing epoch is announced as current.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(
        db: Arc<Database>,
        store: Arc<EmbeddingStore>,
        config: Arc<dyn ConfigProvider>,
        sink: Arc<dyn StatusSink>,
        detectors: Arc<dyn DetectorFactory>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                db,
                store,
                config,
                sink,
                detectors,
                tasks: BackgroundTaskManager::new(),
            }),
        }
    }

    pub fn tasks(&self) -> &BackgroundTaskManager {
        &self.shared.tasks
    }

    /// Start a scan worker. Returns `false` if one is already running.
    pub fn start_scan(&self) -> bool {
        let Some(ticket) = self.shared.tasks.register(TaskType::Scan) else {
            tracing::debug!("Scan already running");
            return false;
        };

        let coordinator = self.clone();
        std::thread::spawn(move || coordinator.scan_worker(ticket));
        true
    }

    /// Start a clustering worker at the configured threshold. Returns
    /// `false` if one is already running.
    pub fn start_cluster(&self) -> bool {
        let Some(ticket) = self.shared.tasks.register(TaskType::Cluster) else {
            tracing::debug!("Clustering already running");
            return false;
        };

        let coordinator = self.clone();
        std::thread::spawn(move || coordinator.cluster_worker(ticket));
        true
    }

    /// Persist a new threshold and re-cluster with it.
    pub fn recalibrate(&self, threshold_percent: u32) -> bool {
        let threshold_percent = threshold_percent.min(100);
        if let Err(e) = self.shared.config.set_similarity_threshold(threshold_percent) {
            report_warning(
                self.shared.sink.as_ref(),
                format!("Failed to save threshold: {:#}", e),
            );
        }
        self.start_cluster()
    }

    pub fn cancel(&self, task_type: TaskType) -> bool {
        self.shared.tasks.cancel(task_type)
    }

    pub fn cancel_all(&self) {
        self.shared.tasks.cancel_all();
    }

    /// Block until no worker is running. A scan hands over to clustering
    /// before releasing its slot, so the chain is awaited as a whole.
    pub fn wait_idle(&self) {
        while self.shared.tasks.has_running_tasks() {
            std::thread::sleep(IDLE_POLL);
        }
    }

    fn scan_worker(&self, ticket: TaskTicket) {
        let shared = &self.shared;
        let sink = shared.sink.as_ref();
        let pipeline = ScanPipeline::new(
            shared.db.clone(),
            shared.store.clone(),
            shared.config.clone(),
            shared.detectors.clone(),
        );

        tracing::info!(task = ?ticket.id(), "Scan started");
        match pipeline.run(sink, ticket.cancel_flag()) {
            Ok(outcome) => {
                if let Err(e) = self.scan_complete(&outcome) {
                    report_warning(sink, format!("Error: {:#}", e));
                }
            }
            Err(ScanError::Cancelled) => report(sink, "Scan cancelled"),
            Err(ScanError::ModelInit(e)) => {
                report_warning(sink, format!("Error loading model: {:#}", e))
            }
            Err(e) => report_warning(sink, format!("Scan failed: {}", e)),
        }

        drop(ticket);
    }

    fn scan_complete(&self, outcome: &ScanOutcome) -> anyhow::Result<()> {
        let shared = &self.shared;
        let sink = shared.sink.as_ref();

        report(
            sink,
            format!(
                "Scan complete: {} faces in {} photos",
                shared.db.count_faces()?,
                shared.db.count_photos()?
            ),
        );
        let pending = shared.db.count_pending_photos()?;
        if pending > 0 {
            report_warning(
                sink,
                format!("Warning: {} photos had errors and were skipped", pending),
            );
        }
        sink.on_scan_complete();

        let active = shared.db.active_clustering()?;
        let unclustered = match &active {
            Some(clustering) => shared.db.count_unassigned_faces(clustering.clustering_id)?,
            None => 0,
        };
        if unclustered > 0 {
            report(sink, format!("Faces not yet clustered: {}", unclustered));
        }

        match active {
            Some(clustering) if !outcome.needs_clustering() && unclustered == 0 => {
                report(sink, "No new photos found, loading existing clustering");
                report(sink, format!("Using threshold: {}%", clustering.threshold));
                sink.on_cluster_complete();
            }
            _ => {
                report(sink, "Starting automatic recalibration...");
                self.start_cluster();
            }
        }
        Ok(())
    }

    fn cluster_worker(&self, ticket: TaskTicket) {
        let shared = &self.shared;
        let sink = shared.sink.as_ref();

        let config = shared.config.snapshot();
        let params = ClusterParams::from_config(
            &config.clustering,
            shared.config.similarity_threshold(),
        );
        let engine = ClusterEngine::new(shared.db.clone(), shared.store.clone());

        tracing::info!(task = ?ticket.id(), threshold = params.threshold_percent, "Clustering started");
        match engine.run(&params, sink, ticket.cancel_flag()) {
            Ok(_) => sink.on_cluster_complete(),
            Err(ClusterError::Cancelled) => {
                report(sink, "Clustering cancelled, previous results kept")
            }
            Err(e) => report_warning(sink, format!("Clustering failed: {}", e)),
        }

        drop(ticket);
    }
}

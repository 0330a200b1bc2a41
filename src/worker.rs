//! A scan worker analyzes one uploaded scan in the background and reports
//! progress and results to the `ScanManager`

use crate::analyzer::Analyzer;
use crate::error::{Error, Result};
use crate::manager::{ScanAnalysis, ScanManager};
use crate::uploads::StoredUpload;
use std::fs;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::*;

#[derive(Clone)]
pub struct ScanWorker {
    analyzer: Arc<Analyzer>,
    manager: Arc<RwLock<ScanManager>>,
}

impl ScanWorker {
    pub fn new(analyzer: Arc<Analyzer>, manager: Arc<RwLock<ScanManager>>) -> Self {
        ScanWorker { analyzer, manager }
    }

    /// Process the scan on the blocking thread pool
    pub fn dispatch(self, scan_id: String, upload: StoredUpload) -> JoinHandle<()> {
        info!("dispatching scan {scan_id}");
        tokio::task::spawn_blocking(move || self.run(&scan_id, &upload))
    }

    /// Process the scan on the current thread, recording the outcome. The
    /// stored file is removed afterwards
    #[tracing::instrument(skip(self, upload), fields(file = %upload.file_name))]
    pub fn run(&self, scan_id: &str, upload: &StoredUpload) {
        let outcome = self.process(scan_id, upload);
        upload.remove();

        let mut manager = self.manager();
        let recorded = match outcome {
            Ok(analysis) => manager.complete(scan_id, analysis),
            Err(e) => {
                error!("error processing scan {scan_id}: {e}");
                manager.fail(scan_id, e.to_string())
            }
        };
        if let Err(e) = recorded {
            warn!("could not record outcome of scan {scan_id}: {e}");
        }
    }

    fn process(&self, scan_id: &str, upload: &StoredUpload) -> Result<ScanAnalysis> {
        let start = Instant::now();
        let bytes = fs::read(&upload.path)?;
        self.set_progress(scan_id, 0.25);

        if upload.kind.is_volumetric() {
            upload.kind.check_header(&bytes)?;
            return Err(Error::NotImplemented(
                "volumetric analysis is not implemented".into(),
            ));
        }

        let prediction = self.analyzer.analyze(&bytes)?;
        Ok(ScanAnalysis {
            prediction,
            processing_time: start.elapsed().as_secs_f64(),
            file_type_processed: upload.kind.processed_as().to_string(),
        })
    }

    fn set_progress(&self, scan_id: &str, progress: f32) {
        if let Err(e) = self.manager().set_progress(scan_id, progress) {
            warn!("could not update progress of scan {scan_id}: {e}");
        }
    }

    /// A panic elsewhere must not stop scans from being recorded
    fn manager(&self) -> RwLockWriteGuard<'_, ScanManager> {
        self.manager.write().unwrap_or_else(PoisonError::into_inner)
    }
}

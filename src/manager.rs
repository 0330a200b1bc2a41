//! The scan manager keeps track of every uploaded scan: where it was stored,
//! how far processing has got, and the analysis once it is done

use crate::analyzer::Diagnosis;
use crate::config::MAX_SCAN_RECORDS;
use crate::error::{Error, Result};
use crate::uploads::StoredUpload;
use crate::util;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Opaque scan identifier
pub type ScanId = String;

/// The current status of a scan
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Uploaded, analysis not finished yet
    Processing,

    /// Analysis finished
    Completed,

    /// Analysis failed or is not available for this file type
    Failed,
}

/// What the worker produced for a scan
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScanAnalysis {
    pub prediction: Diagnosis,
    /// Seconds spent analyzing
    pub processing_time: f64,
    pub file_type_processed: String,
}

#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub id: ScanId,
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: usize,
    pub file_type: Option<String>,
    pub status: ScanStatus,
    pub progress: Option<f32>,
    pub error: Option<String>,
    pub analysis: Option<ScanAnalysis>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Bookkeeping for uploaded scans. Shared behind a `RwLock`
#[derive(Debug)]
pub struct ScanManager {
    scans: HashMap<ScanId, ScanRecord>,
    max_records: usize,
}

impl Default for ScanManager {
    fn default() -> Self {
        ScanManager::with_capacity(MAX_SCAN_RECORDS as usize)
    }
}

impl ScanManager {
    pub fn new() -> Self {
        ScanManager::default()
    }

    /// Keep at most `max_records` scans. Once full, registering a scan drops
    /// the oldest finished one. Scans still processing are never dropped
    pub fn with_capacity(max_records: usize) -> Self {
        ScanManager {
            scans: HashMap::new(),
            max_records: max_records.max(1),
        }
    }

    /// Record a freshly stored upload as `Processing`
    pub fn register(
        &mut self,
        upload: &StoredUpload,
        content_type: Option<String>,
    ) -> ScanRecord {
        self.evict();

        let mut id = util::random_hex(8);
        while self.scans.contains_key(&id) {
            id = util::random_hex(8);
        }

        let now = Utc::now();
        let record = ScanRecord {
            id: id.clone(),
            file_path: upload.path.clone(),
            file_name: upload.file_name.clone(),
            file_size: upload.size,
            file_type: content_type,
            status: ScanStatus::Processing,
            progress: Some(0.0),
            error: None,
            analysis: None,
            created_at: now,
            updated_at: now,
        };

        info!("registered scan {id} for {}", upload.file_name);
        self.scans.insert(id, record.clone());
        record
    }

    pub fn get(&self, id: &str) -> Result<&ScanRecord> {
        self.scans
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("scan {id} not found")))
    }

    pub fn set_progress(&mut self, id: &str, progress: f32) -> Result<()> {
        let scan = self.get_mut(id)?;
        scan.progress = Some(progress.clamp(0.0, 1.0));
        scan.updated_at = Utc::now();
        debug!("scan {id} progress {progress:.2}");
        Ok(())
    }

    pub fn complete(&mut self, id: &str, analysis: ScanAnalysis) -> Result<()> {
        let scan = self.get_mut(id)?;
        scan.status = ScanStatus::Completed;
        scan.progress = Some(1.0);
        scan.error = None;
        scan.analysis = Some(analysis);
        scan.updated_at = Utc::now();
        info!("scan {id} completed");
        Ok(())
    }

    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        warn!("scan {id} failed: {error}");
        let scan = self.get_mut(id)?;
        scan.status = ScanStatus::Failed;
        scan.error = Some(error);
        scan.updated_at = Utc::now();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    /// Drop the oldest finished records until there is room for one more
    fn evict(&mut self) {
        while self.scans.len() >= self.max_records {
            let oldest = self
                .scans
                .values()
                .filter(|scan| scan.status != ScanStatus::Processing)
                .min_by_key(|scan| scan.updated_at)
                .map(|scan| scan.id.clone());
            match oldest {
                Some(id) => {
                    debug!("dropping scan record {id}");
                    self.scans.remove(&id);
                }
                None => {
                    warn!("{} scans in flight, keeping them all", self.scans.len());
                    break;
                }
            }
        }
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut ScanRecord> {
        self.scans
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("scan {id} not found")))
    }
}

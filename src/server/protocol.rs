use crate::manager::{ScanAnalysis, ScanRecord, ScanStatus};
use actix_multipart::form::{bytes::Bytes, MultipartForm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// An uploaded file, with its contents encoded as base 64
#[derive(Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub image: String,
}

impl Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UploadRequest {{ file_name: {:?}, content_type: {:?}, image: <{} bytes of base64> }}",
            self.file_name,
            self.content_type,
            self.image.len()
        )
    }
}

/// A browser form upload: `multipart/form-data` with a single `file` part
#[derive(MultipartForm)]
pub struct UploadForm {
    pub file: Bytes,
}

impl UploadForm {
    /// File name, content type and contents of the `file` part
    pub fn into_parts(self) -> (String, Option<String>, Vec<u8>) {
        let file = self.file;
        (
            file.file_name.unwrap_or_default(),
            file.content_type.map(|mime| mime.to_string()),
            file.data.to_vec(),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct Message {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

/// Returned by the upload route
#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub message: String,
    pub file_path: String,
    pub status: ScanStatus,
    pub file_name: String,
    pub file_size: usize,
    pub file_type: Option<String>,
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl From<&ScanRecord> for ScanResponse {
    fn from(scan: &ScanRecord) -> Self {
        ScanResponse {
            message: "File uploaded successfully".into(),
            file_path: scan.file_path.display().to_string(),
            status: scan.status,
            file_name: scan.file_name.clone(),
            file_size: scan.file_size,
            file_type: scan.file_type.clone(),
            id: scan.id.clone(),
            created_at: scan.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProcessingStatus {
    pub status: ScanStatus,
    pub message: String,
    pub progress: Option<f32>,
    pub error: Option<String>,
}

impl From<&ScanRecord> for ProcessingStatus {
    fn from(scan: &ScanRecord) -> Self {
        let message = match scan.status {
            ScanStatus::Processing => "Scan is being processed",
            ScanStatus::Completed => "Scan processed successfully",
            ScanStatus::Failed => "Scan processing failed",
        };
        ProcessingStatus {
            status: scan.status,
            message: message.into(),
            progress: scan.progress,
            error: scan.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScanResults {
    pub scan_id: String,
    pub status: ScanStatus,
    pub progress: Option<f32>,
    pub error: Option<String>,
    pub results: Option<ScanAnalysis>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ScanRecord> for ScanResults {
    fn from(scan: &ScanRecord) -> Self {
        ScanResults {
            scan_id: scan.id.clone(),
            status: scan.status,
            progress: scan.progress,
            error: scan.error.clone(),
            results: scan.analysis.clone(),
            created_at: scan.created_at,
            updated_at: scan.updated_at,
        }
    }
}

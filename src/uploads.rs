//! Upload validation and storage

use crate::config::UploadSettings;
use crate::error::{Error, Result, INVALID_FILE_TYPE};
use crate::util;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Accepted upload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// `.jpg`, `.jpeg` or `.png`
    Raster,
    /// `.dcm`
    Dicom,
    /// `.nii`
    Nifti,
    /// `.nii.gz`
    NiftiGz,
}

impl FileKind {
    /// Classify by extension only. Contents are never looked at here
    pub fn from_file_name(name: &str) -> Result<Self> {
        let name = name.to_ascii_lowercase();
        let kind = if name.ends_with(".jpg") || name.ends_with(".jpeg") || name.ends_with(".png")
        {
            FileKind::Raster
        } else if name.ends_with(".dcm") {
            FileKind::Dicom
        } else if name.ends_with(".nii.gz") {
            FileKind::NiftiGz
        } else if name.ends_with(".nii") {
            FileKind::Nifti
        } else {
            return Err(Error::Validation(INVALID_FILE_TYPE.into()));
        };
        Ok(kind)
    }

    /// DICOM and NIfTI volumes. There is no model for these yet
    pub fn is_volumetric(self) -> bool {
        !matches!(self, FileKind::Raster)
    }

    /// Stored extension, lowercased, with the leading dot
    fn extension(self, name: &str) -> &'static str {
        match self {
            FileKind::Raster => {
                let name = name.to_ascii_lowercase();
                if name.ends_with(".png") {
                    ".png"
                } else if name.ends_with(".jpeg") {
                    ".jpeg"
                } else {
                    ".jpg"
                }
            }
            FileKind::Dicom => ".dcm",
            FileKind::Nifti => ".nii",
            FileKind::NiftiGz => ".nii.gz",
        }
    }

    /// Check the container header of a volumetric file
    pub fn check_header(self, bytes: &[u8]) -> Result<()> {
        let valid = match self {
            FileKind::Raster => true,
            // 128-byte preamble followed by the magic
            FileKind::Dicom => bytes.get(128..132) == Some(b"DICM".as_slice()),
            // sizeof_hdr is 348 for NIfTI-1 and 540 for NIfTI-2, in either byte order
            FileKind::Nifti => match bytes.get(0..4) {
                Some(&[a, b, c, d]) => {
                    let le = i32::from_le_bytes([a, b, c, d]);
                    let be = i32::from_be_bytes([a, b, c, d]);
                    [348, 540].contains(&le) || [348, 540].contains(&be)
                }
                _ => false,
            },
            FileKind::NiftiGz => bytes.starts_with(&[0x1f, 0x8b]),
        };

        if valid {
            Ok(())
        } else {
            Err(Error::Validation(format!("invalid {self:?} file")))
        }
    }

    /// The `file_type_processed` tag reported with results
    pub fn processed_as(self) -> &'static str {
        if self.is_volumetric() {
            "medical"
        } else {
            "standard_image"
        }
    }
}

/// A file written to the upload directory
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub path: PathBuf,
    pub file_name: String,
    pub size: usize,
    pub kind: FileKind,
}

impl StoredUpload {
    /// Delete the stored file once it has been analyzed. Failures are only logged
    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed upload {:?}", self.path),
            Err(e) => warn!("could not remove upload {:?}: {e}", self.path),
        }
    }
}

/// Writes validated uploads under a fixed directory
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    max_size: usize,
}

impl UploadStore {
    pub fn new(settings: &UploadSettings) -> Self {
        UploadStore {
            dir: settings.dir.clone(),
            max_size: settings.max_upload_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_size {
            return Err(Error::Validation(format!(
                "file of {size} bytes exceeds the {} byte upload limit",
                self.max_size
            )));
        }
        Ok(())
    }

    /// Save `bytes` under a random name that keeps the original extension
    pub fn save(&self, file_name: &str, bytes: &[u8]) -> Result<StoredUpload> {
        let kind = FileKind::from_file_name(file_name)?;
        self.check_size(bytes.len())?;

        let path = self
            .dir
            .join(format!("{}{}", util::random_hex(8), kind.extension(file_name)));

        fs::create_dir_all(&self.dir)
            .and_then(|_| fs::write(&path, bytes))
            .map_err(|e| {
                error!("error saving {file_name} to {path:?}: {e}");
                e
            })?;
        info!("saved upload {file_name} to {path:?}");

        Ok(StoredUpload {
            path,
            file_name: file_name.to_string(),
            size: bytes.len(),
            kind,
        })
    }
}

//! Image persistence on a local directory (SD card mount or similar)

use std::io;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::EncodedFrame;
use crate::error::StorageError;

/// Persistence collaborator for finished captures
pub trait ImageStore: Send {
    /// Persist one JPEG. `hint` names the kind of capture; the store picks
    /// the final, unique filename and returns it.
    fn store(&mut self, frame: &EncodedFrame, hint: &str) -> Result<String, StorageError>;
}

/// How the identifier between prefix and extension is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Naming {
    /// Zero-padded counter resumed from the highest number on disk
    #[default]
    Sequence,
    /// Capture time, `%Y%m%d_%H%M%S`, in the store's UTC offset or the system zone
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub filename: String,
    pub size: u64,
}

/// Writes `<dir>/<prefix><identifier><extension>`
#[derive(Debug)]
pub struct DirectoryStore {
    dir: PathBuf,
    prefix: String,
    extension: String,
    naming: Naming,
    utc_offset: Option<FixedOffset>,
    next_index: u64,
}

const INDEX_WIDTH: usize = 4;
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

impl DirectoryStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: &str,
        extension: &str,
        naming: Naming,
    ) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let next_index = next_free_index(&dir, prefix, extension)?;
        info!(dir = %dir.display(), next_index, ?naming, "Image store ready");

        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            extension: extension.to_string(),
            naming,
            utc_offset: None,
            next_index,
        })
    }

    /// Stamp timestamp names in a fixed UTC offset instead of the system zone
    pub fn with_utc_offset(mut self, offset: Option<FixedOffset>) -> Self {
        self.utc_offset = offset;
        self
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Read-only view for listing and downloads
    pub fn catalog(&self) -> ImageCatalog {
        ImageCatalog {
            dir: self.dir.clone(),
            prefix: self.prefix.clone(),
            extension: self.extension.clone(),
        }
    }

    fn next_name(&mut self) -> String {
        match self.naming {
            Naming::Sequence => {
                let name = format!(
                    "{}{:0width$}{}",
                    self.prefix,
                    self.next_index,
                    self.extension,
                    width = INDEX_WIDTH
                );
                self.next_index = self.next_index.saturating_add(1);
                name
            }
            Naming::Timestamp => {
                let now = Utc::now();
                let stamp = match self.utc_offset {
                    Some(offset) => now.with_timezone(&offset).format(TIMESTAMP_FORMAT).to_string(),
                    None => now.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string(),
                };
                let mut name = format!("{}{}{}", self.prefix, stamp, self.extension);
                let mut n = 1;
                while self.dir.join(&name).exists() {
                    name = format!("{}{}_{}{}", self.prefix, stamp, n, self.extension);
                    n += 1;
                }
                name
            }
        }
    }
}

impl ImageStore for DirectoryStore {
    fn store(&mut self, frame: &EncodedFrame, hint: &str) -> Result<String, StorageError> {
        let name = self.next_name();
        let path = self.dir.join(&name);
        let partial = self.dir.join(format!("{name}.part"));

        std::fs::write(&partial, &frame.data)?;
        std::fs::rename(&partial, &path)?;

        info!(
            file = %name,
            bytes = frame.len(),
            sequence = frame.sequence,
            hint,
            "Image saved"
        );
        Ok(name)
    }
}

/// Read access to stored images
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    dir: PathBuf,
    prefix: String,
    extension: String,
}

impl ImageCatalog {
    /// Stored images sorted by name. Only `<prefix>*<extension>` files count.
    pub fn list(&self) -> Result<Vec<ImageInfo>, StorageError> {
        let mut images = Vec::new();

        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if filename.starts_with(&self.prefix) && filename.ends_with(&self.extension) {
                images.push(ImageInfo {
                    filename,
                    size: meta.len(),
                });
            }
        }

        images.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(images)
    }

    /// Read one image back. Only plain file names ending in the image
    /// extension are accepted.
    pub fn read(&self, filename: &str) -> Result<Vec<u8>, StorageError> {
        let filename = filename.trim_start_matches('/');
        if filename.is_empty()
            || filename.contains(&['/', '\\'][..])
            || filename.starts_with('.')
            || !filename.ends_with(&self.extension)
        {
            return Err(StorageError::InvalidName(filename.to_string()));
        }

        debug!(file = filename, "Reading stored image");
        std::fs::read(self.dir.join(filename)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(filename.to_string()),
            _ => StorageError::Io(e),
        })
    }
}

fn next_free_index(dir: &Path, prefix: &str, extension: &str) -> Result<u64, StorageError> {
    let mut next = 0;

    for entry in std::fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let index = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(extension))
            .and_then(|digits| digits.parse::<u64>().ok());
        if let Some(index) = index {
            next = next.max(index.saturating_add(1));
        }
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumes_after_highest_index() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["plant_0003.jpg", "plant_12.jpg", "other_99.jpg", "plant_x.jpg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(next_free_index(dir.path(), "plant_", ".jpg").unwrap(), 13);
    }

    #[test]
    fn highest_possible_index_does_not_overflow() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plant_18446744073709551615.jpg"), b"x").unwrap();
        assert_eq!(
            next_free_index(dir.path(), "plant_", ".jpg").unwrap(),
            u64::MAX
        );
    }

    #[test]
    fn empty_dir_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_free_index(dir.path(), "plant_", ".jpg").unwrap(), 0);
    }
}

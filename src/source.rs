//! Disk file source — owns the cache's data files.
//!
//! The source manages `N` files of identical length, striped round-robin
//! across one or more folders: global file id `i` lives in folder `i mod F`
//! under the name `floor(i / F)` formatted as four zero-padded digits plus
//! `.bin` (always eight characters). A scan recognizes exactly that scheme;
//! files with a matching name but the wrong length are deleted, anything
//! else in the folders is left alone.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addr::{BLOCK_ALIGN, MAX_FILE_COUNT, MAX_FILE_SIZE};
use crate::mem::FileMemory;

/// Fewest files a source may hold: two writer slots plus one read slot.
pub const MIN_FILE_COUNT: u32 = 3;

// ── Configuration ────────────────────────────────────────────────────────────

/// Where and how large the data files are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Folders the files are striped over, in stripe order.
    pub folders:          Vec<PathBuf>,
    /// Files created in each folder; total = `folders.len() × files_per_folder`.
    pub files_per_folder: u32,
    /// Exact length of every file in bytes.
    pub file_size:        u64,
}

impl SourceConfig {
    /// Single-folder convenience constructor.
    pub fn single<P: AsRef<Path>>(folder: P, files: u32, file_size: u64) -> Self {
        Self {
            folders:          vec![folder.as_ref().to_owned()],
            files_per_folder: files,
            file_size,
        }
    }

    pub fn file_count(&self) -> u32 {
        self.folders.len() as u32 * self.files_per_folder
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.folders.is_empty() {
            return Err(ConfigError::NoFolders);
        }
        let count = self.file_count();
        if count < MIN_FILE_COUNT {
            return Err(ConfigError::TooFewFiles { count });
        }
        if count > MAX_FILE_COUNT {
            return Err(ConfigError::TooManyFiles { count });
        }
        if self.file_size < BLOCK_ALIGN as u64 || self.file_size > MAX_FILE_SIZE {
            return Err(ConfigError::FileSizeOutOfRange { file_size: self.file_size });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one folder is required")]
    NoFolders,
    #[error("{count} files configured; at least {MIN_FILE_COUNT} are required")]
    TooFewFiles { count: u32 },
    #[error("{count} files configured; at most {MAX_FILE_COUNT} are supported")]
    TooManyFiles { count: u32 },
    #[error("file size {file_size} outside [{}, {MAX_FILE_SIZE}]", BLOCK_ALIGN)]
    FileSizeOutOfRange { file_size: u64 },
}

// ── File source ──────────────────────────────────────────────────────────────

pub struct FileSource {
    folders:   Vec<PathBuf>,
    file_count: usize,
    file_size: u64,
}

impl FileSource {
    /// Validate the configuration and create any missing folders.
    pub fn open(config: SourceConfig) -> Result<Self, SourceError> {
        config.validate()?;
        for folder in &config.folders {
            fs::create_dir_all(folder)?;
        }
        Ok(Self {
            file_count: config.file_count() as usize,
            folders:    config.folders,
            file_size:  config.file_size,
        })
    }

    #[inline]
    pub fn file_count(&self) -> usize {
        self.file_count
    }

    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    fn path_of(&self, id: usize) -> PathBuf {
        let folder = id % self.folders.len();
        let number = id / self.folders.len();
        self.folders[folder].join(format!("{number:04}.bin"))
    }

    /// Walk every folder for files matching the naming scheme.
    ///
    /// Returns the mapped survivors sorted by global id. Files with a valid
    /// name but the wrong length, and files whose id falls outside the
    /// configured count, are deleted.
    pub fn scan_existing_files(&self) -> io::Result<Vec<(usize, FileMemory)>> {
        let mut found = Vec::new();
        for (folder_idx, folder) in self.folders.iter().enumerate() {
            for entry in fs::read_dir(folder)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let Some(number) = parse_file_name(&entry.file_name()) else {
                    continue;
                };
                let id = number * self.folders.len() + folder_idx;
                let path = entry.path();
                let len = entry.metadata()?.len();
                if id >= self.file_count || len != self.file_size {
                    warn!(
                        "deleting {} (id {id}, {len} bytes): outside the configured set",
                        path.display()
                    );
                    fs::remove_file(&path)?;
                    continue;
                }
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                found.push((id, FileMemory::map(&file)?));
            }
        }
        found.sort_by_key(|(id, _)| *id);
        debug!("scan found {} existing files", found.len());
        Ok(found)
    }

    /// Delete file `id` if present and create it anew, zero-filled at the
    /// configured length.
    pub fn delete_and_create(&self, id: usize) -> io::Result<FileMemory> {
        assert!(id < self.file_count);
        let path = self.path_of(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(self.file_size)?;
        FileMemory::map(&file)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Accept exactly `NNNN.bin`: eight characters, four digits, `.bin`.
fn parse_file_name(name: &std::ffi::OsStr) -> Option<usize> {
    let name = name.to_str()?;
    if name.len() != 8 || !name.ends_with(".bin") {
        return None;
    }
    let digits = &name[..4];
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

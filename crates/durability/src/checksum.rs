//! Per-file checksums of a snapshot directory
//!
//! Every committed snapshot has a sibling checksum file in an SFV-like text
//! format that can be audited by hand (or with `cksfv`):
//!
//! ```text
//! ; This is an SFV checksum file for all files in the given directory.
//! ; This is an automatically created file - please do NOT modify.
//! ; number of files used for combined value = 2
//! ; combinedValue = 000000003c2a8e11
//! ; snapshot directory = /data/partition-1/snapshots/00000000000000000042-3-120-118-0
//! file1   9a71bb4c
//! snapshot.metadata   0b5c42f7
//! ```
//!
//! Checksums are CRC32C. Files are read in fixed-size blocks so that large
//! state files do not have to fit in memory.
//!
//! Values are always written as eight hex digits. On read, a value longer
//! than eight characters can only be decimal and is parsed as such.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use snapstore_core::{Result, SnapshotError};

use crate::files::write_atomically;

/// Default block size used when reading files for checksumming
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

const DIRECTORY_COMMENT: &str = "; snapshot directory = ";

/// Source of pre-computed per-file checksums.
///
/// Lets a lower storage layer that already tracks file checksums supply them
/// instead of having the store re-read every file.
pub trait ChecksumProvider: Send + Sync {
    /// Checksums of the files in the snapshot at `snapshot_path`, keyed by
    /// file name. `None` if the provider knows nothing about that path.
    fn snapshot_checksums(&self, snapshot_path: &Path) -> Option<BTreeMap<String, u32>>;
}

/// File name → CRC32C table for one snapshot directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumSet {
    checksums: BTreeMap<String, u32>,
    snapshot_directory: Option<String>,
}

impl ChecksumSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum every regular file directly inside `dir`
    pub fn calculate(dir: &Path) -> Result<Self> {
        Self::calculate_with_provider(dir, None, DEFAULT_BLOCK_SIZE)
    }

    /// Checksum every regular file directly inside `dir`.
    ///
    /// Values supplied by `provider` for this directory are used verbatim;
    /// files the provider does not cover are read and checksummed.
    pub fn calculate_with_provider(
        dir: &Path,
        provider: Option<&dyn ChecksumProvider>,
        block_size: usize,
    ) -> Result<Self> {
        let provided = provider
            .and_then(|p| p.snapshot_checksums(dir))
            .unwrap_or_default();

        let mut set = ChecksumSet::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = file_name_of(&entry.path())?;
            let checksum = match provided.get(&name) {
                Some(checksum) => *checksum,
                None => file_checksum(&entry.path(), block_size)?,
            };
            set.checksums.insert(name, checksum);
        }
        set.snapshot_directory = Some(dir.display().to_string());
        Ok(set)
    }

    /// Add or overwrite the checksum of a single file
    pub fn update_from_file(&mut self, path: &Path) -> Result<()> {
        let name = file_name_of(path)?;
        let checksum = file_checksum(path, DEFAULT_BLOCK_SIZE)?;
        self.checksums.insert(name, checksum);
        Ok(())
    }

    /// Record a known checksum
    pub fn insert(&mut self, name: impl Into<String>, checksum: u32) {
        self.checksums.insert(name.into(), checksum);
    }

    /// Checksum of one file
    pub fn get(&self, name: &str) -> Option<u32> {
        self.checksums.get(name).copied()
    }

    /// Number of files in the set
    pub fn len(&self) -> usize {
        self.checksums.len()
    }

    /// True if no file is recorded
    pub fn is_empty(&self) -> bool {
        self.checksums.is_empty()
    }

    /// Entries in file name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.checksums.iter().map(|(name, crc)| (name.as_str(), *crc))
    }

    /// Directory the set was computed over, if recorded
    pub fn snapshot_directory(&self) -> Option<&str> {
        self.snapshot_directory.as_deref()
    }

    /// Record the directory the set describes
    pub fn set_snapshot_directory(&mut self, dir: &Path) {
        self.snapshot_directory = Some(dir.display().to_string());
    }

    /// Single checksum covering every (file name, checksum) pair
    pub fn combined_checksum(&self) -> u64 {
        let mut crc = 0u32;
        for (name, checksum) in &self.checksums {
            crc = crc32c::crc32c_append(crc, name.as_bytes());
            crc = crc32c::crc32c_append(crc, &checksum.to_be_bytes());
        }
        u64::from(crc)
    }

    /// True if both sets hold identical (file name, checksum) pairs.
    ///
    /// The directory comment is ignored.
    pub fn same_checksums(&self, other: &ChecksumSet) -> bool {
        self.checksums == other.checksums
    }

    /// Serialize to the SFV text format
    pub fn to_sfv(&self) -> String {
        let mut out = String::new();
        out.push_str("; This is an SFV checksum file for all files in the given directory.\n");
        out.push_str("; This is an automatically created file - please do NOT modify.\n");
        out.push_str(&format!(
            "; number of files used for combined value = {}\n",
            self.checksums.len()
        ));
        out.push_str(&format!(
            "; combinedValue = {:016x}\n",
            self.combined_checksum()
        ));
        if let Some(dir) = &self.snapshot_directory {
            out.push_str(DIRECTORY_COMMENT);
            out.push_str(dir);
            out.push('\n');
        }
        for (name, checksum) in &self.checksums {
            out.push_str(&format!("{}   {:08x}\n", name, checksum));
        }
        out
    }

    /// Parse the SFV text format. `path` is only used in error messages.
    ///
    /// Checksums of up to eight characters are hex, longer ones decimal.
    pub fn from_sfv(text: &str, path: &Path) -> Result<Self> {
        let mut set = ChecksumSet::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if let Some(dir) = line.strip_prefix(DIRECTORY_COMMENT) {
                set.snapshot_directory = Some(dir.to_string());
                continue;
            }
            if line.starts_with(';') {
                continue;
            }

            let malformed = |reason: &str| SnapshotError::ChecksumFormat {
                path: path.to_path_buf(),
                line: number + 1,
                reason: reason.to_string(),
            };
            let (name, value) = line
                .rsplit_once(char::is_whitespace)
                .ok_or_else(|| malformed("expected '<file name> <checksum>'"))?;
            let name = name.trim_end();
            if name.is_empty() {
                return Err(malformed("empty file name"));
            }
            let checksum = if value.len() <= 8 {
                u32::from_str_radix(value, 16)
            } else {
                value.parse::<u32>()
            }
            .map_err(|_| malformed("invalid checksum value"))?;
            set.checksums.insert(name.to_string(), checksum);
        }
        Ok(set)
    }

    /// Durably write the set to `checksum_path`
    pub fn persist(&self, checksum_path: &Path) -> Result<()> {
        write_atomically(checksum_path, self.to_sfv().as_bytes())?;
        Ok(())
    }

    /// Read a set previously written with [`ChecksumSet::persist`]
    pub fn read(checksum_path: &Path) -> Result<Self> {
        let text = fs::read_to_string(checksum_path)?;
        Self::from_sfv(&text, checksum_path)
    }
}

/// CRC32C of a file, read `block_size` bytes at a time
pub fn file_checksum(path: &Path, block_size: usize) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; block_size.max(1)];
    let mut crc = 0u32;
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            return Ok(crc);
        }
        crc = crc32c::crc32c_append(crc, &buffer[..read]);
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            SnapshotError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file name of {} is not valid UTF-8", path.display()),
            ))
        })
}

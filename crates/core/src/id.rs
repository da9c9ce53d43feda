//! Snapshot identifiers
//!
//! A snapshot is named after the log position it captures. The textual form is
//! used verbatim as the snapshot directory name:
//!
//! ```text
//! index-term-processedPosition-exportedPosition-ordinal[-checksum]
//! 00000000000000000042-3-120-118-0
//! 00000000000000000042-3-120-118-0-00000000cafebabe
//! ```
//!
//! The index is zero-padded so that lexicographic ordering of directory names
//! follows numeric ordering of the index. Positions are signed; a negative
//! position is written with its sign, which shows up as an empty field when
//! the text is split on `-` (`1-0--1-0-0`).

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Width the index is zero-padded to when encoded.
const INDEX_WIDTH: usize = 20;

/// Number of mandatory numeric fields.
const MANDATORY_FIELDS: usize = 5;

/// Identity of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    index: u64,
    term: u64,
    processed_position: i64,
    exported_position: i64,
    auxiliary_ordinal: u32,
    checksum: Option<u64>,
}

impl SnapshotId {
    /// Create an id without a combined checksum
    pub fn new(
        index: u64,
        term: u64,
        processed_position: i64,
        exported_position: i64,
        auxiliary_ordinal: u32,
    ) -> Self {
        SnapshotId {
            index,
            term,
            processed_position,
            exported_position,
            auxiliary_ordinal,
            checksum: None,
        }
    }

    /// Parse the textual form of an id
    pub fn parse(text: &str) -> Result<Self, IdFormatError> {
        let fields = split_fields(text)?;
        if fields.len() < MANDATORY_FIELDS {
            return Err(IdFormatError::TooFewFields {
                text: text.to_string(),
                found: fields.len(),
            });
        }
        if fields.len() > MANDATORY_FIELDS + 1 {
            return Err(IdFormatError::TooManyFields {
                text: text.to_string(),
                found: fields.len(),
            });
        }

        let index = unsigned(text, "index", &fields[0])?;
        let term = unsigned(text, "term", &fields[1])?;
        let processed_position = signed(text, "processedPosition", &fields[2])?;
        let exported_position = signed(text, "exportedPosition", &fields[3])?;
        let auxiliary_ordinal = u32::try_from(unsigned(text, "ordinal", &fields[4])?)
            .map_err(|_| IdFormatError::InvalidField {
                text: text.to_string(),
                field: "ordinal",
            })?;

        let checksum = match fields.get(5) {
            Some(field) => {
                if field.negative {
                    return Err(IdFormatError::InvalidField {
                        text: text.to_string(),
                        field: "checksum",
                    });
                }
                Some(u64::from_str_radix(field.digits, 16).map_err(|_| {
                    IdFormatError::InvalidField {
                        text: text.to_string(),
                        field: "checksum",
                    }
                })?)
            }
            None => None,
        };

        Ok(SnapshotId {
            index,
            term,
            processed_position,
            exported_position,
            auxiliary_ordinal,
            checksum,
        })
    }

    /// Extract the id from a snapshot directory (or checksum file stem).
    ///
    /// Returns `None` for names that are not snapshot ids.
    pub fn of_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        SnapshotId::parse(name).ok()
    }

    /// Encode to the textual form. Inverse of [`SnapshotId::parse`].
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Log index covered by the snapshot
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Term of the entry at `index`
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Last position processed by the state machine
    pub fn processed_position(&self) -> i64 {
        self.processed_position
    }

    /// Last position acknowledged by exporters
    pub fn exported_position(&self) -> i64 {
        self.exported_position
    }

    /// Opaque fifth component, preserved verbatim
    pub fn auxiliary_ordinal(&self) -> u32 {
        self.auxiliary_ordinal
    }

    /// Combined checksum suffix, if present
    pub fn checksum(&self) -> Option<u64> {
        self.checksum
    }

    /// Same id carrying the given combined checksum
    pub fn with_checksum(mut self, checksum: u64) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// Same id without a checksum suffix
    pub fn without_checksum(mut self) -> Self {
        self.checksum = None;
        self
    }

    /// True if both ids name the same log position, ignoring the checksum.
    pub fn same_position(&self, other: &SnapshotId) -> bool {
        self.without_checksum() == other.without_checksum()
    }
}

impl Ord for SnapshotId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index
            .cmp(&other.index)
            .then(self.term.cmp(&other.term))
            .then(self.processed_position.cmp(&other.processed_position))
            .then(self.exported_position.cmp(&other.exported_position))
            .then(self.auxiliary_ordinal.cmp(&other.auxiliary_ordinal))
            .then(self.checksum.cmp(&other.checksum))
    }
}

impl PartialOrd for SnapshotId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:0width$}-{}-{}-{}-{}",
            self.index,
            self.term,
            self.processed_position,
            self.exported_position,
            self.auxiliary_ordinal,
            width = INDEX_WIDTH
        )?;
        if let Some(checksum) = self.checksum {
            write!(f, "-{:016x}", checksum)?;
        }
        Ok(())
    }
}

impl FromStr for SnapshotId {
    type Err = IdFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SnapshotId::parse(s)
    }
}

/// Errors raised while parsing a snapshot id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdFormatError {
    /// Fewer than five numeric fields
    #[error("expected at least 5 fields in snapshot id '{text}', found {found}")]
    TooFewFields {
        /// Offending text
        text: String,
        /// Number of fields found
        found: usize,
    },

    /// More than six fields
    #[error("expected at most 6 fields in snapshot id '{text}', found {found}")]
    TooManyFields {
        /// Offending text
        text: String,
        /// Number of fields found
        found: usize,
    },

    /// A field is not a valid number for its position
    #[error("invalid {field} in snapshot id '{text}'")]
    InvalidField {
        /// Offending text
        text: String,
        /// Name of the field that failed to parse
        field: &'static str,
    },
}

struct Field<'a> {
    negative: bool,
    digits: &'a str,
}

fn split_fields(text: &str) -> Result<Vec<Field<'_>>, IdFormatError> {
    let mut fields = Vec::with_capacity(MANDATORY_FIELDS + 1);
    let mut negative = false;
    for part in text.split('-') {
        if part.is_empty() {
            // a second empty part in a row (`--` followed by `-`) is never valid
            if negative {
                return Err(IdFormatError::InvalidField {
                    text: text.to_string(),
                    field: "sign",
                });
            }
            negative = true;
            continue;
        }
        if !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdFormatError::InvalidField {
                text: text.to_string(),
                field: "digits",
            });
        }
        fields.push(Field {
            negative,
            digits: part,
        });
        negative = false;
    }
    if negative {
        return Err(IdFormatError::InvalidField {
            text: text.to_string(),
            field: "sign",
        });
    }
    Ok(fields)
}

fn unsigned(text: &str, name: &'static str, field: &Field<'_>) -> Result<u64, IdFormatError> {
    if field.negative {
        return Err(IdFormatError::InvalidField {
            text: text.to_string(),
            field: name,
        });
    }
    field.digits.parse::<u64>().map_err(|_| IdFormatError::InvalidField {
        text: text.to_string(),
        field: name,
    })
}

fn signed(text: &str, name: &'static str, field: &Field<'_>) -> Result<i64, IdFormatError> {
    let invalid = || IdFormatError::InvalidField {
        text: text.to_string(),
        field: name,
    };
    let magnitude = field.digits.parse::<u64>().map_err(|_| invalid())?;
    if field.negative {
        // i64::MIN has no positive counterpart, so negate in i128
        i64::try_from(-(magnitude as i128)).map_err(|_| invalid())
    } else {
        i64::try_from(magnitude).map_err(|_| invalid())
    }
}

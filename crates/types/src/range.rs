use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MIB;

/// Smallest chunk size a plan may use.
///
/// Storage-side copy parts other than the last must be at least this large,
/// so a plan with smaller parts could never be merged.
pub const MIN_CHUNK_SIZE: u64 = 5 * MIB;

/// Errors produced while building byte ranges and part plans.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("chunk size {chunk_size} is below the {MIN_CHUNK_SIZE} byte minimum")]
    ChunkTooSmall { chunk_size: u64 },

    #[error("part range {first}..={last} is outside the plan (1..={count})")]
    OutOfRange { first: u32, last: u32, count: u32 },
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Creates a range, rejecting empty or inverted bounds.
    pub fn new(start: u64, end: u64) -> Result<Self, PlanError> {
        if end <= start {
            return Err(PlanError::InvalidArgument(format!(
                "byte range end {end} must be greater than start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always false for a range built through [`ByteRange::new`].
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Value for an HTTP `Range` request header (inclusive end).
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A single part of a plan: 1-based number plus its byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    pub range: ByteRange,
}

impl PartInfo {
    /// Size of the part in bytes.
    pub fn len(&self) -> u64 {
        self.range.len()
    }

    /// Always false for parts produced by [`split`].
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Splits `[0, total_size)` into parts of `target_chunk_size` bytes.
///
/// Every part but the last is exactly `target_chunk_size` long; the last
/// takes the remainder. The output depends only on the two inputs.
pub fn split(total_size: u64, target_chunk_size: u64) -> Result<Vec<PartInfo>, PlanError> {
    if total_size == 0 {
        return Err(PlanError::InvalidArgument("total size is zero".into()));
    }
    if target_chunk_size == 0 {
        return Err(PlanError::InvalidArgument("chunk size is zero".into()));
    }

    let count = total_size.div_ceil(target_chunk_size);
    if count > u64::from(u32::MAX) {
        return Err(PlanError::InvalidArgument(format!(
            "{count} parts exceed the part number space"
        )));
    }

    let mut parts = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for index in 0..count {
        let end = (start + target_chunk_size).min(total_size);
        parts.push(PartInfo {
            part_number: index as u32 + 1,
            range: ByteRange { start, end },
        });
        start = end;
    }
    Ok(parts)
}

/// The full partition of a source used by one upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    total_size: u64,
    chunk_size: u64,
    parts: Vec<PartInfo>,
}

impl PartPlan {
    /// Builds a plan, enforcing the [`MIN_CHUNK_SIZE`] floor.
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, PlanError> {
        if chunk_size != 0 && chunk_size < MIN_CHUNK_SIZE {
            return Err(PlanError::ChunkTooSmall { chunk_size });
        }
        let parts = split(total_size, chunk_size)?;
        Ok(Self {
            total_size,
            chunk_size,
            parts,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn parts(&self) -> &[PartInfo] {
        &self.parts
    }

    /// Number of parts in the plan.
    pub fn len(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Looks up a part by its 1-based number.
    pub fn get(&self, part_number: u32) -> Option<&PartInfo> {
        part_number
            .checked_sub(1)
            .and_then(|i| self.parts.get(i as usize))
    }

    /// Parts `first..=last` (1-based, inclusive).
    pub fn select(&self, first: u32, last: u32) -> Result<&[PartInfo], PlanError> {
        let count = self.len();
        if first == 0 || first > last || last > count {
            return Err(PlanError::OutOfRange { first, last, count });
        }
        Ok(&self.parts[(first - 1) as usize..last as usize])
    }
}

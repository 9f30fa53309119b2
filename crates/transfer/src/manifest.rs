//! The `info.json` descriptor written into every parts directory.
//!
//! It records the partition plan and the source identity. The merge phase
//! reads it back and, together with a listing of the part objects, decides
//! whether the transfer is complete without touching the source again.

use std::collections::BTreeSet;

use bigcopy_fetch::SourceInfo;
use bigcopy_store::{ObjectMeta, ObjectStore};
use bigcopy_types::{
    ObjectPath, PartInfo, PartPlan, PartsDir, RetryPolicy, format_size, parse_part_name,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::TransferError;
use crate::retry::with_retry;

/// Parts-directory manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "src")]
    pub source: String,
    #[serde(rename = "src_modtime", default)]
    pub source_modified: Option<String>,
    #[serde(rename = "size")]
    pub total_size: u64,
    /// Human-readable chunk size, informational only.
    #[serde(rename = "chunksize", default)]
    pub chunk_size_label: String,
    #[serde(rename = "chunksize_int")]
    pub chunk_size: u64,
    /// First part number covered by this session (1-based, inclusive).
    pub first_part: u32,
    /// Last part number covered by this session (inclusive).
    pub last_part: u32,
    #[serde(default)]
    pub finalized: bool,
    #[serde(rename = "hash", default)]
    pub content_hash: Option<String>,
}

impl Manifest {
    /// Describes a session over `plan`, optionally restricted to a part range.
    pub fn new(
        source: &SourceInfo,
        plan: &PartPlan,
        part_range: Option<(u32, u32)>,
    ) -> Result<Self, TransferError> {
        let (first_part, last_part) = part_range.unwrap_or((1, plan.len()));
        plan.select(first_part, last_part)?;
        Ok(Self {
            created_at: Utc::now(),
            source: source.identity.clone(),
            source_modified: source.modified.clone(),
            total_size: plan.total_size(),
            chunk_size_label: format_size(plan.chunk_size()),
            chunk_size: plan.chunk_size(),
            first_part,
            last_part,
            finalized: false,
            content_hash: None,
        })
    }

    /// Recomputes the full plan. Pure: same manifest, same plan.
    pub fn plan(&self) -> Result<PartPlan, TransferError> {
        Ok(PartPlan::new(self.total_size, self.chunk_size)?)
    }

    /// The parts this session covers.
    pub fn parts(&self) -> Result<Vec<PartInfo>, TransferError> {
        let plan = self.plan()?;
        Ok(plan.select(self.first_part, self.last_part)?.to_vec())
    }

    /// Size of the object a merge of this session produces.
    pub fn expected_size(&self) -> Result<u64, TransferError> {
        Ok(self.parts()?.iter().map(PartInfo::len).sum())
    }

    /// Hex sha256 of source identity, modification time, size and chunk size.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update(self.source_modified.as_deref().unwrap_or("").as_bytes());
        hasher.update(self.total_size.to_string().as_bytes());
        hasher.update(self.chunk_size.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Marks every part as transferred and stamps the integrity hash.
    pub fn finalize(&mut self) {
        self.finalized = true;
        self.content_hash = Some(self.compute_hash());
    }

    /// Fails if `source` no longer looks like the source this manifest was
    /// created for.
    pub fn check_source(&self, source: &SourceInfo) -> Result<(), TransferError> {
        if source.size != self.total_size {
            return Err(TransferError::SizeChangedDuringTransfer {
                expected: self.total_size,
                actual: source.size,
            });
        }
        if let (Some(recorded), Some(current)) = (&self.source_modified, &source.modified)
            && recorded != current
        {
            return Err(TransferError::SourceModified {
                recorded: recorded.clone(),
                current: current.clone(),
            });
        }
        Ok(())
    }

    /// Part numbers of this session that have no matching part object.
    ///
    /// A listed object only counts if its name parses to exactly the planned
    /// range and its size matches that range.
    pub fn remaining_part_numbers(&self, listing: &[ObjectMeta]) -> Result<Vec<u32>, TransferError> {
        let parts = self.parts()?;
        let present = matching_part_numbers(&parts, listing);
        Ok(parts
            .iter()
            .map(|p| p.part_number)
            .filter(|n| !present.contains(n))
            .collect())
    }

    /// Whether every part of the session is present in `listing`.
    pub fn is_transfer_complete(&self, listing: &[ObjectMeta]) -> bool {
        self.remaining_part_numbers(listing)
            .map(|r| r.is_empty())
            .unwrap_or(false)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, TransferError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, TransferError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Reads the manifest of `dir`, `None` if it has not been written.
    pub async fn read(
        store: &dyn ObjectStore,
        dir: &PartsDir,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>, TransferError> {
        let path = ObjectPath::new(dir.bucket(), dir.manifest_key());
        let data = with_retry(retry, cancel, "read manifest", |_| store.get_object(&path))
            .await
            .map_err(TransferError::from_retry)?;
        data.map(|d| Self::from_json(&d)).transpose()
    }

    /// Writes the manifest into `dir`, replacing any previous version.
    pub async fn write(
        &self,
        store: &dyn ObjectStore,
        dir: &PartsDir,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let path = ObjectPath::new(dir.bucket(), dir.manifest_key());
        let body = Bytes::from(self.to_json()?);
        with_retry(retry, cancel, "write manifest", |_| {
            store.put_object(&path, body.clone())
        })
        .await
        .map_err(TransferError::from_retry)?;
        Ok(())
    }
}

fn matching_part_numbers(parts: &[PartInfo], listing: &[ObjectMeta]) -> BTreeSet<u32> {
    let mut present = BTreeSet::new();
    for meta in listing {
        let Some(found) = parse_part_name(&meta.key) else {
            continue;
        };
        let planned = parts.iter().find(|p| p.part_number == found.part_number);
        match planned {
            Some(p) if *p == found && meta.size == p.len() => {
                present.insert(found.part_number);
            }
            Some(p) => warn!(
                key = %meta.key,
                planned = %p.range,
                size = meta.size,
                "part object does not match plan"
            ),
            None => {}
        }
    }
    present
}

/// Lists the part objects (names starting with `part.`) in `dir`.
pub async fn list_part_objects(
    store: &dyn ObjectStore,
    dir: &PartsDir,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<ObjectMeta>, TransferError> {
    let prefix = dir.list_prefix();
    let listing = with_retry(retry, cancel, "list parts", |_| {
        store.list_objects(dir.bucket(), &prefix)
    })
    .await
    .map_err(TransferError::from_retry)?;

    let mut parts = Vec::with_capacity(listing.len());
    for meta in listing {
        let name = meta.key.rsplit('/').next().unwrap_or(&meta.key);
        if !name.starts_with("part.") {
            continue;
        }
        if parse_part_name(name).is_none() {
            warn!(key = %meta.key, "ignoring unparseable part object");
            continue;
        }
        parts.push(meta);
    }
    Ok(parts)
}

/// Deletes every object in `dir` and returns how many were removed.
///
/// Part objects go first, then `merge.json`, and `info.json` last: as long
/// as any part object is left, the manifest that names it is still there.
pub async fn remove_parts_dir(
    store: &dyn ObjectStore,
    dir: &PartsDir,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<usize, TransferError> {
    let prefix = dir.list_prefix();
    let mut listing = with_retry(retry, cancel, "list parts directory", |_| {
        store.list_objects(dir.bucket(), &prefix)
    })
    .await
    .map_err(TransferError::from_retry)?;

    sort_for_removal(dir, &mut listing);

    for meta in &listing {
        let path = ObjectPath::new(dir.bucket(), meta.key.clone());
        with_retry(retry, cancel, "delete part object", |_| {
            store.delete_object(&path)
        })
        .await
        .map_err(TransferError::from_retry)?;
    }
    Ok(listing.len())
}

fn sort_for_removal(dir: &PartsDir, listing: &mut [ObjectMeta]) {
    let manifest_key = dir.manifest_key();
    let state_key = dir.merge_state_key();
    listing.sort_by_key(|meta| {
        if meta.key == manifest_key {
            2
        } else if meta.key == state_key {
            1
        } else {
            0
        }
    });
}

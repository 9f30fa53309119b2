//! Object naming inside a parts directory.
//!
//! A destination `bucket/path/file.bin` is staged under
//! `bucket/path/file.bin-parts/`, which holds one object per part plus the
//! `info.json` manifest and the `merge.json` merge state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::range::{ByteRange, PartInfo};

/// Suffix appended to the destination key to form the parts directory.
pub const PARTS_SUFFIX: &str = "-parts";

/// File name of the manifest inside a parts directory.
pub const MANIFEST_NAME: &str = "info.json";

/// File name of the merge state inside a parts directory.
pub const MERGE_STATE_NAME: &str = "merge.json";

const PART_PREFIX: &str = "part.";

/// A bucket plus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPath {
    pub bucket: String,
    pub key: String,
}

impl ObjectPath {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// The staging directory that holds the standalone part objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartsDir {
    bucket: String,
    prefix: String,
}

impl PartsDir {
    /// Parts directory for a final destination object.
    pub fn for_destination(dst: &ObjectPath) -> Self {
        Self {
            bucket: dst.bucket.clone(),
            prefix: format!("{}{PARTS_SUFFIX}", dst.key.trim_end_matches('/')),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Directory key without trailing slash.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix to list the directory contents with.
    pub fn list_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// The final object the parts are merged into.
    pub fn destination(&self) -> ObjectPath {
        let key = self
            .prefix
            .strip_suffix(PARTS_SUFFIX)
            .unwrap_or(&self.prefix);
        ObjectPath::new(self.bucket.clone(), key)
    }

    pub fn manifest_key(&self) -> String {
        format!("{}/{MANIFEST_NAME}", self.prefix)
    }

    pub fn merge_state_key(&self) -> String {
        format!("{}/{MERGE_STATE_NAME}", self.prefix)
    }

    pub fn part_key(&self, part: &PartInfo) -> String {
        format!("{}/{}", self.prefix, part_object_name(part))
    }
}

impl fmt::Display for PartsDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.prefix)
    }
}

/// Object name for a standalone part: `part.00001_0-100663296`.
pub fn part_object_name(part: &PartInfo) -> String {
    format!(
        "{PART_PREFIX}{:05}_{}-{}",
        part.part_number, part.range.start, part.range.end
    )
}

/// Extracts the part number from a part object name or full key.
pub fn parse_part_number(name: &str) -> Option<u32> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let rest = base.strip_prefix(PART_PREFIX)?;
    let number = rest.split('_').next()?;
    number.parse().ok().filter(|n| *n > 0)
}

/// Parses a full part object name back into its [`PartInfo`].
pub fn parse_part_name(name: &str) -> Option<PartInfo> {
    let part_number = parse_part_number(name)?;
    let base = name.rsplit('/').next().unwrap_or(name);
    let (_, range) = base.split_once('_')?;
    let (start, end) = range.split_once('-')?;
    let range = ByteRange::new(start.parse().ok()?, end.parse().ok()?).ok()?;
    Some(PartInfo { part_number, range })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_part() -> PartInfo {
        PartInfo {
            part_number: 7,
            range: ByteRange {
                start: 100,
                end: 250,
            },
        }
    }

    #[test]
    fn part_name_round_trip() {
        let part = sample_part();
        let name = part_object_name(&part);
        assert_eq!(name, "part.00007_100-250");
        assert_eq!(parse_part_name(&name), Some(part));
        assert_eq!(parse_part_number(&format!("a/b-parts/{name}")), Some(7));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_part_number("info.json"), None);
        assert_eq!(parse_part_number("part.abc_1-2"), None);
        assert_eq!(parse_part_number("part.00000_0-1"), None);
        assert_eq!(parse_part_name("part.00003"), None);
        assert_eq!(parse_part_name("part.00003_9-2"), None);
    }

    #[test]
    fn parts_dir_layout() {
        let dst = ObjectPath::new("bucket", "videos/big.mkv");
        let dir = PartsDir::for_destination(&dst);
        assert_eq!(dir.prefix(), "videos/big.mkv-parts");
        assert_eq!(dir.manifest_key(), "videos/big.mkv-parts/info.json");
        assert_eq!(dir.merge_state_key(), "videos/big.mkv-parts/merge.json");
        assert_eq!(
            dir.part_key(&sample_part()),
            "videos/big.mkv-parts/part.00007_100-250"
        );
        assert_eq!(dir.destination(), dst);
    }
}

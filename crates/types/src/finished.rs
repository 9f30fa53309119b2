use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A part that has been durably stored, with the tag the store returned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FinishedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

impl FinishedPart {
    /// Creates a finished part, stripping any quotes around the tag.
    pub fn new(part_number: u32, etag: impl AsRef<str>) -> Self {
        Self {
            part_number,
            etag: normalize_etag(etag.as_ref()),
        }
    }
}

fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

/// Unordered completion set keyed by part number.
///
/// Serialized as a list of [`FinishedPart`] sorted by part number. Inserts
/// never replace an existing entry, so the set only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<FinishedPart>", into = "Vec<FinishedPart>")]
pub struct FinishedSet {
    parts: BTreeMap<u32, String>,
}

impl FinishedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a part. Returns `false` if the part was already present.
    pub fn insert(&mut self, part: FinishedPart) -> bool {
        if self.parts.contains_key(&part.part_number) {
            return false;
        }
        self.parts
            .insert(part.part_number, normalize_etag(&part.etag));
        true
    }

    pub fn contains(&self, part_number: u32) -> bool {
        self.parts.contains_key(&part_number)
    }

    pub fn etag(&self, part_number: u32) -> Option<&str> {
        self.parts.get(&part_number).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn part_numbers(&self) -> BTreeSet<u32> {
        self.parts.keys().copied().collect()
    }

    /// All parts in ascending part-number order, ready for a completion call.
    pub fn sorted(&self) -> Vec<FinishedPart> {
        self.parts
            .iter()
            .map(|(n, etag)| FinishedPart {
                part_number: *n,
                etag: etag.clone(),
            })
            .collect()
    }
}

impl From<Vec<FinishedPart>> for FinishedSet {
    fn from(parts: Vec<FinishedPart>) -> Self {
        let mut set = Self::new();
        for part in parts {
            set.insert(part);
        }
        set
    }
}

impl From<FinishedSet> for Vec<FinishedPart> {
    fn from(set: FinishedSet) -> Self {
        set.sorted()
    }
}

impl FromIterator<FinishedPart> for FinishedSet {
    fn from_iter<I: IntoIterator<Item = FinishedPart>>(iter: I) -> Self {
        let mut set = Self::new();
        for part in iter {
            set.insert(part);
        }
        set
    }
}

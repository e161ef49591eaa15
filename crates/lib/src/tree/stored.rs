//! The versioned stored form of a causal tree.
//!
//! Three versions exist. Version 1 carried no version tag and wrapped each
//! atom in a `{ "atom": ... }` record. Version 2 added `formatVersion` and
//! stored atoms directly. Version 3 added `ordered`, which tells a loader
//! whether the atom list is already a valid weave.
//!
//! Older versions are upgraded on load; nothing is ever downgraded.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::Value;

use super::site::SiteInfo;
use crate::atom::Atom;

/// The version written by this crate.
pub const CURRENT_FORMAT_VERSION: u32 = 3;

/// A version 1 weave entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeaveReference<Op> {
    /// The referenced atom.
    pub atom: Atom<Op>,
}

/// Version 1: untagged, weave entries wrapped in references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCausalTreeVersion1<Op> {
    /// The site the tree was exported from.
    pub site: SiteInfo,
    /// Every site the tree knew about.
    pub known_sites: Vec<SiteInfo>,
    /// The atoms in weave order.
    pub weave: Vec<WeaveReference<Op>>,
}

/// Version 2: tagged, plain atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCausalTreeVersion2<Op> {
    /// The site the tree was exported from.
    pub site: SiteInfo,
    /// Every site the tree knew about.
    pub known_sites: Vec<SiteInfo>,
    /// The atoms in weave order.
    pub weave: Vec<Atom<Op>>,
}

/// Version 3: records whether `weave` is already weave-ordered.
///
/// When `ordered` is false the atoms are an unordered set and must be
/// re-inserted one by one on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCausalTreeVersion3<Op> {
    /// The site the tree was exported from.
    pub site: SiteInfo,
    /// Every site the tree knew about, including `site`.
    pub known_sites: Vec<SiteInfo>,
    /// The atoms.
    pub weave: Vec<Atom<Op>>,
    /// Whether `weave` is a valid weave order.
    pub ordered: bool,
}

impl<Op> StoredCausalTreeVersion3<Op> {
    /// A stored tree for `site` holding no atoms.
    pub fn empty(site: SiteInfo) -> Self {
        Self {
            known_sites: vec![site.clone()],
            site,
            weave: Vec::new(),
            ordered: true,
        }
    }
}

/// Any stored tree version.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredCausalTree<Op> {
    V1(StoredCausalTreeVersion1<Op>),
    V2(StoredCausalTreeVersion2<Op>),
    V3(StoredCausalTreeVersion3<Op>),
    /// A `formatVersion` this build does not know.
    Unknown(u32),
}

impl<Op> StoredCausalTree<Op> {
    /// The format version of the stored data.
    pub fn format_version(&self) -> u32 {
        match self {
            StoredCausalTree::V1(_) => 1,
            StoredCausalTree::V2(_) => 2,
            StoredCausalTree::V3(_) => 3,
            StoredCausalTree::Unknown(version) => *version,
        }
    }

    /// Converts to the current version.
    ///
    /// Returns `None` only for [`StoredCausalTree::Unknown`]. Version 1 and 2
    /// weaves were always written in weave order.
    pub fn upgrade(self) -> Option<StoredCausalTreeVersion3<Op>> {
        match self {
            StoredCausalTree::V1(v1) => Some(StoredCausalTreeVersion3 {
                site: v1.site,
                known_sites: v1.known_sites,
                weave: v1.weave.into_iter().map(|r| r.atom).collect(),
                ordered: true,
            }),
            StoredCausalTree::V2(v2) => Some(StoredCausalTreeVersion3 {
                site: v2.site,
                known_sites: v2.known_sites,
                weave: v2.weave,
                ordered: true,
            }),
            StoredCausalTree::V3(v3) => Some(v3),
            StoredCausalTree::Unknown(_) => None,
        }
    }
}

impl<Op> From<StoredCausalTreeVersion3<Op>> for StoredCausalTree<Op> {
    fn from(stored: StoredCausalTreeVersion3<Op>) -> Self {
        StoredCausalTree::V3(stored)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Tagged<'a, T> {
    format_version: u32,
    #[serde(flatten)]
    inner: &'a T,
}

impl<Op: Serialize + DeserializeOwned> Serialize for StoredCausalTree<Op> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StoredCausalTree::V1(v1) => v1.serialize(serializer),
            StoredCausalTree::V2(v2) => Tagged {
                format_version: 2,
                inner: v2,
            }
            .serialize(serializer),
            StoredCausalTree::V3(v3) => Tagged {
                format_version: CURRENT_FORMAT_VERSION,
                inner: v3,
            }
            .serialize(serializer),
            StoredCausalTree::Unknown(version) => Tagged {
                format_version: *version,
                inner: &serde_json::Map::new(),
            }
            .serialize(serializer),
        }
    }
}

impl<'de, Op: Serialize + DeserializeOwned> Deserialize<'de> for StoredCausalTree<Op> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;

        let value = Value::deserialize(deserializer)?;
        let version = match value.get("formatVersion") {
            None | Some(Value::Null) => 1,
            Some(tag) => tag
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| D::Error::custom("formatVersion must be a positive integer"))?,
        };
        let stored = match version {
            1 => StoredCausalTree::V1(serde_json::from_value(value).map_err(D::Error::custom)?),
            2 => StoredCausalTree::V2(serde_json::from_value(value).map_err(D::Error::custom)?),
            3 => StoredCausalTree::V3(serde_json::from_value(value).map_err(D::Error::custom)?),
            other => StoredCausalTree::Unknown(other),
        };
        Ok(stored)
    }
}

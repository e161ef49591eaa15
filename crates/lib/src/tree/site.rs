//! Site identities and their advertised signing keys.

use serde::{Deserialize, Serialize};

use crate::auth::{PublicKey, SignatureAlgorithm};

/// The public signing key a site advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteCrypto {
    /// Algorithm of `public_key`.
    pub signature_algorithm: SignatureAlgorithm,
    /// The exported public key.
    pub public_key: String,
}

/// A replica taking part in a causal tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    /// Site id, unique within the tree.
    pub id: u64,
    /// Signing key, if atoms from this site must be signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<SiteCrypto>,
}

impl SiteInfo {
    /// A site without a signing key.
    pub fn new(id: u64) -> Self {
        Self { id, crypto: None }
    }

    /// A site advertising `key`.
    pub fn with_public_key(id: u64, key: &PublicKey) -> Self {
        Self {
            id,
            crypto: Some(SiteCrypto {
                signature_algorithm: key.algorithm(),
                public_key: key.to_prefixed_string(),
            }),
        }
    }
}

/// The smallest site id greater than every id in `sites`.
pub fn next_site_id<'a>(sites: impl IntoIterator<Item = &'a SiteInfo>) -> u64 {
    sites
        .into_iter()
        .map(|site| site.id)
        .max()
        .map_or(1, |max| max.saturating_add(1))
}

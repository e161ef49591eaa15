//! Rejection reasons for atoms that a tree refused to admit.
//!
//! Rejections are the expected outcome of concurrent, untrusted replication:
//! they are reported as values on the tree's `atom_rejected` stream and never
//! returned as errors.

use serde::{Deserialize, Serialize};

use crate::atom::Atom;

/// Why an atom was not admitted.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The weave already has a root.
    SecondRootNotAllowed,
    /// The atom's cause is not in the weave (yet).
    CauseNotFound,
    /// The atom is signed but its site has no registered public key.
    NoPublicKey,
    /// The atom's signature is missing or did not verify.
    SignatureFailed,
    /// The checksum does not match the atom's content, or an atom with the
    /// same id and a different checksum already exists.
    ChecksumMismatch,
    /// The atom's timestamp is not newer than its cause's.
    TimestampNotAfterCause,
}

impl RejectionReason {
    /// The wire name of the reason (e.g. `"cause_not_found"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::SecondRootNotAllowed => "second_root_not_allowed",
            RejectionReason::CauseNotFound => "cause_not_found",
            RejectionReason::NoPublicKey => "no_public_key",
            RejectionReason::SignatureFailed => "signature_failed",
            RejectionReason::ChecksumMismatch => "checksum_mismatch",
            RejectionReason::TimestampNotAfterCause => "timestamp_not_after_cause",
        }
    }

    /// Whether the atom may be admitted later when more history arrives.
    pub fn is_soft(&self) -> bool {
        matches!(self, RejectionReason::CauseNotFound)
    }

    /// Whether the rejection came from signature validation.
    pub fn is_signature_related(&self) -> bool {
        matches!(
            self,
            RejectionReason::NoPublicKey | RejectionReason::SignatureFailed
        )
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atom together with the reason it was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedAtom<Op> {
    /// The rejected atom.
    pub atom: Atom<Op>,
    /// Why it was rejected.
    pub reason: RejectionReason,
}

impl<Op> RejectedAtom<Op> {
    /// Pairs an atom with a rejection reason.
    pub fn new(atom: Atom<Op>, reason: RejectionReason) -> Self {
        Self { atom, reason }
    }
}

//! Constant-time comparisons.
//!
//! Pairing tags, commitments and codes are compared with [`ct_eq`] so a
//! mismatch does not leak the position of the first differing byte.

use subtle::ConstantTimeEq;

/// Equal length and equal content, in time independent of the content.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

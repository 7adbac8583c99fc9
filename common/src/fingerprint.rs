// Stable obligation identity
//
// The fingerprint is derived only from identifying fields. Amounts and
// timestamps change between runs for the same logical obligation and must
// never feed into it.

use crate::models::ObligationKind;
use sha2::{Digest, Sha256};

/// Version tag mixed into every digest so a future change of the scheme cannot
/// collide with fingerprints already stored.
const SCHEME: &str = "obligation-v1";

/// Canonical form of an identifying field: trimmed and lower-cased
fn canonical(field: &str) -> String {
    field.trim().to_lowercase()
}

/// Compute the fingerprint for a taxpayer, period and obligation category.
///
/// Fields are length-prefixed before hashing so `("ab", "c")` and `("a", "bc")`
/// never produce the same input.
pub fn fingerprint(taxpayer_id: &str, period: &str, category: ObligationKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SCHEME.as_bytes());
    for field in [canonical(taxpayer_id), canonical(period), category.to_string()] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Short prefix for log lines and chat messages
pub fn short(fingerprint: &str) -> &str {
    let end = fingerprint.len().min(12);
    &fingerprint[..end]
}

//! Small shared helpers

use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_128;

/// Replace NaN and infinities with 0, leaving finite values untouched.
///
/// TSDB responses and rate expressions routinely produce NaN or +/-Inf for
/// units with zero denominators; summaries must never carry them.
pub fn sanitize_float(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Derive a stable UUID from a list of strings.
///
/// The parts are comma-joined and hashed with XXH3-128; the canonical
/// big-endian digest is rendered as a UUID. The same input list always maps
/// to the same UUID, which lets resource managers without native job UUIDs
/// get a reproducible identity from job attributes.
pub fn uuid_from_strings<S: AsRef<str>>(parts: &[S]) -> String {
    let joined = parts
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",");
    let digest = xxh3_128(joined.as_bytes());
    Uuid::from_bytes(digest.to_be_bytes()).to_string()
}

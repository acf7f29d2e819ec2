use hex;
use sha2::{Digest, Sha256};

/// Checksummed wrapper around cached KPI payloads.
///
/// KPI figures sit in the in-process cache for minutes and are served to
/// every dashboard in an organization, so a corrupted entry would fan out
/// widely. Each payload is stored together with a SHA-256 checksum; a reader
/// that finds a mismatch discards the entry and recomputes from source.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SealedEntry {
    /// The cached payload (a JSON-encoded KPI figure).
    pub data: String,
    /// SHA-256 checksum of the payload (hex encoded).
    pub checksum: String,
}

impl SealedEntry {
    /// Wraps a payload and records its checksum.
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the stored checksum still matches the payload.
    pub fn is_intact(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    /// Serializes the entry for storage in the cache.
    pub fn seal(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a stored entry and returns the payload if its checksum holds.
    ///
    /// Returns `None` for unparseable entries and for checksum mismatches;
    /// callers treat both as a cache miss and recompute.
    pub fn open(serialized: &str) -> Option<String> {
        let entry: SealedEntry = serde_json::from_str(serialized).ok()?;

        if entry.is_intact() {
            Some(entry.data)
        } else {
            tracing::warn!(
                "Cache integrity check failed: checksum mismatch. Expected: {}, Data length: {}",
                entry.checksum,
                entry.data.len()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_entry_is_intact() {
        let data = r#"{"kind": "trx", "value": 1520.0}"#.to_string();
        let entry = SealedEntry::new(data.clone());

        assert!(entry.is_intact());
        assert_eq!(entry.data, data);
    }

    #[test]
    fn test_seal_then_open_returns_payload() {
        let data = r#"{"kind": "market_share", "value": 0.25}"#.to_string();
        let entry = SealedEntry::new(data.clone());

        let sealed = entry.seal();
        let opened = SealedEntry::open(&sealed);

        assert_eq!(opened, Some(data));
    }

    #[test]
    fn test_modified_payload_fails_integrity() {
        let entry = SealedEntry::new(r#"{"value": 100.0}"#.to_string());

        let mut modified = entry;
        modified.data = r#"{"value": 9999.0}"#.to_string();

        assert!(!modified.is_intact());
    }

    #[test]
    fn test_opening_a_corrupted_entry_returns_none() {
        let entry = SealedEntry::new(r#"{"kind": "nrx", "value": 42.0}"#.to_string());
        let sealed = entry.seal();

        let corrupted = sealed.replace("42.0", "9000.0");

        assert_eq!(SealedEntry::open(&corrupted), None);
    }

    #[test]
    fn test_opening_garbage_returns_none() {
        assert_eq!(SealedEntry::open("not json at all"), None);
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let data = r#"{"kind": "trx"}"#.to_string();
        let entry1 = SealedEntry::new(data.clone());
        let entry2 = SealedEntry::new(data);

        assert_eq!(entry1.checksum, entry2.checksum);
    }
}

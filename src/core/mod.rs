pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tags::Tag;

/// Length of `0x` + 4 selector bytes in hex.
const SIGNATURE_LEN: usize = 10;

/// A raw transaction from the ingestion window. Read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub from_address: String,
    /// `None` for contract-creation transactions.
    pub to_address: Option<String>,
    pub input: String,
    pub created_contract_address: Option<String>,
    pub block_timestamp: DateTime<Utc>,
}

impl Transaction {
    pub fn signature(&self) -> Option<String> {
        extract_signature(&self.input)
    }
}

/// First four bytes of a call payload, as lowercase `0x` + 8 hex chars.
///
/// Payloads too short to carry a selector (plain value transfers) have none.
pub fn extract_signature(input: &str) -> Option<String> {
    let input = input.trim();
    let prefix = input.get(..SIGNATURE_LEN)?;
    let hex = prefix
        .strip_prefix("0x")
        .or_else(|| prefix.strip_prefix("0X"))?;
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", hex.to_ascii_lowercase()))
}

/// Natural key of a signature row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignatureKey {
    pub to_address: String,
    pub signature: String,
}

/// Natural key of a caller row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallerKey {
    pub caller: String,
    pub to_address: String,
}

/// A contract keyed by `to_address`. `block_timestamp` is the first time it was seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub to_address: String,
    pub tag: Tag,
    pub block_timestamp: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub to_address: String,
    pub signature: String,
    pub invocations: u64,
    pub tag: Tag,
    pub block_timestamp: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SignatureRecord {
    pub fn key(&self) -> SignatureKey {
        SignatureKey {
            to_address: self.to_address.clone(),
            signature: self.signature.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerRecord {
    pub caller: String,
    pub to_address: String,
    pub tag: Tag,
    pub block_timestamp: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CallerRecord {
    pub fn key(&self) -> CallerKey {
        CallerKey {
            caller: self.caller.clone(),
            to_address: self.to_address.clone(),
        }
    }
}

/// Every persisted entity the explorer ever flagged, whether still suspicious or already bot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaggedSet {
    pub contracts: Vec<ContractRecord>,
    pub signatures: Vec<SignatureRecord>,
    pub callers: Vec<CallerRecord>,
}

impl TaggedSet {
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty() && self.signatures.is_empty() && self.callers.is_empty()
    }
}

/// One run's output, one row per natural key, ready for merge-upsert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagBatch {
    pub contracts: Vec<ContractRecord>,
    pub signatures: Vec<SignatureRecord>,
    pub callers: Vec<CallerRecord>,
}

impl TagBatch {
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty() && self.signatures.is_empty() && self.callers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contracts.len() + self.signatures.len() + self.callers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_from_call_payload() {
        assert_eq!(
            extract_signature("0xa9059cbb000000000000000000000000"),
            Some("0xa9059cbb".to_string())
        );
    }

    #[test]
    fn signature_is_lowercased() {
        assert_eq!(extract_signature("0xA9059CBBff"), Some("0xa9059cbb".to_string()));
        assert_eq!(extract_signature("0XA9059CBB"), Some("0xa9059cbb".to_string()));
    }

    #[test]
    fn exact_selector_length() {
        assert_eq!(extract_signature("0xdeadbeef"), Some("0xdeadbeef".to_string()));
    }

    #[test]
    fn plain_transfer_has_no_signature() {
        assert_eq!(extract_signature("0x"), None);
        assert_eq!(extract_signature(""), None);
        assert_eq!(extract_signature("0xabcd"), None);
    }

    #[test]
    fn non_hex_payload_has_no_signature() {
        assert_eq!(extract_signature("0xzzzzzzzz00"), None);
        assert_eq!(extract_signature("deadbeef00"), None);
    }

    #[test]
    fn multibyte_payload_does_not_panic() {
        assert_eq!(extract_signature("0x€€€€€€"), None);
    }

    #[test]
    fn batch_len_counts_all_tables() {
        let batch = TagBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }
}

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("must be a 0x-prefixed hex string of {0} characters")]
    BadHexLength(usize),
    #[error("must contain only hex characters")]
    BadHexCharset,
    #[error("must be a lowercase RFC-4122 UUID")]
    BadUserId,
    #[error("recovery byte must be 27, 28 or an EIP-155 value")]
    BadRecoveryByte,
    #[error("must be a hex string with an even number of digits")]
    OddHexPayload,
    #[error("must not be empty")]
    Empty,
}

fn decode_prefixed_hex(raw: &str, total_len: usize) -> Result<Vec<u8>, ParseError> {
    let normalized = raw.trim().to_lowercase();
    if normalized.len() != total_len || !normalized.starts_with("0x") {
        return Err(ParseError::BadHexLength(total_len));
    }
    hex::decode(&normalized[2..]).map_err(|_| ParseError::BadHexCharset)
}

/// Uncompressed secp256k1 public key, 64 raw bytes (no SEC1 tag byte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    bytes: [u8; 64],
}

impl PublicKey {
    /// Parses the wire form: `0x` + 128 lowercase hex characters.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let decoded = decode_prefixed_hex(raw, 130)?;
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    pub fn from_raw(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.bytes))
    }

    /// SHA-256 of the raw key bytes; the blob-store partition key.
    pub fn hash(&self) -> PublicKeyHash {
        let bytes: [u8; 32] = Sha256::digest(self.bytes).into();
        PublicKeyHash { bytes }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyHash {
    bytes: [u8; 32],
}

impl PublicKeyHash {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.bytes))
    }
}

/// Lowercase RFC-4122 UUID. Stricter than `uuid::Uuid::parse_str`: uppercase,
/// braces, URNs and missing dashes are all rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let raw = raw.trim();
        let strict = raw.len() == 36
            && raw.bytes().enumerate().all(|(i, b)| match i {
                8 | 13 | 18 | 23 => b == b'-',
                _ => matches!(b, b'0'..=b'9' | b'a'..=b'f'),
            });
        if !strict {
            return Err(ParseError::BadUserId);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 65-byte `r‖s‖v` signature in the RPC form, with the recovery byte already
/// normalized to 0/1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableSignature {
    rs: [u8; 64],
    recovery_id: u8,
}

impl RecoverableSignature {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let decoded = decode_prefixed_hex(raw, 132)?;
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&decoded[..64]);
        let recovery_id = match decoded[64] {
            v @ (27 | 28) => v - 27,
            v if v >= 35 => (v - 35) % 2,
            _ => return Err(ParseError::BadRecoveryByte),
        };
        Ok(Self { rs, recovery_id })
    }

    pub fn from_parts(rs: [u8; 64], recovery_id: u8) -> Self {
        Self { rs, recovery_id }
    }

    pub fn rs(&self) -> &[u8; 64] {
        &self.rs
    }

    pub fn recovery_id(&self) -> u8 {
        self.recovery_id
    }
}

/// Normalizes a hex payload: lowercases, keeps an optional `0x` prefix,
/// requires an even number of hex digits and at least one byte.
pub fn normalize_hex_payload(raw: &str) -> Result<String, ParseError> {
    let normalized = raw.trim().to_lowercase();
    let digits = normalized.strip_prefix("0x").unwrap_or(&normalized);
    if digits.is_empty() {
        return Err(ParseError::Empty);
    }
    if digits.len() % 2 != 0 {
        return Err(ParseError::OddHexPayload);
    }
    if !digits.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(ParseError::BadHexCharset);
    }
    Ok(normalized)
}

/// Decodes a payload previously accepted by [`normalize_hex_payload`].
pub fn decode_hex_payload(payload: &str) -> Result<Vec<u8>, ParseError> {
    let digits = payload.strip_prefix("0x").unwrap_or(payload);
    hex::decode(digits).map_err(|_| ParseError::BadHexCharset)
}

/// Stored backup record. `updated_at` is ISO-8601 UTC with millisecond
/// precision, so lexicographic order is chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub user_id: UserId,
    pub pubkey: String,
    pub updated_at: String,
    pub payload: String,
}

impl Backup {
    pub fn summary(&self) -> BackupSummary {
        BackupSummary {
            user_id: self.user_id.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

/// The projection returned by list; never carries the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub user_id: UserId,
    pub updated_at: String,
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBKEY_HEX: &str = "0x3b6a27bcceb6a42d62a3a8d02a6f0d73653215771de243a63ac048a18b59da29a98f13f59a27bcceb6a42d62a3a8d02a6f0d73653215771de243a63ac048a18b";

    #[test]
    fn parses_and_rerenders_public_keys() {
        let key = PublicKey::parse(PUBKEY_HEX).unwrap();
        assert_eq!(key.to_hex(), PUBKEY_HEX);

        // Uppercase input is normalized, never stored.
        let upper = PUBKEY_HEX.to_uppercase().replace("0X", "0x");
        assert_eq!(PublicKey::parse(&upper).unwrap(), key);
    }

    #[test]
    fn rejects_malformed_public_keys() {
        assert_eq!(
            PublicKey::parse("0x1234"),
            Err(ParseError::BadHexLength(130))
        );
        assert_eq!(
            PublicKey::parse(&PUBKEY_HEX[2..]),
            Err(ParseError::BadHexLength(130))
        );
        let bad_charset = format!("0x{}", "zz".repeat(64));
        assert_eq!(PublicKey::parse(&bad_charset), Err(ParseError::BadHexCharset));
    }

    #[test]
    fn hashes_raw_key_bytes() {
        let key = PublicKey::parse(PUBKEY_HEX).unwrap();
        let hash = key.hash();
        let hash_hex = hash.to_hex();
        assert_eq!(hash_hex.len(), 66);
        assert!(hash_hex.starts_with("0x"));

        let expected = sha2::Sha256::digest(key.as_bytes());
        assert_eq!(hash_hex, format!("0x{}", hex::encode(expected)));
    }

    #[test]
    fn user_id_is_strict() {
        let id = UserId::parse("f81d4fae-7dec-11d0-a765-00a0c91e6bf6").unwrap();
        assert_eq!(id.as_str(), "f81d4fae-7dec-11d0-a765-00a0c91e6bf6");

        // uuid::parse_str would accept all of these.
        assert!(UserId::parse("F81D4FAE-7DEC-11D0-A765-00A0C91E6BF6").is_err());
        assert!(UserId::parse("f81d4fae7dec11d0a76500a0c91e6bf6").is_err());
        assert!(UserId::parse("{f81d4fae-7dec-11d0-a765-00a0c91e6bf6}").is_err());
        assert!(UserId::parse("f81d4fae-7dec-11d0-a765-00a0c91e6bf").is_err());
        assert!(UserId::parse("g81d4fae-7dec-11d0-a765-00a0c91e6bf6").is_err());
    }

    #[test]
    fn signature_recovery_byte_forms() {
        let sig = |v: u8| {
            let mut bytes = [0x11u8; 65];
            bytes[64] = v;
            format!("0x{}", hex::encode(bytes))
        };
        assert_eq!(RecoverableSignature::parse(&sig(27)).unwrap().recovery_id(), 0);
        assert_eq!(RecoverableSignature::parse(&sig(28)).unwrap().recovery_id(), 1);
        // EIP-155: v = 35 + recid + 2 * chain_id.
        assert_eq!(RecoverableSignature::parse(&sig(37)).unwrap().recovery_id(), 0);
        assert_eq!(RecoverableSignature::parse(&sig(38)).unwrap().recovery_id(), 1);
        assert_eq!(
            RecoverableSignature::parse(&sig(0)),
            Err(ParseError::BadRecoveryByte)
        );
        assert_eq!(
            RecoverableSignature::parse(&sig(29)),
            Err(ParseError::BadRecoveryByte)
        );
    }

    #[test]
    fn payload_normalization() {
        assert_eq!(normalize_hex_payload("0xAbCd").unwrap(), "0xabcd");
        assert_eq!(normalize_hex_payload("abcd").unwrap(), "abcd");
        assert_eq!(normalize_hex_payload("0xabc"), Err(ParseError::OddHexPayload));
        assert_eq!(normalize_hex_payload("0x"), Err(ParseError::Empty));
        assert_eq!(normalize_hex_payload("0xzz"), Err(ParseError::BadHexCharset));

        assert_eq!(decode_hex_payload("0xabcd").unwrap(), vec![0xab, 0xcd]);
        assert_eq!(decode_hex_payload("abcd").unwrap(), vec![0xab, 0xcd]);
    }

    #[test]
    fn timestamps_order_lexicographically() {
        let early = "2024-01-02T03:04:05.006Z";
        let late = "2024-01-02T03:04:05.007Z";
        assert!(early < late);

        let now = timestamp_now();
        assert_eq!(now.len(), "2024-01-02T03:04:05.006Z".len());
        assert!(now.ends_with('Z'));
    }

    #[test]
    fn backup_wire_form_is_camel_case() {
        let backup = Backup {
            user_id: UserId::parse("f81d4fae-7dec-11d0-a765-00a0c91e6bf6").unwrap(),
            pubkey: PUBKEY_HEX.to_string(),
            updated_at: "2024-01-02T03:04:05.006Z".to_string(),
            payload: "0xabcd".to_string(),
        };
        let json = serde_json::to_value(&backup).unwrap();
        assert_eq!(json["userId"], "f81d4fae-7dec-11d0-a765-00a0c91e6bf6");
        assert_eq!(json["updatedAt"], "2024-01-02T03:04:05.006Z");
        assert!(json.get("payload").is_some());

        let summary = serde_json::to_value(backup.summary()).unwrap();
        assert!(summary.get("payload").is_none());
    }
}

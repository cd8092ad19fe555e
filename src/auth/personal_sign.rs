use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::keys::{PublicKey, RecoverableSignature};

const PERSONAL_SIGN_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n";

/// `keccak256("\x19Ethereum Signed Message:\n" || ascii(len(msg)) || msg)`.
pub fn hash_personal_message(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(PERSONAL_SIGN_PREFIX);
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Recovers the uncompressed public key (minus the SEC1 tag byte) that
/// produced `signature` over the personal-sign digest of `message`. Returns
/// `None` for signatures that do not recover to a valid curve point.
pub fn recover_public_key(
    message: &[u8],
    signature: &RecoverableSignature,
) -> Option<PublicKey> {
    let digest = hash_personal_message(message);
    let sig = Signature::from_slice(signature.rs()).ok()?;
    let recovery_id = RecoveryId::from_byte(signature.recovery_id())?;
    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id).ok()?;
    let point = key.to_encoded_point(false);
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&point.as_bytes()[1..65]);
    Some(PublicKey::from_raw(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn personal_sign_digest_matches_reference_vector() {
        // keccak256("\x19Ethereum Signed Message:\n5hello")
        let digest = hash_personal_message(b"hello");
        assert_eq!(
            hex::encode(digest),
            "50b2c43fd39106bafbba0da34fc430e1f91e3c96ea2acee2bc34119f92b37750"
        );
    }

    #[test]
    fn digest_depends_on_ascii_length_prefix() {
        // The envelope length is rendered in decimal, so equal-content
        // messages of different lengths never share a digest.
        assert_ne!(hash_personal_message(b""), hash_personal_message(b"0"));
        assert_ne!(hash_personal_message(b"ab"), hash_personal_message(b"abab"));
    }
}

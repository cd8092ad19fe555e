pub mod messages;
mod personal_sign;

use chrono::{DateTime, Utc};

pub use messages::SignedOperation;
pub use personal_sign::{hash_personal_message, recover_public_key};

use crate::keys::{PublicKey, RecoverableSignature};

/// The signature did not recover to the public key named in the URL.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("SIGNATURE_DOES_NOT_MATCH_PUBKEY")]
pub struct SignatureMismatch;

/// Proves that `signature` was produced by the holder of `pubkey` for `op`.
/// Each candidate message (see [`messages::candidate_messages`]) is hashed
/// and recovered; any byte-for-byte key match proves ownership.
pub fn verify_ownership(
    pubkey: &PublicKey,
    signature: &RecoverableSignature,
    op: &SignedOperation<'_>,
    now: DateTime<Utc>,
) -> Result<(), SignatureMismatch> {
    for message in messages::candidate_messages(op, now) {
        match personal_sign::recover_public_key(&message, signature) {
            Some(recovered) if &recovered == pubkey => return Ok(()),
            _ => continue,
        }
    }
    Err(SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::UserId;
    use crate::test_support::{sign_personal, test_keypair};
    use chrono::{Duration, TimeZone};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn accepts_signature_over_payload() {
        let (signing_key, pubkey) = test_keypair();
        let payload = b"\xde\xad\xbe\xef";
        let signature = sign_personal(&signing_key, payload);

        let op = SignedOperation::CreateBackup { payload };
        assert_eq!(verify_ownership(&pubkey, &signature, &op, noon()), Ok(()));
    }

    #[test]
    fn rejects_signature_from_another_key() {
        let (_, pubkey) = test_keypair();
        let (other_key, _) = test_keypair();
        let payload = b"\xde\xad\xbe\xef";
        let signature = sign_personal(&other_key, payload);

        let op = SignedOperation::CreateBackup { payload };
        assert_eq!(
            verify_ownership(&pubkey, &signature, &op, noon()),
            Err(SignatureMismatch)
        );
    }

    #[test]
    fn rejects_signature_over_different_payload() {
        let (signing_key, pubkey) = test_keypair();
        let signature = sign_personal(&signing_key, b"\x01");

        let op = SignedOperation::CreateBackup { payload: b"\x02" };
        assert_eq!(
            verify_ownership(&pubkey, &signature, &op, noon()),
            Err(SignatureMismatch)
        );
    }

    #[test]
    fn accepts_adjacent_day_messages() {
        let (signing_key, pubkey) = test_keypair();
        let user_id = UserId::parse("f81d4fae-7dec-11d0-a765-00a0c91e6bf6").unwrap();
        let op = SignedOperation::GetBackup { user_id: &user_id };

        for day in ["06-14-2024", "06-15-2024", "06-16-2024"] {
            let message = format!("{user_id}-GET-BACKUP-{day}");
            let signature = sign_personal(&signing_key, message.as_bytes());
            assert_eq!(
                verify_ownership(&pubkey, &signature, &op, noon()),
                Ok(()),
                "day {day} should be accepted"
            );
        }
    }

    #[test]
    fn rejects_stale_day_messages() {
        let (signing_key, pubkey) = test_keypair();
        let user_id = UserId::parse("f81d4fae-7dec-11d0-a765-00a0c91e6bf6").unwrap();
        let op = SignedOperation::GetBackup { user_id: &user_id };

        let message = format!("{user_id}-GET-BACKUP-06-12-2024");
        let signature = sign_personal(&signing_key, message.as_bytes());
        assert_eq!(
            verify_ownership(&pubkey, &signature, &op, noon()),
            Err(SignatureMismatch)
        );
    }

    #[test]
    fn midnight_slack_admits_the_boundary_day() {
        let (signing_key, pubkey) = test_keypair();
        let user_id = UserId::parse("f81d4fae-7dec-11d0-a765-00a0c91e6bf6").unwrap();
        let op = SignedOperation::DeleteBackup { user_id: &user_id };

        let message = format!("{user_id}-DELETE-BACKUP-06-17-2024");
        let signature = sign_personal(&signing_key, message.as_bytes());

        let near_midnight = Utc.with_ymd_and_hms(2024, 6, 15, 23, 55, 0).unwrap();
        assert_eq!(
            verify_ownership(&pubkey, &signature, &op, near_midnight),
            Ok(())
        );
        assert_eq!(
            verify_ownership(
                &pubkey,
                &signature,
                &op,
                near_midnight - Duration::minutes(30)
            ),
            Err(SignatureMismatch)
        );
    }
}

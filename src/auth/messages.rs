use chrono::{DateTime, Datelike, Duration, Utc};

use crate::keys::UserId;

/// Slack band around UTC midnight within which the adjacent day is also
/// accepted, to tolerate client clock skew.
const MIDNIGHT_SLACK_MINUTES: i64 = 10;

/// The operations that carry a personal-sign signature, each with its
/// canonical message.
#[derive(Debug, Clone)]
pub enum SignedOperation<'a> {
    /// The signature proves knowledge of the payload itself.
    CreateBackup { payload: &'a [u8] },
    GetBackup { user_id: &'a UserId },
    ListBackups { pubkey_hex: &'a str },
    DeleteBackup { user_id: &'a UserId },
}

/// Builds every message the verifier accepts for `op` at `now`. Dated
/// operations yield one message per candidate day: yesterday, today and
/// tomorrow, with a ±10-minute band across midnight boundaries. A captured
/// signature therefore replays for at most ≈48 hours.
pub fn candidate_messages(op: &SignedOperation<'_>, now: DateTime<Utc>) -> Vec<Vec<u8>> {
    match op {
        SignedOperation::CreateBackup { payload } => vec![payload.to_vec()],
        SignedOperation::GetBackup { user_id } => candidate_days(now)
            .into_iter()
            .map(|day| format!("{user_id}-GET-BACKUP-{day}").into_bytes())
            .collect(),
        SignedOperation::ListBackups { pubkey_hex } => candidate_days(now)
            .into_iter()
            .map(|day| format!("{pubkey_hex}-GET-BACKUPS-{day}").into_bytes())
            .collect(),
        SignedOperation::DeleteBackup { user_id } => candidate_days(now)
            .into_iter()
            .map(|day| format!("{user_id}-DELETE-BACKUP-{day}").into_bytes())
            .collect(),
    }
}

/// `MM-DD-YYYY`, 1-based 2-digit month, 2-digit day, 4-digit year.
pub fn format_day(at: DateTime<Utc>) -> String {
    format!("{:02}-{:02}-{:04}", at.month(), at.day(), at.year())
}

fn candidate_days(now: DateTime<Utc>) -> Vec<String> {
    let mut days = Vec::new();
    for skew in [-MIDNIGHT_SLACK_MINUTES, 0, MIDNIGHT_SLACK_MINUTES] {
        for offset in [-1i64, 0, 1] {
            let at = now + Duration::minutes(skew) + Duration::days(offset);
            let day = format_day(at);
            if !days.contains(&day) {
                days.push(day);
            }
        }
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn day_format_is_zero_padded() {
        assert_eq!(format_day(at(2024, 3, 7, 12, 0)), "03-07-2024");
        assert_eq!(format_day(at(2024, 11, 23, 12, 0)), "11-23-2024");
    }

    #[test]
    fn midday_window_is_three_days() {
        let days = candidate_days(at(2024, 6, 15, 12, 0));
        assert_eq!(days, vec!["06-14-2024", "06-15-2024", "06-16-2024"]);
    }

    #[test]
    fn late_evening_extends_forward_across_midnight() {
        let days = candidate_days(at(2024, 6, 15, 23, 55));
        assert!(days.contains(&"06-14-2024".to_string()));
        assert!(days.contains(&"06-15-2024".to_string()));
        assert!(days.contains(&"06-16-2024".to_string()));
        // Within 10 minutes of midnight the day after tomorrow opens up.
        assert!(days.contains(&"06-17-2024".to_string()));
        assert_eq!(days.len(), 4);
    }

    #[test]
    fn early_morning_extends_backward_across_midnight() {
        let days = candidate_days(at(2024, 6, 15, 0, 5));
        assert!(days.contains(&"06-13-2024".to_string()));
        assert!(days.contains(&"06-16-2024".to_string()));
        assert_eq!(days.len(), 4);
    }

    #[test]
    fn outside_slack_stays_closed() {
        let days = candidate_days(at(2024, 6, 15, 23, 45));
        assert!(!days.contains(&"06-17-2024".to_string()));
        let days = candidate_days(at(2024, 6, 15, 0, 15));
        assert!(!days.contains(&"06-13-2024".to_string()));
    }

    #[test]
    fn month_rollover() {
        let days = candidate_days(at(2024, 3, 1, 12, 0));
        assert_eq!(days, vec!["02-29-2024", "03-01-2024", "03-02-2024"]);
    }

    #[test]
    fn dated_messages_embed_the_subject() {
        let user_id = UserId::parse("f81d4fae-7dec-11d0-a765-00a0c91e6bf6").unwrap();
        let now = at(2024, 6, 15, 12, 0);

        let messages = candidate_messages(&SignedOperation::GetBackup { user_id: &user_id }, now);
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[1],
            b"f81d4fae-7dec-11d0-a765-00a0c91e6bf6-GET-BACKUP-06-15-2024".to_vec()
        );

        let messages =
            candidate_messages(&SignedOperation::DeleteBackup { user_id: &user_id }, now);
        assert!(String::from_utf8(messages[1].clone())
            .unwrap()
            .contains("-DELETE-BACKUP-"));

        let messages = candidate_messages(
            &SignedOperation::ListBackups { pubkey_hex: "0xabc" },
            now,
        );
        assert_eq!(messages[0], b"0xabc-GET-BACKUPS-06-14-2024".to_vec());
    }

    #[test]
    fn create_message_is_the_payload_itself() {
        let messages = candidate_messages(
            &SignedOperation::CreateBackup { payload: b"\x01\x02" },
            at(2024, 6, 15, 12, 0),
        );
        assert_eq!(messages, vec![vec![1, 2]]);
    }
}

//! Wire format shared with the engine: retained JSON under `<prefix>/<key>`.

use serde::{Deserialize, Serialize};

pub const VALVE_COMMAND: &str = "valveCommand";
pub const VALVE_CONFIRMATION: &str = "valveConfirmation";

/// Desired valve state, written by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveCommand {
    pub open: bool,
    #[serde(default)]
    pub issued_at: i64,
}

/// What the bridge last did to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveConfirmation {
    pub open: bool,
    pub reported_at: i64,
}

pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// "<prefix>/<key>".
pub fn topic_for(prefix: &str, key: &str) -> String {
    format!("{prefix}/{key}")
}

/// Decode a command payload. Bare `ON` / `OFF` is accepted for hand-typed
/// `mosquitto_pub` tests; those carry no issue time.
pub fn parse_command(payload: &[u8]) -> Result<ValveCommand, String> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| "valve command is not utf-8".to_string())?
        .trim();

    if text.eq_ignore_ascii_case("on") || text.eq_ignore_ascii_case("off") {
        return Ok(ValveCommand {
            open: text.eq_ignore_ascii_case("on"),
            issued_at: 0,
        });
    }

    serde_json::from_str(text).map_err(|e| format!("bad valve command '{text}': {e}"))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_for_joins_prefix_and_key() {
        assert_eq!(topic_for("farm", VALVE_COMMAND), "farm/valveCommand");
    }

    #[test]
    fn parse_json_command() {
        let cmd = parse_command(br#"{"open":true,"issuedAt":1700000000}"#).unwrap();
        assert_eq!(
            cmd,
            ValveCommand {
                open: true,
                issued_at: 1_700_000_000
            }
        );
    }

    #[test]
    fn parse_json_command_without_issue_time() {
        let cmd = parse_command(br#"{"open":false}"#).unwrap();
        assert!(!cmd.open);
        assert_eq!(cmd.issued_at, 0);
    }

    #[test]
    fn parse_on_off_case_insensitive() {
        assert!(parse_command(b"ON").unwrap().open);
        assert!(parse_command(b"on\n").unwrap().open);
        assert!(!parse_command(b"Off").unwrap().open);
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_command(b"OPEN").is_err());
        assert!(parse_command(b"").is_err());
        assert!(parse_command(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn confirmation_serializes_camel_case() {
        let json = serde_json::to_value(ValveConfirmation {
            open: true,
            reported_at: 42,
        })
        .unwrap();
        assert_eq!(json["open"], true);
        assert_eq!(json["reportedAt"], 42);
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[test]
    fn now_unix_is_recent() {
        let ts = now_unix();
        assert!(ts > 1_704_067_200, "timestamp too old: {ts}");
        assert!(ts < 2_208_988_800, "timestamp too far in future: {ts}");
    }
}

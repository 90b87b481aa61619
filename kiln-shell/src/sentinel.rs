//! The trap sentinel wire format.
//!
//! Stage scripts report their outcome by appending a sentinel line to the
//! shared log file. The log tailer extracts these lines from the stream and
//! they must never reach the user-visible trace, so the format is chosen to
//! be cheap to test per line and practically impossible to emit by accident:
//! the JSON payload is wrapped in `TRAP` markers delimited by the unit
//! separator control character.

use serde::Deserialize;
use serde::Serialize;

/// The marker delimiting sentinel lines in the log stream.
pub const MARKER: &str = "\u{001f}";

/// The tag between the first two markers of a sentinel line.
const TAG: &str = "TRAP";

/// The status carried by a trap sentinel line.
///
/// The exit sentinel written by the trap handler carries the exit code of the
/// stage script; the start sentinel written before the user script runs
/// carries only the script path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrapExitStatus {
    /// The exit code of the stage script, absent on start sentinels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_exit_code: Option<i32>,

    /// The path of the script the sentinel refers to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

impl TrapExitStatus {
    /// Creates an exit status with the given exit code and no script path.
    pub fn exited(code: i32) -> Self {
        Self {
            command_exit_code: Some(code),
            script: None,
        }
    }

    /// Attempts to parse a log line as a sentinel.
    ///
    /// Parsing is a whole-line exact match: the outer markers must be
    /// present and the middle must decode as a status object. Anything else
    /// is user output and returns `None` — user scripts are allowed to print
    /// text that merely resembles a sentinel.
    pub fn try_parse(line: &str) -> Option<Self> {
        let payload = line
            .strip_prefix(MARKER)?
            .strip_prefix(TAG)?
            .strip_prefix(MARKER)?
            .strip_suffix(MARKER)?;

        serde_json::from_str(payload).ok()
    }

    /// Formats the status as a sentinel line, without a trailing newline.
    pub fn to_line(&self) -> String {
        let payload = serde_json::to_string(self).expect("status should serialize");
        format!("{MARKER}{TAG}{MARKER}{payload}{MARKER}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_sentinel_round_trips() {
        let status = TrapExitStatus {
            command_exit_code: Some(7),
            script: Some("/scripts-1-2/step_script".to_string()),
        };

        let parsed = TrapExitStatus::try_parse(&status.to_line()).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn start_sentinel_parses_without_exit_code() {
        let line = format!("{MARKER}{TAG}{MARKER}{{\"script\":\"/scripts-1-2/build\"}}{MARKER}");

        let parsed = TrapExitStatus::try_parse(&line).unwrap();
        assert_eq!(parsed.command_exit_code, None);
        assert_eq!(parsed.script.as_deref(), Some("/scripts-1-2/build"));
    }

    #[test]
    fn plain_output_is_not_a_sentinel() {
        assert_eq!(TrapExitStatus::try_parse("building the project"), None);
        assert_eq!(TrapExitStatus::try_parse(""), None);
    }

    #[test]
    fn invalid_json_between_markers_is_user_output() {
        let line = format!("{MARKER}{TAG}{MARKER}not json{MARKER}");
        assert_eq!(TrapExitStatus::try_parse(&line), None);

        let line = format!("{MARKER}{TAG}{MARKER}{{\"command_exit_code\":}}{MARKER}");
        assert_eq!(TrapExitStatus::try_parse(&line), None);
    }

    #[test]
    fn unknown_fields_are_user_output() {
        let line = format!("{MARKER}{TAG}{MARKER}{{\"pid\":42}}{MARKER}");
        assert_eq!(TrapExitStatus::try_parse(&line), None);
    }

    #[test]
    fn truncated_markers_are_user_output() {
        let status = TrapExitStatus::exited(0);
        let line = status.to_line();

        assert_eq!(TrapExitStatus::try_parse(&line[1..]), None);
        assert_eq!(TrapExitStatus::try_parse(&line[..line.len() - 1]), None);
    }
}

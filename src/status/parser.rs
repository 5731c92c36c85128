//! Best-effort extraction of run state from service-manager free text.
//!
//! Both `launchctl print` and `launchctl list <label>` output are understood.
//! Health classification only ever sees [`ParsedServiceStatus`].
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Structured subset of a service-manager status query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedServiceStatus {
    /// Raw state token, e.g. `running`, `waiting`, `not running`.
    pub state: Option<String>,
    /// Process id when the service has a live process.
    pub pid: Option<u32>,
    /// Exit code of the most recent run; negative values are signal numbers.
    pub last_exit_code: Option<i32>,
}

impl ParsedServiceStatus {
    /// Returns `true` when the state token reports a live process.
    pub fn is_running(&self) -> bool {
        self.state.as_deref() == Some("running")
    }
}

/// Converts status text into [`ParsedServiceStatus`].
pub trait StatusParser: Send + Sync {
    fn parse(&self, text: &str) -> ParsedServiceStatus;
}

/// [`StatusParser`] for `launchctl` output.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchctlStatusParser;

impl StatusParser for LaunchctlStatusParser {
    fn parse(&self, text: &str) -> ParsedServiceStatus {
        parse_service_status(text)
    }
}

struct Patterns {
    state: Regex,
    pid: Regex,
    last_exit: Regex,
    list_pid: Regex,
    list_exit: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        state: Regex::new(r"(?m)^\s*state = (\S[^\r\n]*?)\s*$").expect("state pattern"),
        pid: Regex::new(r"(?m)^\s*pid = (\d+)\s*$").expect("pid pattern"),
        last_exit: Regex::new(r"(?m)^\s*last exit code = (-?\d+)").expect("exit pattern"),
        list_pid: Regex::new(r#""PID"\s*=\s*(\d+);"#).expect("list pid pattern"),
        list_exit: Regex::new(r#""LastExitStatus"\s*=\s*(-?\d+);"#).expect("list exit pattern"),
    })
}

/// Parses status text from either `launchctl` dialect. Unknown text yields
/// an all-`None` result.
pub fn parse_service_status(text: &str) -> ParsedServiceStatus {
    let patterns = patterns();
    let capture = |regex: &Regex| {
        regex
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    };

    let state = capture(&patterns.state);
    let pid = capture(&patterns.pid).and_then(|raw| raw.parse().ok());
    let last_exit_code = capture(&patterns.last_exit).and_then(|raw| raw.parse().ok());

    if state.is_some() || pid.is_some() || last_exit_code.is_some() {
        return ParsedServiceStatus {
            state,
            pid,
            last_exit_code,
        };
    }

    let pid: Option<u32> = capture(&patterns.list_pid).and_then(|raw| raw.parse().ok());
    let last_exit_code = capture(&patterns.list_exit)
        .and_then(|raw| raw.parse::<i32>().ok())
        .map(wait_status_to_exit_code);

    ParsedServiceStatus {
        state: pid.map(|_| "running".to_string()),
        pid,
        last_exit_code,
    }
}

/// `launchctl list` reports raw wait statuses; exits map to their code and
/// signal deaths to the negated signal number.
fn wait_status_to_exit_code(raw: i32) -> i32 {
    if raw < 0 {
        return raw;
    }
    let signal = raw & 0x7f;
    if signal == 0 { raw >> 8 } else { -signal }
}

use std::io::IsTerminal;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// Result of one `call` invocation.
#[derive(Debug, Serialize)]
pub struct CallReport<'a> {
    pub endpoint: String,
    pub method: &'a str,
    /// `sync` or `mux`.
    pub channel: &'static str,
    pub elapsed_ms: u64,
    /// Absent for one-way calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<&'a Value>,
    pub timestamp: String,
}

impl<'a> CallReport<'a> {
    pub fn new(
        endpoint: String,
        method: &'a str,
        channel: &'static str,
        elapsed: Duration,
        response: Option<&'a Value>,
    ) -> Self {
        Self {
            endpoint,
            method,
            channel,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            response,
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn render_call(report: &CallReport<'_>, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Pretty => {
            let mut out = format!(
                "method={} channel={} endpoint={} elapsed={}ms",
                report.method, report.channel, report.endpoint, report.elapsed_ms
            );
            match report.response {
                Some(value) => {
                    out.push('\n');
                    out.push_str(
                        &serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
                    );
                }
                None => out.push_str(" (no response)"),
            }
            out
        }
        OutputFormat::Raw => report.response.map(Value::to_string).unwrap_or_default(),
    }
}

pub fn print_call(report: &CallReport<'_>, format: OutputFormat) {
    let rendered = render_call(report, format);
    if !rendered.is_empty() {
        println!("{rendered}");
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_report_carries_response() {
        let value = json!({"hello": "world"});
        let report = CallReport::new(
            "unix:/tmp/s.sock".into(),
            "Echo",
            "sync",
            Duration::from_millis(3),
            Some(&value),
        );
        let parsed: Value = serde_json::from_str(&render_call(&report, OutputFormat::Json)).unwrap();
        assert_eq!(parsed["method"], "Echo");
        assert_eq!(parsed["channel"], "sync");
        assert_eq!(parsed["response"], value);
    }

    #[test]
    fn one_way_report_omits_response() {
        let report = CallReport::new("tcp:127.0.0.1:9010".into(), "Log", "mux", Duration::ZERO, None);
        let rendered = render_call(&report, OutputFormat::Json);
        assert!(!rendered.contains("response"));
        assert_eq!(render_call(&report, OutputFormat::Raw), "");
        assert!(render_call(&report, OutputFormat::Pretty).ends_with("(no response)"));
    }

    #[test]
    fn raw_is_compact_json() {
        let value = json!([1, 2]);
        let report = CallReport::new("e".into(), "Echo", "sync", Duration::ZERO, Some(&value));
        assert_eq!(render_call(&report, OutputFormat::Raw), "[1,2]");
    }
}

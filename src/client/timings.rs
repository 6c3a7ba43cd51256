use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Timeline of one `execute` call: when things happened, how long each
/// step took, and every error seen along the way.
#[derive(Debug, Clone)]
pub struct Timings {
    started: Instant,
    started_at: DateTime<Utc>,
    errors: Vec<(Duration, String)>,
    pub dns: Option<Duration>,
    pub connect: Option<Duration>,
    pub tls_handshake: Option<Duration>,
    pub write_header: Option<Duration>,
    pub write_body: Option<Duration>,
    /// Elapsed time at each successful transport read.
    pub read_chunks: Vec<Duration>,
    pub header_received: Option<Duration>,
    pub header_parsed: Option<Duration>,
    pub body_complete: Option<Duration>,
    pub request_hooks: Option<Duration>,
    pub response_hooks: Option<Duration>,
    pub restart_counter: u32,
}

impl Timings {
    pub fn start() -> Timings {
        Timings {
            started: Instant::now(),
            started_at: Utc::now(),
            errors: Vec::new(),
            dns: None,
            connect: None,
            tls_handshake: None,
            write_header: None,
            write_body: None,
            read_chunks: Vec::new(),
            header_received: None,
            header_parsed: None,
            body_complete: None,
            request_hooks: None,
            response_hooks: None,
            restart_counter: 0,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_error(&mut self, label: impl Into<String>) {
        self.errors.push((self.elapsed(), label.into()));
    }

    pub fn errors(&self) -> &[(Duration, String)] {
        &self.errors
    }

    pub fn record_read_chunk(&mut self) {
        let elapsed = self.elapsed();
        self.read_chunks.push(elapsed);
    }

    /// JSON view used in diagnostics and synthetic failure payloads.
    pub fn summary(&self) -> Value {
        let mut durations = Map::new();
        let named = [
            ("dns_ms", self.dns),
            ("connect_ms", self.connect),
            ("tls_handshake_ms", self.tls_handshake),
            ("write_header_ms", self.write_header),
            ("write_body_ms", self.write_body),
            ("header_received_ms", self.header_received),
            ("header_parsed_ms", self.header_parsed),
            ("body_complete_ms", self.body_complete),
            ("request_hooks_ms", self.request_hooks),
            ("response_hooks_ms", self.response_hooks),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                durations.insert(name.to_string(), json!(millis(value)));
            }
        }
        json!({
            "started_at": self.started_at.to_rfc3339(),
            "elapsed_ms": millis(self.elapsed()),
            "restarts": self.restart_counter,
            "reads": self.read_chunks.len(),
            "durations": durations,
            "errors": self
                .errors
                .iter()
                .map(|(at, label)| json!({"at_ms": millis(*at), "error": label}))
                .collect::<Vec<_>>(),
        })
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_appended_in_order() {
        let mut timings = Timings::start();
        timings.record_error("first");
        timings.record_error(String::from("second"));
        let labels: Vec<&str> = timings.errors().iter().map(|(_, l)| l.as_str()).collect();
        assert_eq!(labels, vec!["first", "second"]);
        assert!(timings.errors()[0].0 <= timings.errors()[1].0);
    }

    #[test]
    fn summary_lists_only_recorded_durations() {
        let mut timings = Timings::start();
        timings.dns = Some(Duration::from_millis(3));
        timings.restart_counter = 2;
        timings.record_read_chunk();
        timings.record_error("connect refused");

        let summary = timings.summary();
        assert_eq!(summary["restarts"], 2);
        assert_eq!(summary["reads"], 1);
        assert_eq!(summary["durations"]["dns_ms"], 3.0);
        assert!(summary["durations"].get("connect_ms").is_none());
        assert_eq!(summary["errors"][0]["error"], "connect refused");
    }
}

//! Metrics sink: formats and ships periodic stats in InfluxDB line-protocol
//! form (spec.md §4.8's `report_stats`).

use tracing::warn;

/// Where a formatted stats batch goes. `HttpStatsSink` posts it; `NullSink`
/// discards it when no `--influx-url` is configured.
pub trait StatsSink: Send + Sync {
    fn send(&self, line_protocol: &str);
}

pub struct NullSink;

impl StatsSink for NullSink {
    fn send(&self, _line_protocol: &str) {}
}

/// POSTs the line-protocol body to an InfluxDB-compatible HTTP endpoint.
/// Failures are logged and otherwise swallowed: a metrics outage must never
/// affect forwarding (spec.md §4.8).
pub struct HttpStatsSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpStatsSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            url: url.into(),
        }
    }
}

impl StatsSink for HttpStatsSink {
    fn send(&self, line_protocol: &str) {
        if let Err(err) = self
            .client
            .post(&self.url)
            .body(line_protocol.to_string())
            .send()
        {
            warn!(url = %self.url, error = %err, "failed to post stats");
        }
    }
}

/// One measurement line: `forward-epics-to-kafka,hostname=<h>,set=<i>
/// k1=v1,k2=v2,...` (spec.md §4.8, grounded in the original's
/// `report_status`/`report_stats` InfluxDB line format).
pub fn format_line(measurement: &str, tags: &[(&str, &str)], fields: &[(&str, u64)]) -> String {
    let mut line = String::from(measurement);
    for (k, v) in tags {
        line.push(',');
        line.push_str(k);
        line.push('=');
        line.push_str(v);
    }
    line.push(' ');
    let fields_str = fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str(&fields_str);
    line
}

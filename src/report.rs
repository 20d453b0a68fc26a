//! LMAP-style table for TCP throughput results.
//!
//! ```json
//! {
//!   "function": [{ "uri": "Priv_OWBTC_...", "role": ["client"] }],
//!   "column": ["sequence", "bits", "streams", "intervalMs", "direction"],
//!   "row": [{ "value": ["1", "1000000", "1", "1000", "download"] }]
//! }
//! ```
//!
//! Upload rows are measured by the server and arrive as pre-formed JSON; they
//! are checked against the column order and placed before the locally measured
//! download rows.

use std::fmt;

use log::warn;
use serde::Serialize;
use serde_json::Value;

/// Column names, in row value order.
pub const COLUMNS: [&str; 5] = ["sequence", "bits", "streams", "intervalMs", "direction"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "download" => Some(Direction::Download),
            "upload" => Some(Direction::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// One sample of a throughput stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputRow {
    pub sequence: u64,
    pub bits: u64,
    pub streams: u32,
    pub interval_ms: u64,
    pub direction: Direction,
}

impl ThroughputRow {
    /// Parses a `{"value": [...]}` element, accepting decimal strings or numbers.
    fn from_json(element: &Value) -> Option<Self> {
        let values = element.get("value")?.as_array()?;
        if values.len() != COLUMNS.len() {
            return None;
        }
        Some(ThroughputRow {
            sequence: json_u64(&values[0])?,
            bits: json_u64(&values[1])?,
            streams: u32::try_from(json_u64(&values[2])?).ok()?,
            interval_ms: json_u64(&values[3])?,
            direction: Direction::parse(values[4].as_str()?)?,
        })
    }

    fn to_cells(self) -> ReportRow {
        ReportRow {
            value: [
                self.sequence.to_string(),
                self.bits.to_string(),
                self.streams.to_string(),
                self.interval_ms.to_string(),
                self.direction.to_string(),
            ],
        }
    }
}

fn json_u64(v: &Value) -> Option<u64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// One locally measured download sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadResult {
    pub bytes: u64,
    pub nstreams: u32,
    /// Sample length in microseconds.
    pub interval_us: u64,
}

/// Measurement settings that end up in the metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasureContext {
    pub sample_period_ms: u32,
    pub test_duration_s: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportFunction {
    pub uri: String,
    pub role: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub value: [String; 5],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportTable {
    pub function: Vec<ReportFunction>,
    pub column: Vec<String>,
    pub row: Vec<ReportRow>,
}

#[must_use]
pub fn metric_name(ctx: &MeasureContext) -> String {
    format!(
        "Priv_OWBTC_Active_TCP-SustainedBurst-MultipleStreams-TCPOptsUndefined-\
         SamplePeriodMs{}-StreamDurationMs{}000__Multiple_Raw",
        ctx.sample_period_ms, ctx.test_duration_s
    )
}

/// Builds the table from the server's upload rows and local download results.
///
/// Anything but an array for `upload` is ignored with a warning, as is every
/// array element that does not follow the column layout.
#[must_use]
pub fn create_report(
    upload: Option<Value>,
    downloads: &[DownloadResult],
    ctx: &MeasureContext,
) -> ReportTable {
    let mut rows = Vec::with_capacity(downloads.len());

    match upload {
        Some(Value::Array(elements)) => {
            for (i, element) in elements.iter().enumerate() {
                match ThroughputRow::from_json(element) {
                    Some(row) => rows.push(row.to_cells()),
                    None => warn!("Dropping malformed upload result #{}: {}", i + 1, element),
                }
            }
        }
        _ => warn!("Received unusable data from server, ignoring..."),
    }

    rows.extend(downloads.iter().zip(1u64..).map(|(d, sequence)| {
        ThroughputRow {
            sequence,
            bits: d.bytes.saturating_mul(8),
            streams: d.nstreams,
            interval_ms: d.interval_us / 1000,
            direction: Direction::Download,
        }
        .to_cells()
    }));

    ReportTable {
        function: vec![ReportFunction {
            uri: metric_name(ctx),
            role: vec!["client".to_string()],
        }],
        column: COLUMNS.iter().map(|c| c.to_string()).collect(),
        row: rows,
    }
}

/// Parses the upload JSON text and pretty-prints the resulting table.
///
/// Unparseable upload text is handled like a non-array value.
///
/// # Errors
/// Only if the table itself cannot be serialized.
pub fn render_report(
    upload_json: &str,
    downloads: &[DownloadResult],
    ctx: &MeasureContext,
) -> Result<String, serde_json::Error> {
    let upload = serde_json::from_str::<Value>(upload_json).ok();
    serde_json::to_string_pretty(&create_report(upload, downloads, ctx))
}

//! Tagged lines that a running job writes into its captured stderr.
//!
//! Every marker occupies one line: `%pipeq <action> <json payload>`. Everything else in the
//! stream is the job's own output and is ignored by the decoder.
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::model::ExecutionStatus;

pub const MARKER_PREFIX: &str = "%pipeq";

pub type JsonMap = serde_json::Map<String, Value>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarkerAction {
    Status,
    Stats,
    Environ,
    Results,
}

impl MarkerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerAction::Status => "status",
            MarkerAction::Stats => "stats",
            MarkerAction::Environ => "environ",
            MarkerAction::Results => "results",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "status" => Some(MarkerAction::Status),
            "stats" => Some(MarkerAction::Stats),
            "environ" => Some(MarkerAction::Environ),
            "results" => Some(MarkerAction::Results),
            _ => None,
        }
    }
}

impl Display for MarkerAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats a single marker line, without the trailing newline.
pub fn encode<T: Serialize + ?Sized>(action: MarkerAction, payload: &T) -> crate::Result<String> {
    Ok(format!(
        "{MARKER_PREFIX} {action} {}",
        serde_json::to_string(payload)?
    ))
}

pub fn encode_status(status: ExecutionStatus) -> String {
    format!("{MARKER_PREFIX} {} \"{status}\"", MarkerAction::Status)
}

pub fn write_marker<W: Write, T: Serialize + ?Sized>(
    writer: &mut W,
    action: MarkerAction,
    payload: &T,
) -> crate::Result<()> {
    writeln!(writer, "{}", encode(action, payload)?)?;
    Ok(())
}

/// Appends a marker line to a log file, creating the file when needed.
pub fn append_marker<T: Serialize + ?Sized>(
    path: &Path,
    action: MarkerAction,
    payload: &T,
) -> crate::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    write_marker(&mut file, action, payload)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub action: MarkerAction,
    pub payload: Value,
}

/// Scans `text` for marker lines. The prefix may appear anywhere on a line.
/// Lines with a malformed payload are skipped.
pub fn parse_markers(text: &str) -> impl Iterator<Item = Marker> + '_ {
    text.lines().filter_map(parse_line)
}

fn parse_line(line: &str) -> Option<Marker> {
    let start = line.find(MARKER_PREFIX)?;
    let rest = line[start + MARKER_PREFIX.len()..].strip_prefix(' ')?;
    let (action, payload) = rest.split_once(' ')?;
    let action = MarkerAction::parse(action)?;
    match serde_json::from_str(payload.trim_end()) {
        Ok(payload) => Some(Marker { action, payload }),
        Err(error) => {
            log::warn!("Ignoring malformed {action} marker: {error}");
            None
        }
    }
}

/// Job state reconstructed from its marker stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusRecord {
    /// The last written status.
    pub status: Option<ExecutionStatus>,
    /// Key-wise merge of every `stats` payload.
    pub stats: JsonMap,
    /// The first `environ` payload.
    pub environ: Option<JsonMap>,
    /// Results deduplicated by name and sorted by name.
    pub results: Vec<JsonMap>,
}

impl StatusRecord {
    pub fn environ_or_empty(&self) -> JsonMap {
        self.environ.clone().unwrap_or_default()
    }

    pub fn stat_f64(&self, key: &str) -> Option<f64> {
        self.stats.get(key).and_then(Value::as_f64)
    }
}

pub fn decode(text: &str) -> StatusRecord {
    let mut record = StatusRecord::default();
    let mut results: Vec<(String, JsonMap)> = vec![];

    for marker in parse_markers(text) {
        match marker.action {
            MarkerAction::Status => match serde_json::from_value(marker.payload) {
                Ok(status) => record.status = Some(status),
                Err(error) => log::warn!("Ignoring unknown status marker: {error}"),
            },
            MarkerAction::Stats => match marker.payload {
                Value::Object(stats) => record.stats.extend(stats),
                other => log::warn!("Ignoring stats marker that is not an object: {other}"),
            },
            MarkerAction::Environ => {
                if record.environ.is_none() {
                    if let Value::Object(environ) = marker.payload {
                        record.environ = Some(environ);
                    }
                }
            }
            MarkerAction::Results => {
                let items = match marker.payload {
                    Value::Array(items) => items,
                    item => vec![item],
                };
                for item in items {
                    let result = normalize_result(item, results.len());
                    let name = result
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    match results.iter_mut().find(|(n, _)| *n == name) {
                        Some(entry) => entry.1 = result,
                        None => results.push((name, result)),
                    }
                }
            }
        }
    }

    results.sort_by(|a, b| a.0.cmp(&b.0));
    record.results = results.into_iter().map(|(_, result)| result).collect();
    record
}

/// Turns a result payload into an object with a `name`.
///
/// A non-object payload is a text result pointing to a file. A missing name is taken from the
/// file name of `path`, otherwise it is `#<index>`.
fn normalize_result(item: Value, index: usize) -> JsonMap {
    let mut result = match item {
        Value::Object(map) => map,
        path => {
            let mut map = JsonMap::new();
            map.insert("type".to_string(), Value::String("text".to_string()));
            map.insert("path".to_string(), path);
            map
        }
    };
    if !result.get("name").is_some_and(Value::is_string) {
        let name = result
            .get("path")
            .and_then(Value::as_str)
            .and_then(|path| Path::new(path).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("#{index}"));
        result.insert("name".to_string(), Value::String(name));
    }
    result
}

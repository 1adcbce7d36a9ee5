//! Tolerant parser for newline-delimited JSON streams.
//!
//! The Agent CLI is supposed to print one JSON object per line, but a killed
//! process leaves a truncated tail and some CLI builds concatenate objects on
//! a single line. The parser therefore tries a strict per-line parse first
//! and falls back to balanced-object extraction: a scan that tracks string
//! and escape state plus brace/bracket depth and emits every substring that
//! forms a complete object at depth zero. Unparseable remainders are dropped
//! with a warning, never corrupted into partial records.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Parser failure. Raised only when a complete stream yields zero records.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("stream output truncated: no complete JSON records found")]
    Truncated,
}

/// The result of parsing a complete stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    /// Records in stream order.
    pub records: Vec<Value>,
    /// True when some input had to be discarded (truncated tail or
    /// unparseable fragments between salvaged objects).
    pub partial: bool,
}

/// Incremental line-buffered parser.
///
/// Feed decoded chunks with [`feed`](Self::feed); complete lines are parsed
/// as they arrive and a trailing partial line is carried until the next chunk
/// or [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct StreamJsonParser {
    carry: String,
    records: Vec<Value>,
    dropped_fragments: usize,
}

impl StreamJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of decoded stream text.
    ///
    /// Returns the records completed by this chunk, in order. The same
    /// records are also retained internally for [`finish`](Self::finish).
    pub fn feed(&mut self, chunk: &str) -> Vec<Value> {
        self.carry.push_str(chunk);

        let mut new_records = Vec::new();
        while let Some(newline) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (mut records, dropped) = parse_line(line);
            if dropped {
                self.dropped_fragments += 1;
            }
            new_records.append(&mut records);
        }

        self.records.extend(new_records.iter().cloned());
        new_records
    }

    /// Declare the stream complete and return everything salvaged.
    ///
    /// A partial final line gets one last extraction pass; if it still holds
    /// no complete object it is dropped and the outcome is marked partial.
    /// Fails only when the whole stream produced zero records.
    pub fn finish(mut self) -> Result<ParseOutcome, ParseError> {
        let remainder = std::mem::take(&mut self.carry);
        let remainder = remainder.trim();
        if !remainder.is_empty() {
            let (records, _) = parse_line(remainder);
            if records.is_empty() {
                warn!(
                    fragment_len = remainder.len(),
                    "dropping truncated trailing fragment"
                );
                self.dropped_fragments += 1;
            } else {
                self.records.extend(records);
            }
        }

        if self.records.is_empty() {
            return Err(ParseError::Truncated);
        }

        Ok(ParseOutcome {
            records: self.records,
            partial: self.dropped_fragments > 0,
        })
    }

    /// Number of records salvaged so far.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Parse a complete blob in one call.
pub fn parse_complete(text: &str) -> Result<ParseOutcome, ParseError> {
    let mut parser = StreamJsonParser::new();
    parser.feed(text);
    parser.finish()
}

/// Parse one line: strict parse first, balanced extraction on failure.
/// Returns the records found and whether anything was dropped.
fn parse_line(line: &str) -> (Vec<Value>, bool) {
    if let Ok(value) = serde_json::from_str::<Value>(line) {
        return (vec![value], false);
    }

    let (objects, leftover) = extract_balanced_objects(line);
    let mut records = Vec::new();
    for object in &objects {
        match serde_json::from_str::<Value>(object) {
            Ok(value) => records.push(value),
            Err(error) => {
                warn!(%error, "balanced extraction produced invalid JSON, dropping");
            }
        }
    }

    let dropped = leftover || records.len() != objects.len();
    if dropped {
        warn!(
            line_len = line.len(),
            salvaged = records.len(),
            "discarding unparseable stream fragment"
        );
    }
    (records, dropped)
}

/// Scan a line and return every substring forming a complete JSON object at
/// depth zero, plus whether any characters were left over.
///
/// String state respects backslash escapes exactly; brackets contribute to
/// depth so objects nested in arrays do not terminate early.
fn extract_balanced_objects(line: &str) -> (Vec<String>, bool) {
    let mut objects = Vec::new();
    let mut leftover = false;

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut start: Option<usize> = None;

    for (index, ch) in line.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            '[' => {
                // Top-level arrays are not objects; only track them inside a
                // candidate so nested structures balance correctly.
                if start.is_some() {
                    depth += 1;
                } else {
                    leftover = true;
                }
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        objects.push(line[begin..=index].to_string());
                    }
                } else if depth < 0 {
                    // Stray closer outside any candidate.
                    depth = 0;
                    leftover = true;
                }
            }
            ']' => {
                if start.is_some() {
                    depth -= 1;
                    if depth <= 0 {
                        // Unbalanced bracket inside a candidate; abandon it.
                        start = None;
                        depth = 0;
                        leftover = true;
                    }
                }
            }
            _ => {
                if start.is_none() && !ch.is_whitespace() {
                    leftover = true;
                }
            }
        }
    }

    // An open candidate at end of line is a truncated object.
    if start.is_some() || in_string {
        leftover = true;
    }

    (objects, leftover)
}

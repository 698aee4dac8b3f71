//! Multiline-aware line parser: splits a raw buffer into logical records
//! using a configurable begin-regex, handing each complete record's raw text
//! to a caller-supplied timestamp extractor.
//!
//! This is deliberately narrow — full per-log-type decoding (JSON, regex key
//! extraction, timeformat parsing) is out of scope (§1); this module only
//! covers multiline grouping, the one piece of "parsing" the reader state
//! machine structurally depends on.

use crate::model::LogRecord;
use crate::reader::log_file_reader::LineParser;
use regex::Regex;
use std::path::PathBuf;

/// Extracts a record timestamp from its raw text; falls back to
/// `base_timestamp` (typically "now") when extraction fails or isn't wired
/// up, matching the reader's "no extractable timestamp" fallback.
pub trait TimestampExtractor: Send + Sync {
    fn extract(&self, raw: &str, base_timestamp: i64) -> i64;
}

pub struct NoopTimestampExtractor;

impl TimestampExtractor for NoopTimestampExtractor {
    fn extract(&self, _raw: &str, base_timestamp: i64) -> i64 {
        base_timestamp
    }
}

/// Splits on a multiline begin-regex: every line matching `begin_regex`
/// starts a new record; subsequent non-matching lines are appended to it.
/// Without a configured regex, every newline starts a new record (the
/// degenerate single-line case).
pub struct MultilineParser {
    begin_regex: Option<Regex>,
    timestamp_extractor: Box<dyn TimestampExtractor>,
}

impl MultilineParser {
    pub fn new(begin_regex: Option<Regex>, timestamp_extractor: Box<dyn TimestampExtractor>) -> Self {
        MultilineParser {
            begin_regex,
            timestamp_extractor,
        }
    }

    pub fn single_line() -> Self {
        MultilineParser {
            begin_regex: None,
            timestamp_extractor: Box::new(NoopTimestampExtractor),
        }
    }

    fn is_begin(&self, line: &str) -> bool {
        match &self.begin_regex {
            Some(re) => re.is_match(line),
            None => true,
        }
    }
}

impl LineParser for MultilineParser {
    fn parse(&self, buffer: &[u8], source_path: &PathBuf, topic: &str, base_timestamp: i64) -> (Vec<LogRecord>, usize) {
        let text = String::from_utf8_lossy(buffer);

        // Without a begin-regex every terminated line is independently
        // complete — no lookahead needed to know it won't grow a
        // continuation line.
        if self.begin_regex.is_none() {
            let mut records = Vec::new();
            let mut consumed = 0usize;
            for line in text.split_inclusive('\n') {
                if !line.ends_with('\n') {
                    break;
                }
                let trimmed = line.trim_end_matches('\n').to_string();
                records.push(self.build_record(trimmed, source_path, topic, base_timestamp));
                consumed += line.len();
            }
            return (records, consumed);
        }

        // With a begin-regex, a record isn't known complete until the next
        // begin-line (or a forced flush) closes it, so the most recently
        // opened record always stays buffered across this call.
        let mut records = Vec::new();
        let mut consumed = 0usize;
        let mut current: Option<String> = None;
        let mut byte_pos = 0usize;

        for line in text.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break;
            }
            let trimmed = line.trim_end_matches('\n');
            if self.is_begin(trimmed) {
                if let Some(acc) = current.take() {
                    records.push(self.build_record(acc, source_path, topic, base_timestamp));
                    consumed = byte_pos;
                }
                current = Some(trimmed.to_string());
            } else if let Some(acc) = current.as_mut() {
                acc.push('\n');
                acc.push_str(trimmed);
            }
            byte_pos += line.len();
        }

        (records, consumed)
    }
}

impl MultilineParser {
    fn build_record(&self, raw: String, source_path: &PathBuf, topic: &str, base_timestamp: i64) -> LogRecord {
        let timestamp = self.timestamp_extractor.extract(&raw, base_timestamp);
        let raw_size = raw.len();
        LogRecord {
            timestamp,
            source_path: source_path.clone(),
            topic: topic.to_string(),
            contents: vec![("content".to_string(), raw)],
            raw_size,
        }
    }
}

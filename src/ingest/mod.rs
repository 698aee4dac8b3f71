//! Narrow-contract record parsing: multiline grouping only (§1 ambient-stack
//! clarification). Full per-log-type decoding is an external collaborator's
//! job; this module exists so the reader state machine has something real to
//! call.

pub mod parser;

pub use parser::{MultilineParser, NoopTimestampExtractor, TimestampExtractor};

//! Multiline record stitching.
//!
//! [`Stitcher`] is a two-state automaton. In `Idle` it waits for a start
//! line; in `Accumulating` it appends continuation lines to the open record.
//! A line that is neither a continuation of an open record nor a start line
//! closes the open record and is emitted on its own. There is no lookahead.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Lines that plausibly begin a new record: a leading timestamp or an
/// exception/panic header.
static START_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?:",
        r"\[?\d{4}[-/]\d{2}[-/]\d{2}",
        r"|[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}",
        r"|Traceback \(most recent call last\)",
        r"|(?:[\w$]+\.)*[\w$]*(?:Exception|Error)\b",
        r"|panic:",
        r"|goroutine \d+ \[",
        r"|thread '[^']*' panicked",
        r")"
    ))
    .unwrap_or_else(|_| unreachable!())
});

/// Lines that continue an open record: indentation or stack-frame prefixes.
static CONTINUATION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[ \t]+\S|\s*(?:at|in|from)\s|\s*Caused by:|\s*\.\.\. \d+ more)")
        .unwrap_or_else(|_| unreachable!())
});

/// Returns true if the line looks like the first line of a record.
#[must_use]
pub fn is_start_line(line: &str) -> bool {
    START_LINE.is_match(line)
}

/// Returns true if the line looks like the continuation of a record.
#[must_use]
pub fn is_continuation_line(line: &str) -> bool {
    CONTINUATION_LINE.is_match(line)
}

/// A physical line with an optional timestamp supplied by its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Line text without the trailing newline.
    pub text: String,
    /// Timestamp reported by the source, if any.
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawLine {
    /// Creates a line with no source timestamp.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: None,
        }
    }

    /// Creates a line carrying a source timestamp.
    #[must_use]
    pub fn with_timestamp(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            timestamp: Some(timestamp),
        }
    }
}

/// Automaton state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    Accumulating(RawLine),
}

/// Stitches physical lines into logical records.
#[derive(Debug, Default)]
pub struct Stitcher {
    state: State,
}

impl Stitcher {
    /// Creates an idle stitcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a record is open.
    #[must_use]
    pub const fn is_accumulating(&self) -> bool {
        matches!(self.state, State::Accumulating(_))
    }

    /// Feeds one line, returning the records it completes (zero, one or two).
    pub fn push(&mut self, line: RawLine) -> Vec<RawLine> {
        let mut completed = Vec::new();

        if let State::Accumulating(open) = &mut self.state {
            if is_continuation_line(&line.text) {
                open.text.push('\n');
                open.text.push_str(&line.text);
                return completed;
            }
        }

        if let State::Accumulating(open) = std::mem::take(&mut self.state) {
            completed.push(open);
        }

        if is_start_line(&line.text) {
            self.state = State::Accumulating(line);
        } else {
            completed.push(line);
        }
        completed
    }

    /// Closes the open record, if any.
    pub fn finish(&mut self) -> Option<RawLine> {
        match std::mem::take(&mut self.state) {
            State::Accumulating(open) => Some(open),
            State::Idle => None,
        }
    }

    /// Stitches a whole batch and closes it.
    pub fn stitch_all(&mut self, lines: impl IntoIterator<Item = RawLine>) -> Vec<RawLine> {
        let mut records = Vec::new();
        for line in lines {
            records.extend(self.push(line));
        }
        records.extend(self.finish());
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn texts(records: &[RawLine]) -> Vec<&str> {
        records.iter().map(|r| r.text.as_str()).collect()
    }

    // ===========================================
    // Classifier Tests
    // ===========================================

    #[test_case("2024-01-01 ERROR boom" ; "iso date")]
    #[test_case("2024-01-01T10:00:00Z started" ; "rfc3339")]
    #[test_case("[2024/01/01 10:00:00] msg" ; "bracketed")]
    #[test_case("Jan  5 10:00:00 host sshd[1]: hi" ; "syslog")]
    #[test_case("Traceback (most recent call last):" ; "python traceback")]
    #[test_case("java.lang.IllegalStateException: bad" ; "java exception")]
    #[test_case("panic: runtime error" ; "go panic")]
    #[test_case("thread 'main' panicked at src/main.rs:1:1" ; "rust panic")]
    fn start_lines(line: &str) {
        assert!(is_start_line(line));
    }

    #[test_case("plain message" ; "plain")]
    #[test_case("  at foo.bar" ; "indented")]
    fn not_start_lines(line: &str) {
        assert!(!is_start_line(line));
    }

    #[test_case("  at foo.bar" ; "java frame")]
    #[test_case("\tat com.example.Main.run(Main.java:10)" ; "tab frame")]
    #[test_case("  File \"app.py\", line 3, in <module>" ; "python frame")]
    #[test_case("Caused by: java.io.IOException" ; "caused by")]
    #[test_case("\t... 12 more" ; "elided frames")]
    fn continuation_lines(line: &str) {
        assert!(is_continuation_line(line));
    }

    #[test]
    fn unindented_text_is_not_continuation() {
        assert!(!is_continuation_line("next record"));
    }

    // ===========================================
    // Automaton Tests
    // ===========================================

    #[test]
    fn stack_trace_is_stitched() {
        let mut stitcher = Stitcher::new();
        let records = stitcher.stitch_all([
            RawLine::new("2024-01-01 ERROR boom"),
            RawLine::new("  at foo.bar"),
        ]);
        assert_eq!(texts(&records), vec!["2024-01-01 ERROR boom\n  at foo.bar"]);
    }

    #[test]
    fn continuation_without_open_record_stands_alone() {
        let mut stitcher = Stitcher::new();
        let records = stitcher.stitch_all([RawLine::new("  at foo.bar")]);
        assert_eq!(texts(&records), vec!["  at foo.bar"]);
    }

    #[test]
    fn new_start_line_flushes_open_record() {
        let mut stitcher = Stitcher::new();
        assert!(stitcher.push(RawLine::new("2024-01-01 first")).is_empty());
        assert!(stitcher.is_accumulating());

        let done = stitcher.push(RawLine::new("2024-01-01 second"));
        assert_eq!(texts(&done), vec!["2024-01-01 first"]);
        assert!(stitcher.is_accumulating());

        assert_eq!(
            stitcher.finish().map(|r| r.text),
            Some("2024-01-01 second".to_string())
        );
        assert!(!stitcher.is_accumulating());
    }

    #[test]
    fn plain_line_flushes_and_emits_itself() {
        let mut stitcher = Stitcher::new();
        stitcher.push(RawLine::new("2024-01-01 start"));
        let done = stitcher.push(RawLine::new("unrelated"));
        assert_eq!(texts(&done), vec!["2024-01-01 start", "unrelated"]);
        assert!(!stitcher.is_accumulating());
    }

    #[test]
    fn finish_when_idle_is_none() {
        let mut stitcher = Stitcher::new();
        assert!(stitcher.finish().is_none());
    }

    #[test]
    fn open_record_keeps_first_line_timestamp() {
        let ts = Utc::now();
        let mut stitcher = Stitcher::new();
        let records = stitcher.stitch_all([
            RawLine::with_timestamp("panic: oh no", ts),
            RawLine::new("\tgoroutine frames"),
        ]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, Some(ts));
    }
}

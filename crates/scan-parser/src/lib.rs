//! Scan Output Parser (C2): translates a byte stream into a lazy sequence of
//! typed events. Pure, no I/O, restartable from any byte offset given the
//! high-water-mark from the container runner.

mod progress;

use std::collections::{HashSet, VecDeque};

use regex::Regex;
use scan_core::{FindingId, JobId, ScanFinding};
use std::sync::OnceLock;
use tracing::warn;

pub use progress::lookup_progress;

const LOOP_WINDOW: usize = 20;
const LOOP_UNIQUE_RATIO: f64 = 0.5;

fn finding_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[([^\]]+)\]\s+\[([^\]]+)\]\s+\[([^\]]+)\]\s+(\S+)\s*(.*)$").expect("static regex is valid")
    })
}

#[derive(Debug, Clone)]
pub enum ParseEvent {
    Finding(ScanFinding),
    Progress { percent: u8, raw_line: String },
    Raw(String),
    /// Terminal: the consumer must treat the job as fatally stuck.
    LoopDetected,
}

/// Stateful, pure line-oriented parser for one scan's output stream.
///
/// All state needed to resume parsing from an arbitrary byte offset lives
/// here; the caller is responsible for feeding lines starting at the
/// high-water-mark it has already processed.
pub struct ScanParser {
    job_id: JobId,
    seen_finding_ids: HashSet<FindingId>,
    recent_lines: VecDeque<String>,
    total_lines: u64,
    last_percent: u8,
    loop_detected: bool,
}

impl ScanParser {
    #[must_use]
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            seen_finding_ids: HashSet::new(),
            recent_lines: VecDeque::with_capacity(LOOP_WINDOW),
            total_lines: 0,
            last_percent: 0,
            loop_detected: false,
        }
    }

    /// Feed a single line (without trailing newline), tagged with its byte
    /// offset in the combined log stream, and produce at most one event.
    ///
    /// `offset` makes `finding_id` stable across stream resumption: when C1
    /// redelivers bytes already seen (best-effort resume from a high-water
    /// mark), the same line arrives at the same offset and hashes to the
    /// same `finding_id`, so it is suppressed rather than double-counted.
    /// Returns `None` for duplicate findings (already emitted for this
    /// `job_id`) and for lines consumed after a loop has already been
    /// reported.
    pub fn parse_line(&mut self, line: &str, offset: u64) -> Option<ParseEvent> {
        if self.loop_detected {
            return None;
        }

        self.total_lines += 1;
        self.track_loop_window(line);
        if self.loop_detected {
            return Some(ParseEvent::LoopDetected);
        }

        if let Some(captures) = finding_regex().captures(line) {
            let template_id = captures[1].to_string();
            let protocol = captures[2].to_string();
            let raw_severity = captures[3].to_string();
            let target = captures[4].to_string();
            let details_raw = captures[5].trim().to_string();
            // Derived from the stream offset, not wall-clock time: the text
            // grammar carries no timestamp, and idempotent replay requires
            // the same line at the same offset to hash identically.
            let matched_at = format!("offset:{offset}");

            let finding = ScanFinding::new(
                self.job_id,
                template_id,
                protocol,
                &raw_severity,
                target,
                matched_at,
                if details_raw.is_empty() { vec![] } else { vec![details_raw] },
            );

            if !self.seen_finding_ids.insert(finding.finding_id.clone()) {
                return None;
            }
            return Some(ParseEvent::Finding(finding));
        }

        if let Some(table_percent) = lookup_progress(line) {
            self.last_percent = self.last_percent.max(table_percent);
            return Some(ParseEvent::Progress { percent: self.last_percent, raw_line: line.to_string() });
        }

        Some(ParseEvent::Raw(line.to_string()))
    }

    fn track_loop_window(&mut self, line: &str) {
        if self.recent_lines.len() == LOOP_WINDOW {
            self.recent_lines.pop_front();
        }
        self.recent_lines.push_back(line.to_string());

        if self.recent_lines.len() == LOOP_WINDOW && self.total_lines > (2 * LOOP_WINDOW) as u64 {
            let unique: HashSet<&String> = self.recent_lines.iter().collect();
            let ratio = unique.len() as f64 / LOOP_WINDOW as f64;
            if ratio < LOOP_UNIQUE_RATIO {
                warn!(job_id = %self.job_id, total_lines = self.total_lines, ratio, "loop detected in scan output");
                self.loop_detected = true;
            }
        }
    }

    #[must_use]
    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_line_produces_finding_event() {
        let mut parser = ScanParser::new(JobId::new());
        let event = parser
            .parse_line("[CVE-2024-0001] [http] [high] https://example.com some detail here", 0)
            .unwrap();
        match event {
            ParseEvent::Finding(f) => {
                assert_eq!(f.template_id, "CVE-2024-0001");
                assert_eq!(f.protocol, "http");
                assert_eq!(f.target, "https://example.com");
            }
            other => panic!("expected Finding, got {other:?}"),
        }
    }

    #[test]
    fn redelivered_line_at_same_offset_is_suppressed() {
        let mut parser = ScanParser::new(JobId::new());
        let line = "[CVE-2024-0001] [http] [high] https://example.com detail";
        assert!(parser.parse_line(line, 128).is_some());
        // Simulates C1 redelivering bytes already seen after a reconnect.
        assert!(parser.parse_line(line, 128).is_none());
    }

    #[test]
    fn same_line_at_a_new_offset_is_a_distinct_finding() {
        let mut parser = ScanParser::new(JobId::new());
        let line = "[CVE-2024-0001] [http] [high] https://example.com detail";
        assert!(parser.parse_line(line, 0).is_some());
        assert!(parser.parse_line(line, 512).is_some());
    }

    #[test]
    fn progress_prefix_maps_to_table_percent() {
        let mut parser = ScanParser::new(JobId::new());
        let event = parser.parse_line("[INF] Creating runners for template groups", 0).unwrap();
        match event {
            ParseEvent::Progress { percent, .. } => assert_eq!(percent, 30),
            other => panic!("expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn percent_is_monotonically_non_decreasing() {
        let mut parser = ScanParser::new(JobId::new());
        parser.parse_line("[INF] New Scan Started", 0).unwrap();
        let second = parser.parse_line("[INF] Creating runners", 40).unwrap();
        match second {
            ParseEvent::Progress { percent, .. } => assert_eq!(percent, 70),
            other => panic!("expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_line_is_raw() {
        let mut parser = ScanParser::new(JobId::new());
        let event = parser.parse_line("just some noise on stdout", 0).unwrap();
        assert!(matches!(event, ParseEvent::Raw(_)));
    }

    #[test]
    fn repeated_identical_lines_trigger_loop_detection() {
        let mut parser = ScanParser::new(JobId::new());
        let mut last = None;
        for i in 0..45u64 {
            last = parser.parse_line("retrying connection", i * 20);
        }
        assert!(matches!(last, Some(ParseEvent::LoopDetected)));
    }

    #[test]
    fn varied_lines_do_not_trigger_loop_detection() {
        let mut parser = ScanParser::new(JobId::new());
        for i in 0..45u64 {
            let line = format!("line number {i}");
            let event = parser.parse_line(&line, i * 20);
            assert!(!matches!(event, Some(ParseEvent::LoopDetected)));
        }
    }
}

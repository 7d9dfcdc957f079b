//! Rendering of the final summary.

use std::fmt;

use clap::ValueEnum;
use serde::Serialize;

use crate::fallback::FixPolicy;
use crate::stats::Summary;
use crate::AuditError;

/// Supported summary formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SummaryFormat {
    /// Fixed-layout text block (default)
    #[default]
    Text,
    /// One JSON document
    Json,
}

impl fmt::Display for SummaryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryFormat::Text => write!(f, "text"),
            SummaryFormat::Json => write!(f, "json"),
        }
    }
}

/// What was audited and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunHeader {
    pub file: String,
    pub threads: usize,
    pub fix_valid: bool,
    pub fix_troll: bool,
}

impl RunHeader {
    pub fn new(file: impl Into<String>, threads: usize, fix: FixPolicy) -> Self {
        Self {
            file: file.into(),
            threads,
            fix_valid: fix.fix_valid,
            fix_troll: fix.fix_troll,
        }
    }
}

impl fmt::Display for RunHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "file: {}", self.file)?;
        write!(
            f,
            "threads: {}  fix valid: {}  fix troll: {}",
            self.threads, self.fix_valid as u8, self.fix_troll as u8
        )
    }
}

#[derive(Serialize)]
struct SummaryJson<'a> {
    #[serde(flatten)]
    header: &'a RunHeader,
    summary: &'a Summary,
}

/// Render the summary of one run.
pub fn render(format: SummaryFormat, header: &RunHeader, summary: &Summary) -> Result<String, AuditError> {
    match format {
        SummaryFormat::Text => Ok(format!("\nSummary:\n\n{header}\n\n{summary}\n")),
        SummaryFormat::Json => {
            let doc = SummaryJson { header, summary };
            Ok(serde_json::to_string_pretty(&doc)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{SizeTally, Statistics};

    fn sample() -> (RunHeader, Summary) {
        let stats = Statistics::new();
        stats.record_gap(16);
        stats.record_overlap();
        (RunHeader::new("/bin/true", 4, FixPolicy::VALID), stats.summary())
    }

    #[test]
    fn test_text_layout() {
        let (header, summary) = sample();
        let out = render(SummaryFormat::Text, &header, &summary).unwrap();

        assert!(out.starts_with("\nSummary:\n\nfile: /bin/true\nthreads: 4  fix valid: 1  fix troll: 0\n\nfuncs: 0"));
        assert!(out.contains("under 64:        1    size:         16\n"));
        assert!(out.ends_with("num blocks overlap:  1\n"));
    }

    #[test]
    fn test_json_document() {
        let (header, summary) = sample();
        let out = render(SummaryFormat::Json, &header, &summary).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&out).unwrap();

        assert_eq!(doc["file"], "/bin/true");
        assert_eq!(doc["threads"], 4);
        assert_eq!(doc["fix_valid"], true);
        assert_eq!(doc["fix_troll"], false);
        assert_eq!(doc["summary"]["overlaps"], 1);
        assert_eq!(doc["summary"]["gaps"]["under_64"]["size"], 16);
        assert_eq!(summary.gaps.total, SizeTally { count: 1, size: 16 });
    }

    #[test]
    fn test_json_errors_have_their_own_variant() {
        let err: AuditError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, AuditError::Serialize(_)));
    }

    #[test]
    fn test_format_names() {
        assert_eq!(SummaryFormat::default(), SummaryFormat::Text);
        assert_eq!(SummaryFormat::Json.to_string(), "json");
        assert_eq!(SummaryFormat::from_str("json", true).unwrap(), SummaryFormat::Json);
    }
}

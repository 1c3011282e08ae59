//! Conversion job bookkeeping

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use super::router::{file_stem, BackendClass, OUTPUT_EXTENSION};

/// Where a request currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    ReceivingUpload,
    Validating,
    Converting,
    StreamingResult,
    Succeeded,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::ReceivingUpload => "receiving_upload",
            JobPhase::Validating => "validating",
            JobPhase::Converting => "converting",
            JobPhase::StreamingResult => "streaming_result",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One request's conversion attempt
#[derive(Debug)]
pub struct ConversionJob {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    started: Instant,
    phase: JobPhase,
    pub file_name: Option<String>,
    pub input_size: u64,
    pub backend: Option<BackendClass>,
    pub deadline: Option<Instant>,
    pub artifact: Option<PathBuf>,
}

impl ConversionJob {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            started: Instant::now(),
            phase: JobPhase::ReceivingUpload,
            file_name: None,
            input_size: 0,
            backend: None,
            deadline: None,
            artifact: None,
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// Move to `next`. Terminal phases are final.
    pub fn advance(&mut self, next: JobPhase) {
        if self.is_terminal() {
            return;
        }
        tracing::trace!(job_id = %self.id, from = %self.phase, to = %next, "Job phase change");
        self.phase = next;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, JobPhase::Succeeded | JobPhase::Failed)
    }

    /// Arrival time as RFC 3339 UTC, for outcome logs
    pub fn received_at_rfc3339(&self) -> String {
        self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Name offered to the client for the rendered file
    pub fn download_name(&self) -> String {
        let stem = self
            .file_name
            .as_deref()
            .map(file_stem)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("document");
        format!("{}.{}", stem, OUTPUT_EXTENSION)
    }
}

impl Default for ConversionJob {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_at_is_logged_as_utc() {
        let before = Utc::now();
        let job = ConversionJob::new();

        let stamp = job.received_at_rfc3339();
        assert!(stamp.ends_with('Z'));
        let parsed = DateTime::parse_from_rfc3339(&stamp).unwrap();
        assert!(parsed.timestamp_millis() >= before.timestamp_millis());
        assert!(parsed.timestamp_millis() <= Utc::now().timestamp_millis());
    }

    #[test]
    fn test_download_name_ignores_extension_case() {
        for name in ["report.hwp", "report.HWP", "report.Hwp"] {
            let mut job = ConversionJob::new();
            job.file_name = Some(name.to_string());
            assert_eq!(job.download_name(), "report.pdf");
        }
    }

    #[test]
    fn test_download_name_keeps_unicode_stem() {
        let mut job = ConversionJob::new();
        job.file_name = Some("보고서.hwpx".to_string());
        assert_eq!(job.download_name(), "보고서.pdf");
    }

    #[test]
    fn test_terminal_phase_is_final() {
        let mut job = ConversionJob::new();
        job.advance(JobPhase::Validating);
        job.advance(JobPhase::Failed);
        job.advance(JobPhase::Converting);
        assert_eq!(job.phase(), JobPhase::Failed);
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = ConversionJob::new();
        let b = ConversionJob::new();
        assert_ne!(a.id, b.id);
    }
}

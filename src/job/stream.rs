//! Classification and sequencing of runbook output.

use std::sync::Arc;

use crate::error::Result;
use crate::service::JobReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Output,
    Progress,
    Warning,
    Debug,
    Verbose,
    Error,
}

const PREFIXES: [(&str, StreamType); 5] = [
    ("debug:", StreamType::Debug),
    ("error:", StreamType::Error),
    ("verbose:", StreamType::Verbose),
    ("warning:", StreamType::Warning),
    ("progress:", StreamType::Progress),
];

impl StreamType {
    /// Case-insensitive prefix match; anything else is `Output`.
    pub fn classify(line: &str) -> Self {
        PREFIXES
            .iter()
            .find(|(prefix, _)| {
                line.get(..prefix.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
            })
            .map(|(_, stream_type)| *stream_type)
            .unwrap_or(StreamType::Output)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "Output",
            Self::Progress => "Progress",
            Self::Warning => "Warning",
            Self::Debug => "Debug",
            Self::Verbose => "Verbose",
            Self::Error => "Error",
        }
    }
}

/// Turns output lines into sequenced stream records for one job.
///
/// `emit` takes `&mut self`, so a classifier has exactly one writer and the
/// sequence is gap-free no matter how many readers feed that writer.
pub struct StreamClassifier {
    reporter: Arc<dyn JobReporter>,
    job_id: String,
    runbook_version_id: String,
    next_sequence: u64,
}

impl StreamClassifier {
    pub fn new(reporter: Arc<dyn JobReporter>, job_id: &str, runbook_version_id: &str) -> Self {
        Self {
            reporter,
            job_id: job_id.to_string(),
            runbook_version_id: runbook_version_id.to_string(),
            next_sequence: 0,
        }
    }

    /// Classify `line`, assign the next sequence number and append it to the job stream.
    pub async fn emit(&mut self, line: &str) -> Result<(StreamType, u64)> {
        let stream_type = StreamType::classify(line);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.reporter
            .set_job_stream(
                &self.job_id,
                &self.runbook_version_id,
                line,
                stream_type.as_str(),
                sequence,
            )
            .await?;
        Ok((stream_type, sequence))
    }

    pub fn emitted(&self) -> u64 {
        self.next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MemoryService;

    #[test]
    fn test_prefix_case_insensitive() {
        for line in ["debug: x", "Debug: x", "DEBUG: x", "dEbUg:x"] {
            assert_eq!(StreamType::classify(line), StreamType::Debug, "{}", line);
        }
        assert_eq!(StreamType::classify("VERBOSE: loading"), StreamType::Verbose);
        assert_eq!(StreamType::classify("Warning: disk"), StreamType::Warning);
        assert_eq!(StreamType::classify("error: failed"), StreamType::Error);
        assert_eq!(StreamType::classify("PROGRESS: 50%"), StreamType::Progress);
    }

    #[test]
    fn test_default_is_output() {
        assert_eq!(StreamType::classify("hello world"), StreamType::Output);
        assert_eq!(StreamType::classify(""), StreamType::Output);
        assert_eq!(StreamType::classify("debug"), StreamType::Output);
        assert_eq!(StreamType::classify(" debug: leading space"), StreamType::Output);
        // multi-byte text shorter than a prefix must not panic
        assert_eq!(StreamType::classify("é"), StreamType::Output);
        assert_eq!(StreamType::classify("éééé"), StreamType::Output);
    }

    #[tokio::test]
    async fn test_sequence_starts_at_zero_without_gaps() {
        let service = Arc::new(MemoryService::new());
        let mut classifier = StreamClassifier::new(service.clone(), "job-1", "rv-1");

        for line in ["a", "warning: b", "c", "error: d"] {
            classifier.emit(line).await.unwrap();
        }

        let streams = service.streams("job-1");
        let sequences: Vec<u64> = streams.iter().map(|(_, seq, _)| *seq).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(streams[1].0, "Warning");
        assert_eq!(streams[3].0, "Error");
        assert_eq!(classifier.emitted(), 4);
    }
}

//! Scalar metric sinks.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SgmError;

/// One logged scalar.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScalarEvent {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

/// Destination for training scalars such as `training_loss` and `eval_loss`.
pub trait MetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), SgmError>;
}

/// Record a scalar; a failing sink is logged and otherwise ignored.
pub fn log_scalar(sink: &mut dyn MetricsSink, name: &str, value: f64, step: usize) {
    if let Err(e) = sink.add_scalar(name, value, step) {
        tracing::warn!(step, name, "Metrics sink failed: {e}");
    }
}

/// Appends one JSON object per scalar to a file.
pub struct JsonlMetricsSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlMetricsSink {
    /// Open `path` for appending, so a resumed run extends the same log.
    pub fn open(path: &Path) -> Result<Self, SgmError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), SgmError> {
        let event = ScalarEvent {
            name: name.to_string(),
            value,
            step,
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every scalar in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryMetricsSink {
    pub events: Vec<ScalarEvent>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(step, value)` pairs logged under `name`, in order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.events
            .iter()
            .filter(|e| e.name == name)
            .map(|e| (e.step, e.value))
            .collect()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), SgmError> {
        self.events.push(ScalarEvent {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    struct BrokenSink;

    impl MetricsSink for BrokenSink {
        fn add_scalar(&mut self, _: &str, _: f64, _: usize) -> Result<(), SgmError> {
            Err(SgmError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs/metrics.jsonl");
        {
            let mut sink = JsonlMetricsSink::open(&path).unwrap();
            sink.add_scalar("training_loss", 1.5, 0).unwrap();
            sink.add_scalar("eval_loss", 2.0, 0).unwrap();
        }
        {
            let mut sink = JsonlMetricsSink::open(&path).unwrap();
            sink.add_scalar("training_loss", 0.5, 10).unwrap();
        }

        let file = std::fs::File::open(&path).unwrap();
        let events: Vec<ScalarEvent> = std::io::BufReader::new(file)
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].name, "training_loss");
        assert_eq!(events[2].step, 10);
        assert_eq!(events[2].value, 0.5);
    }

    #[test]
    fn test_memory_sink_series() {
        let mut sink = MemoryMetricsSink::new();
        log_scalar(&mut sink, "training_loss", 3.0, 0);
        log_scalar(&mut sink, "eval_loss", 4.0, 0);
        log_scalar(&mut sink, "training_loss", 2.0, 5);
        assert_eq!(sink.series("training_loss"), vec![(0, 3.0), (5, 2.0)]);
        assert_eq!(sink.series("eval_loss"), vec![(0, 4.0)]);
    }

    #[test]
    fn test_failing_sink_is_ignored() {
        let mut sink = BrokenSink;
        log_scalar(&mut sink, "training_loss", 1.0, 0);
    }
}

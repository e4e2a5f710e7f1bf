//! Per-metric output files
//!
//! One sink per metric under the output directory, named after the metric.
//! A sink is owned by exactly one writer task for the lifetime of a session.

use super::TraceRecord;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const SINK_BUFFER_SIZE: usize = 16 * 1024;

/// Whether a session starts a new trace or extends the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    /// Truncate existing files. Used for the first session only.
    Fresh,
    /// Keep earlier records and write after them.
    Append,
}

impl SinkMode {
    /// Open (or create) `path` according to the mode.
    pub fn open(&self, path: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.create(true);
        match self {
            SinkMode::Fresh => options.write(true).truncate(true),
            SinkMode::Append => options.append(true),
        };
        options.open(path)
    }
}

pub struct MetricSink {
    name: String,
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl MetricSink {
    pub fn open(dir: &Path, name: &str, mode: SinkMode) -> io::Result<Self> {
        let path = dir.join(name);
        let file = mode.open(&path)?;
        debug!(sink = name, path = %path.display(), ?mode, "sink opened");

        Ok(Self {
            name: name.to_string(),
            path,
            writer: BufWriter::with_capacity(SINK_BUFFER_SIZE, file),
            written: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written through this sink since it was opened.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn write(&mut self, record: &TraceRecord) -> io::Result<()> {
        writeln!(self.writer, "{}", record)?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Flush buffered records and sync the file to disk.
    pub fn close(mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        debug!(sink = %self.name, records = self.written, "sink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_fresh_mode_truncates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("memory"), "1,1\n").unwrap();

        let mut sink = MetricSink::open(dir.path(), "memory", SinkMode::Fresh).unwrap();
        sink.write(&TraceRecord::scalar(2, 2)).unwrap();
        sink.close().unwrap();

        let contents = fs::read_to_string(dir.path().join("memory")).unwrap();
        assert_eq!(contents, "2,2\n");
    }

    #[test]
    fn test_append_mode_keeps_previous_records() {
        let dir = tempfile::tempdir().unwrap();

        let mut first = MetricSink::open(dir.path(), "memory", SinkMode::Fresh).unwrap();
        first.write(&TraceRecord::scalar(1, 100)).unwrap();
        first.close().unwrap();

        let mut second = MetricSink::open(dir.path(), "memory", SinkMode::Append).unwrap();
        second.write(&TraceRecord::scalar(2, 200)).unwrap();
        assert_eq!(second.written(), 1);
        second.close().unwrap();

        let contents = fs::read_to_string(dir.path().join("memory")).unwrap();
        assert_eq!(contents, "1,100\n2,200\n");
    }

    #[test]
    fn test_append_mode_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MetricSink::open(dir.path(), "TXQ", SinkMode::Append).unwrap();
        assert!(sink.path().exists());
        assert_eq!(sink.name(), "TXQ");
    }
}

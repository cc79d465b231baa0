//! Scalar metric sinks
//!
//! One value per (tag, epoch). The CSV writer appends rows as they arrive and
//! flushes on every write so a crashed run still leaves a readable log.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::error::Result;

/// Destination for per-epoch scalar series
pub trait ScalarSink {
    /// Record `value` for `tag` at `epoch`
    fn add_scalar(&mut self, tag: &str, value: f64, epoch: usize) -> Result<()>;

    /// Flush and release the sink
    fn close(&mut self) -> Result<()>;
}

/// Writes `tag,epoch,value` rows to `<dir>/scalars.csv`
pub struct CsvScalarWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl CsvScalarWriter {
    pub const FILE_NAME: &'static str = "scalars.csv";

    /// Open (or append to) the scalar log in `dir`
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let existed = path.exists();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if !existed {
            writeln!(writer, "tag,epoch,value")?;
            writer.flush()?;
        }

        Ok(Self {
            path,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for CsvScalarWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, epoch: usize) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{},{},{}", tag, epoch, value)?;
            writer.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_writer_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvScalarWriter::create(dir.path()).unwrap();
        writer.add_scalar("train_loss", 1.5, 0).unwrap();
        writer.add_scalar("test_accuracy", 42.0, 0).unwrap();
        writer.close().unwrap();

        let content = std::fs::read_to_string(dir.path().join("scalars.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "tag,epoch,value");
        assert_eq!(lines[1], "train_loss,0,1.5");
        assert_eq!(lines[2], "test_accuracy,0,42");
    }

    #[test]
    fn test_csv_writer_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = CsvScalarWriter::create(dir.path()).unwrap();
            writer.add_scalar("a", 1.0, 0).unwrap();
        }
        let mut writer = CsvScalarWriter::create(dir.path()).unwrap();
        writer.add_scalar("a", 2.0, 1).unwrap();
        writer.close().unwrap();

        let content = std::fs::read_to_string(writer.path()).unwrap();
        assert_eq!(content.matches("tag,epoch,value").count(), 1);
        assert_eq!(content.lines().count(), 3);
    }
}

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only training loss trace, one value per line
///
/// Every line is flushed as soon as it is written.
pub struct LossLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LossLog {
    /// Open `path` for appending, creating parent directories
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open loss log {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, loss: f32) -> anyhow::Result<()> {
        writeln!(self.writer, "{}", loss)
            .and_then(|_| self.writer.flush())
            .with_context(|| format!("failed to write loss log {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

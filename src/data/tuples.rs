use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Tuple file for a checker inside a tuple directory.
pub fn tuple_path(dir: &Path, checker_name: &str) -> PathBuf {
    dir.join(format!("{}.jsonl", checker_name))
}

/// Read every non-empty line of a JSON-lines file.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Number of complete records already on disk. A trailing line without a
/// newline is a torn write and does not count.
pub fn count_complete_lines(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let contents = std::fs::read(path)?;
    let mut count = 0;
    let mut start = 0;
    for (i, byte) in contents.iter().enumerate() {
        if *byte == b'\n' {
            if contents[start..i].iter().any(|b| !b.is_ascii_whitespace()) {
                count += 1;
            }
            start = i + 1;
        }
    }
    Ok(count)
}

/// Drop anything after the last newline so appends start on a fresh line.
pub fn truncate_partial_line(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let contents = std::fs::read(path)?;
    let keep = match contents.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    if keep < contents.len() {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(keep as u64)?;
    }
    Ok(())
}

/// Append-only JSON-lines writer. Each record is written as one full line
/// and flushed before `append` returns.
pub struct JsonlWriter {
    file: File,
    path: PathBuf,
}

impl JsonlWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    pub fn append_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        truncate_partial_line(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

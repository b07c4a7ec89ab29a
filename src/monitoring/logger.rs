use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::checkers::{CheckResult, Metric};
use crate::error::Result;

const HEADER: &str = "timestamp,checker,tuple_index,metric,violation,check,residual,event";

/// Quote a field if it would break the row.
fn csv_field(value: &str) -> String {
    if value.contains(&[',', '"', '\n'][..]) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Append-only CSV of evaluated tuples: one row per tuple and metric, plus
/// event rows for skipped tuples.
pub struct ViolationLog {
    log_path: PathBuf,
}

impl ViolationLog {
    pub fn new(log_path: &Path) -> Result<Self> {
        // Create CSV file with headers if it doesn't exist
        if !log_path.exists() {
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).write(true).open(log_path)?;
            writeln!(file, "{}", HEADER)?;
        }

        Ok(Self {
            log_path: log_path.to_path_buf(),
        })
    }

    pub fn log_check(&self, checker: &str, tuple_index: usize, metric: Metric, result: &CheckResult) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;

        writeln!(
            file,
            "{},{},{},{},{:.6},{},{:.6},",
            Utc::now().to_rfc3339(),
            checker,
            tuple_index,
            metric,
            result.violation,
            result.is_violation,
            result.diagnostic.residual
        )?;

        Ok(())
    }

    /// Log a skipped tuple or other event
    pub fn log_event(&self, checker: &str, tuple_index: usize, event: &str) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;

        writeln!(
            file,
            "{},{},{},,,,,{}",
            Utc::now().to_rfc3339(),
            checker,
            tuple_index,
            csv_field(event)
        )?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::Diagnostic;

    #[test]
    fn test_rows_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/violations.csv");
        let log = ViolationLog::new(&path).unwrap();
        let result = CheckResult {
            violation: 0.2,
            is_violation: true,
            diagnostic: Diagnostic {
                residual: -0.2,
                nearest: None,
            },
        };
        log.log_check("NegChecker", 0, Metric::Default, &result).unwrap();
        log.log_event("NegChecker", 1, "skipped: bad, \"quoted\" reply").unwrap();

        // Reopening keeps existing rows
        let log = ViolationLog::new(&path).unwrap();
        log.log_check("NegChecker", 2, Metric::Frequentist, &result).unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].ends_with(",NegChecker,0,default,0.200000,true,-0.200000,"));
        assert!(lines[2].ends_with("\"skipped: bad, \"\"quoted\"\" reply\""));
        assert!(lines[3].contains(",frequentist,"));
    }
}

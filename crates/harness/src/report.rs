//! Result stream
//!
//! Every record is one JSON line; diagnostics are free-text lines on the same
//! stream. The launcher tallies the JSON lines and ignores the rest.

use parking_lot::Mutex;
use std::io::Write;
use tracing::warn;

use steeplechase_common::{Outcome, ResultCounts, ResultRecord};

/// Append-only sink for result records and diagnostic lines
pub struct ResultSink {
    out: Mutex<Box<dyn Write + Send>>,
    records: Mutex<Vec<ResultRecord>>,
}

impl ResultSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Sink writing to the process's stdout
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Sink that only keeps records in memory
    pub fn in_memory() -> Self {
        Self::new(Box::new(std::io::sink()))
    }

    /// Emit one record stamped with the current time
    pub fn log_result(&self, pass: bool, message: impl Into<String>, source: impl Into<String>) {
        self.emit(ResultRecord::now(Outcome::from_pass(pass), message, source));
    }

    pub fn emit(&self, record: ResultRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => self.write_line(&line),
            Err(e) => warn!("Failed to encode result record: {}", e),
        }
        self.records.lock().push(record);
    }

    /// Free-text diagnostic line
    pub fn diagnostic(&self, message: &str) {
        for line in message.lines() {
            self.write_line(line);
        }
    }

    fn write_line(&self, line: &str) {
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            warn!("Failed to write result stream: {}", e);
        }
    }

    /// Everything emitted so far
    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.lock().clone()
    }

    pub fn counts(&self) -> ResultCounts {
        let records = self.records.lock();
        let failures = records.iter().filter(|r| r.is_failure()).count();
        ResultCounts::new(records.len() - failures, failures)
    }
}

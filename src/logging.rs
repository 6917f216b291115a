//! The server's own operation log: `[<timestamp>] <message>[: <errno
//! string>]\n`, one record per call, serialised so concurrent workers
//! never interleave a line.
//!
//! This is distinct from the `log`/`env_logger` facade used for the
//! server's startup/shutdown diagnostics -- this file is a protocol
//! artifact clients' operations are judged against, not a debugging aid.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::Local;
use parking_lot::Mutex;

pub struct Logger {
	file: Mutex<File>,
}

impl Logger {
	pub fn open(path: &Path) -> io::Result<Logger> {
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		Ok(Logger { file: Mutex::new(file) })
	}

	/// Appends one record. `errno_str`, when present, is concatenated
	/// after a `: ` separator -- matching the original's "only consult
	/// strerror when reporting an actual failure" behaviour.
	pub fn log(&self, message: &str, errno_str: Option<&str>) {
		let timestamp = Local::now().to_rfc2822();
		let mut record = format!("[{}] {}", timestamp, message);
		if let Some(e) = errno_str {
			record.push_str(": ");
			record.push_str(e);
		}
		record.push('\n');

		let mut file = self.file.lock();
		// A write failure here has nowhere useful to propagate to; the
		// caller already has its own result to return.
		let _ = file.write_all(record.as_bytes());
	}

	pub fn log_io_error(&self, message: &str, err: &io::Error) {
		self.log(message, Some(&err.to_string()));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn writes_bracketed_timestamp_and_message() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("server.log");
		let logger = Logger::open(&path).unwrap();
		logger.log("hello", None);
		logger.log("failed", Some("No such file or directory"));

		let contents = std::fs::read_to_string(&path).unwrap();
		let lines: Vec<&str> = contents.lines().collect();
		assert_eq!(lines.len(), 2);
		assert!(lines[0].starts_with('['));
		assert!(lines[0].contains("] hello"));
		assert!(lines[1].ends_with("failed: No such file or directory"));
	}
}

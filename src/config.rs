//! Tab-separated `key<TAB>value` configuration file parser.
//!
//! A malformed or out-of-range value for a recognised key falls back to
//! that key's default rather than aborting the parse -- one bad line
//! should not sink the whole server. Unknown keys are ignored. Only the
//! complete absence of any readable config file (explicit `-f` path and
//! the compiled-in default both failing to open) is fatal.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::ServerError;

pub const TPOOL_DFL: usize = 10;
pub const MAXMEM_DFL: u64 = 32 * 1024 * 1024;
pub const MAXFILES_DFL: usize = 100;
pub const SOCK_PATH_DFL: &str = "./server.sock";
pub const LOG_PATH_DFL: &str = "./server.log";

const KEY_TPOOL: &str = "tpool";
const KEY_MAXMEM: &str = "maxmem";
const KEY_MAXFILES: &str = "maxfiles";
const KEY_SOCK_PATH: &str = "sock_path";
const KEY_LOG_PATH: &str = "log_path";

#[derive(Debug, Clone)]
pub struct ServerParams {
	pub thread_pool: usize,
	pub max_memsz: u64,
	pub max_files: usize,
	pub sock_path: PathBuf,
	pub log_path: PathBuf,
}

impl Default for ServerParams {
	fn default() -> ServerParams {
		ServerParams {
			thread_pool: TPOOL_DFL,
			max_memsz: MAXMEM_DFL,
			max_files: MAXFILES_DFL,
			sock_path: PathBuf::from(SOCK_PATH_DFL),
			log_path: PathBuf::from(LOG_PATH_DFL),
		}
	}
}

/// Loads `conf_path`, falling back to `CONF_PATH_DFL`-equivalent
/// (`./config.txt`) when `conf_path` is `None` or fails to open. Returns
/// `Err` only when neither path can be opened.
pub fn parse_config(conf_path: Option<&Path>) -> Result<ServerParams, ServerError> {
	let default_path = Path::new("./config.txt");

	let contents = match conf_path {
		Some(p) => match fs::read_to_string(p) {
			Ok(s) => s,
			Err(_) => fs::read_to_string(default_path).map_err(|e| {
				ServerError::Config(format!("unable to open config file: {}", e))
			})?,
		},
		None => fs::read_to_string(default_path)
			.map_err(|e| ServerError::Config(format!("unable to open config file: {}", e)))?,
	};

	let mut params = ServerParams::default();

	for line in contents.lines() {
		let mut parts = line.splitn(2, '\t');
		let key = match parts.next() {
			Some(k) => k,
			None => continue,
		};
		let value = match parts.next() {
			Some(v) => v.trim_end_matches(['\r', '\n']),
			None => continue,
		};

		match key {
			KEY_TPOOL => {
				params.thread_pool = parse_positive(value).unwrap_or_else(|| {
					warn!("invalid {} value {:?}, using default", KEY_TPOOL, value);
					TPOOL_DFL
				});
			}
			KEY_MAXMEM => {
				params.max_memsz = parse_positive(value).unwrap_or_else(|| {
					warn!("invalid {} value {:?}, using default", KEY_MAXMEM, value);
					MAXMEM_DFL
				});
			}
			KEY_MAXFILES => {
				params.max_files = parse_positive(value).unwrap_or_else(|| {
					warn!("invalid {} value {:?}, using default", KEY_MAXFILES, value);
					MAXFILES_DFL
				});
			}
			KEY_SOCK_PATH => {
				if !value.is_empty() {
					params.sock_path = PathBuf::from(value);
				}
			}
			KEY_LOG_PATH => {
				if !value.is_empty() {
					params.log_path = PathBuf::from(value);
				}
			}
			_ => {}
		}
	}

	Ok(params)
}

fn parse_positive<T>(value: &str) -> Option<T>
where
	T: std::str::FromStr + PartialOrd + Default,
{
	match value.trim().parse::<T>() {
		Ok(n) if n > T::default() => Some(n),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn parses_known_keys() {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		writeln!(f, "tpool\t4").unwrap();
		writeln!(f, "maxmem\t1024").unwrap();
		writeln!(f, "maxfiles\t7").unwrap();
		writeln!(f, "sock_path\t/tmp/x.sock").unwrap();
		writeln!(f, "log_path\t/tmp/x.log").unwrap();
		writeln!(f, "unknown_key\tvalue").unwrap();

		let params = parse_config(Some(f.path())).unwrap();
		assert_eq!(params.thread_pool, 4);
		assert_eq!(params.max_memsz, 1024);
		assert_eq!(params.max_files, 7);
		assert_eq!(params.sock_path, PathBuf::from("/tmp/x.sock"));
		assert_eq!(params.log_path, PathBuf::from("/tmp/x.log"));
	}

	#[test]
	fn falls_back_to_default_on_bad_value() {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		writeln!(f, "tpool\tnot-a-number").unwrap();
		let params = parse_config(Some(f.path())).unwrap();
		assert_eq!(params.thread_pool, TPOOL_DFL);
	}

	#[test]
	fn missing_explicit_and_default_is_fatal() {
		let missing = Path::new("/nonexistent/path/to/config-that-does-not-exist.txt");
		let result = parse_config(Some(missing));
		assert!(result.is_err(), "expected fatal error when no config file can be opened");
	}
}

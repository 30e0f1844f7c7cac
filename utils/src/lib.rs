//! Features shared by the filesystem utilities.

pub mod disk;
pub mod prompt;
pub mod util;

use std::fmt;
use std::process::exit;

/// Writes an error to stderr, then exits with status `8` (operational error).
pub fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
	eprintln!("{bin}: {msg}");
	exit(8);
}

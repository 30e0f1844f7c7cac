//! Typed errors surfaced by the block-device and on-disk codec layer.

use thiserror::Error;

/// Errors the core can encounter. Mirrors the taxonomy in spec §7: I/O
/// failures propagate as `Io`, corruption the catalog has no code for becomes
/// `Corrupt` ("internal error" / "programming bug"), and conditions that make
/// further progress unsafe become `Fatal` or `Aborted`.
#[derive(Debug, Error)]
pub enum CheckError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("filesystem corrupt beyond repair: {0}")]
	Corrupt(String),

	#[error("fatal error: {0}")]
	Fatal(String),

	#[error("allocation exhausted: no free {0} available")]
	NoSpace(&'static str),

	#[error("aborted")]
	Aborted,
}

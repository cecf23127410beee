//! Error handling subsystem. Implements a custom Error type.

use tracing::warn;

pub type CnResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	// Component lifecycle
	AlreadyRunning(&'static str),
	NotRunning(&'static str),

	// Protocol
	MalformedFrame(String),
	UnknownMessage(u8),

	// CRDT
	Doc(String),

	// Persistence
	DbError,

	// Network and authentication
	NetworkError(String),
	Unauthorized,
	PermissionDenied,

	// System and configuration
	ConfigError(String),
	Internal(String), // Internal invariant violations, for debugging

	// externals
	Io(std::io::Error),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		warn!("io error: {}", err);
		Self::Io(err)
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for Error {}

// vim: ts=4

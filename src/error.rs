use std::io;

use thiserror::Error;

/// Error tags carried in a reply header's `errcode` field when `status == N`.
///
/// Values are part of the wire protocol and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorTag {
	NoSuchFile = 0x1,
	AlreadyCreated = 0x2,
	AlreadyOpen = 0x4,
	NotOpened = 0x8,
	TooManyFiles = 0x10,
	Locked = 0x20,
	TooBig = 0x40,
	/// Not part of the original error set: a client was queued on a
	/// file's exclusive lock and the file was deleted (by `remove` or
	/// by eviction) before the lock could be granted.
	FileGone = 0x80,
}

impl ErrorTag {
	pub fn as_u8(self) -> u8 {
		self as u8
	}
}

/// Protocol-level rejections: the operation is well-formed but cannot be
/// authorised against current store/session state. These map 1:1 onto
/// `ErrorTag` and are always answered with a negative reply, never a
/// teardown.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
	#[error("no such file")]
	NoSuchFile,
	#[error("file already exists")]
	AlreadyCreated,
	#[error("file already open for this client")]
	AlreadyOpen,
	#[error("file not opened by this client")]
	NotOpened,
	#[error("maximum file count reached")]
	TooManyFiles,
	#[error("file is locked by another client")]
	Locked,
	#[error("payload exceeds store capacity")]
	TooBig,
	#[error("file was removed or evicted while this client waited for its lock")]
	FileGone,
}

impl StoreError {
	pub fn tag(self) -> ErrorTag {
		match self {
			StoreError::NoSuchFile => ErrorTag::NoSuchFile,
			StoreError::AlreadyCreated => ErrorTag::AlreadyCreated,
			StoreError::AlreadyOpen => ErrorTag::AlreadyOpen,
			StoreError::NotOpened => ErrorTag::NotOpened,
			StoreError::TooManyFiles => ErrorTag::TooManyFiles,
			StoreError::Locked => ErrorTag::Locked,
			StoreError::TooBig => ErrorTag::TooBig,
			StoreError::FileGone => ErrorTag::FileGone,
		}
	}
}

/// Top-level error type threaded through the engine. Only `Internal`
/// warrants process termination; everything else is handled locally by
/// the caller (a protocol reply, or a session teardown).
#[derive(Debug, Error)]
pub enum ServerError {
	#[error("protocol rejection: {0}")]
	Protocol(#[from] StoreError),

	#[error("transport error: {0}")]
	Transport(#[from] io::Error),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("internal consistency failure: {0}")]
	Internal(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

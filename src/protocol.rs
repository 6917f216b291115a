//! Wire protocol: fixed-layout request/reply headers plus the variable
//! payloads that follow them. Integers are host-native and fixed-width —
//! client and server always share a machine, so there is no portability
//! requirement to buy with a self-describing encoding.

use std::io::{self, Read, Write};

use crate::error::ErrorTag;

/// Single-byte request type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
	CloseConn = b'!',
	OpenFile = b'O',
	CloseFile = b'Q',
	ReadFile = b'R',
	ReadN = b'N',
	Append = b'A',
	Write = b'W',
	Lock = b'L',
	Unlock = b'U',
	Remove = b'X',
}

impl OpCode {
	pub fn from_byte(b: u8) -> Option<OpCode> {
		match b {
			b'!' => Some(OpCode::CloseConn),
			b'O' => Some(OpCode::OpenFile),
			b'Q' => Some(OpCode::CloseFile),
			b'R' => Some(OpCode::ReadFile),
			b'N' => Some(OpCode::ReadN),
			b'A' => Some(OpCode::Append),
			b'W' => Some(OpCode::Write),
			b'L' => Some(OpCode::Lock),
			b'U' => Some(OpCode::Unlock),
			b'X' => Some(OpCode::Remove),
			_ => None,
		}
	}
}

pub const O_CREATE: u8 = 0x1;
pub const O_LOCK: u8 = 0x2;

/// Internal sentinel enqueued onto the job queue to wake and retire a
/// worker during shutdown. Never sent over the wire.
pub const FAST_TERM: u8 = 0xFF;

#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
	pub op: u8,
	pub client_id: u64,
	pub flags: u8,
	pub path_len: u32,
	pub buf_len: u32,
}

pub const REQUEST_HEADER_LEN: usize = 1 + 8 + 1 + 4 + 4;

impl RequestHeader {
	pub fn encode(&self) -> [u8; REQUEST_HEADER_LEN] {
		let mut buf = [0u8; REQUEST_HEADER_LEN];
		buf[0] = self.op;
		buf[1..9].copy_from_slice(&self.client_id.to_ne_bytes());
		buf[9] = self.flags;
		buf[10..14].copy_from_slice(&self.path_len.to_ne_bytes());
		buf[14..18].copy_from_slice(&self.buf_len.to_ne_bytes());
		buf
	}

	pub fn decode(buf: &[u8; REQUEST_HEADER_LEN]) -> RequestHeader {
		RequestHeader {
			op: buf[0],
			client_id: u64::from_ne_bytes(buf[1..9].try_into().unwrap()),
			flags: buf[9],
			path_len: u32::from_ne_bytes(buf[10..14].try_into().unwrap()),
			buf_len: u32::from_ne_bytes(buf[14..18].try_into().unwrap()),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct ReplyHeader {
	pub status_ok: bool,
	pub errcode: u8,
	pub n_buffers: u32,
	pub paths_total_len: u64,
}

pub const REPLY_HEADER_LEN: usize = 1 + 1 + 4 + 8;

impl ReplyHeader {
	pub fn ok(n_buffers: u32, paths_total_len: u64) -> ReplyHeader {
		ReplyHeader { status_ok: true, errcode: 0, n_buffers, paths_total_len }
	}

	pub fn err(tag: ErrorTag) -> ReplyHeader {
		ReplyHeader { status_ok: false, errcode: tag.as_u8(), n_buffers: 0, paths_total_len: 0 }
	}

	pub fn encode(&self) -> [u8; REPLY_HEADER_LEN] {
		let mut buf = [0u8; REPLY_HEADER_LEN];
		buf[0] = if self.status_ok { b'Y' } else { b'N' };
		buf[1] = self.errcode;
		buf[2..6].copy_from_slice(&self.n_buffers.to_ne_bytes());
		buf[6..14].copy_from_slice(&self.paths_total_len.to_ne_bytes());
		buf
	}

	pub fn decode(buf: &[u8; REPLY_HEADER_LEN]) -> ReplyHeader {
		ReplyHeader {
			status_ok: buf[0] == b'Y',
			errcode: buf[1],
			n_buffers: u32::from_ne_bytes(buf[2..6].try_into().unwrap()),
			paths_total_len: u64::from_ne_bytes(buf[6..14].try_into().unwrap()),
		}
	}
}

/// Fully drains `buf` from `r`, retrying across short reads. Does not
/// retry `Interrupted` specially beyond what `Read::read_exact` already
/// does on most platforms, but is kept as a named seam so callers never
/// reach for `read` directly.
pub fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<()> {
	r.read_exact(buf)
}

/// Fully writes `buf` to `w`, looping over short writes.
pub fn write_exact<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<()> {
	w.write_all(buf)
}

pub fn read_request_header<R: Read>(r: &mut R) -> io::Result<RequestHeader> {
	let mut buf = [0u8; REQUEST_HEADER_LEN];
	read_exact(r, &mut buf)?;
	Ok(RequestHeader::decode(&buf))
}

pub fn write_request_header<W: Write>(w: &mut W, header: &RequestHeader) -> io::Result<()> {
	write_exact(w, &header.encode())
}

pub fn read_reply_header<R: Read>(r: &mut R) -> io::Result<ReplyHeader> {
	let mut buf = [0u8; REPLY_HEADER_LEN];
	read_exact(r, &mut buf)?;
	Ok(ReplyHeader::decode(&buf))
}

pub fn write_reply_header<W: Write>(w: &mut W, header: &ReplyHeader) -> io::Result<()> {
	write_exact(w, &header.encode())
}

/// One evicted file forwarded alongside a positive append/write reply:
/// its path and payload, in eviction order.
pub struct EvictedFile {
	pub path: Vec<u8>,
	pub payload: Vec<u8>,
}

/// Writes the multi-file reply tail: per-file sizes, then the
/// newline-joined path list, then the concatenated payloads, in that
/// order -- matching the header's `n_buffers`/`paths_total_len` fields.
pub fn write_multi_file_tail<W: Write>(w: &mut W, files: &[EvictedFile]) -> io::Result<()> {
	for f in files {
		write_exact(w, &(f.payload.len() as u64).to_ne_bytes())?;
	}
	let mut joined = Vec::new();
	for (i, f) in files.iter().enumerate() {
		if i > 0 {
			joined.push(b'\n');
		}
		joined.extend_from_slice(&f.path);
	}
	write_exact(w, &joined)?;
	for f in files {
		write_exact(w, &f.payload)?;
	}
	Ok(())
}

/// `paths_total_len` for a set of evicted files: the length of the
/// newline-joined path list that `write_multi_file_tail` will emit.
pub fn paths_total_len(files: &[EvictedFile]) -> u64 {
	let joiners = files.len().saturating_sub(1);
	(files.iter().map(|f| f.path.len()).sum::<usize>() + joiners) as u64
}

//! Feedback and termination channels. Both are implemented over a
//! connected `UnixStream` pair rather than `libc::pipe`: a socket pair's
//! descriptors are just as `select()`-able, and the pair is built
//! entirely through safe std APIs. Each message is a fixed-width
//! native-endian integer, reusing the wire codec's framing helpers.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use crate::protocol::{read_exact, write_exact};
use crate::session::ClientId;

/// Worker → dispatcher: "this client's socket is idle again" (positive
/// id) or "this client's session is gone" (negative id, sent as
/// `-(id)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackMsg {
	Ready(ClientId),
	Closed(ClientId),
}

pub struct FeedbackSender {
	stream: Mutex<UnixStream>,
}

pub struct FeedbackReceiver {
	stream: UnixStream,
}

pub fn feedback_channel() -> io::Result<(FeedbackSender, FeedbackReceiver)> {
	let (a, b) = UnixStream::pair()?;
	Ok((FeedbackSender { stream: Mutex::new(a) }, FeedbackReceiver { stream: b }))
}

impl FeedbackSender {
	pub fn send_ready(&self, client: ClientId) -> io::Result<()> {
		self.send(client.0 as i64)
	}

	pub fn send_closed(&self, client: ClientId) -> io::Result<()> {
		self.send(-(client.0 as i64))
	}

	fn send(&self, value: i64) -> io::Result<()> {
		let mut stream = self.stream.lock().unwrap();
		write_exact(&mut *stream, &value.to_ne_bytes())
	}
}

impl FeedbackReceiver {
	pub fn recv(&mut self) -> io::Result<FeedbackMsg> {
		let mut buf = [0u8; 8];
		read_exact(&mut self.stream, &mut buf)?;
		let value = i64::from_ne_bytes(buf);
		if value >= 0 {
			Ok(FeedbackMsg::Ready(ClientId(value as u64)))
		} else {
			Ok(FeedbackMsg::Closed(ClientId((-value) as u64)))
		}
	}
}

impl AsRawFd for FeedbackReceiver {
	fn as_raw_fd(&self) -> RawFd {
		self.stream.as_raw_fd()
	}
}

/// Terminator → dispatcher: which shutdown mode was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermMode {
	Fast,
	Slow,
}

pub struct TermSender {
	stream: Mutex<UnixStream>,
}

pub struct TermReceiver {
	stream: UnixStream,
}

pub fn term_channel() -> io::Result<(TermSender, TermReceiver)> {
	let (a, b) = UnixStream::pair()?;
	Ok((TermSender { stream: Mutex::new(a) }, TermReceiver { stream: b }))
}

impl TermSender {
	pub fn send(&self, mode: TermMode) -> io::Result<()> {
		let byte = match mode {
			TermMode::Fast => 0u8,
			TermMode::Slow => 1u8,
		};
		let mut stream = self.stream.lock().unwrap();
		write_exact(&mut *stream, &[byte])
	}
}

impl TermReceiver {
	pub fn recv(&mut self) -> io::Result<TermMode> {
		let mut buf = [0u8; 1];
		read_exact(&mut self.stream, &mut buf)?;
		Ok(if buf[0] == 0 { TermMode::Fast } else { TermMode::Slow })
	}
}

impl AsRawFd for TermReceiver {
	fn as_raw_fd(&self) -> RawFd {
		self.stream.as_raw_fd()
	}
}

//! Request execution: maps one parsed job onto the file store, session
//! table and logger, and produces the reply frame(s) to write back to
//! the client -- or, for a request that must queue on a file's
//! exclusive lock, defers the reply until a later release wakes it.
//!
//! This is the "whichever thread releases the lock also drains the
//! waiter" design from the spec: `close_and_wake`/`unlock_and_wake`/
//! `remove_and_wake` run the store operation and then, synchronously on
//! the calling worker thread, construct and send the reply for any
//! waiter that was just granted -- there is no separate helper thread
//! per waiter.

use std::collections::HashMap;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::FeedbackSender;
use crate::error::StoreError;
use crate::logging::Logger;
use crate::protocol::{
	self, paths_total_len, EvictedFile as WireEvictedFile, OpCode, ReplyHeader, O_CREATE,
};
use crate::queue::Job;
use crate::session::{ClientId, SessionTable};
use crate::store::{EvictedFile, FileStore, LockOutcome};

/// What the worker's outer loop should do with the job's originating
/// client once `execute` returns.
pub enum JobOutcome {
	/// Reply written; re-arm the client's socket (post it to feedback).
	Replied,
	/// The client is now parked on a file's waiter queue; its socket
	/// stays out of the dispatcher's read-set until a later release
	/// wakes it and posts feedback on its behalf.
	Deferred,
	/// Transport failure or an explicit close-connection request; post
	/// a teardown notification instead of a ready one.
	TornDown,
	/// The store detected its path table diverging from its eviction
	/// queue -- an internal-consistency failure. The reply to this one
	/// request has already been written; the caller must now escalate
	/// to whole-process shutdown rather than keep serving.
	Fatal,
}

/// Bookkeeping for a client parked on a file's waiter queue: enough to
/// pick the right `last_op` once the wait ends, without the store
/// needing to know about sockets or wire framing at all.
struct PendingWait {
	op: u8,
}

pub struct Engine {
	pub store: FileStore,
	pub sessions: SessionTable,
	pub logger: Logger,
	pub feedback: Arc<FeedbackSender>,
	pending: Mutex<HashMap<ClientId, PendingWait>>,
}

struct ReplyFrame {
	header: ReplyHeader,
	tail: Option<Vec<WireEvictedFile>>,
	read_payload: Option<Vec<u8>>,
	log_line: String,
}

impl ReplyFrame {
	fn plain_ok(log_line: String) -> ReplyFrame {
		ReplyFrame { header: ReplyHeader::ok(0, 0), tail: None, read_payload: None, log_line }
	}

	fn err(err: StoreError, op: u8, client: ClientId, path: &[u8]) -> ReplyFrame {
		let log_line = format!(
			"[client {}] {}({}): denied: {}",
			client.0,
			op_name(op),
			String::from_utf8_lossy(path),
			err
		);
		ReplyFrame { header: ReplyHeader::err(err.tag()), tail: None, read_payload: None, log_line }
	}
}

fn op_name(op: u8) -> &'static str {
	match op {
		o if o == OpCode::OpenFile as u8 => "openFile",
		o if o == OpCode::CloseFile as u8 => "closeFile",
		o if o == OpCode::ReadFile as u8 => "readFile",
		o if o == OpCode::ReadN as u8 => "readNFiles",
		o if o == OpCode::Append as u8 => "appendToFile",
		o if o == OpCode::Write as u8 => "writeFile",
		o if o == OpCode::Lock as u8 => "lockFile",
		o if o == OpCode::Unlock as u8 => "unlockFile",
		o if o == OpCode::Remove as u8 => "removeFile",
		o if o == OpCode::CloseConn as u8 => "closeConnection",
		_ => "unknown",
	}
}

impl Engine {
	pub fn new(
		store: FileStore,
		sessions: SessionTable,
		logger: Logger,
		feedback: Arc<FeedbackSender>,
	) -> Engine {
		Engine { store, sessions, logger, feedback, pending: Mutex::new(HashMap::new()) }
	}

	/// Executes one job end to end: invokes the store operation,
	/// writes the reply (and any evicted-file payloads) unless the
	/// request is now parked on a lock, and logs the outcome.
	pub fn execute(&self, job: Job, socket: &mut UnixStream) -> io::Result<JobOutcome> {
		let client = job.client;
		let op = job.header.op;

		if op == OpCode::CloseConn as u8 {
			self.sessions.remove(client);
			self.logger.log(&format!("[client {}] closeConnection: session ended", client.0), None);
			return Ok(JobOutcome::TornDown);
		}

		match self.dispatch(op, client, job.header.flags, &job.path, &job.payload) {
			Ok(None) => Ok(JobOutcome::Deferred),
			Ok(Some(frame)) => {
				if let Err(e) = self.write_frame(socket, &frame) {
					self.logger.log(&frame.log_line, None);
					return Err(e);
				}
				self.logger.log(&frame.log_line, None);
				Ok(JobOutcome::Replied)
			}
			Err(err) => {
				let frame = ReplyFrame::err(err, op, client, &job.path);
				if let Err(e) = self.write_frame(socket, &frame) {
					self.logger.log(&frame.log_line, None);
					return Err(e);
				}
				self.logger.log(&frame.log_line, None);
				if self.store.is_poisoned() {
					self.logger.log(
						"store/eviction-queue divergence detected; escalating to shutdown",
						None,
					);
					return Ok(JobOutcome::Fatal);
				}
				Ok(JobOutcome::Replied)
			}
		}
	}

	/// `Ok(None)` means the request was queued; no reply is ready yet.
	fn dispatch(
		&self,
		op: u8,
		client: ClientId,
		flags: u8,
		path: &[u8],
		payload: &[u8],
	) -> Result<Option<ReplyFrame>, StoreError> {
		if op == OpCode::OpenFile as u8 {
			match self.store.open_file(path, client, flags)? {
				LockOutcome::Granted => {
					self.sessions.update_last_op(client, op, flags, Some(path.to_vec()));
					Ok(Some(self.ok_frame(op, client, path)))
				}
				LockOutcome::Queued => {
					self.park(client, op);
					Ok(None)
				}
			}
		} else if op == OpCode::CloseFile as u8 {
			let granted = self.store.close_file(path, client)?;
			self.sessions.update_last_op(client, op, 0, None);
			self.wake_granted(path, granted);
			Ok(Some(self.ok_frame(op, client, path)))
		} else if op == OpCode::ReadFile as u8 {
			let bytes = self.store.read_file(path, client)?;
			self.sessions.update_last_op(client, op, 0, Some(path.to_vec()));
			Ok(Some(ReplyFrame {
				header: ReplyHeader::ok(1, bytes.len() as u64),
				tail: None,
				read_payload: Some(bytes),
				log_line: format!(
					"[client {}] readFile({}): ok",
					client.0,
					String::from_utf8_lossy(path)
				),
			}))
		} else if op == OpCode::ReadN as u8 {
			let n = flags as i64;
			let files = self.store.read_n(n);
			self.sessions.update_last_op(client, op, flags, None);
			let tail: Vec<WireEvictedFile> = files
				.into_iter()
				.map(|(path, payload)| WireEvictedFile { path, payload })
				.collect();
			let total = paths_total_len(&tail);
			Ok(Some(ReplyFrame {
				header: ReplyHeader::ok(tail.len() as u32, total),
				tail: Some(tail),
				read_payload: None,
				log_line: format!("[client {}] readNFiles({}): ok", client.0, n),
			}))
		} else if op == OpCode::Append as u8 {
			let evicted = self.store.append(path, client, payload)?;
			self.sessions.update_last_op(client, op, 0, Some(path.to_vec()));
			self.wake_evicted(&evicted);
			Ok(Some(self.evicted_frame(op, client, path, evicted)))
		} else if op == OpCode::Write as u8 {
			self.authorise_write(client, path)?;
			let evicted = self.store.write_file(path, client, payload)?;
			self.sessions.update_last_op(client, op, 0, Some(path.to_vec()));
			self.wake_evicted(&evicted);
			Ok(Some(self.evicted_frame(op, client, path, evicted)))
		} else if op == OpCode::Lock as u8 {
			match self.store.lock_file(path, client)? {
				LockOutcome::Granted => {
					self.sessions.update_last_op(client, op, 0, Some(path.to_vec()));
					Ok(Some(self.ok_frame(op, client, path)))
				}
				LockOutcome::Queued => {
					self.park(client, op);
					Ok(None)
				}
			}
		} else if op == OpCode::Unlock as u8 {
			let granted = self.store.unlock_file(path, client)?;
			self.sessions.update_last_op(client, op, 0, Some(path.to_vec()));
			self.wake_granted(path, granted);
			Ok(Some(self.ok_frame(op, client, path)))
		} else if op == OpCode::Remove as u8 {
			let gone = self.store.remove_file(path, client)?;
			self.sessions.update_last_op(client, op, 0, None);
			for waiter in gone {
				self.reply_to_waiter(waiter, Err(StoreError::FileGone));
			}
			Ok(Some(self.ok_frame(op, client, path)))
		} else {
			Ok(Some(self.ok_frame(op, client, path)))
		}
	}

	fn ok_frame(&self, op: u8, client: ClientId, path: &[u8]) -> ReplyFrame {
		ReplyFrame::plain_ok(format!(
			"[client {}] {}({}): ok",
			client.0,
			op_name(op),
			String::from_utf8_lossy(path)
		))
	}

	fn evicted_frame(
		&self,
		op: u8,
		client: ClientId,
		path: &[u8],
		evicted: Vec<EvictedFile>,
	) -> ReplyFrame {
		let log_line = format!(
			"[client {}] {}({}): ok, {} file(s) evicted",
			client.0,
			op_name(op),
			String::from_utf8_lossy(path),
			evicted.len()
		);
		if evicted.is_empty() {
			return ReplyFrame { header: ReplyHeader::ok(0, 0), tail: None, read_payload: None, log_line };
		}
		let tail: Vec<WireEvictedFile> =
			evicted.into_iter().map(|e| WireEvictedFile { path: e.path, payload: e.bytes }).collect();
		let total = paths_total_len(&tail);
		ReplyFrame { header: ReplyHeader::ok(tail.len() as u32, total), tail: Some(tail), read_payload: None, log_line }
	}

	/// `write(path)` is only authorised when the client's last
	/// successful operation on this exact path was `open(path,
	/// O_CREATE)`.
	fn authorise_write(&self, client: ClientId, path: &[u8]) -> Result<(), StoreError> {
		match self.sessions.last_op(client) {
			Some(last)
				if last.op == OpCode::OpenFile as u8
					&& last.flags & O_CREATE != 0
					&& last.path.as_deref() == Some(path) =>
			{
				Ok(())
			}
			_ => Err(StoreError::NotOpened),
		}
	}

	fn park(&self, client: ClientId, op: u8) {
		self.pending.lock().insert(client, PendingWait { op });
	}

	fn wake_granted(&self, path: &[u8], granted: Option<ClientId>) {
		if let Some(client) = granted {
			let op = self.pending.lock().remove(&client).map(|p| p.op).unwrap_or(OpCode::Lock as u8);
			self.sessions.update_last_op(client, op, 0, Some(path.to_vec()));
			self.reply_to_waiter(client, Ok(()));
		}
	}

	/// Evicted files carry their own waiters that were queued on their
	/// (now gone) exclusive lock.
	fn wake_evicted(&self, evicted: &[EvictedFile]) {
		for file in evicted {
			for waiter in &file.gone_waiters {
				self.pending.lock().remove(waiter);
				self.reply_to_waiter(*waiter, Err(StoreError::FileGone));
			}
		}
	}

	/// Sends a parked client's deferred reply and re-arms its socket by
	/// posting to the feedback channel -- run synchronously by whichever
	/// thread just freed the lock.
	fn reply_to_waiter(&self, client: ClientId, outcome: Result<(), StoreError>) {
		let mut socket = match self.sessions.try_clone_socket(client) {
			Ok(Some(s)) => s,
			_ => return,
		};
		let frame = match outcome {
			Ok(()) => ReplyFrame::plain_ok(format!("[client {}] lock granted", client.0)),
			Err(e) => ReplyFrame::err(e, OpCode::Lock as u8, client, b""),
		};
		if self.write_frame(&mut socket, &frame).is_err() {
			self.sessions.remove(client);
			let _ = self.feedback.send_closed(client);
			return;
		}
		self.logger.log(&frame.log_line, None);
		if let Err(io_err) = self.feedback.send_ready(client) {
			self.logger.log_io_error("failed to post feedback for a woken waiter", &io_err);
		}
	}

	fn write_frame(&self, socket: &mut UnixStream, frame: &ReplyFrame) -> io::Result<()> {
		protocol::write_reply_header(socket, &frame.header)?;
		if let Some(tail) = &frame.tail {
			protocol::write_multi_file_tail(socket, tail)?;
		} else if let Some(payload) = &frame.read_payload {
			protocol::write_exact(socket, payload)?;
		}
		socket.flush()
	}
}

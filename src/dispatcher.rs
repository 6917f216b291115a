//! The dispatcher: a single thread that `select()`s over the listening
//! socket, the feedback channel, the termination channel, and every
//! connected client whose socket is not currently owned by a worker.
//! It never touches the store directly -- it only ever reads one
//! request header, hands the job to the queue, and removes that
//! client's descriptor from the read set until a worker's feedback
//! says it is safe to listen on it again.
//!
//! `select()` rather than an async reactor: the read-set removal on
//! dispatch and re-addition on feedback *is* the "at most one worker
//! serves a given client at a time" invariant, and a raw `select()`
//! loop makes that bookkeeping explicit instead of hiding it behind a
//! runtime.

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use crate::channel::{FeedbackMsg, FeedbackReceiver, TermMode, TermReceiver};
use crate::engine::Engine;
use crate::protocol::read_request_header;
use crate::queue::{term_job, Job, JobQueue};
use crate::session::{ClientId, ClientIdGen};
use crate::worker::SlowTermFlag;

/// Outcome of running the dispatcher loop to completion: which kind of
/// termination ended it, used by `main` to choose the exit code and
/// the shutdown message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
	Fast,
	Slow,
}

pub struct Dispatcher {
	listener: Option<UnixListener>,
	feedback_rx: FeedbackReceiver,
	term_rx: TermReceiver,
	queue: Arc<JobQueue>,
	engine: Arc<Engine>,
	id_gen: ClientIdGen,
	slow_term: Arc<SlowTermFlag>,
	thread_pool: usize,
	fds: FdSet,
	max_fd: RawFd,
	/// The dispatcher's own view of which client owns which descriptor,
	/// maintained independently of the session table so that readable
	/// descriptors can be resolved without cloning sockets on the hot
	/// path. Both directions are kept because a client socket is
	/// registered by fd (on accept) but re-armed by `ClientId` (on
	/// feedback) -- this is the *original* accepted descriptor, not a
	/// clone, since `select()` needs a stable fd for the life of the
	/// connection rather than a fresh dup every time it is re-armed.
	fd_clients: HashMap<RawFd, ClientId>,
	client_fds: HashMap<ClientId, RawFd>,
}

impl Dispatcher {
	pub fn new(
		listener: UnixListener,
		feedback_rx: FeedbackReceiver,
		term_rx: TermReceiver,
		queue: Arc<JobQueue>,
		engine: Arc<Engine>,
		slow_term: Arc<SlowTermFlag>,
		thread_pool: usize,
	) -> Dispatcher {
		let mut fds = FdSet::new();
		let listen_fd = listener.as_raw_fd();
		let feedback_fd = feedback_rx.as_raw_fd();
		let term_fd = term_rx.as_raw_fd();
		fds.set(listen_fd);
		fds.set(feedback_fd);
		fds.set(term_fd);
		let max_fd = listen_fd.max(feedback_fd).max(term_fd);

		Dispatcher {
			listener: Some(listener),
			feedback_rx,
			term_rx,
			queue,
			engine,
			id_gen: ClientIdGen::new(),
			slow_term,
			thread_pool,
			fds,
			max_fd,
			fd_clients: HashMap::new(),
			client_fds: HashMap::new(),
		}
	}

	/// Runs until a termination signal is handled, then returns which
	/// kind it was.
	pub fn run(mut self) -> io::Result<Shutdown> {
		loop {
			let mut read_copy = self.fds.clone();
			let ready = select(&mut read_copy, self.max_fd)?;
			if ready == -1 {
				continue;
			}

			let listen_fd = self.listener.as_ref().map(|l| l.as_raw_fd());
			let term_fd = self.term_rx.as_raw_fd();
			let feedback_fd = self.feedback_rx.as_raw_fd();

			if read_copy.is_set(term_fd) {
				if let Some(shutdown) = self.handle_term()? {
					return Ok(shutdown);
				}
				continue;
			}

			if let Some(lfd) = listen_fd {
				if read_copy.is_set(lfd) {
					self.handle_accept();
				}
			}

			if read_copy.is_set(feedback_fd) {
				if let Some(shutdown) = self.handle_feedback()? {
					return Ok(shutdown);
				}
			}

			for fd in read_copy.ready_fds(self.max_fd) {
				if Some(fd) == listen_fd || fd == feedback_fd || fd == term_fd {
					continue;
				}
				self.handle_client_readable(fd);
			}
		}
	}

	fn handle_accept(&mut self) {
		let listener = match &self.listener {
			Some(l) => l,
			None => return,
		};
		match listener.accept() {
			Ok((socket, _addr)) => {
				let id = self.id_gen.next();
				let fd = socket.as_raw_fd();
				self.engine.sessions.add(id, socket);
				self.fd_clients.insert(fd, id);
				self.client_fds.insert(id, fd);
				self.fds.set(fd);
				self.max_fd = self.max_fd.max(fd);
				self.engine.store.note_connected_clients(self.engine.sessions.len());
			}
			Err(e) => {
				self.engine.logger.log_io_error("failed to accept a client connection", &e);
			}
		}
	}

	/// Reads a feedback message. A positive id re-arms that client's
	/// socket in the read set; a closed id means the session is gone
	/// for good. During slow termination, the last client disconnecting
	/// ends the loop.
	fn handle_feedback(&mut self) -> io::Result<Option<Shutdown>> {
		let msg = self.feedback_rx.recv()?;
		match msg {
			FeedbackMsg::Ready(client) => {
				if let Some(&fd) = self.client_fds.get(&client) {
					self.fds.set(fd);
					self.max_fd = self.max_fd.max(fd);
				}
			}
			FeedbackMsg::Closed(client) => {
				self.forget_client(client);
				if self.slow_term.is_set() && self.engine.sessions.is_empty() {
					return Ok(Some(Shutdown::Slow));
				}
			}
		}
		Ok(None)
	}

	/// A client socket became readable: read exactly its request
	/// header (path/payload are read later, by the worker that picks
	/// the job up), enqueue the job, and stop listening on this socket
	/// until the worker's feedback says it is idle again.
	fn handle_client_readable(&mut self, fd: RawFd) {
		let client = match self.fd_clients.get(&fd) {
			Some(&id) => id,
			None => {
				self.fds.clear(fd);
				return;
			}
		};

		let mut socket = match self.engine.sessions.try_clone_socket(client) {
			Ok(Some(s)) => s,
			_ => {
				self.fds.clear(fd);
				self.forget_client(client);
				return;
			}
		};

		self.fds.clear(fd);

		match read_request_header(&mut socket) {
			Ok(header) => {
				self.queue.push(Job { header, client, path: Vec::new(), payload: Vec::new() });
			}
			Err(e) => {
				self.engine.logger.log_io_error("failed to read a request header", &e);
				self.engine.sessions.remove(client);
				self.forget_client(client);
			}
		}
	}

	/// Drops a client from the dispatcher's own fd bookkeeping. The
	/// session table entry is removed independently by whoever detected
	/// the disconnect (the dispatcher itself, or a worker via
	/// `FeedbackMsg::Closed`).
	fn forget_client(&mut self, client: ClientId) {
		if let Some(fd) = self.client_fds.remove(&client) {
			self.fd_clients.remove(&fd);
			self.fds.clear(fd);
		}
	}

	/// `SIGHUP` stops new accepts but drains existing sessions;
	/// `SIGINT`/`SIGQUIT` tear everything down immediately. Returns
	/// `Some(shutdown)` once the loop should stop, `None` to keep
	/// running (slow termination with clients still connected).
	fn handle_term(&mut self) -> io::Result<Option<Shutdown>> {
		let mode = self.term_rx.recv()?;
		match mode {
			TermMode::Slow => {
				self.slow_term.set();
				// Workers already parked on an empty queue only notice
				// the flag on their next wakeup.
				self.queue.notify_all();
				if let Some(listener) = self.listener.take() {
					let fd = listener.as_raw_fd();
					self.fds.clear(fd);
					drop(listener);
				}
				if self.engine.sessions.is_empty() {
					return Ok(Some(Shutdown::Slow));
				}
				Ok(None)
			}
			TermMode::Fast => {
				for id in self.engine.sessions.ids() {
					self.engine.sessions.remove(id);
					self.forget_client(id);
				}
				self.queue.clear();
				for _ in 0..self.thread_pool {
					self.queue.push(term_job());
				}
				self.queue.notify_all();
				Ok(Some(Shutdown::Fast))
			}
		}
	}
}

fn select(set: &mut FdSet, max_fd: RawFd) -> io::Result<i32> {
	let n = unsafe {
		libc::select(
			max_fd + 1,
			&mut set.inner as *mut libc::fd_set,
			std::ptr::null_mut(),
			std::ptr::null_mut(),
			std::ptr::null_mut(),
		)
	};
	if n < 0 {
		let err = io::Error::last_os_error();
		if err.kind() == io::ErrorKind::Interrupted {
			return Ok(-1);
		}
		return Err(err);
	}
	Ok(n)
}

/// Thin wrapper over `libc::fd_set`: the libc crate exposes the raw
/// type but not the `FD_SET`/`FD_ISSET`/`FD_CLR` macros, so the bit
/// manipulation they do is reproduced here directly.
#[derive(Clone)]
struct FdSet {
	inner: libc::fd_set,
}

impl FdSet {
	fn new() -> FdSet {
		unsafe {
			let mut raw = MaybeUninit::<libc::fd_set>::uninit();
			libc::FD_ZERO(raw.as_mut_ptr());
			FdSet { inner: raw.assume_init() }
		}
	}

	fn set(&mut self, fd: RawFd) {
		unsafe { libc::FD_SET(fd, &mut self.inner) }
	}

	fn clear(&mut self, fd: RawFd) {
		unsafe { libc::FD_CLR(fd, &mut self.inner) }
	}

	fn is_set(&self, fd: RawFd) -> bool {
		unsafe { libc::FD_ISSET(fd, &self.inner) }
	}

	fn ready_fds(&self, max_fd: RawFd) -> Vec<RawFd> {
		(0..=max_fd).filter(|&fd| self.is_set(fd)).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fd_set_tracks_membership() {
		let mut set = FdSet::new();
		assert!(!set.is_set(3));
		set.set(3);
		assert!(set.is_set(3));
		set.clear(3);
		assert!(!set.is_set(3));
	}
}

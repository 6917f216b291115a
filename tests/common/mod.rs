//! Shared harness for the end-to-end tests: spins up the real
//! dispatcher/worker-pool/engine stack against a `UnixListener` bound
//! under a scratch directory, without going through `main`'s signal
//! handling -- tests drive termination directly through a `TermSender`
//! instead of raising real signals, since signal state is process-wide
//! and several tests run in the same test binary.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tempfile::TempDir;

use filed::channel::{feedback_channel, term_channel, TermMode, TermSender};
use filed::dispatcher::{Dispatcher, Shutdown};
use filed::engine::Engine;
use filed::logging::Logger;
use filed::protocol::{
	self, OpCode, ReplyHeader, RequestHeader, O_CREATE, O_LOCK, REPLY_HEADER_LEN,
};
use filed::queue::JobQueue;
use filed::session::SessionTable;
use filed::store::FileStore;
use filed::worker::{SlowTermFlag, WorkerPool};

pub struct TestServer {
	pub sock_path: PathBuf,
	pub engine: Arc<Engine>,
	term_tx: TermSender,
	dispatcher_thread: Option<JoinHandle<std::io::Result<Shutdown>>>,
	pool: Option<WorkerPool>,
	_tmpdir: TempDir,
}

impl TestServer {
	pub fn start(max_files: usize, max_bytes: u64, thread_pool: usize) -> TestServer {
		let tmpdir = tempfile::tempdir().unwrap();
		let sock_path = tmpdir.path().join("server.sock");
		let log_path = tmpdir.path().join("server.log");

		let store = FileStore::new(max_files, max_bytes);
		let sessions = SessionTable::new();
		let logger = Logger::open(&log_path).unwrap();
		let (feedback_tx, feedback_rx) = feedback_channel().unwrap();
		let (term_tx, term_rx) = term_channel().unwrap();

		let engine = Arc::new(Engine::new(store, sessions, logger, Arc::new(feedback_tx)));
		let queue = Arc::new(JobQueue::new());
		let slow_term = Arc::new(SlowTermFlag::new());

		let listener = UnixListener::bind(&sock_path).unwrap();

		let pool = WorkerPool::spawn(thread_pool, engine.clone(), queue.clone(), slow_term.clone());
		let dispatcher =
			Dispatcher::new(listener, feedback_rx, term_rx, queue, engine.clone(), slow_term, thread_pool);
		let dispatcher_thread = thread::spawn(move || dispatcher.run());

		TestServer {
			sock_path,
			engine,
			term_tx,
			dispatcher_thread: Some(dispatcher_thread),
			pool: Some(pool),
			_tmpdir: tmpdir,
		}
	}

	pub fn connect(&self) -> UnixStream {
		UnixStream::connect(&self.sock_path).unwrap()
	}

	/// Sends a termination mode directly, bypassing real signal
	/// delivery. Does not wait for shutdown to complete -- use
	/// `join_shutdown` for that once the test has driven whatever
	/// client behaviour it wants to observe in between.
	pub fn send_term(&self, mode: TermMode) {
		self.term_tx.send(mode).unwrap();
	}

	/// Waits for the dispatcher and worker pool to fully unwind after a
	/// termination mode has been sent.
	pub fn join_shutdown(&mut self) -> Shutdown {
		let shutdown = self.dispatcher_thread.take().unwrap().join().unwrap().unwrap();
		self.pool.take().unwrap().join();
		shutdown
	}

	/// Sends a termination mode and waits for full shutdown in one
	/// call, for tests that don't need to interleave client activity in
	/// between.
	pub fn terminate(&mut self, mode: TermMode) -> Shutdown {
		self.send_term(mode);
		self.join_shutdown()
	}
}

pub struct Reply {
	pub header: ReplyHeader,
	pub read_payload: Vec<u8>,
	pub tail: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Sends one request (header + path + payload) and reads back the
/// reply, decoding whichever tail shape the header describes: a single
/// read payload for `readFile`, or a multi-file eviction/readN tail
/// otherwise.
pub fn send_request(
	stream: &mut UnixStream,
	op: OpCode,
	flags: u8,
	path: &[u8],
	payload: &[u8],
) -> Reply {
	let header = RequestHeader {
		op: op as u8,
		client_id: 0,
		flags,
		path_len: path.len() as u32,
		buf_len: payload.len() as u32,
	};
	protocol::write_request_header(stream, &header).unwrap();
	protocol::write_exact(stream, path).unwrap();
	protocol::write_exact(stream, payload).unwrap();
	stream.flush().unwrap();

	read_reply(stream, op)
}

fn read_reply(stream: &mut UnixStream, op: OpCode) -> Reply {
	let mut buf = [0u8; REPLY_HEADER_LEN];
	stream.read_exact(&mut buf).unwrap();
	let header = ReplyHeader::decode(&buf);

	if !header.status_ok {
		return Reply { header, read_payload: Vec::new(), tail: Vec::new() };
	}

	if op == OpCode::ReadFile {
		let mut payload = vec![0u8; header.paths_total_len as usize];
		stream.read_exact(&mut payload).unwrap();
		return Reply { header, read_payload: payload, tail: Vec::new() };
	}

	if header.n_buffers == 0 {
		return Reply { header, read_payload: Vec::new(), tail: Vec::new() };
	}

	let mut sizes = Vec::with_capacity(header.n_buffers as usize);
	for _ in 0..header.n_buffers {
		let mut size_buf = [0u8; 8];
		stream.read_exact(&mut size_buf).unwrap();
		sizes.push(u64::from_ne_bytes(size_buf));
	}
	let mut joined = vec![0u8; header.paths_total_len as usize];
	stream.read_exact(&mut joined).unwrap();
	let paths: Vec<Vec<u8>> = joined.split(|&b| b == b'\n').map(|p| p.to_vec()).collect();

	let mut tail = Vec::with_capacity(sizes.len());
	for (path, size) in paths.into_iter().zip(sizes) {
		let mut payload = vec![0u8; size as usize];
		stream.read_exact(&mut payload).unwrap();
		tail.push((path, payload));
	}
	Reply { header, read_payload: Vec::new(), tail }
}

pub fn open(stream: &mut UnixStream, path: &[u8], create: bool, lock: bool) -> Reply {
	let mut flags = 0u8;
	if create {
		flags |= O_CREATE;
	}
	if lock {
		flags |= O_LOCK;
	}
	send_request(stream, OpCode::OpenFile, flags, path, &[])
}

pub fn close(stream: &mut UnixStream, path: &[u8]) -> Reply {
	send_request(stream, OpCode::CloseFile, 0, path, &[])
}

pub fn read_file(stream: &mut UnixStream, path: &[u8]) -> Reply {
	send_request(stream, OpCode::ReadFile, 0, path, &[])
}

pub fn append(stream: &mut UnixStream, path: &[u8], payload: &[u8]) -> Reply {
	send_request(stream, OpCode::Append, 0, path, payload)
}

pub fn write(stream: &mut UnixStream, path: &[u8], payload: &[u8]) -> Reply {
	send_request(stream, OpCode::Write, 0, path, payload)
}

pub fn lock(stream: &mut UnixStream, path: &[u8]) -> Reply {
	send_request(stream, OpCode::Lock, 0, path, &[])
}

pub fn unlock(stream: &mut UnixStream, path: &[u8]) -> Reply {
	send_request(stream, OpCode::Unlock, 0, path, &[])
}

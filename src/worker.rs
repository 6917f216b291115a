//! The worker pool: N threads that pop jobs off the job queue, read
//! each request's trailing path/buffer bytes off the client socket,
//! run it through the engine, and report the client back to the
//! dispatcher over the feedback channel.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::engine::{Engine, JobOutcome};
use crate::protocol::read_exact;
use crate::queue::{is_term_job, JobQueue};

/// Shared flag set by the termination coordinator when a slow
/// termination has been requested: a worker that finds the queue empty
/// and this flag set exits instead of waiting forever.
pub struct SlowTermFlag(AtomicBool);

impl SlowTermFlag {
	pub fn new() -> SlowTermFlag {
		SlowTermFlag(AtomicBool::new(false))
	}

	pub fn set(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_set(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

impl Default for SlowTermFlag {
	fn default() -> SlowTermFlag {
		SlowTermFlag::new()
	}
}

pub struct WorkerPool {
	handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
	pub fn spawn(
		count: usize,
		engine: Arc<Engine>,
		queue: Arc<JobQueue>,
		slow_term: Arc<SlowTermFlag>,
	) -> WorkerPool {
		let handles = (0..count)
			.map(|idx| {
				let engine = engine.clone();
				let queue = queue.clone();
				let slow_term = slow_term.clone();
				thread::Builder::new()
					.name(format!("worker-{}", idx))
					.spawn(move || worker_loop(engine, queue, slow_term))
					.expect("failed to spawn worker thread")
			})
			.collect();
		WorkerPool { handles }
	}

	pub fn join(self) {
		for handle in self.handles {
			let _ = handle.join();
		}
	}
}

fn worker_loop(engine: Arc<Engine>, queue: Arc<JobQueue>, slow_term: Arc<SlowTermFlag>) {
	loop {
		let job = match queue.pop_unless(|| slow_term.is_set()) {
			Some(job) => job,
			None => return,
		};

		if is_term_job(&job) {
			return;
		}

		let client = job.client;
		let mut socket = match engine.sessions.try_clone_socket(client) {
			Ok(Some(s)) => s,
			_ => continue,
		};

		let mut job = job;
		if let Err(e) = drain_framing(&mut job, &mut socket) {
			engine.logger.log_io_error("failed to read request framing", &e);
			engine.sessions.remove(client);
			let _ = engine.feedback.send_closed(client);
			continue;
		}

		// A panic while executing a single request must not take the
		// whole worker thread (and its share of the pool) down with
		// it: caught here and turned into an ordinary session teardown.
		let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.execute(job, &mut socket)));

		match outcome {
			Ok(Ok(JobOutcome::Replied)) => {
				let _ = engine.feedback.send_ready(client);
			}
			Ok(Ok(JobOutcome::Deferred)) => {
				// Client stays parked; a later lock release posts
				// feedback on its behalf.
			}
			Ok(Ok(JobOutcome::TornDown)) => {
				let _ = engine.feedback.send_closed(client);
			}
			Ok(Ok(JobOutcome::Fatal)) => {
				let _ = engine.feedback.send_closed(client);
				// Internal consistency is already violated; there is no
				// safe way to keep serving other clients against a store
				// whose invariants no longer hold.
				std::process::exit(70);
			}
			Ok(Err(e)) => {
				engine.logger.log_io_error("transport error while serving request", &e);
				engine.sessions.remove(client);
				let _ = engine.feedback.send_closed(client);
			}
			Err(_) => {
				engine.logger.log("request handler panicked; tearing down the session", None);
				engine.sessions.remove(client);
				let _ = engine.feedback.send_closed(client);
			}
		}
	}
}

/// Always fully drains the declared `path_len`/`buf_len` from the
/// socket before the engine runs, even for requests that will end up
/// being refused -- otherwise the next request on this stream would be
/// misframed.
fn drain_framing(job: &mut crate::queue::Job, socket: &mut std::os::unix::net::UnixStream) -> io::Result<()> {
	let mut path = vec![0u8; job.header.path_len as usize];
	read_exact(socket, &mut path)?;
	let mut payload = vec![0u8; job.header.buf_len as usize];
	read_exact(socket, &mut payload)?;
	job.path = path;
	job.payload = payload;
	Ok(())
}

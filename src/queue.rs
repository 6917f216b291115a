//! Bounded synchronised FIFO handing requests from the dispatcher to the
//! worker pool. One mutex guards the deque; a condition variable wakes
//! waiting workers on `push`.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::protocol::RequestHeader;
use crate::session::ClientId;

/// One unit of work: the request header already parsed off the wire,
/// the client it came from, and the raw path/payload bytes that
/// followed the header (if any).
pub struct Job {
	pub header: RequestHeader,
	pub client: ClientId,
	pub path: Vec<u8>,
	pub payload: Vec<u8>,
}

/// Sentinel job pushed once per worker during shutdown; workers that
/// pop it exit their loop instead of dispatching it.
pub fn term_job() -> Job {
	Job {
		header: RequestHeader {
			op: crate::protocol::FAST_TERM,
			client_id: 0,
			flags: 0,
			path_len: 0,
			buf_len: 0,
		},
		client: ClientId(0),
		path: Vec::new(),
		payload: Vec::new(),
	}
}

pub fn is_term_job(job: &Job) -> bool {
	job.header.op == crate::protocol::FAST_TERM
}

struct Inner {
	jobs: VecDeque<Job>,
}

pub struct JobQueue {
	inner: Mutex<Inner>,
	not_empty: Condvar,
}

impl JobQueue {
	pub fn new() -> JobQueue {
		JobQueue { inner: Mutex::new(Inner { jobs: VecDeque::new() }), not_empty: Condvar::new() }
	}

	pub fn push(&self, job: Job) {
		let mut inner = self.inner.lock();
		inner.jobs.push_back(job);
		self.not_empty.notify_one();
	}

	/// Wakes every waiting worker without enqueueing anything -- used
	/// during slow termination so idle workers re-check the shutdown
	/// flag promptly.
	pub fn notify_all(&self) {
		let _inner = self.inner.lock();
		self.not_empty.notify_all();
	}

	/// Blocks until a job is available, then pops and returns it.
	pub fn pop(&self) -> Job {
		let mut inner = self.inner.lock();
		loop {
			if let Some(job) = inner.jobs.pop_front() {
				return job;
			}
			self.not_empty.wait(&mut inner);
		}
	}

	/// Blocks until a job is available or `should_stop` reports true
	/// with the queue empty, re-checking `should_stop` each time the
	/// wait is woken (by a push, or by `notify_all`) rather than only
	/// once up front -- a slow-termination flag flipped while a worker
	/// is already parked here must still be noticed.
	pub fn pop_unless<F: Fn() -> bool>(&self, should_stop: F) -> Option<Job> {
		let mut inner = self.inner.lock();
		loop {
			if let Some(job) = inner.jobs.pop_front() {
				return Some(job);
			}
			if should_stop() {
				return None;
			}
			self.not_empty.wait(&mut inner);
		}
	}

	/// Non-blocking variant used by a worker that has just observed the
	/// slow-termination flag set: returns `None` rather than waiting
	/// forever on a queue that may never receive more real work.
	pub fn try_pop(&self) -> Option<Job> {
		let mut inner = self.inner.lock();
		inner.jobs.pop_front()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().jobs.len()
	}

	pub fn clear(&self) {
		self.inner.lock().jobs.clear();
	}
}

impl Default for JobQueue {
	fn default() -> JobQueue {
		JobQueue::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dummy_job(client: u64) -> Job {
		Job {
			header: RequestHeader { op: b'R', client_id: client, flags: 0, path_len: 0, buf_len: 0 },
			client: ClientId(client),
			path: Vec::new(),
			payload: Vec::new(),
		}
	}

	#[test]
	fn fifo_order() {
		let q = JobQueue::new();
		q.push(dummy_job(1));
		q.push(dummy_job(2));
		assert_eq!(q.pop().client, ClientId(1));
		assert_eq!(q.pop().client, ClientId(2));
	}

	#[test]
	fn try_pop_empty_returns_none() {
		let q = JobQueue::new();
		assert!(q.try_pop().is_none());
	}
}

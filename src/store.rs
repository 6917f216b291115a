//! The file store: a path-keyed table of in-memory files with per-file
//! mutual exclusion, FIFO eviction bookkeeping, and the waiter queues
//! that back the exclusive-lock protocol.
//!
//! Locking discipline follows §5 of the design: a single store mutex
//! guards the path→entry map and the eviction queue together; each
//! entry then has its own mutex for its bytes, open-set and waiters.
//! The store mutex is always released before a per-file mutex is taken
//! (hand-over-hand), so no call ever holds both at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::protocol::{O_CREATE, O_LOCK};
use crate::session::ClientId;

/// Outcome of an operation that may need to queue on the exclusive lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
	/// The caller now holds (or already held) the exclusive lock.
	Granted,
	/// The caller has been queued; no reply should be sent yet. The
	/// queued client is later granted by `unlock`/`close`/`remove` on
	/// whichever thread releases the file, which is responsible for
	/// constructing and sending that client's deferred reply.
	Queued,
}

struct FileData {
	bytes: Vec<u8>,
	opened_by: HashSet<ClientId>,
	exclusive_holder: Option<ClientId>,
	waiters: VecDeque<ClientId>,
}

impl FileData {
	fn new() -> FileData {
		FileData {
			bytes: Vec::new(),
			opened_by: HashSet::new(),
			exclusive_holder: None,
			waiters: VecDeque::new(),
		}
	}
}

struct FileEntry {
	data: Mutex<FileData>,
}

impl FileEntry {
	fn new() -> FileEntry {
		FileEntry { data: Mutex::new(FileData::new()) }
	}
}

/// One file forwarded to a client after eviction or removal made room:
/// its path, final payload, and any clients that were still waiting on
/// its exclusive lock (to be woken with `FileGone`).
pub struct EvictedFile {
	pub path: Vec<u8>,
	pub bytes: Vec<u8>,
	pub gone_waiters: Vec<ClientId>,
}

#[derive(Default, Clone, Copy)]
pub struct Stats {
	pub max_bytes_used: u64,
	pub max_files_used: usize,
	pub eviction_invocations: u64,
	pub max_connected_clients: usize,
}

struct StoreInner {
	files: HashMap<Vec<u8>, Arc<FileEntry>>,
	eviction_queue: VecDeque<Vec<u8>>,
}

pub struct FileStore {
	inner: Mutex<StoreInner>,
	current_bytes: AtomicU64,
	stats: Mutex<Stats>,
	max_files: usize,
	max_bytes: u64,
	/// Set when the path→entry map and the eviction queue are caught
	/// diverging from each other -- an invariant violation that should
	/// be unreachable given the mutation discipline in this file. Once
	/// set, the server is past the point a client-facing error reply
	/// can paper over; the caller escalates to process termination.
	poisoned: AtomicBool,
}

impl FileStore {
	pub fn new(max_files: usize, max_bytes: u64) -> FileStore {
		FileStore {
			inner: Mutex::new(StoreInner { files: HashMap::new(), eviction_queue: VecDeque::new() }),
			current_bytes: AtomicU64::new(0),
			stats: Mutex::new(Stats::default()),
			max_files,
			max_bytes,
			poisoned: AtomicBool::new(false),
		}
	}

	pub fn is_poisoned(&self) -> bool {
		self.poisoned.load(Ordering::SeqCst)
	}

	pub fn current_files(&self) -> usize {
		self.inner.lock().files.len()
	}

	pub fn current_bytes(&self) -> u64 {
		self.current_bytes.load(Ordering::SeqCst)
	}

	pub fn stats(&self) -> Stats {
		*self.stats.lock()
	}

	pub fn note_connected_clients(&self, n: usize) {
		let mut stats = self.stats.lock();
		if n > stats.max_connected_clients {
			stats.max_connected_clients = n;
		}
	}

	fn note_file_count(&self, n: usize) {
		let mut stats = self.stats.lock();
		if n > stats.max_files_used {
			stats.max_files_used = n;
		}
	}

	fn note_bytes(&self, n: u64) {
		let mut stats = self.stats.lock();
		if n > stats.max_bytes_used {
			stats.max_bytes_used = n;
		}
	}

	/// `open(path, flags, client)`: creates the entry first if `O_CREATE`
	/// is set and it is absent (failing `AlreadyCreated` if it is
	/// present instead), records `client` in `opened_by`, then resolves
	/// `O_LOCK` per §4.2.
	pub fn open_file(
		&self,
		path: &[u8],
		client: ClientId,
		flags: u8,
	) -> Result<LockOutcome, StoreError> {
		let mut inner = self.inner.lock();
		let entry = match inner.files.get(path) {
			Some(entry) => {
				if flags & O_CREATE != 0 {
					return Err(StoreError::AlreadyCreated);
				}
				entry.clone()
			}
			None => {
				if flags & O_CREATE == 0 {
					return Err(StoreError::NoSuchFile);
				}
				if inner.files.len() >= self.max_files {
					return Err(StoreError::TooManyFiles);
				}
				let entry = Arc::new(FileEntry::new());
				inner.files.insert(path.to_vec(), entry.clone());
				inner.eviction_queue.push_back(path.to_vec());
				self.note_file_count(inner.files.len());
				entry
			}
		};
		drop(inner);

		let mut data = entry.data.lock();
		data.opened_by.insert(client);
		Ok(self.resolve_lock(&mut data, client, flags & O_LOCK != 0))
	}

	fn resolve_lock(&self, data: &mut FileData, client: ClientId, want_lock: bool) -> LockOutcome {
		if !want_lock {
			return LockOutcome::Granted;
		}
		match data.exclusive_holder {
			None => {
				data.exclusive_holder = Some(client);
				LockOutcome::Granted
			}
			Some(holder) if holder == client => LockOutcome::Granted,
			Some(_) => {
				data.waiters.push_back(client);
				LockOutcome::Queued
			}
		}
	}

	/// `close(path, client)`: drops `client` from `opened_by`; if it
	/// held the exclusive lock, releases it and grants the next waiter
	/// (if any), returning that waiter so the caller can send its
	/// deferred reply.
	pub fn close_file(&self, path: &[u8], client: ClientId) -> Result<Option<ClientId>, StoreError> {
		let entry = self.find_entry(path)?;
		let mut data = entry.data.lock();
		data.opened_by.remove(&client);
		if data.exclusive_holder == Some(client) {
			Ok(self.release_lock(&mut data))
		} else {
			Ok(None)
		}
	}

	fn release_lock(&self, data: &mut FileData) -> Option<ClientId> {
		data.exclusive_holder = None;
		match data.waiters.pop_front() {
			Some(next) => {
				data.exclusive_holder = Some(next);
				Some(next)
			}
			None => None,
		}
	}

	pub fn read_file(&self, path: &[u8], client: ClientId) -> Result<Vec<u8>, StoreError> {
		let entry = self.find_entry(path)?;
		let data = entry.data.lock();
		if !data.opened_by.contains(&client) {
			return Err(StoreError::NotOpened);
		}
		Ok(data.bytes.clone())
	}

	/// `readN(n)`: the `n` oldest entries in the eviction queue (all of
	/// them when `n <= 0`), taken as a single snapshot under the store
	/// mutex so the count and the collect never race against a
	/// concurrent mutation of the queue.
	pub fn read_n(&self, n: i64) -> Vec<(Vec<u8>, Vec<u8>)> {
		let inner = self.inner.lock();
		let take = if n <= 0 { inner.eviction_queue.len() } else { n as usize };
		inner
			.eviction_queue
			.iter()
			.take(take)
			.filter_map(|path| {
				inner.files.get(path).map(|entry| (path.clone(), entry.data.lock().bytes.clone()))
			})
			.collect()
	}

	/// Snapshot of every remaining file, oldest-first, with sizes only
	/// (no payload copy) -- used for the shutdown-statistics report,
	/// not part of the client-facing protocol.
	pub fn remaining_files(&self) -> Vec<(Vec<u8>, usize)> {
		let inner = self.inner.lock();
		inner
			.eviction_queue
			.iter()
			.filter_map(|path| inner.files.get(path).map(|entry| (path.clone(), entry.data.lock().bytes.len())))
			.collect()
	}

	/// `append(path, client, buf)`: requires the client has the file
	/// open and does not hold the exclusive lock against it; runs
	/// eviction first if needed, then concatenates `buf`.
	pub fn append(
		&self,
		path: &[u8],
		client: ClientId,
		buf: &[u8],
	) -> Result<Vec<EvictedFile>, StoreError> {
		let entry = self.find_entry(path)?;
		self.authorise_write(&entry, client)?;

		let evicted = self.ensure_capacity(buf.len() as u64)?;

		let mut data = entry.data.lock();
		data.bytes.extend_from_slice(buf);
		let new_len = data.bytes.len() as u64;
		drop(data);
		self.current_bytes.fetch_add(buf.len() as u64, Ordering::SeqCst);
		self.note_bytes(self.current_bytes.load(Ordering::SeqCst));
		let _ = new_len;
		Ok(evicted)
	}

	/// `write(path, client)`: valid only when `client`'s last
	/// successful operation on `path` was `open(path, O_CREATE)` —
	/// authorisation is checked by the caller via the session table
	/// before this is invoked. Truncates to zero bytes, then behaves
	/// like `append`.
	pub fn write_file(
		&self,
		path: &[u8],
		client: ClientId,
		buf: &[u8],
	) -> Result<Vec<EvictedFile>, StoreError> {
		let entry = self.find_entry(path)?;
		self.authorise_write(&entry, client)?;

		if buf.len() as u64 > self.max_bytes {
			return Err(StoreError::TooBig);
		}

		let old_bytes = {
			let mut data = entry.data.lock();
			let old_len = data.bytes.len() as u64;
			self.current_bytes.fetch_sub(old_len, Ordering::SeqCst);
			std::mem::take(&mut data.bytes)
		};

		match self.ensure_capacity(buf.len() as u64) {
			Ok(evicted) => {
				let mut data = entry.data.lock();
				data.bytes.extend_from_slice(buf);
				drop(data);
				self.current_bytes.fetch_add(buf.len() as u64, Ordering::SeqCst);
				self.note_bytes(self.current_bytes.load(Ordering::SeqCst));
				Ok(evicted)
			}
			Err(e) => {
				// Refused: restore the file to its pre-write contents
				// rather than leaving it truncated.
				let mut data = entry.data.lock();
				data.bytes = old_bytes;
				let restored_len = data.bytes.len() as u64;
				drop(data);
				self.current_bytes.fetch_add(restored_len, Ordering::SeqCst);
				Err(e)
			}
		}
	}

	fn authorise_write(&self, entry: &Arc<FileEntry>, client: ClientId) -> Result<(), StoreError> {
		let data = entry.data.lock();
		if !data.opened_by.contains(&client) {
			return Err(StoreError::NotOpened);
		}
		if let Some(holder) = data.exclusive_holder {
			if holder != client {
				return Err(StoreError::Locked);
			}
		}
		Ok(())
	}

	/// `lock(path, client)`: grants immediately if free or already held
	/// by `client`; otherwise queues and returns `Queued`.
	pub fn lock_file(&self, path: &[u8], client: ClientId) -> Result<LockOutcome, StoreError> {
		let entry = self.find_entry(path)?;
		if !entry.data.lock().opened_by.contains(&client) {
			return Err(StoreError::NotOpened);
		}
		let mut data = entry.data.lock();
		Ok(self.resolve_lock(&mut data, client, true))
	}

	/// `unlock(path, client)`: releases iff `client` is the holder,
	/// granting the next waiter (if any).
	pub fn unlock_file(&self, path: &[u8], client: ClientId) -> Result<Option<ClientId>, StoreError> {
		let entry = self.find_entry(path)?;
		let mut data = entry.data.lock();
		if data.exclusive_holder != Some(client) {
			return Err(StoreError::Locked);
		}
		Ok(self.release_lock(&mut data))
	}

	/// `remove(path, client)`: requires `client` holds the exclusive
	/// lock; deletes the entry and its eviction-queue slot, waking all
	/// pending waiters with `FileGone`.
	pub fn remove_file(&self, path: &[u8], client: ClientId) -> Result<Vec<ClientId>, StoreError> {
		let mut inner = self.inner.lock();
		let entry = inner.files.get(path).cloned().ok_or(StoreError::NoSuchFile)?;
		{
			let data = entry.data.lock();
			if data.exclusive_holder != Some(client) {
				return Err(StoreError::Locked);
			}
		}
		inner.files.remove(path);
		inner.eviction_queue.retain(|p| p != path);
		drop(inner);

		let mut data = entry.data.lock();
		let freed = data.bytes.len() as u64;
		let waiters: Vec<ClientId> = data.waiters.drain(..).collect();
		data.exclusive_holder = None;
		drop(data);
		self.current_bytes.fetch_sub(freed, Ordering::SeqCst);
		Ok(waiters)
	}

	fn find_entry(&self, path: &[u8]) -> Result<Arc<FileEntry>, StoreError> {
		self.inner.lock().files.get(path).cloned().ok_or(StoreError::NoSuchFile)
	}

	/// FIFO capacity-eviction (§4.3). Called whenever a write-class
	/// operation would push `current_bytes` over `max_bytes`. Evicts
	/// the oldest entries, one at a time, until the incoming size fits;
	/// always evicts at least one file, since it is only ever invoked
	/// from a state that already exceeds capacity.
	fn ensure_capacity(&self, incoming: u64) -> Result<Vec<EvictedFile>, StoreError> {
		if incoming > self.max_bytes {
			return Err(StoreError::TooBig);
		}
		if self.current_bytes.load(Ordering::SeqCst) + incoming <= self.max_bytes {
			return Ok(Vec::new());
		}

		let mut evicted = Vec::new();
		while self.current_bytes.load(Ordering::SeqCst) + incoming > self.max_bytes {
			let mut inner = self.inner.lock();
			let victim_path = match inner.eviction_queue.pop_front() {
				Some(p) => p,
				None => break,
			};
			match inner.files.remove(&victim_path) {
				Some(entry) => {
					drop(inner);
					let mut data = entry.data.lock();
					let bytes = std::mem::take(&mut data.bytes);
					let gone_waiters: Vec<ClientId> = data.waiters.drain(..).collect();
					data.exclusive_holder = None;
					drop(data);
					self.current_bytes.fetch_sub(bytes.len() as u64, Ordering::SeqCst);
					evicted.push(EvictedFile { path: victim_path, bytes, gone_waiters });
				}
				None => {
					// Store/queue divergence: the path was in the eviction
					// queue but not in the map. Restore the popped entry to
					// the head so the queue stays consistent, then mark the
					// store poisoned so the caller escalates to shutdown.
					inner.eviction_queue.push_front(victim_path);
					self.poisoned.store(true, Ordering::SeqCst);
					return Err(StoreError::NoSuchFile);
				}
			}
		}
		if !evicted.is_empty() {
			self.stats.lock().eviction_invocations += 1;
		}
		Ok(evicted)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cid(n: u64) -> ClientId {
		ClientId(n)
	}

	#[test]
	fn create_and_read_roundtrip() {
		let store = FileStore::new(100, 1024);
		let a = cid(1);
		assert_eq!(store.open_file(b"x", a, O_CREATE).unwrap(), LockOutcome::Granted);
		let evicted = store.append(b"x", a, b"hello").unwrap();
		assert!(evicted.is_empty());
		assert_eq!(store.read_file(b"x", a).unwrap(), b"hello");
		assert_eq!(store.current_bytes(), 5);
	}

	#[test]
	fn open_create_on_existing_file_fails() {
		let store = FileStore::new(100, 1024);
		let a = cid(1);
		store.open_file(b"x", a, O_CREATE).unwrap();
		assert_eq!(store.open_file(b"x", cid(2), O_CREATE).unwrap_err(), StoreError::AlreadyCreated);
	}

	#[test]
	fn open_missing_without_create_fails() {
		let store = FileStore::new(100, 1024);
		assert_eq!(store.open_file(b"x", cid(1), 0).unwrap_err(), StoreError::NoSuchFile);
	}

	#[test]
	fn too_many_files() {
		let store = FileStore::new(1, 1024);
		store.open_file(b"x", cid(1), O_CREATE).unwrap();
		assert_eq!(store.open_file(b"y", cid(1), O_CREATE).unwrap_err(), StoreError::TooManyFiles);
	}

	#[test]
	fn append_too_big() {
		let store = FileStore::new(100, 4);
		let a = cid(1);
		store.open_file(b"x", a, O_CREATE).unwrap();
		assert_eq!(store.append(b"x", a, b"12345678").unwrap_err(), StoreError::TooBig);
		assert_eq!(store.current_bytes(), 0);
	}

	#[test]
	fn eviction_on_capacity_miss() {
		let store = FileStore::new(100, 10);
		let a = cid(1);
		store.open_file(b"a", a, O_CREATE).unwrap();
		store.append(b"a", a, &[0u8; 7]).unwrap();
		let evicted = store.append(b"b", a, &[0u8; 5]).err();
		// "b" was never opened by `a`; open it first.
		assert_eq!(evicted, Some(StoreError::NotOpened));
		store.open_file(b"b", a, O_CREATE).unwrap();
		let evicted = store.append(b"b", a, &[0u8; 5]).unwrap();
		assert_eq!(evicted.len(), 1);
		assert_eq!(evicted[0].path, b"a");
		assert_eq!(evicted[0].bytes.len(), 7);
		assert_eq!(store.stats().eviction_invocations, 1);
		assert!(store.read_file(b"a", a).is_err());
	}

	#[test]
	fn append_without_open_is_not_opened() {
		let store = FileStore::new(100, 1024);
		store.open_file(b"x", cid(1), O_CREATE).unwrap();
		assert_eq!(store.append(b"x", cid(2), b"hi").unwrap_err(), StoreError::NotOpened);
	}

	#[test]
	fn lock_then_unlock_releases() {
		let store = FileStore::new(100, 1024);
		let a = cid(1);
		store.open_file(b"f", a, O_CREATE | O_LOCK).unwrap();
		assert_eq!(store.unlock_file(b"f", a).unwrap(), None);
	}

	#[test]
	fn lock_contention_queues_then_grants_on_unlock() {
		let store = FileStore::new(100, 1024);
		let a = cid(1);
		let b = cid(2);
		assert_eq!(store.open_file(b"f", a, O_CREATE | O_LOCK).unwrap(), LockOutcome::Granted);
		store.open_file(b"f", b, 0).unwrap();
		assert_eq!(store.lock_file(b"f", b).unwrap(), LockOutcome::Queued);
		let granted = store.unlock_file(b"f", a).unwrap();
		assert_eq!(granted, Some(b));
	}

	#[test]
	fn remove_requires_exclusive_lock() {
		let store = FileStore::new(100, 1024);
		let a = cid(1);
		store.open_file(b"f", a, O_CREATE).unwrap();
		assert_eq!(store.remove_file(b"f", a).unwrap_err(), StoreError::Locked);
		store.lock_file(b"f", a).unwrap();
		let woken = store.remove_file(b"f", a).unwrap();
		assert!(woken.is_empty());
		assert!(store.read_file(b"f", a).is_err());
	}

	#[test]
	fn remove_wakes_waiters_with_file_gone() {
		let store = FileStore::new(100, 1024);
		let a = cid(1);
		let b = cid(2);
		store.open_file(b"f", a, O_CREATE | O_LOCK).unwrap();
		store.open_file(b"f", b, 0).unwrap();
		assert_eq!(store.lock_file(b"f", b).unwrap(), LockOutcome::Queued);
		let woken = store.remove_file(b"f", a).unwrap();
		assert_eq!(woken, vec![b]);
	}

	#[test]
	fn create_remove_create_succeeds_twice() {
		let store = FileStore::new(100, 1024);
		let a = cid(1);
		store.open_file(b"p", a, O_CREATE).unwrap();
		store.lock_file(b"p", a).unwrap();
		store.remove_file(b"p", a).unwrap();
		assert_eq!(store.open_file(b"p", a, O_CREATE).unwrap(), LockOutcome::Granted);
	}

	#[test]
	fn append_empty_is_noop_on_size() {
		let store = FileStore::new(100, 1024);
		let a = cid(1);
		store.open_file(b"p", a, O_CREATE).unwrap();
		store.append(b"p", a, b"").unwrap();
		assert_eq!(store.current_bytes(), 0);
	}

	#[test]
	fn read_n_snapshots_oldest_first() {
		let store = FileStore::new(100, 1024);
		let a = cid(1);
		store.open_file(b"a", a, O_CREATE).unwrap();
		store.append(b"a", a, b"12").unwrap();
		store.open_file(b"b", a, O_CREATE).unwrap();
		store.append(b"b", a, b"345").unwrap();
		let all = store.read_n(0);
		assert_eq!(all.len(), 2);
		assert_eq!(all[0].0, b"a");
		assert_eq!(all[1].0, b"b");
		let one = store.read_n(1);
		assert_eq!(one.len(), 1);
		assert_eq!(one[0].0, b"a");
	}
}

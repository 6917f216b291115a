//! Client session table: tracks each connected client's last successful
//! operation so `write(p)` can be authorised only when it follows
//! `open(p, O_CREATE)`.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Opaque per-connection identifier minted by the dispatcher on accept.
/// Stands in for the raw socket fd the original keyed sessions by: this
/// crate's sockets move between the dispatcher and worker threads, so a
/// surrogate key that stays stable across that hand-off is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

pub struct ClientIdGen {
	next: AtomicU64,
}

impl ClientIdGen {
	pub fn new() -> ClientIdGen {
		ClientIdGen { next: AtomicU64::new(1) }
	}

	pub fn next(&self) -> ClientId {
		ClientId(self.next.fetch_add(1, Ordering::Relaxed))
	}
}

impl Default for ClientIdGen {
	fn default() -> ClientIdGen {
		ClientIdGen::new()
	}
}

#[derive(Clone)]
pub struct LastOp {
	pub op: u8,
	pub flags: u8,
	pub path: Option<Vec<u8>>,
}

pub struct Session {
	pub socket: UnixStream,
	pub last_op: Option<LastOp>,
}

/// Sessions indexed by `ClientId`. Guarded by a single `RwLock`: reads
/// (most operations only need to authorise against `last_op`) don't
/// contend with each other, only with session add/remove.
pub struct SessionTable {
	sessions: RwLock<HashMap<ClientId, Session>>,
}

impl SessionTable {
	pub fn new() -> SessionTable {
		SessionTable { sessions: RwLock::new(HashMap::new()) }
	}

	pub fn add(&self, id: ClientId, socket: UnixStream) {
		self.sessions.write().insert(id, Session { socket, last_op: None });
	}

	pub fn remove(&self, id: ClientId) -> Option<Session> {
		self.sessions.write().remove(&id)
	}

	pub fn update_last_op(&self, id: ClientId, op: u8, flags: u8, path: Option<Vec<u8>>) {
		if let Some(session) = self.sessions.write().get_mut(&id) {
			session.last_op = Some(LastOp { op, flags, path });
		}
	}

	pub fn last_op(&self, id: ClientId) -> Option<LastOp> {
		self.sessions.read().get(&id).and_then(|s| s.last_op.clone())
	}

	pub fn try_clone_socket(&self, id: ClientId) -> std::io::Result<Option<UnixStream>> {
		match self.sessions.read().get(&id) {
			Some(session) => session.socket.try_clone().map(Some),
			None => Ok(None),
		}
	}

	pub fn len(&self) -> usize {
		self.sessions.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn contains(&self, id: ClientId) -> bool {
		self.sessions.read().contains_key(&id)
	}

	pub fn ids(&self) -> Vec<ClientId> {
		self.sessions.read().keys().copied().collect()
	}
}

impl Default for SessionTable {
	fn default() -> SessionTable {
		SessionTable::new()
	}
}

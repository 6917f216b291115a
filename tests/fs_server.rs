//! End-to-end scenarios driven as a real client would: connect over a
//! `UnixStream`, speak the wire protocol, and read back whatever the
//! dispatcher/worker-pool/engine stack actually produces.

mod common;

use std::thread;
use std::time::Duration;

use filed::channel::TermMode;
use filed::error::ErrorTag;

use common::{append, close, lock, open, read_file, send_request, write, TestServer};

#[test]
fn create_and_read_round_trips() {
	let server = TestServer::start(10, 1024, 2);
	let mut client = server.connect();

	let r = open(&mut client, b"greeting", true, false);
	assert!(r.header.status_ok);

	let r = write(&mut client, b"greeting", b"hello, world");
	assert!(r.header.status_ok);
	assert!(r.tail.is_empty());

	let r = close(&mut client, b"greeting");
	assert!(r.header.status_ok);

	let r = open(&mut client, b"greeting", false, false);
	assert!(r.header.status_ok);

	let r = read_file(&mut client, b"greeting");
	assert!(r.header.status_ok);
	assert_eq!(r.read_payload, b"hello, world");

	let r = close(&mut client, b"greeting");
	assert!(r.header.status_ok);
}

#[test]
fn append_evicts_oldest_file_first() {
	// Small enough that a second 6-byte file doesn't fit alongside the
	// first without evicting it.
	let server = TestServer::start(10, 10, 2);
	let mut client = server.connect();

	assert!(open(&mut client, b"a", true, false).header.status_ok);
	assert!(write(&mut client, b"a", b"aaaaaa").header.status_ok);

	assert!(open(&mut client, b"b", true, false).header.status_ok);
	let r = append(&mut client, b"b", b"bbbbbb");
	assert!(r.header.status_ok);
	assert_eq!(r.tail.len(), 1);
	assert_eq!(r.tail[0].0, b"a");
	assert_eq!(r.tail[0].1, b"aaaaaa");

	assert_eq!(server.engine.store.stats().eviction_invocations, 1);

	let r = read_file(&mut client, b"b");
	assert!(r.header.status_ok);
	assert_eq!(r.read_payload, b"bbbbbb");
}

#[test]
fn write_larger_than_capacity_is_refused() {
	let server = TestServer::start(10, 10, 2);
	let mut client = server.connect();

	assert!(open(&mut client, b"a", true, false).header.status_ok);
	let r = write(&mut client, b"a", b"this payload is far too large");
	assert!(!r.header.status_ok);
	assert_eq!(r.header.errcode, ErrorTag::TooBig.as_u8());
}

#[test]
fn second_locker_waits_and_is_granted_on_release() {
	let server = TestServer::start(10, 1024, 2);
	let sock_path = server.sock_path.clone();

	let mut owner = server.connect();
	assert!(open(&mut owner, b"locked", true, true).header.status_ok);

	let waiter = thread::spawn(move || {
		let mut client = std::os::unix::net::UnixStream::connect(&sock_path).unwrap();
		// Blocks until the holder releases the lock.
		let reply = open(&mut client, b"locked", false, true);
		(client, reply)
	});

	// Give the waiter a chance to actually queue before releasing.
	thread::sleep(Duration::from_millis(100));
	assert!(close(&mut owner, b"locked").header.status_ok);

	let (mut waiter_client, reply) = waiter.join().unwrap();
	assert!(reply.header.status_ok);
	assert!(close(&mut waiter_client, b"locked").header.status_ok);
}

#[test]
fn removed_file_wakes_waiters_with_file_gone() {
	let server = TestServer::start(10, 1024, 2);
	let sock_path = server.sock_path.clone();

	let mut owner = server.connect();
	assert!(open(&mut owner, b"doomed", true, true).header.status_ok);

	let waiter = thread::spawn(move || {
		let mut client = std::os::unix::net::UnixStream::connect(&sock_path).unwrap();
		assert!(open(&mut client, b"doomed", false, false).header.status_ok);
		lock(&mut client, b"doomed")
	});

	thread::sleep(Duration::from_millis(100));
	let r = send_request(&mut owner, filed::protocol::OpCode::Remove, 0, b"doomed", &[]);
	assert!(r.header.status_ok);

	let reply = waiter.join().unwrap();
	assert!(!reply.header.status_ok);
	assert_eq!(reply.header.errcode, ErrorTag::FileGone.as_u8());
}

#[test]
fn slow_termination_drains_before_shutting_down() {
	let mut server = TestServer::start(10, 1024, 2);
	let mut client = server.connect();
	assert!(open(&mut client, b"lingering", true, false).header.status_ok);

	server.send_term(TermMode::Slow);

	// The server must still serve this already-connected client.
	assert!(write(&mut client, b"lingering", b"still here").header.status_ok);
	assert!(close(&mut client, b"lingering").header.status_ok);
	drop(client);

	let shutdown = server.join_shutdown();
	assert_eq!(shutdown, filed::dispatcher::Shutdown::Slow);
}

#[test]
fn fast_termination_tears_down_immediately() {
	let mut server = TestServer::start(10, 1024, 2);
	let mut client_a = server.connect();
	let mut client_b = server.connect();
	assert!(open(&mut client_a, b"x", true, false).header.status_ok);
	assert!(open(&mut client_b, b"y", true, false).header.status_ok);

	let shutdown = server.terminate(TermMode::Fast);
	assert_eq!(shutdown, filed::dispatcher::Shutdown::Fast);
}

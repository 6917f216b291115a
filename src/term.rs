//! Termination coordinator: a dedicated thread that blocks on
//! `sigwait` for `SIGHUP`/`SIGINT`/`SIGQUIT` and translates whichever
//! one arrives first into a `TermMode` on the termination channel.
//!
//! Every other thread in the process masks these three signals before
//! this thread is spawned (see `main`), so `sigwait` here is the only
//! place they are ever observed.

use std::io;
use std::mem::MaybeUninit;
use std::thread::{self, JoinHandle};

use crate::channel::{TermMode, TermSender};

/// The three signals the coordinator waits on.
fn term_sigset() -> io::Result<libc::sigset_t> {
	unsafe {
		let mut set = MaybeUninit::<libc::sigset_t>::uninit();
		if libc::sigemptyset(set.as_mut_ptr()) != 0 {
			return Err(io::Error::last_os_error());
		}
		let mut set = set.assume_init();
		for sig in [libc::SIGHUP, libc::SIGINT, libc::SIGQUIT] {
			if libc::sigaddset(&mut set, sig) != 0 {
				return Err(io::Error::last_os_error());
			}
		}
		Ok(set)
	}
}

/// Blocks the given signal set on the calling thread. Called from
/// `main` on every thread spawned before the coordinator, so the
/// coordinator is the only thread `sigwait` can ever deliver to.
pub fn block_signals(set: &libc::sigset_t) -> io::Result<()> {
	unsafe {
		let rc = libc::pthread_sigmask(libc::SIG_BLOCK, set, std::ptr::null_mut());
		if rc != 0 {
			return Err(io::Error::from_raw_os_error(rc));
		}
	}
	Ok(())
}

pub fn signal_set() -> io::Result<libc::sigset_t> {
	term_sigset()
}

/// Spawns the coordinator thread. It masks its own signal set again
/// defensively (threads inherit their creator's mask, so this is
/// normally a no-op) and waits once: the server only ever shuts down
/// one way.
pub fn spawn(set: libc::sigset_t, sender: TermSender) -> JoinHandle<()> {
	thread::Builder::new()
		.name("term-coordinator".to_string())
		.spawn(move || {
			let mut raw_sig: i32 = 0;
			let rc = unsafe { libc::sigwait(&set, &mut raw_sig) };
			if rc != 0 {
				return;
			}
			let mode = match raw_sig {
				libc::SIGINT | libc::SIGQUIT => TermMode::Fast,
				libc::SIGHUP => TermMode::Slow,
				_ => TermMode::Fast,
			};
			let _ = sender.send(mode);
		})
		.expect("failed to spawn termination coordinator thread")
}

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixListener;
use std::process;
use std::sync::Arc;

use clap::{App, Arg};
use log::info;

use filed::channel::{feedback_channel, term_channel};
use filed::config::parse_config;
use filed::dispatcher::{Dispatcher, Shutdown};
use filed::engine::Engine;
use filed::logging::Logger;
use filed::session::SessionTable;
use filed::store::FileStore;
use filed::term;
use filed::worker::{SlowTermFlag, WorkerPool};

fn main() {
	env_logger::init();
	process::exit(run());
}

fn run() -> i32 {
	unsafe {
		libc::signal(libc::SIGPIPE, libc::SIG_IGN);
	}

	let matches = App::new("filed")
		.about("In-memory FIFO-evicting file store, served over a Unix domain socket")
		.arg(
			Arg::with_name("config")
				.short("f")
				.takes_value(true)
				.value_name("PATH")
				.help("Path to the server's configuration file"),
		)
		.get_matches();

	let conf_path = matches.value_of("config").map(std::path::Path::new);
	let params = match parse_config(conf_path) {
		Ok(p) => p,
		Err(e) => {
			eprintln!("filed: failed to parse configuration: {}", e);
			return 1;
		}
	};

	let logger = match Logger::open(&params.log_path) {
		Ok(l) => l,
		Err(e) => {
			eprintln!("filed: failed to open log file {:?}: {}", params.log_path, e);
			return 1;
		}
	};
	logger.log("server starting up", None);

	let store = FileStore::new(params.max_files, params.max_memsz);
	let sessions = SessionTable::new();

	let (feedback_tx, feedback_rx) = match feedback_channel() {
		Ok(pair) => pair,
		Err(e) => {
			logger.log_io_error("failed to create the feedback channel", &e);
			return e.raw_os_error().unwrap_or(1);
		}
	};
	let (term_tx, term_rx) = match term_channel() {
		Ok(pair) => pair,
		Err(e) => {
			logger.log_io_error("failed to create the termination channel", &e);
			return e.raw_os_error().unwrap_or(1);
		}
	};

	let _ = fs::remove_file(&params.sock_path);
	let listener = match bind_with_max_backlog(&params.sock_path) {
		Ok(l) => l,
		Err(e) => {
			logger.log_io_error("failed to bind the listening socket", &e);
			return e.raw_os_error().unwrap_or(1);
		}
	};

	// Every thread but the termination coordinator keeps SIGHUP/SIGINT/
	// SIGQUIT blocked, so the coordinator's sigwait is the only place
	// they are ever observed.
	let sigset = match term::signal_set() {
		Ok(s) => s,
		Err(e) => {
			logger.log_io_error("failed to build the termination signal set", &e);
			return e.raw_os_error().unwrap_or(1);
		}
	};
	if let Err(e) = term::block_signals(&sigset) {
		logger.log_io_error("failed to block termination signals on the main thread", &e);
		return e.raw_os_error().unwrap_or(1);
	}

	let engine = Arc::new(Engine::new(store, sessions, logger, Arc::new(feedback_tx)));
	let queue = Arc::new(filed::queue::JobQueue::new());
	let slow_term = Arc::new(SlowTermFlag::new());

	let term_handle = term::spawn(sigset, term_tx);
	let pool = WorkerPool::spawn(params.thread_pool, engine.clone(), queue.clone(), slow_term.clone());

	let dispatcher = Dispatcher::new(
		listener,
		feedback_rx,
		term_rx,
		queue.clone(),
		engine.clone(),
		slow_term,
		params.thread_pool,
	);

	let shutdown = match dispatcher.run() {
		Ok(s) => s,
		Err(e) => {
			engine.logger.log_io_error("dispatcher loop terminated abnormally", &e);
			// The coordinator is still parked in sigwait; nudge it so
			// this thread doesn't hang waiting to join it.
			unsafe {
				libc::raise(libc::SIGINT);
			}
			// Workers may be parked on an empty queue with no other way
			// to learn the server is going down; retire them directly.
			queue.clear();
			for _ in 0..params.thread_pool {
				queue.push(filed::queue::term_job());
			}
			queue.notify_all();
			pool.join();
			let _ = term_handle.join();
			return e.raw_os_error().unwrap_or(1);
		}
	};

	pool.join();
	let _ = term_handle.join();

	let stats = engine.store.stats();
	let remaining = engine.store.remaining_files();
	let message = match shutdown {
		Shutdown::Fast => "fast termination (SIGINT/SIGQUIT)",
		Shutdown::Slow => "slow termination (SIGHUP)",
	};
	let remaining_list = remaining
		.iter()
		.map(|(path, size)| format!("{}:{}", String::from_utf8_lossy(path), size))
		.collect::<Vec<_>>()
		.join(", ");

	info!("{}", message);
	println!(
		"[filed] shutdown: {}; max files {}, max bytes {}, evictions {}, max connected clients {}, remaining files (oldest first): [{}]",
		message,
		stats.max_files_used,
		stats.max_bytes_used,
		stats.eviction_invocations,
		stats.max_connected_clients,
		remaining_list
	);
	engine.logger.log(
		&format!(
			"shutdown complete: {}; max_files={} max_bytes={} evictions={} max_clients={} remaining=[{}]",
			message,
			stats.max_files_used,
			stats.max_bytes_used,
			stats.eviction_invocations,
			stats.max_connected_clients,
			remaining_list
		),
		None,
	);

	0
}

/// Binds the listening socket with a `listen` backlog of `SOMAXCONN`
/// rather than the fixed 128 `std::os::unix::net::UnixListener::bind`
/// requests internally.
fn bind_with_max_backlog(path: &std::path::Path) -> io::Result<UnixListener> {
	let c_path = CString::new(path.as_os_str().as_bytes())
		.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

	unsafe {
		let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}

		let mut addr: libc::sockaddr_un = std::mem::zeroed();
		addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
		let bytes = c_path.as_bytes_with_nul();
		if bytes.len() > addr.sun_path.len() {
			libc::close(fd);
			return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
		}
		for (dst, &src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
			*dst = src as libc::c_char;
		}

		let addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
		if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len) != 0 {
			let err = io::Error::last_os_error();
			libc::close(fd);
			return Err(err);
		}
		if libc::listen(fd, libc::SOMAXCONN) != 0 {
			let err = io::Error::last_os_error();
			libc::close(fd);
			return Err(err);
		}

		Ok(UnixListener::from_raw_fd(fd))
	}
}

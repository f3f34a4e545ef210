/*
 * imapmirror - a one-way incremental IMAP mailbox mirror.
 *
 * Copyright 2024 imapmirror developers
 *
 * This file is part of imapmirror.
 *
 * imapmirror is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * imapmirror is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with imapmirror. If not, see <http://www.gnu.org/licenses/>.
 */

use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

mod conf;
mod error;
mod imap;
mod lockdir;
mod oauth2;
mod sink;
mod state;

use conf::MirrorConf;
use error::{Error, ErrorKind, Result};
use imap::ImapConnection;
use lockdir::DirLock;
use sink::Sink;
use state::UidCheckpoint;

/// Pause between a transport failure and the next connection attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// True once INT or TERM arrived; loops poll this at their edges and
/// blocked reads observe it through EINTR.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

extern "C" fn handle_termination(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_termination as libc::sighandler_t;
        // sa_flags without SA_RESTART: blocked reads must wake with EINTR
        libc::sigemptyset(&mut action.sa_mask);
        for signum in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(Error::new("could not install signal handlers"));
            }
        }
    }
    Ok(())
}

fn print_usage() {
    print!(
        "imapmirror {}\nUsage: imapmirror <directory>\n\n\
         Mirrors new messages of one remote IMAP folder into <directory>/mbox\n\
         (or a configured command), resuming where the previous run stopped.\n\n\
         <directory> must contain a `config` file with at least `server`,\n\
         `user`, one of `pass`/`xoauth2_access_token`/`xoauth2_request_url`,\n\
         and `folder` or `folder_flag`.\n\n\
         Options:\n  -h, --help    print this text and exit\n",
        env!("CARGO_PKG_VERSION")
    );
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().skip(1).any(|arg| arg == "-h" || arg == "--help") {
        print_usage();
        std::process::exit(0);
    }
    if args.len() != 2 {
        print_usage();
        std::process::exit(2);
    }

    let level = if std::env::var_os("IMAPMIRROR_DEBUG").is_some() {
        log::Level::Trace
    } else {
        log::Level::Info
    };
    if let Err(err) = simple_logger::init_with_level(level) {
        eprintln!("could not initialize logging: {}", err);
    }

    if let Err(err) = run(Path::new(&args[1])) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn run(directory: &Path) -> Result<()> {
    install_signal_handlers()?;
    let conf = MirrorConf::load(directory)?;
    let _lock = DirLock::acquire(directory)?;
    let checkpoint = UidCheckpoint::new(directory);
    let mut sink = Sink::from_conf(&conf);

    loop {
        if shutdown_requested() {
            return Ok(());
        }
        match run_session(&conf, &checkpoint, &mut sink) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind == ErrorKind::Interrupted => return Ok(()),
            Err(err) if err.kind.is_recoverable() => {
                log::warn!(
                    "{}; reconnecting in {} seconds",
                    err,
                    RECONNECT_DELAY.as_secs()
                );
                sleep_interruptibly(RECONNECT_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

/// One session: fresh connection, auth, folder selection, then the sync
/// state machine until it fails or shutdown is requested.
fn run_session(conf: &MirrorConf, checkpoint: &UidCheckpoint, sink: &mut Sink) -> Result<()> {
    let mut conn = ImapConnection::connect_and_login(conf)?;
    let folder = conn.resolve_folder(conf)?;
    conn.examine(&folder)?;
    match imap::sync::run(&mut conn, checkpoint, sink) {
        Err(err) if err.kind == ErrorKind::Interrupted => {
            log::info!("shutting down");
            let _ = conn.stream.send_unsolicited_logout();
            Ok(())
        }
        other => other,
    }
}

fn sleep_interruptibly(total: Duration) {
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown_requested() {
        let step = remaining.min(Duration::from_secs(1));
        std::thread::sleep(step);
        remaining -= step;
    }
}

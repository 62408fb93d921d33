use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use signal_hook::iterator::Signals;
use tracing::info;

/// Watches for SIGTERM/SIGINT and exits the process once they arrive.
/// There is no listening socket file to clean up here (unlike a unix
/// socket based daemon), so shutdown is just "stop accepting and exit";
/// in-flight client threads are daemon threads and are dropped with the
/// process.
pub struct Handler;

impl Handler {
    pub fn new() -> Self {
        Handler
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;

        thread::spawn(move || {
            for signal in &mut signals {
                let term_sig = signal as libc::c_int;
                assert!(TERM_SIGNALS.contains(&term_sig));
                info!(signal = term_sig, "term signal received, exiting");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}

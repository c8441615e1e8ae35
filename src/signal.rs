use crossbeam_channel::{Receiver, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const FLAG_POLL: Duration = Duration::from_millis(200);

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_signum: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs SIGINT (and SIGTERM on unix) handlers and returns a channel that
/// receives one message once either arrives.
pub fn install() -> Receiver<()> {
    let handler = on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        #[cfg(unix)]
        libc::signal(libc::SIGTERM, handler);
    }

    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        loop {
            if STOP_REQUESTED.load(Ordering::SeqCst) {
                tracing::info!("stop signal received");
                let _ = tx.send(());
                return;
            }
            thread::sleep(FLAG_POLL);
        }
    });
    rx
}

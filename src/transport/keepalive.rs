//! Host-side driver for a session's asynchronous hooks.
//!
//! On a microcontroller the receive interrupt and a periodic timer call
//! [`DiagnosticTransport::on_receive_interrupt`] and
//! [`DiagnosticTransport::on_timer_tick`]. On a host both run from one
//! background thread that shares the session with the foreground through a
//! mutex. The session itself decides whether its listener is armed.

use super::DiagnosticTransport;
use crate::error::{AutomotiveError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Running keep-alive thread; stopped and joined on drop.
pub struct KeepAlive {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Poll `session`'s hooks every `period` until the returned handle is dropped.
pub fn spawn<T>(session: Arc<Mutex<T>>, period: Duration) -> Result<KeepAlive>
where
    T: DiagnosticTransport + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let running_t = running.clone();

    let handle = std::thread::Builder::new()
        .name("candiag-keepalive".into())
        .spawn(move || {
            tracing::debug!(?period, "keep-alive thread started");
            while running_t.load(Ordering::Relaxed) {
                {
                    let mut session = session.lock();
                    session.on_receive_interrupt();
                    session.on_timer_tick();
                }
                std::thread::sleep(period);
            }
            tracing::debug!("keep-alive thread stopped");
        })
        .map_err(|err| AutomotiveError::LinkError(format!("keep-alive thread: {}", err)))?;

    Ok(KeepAlive {
        running,
        handle: Some(handle),
    })
}

impl KeepAlive {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("keep-alive thread panicked");
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.shutdown();
    }
}

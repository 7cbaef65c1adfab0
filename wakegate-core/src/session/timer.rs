//! Deferred stop: engines keep running for a short while after a detection so
//! a client that restarts quickly does not pay for a full stop/start cycle.
//!
//! One timer thread per session. Arming replaces any pending deadline;
//! cancelling clears it. The expiry callback runs on the timer thread with no
//! lock held.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;

enum Command {
    Arm,
    Cancel,
    Shutdown,
}

pub(crate) struct DeferredStop {
    tx: Sender<Command>,
    rx: Mutex<Option<Receiver<Command>>>,
    delay: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredStop {
    pub(crate) fn new(delay: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            delay,
            worker: Mutex::new(None),
        }
    }

    /// Spawns the timer thread. `on_expire` runs once per armed deadline that
    /// was neither cancelled nor re-armed.
    pub(crate) fn spawn(&self, name: String, on_expire: impl Fn() + Send + 'static) -> Result<()> {
        let Some(rx) = self.rx.lock().take() else {
            return Ok(());
        };
        let delay = self.delay;
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(rx, delay, on_expire))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    pub(crate) fn arm(&self) {
        trace!(delay_ms = self.delay.as_millis() as u64, "deferred stop armed");
        let _ = self.tx.send(Command::Arm);
    }

    pub(crate) fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel);
    }
}

impl Drop for DeferredStop {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            // The last session handle can be released from the timer thread
            // itself, in which case the thread exits on its own.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(rx: Receiver<Command>, delay: Duration, on_expire: impl Fn()) {
    let mut deadline: Option<Instant> = None;
    loop {
        let command = match deadline {
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
            Some(at) => match rx.recv_deadline(at) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    deadline = None;
                    debug!("deferred stop fired");
                    on_expire();
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };
        match command {
            Command::Arm => deadline = Some(Instant::now() + delay),
            Command::Cancel => deadline = None,
            Command::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn timer(delay_ms: u64) -> (DeferredStop, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = DeferredStop::new(Duration::from_millis(delay_ms));
        let counter = Arc::clone(&fired);
        timer
            .spawn("test-deferred-stop".into(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        (timer, fired)
    }

    #[test]
    fn armed_timer_fires_once() {
        let (timer, fired) = timer(20);
        timer.arm();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_expiry() {
        let (timer, fired) = timer(50);
        timer.arm();
        timer.cancel();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearm_pushes_the_deadline_out() {
        let (timer, fired) = timer(80);
        timer.arm();
        thread::sleep(Duration::from_millis(40));
        timer.arm();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_joins_the_thread() {
        let (timer, fired) = timer(1_000);
        timer.arm();
        drop(timer);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

//! Single-shot restartable timer.

use {
    log::{trace, warn},
    parking_lot::{Condvar, Mutex},
    std::{
        sync::Arc,
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

#[derive(Debug, Default)]
struct Timer {
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    timer: Mutex<Timer>,
    changed: Condvar,
}

/// Runs a callback once if not stopped or restarted before the timeout.
pub struct Watchdog {
    shared: Arc<Shared>,
    timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Create a disarmed watchdog that calls `on_fire` from its own thread.
    pub fn new<F>(name: &str, timeout: Duration, on_fire: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("{name}-watchdog"))
            .spawn(move || run(&worker_shared, &on_fire))
            .map_err(|e| warn!("Failed to spawn watchdog thread: {e}"))
            .ok();

        Self {
            shared,
            timeout,
            worker,
        }
    }

    /// Arm (or re-arm) the timer.
    pub fn start(&self) {
        let mut timer = self.shared.timer.lock();
        timer.deadline = Some(Instant::now() + self.timeout);
        self.shared.changed.notify_all();
        trace!("Watchdog armed for {:?}", self.timeout);
    }

    /// Disarm the timer.
    pub fn stop(&self) {
        let mut timer = self.shared.timer.lock();
        timer.deadline = None;
        self.shared.changed.notify_all();
    }

    /// Whether the timer is armed.
    pub fn is_armed(&self) -> bool {
        self.shared.timer.lock().deadline.is_some()
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let mut timer = self.shared.timer.lock();
            timer.shutdown = true;
            self.shared.changed.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run(shared: &Shared, on_fire: &dyn Fn()) {
    let mut timer = shared.timer.lock();
    loop {
        if timer.shutdown {
            return;
        }
        let deadline = timer.deadline;
        match deadline {
            None => shared.changed.wait(&mut timer),
            Some(deadline) if Instant::now() >= deadline => {
                timer.deadline = None;
                drop(timer);
                on_fire();
                timer = shared.timer.lock();
            },
            Some(deadline) => {
                shared.changed.wait_until(&mut timer, deadline);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(timeout: Duration) -> (Watchdog, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let dog = Watchdog::new("test", timeout, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (dog, fired)
    }

    #[test]
    fn test_fires_once_after_timeout() {
        let (dog, fired) = counting(Duration::from_millis(20));
        dog.start();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!dog.is_armed());
    }

    #[test]
    fn test_stop_prevents_firing() {
        let (dog, fired) = counting(Duration::from_millis(30));
        dog.start();
        dog.stop();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_pushes_deadline_out() {
        let (dog, fired) = counting(Duration::from_millis(60));
        dog.start();
        thread::sleep(Duration::from_millis(40));
        dog.start();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_never_armed_never_fires() {
        let (dog, fired) = counting(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(20));
        drop(dog);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

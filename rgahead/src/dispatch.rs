//! Ordered single-consumer work queue.
//!
//! Channel notifications arrive on the reader thread. Handlers that may block
//! (waiting for the device lock, running validators) are pushed onto a
//! [`DispatchQueue`] so the reader keeps draining the port while a dedicated
//! worker runs the jobs one at a time, in the order they were enqueued.

use log::{trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// FIFO queue with one dedicated consumer thread.
pub struct DispatchQueue {
    name: String,
    sender: Option<Sender<Job>>,
    depth: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl DispatchQueue {
    /// Spawn the consumer thread for a new queue.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = Arc::clone(&depth);

        let worker = thread::Builder::new()
            .name(format!("dispatch-{name}"))
            .spawn(move || {
                for job in receiver {
                    job();
                    worker_depth.fetch_sub(1, Ordering::AcqRel);
                }
            })
            .map_err(|e| warn!("Failed to spawn dispatch worker: {e}"))
            .ok();

        Self {
            name,
            sender: Some(sender),
            depth,
            worker,
        }
    }

    /// Queue a job. Never blocks.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return;
        };
        self.depth.fetch_add(1, Ordering::AcqRel);
        if sender.send(Box::new(job)).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            trace!("Dispatch queue {} is shut down, job dropped", self.name);
        }
    }

    /// Jobs queued or running.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Shared handle to the depth counter.
    pub fn depth_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.depth)
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        // Closing the sender ends the worker loop once the backlog is drained.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_enqueue_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let queue = DispatchQueue::new("order");
            for i in 0..100 {
                let seen = Arc::clone(&seen);
                queue.enqueue(move || seen.lock().push(i));
            }
        }
        let seen = seen.lock();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_jobs_never_overlap() {
        let running = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let producers_log = Arc::new(Mutex::new(Vec::new()));
        {
            let queue = Arc::new(DispatchQueue::new("overlap"));
            let mut producers = Vec::new();
            for p in 0..4 {
                let queue = Arc::clone(&queue);
                let running = Arc::clone(&running);
                let overlapped = Arc::clone(&overlapped);
                let log = Arc::clone(&producers_log);
                producers.push(thread::spawn(move || {
                    for i in 0..25 {
                        let running = Arc::clone(&running);
                        let overlapped = Arc::clone(&overlapped);
                        let log = Arc::clone(&log);
                        queue.enqueue(move || {
                            if running.swap(true, Ordering::SeqCst) {
                                overlapped.store(true, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_micros(50));
                            log.lock().push((p, i));
                            running.store(false, Ordering::SeqCst);
                        });
                    }
                }));
            }
            for producer in producers {
                producer.join().unwrap();
            }
        }

        assert!(!overlapped.load(Ordering::SeqCst));
        let log = producers_log.lock();
        assert_eq!(log.len(), 100);
        // Per-producer order is preserved.
        for p in 0..4 {
            let items: Vec<_> = log.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(items, (0..25).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_depth_drains_to_zero() {
        let queue = DispatchQueue::new("depth");
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            queue.enqueue(move || {
                let _g = gate.lock();
            });
        }
        assert!(queue.depth() >= 2);
        drop(held);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while queue.depth() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(queue.depth(), 0);
    }
}

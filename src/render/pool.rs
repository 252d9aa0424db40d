//! Fixed-size pool of render threads.
//!
//! Each worker lazily creates its own renderer from the shared factory the
//! first time it picks up a task and keeps it for the life of the thread.
//! Renderer instances never cross threads.

use super::{BlockRender, RenderError, RendererFactory, create_guarded, render_guarded};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

pub const MAX_WORKERS: usize = 8;

pub(crate) type Reply = mpsc::Sender<(usize, Result<String, RenderError>)>;

struct Task {
    slot: usize,
    source: Arc<str>,
    reply: Reply,
}

pub struct WorkerPool {
    sender: Option<mpsc::Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// Available cores, capped at `cap` and never below one.
pub fn default_worker_count(cap: usize) -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(cap)
        .max(1)
}

impl WorkerPool {
    pub fn new(size: usize, factory: Arc<dyn RendererFactory>) -> io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            let factory = Arc::clone(&factory);
            let handle = thread::Builder::new()
                .name(format!("adocview-render-{id}"))
                .spawn(move || worker_loop(id, &receiver, factory.as_ref()))?;
            workers.push(handle);
        }

        tracing::debug!(target: "adocview::pool", size, "worker pool started");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues one block; the result arrives on `reply` tagged with `slot`.
    /// Returns `false` if the pool is shutting down.
    pub(crate) fn submit(&self, slot: usize, source: Arc<str>, reply: Reply) -> bool {
        match &self.sender {
            Some(sender) => sender.send(Task { slot, source, reply }).is_ok(),
            None => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, receiver: &Mutex<mpsc::Receiver<Task>>, factory: &dyn RendererFactory) {
    let mut renderer: Option<Box<dyn BlockRender>> = None;
    loop {
        let task = receiver.lock().recv();
        let Ok(task) = task else {
            break;
        };

        if renderer.is_none() {
            match create_guarded(factory) {
                Ok(created) => {
                    tracing::trace!(
                        target: "adocview::pool",
                        worker = id,
                        backend = factory.name(),
                        "renderer created"
                    );
                    renderer = Some(created);
                }
                Err(err) => {
                    let _ = task.reply.send((task.slot, Err(err)));
                    continue;
                }
            }
        }

        let result = match renderer.as_mut() {
            Some(r) => render_guarded(r.as_mut(), &task.source),
            None => Err(RenderError::Backend("no renderer".to_string())),
        };
        let _ = task.reply.send((task.slot, result));
    }
    tracing::trace!(target: "adocview::pool", worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::{WorkerPool, default_worker_count};
    use crate::render::testing::CountingFactory;
    use crate::render::{BlockRender, RenderError, RendererFactory};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn worker_count_is_capped() {
        assert!(default_worker_count(8) <= 8);
        assert_eq!(default_worker_count(1), 1);
        assert_eq!(default_worker_count(0), 1);
    }

    #[test]
    fn results_are_tagged_with_slot() {
        let factory = CountingFactory::default();
        let pool = WorkerPool::new(3, Arc::new(factory.clone())).unwrap();
        let (tx, rx) = mpsc::channel();
        for slot in 0..10 {
            assert!(pool.submit(slot, Arc::from(format!("b{slot}")), tx.clone()));
        }
        drop(tx);

        let mut seen = HashSet::new();
        for (slot, result) in rx {
            assert_eq!(result.unwrap(), format!("<r>b{slot}</r>"));
            seen.insert(slot);
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(factory.calls(), 10);
    }

    #[test]
    fn each_worker_creates_at_most_one_renderer() {
        let factory = CountingFactory::default();
        let pool = WorkerPool::new(2, Arc::new(factory.clone())).unwrap();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel();
            for slot in 0..6 {
                pool.submit(slot, Arc::from("x"), tx.clone());
            }
            drop(tx);
            assert_eq!(rx.iter().count(), 6);
        }
        assert!(factory.instances.load(Ordering::SeqCst) <= 2);
        drop(pool);
    }

    #[test]
    fn panicking_factory_does_not_kill_worker() {
        struct PanicsOnce(AtomicBool);
        impl RendererFactory for PanicsOnce {
            fn create(&self) -> Result<Box<dyn BlockRender>, RenderError> {
                if !self.0.swap(true, Ordering::SeqCst) {
                    panic!("backend init");
                }
                let echo = |s: &str| -> Result<String, RenderError> { Ok(s.to_string()) };
                Ok(Box::new(echo))
            }
        }

        let pool = WorkerPool::new(1, Arc::new(PanicsOnce(AtomicBool::new(false)))).unwrap();
        let (tx, rx) = mpsc::channel();
        assert!(pool.submit(0, Arc::from("a"), tx.clone()));
        let (_, first) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(first, Err(RenderError::Panicked(ref msg)) if msg == "backend init"));

        assert!(pool.submit(1, Arc::from("b"), tx));
        let (slot, second) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(second.unwrap(), "b");
    }
}

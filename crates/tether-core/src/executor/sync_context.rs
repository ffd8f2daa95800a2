//! Cooperative serializer shared by the transports and resolvers of one channel.
//!
//! Tasks run one at a time, in submission order, on whichever thread calls
//! [`SyncContext::drain`]. A task may submit more tasks; they run in the same
//! drain. A panicking task is reported to the context's panic handler and the
//! drain moves on to the next task.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

type Task = Box<dyn FnOnce() + Send>;
type PanicHandler = Arc<dyn Fn(&(dyn Any + Send)) + Send + Sync>;

struct Inner {
    queue: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
    panic_handler: PanicHandler,
}

/// Handle to a shared serializing context. Cloning shares the queue.
#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<Inner>,
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncContext {
    /// Context whose panic handler logs the panic message.
    pub fn new() -> Self {
        Self::with_panic_handler(|payload| {
            error!("Uncaught panic in sync context task: {}", panic_message(payload));
        })
    }

    pub fn with_panic_handler<F>(handler: F) -> Self
    where
        F: Fn(&(dyn Any + Send)) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                panic_handler: Arc::new(handler),
            }),
        }
    }

    /// Queue a task and drain immediately.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_later(task);
        self.drain();
    }

    /// Queue a task without draining.
    pub fn execute_later<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.inner.queue.lock() {
            Ok(mut queue) => queue.push_back(Box::new(task)),
            Err(poisoned) => poisoned.into_inner().push_back(Box::new(task)),
        }
    }

    /// Run queued tasks until the queue is empty. Returns immediately if
    /// another thread is already draining.
    pub fn drain(&self) {
        loop {
            if self
                .inner
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            while let Some(task) = self.pop() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    (self.inner.panic_handler)(payload.as_ref());
                }
            }

            self.inner.draining.store(false, Ordering::Release);

            // A task queued between the last pop and the release above would
            // otherwise sit until the next drain.
            if self.is_empty() {
                return;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.inner.queue.lock() {
            Ok(queue) => queue.is_empty(),
            Err(poisoned) => poisoned.into_inner().is_empty(),
        }
    }

    fn pop(&self) -> Option<Task> {
        match self.inner.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("draining", &self.inner.draining.load(Ordering::Relaxed))
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

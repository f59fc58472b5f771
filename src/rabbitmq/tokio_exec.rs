use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Explicit single-threaded execution context. Every connection callback, delivery and
/// confirm of the connections opened inside it runs on the thread driving `block_on`.
#[derive(Debug)]
pub struct Reactor {
    runtime: Runtime,
}

impl Reactor {
    pub fn new() -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Reactor { runtime })
    }

    /// Drive `future` to completion on the calling thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Schedule background work. It only makes progress while some `block_on` is running.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }
}

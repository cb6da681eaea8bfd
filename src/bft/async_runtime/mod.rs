//! Abstracts over the concrete async runtime backing the dispatcher.
//!
//! Only a `tokio`-backed implementation is wired up; the module exists
//! as a seam so an `async_runtime_async_std` feature could plug in a
//! different backend without touching callers.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_tokio")]
use self::tokio as backend;

use std::cell::RefCell;
use std::future::Future;

use crate::bft::error::*;

pub use backend::JoinHandle;

thread_local! {
    static RUNTIME: RefCell<Option<backend::Runtime>> = RefCell::new(None);
}

/// Initializes the global async runtime with `num_threads` worker threads.
pub fn init(num_threads: usize) -> Result<()> {
    let runtime = backend::init(num_threads)
        .map_err(|_| Error::simple(ErrorKind::Error))?;
    RUNTIME.with(|cell| *cell.borrow_mut() = Some(runtime));
    Ok(())
}

/// Tears down the global async runtime.
pub fn drop() -> Result<()> {
    RUNTIME.with(|cell| {
        cell.borrow_mut().take();
    });
    Ok(())
}

/// Spawns a new asynchronous task onto the global runtime.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    ::tokio::spawn(future)
}

/// Runs a future to completion on the current thread, driving the
/// global runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    RUNTIME.with(|cell| {
        let borrow = cell.borrow();
        let runtime = borrow
            .as_ref()
            .expect("async_runtime::init must be called before block_on");
        runtime.block_on(future)
    })
}

//! Cancellation handle passed to every blocking feed call.
//!
//! A `Context` wraps a channel that never carries a value. Cancelling drops
//! the only sender, which makes every receiver ready with a disconnect, so
//! blocking calls can `select!` on `done()` next to their real work.

use crossbeam_channel::{bounded, never, Receiver, Sender, TryRecvError};

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct Context {
    done: Receiver<()>,
}

/// Cancels the paired `Context` when `cancel` is called or when dropped.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<Sender<()>>,
}

impl Context {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        Context { done: never() }
    }

    /// A context cancelled through the returned handle.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = bounded(0);
        (Context { done: rx }, CancelHandle { tx: Some(tx) })
    }

    /// Ready (disconnected) once the context is cancelled.
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// `Err(Error::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::background()
    }
}

impl CancelHandle {
    pub fn cancel(&mut self) {
        self.tx.take();
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::select;
    use std::time::Duration;

    #[test]
    fn test_background_is_never_cancelled() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_cancel_wakes_select() {
        let (ctx, mut handle) = Context::with_cancel();
        assert!(!ctx.is_cancelled());

        let waiter = ctx.clone();
        let join = std::thread::spawn(move || {
            let (_tx, rx) = bounded::<u32>(1);
            select! {
                recv(rx) -> _ => false,
                recv(waiter.done()) -> _ => true,
            }
        });

        std::thread::sleep(Duration::from_millis(10));
        handle.cancel();
        assert!(join.join().unwrap());
        assert!(ctx.is_cancelled());
        assert!(ctx.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_drop_cancels() {
        let (ctx, handle) = Context::with_cancel();
        drop(handle);
        assert!(ctx.is_cancelled());
    }
}

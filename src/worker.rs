//! Module `worker` implement the threading shape used by this crate.
//!
//! Vylog keeps blocking disk I/O off the transaction actor by handing it
//! to dedicated threads, the journal writer and the background file
//! worker. Both share one shape: a thread owning private state, fed
//! through a request channel, answering every request on a private
//! response channel. [Worker] owns such a thread, [Caller] is the
//! cloneable request side of its channel, [Inbox] is what the thread's
//! main loop reads.
//!
//! A main loop must treat a disconnected inbox as the signal to wind
//! down, that is how `join()` and drop stop the thread.

use std::{sync::mpsc, thread};

use crate::{Error, Result};

/// Receiving end of a worker's request channel. Every request carries
/// the sender on which the main loop must answer it.
pub type Inbox<Q, R = ()> = mpsc::Receiver<(Q, mpsc::Sender<R>)>;

/// Handle on a worker thread. `Q` is the request type, `R` the response
/// type and `T` the thread's final value, collected by `join()`.
pub struct Worker<Q, R = (), T = ()> {
    handle: Option<thread::JoinHandle<T>>,
    tx: Option<Caller<Q, R>>,
}

impl<Q, R, T> Drop for Worker<Q, R, T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl<Q, R, T> Worker<Q, R, T> {
    /// Spawn a worker thread under `name`. `main_loop` is handed the
    /// inbox end of the request channel and returns the routine the
    /// thread shall run until the inbox disconnects.
    pub fn spawn<F, N>(name: &str, main_loop: F) -> Result<Worker<Q, R, T>>
    where
        F: 'static + FnOnce(Inbox<Q, R>) -> N + Send,
        N: 'static + Send + FnOnce() -> T,
        T: 'static + Send,
    {
        let (tx, inbox) = mpsc::channel();
        let handle = {
            let builder = thread::Builder::new().name(name.to_string());
            err_at!(ThreadFail, builder.spawn(main_loop(inbox)))?
        };

        let val = Worker {
            handle: Some(handle),
            tx: Some(Caller { tx }),
        };
        Ok(val)
    }

    /// Wind down the worker and collect the thread's final value. Every
    /// [Caller] clone must be dropped for this to return.
    pub fn join(mut self) -> Result<T> {
        self.tx.take();
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(val) => Ok(val),
                Err(err) => err_at!(ThreadFail, msg: "worker panic {:?}", err),
            },
            None => err_at!(Fatal, msg: "worker joined twice"),
        }
    }

    /// Return a clone of the request side of the worker's channel.
    pub fn to_caller(&self) -> Caller<Q, R> {
        match self.tx.as_ref() {
            Some(caller) => caller.clone(),
            None => unreachable!(),
        }
    }
}

/// Request side of a worker's channel. Cheap to clone, every call gets
/// a private response channel of its own.
pub struct Caller<Q, R = ()> {
    tx: mpsc::Sender<(Q, mpsc::Sender<R>)>,
}

impl<Q, R> Clone for Caller<Q, R> {
    fn clone(&self) -> Caller<Q, R> {
        Caller { tx: self.tx.clone() }
    }
}

impl<Q, R> Caller<Q, R> {
    /// Submit `request` and suspend until the worker answers. Fails when
    /// the worker has already wound down.
    pub fn call(&self, request: Q) -> Result<R> {
        let (rtx, rrx) = mpsc::channel();
        err_at!(IPCFail, self.tx.send((request, rtx)))?;
        err_at!(IPCFail, rrx.recv())
    }
}

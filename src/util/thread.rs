//! Module `thread` implement a generic multi-threading pattern.
//!
//! It is inspired from gen-server model from Erlang, where by, every
//! thread is expected to hold onto its own state, and handle all
//! inter-thread communication via channels and message queues.

use std::{
    mem,
    sync::{mpsc, Arc, Mutex},
    thread,
};

use crate::{Error, Result};

/// IPC type, that shall be passed to the thread's main loop.
///
/// Refer to [Thread::new] for details.
pub type Rx<Q, R = ()> = mpsc::Receiver<(Q, Option<mpsc::Sender<R>>)>;

/// Thread type, providing gen-server pattern to do multi-threading.
///
/// NOTE: When a thread value is dropped, it is made sure that there are
/// no dangling thread routines. To achieve this following requirements
/// need to be satisfied:
///
/// * The thread's main loop should handle _disconnect_ signal on its
///   [Rx] channel.
/// * Call `join()` on the [Thread] instance.
pub struct Thread<Q, R = (), T = ()> {
    name: String,
    inner: Option<Inner<Q, R, T>>,
}

struct Inner<Q, R, T> {
    handle: thread::JoinHandle<T>,
    tx: Option<Arc<Mutex<Tx<Q, R>>>>,
}

impl<Q, R, T> Inner<Q, R, T> {
    fn join(mut self) -> Result<T> {
        mem::drop(self.tx.take());

        match self.handle.join() {
            Ok(val) => Ok(val),
            Err(err) => err_at!(ThreadFail, msg: "fail {:?}", err),
        }
    }
}

impl<Q, R, T> Drop for Thread<Q, R, T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.join().ok();
        }
    }
}

impl<Q, R, T> Thread<Q, R, T> {
    /// Create a new Thread instance, using asynchronous channel with
    /// infinite buffer. `main_loop` shall be called with the rx side of
    /// the channel and shall return a function that can be spawned using
    /// thread::spawn.
    pub fn new<F, N>(name: &str, main_loop: F) -> Thread<Q, R, T>
    where
        F: 'static + FnOnce(Rx<Q, R>) -> N + Send,
        N: 'static + Send + FnOnce() -> T,
        T: 'static + Send,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(main_loop(rx));

        Thread {
            name: name.to_string(),
            inner: Some(Inner {
                handle,
                tx: Some(Arc::new(Mutex::new(Tx { tx }))),
            }),
        }
    }

    /// Recommended way to exit/shutdown the thread. All [Tx] clones of
    /// this thread must also be dropped for this call to return.
    ///
    /// Even otherwise, when Thread value goes out of scope its drop
    /// implementation shall call this method to exit the thread, except
    /// that any errors are ignored.
    pub fn join(mut self) -> Result<T> {
        match self.inner.take() {
            Some(inner) => inner.join(),
            None => err_at!(ThreadFail, msg: "thread already joined"),
        }
    }

    /// Return name of this thread.
    pub fn to_name(&self) -> String {
        self.name.to_string()
    }

    /// Return a clone of tx channel.
    pub fn to_tx(&self) -> Tx<Q, R> {
        match self.inner.as_ref() {
            Some(inner) => match inner.tx.as_ref() {
                Some(tx) => tx.lock().unwrap().clone(),
                None => unreachable!(),
            },
            None => unreachable!(),
        }
    }
}

/// IPC type, the sender side of the thread's channel.
///
/// The clone behavior is similar to [mpsc::Sender].
pub struct Tx<Q, R = ()> {
    tx: mpsc::Sender<(Q, Option<mpsc::Sender<R>>)>,
}

impl<Q, R> Clone for Tx<Q, R> {
    fn clone(&self) -> Self {
        Tx { tx: self.tx.clone() }
    }
}

impl<Q, R> Tx<Q, R> {
    /// Post a message to thread and don't wait for response.
    pub fn post(&self, msg: Q) -> Result<()> {
        err_at!(IPCFail, self.tx.send((msg, None)))?;
        Ok(())
    }

    /// Send a request message to thread and wait for a response.
    pub fn request(&self, request: Q) -> Result<R> {
        let (stx, srx) = mpsc::channel();
        err_at!(IPCFail, self.tx.send((request, Some(stx))))?;
        err_at!(IPCFail, srx.recv())
    }
}

// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Graceful-shutdown propagation.
//!
//! Dropping the single [`Sender`] requests shutdown. [`Receiver`] clones are
//! handed to every long-lived task (recording loop, GPS logger, MJPEG worker,
//! reaper, geodata worker); each can poll [`Receiver::check`] at its natural
//! yield points, block with a timeout from synchronous code, or await
//! [`Receiver::future`] from async code.

use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::Future;
use slab::Slab;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

impl From<ShutdownError> for crate::Error {
    fn from(_: ShutdownError) -> Self {
        crate::err!(Cancelled, msg("shutdown requested"))
    }
}

struct Inner {
    /// `None` iff shutdown has already been requested.
    wakers: Mutex<Option<Slab<Waker>>>,
    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Take the slab (flipping the state) before waking anyone, so a
        // waiter that re-checks immediately observes shutdown.
        let mut wakers = self
            .0
            .wakers
            .lock()
            .unwrap()
            .take()
            .expect("only the single Sender takes the slab");
        for w in wakers.drain() {
            w.wake();
        }
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    /// Returns `Err(ShutdownError)` iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.wakers.lock().unwrap().is_none() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Blocks until shutdown or until `timeout` elapses, whichever is first.
    /// Returns `Ok(())` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let l = self.0.wakers.lock().unwrap();
        let (_guard, result) = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |wakers| wakers.is_some())
            .unwrap();
        if result.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }

    /// Returns a future that resolves when shutdown is requested.
    pub fn future(&self) -> ReceiverFuture {
        ReceiverFuture {
            inner: self.0.clone(),
            waker_i: NO_WAKER,
        }
    }
}

/// `waker_i` value to indicate no slab slot has been assigned.
const NO_WAKER: usize = usize::MAX;

pub struct ReceiverFuture {
    inner: Arc<Inner>,
    waker_i: usize,
}

impl Future for ReceiverFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        let mut l = this.inner.wakers.lock().unwrap();
        let wakers = match &mut *l {
            None => return Poll::Ready(()),
            Some(w) => w,
        };
        let new_waker = cx.waker();
        if this.waker_i == NO_WAKER {
            this.waker_i = wakers.insert(new_waker.clone());
        } else {
            let existing = &mut wakers[this.waker_i];
            if !new_waker.will_wake(existing) {
                existing.clone_from(new_waker);
            }
        }
        Poll::Pending
    }
}

impl Drop for ReceiverFuture {
    fn drop(&mut self) {
        if self.waker_i == NO_WAKER {
            return;
        }
        if let Some(wakers) = &mut *self.inner.wakers.lock().unwrap() {
            wakers.remove(self.waker_i);
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        wakers: Mutex::new(Some(Slab::new())),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

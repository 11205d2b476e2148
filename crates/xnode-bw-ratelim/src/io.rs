//! Rate-limited wrappers for async streams.

use futures::io::{AsyncRead, AsyncWrite};
use futures::Future;
use pin_project::pin_project;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use event_listener::EventListener;
use tor_rtcompat::SleepProvider;

use crate::{Blocked, Permit, RateGate};

/// Shared state for waiting on a [`RateGate`].
#[pin_project]
struct Waiter<R: SleepProvider> {
    /// Runtime, for the clock and for sleeping.
    runtime: R,
    /// The gate we take bytes from.
    gate: Arc<RateGate>,
    /// Sleep until the gate should have enough tokens.
    #[pin]
    sleeping: Option<R::SleepFuture>,
    /// Wakes us early if the gate is reconfigured.
    reconfigured: Option<EventListener>,
}

impl<R: SleepProvider> Waiter<R> {
    /// Wait (if needed) until `n` bytes can be consumed, then return a
    /// permit for at most `n` bytes.
    fn poll_permit(self: Pin<&mut Self>, cx: &mut Context<'_>, n: usize) -> Poll<Permit<'_>> {
        let mut this = self.project();
        let gate: &Arc<RateGate> = this.gate;
        loop {
            if let Some(sleeping) = this.sleeping.as_mut().as_pin_mut() {
                let slept = sleeping.poll(cx).is_ready();
                let woken = match this.reconfigured.as_mut() {
                    Some(listener) => Pin::new(listener).poll(cx).is_ready(),
                    None => false,
                };
                if !slept && !woken {
                    return Poll::Pending;
                }
                this.sleeping.set(None);
                *this.reconfigured = None;
            }

            match gate.take_bytes(n, this.runtime.now()) {
                Ok(permit) => return Poll::Ready(permit),
                Err(Blocked {
                    wait, reconfigured, ..
                }) => {
                    // Loop, so that the new futures get polled and register
                    // our waker.
                    this.sleeping.set(Some(this.runtime.sleep(wait)));
                    *this.reconfigured = Some(reconfigured);
                }
            }
        }
    }
}

/// An [`AsyncRead`] whose reads are limited by a [`RateGate`].
#[pin_project]
pub struct LimitedRead<R: SleepProvider, T> {
    /// Where we get our permission to read.
    #[pin]
    waiter: Waiter<R>,
    /// The stream we are limiting.
    #[pin]
    inner: T,
}

impl<R: SleepProvider, T: AsyncRead> AsyncRead for LimitedRead<R, T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.project();
        if buf.is_empty() {
            return this.inner.poll_read(cx, buf);
        }
        let permit = futures::ready!(this.waiter.poll_permit(cx, buf.len()));
        match this.inner.poll_read(cx, &mut buf[..permit.len()]) {
            Poll::Ready(Ok(n_read)) => {
                permit.used(n_read);
                Poll::Ready(Ok(n_read))
            }
            Poll::Ready(Err(e)) => {
                permit.unused();
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                permit.unused();
                Poll::Pending
            }
        }
    }
}

/// An [`AsyncWrite`] whose writes are limited by a [`RateGate`].
#[pin_project]
pub struct LimitedWrite<R: SleepProvider, T> {
    /// Where we get our permission to write.
    #[pin]
    waiter: Waiter<R>,
    /// The stream we are limiting.
    #[pin]
    inner: T,
}

impl<R: SleepProvider, T: AsyncWrite> AsyncWrite for LimitedWrite<R, T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        let this = self.project();
        if buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }
        let permit = futures::ready!(this.waiter.poll_permit(cx, buf.len()));
        match this.inner.poll_write(cx, &buf[..permit.len()]) {
            Poll::Ready(Ok(n_written)) => {
                permit.used(n_written);
                Poll::Ready(Ok(n_written))
            }
            Poll::Ready(Err(e)) => {
                permit.unused();
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                permit.unused();
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_close(cx)
    }
}

/// Accessors shared by both wrappers.
macro_rules! impl_limited_accessors {
    { $name:ident } => {
        impl<R: SleepProvider, T> $name<R, T> {
            /// Wrap `io`, taking permission from `gate` and sleeping on
            /// `runtime`.
            pub fn new(runtime: R, gate: Arc<RateGate>, io: T) -> Self {
                Self {
                    waiter: Waiter {
                        runtime,
                        gate,
                        sleeping: None,
                        reconfigured: None,
                    },
                    inner: io,
                }
            }

            /// Return the gate this stream is limited by.
            pub fn gate(&self) -> &Arc<RateGate> {
                &self.waiter.gate
            }

            /// Return a reference to the underlying stream.
            pub fn get_ref(&self) -> &T {
                &self.inner
            }

            /// Return a pinned mutable reference to the underlying stream.
            pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut T> {
                self.project().inner
            }

            /// Consume this wrapper and return the underlying stream.
            pub fn into_inner(self) -> T {
                self.inner
            }
        }
    };
}

impl_limited_accessors! { LimitedRead }
impl_limited_accessors! { LimitedWrite }

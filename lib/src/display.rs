// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Single owner of the compositor connection.
//!
//! The handle lives on a dedicated dispatcher thread. A second waiter thread
//! performs the blocking wait for compositor activity, so that color requests
//! are serviced promptly while nothing is happening on the connection. The two
//! threads coordinate through three channels:
//!
//! - `go`: dispatcher to waiter, arms one blocking wait.
//! - `results`: waiter to dispatcher, the connection is readable. Closed when
//!   the wait primitive fails.
//! - `teardown`: [`DisplayActor::close`] to dispatcher, buffered by one.
//!
//! The handle is destroyed by the dispatcher thread after its loop has
//! returned and the waiter thread has been joined.

use crate::color::ColorState;
use crate::handle::{DisplayHandle, Poll, Poller};
use crate::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

const GAMMA: [f32; 3] = [1.0, 1.0, 1.0];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    /// A teardown was requested and the handle has not been destroyed yet.
    ShuttingDown,
    /// Closed on request. The handle has been destroyed.
    Stopped,
    /// Terminated on its own after a fatal connection error. The handle has
    /// been destroyed.
    Failed,
}

impl Lifecycle {
    #[must_use]
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// A validated color with a private, single-use reply channel.
#[derive(Debug)]
struct SetColorRequest {
    color: ColorState,
    reply: oneshot::Sender<Result<(), Error>>,
}

/// Async-safe front of the dispatcher thread that owns a [`DisplayHandle`].
#[derive(Debug)]
pub struct DisplayActor {
    commands: mpsc::Sender<SetColorRequest>,
    teardown: mpsc::Sender<()>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    color: watch::Receiver<ColorState>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl DisplayActor {
    /// Starts the dispatcher thread and creates the handle on it with `init`.
    ///
    /// # Errors
    ///
    /// Returns the error of `init`, or an I/O error if a thread could not be
    /// spawned.
    pub async fn spawn<H, F>(init: F) -> Result<Self, Error>
    where
        H: DisplayHandle,
        F: FnOnce() -> Result<H, Error> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (commands_tx, commands_rx) = mpsc::channel(1);
        let (teardown_tx, teardown_rx) = mpsc::channel(1);
        let (color_tx, color_rx) = watch::channel(ColorState::default());
        let lifecycle = Arc::new(watch::Sender::new(Lifecycle::Running));

        let thread_lifecycle = lifecycle.clone();
        let dispatcher = thread::Builder::new()
            .name("gammarelay-dispatch".into())
            .spawn(move || {
                let handle = match init() {
                    Ok(handle) => handle,
                    Err(why) => {
                        thread_lifecycle.send_replace(Lifecycle::Failed);
                        let _res = ready_tx.send(Err(why));
                        return;
                    }
                };

                let poller = match handle.poller() {
                    Ok(poller) => poller,
                    Err(why) => {
                        handle.destroy();
                        thread_lifecycle.send_replace(Lifecycle::Failed);
                        let _res = ready_tx.send(Err(why));
                        return;
                    }
                };

                let _res = ready_tx.send(Ok(()));

                let dispatcher = Dispatcher {
                    handle,
                    commands: commands_rx,
                    teardown: teardown_rx,
                    color: color_tx,
                    last_color: ColorState::default(),
                    last_outputs: 0,
                };

                let outcome = run(dispatcher, poller);
                thread_lifecycle.send_replace(outcome);
            })?;

        ready_rx.await.map_err(|_| Error::ActorUnavailable)??;

        tracing::debug!("display actor started");

        Ok(Self {
            commands: commands_tx,
            teardown: teardown_tx,
            lifecycle,
            color: color_rx,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Validates `color` and applies it on the dispatcher thread.
    ///
    /// If `timeout` elapses after the request was queued, the request cannot
    /// be retracted: the dispatcher still applies it and discards the reply.
    ///
    /// # Errors
    ///
    /// - `InvalidColor` if a field is out of range. The handle is not touched.
    /// - `Protocol` if the compositor refused the change.
    /// - `ActorUnavailable` once a teardown was requested or the actor died.
    /// - `Timeout` if no reply arrived in time.
    pub async fn set_color(&self, color: ColorState, timeout: Duration) -> Result<(), Error> {
        color.validate()?;

        if self.lifecycle() != Lifecycle::Running {
            return Err(Error::ActorUnavailable);
        }

        let (reply, response) = oneshot::channel();
        let request = SetColorRequest { color, reply };

        let exchange = async move {
            self.commands
                .send(request)
                .await
                .map_err(|_| Error::ActorUnavailable)?;

            response.await.map_err(|_| Error::ActorUnavailable)?
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// The last color the dispatcher applied successfully.
    #[must_use]
    pub fn color(&self) -> ColorState {
        *self.color.borrow()
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Resolves once the actor stopped or failed and its handle is destroyed.
    pub async fn terminated(&self) -> Lifecycle {
        let mut lifecycle = self.lifecycle.subscribe();
        match lifecycle.wait_for(|state| state.is_terminated()).await {
            Ok(state) => *state,
            Err(_) => Lifecycle::Failed,
        }
    }

    /// Shuts the actor down and waits until the handle has been destroyed.
    ///
    /// Returns immediately if a teardown is already pending or the actor has
    /// already terminated.
    pub async fn close(&self) {
        if self.teardown.try_send(()).is_err() {
            return;
        }

        self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Running {
                *state = Lifecycle::ShuttingDown;
                true
            } else {
                false
            }
        });

        let lifecycle = self.terminated().await;

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(dispatcher) = dispatcher {
            match tokio::task::spawn_blocking(move || dispatcher.join()).await {
                Ok(Ok(())) => (),
                Ok(Err(_panic)) => tracing::error!("display dispatcher thread panicked"),
                Err(why) => tracing::error!(?why, "failed to join display dispatcher thread"),
            }
        }

        tracing::debug!(?lifecycle, "display actor closed");
    }
}

struct Dispatcher<H> {
    handle: H,
    commands: mpsc::Receiver<SetColorRequest>,
    teardown: mpsc::Receiver<()>,
    color: watch::Sender<ColorState>,
    last_color: ColorState,
    last_outputs: usize,
}

/// Runs the dispatcher loop to completion, then tears the handle down.
fn run<H: DisplayHandle>(mut dispatcher: Dispatcher<H>, poller: H::Poller) -> Lifecycle {
    let (go_tx, go_rx) = mpsc::channel(1);
    let (results_tx, results_rx) = mpsc::channel(1);

    let waiter = match thread::Builder::new()
        .name("gammarelay-wait".into())
        .spawn(move || wait(poller, go_rx, results_tx))
    {
        Ok(waiter) => waiter,
        Err(why) => {
            tracing::error!(%why, "failed to spawn display waiter thread");
            dispatcher.handle.destroy();
            return Lifecycle::Failed;
        }
    };

    // A panicking binding still reaches the teardown below.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        futures_lite::future::block_on(dispatcher.dispatch(go_tx, results_rx))
    }));

    let Dispatcher {
        handle, commands, ..
    } = dispatcher;

    // Queued requests are dropped unanswered; their callers observe a closed
    // reply channel.
    drop(commands);

    // Every exit path must wake the waiter before it can be joined.
    handle.interrupt();

    if waiter.join().is_err() {
        tracing::error!("display waiter thread panicked");
    }

    handle.destroy();

    match outcome {
        Ok(Ok(())) => {
            tracing::info!("display actor stopped");
            Lifecycle::Stopped
        }
        Ok(Err(why)) => {
            tracing::error!(%why, "display actor terminated");
            Lifecycle::Failed
        }
        Err(_panic) => {
            tracing::error!("display dispatcher panicked");
            Lifecycle::Failed
        }
    }
}

impl<H: DisplayHandle> Dispatcher<H> {
    async fn dispatch(
        &mut self,
        go: mpsc::Sender<()>,
        mut results: mpsc::Receiver<()>,
    ) -> Result<(), Error> {
        go.try_send(()).map_err(|_| Error::PollFailed)?;

        loop {
            self.handle.dispatch_pending()?;
            self.handle.flush()?;

            let outputs = self.handle.num_ready_outputs();
            if outputs != self.last_outputs {
                tracing::info!(
                    outputs,
                    previous = self.last_outputs,
                    "number of outputs changed, reapplying color"
                );

                if let Err(why) = self.apply(self.last_color) {
                    tracing::warn!(%why, "failed to reapply color");
                }

                self.handle.dispatch_pending()?;
                self.handle.flush()?;

                self.last_outputs = outputs;
            }

            tokio::select! {
                biased;

                _ = self.teardown.recv() => {
                    tracing::debug!("display teardown requested");
                    return Ok(());
                }

                result = results.recv() => {
                    if result.is_none() {
                        return Err(Error::PollFailed);
                    }

                    let dispatched = self.handle.blocking_dispatch()?;
                    tracing::trace!(dispatched, "dispatched compositor events");

                    go.try_send(()).map_err(|_| Error::PollFailed)?;
                }

                Some(request) = self.commands.recv() => {
                    self.set_color(request);
                }
            }
        }
    }

    fn set_color(&mut self, request: SetColorRequest) {
        let SetColorRequest { color, reply } = request;

        let result = self.apply(color);
        if let Err(ref why) = result {
            tracing::warn!(%why, "failed to set color");
        }

        if reply.send(result).is_err() {
            tracing::debug!("set color caller went away before the reply");
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn apply(&mut self, color: ColorState) -> Result<(), Error> {
        self.handle
            .set_color(color.temperature, GAMMA, color.brightness as f32)?;

        self.last_color = color;
        self.color.send_replace(color);

        Ok(())
    }
}

/// Waiter loop: one blocking wait per `go` signal.
fn wait<P: Poller>(mut poller: P, mut go: mpsc::Receiver<()>, results: mpsc::Sender<()>) {
    while go.blocking_recv().is_some() {
        loop {
            match poller.poll() {
                Poll::Ready => break,
                Poll::Timeout => continue,
                Poll::Interrupted => {
                    tracing::debug!("display wait interrupted");
                    return;
                }
                Poll::Failed(why) => {
                    // Returning drops `results`, which the dispatcher treats
                    // as a permanent failure.
                    tracing::error!(%why, "display wait failed");
                    return;
                }
            }
        }

        if results.blocking_send(()).is_err() {
            return;
        }
    }

    tracing::debug!("display waiter done");
}

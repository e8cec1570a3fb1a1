// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Request broker serving clients over a unix socket.
//!
//! Every connection gets its own task that decodes a stream of JSON objects,
//! answers them one at a time and writes the broadcasts. Requests are applied by a single
//! request loop which owns the last known color. Updates are fanned out by a
//! broadcast loop into the bounded per-connection queues, so a slow subscriber
//! never holds up the request loop.

use crate::channel::{Receiver, SendError};
use crate::color::{self, ColorDelta, ColorState};
use crate::connection::{Connection, ConnectionSet, Revision};
use crate::display::DisplayActor;
use crate::protocol::{Color, Request, RequestMessage, Response, SubscriptionKey, Update};
use crate::{Error, history};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

#[derive(Clone, Debug)]
pub struct Params {
    /// Where the last applied color is written after every change.
    pub history_path: Option<PathBuf>,
    /// Deadline for one color change on the display actor.
    pub request_timeout: Duration,
    /// Deadline for writing one message to a client.
    pub write_timeout: Duration,
    /// Broadcasts buffered per connection before further ones are dropped.
    pub max_pending_updates: usize,
    /// Largest incomplete request buffered before the connection is closed.
    pub max_request_size: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            history_path: None,
            request_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            max_pending_updates: 16,
            max_request_size: 64 * 1024,
        }
    }
}

/// A decoded request with a private reply channel.
struct Envelope {
    connection: Arc<Connection>,
    request: Request,
    reply: oneshot::Sender<Response>,
}

/// An update published by the request loop, tagged with the change it reports.
#[derive(Debug)]
struct Published {
    revision: Revision,
    update: Update,
}

pub struct Service {
    display: Arc<DisplayActor>,
    params: Params,
}

impl Service {
    #[must_use]
    pub fn new(display: Arc<DisplayActor>, params: Params) -> Self {
        Self { display, params }
    }

    /// Accepts clients until `shutdown` resolves, then closes every connection
    /// and waits for the service tasks to finish.
    ///
    /// The display actor is left running. Closing it is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns error if accepting a connection failed.
    pub async fn serve(
        self,
        listener: UnixListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let Self { display, params } = self;

        let connections = Arc::new(ConnectionSet::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let request_loop = tokio::spawn(
            RequestLoop {
                display,
                history_path: params.history_path.clone(),
                request_timeout: params.request_timeout,
                color: ColorState::default(),
                revision: 0,
                stale: false,
                updates: updates_tx,
            }
            .run(requests_rx, stop_rx.clone()),
        );

        let broadcast_loop = tokio::spawn(broadcast(
            connections.clone(),
            updates_rx,
            stop_rx.clone(),
        ));

        let mut sessions = JoinSet::new();
        let mut shutdown = std::pin::pin!(shutdown);

        let result = loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    tracing::info!("shutting down service");
                    break Ok(());
                }

                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(why) => {
                            tracing::error!(?why, "failed to accept connection");
                            break Err(Error::Io(why));
                        }
                    };

                    let (connection, updates) = connections.register(params.max_pending_updates);

                    sessions.spawn(
                        Session {
                            connections: connections.clone(),
                            connection,
                            requests: requests_tx.clone(),
                            stop: stop_rx.clone(),
                            write_timeout: params.write_timeout,
                            max_request_size: params.max_request_size,
                        }
                        .run(stream, updates),
                    );
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(why) = joined {
                        tracing::error!(?why, "connection task failed");
                    }
                }
            }
        };

        drop(listener);
        stop_tx.send_replace(true);
        drop(requests_tx);

        while let Some(joined) = sessions.join_next().await {
            if let Err(why) = joined {
                tracing::error!(?why, "connection task failed");
            }
        }

        if let Err(why) = request_loop.await {
            tracing::error!(?why, "request loop failed");
        }

        if let Err(why) = broadcast_loop.await {
            tracing::error!(?why, "broadcast loop failed");
        }

        tracing::debug!(remaining = connections.len(), "service stopped");

        result
    }
}

/// Resolves once the service is stopping, or its stop signal is gone.
async fn stopping(stop: &mut watch::Receiver<bool>) {
    let _res = stop.wait_for(|stopped| *stopped).await;
}

/// Single consumer of client requests, and the only writer of `color`.
struct RequestLoop {
    display: Arc<DisplayActor>,
    history_path: Option<PathBuf>,
    request_timeout: Duration,
    color: ColorState,
    revision: Revision,
    /// Set after a timed out change, which the actor may still apply.
    stale: bool,
    updates: mpsc::UnboundedSender<Published>,
}

impl RequestLoop {
    async fn run(mut self, mut requests: mpsc::Receiver<Envelope>, mut stop: watch::Receiver<bool>) {
        loop {
            let envelope = tokio::select! {
                biased;

                () = stopping(&mut stop) => break,

                envelope = requests.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let Envelope {
                connection,
                request,
                reply,
            } = envelope;

            tracing::debug!(id = connection.id(), ?request, "handling request");

            let response = self.handle(&connection, request).await;

            if reply.send(response).is_err() {
                tracing::debug!(id = connection.id(), "connection went away before the reply");
            }
        }

        tracing::debug!("request loop stopped");
    }

    async fn handle(&mut self, connection: &Connection, request: Request) -> Response {
        if self.stale {
            self.color = self.display.color();
        }

        match request {
            Request::Color(color) => self.set_color(&color).await,

            Request::Subscribe(keys) => {
                connection.subscribe(&keys, self.revision);

                Response {
                    updates: Some(keys.iter().map(|&key| self.update(key)).collect()),
                    subscribed: Some(keys),
                    ..Response::default()
                }
            }

            Request::Unsubscribe(keys) => {
                connection.unsubscribe(&keys);

                Response {
                    unsubscribed: Some(keys),
                    ..Response::default()
                }
            }
        }
    }

    async fn set_color(&mut self, color: &Color) -> Response {
        let previous = self.color;
        let next = match ColorDelta::try_from(color).and_then(|delta| color::resolve(&delta, previous))
        {
            Ok(next) => next,
            Err(why) => {
                tracing::warn!(%why, "failed to parse color parameters");
                return Response::error(format!("Failed to parse parameters: {why}"));
            }
        };

        match self.display.set_color(next, self.request_timeout).await {
            Ok(()) => (),

            Err(Error::Timeout) => {
                self.stale = true;
                tracing::warn!(color = %next, "timed out setting color");
                return Response::error("Timed out setting color");
            }

            Err(why) => {
                tracing::warn!(%why, "failed to set color");
                return Response::error("Failed to set color");
            }
        }

        self.color = next;
        self.revision += 1;
        self.stale = false;
        tracing::info!(color = %next, "color changed");

        if let Some(path) = &self.history_path {
            if let Err(why) = history::write(path, next).await {
                tracing::warn!(?path, %why, "failed to write history");
            }
        }

        let published = Published {
            revision: self.revision,
            update: self.update(SubscriptionKey::Color),
        };

        if self.updates.send(published).is_err() {
            tracing::debug!("broadcast loop is gone");
        }

        Response::color(next)
    }

    fn update(&self, key: SubscriptionKey) -> Update {
        match key {
            SubscriptionKey::Color => Update {
                key,
                color: Some(self.color.into()),
            },
        }
    }
}

/// Pushes every published update to the connections subscribed to its key.
async fn broadcast(
    connections: Arc<ConnectionSet>,
    mut updates: mpsc::UnboundedReceiver<Published>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let Published { revision, update } = tokio::select! {
            biased;

            () = stopping(&mut stop) => break,

            update = updates.recv() => match update {
                Some(published) => published,
                None => break,
            },
        };

        let key = update.key;
        let message = Response::updates(vec![update]);

        for connection in connections.snapshot() {
            // A subscribe answered after this change already carried it.
            if !connection.wants(key, revision) {
                continue;
            }

            match connection.notify(message.clone()).await {
                Ok(()) => (),
                Err(SendError::Full(_)) => {
                    tracing::warn!(id = connection.id(), "subscriber is lagging behind, dropping update");
                }
                Err(SendError::Closed(_)) => {
                    tracing::debug!(id = connection.id(), "subscriber already closed");
                }
            }
        }
    }

    tracing::debug!("broadcast loop stopped");
}

/// The task serving one client connection.
struct Session {
    connections: Arc<ConnectionSet>,
    connection: Arc<Connection>,
    requests: mpsc::Sender<Envelope>,
    stop: watch::Receiver<bool>,
    write_timeout: Duration,
    max_request_size: usize,
}

/// Whether a connection stays open after its buffered requests were answered.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

impl Session {
    async fn run(mut self, stream: UnixStream, mut updates: Receiver<Response>) {
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = vec![0_u8; 4096];

        loop {
            let read = tokio::select! {
                biased;

                () = stopping(&mut self.stop) => break,

                Some(update) = updates.recv() => {
                    if let Err(why) = self.write(&mut writer, &update).await {
                        tracing::warn!(id = self.connection.id(), %why, "failed to write update");
                        break;
                    }

                    continue;
                }

                read = reader.read(&mut chunk) => read,
            };

            let read = match read {
                Ok(0) => break,
                Ok(read) => read,
                Err(why) => {
                    tracing::debug!(id = self.connection.id(), %why, "failed to read from connection");
                    break;
                }
            };

            buffer.extend_from_slice(&chunk[..read]);

            match self.answer(&mut writer, &mut buffer).await {
                Ok(Flow::Continue) => (),
                Ok(Flow::Close) => break,
                Err(why) => {
                    tracing::warn!(id = self.connection.id(), %why, "failed to write response");
                    break;
                }
            }

            if buffer.len() > self.max_request_size {
                tracing::warn!(
                    id = self.connection.id(),
                    size = buffer.len(),
                    "request exceeds the size limit"
                );
                let response = Response::error("Failed to decode message");
                let _res = self.write(&mut writer, &response).await;
                break;
            }
        }

        self.connections.remove(self.connection.id());
    }

    /// Answers every complete request at the front of `buffer` and removes
    /// them, leaving an incomplete trailing request for the next read.
    ///
    /// Requests are plain concatenated JSON objects. Whitespace, including
    /// newlines, between and inside them is insignificant.
    async fn answer(
        &mut self,
        writer: &mut OwnedWriteHalf,
        buffer: &mut Vec<u8>,
    ) -> Result<Flow, Error> {
        let consumed = {
            let mut messages = serde_json::Deserializer::from_slice(buffer.as_slice())
                .into_iter::<RequestMessage>();

            loop {
                let message = match messages.next() {
                    None => break messages.byte_offset(),
                    Some(Ok(message)) => message,
                    Some(Err(why)) if why.is_eof() => break messages.byte_offset(),
                    Some(Err(why)) => {
                        tracing::warn!(id = self.connection.id(), %why, "failed to decode message");
                        let response = Response::error("Failed to decode message");
                        let _res = self.write(writer, &response).await;
                        return Ok(Flow::Close);
                    }
                };

                let response = match Request::try_from(message) {
                    Ok(request) => self.submit(request).await,
                    Err(_unknown) => {
                        tracing::warn!(id = self.connection.id(), "unknown request");
                        Response::error("Unknown request")
                    }
                };

                self.write(writer, &response).await?;
            }
        };

        buffer.drain(..consumed);

        Ok(Flow::Continue)
    }

    /// Hands a request to the request loop and waits for its answer.
    async fn submit(&mut self, request: Request) -> Response {
        let (reply, pending) = oneshot::channel();
        let envelope = Envelope {
            connection: self.connection.clone(),
            request,
            reply,
        };

        tokio::select! {
            biased;

            () = stopping(&mut self.stop) => {
                return Response::error("Daemon is shutting down");
            }

            sent = self.requests.send(envelope) => {
                if sent.is_err() {
                    tracing::warn!(id = self.connection.id(), "failed to enqueue request");
                    return Response::error("Failed to enqueue request");
                }
            }
        }

        tokio::select! {
            biased;

            response = pending => {
                response.unwrap_or_else(|_| Response::error("Daemon is shutting down"))
            }

            () = stopping(&mut self.stop) => Response::error("Daemon is shutting down"),
        }
    }

    async fn write(&self, writer: &mut OwnedWriteHalf, response: &Response) -> Result<(), Error> {
        let mut buffer = serde_json::to_vec(response)?;
        buffer.push(b'\n');

        tokio::time::timeout(self.write_timeout, writer.write_all(&buffer))
            .await
            .map_err(|_| Error::Timeout)??;

        Ok(())
    }
}

// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

mod channel;
pub use channel::{Receiver, SendError, Sender, channel};

pub mod client;
pub use client::Client;

pub mod color;
pub use color::{ColorDelta, ColorError, ColorState};

mod colorramp;

pub mod connection;
pub use connection::{Connection, ConnectionSet};

pub mod context;
pub use context::{Context, WaylandHandle};

pub mod display;
pub use display::{DisplayActor, Lifecycle};

pub mod handle;
pub use handle::{DisplayHandle, Poll, Poller};

pub mod history;
pub mod output;
pub mod protocol;

pub mod service;
pub use service::{Params, Service};

pub mod wl_registry;

#[cfg(test)]
mod fake;

/// Connects to the wayland compositor and starts a display actor that owns
/// the connection.
///
/// # Errors
///
/// Returns error if there are any wayland client connection errors, or if the
/// compositor does not support `wlr-gamma-control-unstable-v1`.
pub async fn connect() -> Result<DisplayActor, Error> {
    DisplayActor::spawn(WaylandHandle::connect).await
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid color parameters: {0}")]
    InvalidColor(#[from] ColorError),
    #[error("compositor rejected the color change: {0}")]
    Protocol(String),
    #[error("compositor doesn't support wlr-gamma-control-unstable-v1")]
    Unsupported,
    #[error("display actor is no longer running")]
    ActorUnavailable,
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("blocking wait on the compositor connection failed")]
    PollFailed,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("malformed message")]
    Json(#[from] serde_json::Error),
    #[error("wayland client context error")]
    WaylandContext(#[from] wayland_client::backend::WaylandError),
    #[error("wayland client dispatch error")]
    WaylandDispatch(#[from] wayland_client::DispatchError),
    #[error("wayland connection error")]
    WaylandConnection(#[from] wayland_client::ConnectError),
}

// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! The narrow interface the display actor needs from a compositor binding.

use crate::Error;

/// Outcome of one blocking wait for compositor activity.
#[derive(Debug)]
pub enum Poll {
    /// Events are ready to be read from the connection.
    Ready,
    /// The wait returned without activity and may be retried.
    Timeout,
    /// [`DisplayHandle::interrupt`] was called.
    Interrupted,
    /// The wait primitive itself failed; the connection is unusable.
    Failed(std::io::Error),
}

/// The blocking half of a display handle, moved onto the waiter thread.
///
/// A poller only watches file descriptors. It never reads from or writes to
/// the compositor connection.
pub trait Poller: Send + 'static {
    /// Blocks until the connection is readable or the wait is interrupted.
    fn poll(&mut self) -> Poll;
}

/// An exclusively owned, non-thread-safe compositor connection.
///
/// Every method is called from the dispatcher thread that created the handle.
pub trait DisplayHandle: Sized + 'static {
    type Poller: Poller;

    /// Creates the blocking-wait half that shares this handle's descriptors.
    ///
    /// # Errors
    ///
    /// Returns error if the descriptors cannot be duplicated.
    fn poller(&self) -> Result<Self::Poller, Error>;

    /// Dispatches events that were already read, without blocking.
    ///
    /// # Errors
    ///
    /// Returns error if the compositor connection failed.
    fn dispatch_pending(&mut self) -> Result<usize, Error>;

    /// Writes buffered requests to the compositor.
    ///
    /// # Errors
    ///
    /// Returns error if the compositor connection failed.
    fn flush(&mut self) -> Result<(), Error>;

    /// Reads and dispatches events. Only called once the poller has reported
    /// that the connection is readable.
    ///
    /// # Errors
    ///
    /// Returns error if the compositor connection failed.
    fn blocking_dispatch(&mut self) -> Result<usize, Error>;

    /// Number of outputs whose gamma ramps can currently be set.
    fn num_ready_outputs(&self) -> usize;

    /// Applies a color setting to every ready output.
    ///
    /// # Errors
    ///
    /// Returns error if the compositor or binding refused the change.
    fn set_color(&mut self, temperature: u32, gamma: [f32; 3], brightness: f32)
    -> Result<(), Error>;

    /// Wakes a poller blocked in [`Poller::poll`].
    fn interrupt(&self);

    /// Releases every compositor object and closes the connection.
    fn destroy(self);
}

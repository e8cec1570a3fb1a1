// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

use crate::colorramp;
use crate::handle::{DisplayHandle, Poll, Poller};
use crate::output::Output;
use crate::Error;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use wayland_client::protocol::wl_registry::WlRegistry;
use wayland_client::{Connection, EventQueue, QueueHandle};
use wayland_protocols_wlr::gamma_control::v1::client::zwlr_gamma_control_manager_v1::ZwlrGammaControlManagerV1;

#[derive(Debug)]
pub struct Context {
    pub connection: Connection,
    pub handle: QueueHandle<Context>,

    pub gamma_control_manager: Option<ZwlrGammaControlManagerV1>,

    /// Announced outputs by registry name.
    pub outputs: HashMap<u32, Output>,
    pub wl_registry: WlRegistry,
}

impl Context {
    /// Connects to the compositor and waits for the initial gamma sizes.
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails, or `Unsupported` if the
    /// compositor has no gamma control manager.
    pub fn connect() -> Result<(Self, EventQueue<Self>), Error> {
        let connection = Connection::connect_to_env()?;

        let mut event_queue = connection.new_event_queue();
        let handle = event_queue.handle();

        let display = connection.display();
        let wl_registry = display.get_registry(&handle, ());

        let mut context = Self {
            connection,
            handle,
            gamma_control_manager: None,
            outputs: HashMap::new(),
            wl_registry,
        };

        event_queue.roundtrip(&mut context)?;

        if context.gamma_control_manager.is_none() {
            tracing::error!("compositor doesn't support wlr-gamma-control-unstable-v1");
            context.clear();
            let _res = context.flush();
            return Err(Error::Unsupported);
        }

        // second roundtrip for the gamma sizes of the initial outputs
        event_queue.roundtrip(&mut context)?;

        tracing::info!(
            outputs = context.outputs.len(),
            ready = context.num_ready_outputs(),
            "connected to compositor"
        );

        Ok((context, event_queue))
    }

    #[must_use]
    pub fn num_ready_outputs(&self) -> usize {
        self.outputs.values().filter(|output| output.ready()).count()
    }

    /// Requests gamma control for every output that does not have it yet.
    pub fn attach_gamma_controls(&mut self) {
        let Some(manager) = &self.gamma_control_manager else {
            return;
        };

        for output in self.outputs.values_mut() {
            output.attach(manager, &self.handle);
        }
    }

    /// Sends a gamma table for the color setting to every ready output.
    ///
    /// # Errors
    ///
    /// Returns error if there is no gamma control manager, or if a table
    /// could not be created for one of the outputs.
    pub fn set_color(
        &mut self,
        temperature: u32,
        gamma: [f32; 3],
        brightness: f32,
    ) -> Result<(), Error> {
        if self.gamma_control_manager.is_none() {
            return Err(Error::Unsupported);
        }

        self.attach_gamma_controls();

        let mut failures = Vec::new();

        for output in self.outputs.values() {
            let Some(gamma_control) = output.gamma_control.as_ref().filter(|_| output.ready())
            else {
                tracing::debug!(global = output.global, "output does not have a ramp size yet");
                continue;
            };

            let table = colorramp::fill(output.ramp_size, temperature, gamma, brightness);

            match gamma_table(&table) {
                Ok(fd) => gamma_control.set_gamma(fd.as_fd()),
                Err(why) => {
                    tracing::warn!(global = output.global, %why, "failed to create gamma table");
                    failures.push(format!("output {}: {why}", output.global));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Protocol(failures.join(", ")))
        }
    }

    /// Flushes the wayland client connection.
    ///
    /// # Errors
    ///
    /// Returns error if wayland client connection fails to flush.
    pub fn flush(&mut self) -> Result<(), Error> {
        Ok(self.connection.flush()?)
    }

    /// Destroys every output and the gamma control manager.
    pub fn clear(&mut self) {
        for (_, output) in std::mem::take(&mut self.outputs) {
            output.destroy();
        }

        if let Some(manager) = self.gamma_control_manager.take() {
            manager.destroy();
        }
    }
}

/// Writes `table` into an anonymous file positioned at its start.
fn gamma_table(table: &[u16]) -> io::Result<OwnedFd> {
    // SAFETY: the name is a nul-terminated string literal.
    let fd = unsafe { libc::memfd_create(c"gammarelay-ramp".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `fd` was just created and is not owned elsewhere.
    let mut file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

    let bytes: Vec<u8> = table.iter().flat_map(|value| value.to_ne_bytes()).collect();
    file.write_all(&bytes)?;
    file.seek(SeekFrom::Start(0))?;

    Ok(file.into())
}

/// The compositor connection as owned by the display actor.
pub struct WaylandHandle {
    context: Context,
    event_queue: EventQueue<Context>,
    interrupt: Arc<OwnedFd>,
}

impl WaylandHandle {
    /// # Errors
    ///
    /// Returns error if the compositor connection or the interrupt eventfd
    /// could not be created.
    pub fn connect() -> Result<Self, Error> {
        let (context, event_queue) = Context::connect()?;

        // SAFETY: plain syscall, the result is checked below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // SAFETY: `fd` was just created and is not owned elsewhere.
        let interrupt = Arc::new(unsafe { OwnedFd::from_raw_fd(fd) });

        Ok(Self {
            context,
            event_queue,
            interrupt,
        })
    }
}

impl DisplayHandle for WaylandHandle {
    type Poller = FdPoller;

    fn poller(&self) -> Result<FdPoller, Error> {
        Ok(FdPoller {
            display: self
                .context
                .connection
                .backend()
                .poll_fd()
                .try_clone_to_owned()?,
            interrupt: self.interrupt.clone(),
        })
    }

    fn dispatch_pending(&mut self) -> Result<usize, Error> {
        Ok(self.event_queue.dispatch_pending(&mut self.context)?)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.context.flush()
    }

    fn blocking_dispatch(&mut self) -> Result<usize, Error> {
        Ok(self.event_queue.blocking_dispatch(&mut self.context)?)
    }

    fn num_ready_outputs(&self) -> usize {
        self.context.num_ready_outputs()
    }

    fn set_color(&mut self, temperature: u32, gamma: [f32; 3], brightness: f32) -> Result<(), Error> {
        self.context.set_color(temperature, gamma, brightness)
    }

    fn interrupt(&self) {
        let value: u64 = 1;

        // SAFETY: writes eight bytes from a live u64 to an open eventfd.
        let written = unsafe {
            libc::write(
                self.interrupt.as_raw_fd(),
                std::ptr::from_ref(&value).cast(),
                std::mem::size_of::<u64>(),
            )
        };

        if written < 0 {
            tracing::warn!(why = %io::Error::last_os_error(), "failed to interrupt display wait");
        }
    }

    fn destroy(mut self) {
        self.context.clear();

        if let Err(why) = self.context.flush() {
            tracing::debug!(%why, "failed to flush before disconnecting");
        }

        tracing::debug!("compositor connection closed");
    }
}

/// Polls the display descriptor together with the interrupt eventfd.
#[derive(Debug)]
pub struct FdPoller {
    display: OwnedFd,
    interrupt: Arc<OwnedFd>,
}

impl Poller for FdPoller {
    fn poll(&mut self) -> Poll {
        let mut fds = [
            libc::pollfd {
                fd: self.display.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.interrupt.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: both descriptors stay open for the duration of the call.
        let result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };

        if fds[1].revents & libc::POLLIN != 0 {
            return Poll::Interrupted;
        }

        match result {
            0 => Poll::Timeout,
            n if n > 0 => Poll::Ready,
            _ => {
                let why = io::Error::last_os_error();
                if why.kind() == io::ErrorKind::Interrupted {
                    Poll::Timeout
                } else {
                    Poll::Failed(why)
                }
            }
        }
    }
}

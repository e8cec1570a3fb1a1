// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

use crate::Context;

use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle};
use wayland_protocols_wlr::gamma_control::v1::client::zwlr_gamma_control_manager_v1::ZwlrGammaControlManagerV1;
use wayland_protocols_wlr::gamma_control::v1::client::zwlr_gamma_control_v1::Event as ZwlrGammaControlEvent;
use wayland_protocols_wlr::gamma_control::v1::client::zwlr_gamma_control_v1::ZwlrGammaControlV1;

/// An output announced by the compositor, keyed by its registry name.
#[derive(Debug)]
pub struct Output {
    pub global: u32,
    pub wl_output: WlOutput,
    pub gamma_control: Option<ZwlrGammaControlV1>,
    /// Entries per channel, reported by the compositor. Zero until known.
    pub ramp_size: usize,
    /// Gamma control was revoked, for example because another client owns it.
    pub failed: bool,
}

impl Output {
    #[must_use]
    pub fn new(global: u32, wl_output: WlOutput) -> Self {
        Self {
            global,
            wl_output,
            gamma_control: None,
            ramp_size: 0,
            failed: false,
        }
    }

    /// Whether a gamma table can be sent to this output.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.gamma_control.is_some() && self.ramp_size > 0 && !self.failed
    }

    /// Requests a gamma control object unless one exists or a previous one failed.
    pub fn attach(&mut self, manager: &ZwlrGammaControlManagerV1, handle: &QueueHandle<Context>) {
        if self.gamma_control.is_some() || self.failed {
            return;
        }

        self.gamma_control = Some(manager.get_gamma_control(&self.wl_output, handle, self.global));
    }

    pub fn destroy(self) {
        if let Some(gamma_control) = self.gamma_control {
            gamma_control.destroy();
        }

        // release is only available from version 3 on
        if self.wl_output.version() >= 3 {
            self.wl_output.release();
        }
    }
}

impl Dispatch<WlOutput, u32> for Context {
    fn event(
        _state: &mut Self,
        _proxy: &WlOutput,
        event: <WlOutput as Proxy>::Event,
        global: &u32,
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        tracing::trace!(global, ?event, "output event");
    }
}

impl Dispatch<ZwlrGammaControlV1, u32> for Context {
    fn event(
        state: &mut Self,
        _proxy: &ZwlrGammaControlV1,
        event: <ZwlrGammaControlV1 as Proxy>::Event,
        global: &u32,
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        let Some(output) = state.outputs.get_mut(global) else {
            tracing::debug!(global, ?event, "event for a removed output");
            return;
        };

        match event {
            ZwlrGammaControlEvent::GammaSize { size } => {
                tracing::debug!(global, size, "output gamma size");
                output.ramp_size = size as usize;
            }

            ZwlrGammaControlEvent::Failed => {
                tracing::warn!(global, "gamma control failed for output");
                output.failed = true;
                output.ramp_size = 0;
                if let Some(gamma_control) = output.gamma_control.take() {
                    gamma_control.destroy();
                }
            }

            _ => tracing::debug!(?event, "unknown event"),
        }
    }
}

impl Dispatch<ZwlrGammaControlManagerV1, ()> for Context {
    fn event(
        _state: &mut Self,
        _proxy: &ZwlrGammaControlManagerV1,
        event: <ZwlrGammaControlManagerV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        tracing::debug!(?event, "unknown event");
    }
}

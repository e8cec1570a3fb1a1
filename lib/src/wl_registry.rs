// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

use crate::Context;
use crate::output::Output;
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::{Connection, Dispatch, QueueHandle, protocol::wl_registry};
use wayland_protocols_wlr::gamma_control::v1::client::zwlr_gamma_control_manager_v1::ZwlrGammaControlManagerV1;

/// Highest `wl_output` version used, the first one with `release`.
const WL_OUTPUT_VERSION: u32 = 3;

fn output_version(advertised: u32) -> u32 {
    advertised.min(WL_OUTPUT_VERSION)
}

impl Dispatch<wl_registry::WlRegistry, ()> for Context {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        handle: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                if "wl_output" == &interface[..] {
                    tracing::debug!(name, version, "output added");

                    let wl_output = registry.bind::<WlOutput, _, _>(
                        name,
                        output_version(version),
                        handle,
                        name,
                    );
                    let mut output = Output::new(name, wl_output);

                    if let Some(manager) = &state.gamma_control_manager {
                        output.attach(manager, handle);
                    }

                    state.outputs.insert(name, output);
                }

                if "zwlr_gamma_control_manager_v1" == &interface[..] {
                    state.gamma_control_manager = Some(
                        registry.bind::<ZwlrGammaControlManagerV1, _, _>(name, 1, handle, ()),
                    );

                    state.attach_gamma_controls();
                }
            }

            wl_registry::Event::GlobalRemove { name } => {
                if let Some(output) = state.outputs.remove(&name) {
                    tracing::debug!(name, "output removed");
                    output.destroy();
                }
            }

            _ => tracing::debug!(?event, "unknown event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_are_bound_with_release_when_available() {
        assert_eq!(output_version(1), 1);
        assert_eq!(output_version(2), 2);
        assert_eq!(output_version(3), 3);
        assert_eq!(output_version(4), 3);
    }
}

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use wayland_server::{protocol::wl_output, Resource as _};

use crate::config::OutputConfig;
use crate::state::State;

/// Sends the full geometry/mode/scale/done burst for one output binding.
/// Make/model are hard-coded placeholders advertised as "unknown" —
/// a single physical output is assumed throughout this core.
pub fn configure_output(output: &wl_output::WlOutput, config: OutputConfig) {
    let version = output.version();

    if version >= 4 {
        output.name("WAYCORE-1".to_string());
        output.description("waycore virtual output".to_string());
    }

    output.geometry(
        0,
        0,
        0,
        0,
        wl_output::Subpixel::HorizontalRgb,
        "unknown".to_string(),
        "unknown".to_string(),
        wl_output::Transform::Normal,
    );

    output.mode(
        wl_output::Mode::Current | wl_output::Mode::Preferred,
        config.width as i32,
        config.height as i32,
        config.refresh_mhz as i32,
    );

    if version >= 2 {
        output.scale(1);
    }

    if version >= 4 {
        output.done();
    }
}

impl wayland_server::GlobalDispatch<wl_output::WlOutput, ()> for State {
    fn bind(
        state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_output::WlOutput>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let wl_output = data_init.init(resource, ());
        configure_output(&wl_output, state.output);
        state.output_proxies.push(wl_output);
    }
}

impl wayland_server::Dispatch<wl_output::WlOutput, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_output::WlOutput,
        request: wl_output::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_output::Request::Release => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &wl_output::WlOutput,
        _data: &(),
    ) {
        state.output_proxies.retain(|o| o != resource);
    }
}

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use wayland_server::{
    protocol::{wl_keyboard, wl_pointer, wl_seat},
    Resource as _,
};

use crate::state::State;
use crate::surface::{Role, SurfaceKey};

impl wayland_server::GlobalDispatch<wl_seat::WlSeat, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_seat::WlSeat>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let wl_seat = data_init.init(resource, ());
        if wl_seat.version() >= 2 {
            wl_seat.name("seat0".to_string());
        }
        wl_seat.capabilities(wl_seat::Capability::Keyboard | wl_seat::Capability::Pointer);
    }
}

impl wayland_server::Dispatch<wl_seat::WlSeat, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_seat::WlSeat,
        request: wl_seat::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_seat::Request::GetPointer { id } => {
                let wl_pointer = data_init.init(id, ());
                state.seat.add_pointer(wl_pointer);
            }
            wl_seat::Request::GetKeyboard { id } => {
                let wl_keyboard = data_init.init(id, ());
                state.seat.add_keyboard(wl_keyboard);
            }
            wl_seat::Request::GetTouch { .. } => {
                resource.post_error(wl_seat::Error::MissingCapability, "no touch capability advertised");
            }
            wl_seat::Request::Release => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_pointer::WlPointer, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_pointer::WlPointer,
        request: wl_pointer::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_pointer::Request::SetCursor { surface, .. } => {
                // Cursor rendering belongs to the scene layer (§1); this
                // core only needs to keep the role invariant honest so a
                // cursor-mapped surface can't later be claimed as a
                // toplevel or subsurface.
                if let Some(wl_surface) = surface {
                    if let Some(&key) = wl_surface.data::<SurfaceKey>() {
                        state.set_surface_role(key, Role::Cursor);
                    }
                }
            }
            wl_pointer::Request::Release => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &wl_pointer::WlPointer,
        _data: &(),
    ) {
        state.seat.remove_pointer(resource);
    }
}

impl wayland_server::Dispatch<wl_keyboard::WlKeyboard, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_keyboard::WlKeyboard,
        request: wl_keyboard::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_keyboard::Request::Release => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &wl_keyboard::WlKeyboard,
        _data: &(),
    ) {
        state.seat.remove_keyboard(resource);
    }
}

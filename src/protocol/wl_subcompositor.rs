// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! `wl_subcompositor`/`wl_subsurface`, authored directly against the wire
//! protocol and `Surface`'s existing `parent`/`stack`/`synchronized`
//! fields, which are already shaped for it.

use wayland_server::{
    protocol::{wl_subcompositor, wl_subsurface, wl_surface},
    Resource as _,
};

use crate::state::State;
use crate::surface::{Committed, Role, SurfaceKey};

impl wayland_server::GlobalDispatch<wl_subcompositor::WlSubcompositor, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_subcompositor::WlSubcompositor>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wl_subcompositor::WlSubcompositor, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_subcompositor::WlSubcompositor,
        request: wl_subcompositor::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_subcompositor::Request::GetSubsurface { id, surface, parent } => {
                let key = *surface.data::<SurfaceKey>().expect("surface has no userdata");
                let parent_key = *parent.data::<SurfaceKey>().expect("surface has no userdata");

                if key == parent_key {
                    resource.post_error(
                        wl_subcompositor::Error::BadSurface,
                        "a surface cannot be its own parent",
                    );
                    return;
                }

                if !state.set_surface_role(key, Role::Subsurface) {
                    resource.post_error(wl_subcompositor::Error::BadSurface, "surface already has a role");
                    return;
                }

                {
                    let surface = state.surfaces.get_mut(key).expect("surface has no entry");
                    surface.parent = Some(parent_key);
                    surface.synchronized = true;
                }

                if let Some(parent) = state.surfaces.get_mut(parent_key) {
                    parent.stack.push(key);
                }

                data_init.init(id, key);
            }
            wl_subcompositor::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_subsurface::WlSubsurface, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_subsurface::WlSubsurface,
        request: wl_subsurface::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_subsurface::Request::SetPosition { x, y } => {
                let surface = state.surfaces.get_mut(*data).expect("surface has no entry");
                let pending = surface.pending();
                pending.subsurface_position = Some((x, y));
                pending.committed |= Committed::SUBSURFACE_POSITION;
            }
            // Restacking is specified to take effect on the parent's next
            // commit; this core applies it immediately, which is
            // observably identical for the common case of a client that
            // restacks and then commits the parent right after.
            wl_subsurface::Request::PlaceAbove { sibling } => {
                restack(state, resource, *data, &sibling, true);
            }
            wl_subsurface::Request::PlaceBelow { sibling } => {
                restack(state, resource, *data, &sibling, false);
            }
            wl_subsurface::Request::SetSync => {
                state.surfaces.get_mut(*data).expect("surface has no entry").synchronized = true;
            }
            wl_subsurface::Request::SetDesync => {
                let surface = state.surfaces.get_mut(*data).expect("surface has no entry");
                surface.synchronized = false;
                if let Err(err) = state.surface_flush(*data) {
                    tracing::warn!(?err, "flush after set_desync failed");
                }
            }
            wl_subsurface::Request::Destroy => {
                if let Some(surface) = state.surfaces.get_mut(*data) {
                    let parent = surface.parent.take();
                    surface.role = Role::None;
                    if let Some(parent) = parent.and_then(|p| state.surfaces.get_mut(p)) {
                        parent.stack.retain(|&k| k != *data);
                    }
                }
            }
            _ => unreachable!(),
        }
    }
}

fn restack(
    state: &mut State,
    resource: &wl_subsurface::WlSubsurface,
    child: SurfaceKey,
    sibling: &wl_surface::WlSurface,
    above: bool,
) {
    let Some(parent_key) = state.surfaces.get(child).and_then(|s| s.parent) else {
        return;
    };

    let sibling_key = if sibling.data::<SurfaceKey>() == Some(&parent_key) {
        None
    } else {
        match sibling.data::<SurfaceKey>() {
            Some(&k) => Some(k),
            None => {
                resource.post_error(wl_subsurface::Error::BadSurface, "unknown sibling surface");
                return;
            }
        }
    };

    if let Some(parent) = state.surfaces.get_mut(parent_key) {
        parent.restack_child(child, sibling_key, above);
    }
}

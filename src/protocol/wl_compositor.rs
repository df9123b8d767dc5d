// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use tracing::warn;
use wayland_server::{
    protocol::{wl_callback, wl_compositor, wl_output, wl_region, wl_surface},
    Resource as _,
};

use crate::state::State;
use crate::surface::{Committed, PendingBuffer, Surface, SurfaceKey};

impl wayland_server::GlobalDispatch<wl_compositor::WlCompositor, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wl_compositor::WlCompositor, ()> for State {
    fn request(
        state: &mut Self,
        client: &wayland_server::Client,
        _resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                let key = state
                    .surfaces
                    .insert_with_key(|k| Surface::new(data_init.init(id, k)));
                state.client_mut(client.id()).surfaces.insert(key);
            }
            wl_compositor::Request::CreateRegion { id } => {
                // Regions only matter for damage/opaque-region optimization,
                // neither of which this core implements.
                data_init.init(id, ());
            }
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_surface::WlSurface, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_surface::Request::Attach { buffer, x, y } => {
                if (x != 0 || y != 0) && resource.version() >= 5 {
                    resource.post_error(
                        wl_surface::Error::InvalidOffset,
                        "wl_surface.attach with a non-zero offset requires version < 5",
                    );
                    return;
                } else if x != 0 || y != 0 {
                    warn!(x, y, "ignoring nonzero buffer attach offset (pre-v5 semantics)");
                }

                let surface = state.surfaces.get_mut(*data).expect("surface has no entry");
                let pending = surface.pending();
                pending.buffer = Some(match buffer {
                    Some(buf) => PendingBuffer::Attach(*buf.data().expect("buffer has no userdata")),
                    None => PendingBuffer::Detach,
                });
                pending.committed |= Committed::BUFFER;
            }
            wl_surface::Request::Frame { callback } => {
                let callback = data_init.init(callback, *data);
                state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry")
                    .pending()
                    .frame_callbacks
                    .push(callback);
                state.request_redraw();
            }
            wl_surface::Request::Commit => {
                let surface = state.surfaces.get(*data).expect("surface has no entry");
                if surface.synchronized {
                    if let Some(parent_key) = surface.parent {
                        let wait_for = state.surfaces.get(parent_key).map(|p| p.last_commit_id + 1);
                        state
                            .surfaces
                            .get_mut(*data)
                            .expect("surface has no entry")
                            .pending()
                            .parent_commit = wait_for;
                    }
                }

                if let Err(err) = state.surface_commit(*data) {
                    warn!(?err, "wl_surface.commit failed");
                }
                state.handle_role_commit(*data);
            }
            wl_surface::Request::SetBufferTransform { transform } => {
                if !matches!(transform.into_result(), Ok(wl_output::Transform::Normal)) {
                    warn!(?transform, "ignoring non-normal buffer transform");
                }
            }
            wl_surface::Request::SetBufferScale { scale } => {
                if scale < 1 {
                    resource.post_error(wl_surface::Error::InvalidScale, "scale must be >= 1");
                } else if scale != 1 {
                    warn!(scale, "ignoring non-1 buffer scale");
                }
            }
            wl_surface::Request::Offset { x, y } => {
                if x != 0 || y != 0 {
                    warn!(x, y, "ignoring nonzero buffer offset");
                }
            }
            // Damage tracking is a repaint optimization this core doesn't
            // perform; every present recomposites the full output.
            wl_surface::Request::Damage { .. } => (),
            wl_surface::Request::DamageBuffer { .. } => (),
            wl_surface::Request::SetOpaqueRegion { .. } => (),
            wl_surface::Request::SetInputRegion { .. } => (),
            wl_surface::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        client: wayland_server::backend::ClientId,
        _resource: &wl_surface::WlSurface,
        data: &SurfaceKey,
    ) {
        state.surface_destroyed(client, *data);
    }
}

impl wayland_server::Dispatch<wl_callback::WlCallback, SurfaceKey> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_callback::WlCallback,
        _request: wl_callback::Request,
        _data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}

impl wayland_server::Dispatch<wl_region::WlRegion, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_region::WlRegion,
        _request: wl_region::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}

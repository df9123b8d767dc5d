// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Mutex;

use tracing::debug;
use wayland_protocols::xdg::shell::server::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};
use wayland_server::Resource as _;

use crate::shell::{ConstraintAdjustment, Edge, Positioner, Rect};
use crate::state::State;
use crate::surface::{Committed, Role, SurfaceKey};

impl wayland_server::GlobalDispatch<xdg_wm_base::XdgWmBase, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<xdg_wm_base::XdgWmBase>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<xdg_wm_base::XdgWmBase, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::CreatePositioner { id } => {
                data_init.init(id, Mutex::new(Positioner::default()));
            }
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let surface_key = surface.data::<SurfaceKey>().expect("surface has no userdata");

                let existing = state.surfaces.get(*surface_key).expect("surface has no entry");
                if existing.role != Role::None {
                    resource.post_error(xdg_wm_base::Error::Role, "surface already has a role");
                    return;
                }

                data_init.init(id, *surface_key);
            }
            xdg_wm_base::Request::Pong { .. } => (),
            xdg_wm_base::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

/// Accumulates `xdg_positioner` requests into a `Positioner`, finalized
/// (cloned out) once it's handed to a surface via `xdg_surface.get_popup`
/// or `xdg_popup.reposition`.
impl wayland_server::Dispatch<xdg_positioner::XdgPositioner, Mutex<Positioner>> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_positioner::XdgPositioner,
        request: xdg_positioner::Request,
        data: &Mutex<Positioner>,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let mut positioner = data.lock().unwrap();

        match request {
            xdg_positioner::Request::SetSize { width, height } => {
                if width < 1 || height < 1 {
                    resource.post_error(xdg_positioner::Error::InvalidInput, "size must be positive");
                    return;
                }
                positioner.size = (width, height);
            }
            xdg_positioner::Request::SetAnchorRect { x, y, width, height } => {
                if width < 1 || height < 1 {
                    resource.post_error(xdg_positioner::Error::InvalidInput, "anchor rect must be positive");
                    return;
                }
                positioner.anchor_rect = Rect { x, y, width, height };
            }
            xdg_positioner::Request::SetAnchor { anchor } => {
                positioner.anchor = xdg_anchor_to_edge(anchor.into_result().unwrap_or(xdg_positioner::Anchor::None));
            }
            xdg_positioner::Request::SetGravity { gravity } => {
                positioner.gravity =
                    xdg_gravity_to_edge(gravity.into_result().unwrap_or(xdg_positioner::Gravity::None));
            }
            xdg_positioner::Request::SetConstraintAdjustment {
                constraint_adjustment,
            } => {
                positioner.constraint_adjustment = xdg_constraint_adjustment(constraint_adjustment);
            }
            xdg_positioner::Request::SetOffset { x, y } => {
                positioner.offset = (x, y);
            }
            xdg_positioner::Request::SetReactive => {
                positioner.reactive = true;
            }
            // Parent size/configure hints only matter for reactive
            // repositioning against an independently resizing parent,
            // which this core's scene-owned layout doesn't drive.
            xdg_positioner::Request::SetParentSize { .. } => (),
            xdg_positioner::Request::SetParentConfigure { .. } => (),
            xdg_positioner::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

fn xdg_anchor_to_edge(anchor: xdg_positioner::Anchor) -> Edge {
    use xdg_positioner::Anchor;
    match anchor {
        Anchor::None => Edge::None,
        Anchor::Top => Edge::Top,
        Anchor::Bottom => Edge::Bottom,
        Anchor::Left => Edge::Left,
        Anchor::Right => Edge::Right,
        Anchor::TopLeft => Edge::TopLeft,
        Anchor::TopRight => Edge::TopRight,
        Anchor::BottomLeft => Edge::BottomLeft,
        Anchor::BottomRight => Edge::BottomRight,
        _ => Edge::None,
    }
}

fn xdg_gravity_to_edge(gravity: xdg_positioner::Gravity) -> Edge {
    use xdg_positioner::Gravity;
    match gravity {
        Gravity::None => Edge::None,
        Gravity::Top => Edge::Top,
        Gravity::Bottom => Edge::Bottom,
        Gravity::Left => Edge::Left,
        Gravity::Right => Edge::Right,
        Gravity::TopLeft => Edge::TopLeft,
        Gravity::TopRight => Edge::TopRight,
        Gravity::BottomLeft => Edge::BottomLeft,
        Gravity::BottomRight => Edge::BottomRight,
        _ => Edge::None,
    }
}

fn xdg_constraint_adjustment(bits: xdg_positioner::ConstraintAdjustment) -> ConstraintAdjustment {
    let mut out = ConstraintAdjustment::empty();
    if bits.contains(xdg_positioner::ConstraintAdjustment::SlideX) {
        out |= ConstraintAdjustment::SLIDE_X;
    }
    if bits.contains(xdg_positioner::ConstraintAdjustment::SlideY) {
        out |= ConstraintAdjustment::SLIDE_Y;
    }
    if bits.contains(xdg_positioner::ConstraintAdjustment::FlipX) {
        out |= ConstraintAdjustment::FLIP_X;
    }
    if bits.contains(xdg_positioner::ConstraintAdjustment::FlipY) {
        out |= ConstraintAdjustment::FLIP_Y;
    }
    if bits.contains(xdg_positioner::ConstraintAdjustment::ResizeX) {
        out |= ConstraintAdjustment::RESIZE_X;
    }
    if bits.contains(xdg_positioner::ConstraintAdjustment::ResizeY) {
        out |= ConstraintAdjustment::RESIZE_Y;
    }
    out
}

impl wayland_server::Dispatch<xdg_surface::XdgSurface, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                if !state.set_surface_role(*data, Role::XdgToplevel) {
                    resource.post_error(xdg_wm_base::Error::Role, "surface already has a role");
                    return;
                }

                let xdg_toplevel = data_init.init(id, *data);
                let surface = state.surfaces.get_mut(*data).expect("surface has no entry");
                surface.xdg_surface = Some(resource.clone());
                surface.xdg_toplevel = Some(xdg_toplevel);
            }
            xdg_surface::Request::GetPopup { id, parent, positioner } => {
                if !state.set_surface_role(*data, Role::XdgPopup) {
                    resource.post_error(xdg_wm_base::Error::Role, "surface already has a role");
                    return;
                }

                let positioner = positioner
                    .data::<Mutex<Positioner>>()
                    .expect("positioner has no userdata")
                    .lock()
                    .unwrap();

                let xdg_popup = data_init.init(id, *data);
                let surface = state.surfaces.get_mut(*data).expect("surface has no entry");
                surface.xdg_surface = Some(resource.clone());
                surface.xdg_popup = Some(xdg_popup);
                surface.positioner = Some(*positioner);
                surface.parent = parent.and_then(|p| p.data::<SurfaceKey>().copied());
            }
            xdg_surface::Request::AckConfigure { serial } => {
                let surface = state.surfaces.get_mut(*data).expect("surface has no entry");
                match surface.pending_configure {
                    Some(s) if serial == s => {
                        surface.pending().ack_serial = Some(serial);
                        surface.pending().committed |= Committed::ACK;
                    }
                    Some(s) if serial < s => {
                        debug!(serial, most_recent_sent = s, "ignoring stale ack_configure");
                    }
                    _ => resource.post_error(xdg_surface::Error::InvalidSerial, "invalid or unknown serial"),
                }
            }
            xdg_surface::Request::SetWindowGeometry { x, y, width, height } => {
                if width < 1 || height < 1 {
                    resource.post_error(xdg_surface::Error::InvalidSize, "window geometry must be positive");
                    return;
                }

                let surface = state.surfaces.get_mut(*data).expect("surface has no entry");
                let pending = surface.pending();
                pending.geometry = Some(Rect { x, y, width, height });
                pending.committed |= Committed::GEOMETRY;
            }
            xdg_surface::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &xdg_surface::XdgSurface,
        data: &SurfaceKey,
    ) {
        let Some(surface) = state.surfaces.get(*data) else {
            return;
        };

        let still_has_role_object = surface.xdg_toplevel.is_some() || surface.xdg_popup.is_some();
        if still_has_role_object {
            resource.post_error(
                xdg_surface::Error::DefunctRoleObject,
                "the role object created from this xdg_surface must be destroyed first",
            );
        }
    }
}

impl wayland_server::Dispatch<xdg_toplevel::XdgToplevel, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let surface = state.surfaces.get_mut(*data).expect("surface has no entry");

        match request {
            xdg_toplevel::Request::SetTitle { title } => {
                let pending = surface.pending();
                pending.toplevel_title = Some(title);
                pending.committed |= Committed::TOPLEVEL_TITLE;
            }
            xdg_toplevel::Request::SetAppId { app_id } => {
                let pending = surface.pending();
                pending.toplevel_app_id = Some(app_id);
                pending.committed |= Committed::TOPLEVEL_APP_ID;
            }
            // Interactive move/resize, window-menu placement, and the
            // maximize/fullscreen/minimize state transitions are all
            // owned by the scene/window-manager layer; this core only
            // relays the surface's own requests for title/app_id, and
            // leaves state negotiation to whatever later calls
            // `State::configure_toplevel`.
            xdg_toplevel::Request::SetParent { .. } => (),
            xdg_toplevel::Request::ShowWindowMenu { .. } => (),
            xdg_toplevel::Request::Move { .. } => (),
            xdg_toplevel::Request::Resize { .. } => (),
            xdg_toplevel::Request::SetMaxSize { .. } => (),
            xdg_toplevel::Request::SetMinSize { .. } => (),
            xdg_toplevel::Request::SetMaximized => (),
            xdg_toplevel::Request::UnsetMaximized => (),
            xdg_toplevel::Request::SetFullscreen { .. } => (),
            xdg_toplevel::Request::UnsetFullscreen => (),
            xdg_toplevel::Request::SetMinimized => (),
            xdg_toplevel::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &xdg_toplevel::XdgToplevel,
        data: &SurfaceKey,
    ) {
        let Some(surface) = state.surfaces.get_mut(*data) else {
            return;
        };

        if surface.xdg_toplevel.as_ref() == Some(resource) {
            surface.xdg_toplevel = None;
            state.unmap_surface(*data);
        }
    }
}

impl wayland_server::Dispatch<xdg_popup::XdgPopup, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_popup::XdgPopup,
        request: xdg_popup::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            // Popup grabs are a pointer-focus concern the scene layer
            // arbitrates; this core just accepts the request without
            // dismissing the popup, since popups are fully supported here.
            xdg_popup::Request::Grab { .. } => (),
            xdg_popup::Request::Reposition { positioner, token } => {
                let new_positioner = *positioner
                    .data::<Mutex<Positioner>>()
                    .expect("positioner has no userdata")
                    .lock()
                    .unwrap();

                let surface = state.surfaces.get_mut(*data).expect("surface has no entry");
                surface.positioner = Some(new_positioner);

                state.configure_popup(*data, &new_positioner);
                resource.repositioned(token);
            }
            xdg_popup::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &xdg_popup::XdgPopup,
        data: &SurfaceKey,
    ) {
        let Some(surface) = state.surfaces.get_mut(*data) else {
            return;
        };

        if surface.xdg_popup.as_ref() == Some(resource) {
            surface.xdg_popup = None;
            state.unmap_surface(*data);
        }
    }
}

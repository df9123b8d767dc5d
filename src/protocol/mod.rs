// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! `wayland_server::Dispatch`/`GlobalDispatch` implementations for every
//! interface `State` serves, one module per interface family. There's no
//! protocol logic here beyond request/event translation: everything that
//! isn't purely wire-level plumbing lives on `State`, `Surface`, `Seat`,
//! or `shell`, and these modules just call into it.

mod wl_compositor;
mod wl_output;
mod wl_seat;
mod wl_shm;
mod wl_subcompositor;
mod xdg_shell;

use wayland_protocols::xdg::shell::server::xdg_wm_base;
use wayland_server::protocol::{wl_compositor, wl_output, wl_seat, wl_shm, wl_subcompositor};

use crate::state::State;

/// Registers every global this core serves, at the highest protocol
/// version whose behavior is fully implemented.
pub fn create_globals(dh: &wayland_server::DisplayHandle) {
    dh.create_global::<State, wl_compositor::WlCompositor, _>(6, ());
    dh.create_global::<State, wl_subcompositor::WlSubcompositor, _>(1, ());
    dh.create_global::<State, wl_shm::WlShm, _>(2, ());
    dh.create_global::<State, wl_seat::WlSeat, _>(9, ());
    dh.create_global::<State, wl_output::WlOutput, _>(4, ());
    dh.create_global::<State, xdg_wm_base::XdgWmBase, _>(7, ());
}

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A connected protocol peer: the set of resources owned per-client that
//! don't belong to a single surface or seat resource.

use std::collections::HashSet;

use crate::surface::SurfaceKey;

/// A connected client's compositor-side state. Created on socket accept
/// (see `wayland_server::backend::ClientData`'s `initialized` hook) and
/// torn down on disconnect.
#[derive(Default)]
pub struct Client {
    pub surfaces: HashSet<SurfaceKey>,
    pub keyboard_focus: Option<SurfaceKey>,
    pub pointer_focus: Option<SurfaceKey>,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases every owned surface; the caller is responsible for
    /// actually destroying the corresponding `Surface` entries (and their
    /// GPU-visible images) after this returns, per the data-model
    /// ordering requirement that surfaces release before GPU resources.
    pub fn disown_surfaces(&mut self) -> Vec<SurfaceKey> {
        self.keyboard_focus = None;
        self.pointer_focus = None;
        self.surfaces.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disown_surfaces_clears_focus_and_returns_owned_keys() {
        let mut client = Client::new();
        let a = SurfaceKey::default();
        client.surfaces.insert(a);
        client.keyboard_focus = Some(a);

        let owned = client.disown_surfaces();
        assert_eq!(owned, vec![a]);
        assert!(client.surfaces.is_empty());
        assert!(client.keyboard_focus.is_none());
    }
}

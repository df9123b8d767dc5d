// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Keymap distribution, focus arbitration, and serial-stamped event
//! fan-out to a client's bound keyboard/pointer resources.

use std::collections::{HashMap, HashSet};

use cstr::cstr;
use wayland_server::protocol::{wl_keyboard, wl_pointer, wl_surface};
use wayland_server::Resource as _;

use crate::sealed::SealedFile;
use crate::serial::Serial;

static EPOCH: std::sync::LazyLock<std::time::Instant> = std::sync::LazyLock::new(std::time::Instant::now);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Pressed,
    Released,
}

struct BoundPointer {
    pending_frame: bool,
}

/// One seat: the compositor has exactly one, shared by every client.
pub struct Seat {
    serial: Serial,

    pointers: HashMap<wl_pointer::WlPointer, BoundPointer>,
    pointer_focus: Option<(wl_surface::WlSurface, (f64, f64))>,

    keyboards: HashSet<wl_keyboard::WlKeyboard>,
    keyboard_focus: Option<wl_surface::WlSurface>,
    keymap: SealedFile,
}

impl Seat {
    pub fn new(keymap_string: &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            serial: Serial::new(),
            pointers: HashMap::new(),
            pointer_focus: None,
            keyboards: HashSet::new(),
            keyboard_focus: None,
            keymap: SealedFile::new(cstr!("waycore-keymap"), keymap_string)?,
        })
    }

    pub fn serial(&self) -> &Serial {
        &self.serial
    }

    pub fn add_pointer(&mut self, wl_pointer: wl_pointer::WlPointer) {
        self.pointers.insert(wl_pointer, BoundPointer { pending_frame: false });
    }

    pub fn remove_pointer(&mut self, wl_pointer: &wl_pointer::WlPointer) {
        self.pointers.remove(wl_pointer);
    }

    /// Binds a fresh `wl_keyboard`, handing it a new fd onto the sealed
    /// keymap memfd (never the seat's own fd, so the client can't race a
    /// reseal against another client's reference).
    pub fn add_keyboard(&mut self, wl_keyboard: wl_keyboard::WlKeyboard) {
        use std::os::fd::AsFd as _;

        wl_keyboard.keymap(wl_keyboard::KeymapFormat::XkbV1, self.keymap.as_fd(), self.keymap.size() as u32);

        if wl_keyboard.version() >= 4 {
            wl_keyboard.repeat_info(0, i32::MAX);
        }

        self.keyboards.insert(wl_keyboard);
    }

    pub fn remove_keyboard(&mut self, wl_keyboard: &wl_keyboard::WlKeyboard) {
        self.keyboards.remove(wl_keyboard);
    }

    fn pointers_for(&mut self, surface: &wl_surface::WlSurface) -> impl Iterator<Item = (&wl_pointer::WlPointer, &mut BoundPointer)> {
        self.pointers.iter_mut().filter(|(p, _)| p.is_alive() && p.id().same_client_as(&surface.id()))
    }

    fn keyboards_for(&self, surface: &wl_surface::WlSurface) -> impl Iterator<Item = &wl_keyboard::WlKeyboard> {
        self.keyboards.iter().filter(|k| k.is_alive() && k.id().same_client_as(&surface.id()))
    }

    /// Moves pointer focus to `surface` at `local_coords` (already
    /// translated through the scene's hit-test), sending `leave` to the
    /// old focus's resources and `enter` to the new focus's resources,
    /// frame-grouped.
    pub fn set_pointer_focus(&mut self, surface: Option<(wl_surface::WlSurface, (f64, f64))>) {
        if let Some((old, coords)) = &self.pointer_focus {
            if Some((old.clone(), *coords)) != surface {
                let serial = self.serial.next();
                for (p, bound) in self.pointers_for(old) {
                    p.leave(serial, old);
                    bound.pending_frame = true;
                }
            }
        }

        if let Some((new, (x, y))) = &surface {
            let already_focused = self.pointer_focus.as_ref().map(|(s, _)| s) == Some(new);
            if !already_focused {
                let serial = self.serial.next();
                for (p, bound) in self.pointers_for(new) {
                    p.enter(serial, new, *x, *y);
                    bound.pending_frame = true;
                }
            } else if self.pointer_focus.as_ref().map(|(_, c)| *c) != Some((*x, *y)) {
                for (p, bound) in self.pointers_for(new) {
                    p.motion(EPOCH.elapsed().as_millis() as u32, *x, *y);
                    bound.pending_frame = true;
                }
            }
        }

        self.pointer_focus = surface;
        self.flush_pointer_frames();
    }

    pub fn pointer_button(&mut self, button_code: u32, state: ButtonState) {
        let Some((focus, _)) = self.pointer_focus.clone() else {
            return;
        };

        let wl_state = match state {
            ButtonState::Pressed => wl_pointer::ButtonState::Pressed,
            ButtonState::Released => wl_pointer::ButtonState::Released,
        };

        let serial = self.serial.next();
        let now = EPOCH.elapsed().as_millis() as u32;
        for (p, bound) in self.pointers_for(&focus) {
            p.button(serial, now, button_code, wl_state);
            bound.pending_frame = true;
        }

        self.flush_pointer_frames();
    }

    pub fn pointer_axis(&mut self, horizontal: f64, vertical: f64) {
        let Some((focus, _)) = self.pointer_focus.clone() else {
            return;
        };

        let now = EPOCH.elapsed().as_millis() as u32;
        for (p, bound) in self.pointers_for(&focus) {
            if horizontal != 0.0 {
                p.axis(now, wl_pointer::Axis::HorizontalScroll, horizontal);
                bound.pending_frame = true;
            }
            if vertical != 0.0 {
                p.axis(now, wl_pointer::Axis::VerticalScroll, vertical);
                bound.pending_frame = true;
            }
        }

        self.flush_pointer_frames();
    }

    fn flush_pointer_frames(&mut self) {
        for (p, bound) in self.pointers.iter_mut() {
            if bound.pending_frame {
                if p.version() >= 5 {
                    p.frame();
                }
                bound.pending_frame = false;
            }
        }
    }

    /// Moves keyboard focus, sending `leave`/`enter`. `pressed_keys` is the
    /// set of scancodes to report as already depressed to the newly
    /// focused client (empty if none).
    pub fn set_keyboard_focus(&mut self, surface: Option<wl_surface::WlSurface>, pressed_keys: &[u32]) {
        if self.keyboard_focus == surface {
            return;
        }

        if let Some(old) = self.keyboard_focus.take() {
            let serial = self.serial.next();
            for k in self.keyboards_for(&old) {
                k.leave(serial, &old);
            }
        }

        if let Some(new) = surface.as_ref() {
            for k in self.keyboards_for(new) {
                let serial = self.serial.next();
                k.enter(serial, new, pressed_keys.iter().flat_map(|k| k.to_ne_bytes()).collect());
                k.modifiers(self.serial.next(), 0, 0, 0, 0);
            }
        }

        self.keyboard_focus = surface;
    }

    pub fn keyboard_key(&mut self, scancode: u32, state: KeyState) {
        let Some(focus) = self.keyboard_focus.clone() else {
            return;
        };

        let wl_state = match state {
            KeyState::Pressed => wl_keyboard::KeyState::Pressed,
            KeyState::Released => wl_keyboard::KeyState::Released,
        };

        let serial = self.serial.next();
        let now = EPOCH.elapsed().as_millis() as u32;
        for k in self.keyboards_for(&focus) {
            k.key(serial, now, scancode, wl_state);
        }
    }

    pub fn pointer_focus_surface(&self) -> Option<&wl_surface::WlSurface> {
        self.pointer_focus.as_ref().map(|(s, _)| s)
    }

    pub fn keyboard_focus_surface(&self) -> Option<&wl_surface::WlSurface> {
        self.keyboard_focus.as_ref()
    }
}

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The process root (`Server`): owns the event loop, the GPU context, the
//! presentation backend, and the `wayland_server::Display` every client
//! connects to. Constructed once at startup and run until the process is
//! asked to stop. The long-lived handles are bundled behind one `run` loop,
//! with the fd multiplexing and backend dispatch split out into their own
//! abstractions (`event_loop::EventLoop`, `backend::Backend`) rather than
//! polled inline here.

use std::cell::RefCell;
use std::io;
use std::os::fd::AsRawFd as _;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{info, warn};
use wayland_server::{Display, ListeningSocket};

use crate::backend::{self, Backend, InputEvent, OutputId, OutputRequest};
use crate::config::Config;
use crate::event_loop::{EventLoop, Token};
use crate::output::{CommitFlags, ImageConfig, Output};
use crate::renderer;
use crate::scene::NullScene;
use crate::seat::Seat;
use crate::state::{ClientState, State};
use crate::vulkan::{Features, ImageUsage, VkContext};

const KEYMAP: &[u8] = include_bytes!("../assets/keymap_us.xkb");

/// The pieces that both the display's own fd and the listening socket's fd
/// need mutable access to. Kept separate from the `EventLoop` itself (which
/// is consumed by `run`) and shared between the dispatch and post-step
/// closures via `Rc<RefCell<_>>`, the same single-threaded sharing pattern
/// the nested backend uses for its own `wayland_client` event queue.
struct Shared {
    display: Display<State>,
    socket: ListeningSocket,
    state: State,
    backend: Box<dyn Backend>,
    output_id: OutputId,
    output: Output,
    vk: Arc<VkContext>,
    display_token: Token,
    socket_token: Token,
}

impl Shared {
    fn dispatch(&mut self, token: Token) -> Result<()> {
        if token == self.display_token {
            if let Err(err) = self.display.dispatch_clients(&mut self.state) {
                warn!(?err, "error dispatching wayland clients");
            }
            return Ok(());
        }

        if token == self.socket_token {
            loop {
                match self.socket.accept() {
                    Ok(Some(stream)) => {
                        self.display
                            .handle()
                            .insert_client(stream, Arc::new(ClientState))
                            .context("inserting new wayland client")?;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(?err, "error accepting wayland client");
                        break;
                    }
                }
            }
            return Ok(());
        }

        // Any other token belongs to a fd the backend registered itself
        // (the parent compositor's connection, or libinput/DRM fds); the
        // backend reports whatever it read through `poll_input` in the
        // post-step below rather than per-token here.
        Ok(())
    }

    fn post_step(&mut self) -> Result<()> {
        self.display.flush_clients().context("flushing wayland clients")?;
        self.state.poll_buffer_releases();
        self.state.recorder.poll().context("polling command recorder")?;
        self.output.poll_releases().context("polling output releases")?;

        for event in self.backend.poll_input() {
            self.handle_input(event);
        }

        for id in self.backend.poll_frame_done() {
            if id == self.output_id {
                self.output.commit_available = true;
            }
        }

        if self.state.take_redraw_request() {
            self.output.frame_requested = true;
        }

        if let Some(image) = self.output.try_redraw().context("acquiring output image")? {
            let vk = self.vk.clone();
            let acquire = renderer::clear(&vk, &self.state.recorder, &image).context("recording composite pass")?;

            let backend = &mut self.backend;
            let output_id = self.output_id;
            self.output
                .present(image, acquire, |image, acquire, release, flags: CommitFlags| {
                    backend.commit(output_id, image, acquire, release, flags)
                })
                .context("presenting output image")?;

            self.output.frame_requested = false;

            let now_ms = std::time::Instant::now().elapsed().as_millis() as u32;
            for surface in self.state.surfaces.values_mut() {
                surface.fire_frame_callbacks(now_ms);
            }
        }

        Ok(())
    }

    /// Routes one backend input event through the seat, consulting the
    /// scene for hit-testing where the event carries a position. Absolute
    /// motion re-focuses the pointer; everything else targets whatever
    /// surface is already focused.
    fn handle_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::PointerMotionAbsolute { x, y } => {
                let hit = self.state.scene.hit_test(x, y);
                let focus = hit.map(|(key, coords)| {
                    let surface = self.state.surfaces.get(key).map(|s| s.wl_surface.clone());
                    (surface, coords)
                });

                match focus {
                    Some((Some(surface), coords)) => {
                        self.state.seat.set_pointer_focus(Some((surface, (coords.x, coords.y))));
                    }
                    _ => self.state.seat.set_pointer_focus(None),
                }
            }
            InputEvent::PointerMotion { dx, dy } => {
                // Relative deltas only matter once `wp_relative_pointer` is
                // bound; this core doesn't serve that global yet, so
                // there's nowhere to deliver them.
                let _ = (dx, dy);
            }
            InputEvent::PointerButton { code, state } => {
                self.state.seat.pointer_button(code, state);
            }
            InputEvent::PointerAxis { horizontal, vertical } => {
                self.state.seat.pointer_axis(horizontal, vertical);
            }
            InputEvent::KeyboardKey { scancode, state } => {
                if self.state.seat.keyboard_focus_surface().is_none() {
                    if let Some(surface) = self
                        .state
                        .scene
                        .focus_target()
                        .and_then(|key| self.state.surfaces.get(key))
                        .map(|s| s.wl_surface.clone())
                    {
                        self.state.seat.set_keyboard_focus(Some(surface), &[]);
                    }
                }

                self.state.seat.keyboard_key(scancode, state);
            }
        }
    }
}

pub struct Server {
    event_loop: EventLoop,
    shared: Rc<RefCell<Shared>>,
}

impl Server {
    pub fn new(cfg: Config) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("creating event loop")?;

        let features = if cfg.gpu.validation {
            Features::VALIDATION
        } else {
            Features::empty()
        };
        let vk = VkContext::new(features).context("initializing GPU context")?;

        let mut backend = backend::create(&cfg, vk.clone()).context("creating presentation backend")?;
        backend.start(&mut event_loop).context("starting presentation backend")?;

        let output_id = backend
            .create_output(OutputRequest {
                width: cfg.output.width,
                height: cfg.output.height,
                refresh_mhz: cfg.output.refresh_mhz,
            })
            .context("creating initial output")?;

        let output = Output::new(
            vk.clone(),
            ImageConfig {
                extent: (cfg.output.width, cfg.output.height),
                usage: ImageUsage::TEXTURE | ImageUsage::TRANSFER_DST,
            },
        );

        let seat = Seat::new(KEYMAP).context("building seat keymap")?;
        let state = State::new(vk.clone(), seat, cfg.output, Box::new(NullScene));

        let display = Display::<State>::new().context("creating wayland display")?;
        crate::protocol::create_globals(&display.handle());

        let socket = bind_socket(cfg.socket_name.as_deref()).context("binding wayland socket")?;
        let socket_name = socket
            .socket_name()
            .context("bound listening socket reports no name")?
            .to_string_lossy()
            .into_owned();
        std::env::set_var("WAYLAND_DISPLAY", &socket_name);
        info!(socket = %socket_name, backend = ?cfg.backend, "waycore listening");

        let display_token = event_loop
            .register(display.backend().poll_fd().as_raw_fd(), mio::Interest::READABLE)
            .context("registering wayland display fd")?;
        let socket_token = event_loop
            .register(socket.as_raw_fd(), mio::Interest::READABLE)
            .context("registering wayland listening socket fd")?;

        let shared = Rc::new(RefCell::new(Shared {
            display,
            socket,
            state,
            backend,
            output_id,
            output,
            vk,
            display_token,
            socket_token,
        }));

        Ok(Self { event_loop, shared })
    }

    /// Runs until the event loop is stopped (currently only by a fatal
    /// error bubbling out of a dispatch or post-step): dispatch wayland
    /// clients, flush, poll GPU/backend progress, composite and present,
    /// repeat.
    pub fn run(mut self) -> Result<()> {
        let post_step_shared = self.shared.clone();
        self.event_loop.add_post_step(move || post_step_shared.borrow_mut().post_step());

        let dispatch_shared = self.shared.clone();
        self.event_loop.run(move |token| dispatch_shared.borrow_mut().dispatch(token))
    }

    pub fn task_sender(&self) -> crate::waking_sender::WakingSender<crate::event_loop::Task> {
        self.event_loop.task_sender()
    }

    pub fn stop_handle(&self) -> crate::event_loop::StopHandle {
        self.event_loop.stop_handle()
    }
}

/// Binds the wayland listening socket: `name` if given, otherwise the
/// first free `wayland-N` slot under `$XDG_RUNTIME_DIR`, the convention
/// every wayland client expects when resolving `$WAYLAND_DISPLAY`.
fn bind_socket(name: Option<&str>) -> io::Result<ListeningSocket> {
    if let Some(name) = name {
        return ListeningSocket::bind(name);
    }

    for n in 0..32 {
        match ListeningSocket::bind(format!("wayland-{n}")) {
            Ok(socket) => return Ok(socket),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
            Err(err) => return Err(err),
        }
    }

    Err(io::Error::new(io::ErrorKind::AddrInUse, "no free wayland-N socket name found"))
}

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Presentation by nesting inside a parent Wayland compositor: every
//! output is a toplevel window on the parent's desktop, and every GPU
//! image we commit is proxied across as a dma-buf-backed `wl_buffer`.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd as _, OwnedFd};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::vk::Handle as _;
use tracing::{trace, warn};
use wayland_client::globals::{registry_queue_init, GlobalList, GlobalListContents};
use wayland_client::protocol::{wl_buffer, wl_callback, wl_compositor, wl_keyboard, wl_pointer, wl_registry, wl_seat, wl_surface};
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{zwp_linux_buffer_params_v1, zwp_linux_dmabuf_v1};
use wayland_protocols::wp::linux_drm_syncobj::v1::client::{
    wp_linux_drm_syncobj_manager_v1, wp_linux_drm_syncobj_surface_v1, wp_linux_drm_syncobj_timeline_v1,
};
use wayland_protocols::wp::pointer_constraints::zv1::client::zwp_pointer_constraints_v1;
use wayland_protocols::wp::relative_pointer::zv1::client::zwp_relative_pointer_manager_v1;
use wayland_protocols::xdg::decoration::zv1::client::{zxdg_decoration_manager_v1, zxdg_toplevel_decoration_v1};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

use super::{Backend, InputEvent, OutputId, OutputRequest, SyncBridge};
use crate::event_loop::EventLoop;
use crate::output::CommitFlags;
use crate::seat::{ButtonState, KeyState};
use crate::vulkan::{commands::Syncpoint, format, Image, VkContext};

fn split_point(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, (value & 0xffff_ffff) as u32)
}

/// Globals we require at minimum; `zxdg_decoration_manager_v1`,
/// `zwp_pointer_constraints_v1` and `zwp_relative_pointer_manager_v1` are
/// bound when present but a parent lacking them just means client-side
/// decorations and no pointer locking, neither of which we implement yet.
struct Registry {
    compositor: wl_compositor::WlCompositor,
    xdg_wm_base: xdg_wm_base::XdgWmBase,
    seat: wl_seat::WlSeat,
    dmabuf: zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
    syncobj_manager: Option<wp_linux_drm_syncobj_manager_v1::WpLinuxDrmSyncobjManagerV1>,
    decoration_manager: Option<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1>,
    pointer_constraints: Option<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1>,
    relative_pointer_manager: Option<zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1>,
}

impl Registry {
    fn bind(globals: &GlobalList, qh: &QueueHandle<ClientState>) -> Result<Self> {
        macro_rules! bind_required {
            ($iface:ty, $max:expr) => {
                globals
                    .bind::<$iface, _, _>(qh, 1..=$max, ())
                    .with_context(|| format!("parent compositor is missing {}", <$iface>::interface().name))?
            };
        }
        macro_rules! bind_optional {
            ($iface:ty, $max:expr) => {
                globals.bind::<$iface, _, _>(qh, 1..=$max, ()).ok()
            };
        }

        Ok(Self {
            compositor: bind_required!(wl_compositor::WlCompositor, 6),
            xdg_wm_base: bind_required!(xdg_wm_base::XdgWmBase, 6),
            seat: bind_required!(wl_seat::WlSeat, 8),
            dmabuf: bind_required!(zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, 4),
            syncobj_manager: bind_optional!(wp_linux_drm_syncobj_manager_v1::WpLinuxDrmSyncobjManagerV1, 1),
            decoration_manager: bind_optional!(zxdg_decoration_manager_v1::ZxdgDecorationManagerV1, 1),
            pointer_constraints: bind_optional!(zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, 1),
            relative_pointer_manager: bind_optional!(zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1, 1),
        })
    }
}

/// A proxy `wl_buffer` for one of our images, keyed by the image's Vulkan
/// handle. Entries are never explicitly evicted; since our swapchains are
/// bounded (`output::DEFAULT_MAX_IMAGES`) the cache size is bounded too,
/// and a destroyed `vk::Image` handle is never reissued by the driver
/// while a stale cache entry could still reference it.
struct CachedBuffer {
    wl_buffer: wl_buffer::WlBuffer,
}

struct Window {
    surface: wl_surface::WlSurface,
    xdg_surface: xdg_surface::XdgSurface,
    toplevel: xdg_toplevel::XdgToplevel,
    syncobj_surface: Option<wp_linux_drm_syncobj_surface_v1::WpLinuxDrmSyncobjSurfaceV1>,
    acquire_timeline: Option<wp_linux_drm_syncobj_timeline_v1::WpLinuxDrmSyncobjTimelineV1>,
    release_timeline: Option<wp_linux_drm_syncobj_timeline_v1::WpLinuxDrmSyncobjTimelineV1>,
    configured: bool,
    size: (u32, u32),
}

struct ClientState {
    registry: Option<Registry>,
    pointer: Option<wl_pointer::WlPointer>,
    keyboard: Option<wl_keyboard::WlKeyboard>,
    last_pointer_pos: (f64, f64),
    input: Vec<InputEvent>,
    frame_done: Vec<OutputId>,
}

pub struct NestedWaylandBackend {
    vk: Arc<VkContext>,
    conn: Connection,
    event_queue: EventQueue<ClientState>,
    qh: QueueHandle<ClientState>,
    state: ClientState,
    bridge: SyncBridge,
    windows: slotmap::SlotMap<OutputId, Window>,
    buffers: HashMap<u64, CachedBuffer>,
}

impl NestedWaylandBackend {
    pub fn new(vk: Arc<VkContext>) -> Result<Self> {
        let conn = Connection::connect_to_env().context("connecting to parent wayland compositor")?;
        let (globals, mut event_queue) = registry_queue_init::<ClientState>(&conn).context("enumerating parent globals")?;
        let qh = event_queue.handle();

        let mut state = ClientState {
            registry: None,
            pointer: None,
            keyboard: None,
            last_pointer_pos: (0.0, 0.0),
            input: Vec::new(),
            frame_done: Vec::new(),
        };

        let registry = Registry::bind(&globals, &qh)?;
        if registry.syncobj_manager.is_none() {
            warn!("parent compositor has no wp_linux_drm_syncobj_manager_v1; falling back to implicit sync");
        }
        state.registry = Some(registry);

        // A roundtrip lets the seat's capabilities event (and anything
        // else bound above) land before we start creating windows.
        event_queue.roundtrip(&mut state).context("initial roundtrip with parent compositor")?;

        let bridge = SyncBridge::new(vk.clone())?;

        Ok(Self {
            vk,
            conn,
            event_queue,
            qh,
            state,
            bridge,
            windows: slotmap::SlotMap::with_key(),
            buffers: HashMap::new(),
        })
    }

    fn registry(&self) -> &Registry {
        self.state.registry.as_ref().expect("registry bound in new()")
    }
}

impl Backend for NestedWaylandBackend {
    fn start(&mut self, event_loop: &mut EventLoop) -> Result<()> {
        event_loop.register(self.conn.as_fd().as_raw_fd(), mio::Interest::READABLE)?;
        Ok(())
    }

    fn create_output(&mut self, request: OutputRequest) -> Result<OutputId> {
        let registry = self.registry();
        let surface = registry.compositor.create_surface(&self.qh, ());
        let xdg_surface = registry.xdg_wm_base.get_xdg_surface(&surface, &self.qh, ());
        let toplevel = xdg_surface.get_toplevel(&self.qh, ());

        toplevel.set_title("waycore".to_string());
        toplevel.set_app_id("waycore".to_string());

        if let Some(decoration_manager) = &registry.decoration_manager {
            let decoration = decoration_manager.get_toplevel_decoration(&toplevel, &self.qh, ());
            decoration.set_mode(zxdg_toplevel_decoration_v1::Mode::ServerSide);
        }

        // One persistent syncobj per direction, shared by every output:
        // the parent imports our export/import timelines' syncobjs once
        // here and addresses them by point value on every future commit.
        let (syncobj_surface, acquire_timeline, release_timeline) = match &registry.syncobj_manager {
            Some(manager) => {
                let syncobj_surface = manager.get_surface(&surface, &self.qh, ());
                let acquire_fd = self.bridge.export_syncobj_fd()?;
                let release_fd = self.bridge.import_syncobj_fd()?;
                let acquire_timeline = manager.import_timeline(acquire_fd.as_fd(), &self.qh, ());
                let release_timeline = manager.import_timeline(release_fd.as_fd(), &self.qh, ());
                (Some(syncobj_surface), Some(acquire_timeline), Some(release_timeline))
            }
            None => (None, None, None),
        };

        surface.commit();

        let id = self.windows.insert(Window {
            surface,
            xdg_surface,
            toplevel,
            syncobj_surface,
            acquire_timeline,
            release_timeline,
            configured: false,
            size: (request.width, request.height),
        });

        // Block until the first `xdg_surface.configure` so `commit` never
        // races a surface that hasn't been given a role yet.
        while !self.windows[id].configured {
            self.event_queue.blocking_dispatch(&mut self.state).context("waiting for initial configure")?;
        }

        Ok(id)
    }

    fn destroy_output(&mut self, id: OutputId) {
        if let Some(window) = self.windows.remove(id) {
            window.toplevel.destroy();
            window.xdg_surface.destroy();
            window.surface.destroy();
        }
    }

    fn commit(&mut self, id: OutputId, image: &Image, acquire: Syncpoint, release: Syncpoint, _flags: CommitFlags) -> Result<()> {
        let registry = self.registry();
        let Some(window) = self.windows.get(id) else {
            bail!("commit against unknown output");
        };

        let key = image.image.as_raw();
        if !self.buffers.contains_key(&key) {
            let params = image.export_dmabuf()?;
            let buffer_params = registry.dmabuf.create_params(&self.qh, ());
            buffer_params.add(
                params.fd.as_fd(),
                0,
                params.offset,
                params.stride,
                (u64::from(params.modifier) >> 32) as u32,
                (u64::from(params.modifier) & 0xffff_ffff) as u32,
            );

            let (width, height) = params.extent;
            let wl_buffer = buffer_params.create_immed(
                width as i32,
                height as i32,
                format::fourcc_to_wl(params.format)?,
                zwp_linux_buffer_params_v1::Flags::empty(),
                &self.qh,
                (),
            );
            buffer_params.destroy();

            self.buffers.insert(key, CachedBuffer { wl_buffer });
        }

        let wl_buffer = &self.buffers[&key].wl_buffer;

        if let (Some(syncobj_surface), Some(acquire_tl), Some(release_tl)) =
            (&window.syncobj_surface, &window.acquire_timeline, &window.release_timeline)
        {
            let acquire_fd = self.bridge.export_fence(acquire)?;
            acquire_tl.set_point(
                (acquire.value >> 32) as u32,
                (acquire.value & 0xffff_ffff) as u32,
            );
            let _ = acquire_fd; // consumed by the import below
            let release_fd = self.bridge.export_fence(release)?;
            release_tl.set_point(
                (release.value >> 32) as u32,
                (release.value & 0xffff_ffff) as u32,
            );
            let _ = release_fd;
            syncobj_surface.set_acquire_point(acquire_tl, (acquire.value >> 32) as u32, (acquire.value & 0xffff_ffff) as u32);
            syncobj_surface.set_release_point(release_tl, (release.value >> 32) as u32, (release.value & 0xffff_ffff) as u32);
        } else {
            // No explicit sync support upstream: block until the acquire
            // point is reached before handing the buffer over, and rely
            // on the parent's `wl_buffer.release`/our own release polling
            // for the return trip.
            self.vk.device.wait_semaphores(
                &ash::vk::SemaphoreWaitInfo::default()
                    .semaphores(&[acquire.semaphore])
                    .values(&[acquire.value]),
                1_000_000_000,
            )?;
        }

        window.surface.attach(Some(wl_buffer), 0, 0);
        window.surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        window.surface.frame(&self.qh, id);
        window.surface.commit();

        Ok(())
    }

    fn poll_input(&mut self) -> Vec<InputEvent> {
        if let Err(err) = self.event_queue.dispatch_pending(&mut self.state) {
            warn!(?err, "dispatching parent wayland events");
        }

        std::mem::take(&mut self.state.input)
    }

    fn poll_frame_done(&mut self) -> Vec<OutputId> {
        std::mem::take(&mut self.state.frame_done)
    }
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for ClientState {
    fn event(
        _: &mut Self,
        _: &wl_registry::WlRegistry,
        _: wl_registry::Event,
        _: &GlobalListContents,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_compositor::WlCompositor, ()> for ClientState {
    fn event(_: &mut Self, _: &wl_compositor::WlCompositor, _: wl_compositor::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {}
}

impl Dispatch<wl_surface::WlSurface, ()> for ClientState {
    fn event(_: &mut Self, _: &wl_surface::WlSurface, _: wl_surface::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {}
}

impl Dispatch<wl_surface::WlSurface, OutputId> for ClientState {
    fn event(
        _: &mut Self,
        _: &wl_surface::WlSurface,
        _: wl_surface::Event,
        _: &OutputId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        // A surface itself has no events we act on; frame completion
        // arrives as `wl_callback.done` below.
    }
}

impl Dispatch<wl_callback::WlCallback, OutputId> for ClientState {
    fn event(
        state: &mut Self,
        _callback: &wl_callback::WlCallback,
        event: wl_callback::Event,
        id: &OutputId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            state.frame_done.push(*id);
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for ClientState {
    fn event(_: &mut Self, _: &wl_buffer::WlBuffer, event: wl_buffer::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {
        if let wl_buffer::Event::Release = event {
            // Our own `SyncBridge`-driven release points are authoritative;
            // the implicit-sync fallback path already waits on acquire
            // before reuse, so this is purely informational.
            trace!("parent released a proxied wl_buffer");
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for ClientState {
    fn event(_: &mut Self, proxy: &xdg_wm_base::XdgWmBase, event: xdg_wm_base::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            proxy.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for ClientState {
    fn event(
        state: &mut Self,
        proxy: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            proxy.ack_configure(serial);
        }
        let _ = state;
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_toplevel::Event::Close = event {
            warn!("parent compositor asked us to close our nested window");
        }
    }
}

impl Dispatch<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &zxdg_decoration_manager_v1::ZxdgDecorationManagerV1,
        _: zxdg_decoration_manager_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wayland_protocols::xdg::decoration::zv1::client::zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1, ()>
    for ClientState
{
    fn event(
        _: &mut Self,
        _: &wayland_protocols::xdg::decoration::zv1::client::zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1,
        _: wayland_protocols::xdg::decoration::zv1::client::zxdg_toplevel_decoration_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        _: zwp_linux_dmabuf_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        event: zwp_linux_buffer_params_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let zwp_linux_buffer_params_v1::Event::Failed = event {
            warn!("parent compositor rejected a dma-buf backed wl_buffer");
        }
    }
}

impl Dispatch<wp_linux_drm_syncobj_manager_v1::WpLinuxDrmSyncobjManagerV1, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &wp_linux_drm_syncobj_manager_v1::WpLinuxDrmSyncobjManagerV1,
        _: wp_linux_drm_syncobj_manager_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wp_linux_drm_syncobj_surface_v1::WpLinuxDrmSyncobjSurfaceV1, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &wp_linux_drm_syncobj_surface_v1::WpLinuxDrmSyncobjSurfaceV1,
        _: wp_linux_drm_syncobj_surface_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wp_linux_drm_syncobj_timeline_v1::WpLinuxDrmSyncobjTimelineV1, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &wp_linux_drm_syncobj_timeline_v1::WpLinuxDrmSyncobjTimelineV1,
        _: wp_linux_drm_syncobj_timeline_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &zwp_pointer_constraints_v1::ZwpPointerConstraintsV1,
        _: zwp_pointer_constraints_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1, ()> for ClientState {
    fn event(
        _: &mut Self,
        _: &zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1,
        _: zwp_relative_pointer_manager_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for ClientState {
    fn event(state: &mut Self, seat: &wl_seat::WlSeat, event: wl_seat::Event, _: &(), _: &Connection, qh: &QueueHandle<Self>) {
        if let wl_seat::Event::Capabilities { capabilities: WEnum::Value(caps) } = event {
            if caps.contains(wl_seat::Capability::Pointer) && state.pointer.is_none() {
                state.pointer = Some(seat.get_pointer(qh, ()));
            }
            if caps.contains(wl_seat::Capability::Keyboard) && state.keyboard.is_none() {
                state.keyboard = Some(seat.get_keyboard(qh, ()));
            }
        }
    }
}

impl Dispatch<wl_pointer::WlPointer, ()> for ClientState {
    fn event(state: &mut Self, _: &wl_pointer::WlPointer, event: wl_pointer::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {
        match event {
            wl_pointer::Event::Motion { surface_x, surface_y, .. } => {
                let (last_x, last_y) = state.last_pointer_pos;
                state.last_pointer_pos = (surface_x, surface_y);
                state
                    .input
                    .push(InputEvent::PointerMotion { dx: surface_x - last_x, dy: surface_y - last_y });
                state.input.push(InputEvent::PointerMotionAbsolute { x: surface_x, y: surface_y });
            }
            wl_pointer::Event::Button { button, state: WEnum::Value(button_state), .. } => {
                let pressed = matches!(button_state, wl_pointer::ButtonState::Pressed);
                state.input.push(InputEvent::PointerButton {
                    code: button,
                    state: if pressed { ButtonState::Pressed } else { ButtonState::Released },
                });
            }
            wl_pointer::Event::Axis { axis: WEnum::Value(axis), value, .. } => {
                let (horizontal, vertical) = match axis {
                    wl_pointer::Axis::HorizontalScroll => (value, 0.0),
                    wl_pointer::Axis::VerticalScroll => (0.0, value),
                    _ => (0.0, 0.0),
                };
                state.input.push(InputEvent::PointerAxis { horizontal, vertical });
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, ()> for ClientState {
    fn event(state: &mut Self, _: &wl_keyboard::WlKeyboard, event: wl_keyboard::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {
        if let wl_keyboard::Event::Key { key, state: WEnum::Value(key_state), .. } = event {
            let pressed = matches!(key_state, wl_keyboard::KeyState::Pressed);
            state.input.push(InputEvent::KeyboardKey {
                scancode: key,
                state: if pressed { KeyState::Pressed } else { KeyState::Released },
            });
        }
    }
}

use std::os::fd::AsRawFd as _;

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Presentation straight to KMS/DRM, with input read from libinput and
//! device access brokered by libseat: the path a real deployment (as
//! opposed to a nested development session) actually runs. Scoped to a
//! single already-connected output, reusing whatever mode the firmware or
//! a previous compositor left active rather than negotiating a new one —
//! an initial-prototype restriction, not a permanent one (see the Open
//! Questions note in DESIGN.md).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use drm::buffer::{self, Buffer as _, PlanarBuffer};
use drm::control::{atomic, connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Device as _, Event as DrmEvent};
use drm::node::{DrmNode, NodeType};
use drm::Device as _;
use drm_fourcc::DrmFourcc;
use input::event::pointer::PointerScrollEvent as _;
use input::event::{Event as LibinputEvent, KeyboardEvent, PointerEvent};
use input::{Libinput, LibinputInterface};
use tracing::{debug, warn};

use super::{Backend, InputEvent, OutputId, OutputRequest, SyncBridge};
use crate::event_loop::EventLoop;
use crate::output::CommitFlags;
use crate::seat::{ButtonState, KeyState};
use crate::vulkan::{commands::Syncpoint, Image, VkContext};

/// The seat-opened primary node, distinct from the render node
/// `vulkan::DrmDevice` wraps: KMS modesetting and atomic commits require
/// the primary node, while Vulkan only ever touches the render node.
struct PrimaryDevice(libseat::SeatDevice);

impl AsFd for PrimaryDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for PrimaryDevice {}
impl drm::control::Device for PrimaryDevice {}

/// A GEM-handle-backed single-plane framebuffer wrapping an exported
/// image's dma-buf, imported once via `prime_fd_to_handle`. `addfb2` and
/// atomic's `FB_ID` property both want a GEM handle, not a raw fd, so
/// every commit imports the image's plane fd through this.
struct DmaFramebuffer {
    size: (u32, u32),
    format: DrmFourcc,
    pitch: u32,
    offset: u32,
    handle: buffer::Handle,
    modifier: Option<drm_fourcc::DrmModifier>,
}

impl buffer::Buffer for DmaFramebuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }
    fn format(&self) -> DrmFourcc {
        self.format
    }
    fn pitch(&self) -> u32 {
        self.pitch
    }
    fn handle(&self) -> Option<buffer::Handle> {
        Some(self.handle)
    }
}

impl PlanarBuffer for DmaFramebuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }
    fn format(&self) -> DrmFourcc {
        self.format
    }
    fn pitches(&self) -> [u32; 4] {
        [self.pitch, 0, 0, 0]
    }
    fn offsets(&self) -> [u32; 4] {
        [self.offset, 0, 0, 0]
    }
    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        [Some(self.handle), None, None, None]
    }
    fn modifier(&self) -> Option<drm_fourcc::DrmModifier> {
        self.modifier
    }
}

/// Atomic property ids resolved once at startup, by name, off whichever
/// object they live on (connector, crtc, or plane).
struct Props {
    connector_crtc_id: property::Handle,
    crtc_active: property::Handle,
    crtc_mode_id: property::Handle,
    crtc_out_fence_ptr: Option<property::Handle>,
    plane_fb_id: property::Handle,
    plane_crtc_id: property::Handle,
    plane_src: [property::Handle; 4],
    plane_crtc_xywh: [property::Handle; 4],
    plane_in_fence_fd: Option<property::Handle>,
}

/// The one output this prototype drives, plus the bookkeeping needed to
/// avoid a second atomic commit racing an outstanding page flip.
struct Output {
    connector: connector::Handle,
    crtc: crtc::Handle,
    plane: plane::Handle,
    mode: drm::control::Mode,
    pending_flip: bool,
    current_fb: Option<framebuffer::Handle>,
    retiring_fb: Option<framebuffer::Handle>,
    modeset_done: bool,
}

struct SessionInterface {
    seat: Rc<RefCell<libseat::Seat>>,
}

impl LibinputInterface for SessionInterface {
    fn open_restricted(&mut self, path: &std::path::Path, _flags: i32) -> std::result::Result<OwnedFd, i32> {
        let device = self.seat.borrow_mut().open_device(&path).map_err(|_| libc::EACCES)?;
        let fd = device.as_fd().as_raw_fd();
        // The `SeatDevice` handle closes on drop; libinput only wants the
        // raw fd, so leak it here and let `close_restricted` close the fd
        // directly rather than going back through the session.
        std::mem::forget(device);
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        drop(fd);
    }
}

pub struct DirectBackend {
    vk: std::sync::Arc<VkContext>,
    seat: Rc<RefCell<libseat::Seat>>,
    seat_events: Rc<RefCell<VecDeque<libseat::SeatEvent>>>,
    drm: PrimaryDevice,
    props: Props,
    libinput: Libinput,
    bridge: SyncBridge,
    outputs: slotmap::SlotMap<OutputId, Output>,
    pending_input: Vec<InputEvent>,
    frame_done: Vec<OutputId>,
}

/// Resolves the primary node sibling of the render node Vulkan selected,
/// so KMS and GPU rendering always target the same physical card.
fn primary_node_path(render_dev: libc::dev_t) -> Result<PathBuf> {
    let render = DrmNode::from_dev_id(render_dev).context("resolving render node")?;
    let primary = render
        .node_with_type(NodeType::Primary)
        .ok_or_else(|| anyhow!("render node has no primary sibling"))?
        .context("opening primary node sibling")?;

    primary.dev_path().ok_or_else(|| anyhow!("primary node has no device path"))
}

/// Picks the first connected connector with a usable encoder/crtc/mode,
/// reusing whatever is currently driven rather than negotiating a new
/// configuration.
fn discover_output(drm: &PrimaryDevice) -> Result<(connector::Handle, crtc::Handle, drm::control::Mode)> {
    let resources = drm.resource_handles().context("enumerating drm resources")?;

    for &conn_handle in resources.connectors() {
        let info = drm.get_connector(conn_handle, false)?;
        if info.state() != connector::State::Connected {
            continue;
        }

        for &enc_handle in info.encoders() {
            let Ok(encoder) = drm.get_encoder(enc_handle) else {
                continue;
            };
            let Some(crtc_handle) = encoder.crtc() else {
                continue;
            };
            let crtc_info = drm.get_crtc(crtc_handle)?;

            let mode = crtc_info
                .mode()
                .or_else(|| info.modes().first().copied())
                .ok_or_else(|| anyhow!("connector has no usable mode"))?;

            return Ok((conn_handle, crtc_handle, mode));
        }
    }

    Err(anyhow!("no connected output with an active encoder/crtc found"))
}

fn find_primary_plane(drm: &PrimaryDevice, crtc: crtc::Handle) -> Result<plane::Handle> {
    let resources = drm.resource_handles()?;
    let crtc_index = resources
        .crtcs()
        .iter()
        .position(|&c| c == crtc)
        .ok_or_else(|| anyhow!("crtc not in resource list"))?;

    for &plane_handle in &drm.plane_handles()? {
        let info = drm.get_plane(plane_handle)?;
        if info.possible_crtcs() & (1 << crtc_index) == 0 {
            continue;
        }

        let props = drm.get_properties(plane_handle)?;
        for (&prop_handle, &value) in props.ids().iter().zip(props.values().iter()) {
            let meta = drm.get_property(prop_handle)?;
            if meta.name().to_str().ok() == Some("type") && value == drm::control::PlaneType::Primary as u64 {
                return Ok(plane_handle);
            }
        }
    }

    Err(anyhow!("no primary plane found for crtc"))
}

fn prop_by_name(drm: &PrimaryDevice, ids: &[property::Handle], name: &str) -> Result<property::Handle> {
    for &handle in ids {
        if drm.get_property(handle)?.name().to_str().ok() == Some(name) {
            return Ok(handle);
        }
    }

    Err(anyhow!("property {name} not found"))
}

impl DirectBackend {
    pub fn new(vk: std::sync::Arc<VkContext>, _socket_name: Option<&str>) -> Result<Self> {
        let seat_events = Rc::new(RefCell::new(VecDeque::new()));
        let events_for_cb = seat_events.clone();

        let mut raw_seat =
            libseat::Seat::open(move |_seat, event| events_for_cb.borrow_mut().push_back(event)).context("opening libseat session")?;

        // Lets the initial `Enable` land before we try to open any device.
        raw_seat.dispatch(0).context("initial seat dispatch")?;

        let primary_path = primary_node_path(vk.device_info.drm_node)?;
        let seat_device = raw_seat
            .open_device(&primary_path)
            .with_context(|| format!("opening {primary_path:?} through session"))?;

        let seat = Rc::new(RefCell::new(raw_seat));
        let drm = PrimaryDevice(seat_device);

        let (connector, crtc, mode) = discover_output(&drm)?;
        let plane = find_primary_plane(&drm, crtc)?;

        let connector_props = drm.get_properties(connector)?;
        let crtc_props = drm.get_properties(crtc)?;
        let plane_props = drm.get_properties(plane)?;

        let props = Props {
            connector_crtc_id: prop_by_name(&drm, connector_props.ids(), "CRTC_ID")?,
            crtc_active: prop_by_name(&drm, crtc_props.ids(), "ACTIVE")?,
            crtc_mode_id: prop_by_name(&drm, crtc_props.ids(), "MODE_ID")?,
            crtc_out_fence_ptr: prop_by_name(&drm, crtc_props.ids(), "OUT_FENCE_PTR").ok(),
            plane_fb_id: prop_by_name(&drm, plane_props.ids(), "FB_ID")?,
            plane_crtc_id: prop_by_name(&drm, plane_props.ids(), "CRTC_ID")?,
            plane_src: [
                prop_by_name(&drm, plane_props.ids(), "SRC_X")?,
                prop_by_name(&drm, plane_props.ids(), "SRC_Y")?,
                prop_by_name(&drm, plane_props.ids(), "SRC_W")?,
                prop_by_name(&drm, plane_props.ids(), "SRC_H")?,
            ],
            plane_crtc_xywh: [
                prop_by_name(&drm, plane_props.ids(), "CRTC_X")?,
                prop_by_name(&drm, plane_props.ids(), "CRTC_Y")?,
                prop_by_name(&drm, plane_props.ids(), "CRTC_W")?,
                prop_by_name(&drm, plane_props.ids(), "CRTC_H")?,
            ],
            plane_in_fence_fd: prop_by_name(&drm, plane_props.ids(), "IN_FENCE_FD").ok(),
        };

        if props.crtc_out_fence_ptr.is_none() {
            warn!("crtc has no OUT_FENCE_PTR property; falling back to a blocking wait on release");
        }

        let seat_name = seat.borrow().name().to_string();
        let mut libinput = Libinput::new_with_udev(SessionInterface { seat: seat.clone() });
        libinput
            .udev_assign_seat(&seat_name)
            .map_err(|_| anyhow!("assigning libinput to the session's seat"))?;

        let bridge = SyncBridge::new(vk.clone())?;

        Ok(Self {
            vk,
            seat,
            seat_events,
            drm,
            props,
            libinput,
            bridge,
            outputs: slotmap::SlotMap::with_key(),
            pending_input: Vec::new(),
            frame_done: Vec::new(),
        })
    }

    fn signal(&self, point: Syncpoint) -> Result<()> {
        unsafe {
            self.vk.device.signal_semaphore(
                &ash::vk::SemaphoreSignalInfo::default()
                    .semaphore(point.semaphore)
                    .value(point.value),
            )?
        };
        Ok(())
    }

    fn drain_seat_events(&mut self) {
        while let Some(event) = self.seat_events.borrow_mut().pop_front() {
            match event {
                libseat::SeatEvent::Enable => debug!("session enabled"),
                libseat::SeatEvent::Disable => warn!("session disabled (vt switch); presentation will stall"),
            }
        }
    }

    fn drain_drm_events(&mut self) {
        let events = match self.drm.receive_events() {
            Ok(events) => events,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!(?err, "reading drm events");
                return;
            }
        };

        for event in events {
            if let DrmEvent::PageFlip(flip) = event {
                if let Some((id, output)) = self.outputs.iter_mut().find(|(_, o)| o.crtc == flip.crtc) {
                    output.pending_flip = false;
                    if let Some(stale) = output.retiring_fb.take() {
                        let _ = self.drm.destroy_framebuffer(stale);
                    }
                    self.frame_done.push(id);
                }
            }
        }
    }

    fn translate_libinput(&mut self) {
        if let Err(err) = self.libinput.dispatch() {
            warn!(?err, "dispatching libinput events");
            return;
        }

        let events: Vec<_> = self.libinput.by_ref().collect();
        let (mode_w, mode_h) = self.outputs.values().next().map(|o| o.mode.size()).unwrap_or((1, 1));

        for event in events {
            match event {
                LibinputEvent::Pointer(PointerEvent::Motion(motion)) => {
                    self.pending_input.push(InputEvent::PointerMotion { dx: motion.dx(), dy: motion.dy() });
                }
                LibinputEvent::Pointer(PointerEvent::MotionAbsolute(motion)) => {
                    self.pending_input.push(InputEvent::PointerMotionAbsolute {
                        x: motion.absolute_x_transformed(mode_w as u32),
                        y: motion.absolute_y_transformed(mode_h as u32),
                    });
                }
                LibinputEvent::Pointer(PointerEvent::Button(button)) => {
                    let state = match button.button_state() {
                        input::event::pointer::ButtonState::Pressed => ButtonState::Pressed,
                        input::event::pointer::ButtonState::Released => ButtonState::Released,
                    };
                    self.pending_input.push(InputEvent::PointerButton { code: button.button(), state });
                }
                LibinputEvent::Pointer(PointerEvent::ScrollWheel(axis)) => {
                    use input::event::pointer::Axis;
                    let horizontal = if axis.has_axis(Axis::Horizontal) { axis.scroll_value(Axis::Horizontal) } else { 0.0 };
                    let vertical = if axis.has_axis(Axis::Vertical) { axis.scroll_value(Axis::Vertical) } else { 0.0 };
                    self.pending_input.push(InputEvent::PointerAxis { horizontal, vertical });
                }
                LibinputEvent::Keyboard(KeyboardEvent::Key(key)) => {
                    let state = match key.key_state() {
                        input::event::keyboard::KeyState::Pressed => KeyState::Pressed,
                        input::event::keyboard::KeyState::Released => KeyState::Released,
                    };
                    self.pending_input.push(InputEvent::KeyboardKey { scancode: key.key(), state });
                }
                _ => {}
            }
        }
    }
}

impl Backend for DirectBackend {
    fn start(&mut self, event_loop: &mut EventLoop) -> Result<()> {
        event_loop.register(self.drm.as_fd().as_raw_fd(), mio::Interest::READABLE)?;
        event_loop.register(self.libinput.as_raw_fd(), mio::Interest::READABLE)?;

        if let Some(fd) = self.seat.borrow_mut().get_fd() {
            event_loop.register(fd, mio::Interest::READABLE)?;
        }

        Ok(())
    }

    fn create_output(&mut self, request: OutputRequest) -> Result<OutputId> {
        if !self.outputs.is_empty() {
            bail!("direct backend supports exactly one output in this prototype");
        }

        let (connector, crtc, mode) = discover_output(&self.drm)?;
        let plane = find_primary_plane(&self.drm, crtc)?;

        let (mw, mh) = mode.size();
        if (mw as u32, mh as u32) != (request.width, request.height) {
            debug!(
                requested = ?(request.width, request.height),
                active = ?(mw, mh),
                "ignoring requested output size; direct backend reuses the active KMS mode"
            );
        }

        Ok(self.outputs.insert(Output {
            connector,
            crtc,
            plane,
            mode,
            pending_flip: false,
            current_fb: None,
            retiring_fb: None,
            modeset_done: false,
        }))
    }

    fn destroy_output(&mut self, id: OutputId) {
        let Some(output) = self.outputs.remove(id) else {
            return;
        };

        let mut req = atomic::AtomicModeReq::new();
        req.add_property(output.plane, self.props.plane_fb_id, property::Value::Framebuffer(None));
        req.add_property(output.crtc, self.props.crtc_active, property::Value::Boolean(false));

        if let Err(err) = self.drm.atomic_commit(AtomicCommitFlags::ALLOW_MODESET, req) {
            warn!(?err, "disabling crtc on output teardown");
        }

        if let Some(fb) = output.current_fb {
            let _ = self.drm.destroy_framebuffer(fb);
        }
        if let Some(fb) = output.retiring_fb {
            let _ = self.drm.destroy_framebuffer(fb);
        }
    }

    fn commit(&mut self, id: OutputId, image: &Image, acquire: Syncpoint, release: Syncpoint, _flags: CommitFlags) -> Result<()> {
        let params = image.export_dmabuf()?;
        let gem_handle = self.drm.prime_fd_to_handle(params.fd.as_fd()).context("importing image dma-buf as a gem handle")?;

        let fb = DmaFramebuffer {
            size: params.extent,
            format: crate::vulkan::format::vk_to_fourcc(params.format).ok_or_else(|| anyhow!("unsupported format for kms framebuffer"))?,
            pitch: params.stride,
            offset: params.offset,
            handle: gem_handle,
            modifier: Some(params.modifier),
        };

        let fb_handle = self
            .drm
            .add_planar_framebuffer(&fb, drm::control::FbCmd2Flags::MODIFIERS)
            .context("creating kms framebuffer for committed image")?;

        let output = self.outputs.get_mut(id).ok_or_else(|| anyhow!("commit against unknown output"))?;
        if output.pending_flip {
            let _ = self.drm.destroy_framebuffer(fb_handle);
            bail!("commit issued while a page flip is still outstanding");
        }

        let in_fence = self.bridge.export_fence(acquire)?;

        let mut req = atomic::AtomicModeReq::new();

        if !output.modeset_done {
            let mode_blob = self.drm.create_property_blob(&output.mode).context("creating mode blob")?;
            req.add_property(output.connector, self.props.connector_crtc_id, property::Value::CRTC(Some(output.crtc)));
            req.add_property(output.crtc, self.props.crtc_active, property::Value::Boolean(true));
            req.add_property(output.crtc, self.props.crtc_mode_id, mode_blob);
        }

        let (mode_w, mode_h) = output.mode.size();
        req.add_property(output.plane, self.props.plane_fb_id, property::Value::Framebuffer(Some(fb_handle)));
        req.add_property(output.plane, self.props.plane_crtc_id, property::Value::CRTC(Some(output.crtc)));
        req.add_property(output.plane, self.props.plane_src[0], property::Value::UnsignedRange(0));
        req.add_property(output.plane, self.props.plane_src[1], property::Value::UnsignedRange(0));
        req.add_property(output.plane, self.props.plane_src[2], property::Value::UnsignedRange((params.extent.0 as u64) << 16));
        req.add_property(output.plane, self.props.plane_src[3], property::Value::UnsignedRange((params.extent.1 as u64) << 16));
        req.add_property(output.plane, self.props.plane_crtc_xywh[0], property::Value::SignedRange(0));
        req.add_property(output.plane, self.props.plane_crtc_xywh[1], property::Value::SignedRange(0));
        req.add_property(output.plane, self.props.plane_crtc_xywh[2], property::Value::UnsignedRange(mode_w as u64));
        req.add_property(output.plane, self.props.plane_crtc_xywh[3], property::Value::UnsignedRange(mode_h as u64));

        let use_explicit_sync = self.props.plane_in_fence_fd.is_some();
        if let Some(in_fence_prop) = self.props.plane_in_fence_fd {
            req.add_property(output.plane, in_fence_prop, property::Value::UnsignedRange(in_fence.as_raw_fd() as u64));
        } else {
            self.vk.device.wait_semaphores(
                &ash::vk::SemaphoreWaitInfo::default()
                    .semaphores(&[acquire.semaphore])
                    .values(&[acquire.value]),
                1_000_000_000,
            )?;
        }

        // Only meaningful when `plane_in_fence_fd` above told the kernel
        // to wait on our acquire point before scanning out; kept alive
        // until the ioctl returns, whether or not OUT_FENCE_PTR is used.
        let _ = use_explicit_sync;

        let out_fence_slot: Box<i32> = Box::new(-1);
        let use_out_fence = if let Some(prop) = self.props.crtc_out_fence_ptr {
            let addr = &*out_fence_slot as *const i32 as u64;
            req.add_property(output.crtc, prop, property::Value::UnsignedRange(addr));
            true
        } else {
            false
        };

        let mut flags = AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT;
        if !output.modeset_done {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }

        self.drm.atomic_commit(flags, req).context("submitting atomic kms commit")?;
        drop(in_fence);

        output.modeset_done = true;
        output.pending_flip = true;
        output.retiring_fb = output.current_fb.replace(fb_handle);

        if use_out_fence {
            let fd = *out_fence_slot;
            if fd >= 0 {
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                self.bridge.import_fence(owned, release)?;
            } else {
                warn!("kernel did not populate out-fence; release will lag a frame");
                self.signal(release)?;
            }
        } else {
            self.signal(release)?;
        }

        Ok(())
    }

    fn poll_input(&mut self) -> Vec<InputEvent> {
        self.drain_seat_events();
        self.drain_drm_events();
        self.translate_libinput();
        std::mem::take(&mut self.pending_input)
    }

    fn poll_frame_done(&mut self) -> Vec<OutputId> {
        std::mem::take(&mut self.frame_done)
    }
}

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::os::fd::AsRawFd as _;

use tracing::error;
use wayland_server::{
    protocol::{wl_buffer, wl_shm, wl_shm_pool},
    Resource as _,
};

use crate::buffer::{validate_shm_params, Buffer, BufferKey, ShmBufferParams, ShmPool, ShmPoolKey};
use crate::state::State;

impl wayland_server::GlobalDispatch<wl_shm::WlShm, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_shm::WlShm>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let wl_shm = data_init.init(resource, ());
        wl_shm.format(wl_shm::Format::Argb8888);
        wl_shm.format(wl_shm::Format::Xrgb8888);
    }
}

impl wayland_server::Dispatch<wl_shm::WlShm, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        wl_shm: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_shm::Request::CreatePool { id, fd, size } => {
                if size <= 0 {
                    wl_shm.post_error(wl_shm::Error::InvalidFd, "pool size must be positive");
                    return;
                }

                let fd_debug = fd.as_raw_fd();
                let res = state.shm_pools.try_insert_with_key(|k| {
                    let wl_shm_pool = data_init.init(id, k);
                    ShmPool::new(fd, size as usize, wl_shm_pool)
                });

                if let Err(err) = res {
                    error!(?err, fd = fd_debug, size, "failed to map client shm pool");
                    wl_shm.post_error(wl_shm::Error::InvalidFd, "mmap failed");
                }
            }
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_shm_pool::WlShmPool, ShmPoolKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        data: &ShmPoolKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let format = match format.into_result() {
                    Ok(wl_shm::Format::Argb8888) => drm_fourcc::DrmFourcc::Argb8888,
                    Ok(wl_shm::Format::Xrgb8888) => drm_fourcc::DrmFourcc::Xrgb8888,
                    _ => {
                        resource.post_error(wl_shm::Error::InvalidFormat, "unsupported shm format");
                        return;
                    }
                };

                const BPP: usize = 4;
                let pool = state.shm_pools.get(*data).expect("pool has no entry");
                let pool_size = pool.mapping().read().unwrap().size();

                if let Err(code) = validate_shm_params(offset, width, height, stride, BPP, pool_size) {
                    resource.post_error(code, "invalid buffer parameters");
                    return;
                }

                let params = ShmBufferParams {
                    format,
                    bpp: BPP,
                    width: width as u32,
                    height: height as u32,
                    stride: stride as u32,
                    offset: offset as u32,
                };

                let mapping = pool.mapping();
                state.buffers.insert_with_key(|k| {
                    let wl_buffer = data_init.init(id, k);
                    Buffer::new_shm(wl_buffer, params, mapping)
                });
            }
            wl_shm_pool::Request::Resize { size } => {
                if size <= 0 {
                    resource.post_error(wl_shm::Error::InvalidFd, "invalid resize");
                    return;
                }

                let pool = state.shm_pools.get(*data).expect("pool has no entry");
                if let Err(err) = pool.resize(size as usize) {
                    error!(?err, "failed to resize shm pool");
                    resource.post_error(wl_shm::Error::InvalidFd, "mmap failed");
                }
            }
            wl_shm_pool::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_shm_pool::WlShmPool,
        data: &ShmPoolKey,
    ) {
        // Buffers hold their own `Arc` clone of the mapping, so they
        // outlive the pool object itself.
        state.shm_pools.remove(*data);
    }
}

impl wayland_server::Dispatch<wl_buffer::WlBuffer, BufferKey> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        _data: &BufferKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_buffer::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_buffer::WlBuffer,
        data: &BufferKey,
    ) {
        // A buffer can't be removed from the slotmap until every lock
        // guard on it has dropped; `poll_buffer_releases` reaps it once
        // `needs_destruction` is set and it comes due for release.
        match state.buffers.get(*data) {
            Some(buffer) if buffer.is_released() => {
                state.buffers.remove(*data);
            }
            Some(buffer) => buffer.mark_for_destruction(),
            None => (),
        }
    }
}

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod backend;
mod buffer;
mod client;
mod config;
mod event_loop;
mod output;
mod protocol;
mod renderer;
mod scene;
mod sealed;
mod seat;
mod serial;
mod server;
mod shell;
mod state;
mod surface;
mod vulkan;
mod waking_sender;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

use config::{Cli, Config};

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging()?;

    debug!(version = env!("CARGO_PKG_VERSION"), "starting up");

    let cfg = Config::load(&args).context("loading configuration")?;
    preflight_checks()?;

    let server = server::Server::new(cfg).context("starting server")?;

    let stop_handle = server.stop_handle();
    ctrlc::set_handler(move || {
        debug!("received interrupt signal");
        stop_handle.stop();
    })
    .context("installing signal handler")?;

    info!("waycore running");
    server.run().context("server exited")?;

    Ok(())
}

fn init_logging() -> Result<()> {
    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive("waycore=info".parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry().with(printed_log).init();

    Ok(())
}

/// Refuses to start against a kernel too old to carry the dma-buf/syncobj
/// ioctls the GPU/sync layer depends on.
fn preflight_checks() -> Result<()> {
    match linux_version() {
        Some((major, _)) if major < 5 => {
            bail!("kernel version {major}.x is too low; 5.x or later required");
        }
        None => warn!("unable to determine linux kernel version"),
        _ => (),
    }

    Ok(())
}

fn linux_version() -> Option<(u32, u32)> {
    let uname = rustix::system::uname();
    let version = uname.release().to_str().ok()?;

    let version = version.split_whitespace().next()?;
    let mut parts = version.splitn(3, '.');
    let major = parts.next()?;
    let minor = parts.next()?;

    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[test]
fn test_linux_version() {
    let Some((major, _minor)) = linux_version() else {
        panic!("failed to determine linux version");
    };

    assert!(major >= 4);
}

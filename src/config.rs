// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Startup configuration: a small TOML file merged with CLI overrides.
//! There's no running compositor to degrade gracefully from if this
//! fails, so parsing errors are fatal and `anyhow::Context`-annotated all
//! the way out to `main`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version, about = "A Wayland compositor core.")]
pub struct Cli {
    /// Path to a TOML config file. Defaults to
    /// `$XDG_CONFIG_HOME/waycore/config.toml` if that file exists.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides the name of the Wayland socket to listen on.
    #[arg(long)]
    pub socket: Option<String>,

    /// Overrides which backend to run against.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Forces GPU validation layers on regardless of config.
    #[arg(long)]
    pub validation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Runs as a client surface inside a parent Wayland compositor.
    Wayland,
    /// Drives KMS/DRM directly, via libseat/libinput/udev.
    Direct,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct FileGpuConfig {
    validation: Option<bool>,
    device: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuConfig {
    /// Enables `VK_LAYER_KHRONOS_validation` and debug-utils callbacks.
    pub validation: bool,
    /// An optional substring match against `VkPhysicalDeviceProperties::deviceName`.
    pub preferred_device: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct FileOutputConfig {
    width: Option<u32>,
    height: Option<u32>,
    refresh_mhz: Option<u32>,
}

/// Initial output extent/refresh hints, consumed by the direct backend
/// when no connector is already driving a mode, and by the nested
/// backend as the starting window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub width: u32,
    pub height: u32,
    pub refresh_mhz: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh_mhz: 60_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct FileConfig {
    socket_name: Option<String>,
    backend: Option<BackendKind>,
    gpu: FileGpuConfig,
    output: FileOutputConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub socket_name: Option<String>,
    pub backend: BackendKind,
    pub gpu: GpuConfig,
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_name: None,
            backend: BackendKind::Wayland,
            gpu: GpuConfig {
                validation: false,
                preferred_device: None,
            },
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Resolves `$XDG_CONFIG_HOME/waycore/config.toml` (falling back to
    /// `$HOME/.config`), returning `None` if nothing exists there.
    fn default_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;

        let path = base.join("waycore").join("config.toml");
        path.exists().then_some(path)
    }

    /// Loads config from `cli.config` (or the default path, or built-in
    /// defaults if neither exists), then applies the rest of `cli` as
    /// overrides. CLI flags win over file config, which wins over
    /// built-in defaults.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let path = cli.config.clone().or_else(Self::default_path);

        let file_cfg = match &path {
            Some(path) => Self::read_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => FileConfig::default(),
        };

        let mut cfg = Config {
            socket_name: file_cfg.socket_name,
            backend: file_cfg.backend.unwrap_or(BackendKind::Wayland),
            gpu: GpuConfig {
                validation: file_cfg.gpu.validation.unwrap_or(false),
                preferred_device: file_cfg.gpu.device.clone(),
            },
            output: OutputConfig {
                width: file_cfg.output.width.unwrap_or(1920),
                height: file_cfg.output.height.unwrap_or(1080),
                refresh_mhz: file_cfg.output.refresh_mhz.unwrap_or(60_000),
            },
        };

        if let Some(socket) = &cli.socket {
            cfg.socket_name = Some(socket.clone());
        }
        if let Some(backend) = cli.backend {
            cfg.backend = backend;
        }
        if cli.validation {
            cfg.gpu.validation = true;
        }

        Ok(cfg)
    }

    fn read_file(path: &Path) -> anyhow::Result<FileConfig> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).context("parsing config file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_validation_flag_overrides_file_default() {
        let cli = Cli {
            config: None,
            socket: None,
            backend: None,
            validation: true,
        };

        let mut cfg = Config::default();
        if cli.validation {
            cfg.gpu.validation = true;
        }
        assert!(cfg.gpu.validation);
    }

    #[test]
    fn file_config_parses_partial_output_block() {
        let file_cfg: FileConfig = toml::from_str("[output]\nwidth = 2560\n").unwrap();
        assert_eq!(file_cfg.output.width, Some(2560));
        assert_eq!(file_cfg.output.height, None);
    }

    #[test]
    fn default_output_config_is_1080p60() {
        let output = OutputConfig::default();
        assert_eq!(output.width, 1920);
        assert_eq!(output.height, 1080);
        assert_eq!(output.refresh_mhz, 60_000);
    }

    #[test]
    fn cli_backend_override_wins_over_file() {
        let cli = Cli {
            config: None,
            socket: None,
            backend: Some(BackendKind::Direct),
            validation: false,
        };

        let mut cfg = Config {
            backend: BackendKind::Wayland,
            ..Config::default()
        };
        if let Some(backend) = cli.backend {
            cfg.backend = backend;
        }
        assert_eq!(cfg.backend, BackendKind::Direct);
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Explicit runtime configuration handed to the pipeline entry point.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::determinism::DeterminismConfig;

/// Errors raised while parsing or validating runtime configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("failed to parse runtime config: {0}")]
    Parse(String),
    #[error("invalid runtime config: {0}")]
    Invalid(String),
}

/// Which device the caller would like computations to run on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use an accelerator when one is compiled in, otherwise the CPU.
    #[default]
    Auto,
    Cpu,
    /// Ask for an accelerator; falls back to the CPU with a warning.
    Accelerator,
}

/// Device selected once at process start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Accelerator { name: String },
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator { name } => write!(f, "accelerator:{name}"),
        }
    }
}

/// Accelerator backends linked into this build. The SAR pipeline ships none.
fn available_accelerator() -> Option<Device> {
    None
}

/// Process-wide knobs, built once and passed down explicitly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device: DevicePreference,
    /// Sample-fetch worker threads. `0` lets rayon pick one per core.
    pub workers: usize,
    pub determinism: DeterminismConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(config: &str) -> Result<Self, ConfigError> {
        let parsed: RuntimeConfig =
            toml::from_str(config).map_err(|err| ConfigError::Parse(err.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers > 1024 {
            return Err(ConfigError::Invalid(format!(
                "workers must be <= 1024, got {}",
                self.workers
            )));
        }
        Ok(())
    }

    /// Resolves the device preference, falling back to the CPU transparently.
    pub fn resolve_device(&self) -> Device {
        match self.device {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Auto => available_accelerator().unwrap_or(Device::Cpu),
            DevicePreference::Accelerator => match available_accelerator() {
                Some(device) => device,
                None => {
                    ::tracing::warn!("no accelerator backend available; falling back to cpu");
                    Device::Cpu
                }
            },
        }
    }
}

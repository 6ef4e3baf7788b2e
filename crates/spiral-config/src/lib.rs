// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-level configuration for the SAR self-supervised pipeline.
//!
//! Nothing in this crate mutates process-wide state on its own. Callers build a
//! [`RuntimeConfig`] once at start-up (from TOML, the environment, or by hand)
//! and pass it down to the pipeline entry point.

pub mod determinism;
pub mod runtime;
pub mod tracing;

pub use determinism::DeterminismConfig;
pub use runtime::{ConfigError, Device, DevicePreference, RuntimeConfig};
pub use self::tracing::{init_tracing, init_tracing_with, InitError, TracingOptions};

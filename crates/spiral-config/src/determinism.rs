// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::{rngs::StdRng, SeedableRng};
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const DEFAULT_SEED: u64 = 42;

/// Seeding policy threaded through samplers, shufflers and weight initialisers.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeterminismConfig {
    /// When enabled, every unlabelled RNG is derived from `base_seed`.
    pub enabled: bool,
    /// Base seed used to derive per-component seeds.
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: DEFAULT_SEED,
        }
    }
}

impl DeterminismConfig {
    /// Fully deterministic configuration rooted at `base_seed`.
    pub fn seeded(base_seed: u64) -> Self {
        Self {
            enabled: true,
            base_seed,
        }
    }

    /// Reads `SPIRAL_DETERMINISTIC` and `SPIRAL_DETERMINISTIC_SEED`.
    pub fn from_env() -> Self {
        let enabled = std::env::var("SPIRAL_DETERMINISTIC")
            .ok()
            .map(|v| !matches!(v.as_str(), "0" | "false" | "False" | "off" | "OFF"))
            .unwrap_or(false);

        let base_seed = std::env::var("SPIRAL_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SEED);

        Self { enabled, base_seed }
    }

    /// Derives a deterministic seed for a given component label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }

    /// RNG derived from `label`. Falls back to OS entropy when disabled.
    pub fn rng_for(&self, label: &str) -> StdRng {
        if self.enabled {
            StdRng::seed_from_u64(self.seed_for(label))
        } else {
            StdRng::from_entropy()
        }
    }

    /// An explicit seed always wins; otherwise defer to [`Self::rng_for`].
    pub fn rng_from_optional(&self, seed: Option<u64>, label: &str) -> StdRng {
        match seed {
            Some(value) => StdRng::seed_from_u64(value),
            None => self.rng_for(label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
    use std::sync::{Mutex, OnceLock};

    fn with_env(vars: &[(&str, Option<&str>)], test: impl FnOnce()) {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        let _lock = GUARD
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let snapshot: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(val) => std::env::set_var(key, val),
                    None => std::env::remove_var(key),
                }
                ((*key).to_string(), previous)
            })
            .collect();

        let result = catch_unwind(AssertUnwindSafe(test));

        for (key, value) in snapshot {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }

        if let Err(err) = result {
            resume_unwind(err);
        }
    }

    #[test]
    fn defaults_disable_determinism() {
        with_env(
            &[
                ("SPIRAL_DETERMINISTIC", None),
                ("SPIRAL_DETERMINISTIC_SEED", None),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert!(!cfg.enabled);
                assert_eq!(cfg.base_seed, 42);
            },
        );
    }

    #[test]
    fn explicit_values_override_defaults() {
        with_env(
            &[
                ("SPIRAL_DETERMINISTIC", Some("1")),
                ("SPIRAL_DETERMINISTIC_SEED", Some("1337")),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert!(cfg.enabled);
                assert_eq!(cfg.base_seed, 1337);
            },
        );
    }

    #[test]
    fn textual_false_values_disable_flags() {
        with_env(&[("SPIRAL_DETERMINISTIC", Some("off"))], || {
            let cfg = DeterminismConfig::from_env();
            assert!(!cfg.enabled);
        });
    }

    #[test]
    fn derived_seeds_are_stable_per_label() {
        let cfg = DeterminismConfig::seeded(99);
        assert_eq!(cfg.seed_for("alpha"), cfg.seed_for("alpha"));
        assert_ne!(cfg.seed_for("alpha"), cfg.seed_for("beta"));
    }

    #[test]
    fn seeded_rngs_replay_the_same_stream() {
        let cfg = DeterminismConfig::seeded(7);
        let mut first = cfg.rng_for("loader");
        let mut second = cfg.rng_for("loader");
        for _ in 0..4 {
            assert_eq!(first.gen::<u32>(), second.gen::<u32>());
        }

        let explicit = cfg.rng_from_optional(Some(3), "loader").gen::<u64>();
        assert_eq!(explicit, StdRng::seed_from_u64(3).gen::<u64>());
    }
}

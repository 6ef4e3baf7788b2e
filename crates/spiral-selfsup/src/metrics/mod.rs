//! Telemetry descriptors emitted by contrastive training and extraction.
//!
//! A process-wide registry of well-known descriptors plus small payload types
//! that turn an epoch or a batch into gauge values. [`publish`] emits values
//! as `tracing` events on [`METRICS_TARGET`], so any subscriber can collect
//! them.

use crate::contrastive::NtXentResult;
use once_cell::sync::Lazy;
use std::sync::RwLock;
use tracing::{debug, info};

/// `tracing` target carrying published metric values.
pub const METRICS_TARGET: &str = "selfsup::metrics";

/// Units associated with a metric descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Dimensionless scalar value (losses, ratios, etc.).
    Scalar,
    /// Raw count of occurrences, batches, or steps.
    Count,
}

impl MetricUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricUnit::Scalar => "scalar",
            MetricUnit::Count => "count",
        }
    }
}

/// Descriptor describing a metric that can be emitted by self-supervised code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDescriptor {
    /// Canonical metric name registered with the telemetry layer.
    pub name: &'static str,
    /// Unit associated with the metric value.
    pub unit: MetricUnit,
    /// Human readable description for dashboards and registries.
    pub description: &'static str,
}

/// Gauge value paired with a descriptor name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricValue {
    /// Name matching a registered descriptor.
    pub name: &'static str,
    /// Recorded value.
    pub value: f32,
    /// Unit associated with the reading.
    pub unit: MetricUnit,
}

static REGISTRY: Lazy<RwLock<Vec<MetricDescriptor>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Registers a collection of metric descriptors, ignoring duplicates.
pub fn register_descriptors(descriptors: &[MetricDescriptor]) {
    let mut registry = REGISTRY
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for descriptor in descriptors {
        if registry
            .iter()
            .all(|existing| existing.name != descriptor.name)
        {
            registry.push(*descriptor);
        }
    }
}

/// Returns the list of descriptors that were registered so far.
pub fn descriptors() -> Vec<MetricDescriptor> {
    REGISTRY
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Emits every value whose name has a registered descriptor. Values without
/// one are dropped.
pub fn publish(values: &[MetricValue]) {
    let registry = REGISTRY
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for value in values {
        match registry.iter().find(|descriptor| descriptor.name == value.name) {
            Some(descriptor) => info!(
                target: METRICS_TARGET,
                metric = descriptor.name,
                value = f64::from(value.value),
                unit = descriptor.unit.as_str()
            ),
            None => debug!(metric = value.name, "no descriptor registered; value dropped"),
        }
    }
}

/// Canonical descriptors exposed by the NT-Xent objective.
pub const NT_XENT_DESCRIPTORS: &[MetricDescriptor] = &[
    MetricDescriptor {
        name: "selfsup.nt_xent.loss",
        unit: MetricUnit::Scalar,
        description: "Mean NT-Xent loss observed during the epoch.",
    },
    MetricDescriptor {
        name: "selfsup.nt_xent.batches",
        unit: MetricUnit::Count,
        description: "Total number of batches processed in the epoch.",
    },
    MetricDescriptor {
        name: "selfsup.nt_xent.top1",
        unit: MetricUnit::Scalar,
        description: "Fraction of rows whose positive logit is the row maximum.",
    },
];

/// Descriptors exposed by embedding extraction.
pub const EMBED_DESCRIPTORS: &[MetricDescriptor] = &[MetricDescriptor {
    name: "selfsup.embed.rows",
    unit: MetricUnit::Count,
    description: "Embedding rows produced by an extraction run.",
}];

/// Convenience wrapper that registers the built-in NT-Xent descriptors.
pub fn register_nt_xent_descriptors() {
    register_descriptors(NT_XENT_DESCRIPTORS);
}

pub fn register_embed_descriptors() {
    register_descriptors(EMBED_DESCRIPTORS);
}

/// Row count of one extraction run.
pub fn embed_rows(rows: usize) -> MetricValue {
    MetricValue {
        name: "selfsup.embed.rows",
        value: rows as f32,
        unit: MetricUnit::Count,
    }
}

/// Metric payload summarising an NT-Xent epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtXentEpochMetrics {
    /// Mean NT-Xent loss recorded for the epoch.
    pub mean_loss: f32,
    /// Total number of batches seen in the epoch.
    pub batches: usize,
    /// Mean top-1 accuracy of the positive column.
    pub top1_accuracy: f32,
}

impl NtXentEpochMetrics {
    /// Builds gauge values suitable for publishing to the telemetry layer.
    pub fn to_values(self) -> [MetricValue; 3] {
        [
            MetricValue {
                name: "selfsup.nt_xent.loss",
                value: self.mean_loss,
                unit: MetricUnit::Scalar,
            },
            MetricValue {
                name: "selfsup.nt_xent.batches",
                value: self.batches as f32,
                unit: MetricUnit::Count,
            },
            MetricValue {
                name: "selfsup.nt_xent.top1",
                value: self.top1_accuracy,
                unit: MetricUnit::Scalar,
            },
        ]
    }
}

/// Per-batch diagnostics derived from the logits of one NT-Xent evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtXentSummary {
    pub loss: f32,
    /// Rows whose positive logit is strictly larger than every other column.
    pub top1_accuracy: f32,
    /// Mean gap between the positive logit and the largest other logit.
    pub mean_positive_margin: f32,
}

impl NtXentSummary {
    pub fn from_result(result: &NtXentResult) -> Self {
        let rows = result.logits.nrows();
        if rows == 0 || result.logits.ncols() < 2 {
            return Self {
                loss: result.loss,
                top1_accuracy: 0.0,
                mean_positive_margin: 0.0,
            };
        }

        let mut correct = 0usize;
        let mut margin_sum = 0.0f32;
        for row in result.logits.outer_iter() {
            let positive = row[0];
            let best_other = row
                .iter()
                .skip(1)
                .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            if positive > best_other {
                correct += 1;
            }
            margin_sum += positive - best_other;
        }
        Self {
            loss: result.loss,
            top1_accuracy: correct as f32 / rows as f32,
            mean_positive_margin: margin_sum / rows as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CapturedEvents;
    use ndarray::Array2;

    #[test]
    fn registering_descriptors_is_idempotent() {
        register_nt_xent_descriptors();
        register_nt_xent_descriptors();
        register_embed_descriptors();
        let registered = descriptors();
        assert_eq!(
            registered.len(),
            NT_XENT_DESCRIPTORS.len() + EMBED_DESCRIPTORS.len()
        );
        assert!(registered
            .iter()
            .any(|descriptor| descriptor.name == "selfsup.nt_xent.loss"));
    }

    #[test]
    fn epoch_metrics_convert_to_values() {
        let metrics = NtXentEpochMetrics {
            mean_loss: 0.42,
            batches: 17,
            top1_accuracy: 0.5,
        };
        let values = metrics.to_values();
        assert_eq!(values[0].name, "selfsup.nt_xent.loss");
        assert_eq!(values[0].value, 0.42);
        assert_eq!(values[0].unit, MetricUnit::Scalar);
        assert_eq!(values[1].name, "selfsup.nt_xent.batches");
        assert_eq!(values[1].value, 17.0);
        assert_eq!(values[1].unit, MetricUnit::Count);
        assert_eq!(values[2].value, 0.5);
    }

    #[test]
    fn summary_counts_rows_won_by_the_positive() {
        let logits = Array2::from_shape_vec((2, 3), vec![2.0, 1.0, 0.5, 0.0, 1.0, -1.0]).unwrap();
        let result = NtXentResult {
            loss: 1.0,
            logits,
            labels: vec![0, 0],
            batch: 1,
        };
        let summary = NtXentSummary::from_result(&result);
        assert_eq!(summary.top1_accuracy, 0.5);
        assert_eq!(summary.mean_positive_margin, 0.0);
    }

    #[test]
    fn publish_emits_registered_values_only() {
        register_nt_xent_descriptors();
        let metrics = NtXentEpochMetrics {
            mean_loss: 1.25,
            batches: 3,
            top1_accuracy: 0.75,
        };
        let unregistered = MetricValue {
            name: "selfsup.unknown",
            value: 1.0,
            unit: MetricUnit::Scalar,
        };
        let captured = CapturedEvents::record(|| {
            publish(&metrics.to_values());
            publish(&[unregistered]);
        });
        assert_eq!(
            captured.metric_names(),
            vec![
                "selfsup.nt_xent.loss",
                "selfsup.nt_xent.batches",
                "selfsup.nt_xent.top1"
            ]
        );
    }
}

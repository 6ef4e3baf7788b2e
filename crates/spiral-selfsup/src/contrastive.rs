//! NT-Xent (normalised temperature-scaled cross entropy) over paired views.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use serde::Deserialize;

use crate::{Result, SelfSupError};

/// Hyperparameters of the NT-Xent objective.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct NtXentConfig {
    pub temperature: f32,
    /// Drop the partner column from the negatives. With the default `false`
    /// every row keeps its positive twice (once as label, once among the
    /// negatives), which bounds the loss below by `ln 2`.
    pub mask_partner: bool,
}

impl Default for NtXentConfig {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            mask_partner: false,
        }
    }
}

impl NtXentConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(SelfSupError::InvalidArgument(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Result container for the NT-Xent objective.
#[derive(Debug, Clone, PartialEq)]
pub struct NtXentResult {
    pub loss: f32,
    /// `[2N, C]` logits; column 0 holds the positive.
    pub logits: Array2<f32>,
    /// Target column per row (always 0).
    pub labels: Vec<usize>,
    pub batch: usize,
}

/// Gradients of the mean loss with respect to both views.
#[derive(Debug, Clone, PartialEq)]
pub struct NtXentGradients {
    pub z_i: Array2<f32>,
    pub z_j: Array2<f32>,
}

fn validate_batches(z_i: &ArrayView2<'_, f32>, z_j: &ArrayView2<'_, f32>) -> Result<(usize, usize)> {
    let (batch, feature_dim) = z_i.dim();
    let (other_batch, other_dim) = z_j.dim();
    if batch == 0 || other_batch == 0 {
        return Err(SelfSupError::InvalidArgument(
            "contrastive batches must be non-empty".to_string(),
        ));
    }
    if batch != other_batch {
        return Err(SelfSupError::Shape(format!(
            "batch mismatch (z_i={batch}, z_j={other_batch})"
        )));
    }
    if feature_dim == 0 {
        return Err(SelfSupError::InvalidArgument(
            "feature dimension must be > 0".to_string(),
        ));
    }
    if feature_dim != other_dim {
        return Err(SelfSupError::Shape(format!(
            "feature mismatch (z_i={feature_dim}, z_j={other_dim})"
        )));
    }
    if let Some(value) = z_i.iter().chain(z_j.iter()).find(|v| !v.is_finite()) {
        return Err(SelfSupError::InvalidArgument(format!(
            "projections must be finite, found {value}"
        )));
    }
    Ok((batch, feature_dim))
}

/// NT-Xent with the default layout (partner kept among the negatives).
pub fn nt_xent_loss(
    z_i: ArrayView2<'_, f32>,
    z_j: ArrayView2<'_, f32>,
    temperature: f32,
) -> Result<NtXentResult> {
    let config = NtXentConfig {
        temperature,
        ..NtXentConfig::default()
    };
    nt_xent_loss_with(z_i, z_j, &config)
}

pub fn nt_xent_loss_with(
    z_i: ArrayView2<'_, f32>,
    z_j: ArrayView2<'_, f32>,
    config: &NtXentConfig,
) -> Result<NtXentResult> {
    let (result, _) = evaluate(z_i, z_j, config, false)?;
    Ok(result)
}

/// Loss plus analytic gradients for both views.
pub fn nt_xent_loss_with_grad(
    z_i: ArrayView2<'_, f32>,
    z_j: ArrayView2<'_, f32>,
    config: &NtXentConfig,
) -> Result<(NtXentResult, NtXentGradients)> {
    let (result, grad) = evaluate(z_i, z_j, config, true)?;
    let grad = grad.ok_or_else(|| {
        SelfSupError::InvalidArgument("gradient requested but not produced".to_string())
    })?;
    let batch = result.batch;
    let gradients = NtXentGradients {
        z_i: grad.slice(s![..batch, ..]).mapv(|v| v as f32),
        z_j: grad.slice(s![batch.., ..]).mapv(|v| v as f32),
    };
    Ok((result, gradients))
}

fn evaluate(
    z_i: ArrayView2<'_, f32>,
    z_j: ArrayView2<'_, f32>,
    config: &NtXentConfig,
    with_grad: bool,
) -> Result<(NtXentResult, Option<Array2<f64>>)> {
    config.validate()?;
    let (batch, _) = validate_batches(&z_i, &z_j)?;
    let z = concatenate(Axis(0), &[z_i.view(), z_j.view()])
        .map_err(|err| SelfSupError::Shape(err.to_string()))?
        .mapv(f64::from);
    let core = nt_xent_core(z.view(), batch, config, with_grad);
    let result = NtXentResult {
        loss: core.loss as f32,
        logits: core.logits.mapv(|v| v as f32),
        labels: vec![0; 2 * batch],
        batch,
    };
    Ok((result, core.grad))
}

struct Core {
    loss: f64,
    logits: Array2<f64>,
    grad: Option<Array2<f64>>,
}

/// `z` stacks both views as `[2N, D]`; row `r` pairs with `(r + N) mod 2N`.
fn nt_xent_core(z: ArrayView2<'_, f64>, batch: usize, config: &NtXentConfig, with_grad: bool) -> Core {
    let rows = 2 * batch;
    let floor = f64::from(f32::EPSILON);
    let norms: Vec<f64> = z.outer_iter().map(|row| row.dot(&row).sqrt()).collect();
    let mut unit = z.to_owned();
    for (mut row, norm) in unit.outer_iter_mut().zip(&norms) {
        row /= norm.max(floor);
    }
    let sim = unit.dot(&unit.t());
    let inv_t = 1.0 / f64::from(config.temperature);
    let columns = if config.mask_partner { rows - 1 } else { rows };

    let mut logits = Array2::<f64>::zeros((rows, columns));
    let mut grad_sim = with_grad.then(|| Array2::<f64>::zeros((rows, rows)));
    let mut total = 0.0;
    let mut targets = Vec::with_capacity(columns);
    for r in 0..rows {
        let partner = (r + batch) % rows;
        targets.clear();
        targets.push(partner);
        targets.extend((0..rows).filter(|&k| k != r && !(config.mask_partner && k == partner)));

        let max = targets
            .iter()
            .map(|&k| sim[[r, k]] * inv_t)
            .fold(f64::NEG_INFINITY, f64::max);
        let mut denom = 0.0;
        for (slot, &k) in targets.iter().enumerate() {
            let value = sim[[r, k]] * inv_t;
            logits[[r, slot]] = value;
            denom += (value - max).exp();
        }
        let log_partition = max + denom.ln();
        total += log_partition - logits[[r, 0]];

        if let Some(grad) = grad_sim.as_mut() {
            let scale = inv_t / rows as f64;
            for &k in targets.iter() {
                grad[[r, k]] += (sim[[r, k]] * inv_t - log_partition).exp() * scale;
            }
            grad[[r, partner]] -= scale;
        }
    }

    let grad = grad_sim.map(|grad_sim| {
        let grad_unit = (&grad_sim + &grad_sim.t()).dot(&unit);
        let mut grad_z = Array2::<f64>::zeros(z.raw_dim());
        for r in 0..rows {
            let g = grad_unit.row(r);
            if norms[r] < floor {
                grad_z.row_mut(r).assign(&(&g / floor));
            } else {
                let u = unit.row(r);
                let radial = u.dot(&g);
                grad_z.row_mut(r).assign(&((&g - &(&u * radial)) / norms[r]));
            }
        }
        grad_z
    });

    Core {
        loss: total / rows as f64,
        logits,
        grad,
    }
}

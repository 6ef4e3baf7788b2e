use approx::assert_abs_diff_eq;
use ndarray::{s, Array2, ArrayView2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use spiral_selfsup::contrastive::{
    nt_xent_loss, nt_xent_loss_with, nt_xent_loss_with_grad, NtXentConfig,
};
use spiral_selfsup::SelfSupError;

fn synthetic_batch(seed: u64, batch: usize, dim: usize) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((batch, dim), |_| rng.gen_range(-1.0f32..1.0f32))
}

fn loss_between<'a, 'b>(z_i: ArrayView2<'a, f32>, z_j: ArrayView2<'b, f32>) -> f32 {
    nt_xent_loss(z_i, z_j, 0.5).unwrap().loss
}

#[test]
fn views_borrowed_from_unrelated_arrays_are_accepted() {
    let anchors = synthetic_batch(21, 4, 8);
    let from_slice = {
        let wide = synthetic_batch(22, 4, 12);
        let narrowed = wide.slice(s![.., 2..10]);
        loss_between(anchors.view(), narrowed)
    };
    let copied = synthetic_batch(22, 4, 12).slice(s![.., 2..10]).to_owned();
    let from_owned = loss_between(anchors.view(), copied.view());
    assert!(from_slice.is_finite());
    assert_abs_diff_eq!(from_slice, from_owned, epsilon = 1e-6);
}

#[test]
fn swapping_views_keeps_the_loss() {
    let z_i = synthetic_batch(42, 6, 16);
    let z_j = synthetic_batch(1337, 6, 16);
    let forward = nt_xent_loss(z_i.view(), z_j.view(), 0.5).unwrap();
    let swapped = nt_xent_loss(z_j.view(), z_i.view(), 0.5).unwrap();
    assert_abs_diff_eq!(forward.loss, swapped.loss, epsilon = 1e-5);
    assert_eq!(forward.batch, 6);
    assert_eq!(forward.logits.dim(), (12, 12));
}

#[test]
fn identical_views_approach_ln2_with_partner_in_negatives() {
    let z = synthetic_batch(7, 8, 128);
    let result = nt_xent_loss(z.view(), z.view(), 0.01).unwrap();
    assert_abs_diff_eq!(result.loss, std::f32::consts::LN_2, epsilon = 1e-3);
}

#[test]
fn identical_views_approach_zero_with_masked_partner() {
    let z = synthetic_batch(7, 8, 128);
    let config = NtXentConfig {
        temperature: 0.01,
        mask_partner: true,
    };
    let result = nt_xent_loss_with(z.view(), z.view(), &config).unwrap();
    assert!(result.loss < 1e-3, "loss = {}", result.loss);
    assert_eq!(result.logits.dim(), (16, 15));
}

#[test]
fn loss_is_reproducible() {
    let z_i = synthetic_batch(3, 4, 8);
    let z_j = synthetic_batch(4, 4, 8);
    let first = nt_xent_loss(z_i.view(), z_j.view(), 0.1).unwrap();
    let second = nt_xent_loss(z_i.view(), z_j.view(), 0.1).unwrap();
    assert_eq!(first, second);
}

#[test]
fn scaling_a_projection_does_not_change_the_loss() {
    let z_i = synthetic_batch(5, 4, 8);
    let z_j = synthetic_batch(6, 4, 8);
    let scaled = &z_i * 10.0;
    let base = nt_xent_loss(z_i.view(), z_j.view(), 0.5).unwrap();
    let other = nt_xent_loss(scaled.view(), z_j.view(), 0.5).unwrap();
    assert_abs_diff_eq!(base.loss, other.loss, epsilon = 1e-5);
}

#[test]
fn gradient_step_lowers_the_loss() {
    let z_i = synthetic_batch(11, 5, 12);
    let z_j = synthetic_batch(12, 5, 12);
    let config = NtXentConfig::default();
    let (before, grads) = nt_xent_loss_with_grad(z_i.view(), z_j.view(), &config).unwrap();
    assert_eq!(grads.z_i.dim(), (5, 12));
    assert_eq!(grads.z_j.dim(), (5, 12));
    let stepped_i = &z_i - &(&grads.z_i * 0.5);
    let stepped_j = &z_j - &(&grads.z_j * 0.5);
    let after = nt_xent_loss(stepped_i.view(), stepped_j.view(), config.temperature).unwrap();
    assert!(after.loss < before.loss);
}

#[test]
fn mismatched_batches_are_rejected() {
    let z_i = synthetic_batch(1, 3, 4);
    let z_j = synthetic_batch(2, 2, 4);
    assert!(matches!(
        nt_xent_loss(z_i.view(), z_j.view(), 0.5),
        Err(SelfSupError::Shape(_))
    ));

    let z_k = synthetic_batch(2, 3, 5);
    assert!(matches!(
        nt_xent_loss(z_i.view(), z_k.view(), 0.5),
        Err(SelfSupError::Shape(_))
    ));

    let empty = Array2::<f32>::zeros((0, 4));
    assert!(matches!(
        nt_xent_loss(empty.view(), empty.view(), 0.5),
        Err(SelfSupError::InvalidArgument(_))
    ));
}

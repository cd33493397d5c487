// Shared by the test modules, not compiled into the library.
#![allow(dead_code)]

use ndarray::{s, Array, Array3, Dimension};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::{rngs::StdRng, SeedableRng};

use crate::masks::SequenceLengths;

/// Uniform `[-1, 1]` activations, reproducible from `seed`.
pub fn random_activations(shape: (usize, usize, usize), seed: u64) -> Array3<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::random_using(shape, Uniform::new_inclusive(-1.0f32, 1.0), &mut rng)
}

/// Panics with the worst element when any `|a - b| > tolerance * (1 + |b|)`.
pub fn assert_close<D: Dimension>(actual: &Array<f32, D>, expected: &Array<f32, D>, label: &str, tolerance: f32) {
    assert_eq!(actual.shape(), expected.shape(), "shape mismatch in '{}'", label);

    let mut worst = (0.0f32, 0usize);
    for (i, (a, b)) in actual.iter().zip(expected.iter()).enumerate() {
        let excess = (a - b).abs() - tolerance * (1.0 + b.abs());
        if excess > worst.0 {
            worst = (excess, i);
        }
    }
    if worst.0 > 0.0 {
        let (_, i) = worst;
        panic!(
            "'{}' differs at flat index {}: {} vs {}",
            label,
            i,
            actual.iter().nth(i).copied().unwrap_or(f32::NAN),
            expected.iter().nth(i).copied().unwrap_or(f32::NAN)
        );
    }
}

/// Same as [`assert_close`] but only over positions `< length` of each
/// `[batch, seq, hidden]` sequence.
pub fn assert_valid_close(
    actual: &Array3<f32>,
    expected: &Array3<f32>,
    lengths: &SequenceLengths,
    label: &str,
    tolerance: f32,
) {
    for (b, &len) in lengths.as_slice().iter().enumerate() {
        assert_close(
            &actual.slice(s![b, 0..len, ..]).to_owned(),
            &expected.slice(s![b, 0..len, ..]).to_owned(),
            &format!("{} (batch {})", label, b),
            tolerance,
        );
    }
}

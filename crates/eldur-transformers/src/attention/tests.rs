use super::*;
use crate::cache::CacheLayout;
use crate::masks::SequenceLengths;
use crate::quantize::Precision;
use crate::weights::{DecoderWeights, EncoderWeights};
use approx::assert_abs_diff_eq;
use ndarray::{Array, Array1, Array3};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::{rngs::StdRng, SeedableRng};

const HEADS: usize = 2;
const HEAD_SIZE: usize = 4;
const HIDDEN: usize = HEADS * HEAD_SIZE;

fn self_attention(seed: u64) -> MultiHeadAttention {
    let weights = EncoderWeights::random(1, HIDDEN, seed);
    MultiHeadAttention::new(
        &weights.layers[0].attention,
        HEADS,
        HEAD_SIZE,
        HIDDEN,
        HIDDEN,
        &WeightConversion::default(),
    )
    .unwrap()
}

fn random_rows(rows: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::random_using((rows, HIDDEN), Uniform::new(-1.0f32, 1.0), &mut rng)
}

/// Identity projections with zero bias: output = softmax(x x^T / sqrt(d)) x.
fn identity_attention() -> MultiHeadAttention {
    let eye = Array2::<f32>::eye(HIDDEN);
    let zero = Array1::<f32>::zeros(HIDDEN);
    let weights = AttentionWeights {
        q_kernel: Array2::zeros((HIDDEN, HIDDEN)),
        q_bias: zero.clone(),
        k_kernel: eye.clone(),
        k_bias: zero.clone(),
        v_kernel: eye.clone(),
        v_bias: zero.clone(),
        out_kernel: eye,
        out_bias: zero,
    };
    MultiHeadAttention::new(&weights, HEADS, HEAD_SIZE, HIDDEN, HIDDEN, &WeightConversion::default())
        .unwrap()
}

#[test]
fn test_head_product_mismatch() {
    let weights = EncoderWeights::random(1, HIDDEN, 0);
    let result = MultiHeadAttention::new(
        &weights.layers[0].attention,
        3,
        HEAD_SIZE,
        HIDDEN,
        HIDDEN,
        &WeightConversion::default(),
    );
    let err = result.err().unwrap();
    assert!(matches!(EngineError::find(&err), Some(EngineError::ShapeMismatch(_))));
}

#[test]
fn test_zero_query_averages_visible_values() {
    let attn = identity_attention();
    let lengths = SequenceLengths::new(vec![2, 3], 3).unwrap();
    let x = random_rows(6, 1);

    let out = attn
        .forward_padded(&x.view(), 2, 3, &lengths.pairwise_mask().view(), None)
        .unwrap();

    // batch 0 sees rows 0 and 1 only
    let expected = (&x.row(0) + &x.row(1)) / 2.0;
    for pos in 0..2 {
        for (a, b) in out.row(pos).iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }
    let expected = (&x.row(3) + &x.row(4) + &x.row(5)) / 3.0;
    for (a, b) in out.row(4).iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
    }
}

#[test]
fn test_padding_content_does_not_leak() {
    let attn = self_attention(3);
    let lengths = SequenceLengths::new(vec![3, 5], 5).unwrap();
    let mask = lengths.pairwise_mask();

    let clean = random_rows(10, 4);
    let mut noisy = clean.clone();
    noisy.slice_mut(s![3..5, ..]).fill(123.0);

    let a = attn.forward_padded(&clean.view(), 2, 5, &mask.view(), None).unwrap();
    let b = attn.forward_padded(&noisy.view(), 2, 5, &mask.view(), None).unwrap();

    for row in [0, 1, 2, 5, 6, 7, 8, 9] {
        for (x, y) in a.row(row).iter().zip(b.row(row).iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-5);
        }
    }
}

#[test]
fn test_packed_matches_padded() {
    let attn = self_attention(5);
    let lengths = SequenceLengths::new(vec![4, 1, 6], 6).unwrap();
    let packing = CompactedBatch::from_lengths(&lengths);
    let padded = random_rows(18, 6);
    let padded_3d = padded.clone().into_shape_with_order((3, 6, HIDDEN)).unwrap();

    let expected = attn
        .forward_padded(&padded.view(), 3, 6, &lengths.pairwise_mask().view(), None)
        .unwrap()
        .into_shape_with_order((3, 6, HIDDEN))
        .unwrap();

    let packed = packing.gather(&padded_3d.view()).unwrap();
    let out = attn.forward_packed(&packed.view(), &packing, None).unwrap();
    let restored = packing.scatter(&out.view()).unwrap();

    for (b, &len) in lengths.as_slice().iter().enumerate() {
        for pos in 0..len {
            for h in 0..HIDDEN {
                assert_abs_diff_eq!(restored[[b, pos, h]], expected[[b, pos, h]], epsilon = 1e-4);
            }
        }
    }
}

#[test]
fn test_packed_with_explicit_causal_mask() {
    let attn = self_attention(8);
    let lengths = SequenceLengths::new(vec![3, 4], 4).unwrap();
    let packing = CompactedBatch::from_lengths(&lengths);
    let mask = lengths.causal_pairwise_mask();
    let padded = random_rows(8, 9);

    let expected = attn.forward_padded(&padded.view(), 2, 4, &mask.view(), None).unwrap();
    let packed = packing
        .gather(&padded.clone().into_shape_with_order((2, 4, HIDDEN)).unwrap().view())
        .unwrap();
    let out = attn
        .forward_packed(&packed.view(), &packing, Some(&mask.view()))
        .unwrap();

    // packed row 3 is batch 1, position 0
    for (a, b) in out.row(3).iter().zip(expected.row(4).iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-4);
    }
}

#[test]
fn test_decode_steps_match_causal_full_pass() {
    let attn = self_attention(11);
    let (batch, steps) = (2, 5);
    let tokens = random_rows(batch * steps, 12);
    let tokens_3d = tokens.clone().into_shape_with_order((batch, steps, HIDDEN)).unwrap();

    let lengths = SequenceLengths::full(batch, steps).unwrap();
    let full = attn
        .forward_padded(&tokens.view(), batch, steps, &lengths.causal_pairwise_mask().view(), None)
        .unwrap()
        .into_shape_with_order((batch, steps, HIDDEN))
        .unwrap();

    for layout in [
        CacheLayout::Default,
        CacheLayout::select(Precision::Full, HEAD_SIZE, true),
    ] {
        let mut cache = SelfAttentionCache::new(layout, batch, HEADS, HEAD_SIZE, steps);
        for t in 0..steps {
            let step_in = tokens_3d.slice(s![.., t, ..]);
            let out = attn.forward_decode_step(&step_in, &mut cache, t).unwrap();
            for b in 0..batch {
                for h in 0..HIDDEN {
                    assert_abs_diff_eq!(out[[b, h]], full[[b, t, h]], epsilon = 1e-4);
                }
            }
        }
    }
}

#[test]
fn test_cross_attention_ignores_masked_memory() {
    let weights = DecoderWeights::random(1, HIDDEN, 6, 13);
    let attn = MultiHeadAttention::new(
        &weights.layers[0].cross_attention,
        HEADS,
        HEAD_SIZE,
        HIDDEN,
        6,
        &WeightConversion::default(),
    )
    .unwrap();

    let mut rng = StdRng::seed_from_u64(14);
    let memory = Array3::random_using((2, 4, 6), Uniform::new(-1.0f32, 1.0), &mut rng);
    let mut noisy = memory.clone();
    noisy.slice_mut(s![0, 2.., ..]).fill(-50.0);
    let memory_mask = SequenceLengths::new(vec![2, 4], 4).unwrap().sequence_mask();
    let query = random_rows(2, 15);

    let run = |mem: &Array3<f32>| {
        let flat = mem.view().into_shape_with_order((8, 6)).unwrap();
        let kv = attn.project_memory_kv(&flat, 2, 4).unwrap();
        assert_eq!(kv.keys_transposed.dim(), (2, HEADS, HEAD_SIZE, 4));
        attn.forward_cross(&query.view(), 2, 1, &kv, &memory_mask.view())
            .unwrap()
    };

    let a = run(&memory);
    let b = run(&noisy);
    for (x, y) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(x, y, epsilon = 1e-5);
    }
}

#[test]
fn test_cross_attention_rejects_wrong_memory_mask() {
    let attn = self_attention(16);
    let memory = random_rows(6, 17);
    let kv = attn.project_memory_kv(&memory.view(), 2, 3).unwrap();
    let bad_mask = Array2::<f32>::ones((2, 4));
    let err = attn
        .forward_cross(&random_rows(2, 18).view(), 2, 1, &kv, &bad_mask.view())
        .unwrap_err();
    assert!(matches!(EngineError::find(&err), Some(EngineError::ShapeMismatch(_))));
}

#[test]
fn test_quantized_projections_stay_close() {
    let weights = EncoderWeights::random(1, HIDDEN, 19);
    let full = self_attention(19);
    let lengths = SequenceLengths::full(1, 4).unwrap();
    let x = random_rows(4, 20);
    let expected = full
        .forward_padded(&x.view(), 1, 4, &lengths.pairwise_mask().view(), None)
        .unwrap();

    let half = MultiHeadAttention::new(
        &weights.layers[0].attention,
        HEADS,
        HEAD_SIZE,
        HIDDEN,
        HIDDEN,
        &WeightConversion::new(Precision::Half, 0).unwrap(),
    )
    .unwrap();
    let out = half
        .forward_padded(&x.view(), 1, 4, &lengths.pairwise_mask().view(), None)
        .unwrap();
    for (a, b) in out.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 5e-2);
    }
    assert!(half.projections().iter().all(|p| p.dtype() == crate::tensor::DType::F16));
}

#[test]
fn test_zero_query_matches_uniform_average_in_decode() {
    let attn = identity_attention();
    let mut cache = SelfAttentionCache::new(CacheLayout::Default, 1, HEADS, HEAD_SIZE, 3);
    let x = Array::from_shape_fn((3, HIDDEN), |(t, h)| (t * HIDDEN + h) as f32);

    let outputs: Vec<Array2<f32>> = (0..3)
        .map(|t| {
            attn.forward_decode_step(&x.slice(s![t..t + 1, ..]), &mut cache, t)
                .unwrap()
        })
        .collect();
    let last = &outputs[2];
    let mean = x.mean_axis(Axis(0)).unwrap();
    for (a, b) in last.row(0).iter().zip(mean.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-4);
    }
}

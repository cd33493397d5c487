use super::*;
use crate::error::EngineError;

#[test]
fn test_sequence_mask_row_counts_match_lengths() {
    let lengths = SequenceLengths::new(vec![10, 32, 5, 20], 32).unwrap();
    let mask = lengths.sequence_mask();

    assert_eq!(mask.dim(), (4, 32));
    for (row, &len) in mask.rows().into_iter().zip(lengths.as_slice()) {
        assert_eq!(row.iter().filter(|&&m| m == 1.0).count(), len);
        // valid positions are a prefix
        assert!(row.iter().take(len).all(|&m| m == 1.0));
        assert!(row.iter().skip(len).all(|&m| m == 0.0));
    }
}

#[test]
fn test_zero_length_is_invalid() {
    let err = SequenceLengths::new(vec![3, 0], 4).unwrap_err();
    assert_eq!(
        EngineError::find(&err),
        Some(&EngineError::InvalidLength {
            index: 1,
            length: 0,
            max_seq_len: 4
        })
    );
}

#[test]
fn test_overlong_length_is_invalid() {
    let err = SequenceLengths::new(vec![5], 4).unwrap_err();
    assert!(matches!(
        EngineError::find(&err),
        Some(EngineError::InvalidLength { index: 0, length: 5, .. })
    ));
}

#[test]
fn test_from_signed_rejects_negative() {
    let err = SequenceLengths::from_signed(&[2, -1], 4).unwrap_err();
    assert!(matches!(
        EngineError::find(&err),
        Some(EngineError::InvalidLength { index: 1, length: -1, .. })
    ));

    let ok = SequenceLengths::from_signed(&[2, 4], 4).unwrap();
    assert_eq!(ok.as_slice(), &[2, 4]);
    assert_eq!(ok.total_tokens(), 6);
    assert!(!ok.is_unpadded());
}

#[test]
fn test_full_lengths_are_unpadded() {
    let lengths = SequenceLengths::full(3, 7).unwrap();
    assert!(lengths.is_unpadded());
    assert_eq!(lengths.total_tokens(), 21);
}

#[test]
fn test_pairwise_mask_requires_both_valid() {
    let lengths = SequenceLengths::new(vec![2, 3], 3).unwrap();
    let mask = lengths.pairwise_mask();

    assert_eq!(mask.dim(), (2, 3, 3));
    assert_eq!(mask[[0, 1, 1]], 1.0);
    assert_eq!(mask[[0, 1, 2]], 0.0);
    assert_eq!(mask[[0, 2, 0]], 0.0);
    assert!(mask.index_axis(Axis(0), 1).iter().all(|&m| m == 1.0));
}

#[test]
fn test_causal_mask_hides_future() {
    let lengths = SequenceLengths::new(vec![6, 4], 6).unwrap();
    let mask = lengths.causal_pairwise_mask();

    for b in 0..2 {
        for i in 0..6 {
            for j in 0..6 {
                if i < j {
                    assert_eq!(mask[[b, i, j]], 0.0, "future visible at b={b} i={i} j={j}");
                }
            }
        }
    }
    assert_eq!(mask[[0, 5, 0]], 1.0);
    assert_eq!(mask[[1, 3, 3]], 1.0);
    assert_eq!(mask[[1, 4, 0]], 0.0);
}

#[test]
fn test_check_pairwise_mask_shape() {
    let mask = Array3::<f32>::ones((2, 4, 4));
    assert!(check_pairwise_mask(&mask.view(), 2, 4).is_ok());

    let err = check_pairwise_mask(&mask.view(), 2, 5).unwrap_err();
    assert!(matches!(
        EngineError::find(&err),
        Some(EngineError::ShapeMismatch(_))
    ));
}

#[test]
fn test_apply_pairwise_mask_broadcasts_over_heads() {
    let lengths = SequenceLengths::new(vec![1, 2], 2).unwrap();
    let mask = lengths.pairwise_mask();
    let mut scores = Array4::<f32>::zeros((2, 3, 2, 2));

    apply_pairwise_mask(&mut scores, &mask.view()).unwrap();

    for h in 0..3 {
        assert_eq!(scores[[0, h, 0, 0]], 0.0);
        assert_eq!(scores[[0, h, 0, 1]], MASK_VALUE);
        assert_eq!(scores[[0, h, 1, 0]], MASK_VALUE);
        assert_eq!(scores[[1, h, 1, 1]], 0.0);
    }
}

#[test]
fn test_apply_key_mask_broadcasts_over_queries() {
    let lengths = SequenceLengths::new(vec![2, 3], 3).unwrap();
    let mask = lengths.sequence_mask();
    let mut scores = Array4::<f32>::ones((2, 2, 1, 3));

    apply_key_mask(&mut scores, &mask.view()).unwrap();

    assert_eq!(scores[[0, 1, 0, 1]], 1.0);
    assert_eq!(scores[[0, 1, 0, 2]], MASK_VALUE);
    assert!(scores.index_axis(Axis(0), 1).iter().all(|&s| s == 1.0));
}

#[test]
fn test_mismatched_masks_are_rejected() {
    let mut scores = Array4::<f32>::zeros((2, 1, 3, 3));

    let wrong_pairwise = Array3::<f32>::ones((2, 2, 2));
    let err = apply_pairwise_mask(&mut scores, &wrong_pairwise.view()).unwrap_err();
    assert!(matches!(EngineError::find(&err), Some(EngineError::ShapeMismatch(_))));

    let wrong_keys = Array2::<f32>::zeros((2, 4));
    let err = apply_key_mask(&mut scores, &wrong_keys.view()).unwrap_err();
    assert!(matches!(EngineError::find(&err), Some(EngineError::ShapeMismatch(_))));
    assert!(apply_padding_mask(&mut scores, &wrong_keys.view()).is_err());

    // nothing was written
    assert!(scores.iter().all(|&s| s == 0.0));
}

#[test]
fn test_padding_keys_rank_below_masked_keys() {
    let lengths = SequenceLengths::new(vec![2], 3).unwrap();
    let hide_all = Array3::<f32>::zeros((1, 3, 3));
    let mut scores = Array4::<f32>::zeros((1, 1, 3, 3));

    apply_pairwise_mask(&mut scores, &hide_all.view()).unwrap();
    apply_padding_mask(&mut scores, &lengths.sequence_mask().view()).unwrap();
    crate::activations::softmax_4d_inplace(&mut scores);

    for q in 0..3 {
        assert_eq!(scores[[0, 0, q, 0]], 0.5);
        assert_eq!(scores[[0, 0, q, 1]], 0.5);
        assert_eq!(scores[[0, 0, q, 2]], 0.0);
    }
}

#[test]
fn test_output_mask_zeroes_padding_positions() {
    let lengths = SequenceLengths::new(vec![1, 3], 3).unwrap();
    let mut hidden = Array3::<f32>::ones((2, 3, 2));

    lengths.apply_output_mask(&mut hidden).unwrap();

    assert_eq!(hidden.slice(s![0, 1.., ..]).sum(), 0.0);
    assert_eq!(hidden.slice(s![0, 0, ..]).sum(), 2.0);
    assert_eq!(hidden.index_axis(Axis(0), 1).sum(), 6.0);
    assert_eq!(lengths.memory_mask(), lengths.sequence_mask());

    let mut wrong = Array3::<f32>::ones((2, 4, 2));
    let err = lengths.apply_output_mask(&mut wrong).unwrap_err();
    assert!(matches!(
        EngineError::find(&err),
        Some(EngineError::ShapeMismatch(_))
    ));
}

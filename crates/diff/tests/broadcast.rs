//! Gradient properties of broadcasting operations over random shapes.

use proptest::prelude::*;
use stochgraph_diff::backward::numerical_gradient;
use stochgraph_diff::{grad, grad_check, DiffError, DiffGraph, RTensor};

const H: f32 = 1e-2;
const TOL: f32 = 1e-2;

#[test]
fn incompatible_shapes_are_rejected() {
    let mut g = DiffGraph::new();
    let a = g.input(RTensor::zeros(vec![3, 4]));
    let b = g.input(RTensor::zeros(vec![3]));
    assert!(matches!(g.add(a, b), Err(DiffError::ShapeMismatch { .. })));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_row_broadcast_gradients(rows in 1usize..5, cols in 1usize..5, seed in any::<u64>()) {
        let mut g = DiffGraph::new();
        let a = g.input(RTensor::randn_seeded(vec![rows, cols], 1.0, seed));
        let b = g.input(RTensor::randn_seeded(vec![cols], 1.0, seed.wrapping_add(1)));
        let s = g.add(a, b).unwrap();
        let p = g.mul(s, a).unwrap();
        let out = g.sum_all(p).unwrap();

        prop_assert!(grad_check(&g, out, &[a, b], H, TOL).is_ok());
    }

    #[test]
    fn prop_bias_gradient_counts_rows(rows in 1usize..8, cols in 1usize..6, seed in any::<u64>()) {
        let mut g = DiffGraph::new();
        let a = g.input(RTensor::randn_seeded(vec![rows, cols], 1.0, seed));
        let b = g.input(RTensor::zeros(vec![cols]));
        let s = g.add(a, b).unwrap();
        let out = g.sum_all(s).unwrap();

        let grads = grad(&g, out, &[b]).unwrap();
        prop_assert_eq!(&grads[0].shape, &vec![cols]);
        prop_assert!(grads[0].data.iter().all(|&v| (v - rows as f32).abs() < 1e-5));
    }

    #[test]
    fn prop_normal_log_pdf_gradients(n in 1usize..6, seed in any::<u64>(), log_scale in -0.5f32..0.5) {
        let mut g = DiffGraph::new();
        let x = g.input(RTensor::randn_seeded(vec![n], 1.0, seed));
        let loc = g.param("loc", &RTensor::scalar(0.3));
        let scale = g.param("scale", &RTensor::scalar(log_scale.exp()));
        let lp = g.normal_log_pdf(x, loc, scale).unwrap();
        let out = g.sum_all(lp).unwrap();

        let analytical = grad(&g, out, &[loc]).unwrap()[0].data[0];
        let numerical = numerical_gradient(&g, out, loc, 0, H).unwrap();
        prop_assert!((analytical - numerical).abs() < TOL * analytical.abs().max(1.0));
        prop_assert!(grad_check(&g, out, &[x, scale], H, TOL).is_ok());
    }
}

//! Property tests: device result equals the host dequantize-then-multiply reference

mod common;

use common::{assert_close, DeviceFixture, WoqProblem};
use proptest::prelude::*;
use woqforge::{woq_matmul_int4, Attr};

/// (m, k, n, group_size) with K a multiple of 8 and G dividing K
fn problem_shape() -> impl Strategy<Value = (usize, usize, usize, usize)> {
    (1usize..4, 1usize..5, 1usize..6).prop_flat_map(|(m, containers, n)| {
        let k = containers * 8;
        let divisors: Vec<usize> = (1..=k).filter(|g| k % g == 0).collect();
        (Just(m), Just(k), Just(n), proptest::sample::select(divisors))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_matches_reference(
        (m, k, n, group_size) in problem_shape(),
        seed in any::<u64>(),
        zero_point in -8i32..=8,
    ) {
        let problem = WoqProblem::generate(m, k, n, group_size, seed)
            .with_zero_point(zero_point as f32);
        let fixture = DeviceFixture::in_order().unwrap();
        let ops = problem.upload(&fixture.engine).unwrap();

        woq_matmul_int4(
            &fixture.stream,
            &ops.dst,
            &ops.mat1,
            &ops.mat2,
            &ops.scale,
            &ops.zp,
            group_size,
            &Attr::new(),
            &[],
        )
        .unwrap()
        .wait()
        .unwrap();

        assert_close(&ops.dst.to_host_f32().unwrap(), &problem.reference(), 1e-6);
    }

    #[test]
    fn prop_non_divisor_group_size_is_rejected(
        containers in 1usize..5,
        group_size in 1usize..40,
    ) {
        let k = containers * 8;
        prop_assume!(k % group_size != 0);
        let fixture = DeviceFixture::in_order().unwrap();
        let ops = WoqProblem::generate(1, k, 2, 8, 0).upload(&fixture.engine).unwrap();

        let result = woq_matmul_int4(
            &fixture.stream,
            &ops.dst,
            &ops.mat1,
            &ops.mat2,
            &ops.scale,
            &ops.zp,
            group_size,
            &Attr::new(),
            &[],
        );
        prop_assert!(result.is_err());
        prop_assert_eq!(fixture.stream.submitted(), 0);
    }
}

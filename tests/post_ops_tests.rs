//! Fused post-ops applied to the matmul accumulator

mod common;

use anyhow::Result;
use common::{assert_close, DeviceFixture, WoqProblem};
use woqforge::{woq_matmul_int4, Attr, BinaryAlg, DataType, DeviceTensor, EltwiseAlg};

#[test]
fn test_bias_then_relu() -> Result<()> {
    let problem = WoqProblem::generate(3, 16, 4, 8, 41);
    let fixture = DeviceFixture::in_order()?;
    let ops = problem.upload(&fixture.engine)?;
    let bias = [1.5f32, -40.0, 0.0, 2.0];
    let bias_tensor = DeviceTensor::from_host_f32(&fixture.engine, &[4], DataType::F32, &bias)?;

    let attr = Attr::new()
        .append_bias(bias_tensor)
        .append_eltwise(EltwiseAlg::Relu, 0.0, 0.0);
    woq_matmul_int4(
        &fixture.stream,
        &ops.dst,
        &ops.mat1,
        &ops.mat2,
        &ops.scale,
        &ops.zp,
        8,
        &attr,
        &[],
    )?
    .wait()?;

    let expected: Vec<f32> = problem
        .reference()
        .iter()
        .enumerate()
        .map(|(i, &x)| (x + bias[i % 4]).max(0.0))
        .collect();
    assert_close(&ops.dst.to_host_f32()?, &expected, 1e-6);
    Ok(())
}

#[test]
fn test_sum_accumulates_into_prior_destination() -> Result<()> {
    let problem = WoqProblem::generate(2, 16, 3, 8, 42);
    let fixture = DeviceFixture::in_order()?;
    let mut ops = problem.upload(&fixture.engine)?;
    let prior = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    ops.dst = DeviceTensor::from_host_f32(&fixture.engine, &[2, 3], DataType::F32, &prior)?;

    woq_matmul_int4(
        &fixture.stream,
        &ops.dst,
        &ops.mat1,
        &ops.mat2,
        &ops.scale,
        &ops.zp,
        8,
        &Attr::new().append_sum(0.5),
        &[],
    )?
    .wait()?;

    let expected: Vec<f32> = problem
        .reference()
        .iter()
        .zip(prior)
        .map(|(&x, p)| x + 0.5 * p)
        .collect();
    assert_close(&ops.dst.to_host_f32()?, &expected, 1e-6);
    Ok(())
}

#[test]
fn test_sum_sees_prior_contents_of_strided_destination() -> Result<()> {
    let problem = WoqProblem::generate(2, 16, 3, 8, 43);
    let fixture = DeviceFixture::in_order()?;
    let ops = problem.upload(&fixture.engine)?;

    // Column-major storage viewed as [2, 3]
    let prior_row_major = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    let column_major = [1.0f32, 4.0, 2.0, 5.0, 3.0, 6.0];
    let storage =
        DeviceTensor::from_host_f32(&fixture.engine, &[3, 2], DataType::F32, &column_major)?;
    let dst = storage.transpose(0, 1)?;

    woq_matmul_int4(
        &fixture.stream,
        &dst,
        &ops.mat1,
        &ops.mat2,
        &ops.scale,
        &ops.zp,
        8,
        &Attr::new().append_sum(1.0),
        &[],
    )?
    .wait()?;

    let expected: Vec<f32> = problem
        .reference()
        .iter()
        .zip(prior_row_major)
        .map(|(&x, p)| x + p)
        .collect();
    assert_close(&dst.to_host_f32()?, &expected, 1e-6);
    Ok(())
}

#[test]
fn test_per_row_binary_multiply() -> Result<()> {
    let problem = WoqProblem::generate(2, 8, 3, 8, 44);
    let fixture = DeviceFixture::in_order()?;
    let ops = problem.upload(&fixture.engine)?;
    let factors =
        DeviceTensor::from_host_f32(&fixture.engine, &[2, 1], DataType::F32, &[2.0, -1.0])?;

    woq_matmul_int4(
        &fixture.stream,
        &ops.dst,
        &ops.mat1,
        &ops.mat2,
        &ops.scale,
        &ops.zp,
        8,
        &Attr::new().append_binary(BinaryAlg::Mul, factors),
        &[],
    )?
    .wait()?;

    let expected: Vec<f32> = problem
        .reference()
        .iter()
        .enumerate()
        .map(|(i, &x)| x * if i / 3 == 0 { 2.0 } else { -1.0 })
        .collect();
    assert_close(&ops.dst.to_host_f32()?, &expected, 1e-6);
    Ok(())
}

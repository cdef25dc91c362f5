//! Dependency handling of submitted matmuls on in-order and out-of-order queues

mod common;

use std::sync::mpsc;

use anyhow::Result;
use common::{assert_close, reference_woq, DeviceFixture, WoqProblem};
use woqforge::{woq_matmul_int4, Attr, DataType, DeviceError, DeviceTensor, Event, Stream};

/// Submit work that blocks its queue slot until the returned sender fires
fn gate(stream: &Stream) -> Result<(Event, mpsc::Sender<()>)> {
    let (release, wait) = mpsc::channel::<()>();
    let event = stream.submit("gate", &[], move || {
        wait.recv()
            .map_err(|e| DeviceError::ExecutionFault(format!("gate dropped: {}", e)))
    })?;
    Ok((event, release))
}

#[test]
fn test_submission_does_not_block_on_dependencies() -> Result<()> {
    let problem = WoqProblem::generate(2, 16, 3, 8, 31);
    let fixture = DeviceFixture::out_of_order()?;
    let ops = problem.upload(&fixture.engine)?;
    let (gate_event, release) = gate(&fixture.stream)?;

    let done = woq_matmul_int4(
        &fixture.stream,
        &ops.dst,
        &ops.mat1,
        &ops.mat2,
        &ops.scale,
        &ops.zp,
        8,
        &Attr::new(),
        &[gate_event.clone()],
    )?;
    // Returned while the gate is still closed
    assert!(!done.is_finished());
    assert_eq!(ops.dst.to_host_f32()?, vec![0.0; 6]);

    release.send(())?;
    done.wait()?;
    assert!(gate_event.is_complete());
    assert_close(&ops.dst.to_host_f32()?, &problem.reference(), 1e-6);
    Ok(())
}

#[test]
fn test_chained_matmuls_observe_predecessor_output() -> Result<()> {
    // A: h = x * W1 (M=2, K=16, N=8); B: y = h * W2 (K=8, N=3)
    let a = WoqProblem::generate(2, 16, 8, 8, 32);
    let b_weights = WoqProblem::generate(2, 8, 3, 8, 33);
    let fixture = DeviceFixture::out_of_order()?;
    let engine = &fixture.engine;

    let a_ops = a.upload(engine)?;
    let b_ops = b_weights.upload(engine)?;
    let y = DeviceTensor::empty(engine, &[2, 3], DataType::F32)?;

    let (gate_event, release) = gate(&fixture.stream)?;
    let a_done = woq_matmul_int4(
        &fixture.stream,
        &a_ops.dst,
        &a_ops.mat1,
        &a_ops.mat2,
        &a_ops.scale,
        &a_ops.zp,
        8,
        &Attr::new(),
        &[gate_event],
    )?;
    let b_done = woq_matmul_int4(
        &fixture.stream,
        &y,
        &a_ops.dst,
        &b_ops.mat2,
        &b_ops.scale,
        &b_ops.zp,
        8,
        &Attr::new(),
        &[a_done.clone()],
    )?;
    assert!(!b_done.is_finished());

    release.send(())?;
    b_done.wait()?;
    assert!(a_done.is_complete());

    let h = a.reference();
    let expected = reference_woq(
        &h,
        &b_weights.q,
        &b_weights.scales,
        b_weights.zero_point,
        2,
        8,
        3,
        8,
    );
    assert_close(&y.to_host_f32()?, &expected, 1e-5);
    Ok(())
}

#[test]
fn test_in_order_queue_serializes_without_explicit_dependencies() -> Result<()> {
    let a = WoqProblem::generate(1, 8, 8, 8, 34);
    let b_weights = WoqProblem::generate(1, 8, 2, 8, 35);
    let fixture = DeviceFixture::in_order()?;
    let engine = &fixture.engine;
    let a_ops = a.upload(engine)?;
    let b_ops = b_weights.upload(engine)?;
    let y = DeviceTensor::empty(engine, &[1, 2], DataType::F32)?;

    woq_matmul_int4(
        &fixture.stream,
        &a_ops.dst,
        &a_ops.mat1,
        &a_ops.mat2,
        &a_ops.scale,
        &a_ops.zp,
        8,
        &Attr::new(),
        &[],
    )?;
    woq_matmul_int4(
        &fixture.stream,
        &y,
        &a_ops.dst,
        &b_ops.mat2,
        &b_ops.scale,
        &b_ops.zp,
        8,
        &Attr::new(),
        &[],
    )?;
    fixture.stream.synchronize()?;

    let expected = reference_woq(
        &a.reference(),
        &b_weights.q,
        &b_weights.scales,
        b_weights.zero_point,
        1,
        8,
        2,
        8,
    );
    assert_close(&y.to_host_f32()?, &expected, 1e-5);
    Ok(())
}

#[test]
fn test_faulted_dependency_faults_the_matmul() -> Result<()> {
    let problem = WoqProblem::generate(1, 8, 2, 8, 36);
    let fixture = DeviceFixture::out_of_order()?;
    let ops = problem.upload(&fixture.engine)?;

    let failed = fixture.stream.submit("producer", &[], || {
        Err(DeviceError::ExecutionFault("producer failed".to_string()))
    })?;
    let done = woq_matmul_int4(
        &fixture.stream,
        &ops.dst,
        &ops.mat1,
        &ops.mat2,
        &ops.scale,
        &ops.zp,
        8,
        &Attr::new(),
        &[failed],
    )?;
    let err = done.wait().unwrap_err();
    assert!(err.to_string().contains("producer"), "{}", err);
    assert_eq!(ops.dst.to_host_f32()?, vec![0.0; 2]);
    Ok(())
}

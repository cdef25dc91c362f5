//! Common fixtures for WoQ matmul integration tests
//!
//! - [`DeviceFixture`]: an emulated device plus one queue
//! - [`pack_int4`]: packs logical `(K, N)` nibbles the way the kernel reads them
//! - [`WoqProblem`]: deterministic operands plus a dequantize-then-multiply
//!   reference computed entirely on the host

#![allow(dead_code)]

pub use serial_test::serial;

use woqforge::{DataType, DeviceTensor, Engine, QueueOrder, Stream, WoqResult};

// ============================================================================
// Device
// ============================================================================

pub struct DeviceFixture {
    pub engine: Engine,
    pub stream: Stream,
}

impl DeviceFixture {
    pub fn new(order: QueueOrder) -> anyhow::Result<Self> {
        let engine = Engine::new(0);
        let stream = engine.create_stream(order)?;
        Ok(DeviceFixture { engine, stream })
    }

    pub fn in_order() -> anyhow::Result<Self> {
        Self::new(QueueOrder::InOrder)
    }

    pub fn out_of_order() -> anyhow::Result<Self> {
        Self::new(QueueOrder::OutOfOrder)
    }

    pub fn allocations(&self) -> usize {
        self.engine.stats().allocations()
    }
}

// ============================================================================
// Packing and reference math
// ============================================================================

/// Pack row-major `(K, N)` nibbles into `N x K/8` containers, K fastest
pub fn pack_int4(q: &[u8], k: usize, n: usize) -> Vec<u32> {
    assert_eq!(q.len(), k * n);
    assert_eq!(k % 8, 0);
    let compressed_k = k / 8;
    let mut containers = vec![0u32; compressed_k * n];
    for row in 0..k {
        for col in 0..n {
            let nibble = (q[row * n + col] & 0x0F) as u32;
            containers[col * compressed_k + row / 8] |= nibble << (4 * (row % 8));
        }
    }
    containers
}

/// Unpack one nibble back out of the containers
pub fn unpack_int4(containers: &[u32], k: usize, row: usize, col: usize) -> u8 {
    let compressed_k = k / 8;
    ((containers[col * compressed_k + row / 8] >> (4 * (row % 8))) & 0x0F) as u8
}

/// `a[M, K] x W[K, N]` with `W[k, n] = (q[k, n] - zp) * scale[n, k / g]`
pub fn reference_woq(
    a: &[f32],
    q: &[u8],
    scales: &[f32],
    zero_point: f32,
    m: usize,
    k: usize,
    n: usize,
    g: usize,
) -> Vec<f32> {
    let num_groups = k / g;
    let mut out = vec![0.0f32; m * n];
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0f32;
            for kk in 0..k {
                let w = (q[kk * n + col] as f32 - zero_point) * scales[col * num_groups + kk / g];
                acc += a[row * k + kk] * w;
            }
            out[row * n + col] = acc;
        }
    }
    out
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance * e.abs().max(1.0),
            "element {}: got {}, expected {}",
            i,
            a,
            e
        );
    }
}

// ============================================================================
// Problems
// ============================================================================

/// Host-side operands of one WoQ matmul
#[derive(Debug, Clone)]
pub struct WoqProblem {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub group_size: usize,
    /// Row-major `[M, K]`
    pub activation: Vec<f32>,
    /// Row-major `(K, N)` nibbles
    pub q: Vec<u8>,
    /// Row-major `[N, K / group_size]`
    pub scales: Vec<f32>,
    pub zero_point: f32,
}

/// Operands uploaded to the device
pub struct DeviceOperands {
    pub dst: DeviceTensor,
    pub mat1: DeviceTensor,
    pub mat2: DeviceTensor,
    pub scale: DeviceTensor,
    pub zp: DeviceTensor,
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }
}

impl WoqProblem {
    /// Values chosen so every dequantized weight and product is exact in bf16/f32
    pub fn generate(m: usize, k: usize, n: usize, group_size: usize, seed: u64) -> Self {
        let mut rng = Lcg(seed ^ 0x9E37_79B9_7F4A_7C15);
        let activation = (0..m * k)
            .map(|_| (rng.next() % 9) as f32 * 0.5 - 2.0)
            .collect();
        let q = (0..k * n).map(|_| (rng.next() % 16) as u8).collect();
        let scales = (0..n * (k / group_size))
            .map(|_| [0.25f32, 0.5, 1.0, 2.0][(rng.next() % 4) as usize])
            .collect();
        WoqProblem {
            m,
            k,
            n,
            group_size,
            activation,
            q,
            scales,
            zero_point: 8.0,
        }
    }

    pub fn with_zero_point(mut self, zero_point: f32) -> Self {
        self.zero_point = zero_point;
        self
    }

    pub fn packed(&self) -> Vec<u32> {
        pack_int4(&self.q, self.k, self.n)
    }

    pub fn reference(&self) -> Vec<f32> {
        reference_woq(
            &self.activation,
            &self.q,
            &self.scales,
            self.zero_point,
            self.m,
            self.k,
            self.n,
            self.group_size,
        )
    }

    /// Contiguous device operands with f32 activation/destination
    pub fn upload(&self, engine: &Engine) -> WoqResult<DeviceOperands> {
        self.upload_as(engine, DataType::F32)
    }

    pub fn upload_as(&self, engine: &Engine, dtype: DataType) -> WoqResult<DeviceOperands> {
        let num_groups = self.k / self.group_size;
        Ok(DeviceOperands {
            dst: DeviceTensor::empty(engine, &[self.m, self.n], dtype)?,
            mat1: DeviceTensor::from_host_f32(engine, &[self.m, self.k], dtype, &self.activation)?,
            mat2: DeviceTensor::from_host_u32(engine, &[self.n, self.k / 8], &self.packed())?,
            scale: DeviceTensor::from_host_f32(
                engine,
                &[self.n, num_groups],
                DataType::Bf16,
                &self.scales,
            )?,
            zp: DeviceTensor::from_host_f32(engine, &[1], DataType::S8, &[self.zero_point])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_agree() {
        let problem = WoqProblem::generate(1, 24, 3, 8, 7);
        let packed = problem.packed();
        for row in 0..24 {
            for col in 0..3 {
                assert_eq!(unpack_int4(&packed, 24, row, col), problem.q[row * 3 + col]);
            }
        }
    }
}

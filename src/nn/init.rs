//! Seeded parameter initialization

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Initialization strategy for new parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// All zeros
    Zeros,
    /// Uniform random in `[-bound, bound]`
    Uniform(f32),
    /// U(-1/sqrt(fan_in), 1/sqrt(fan_in)), fan_in being the last dim
    PyTorchLinear,
    /// N(0, 1) approximated as U(-1, 1)
    PyTorchEmbedding,
}

/// splitmix64 generator. Same seed, same parameters on every platform.
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        // top 24 bits fill the f32 mantissa exactly
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Uniform in `[0, n)`. `n` must be non-zero.
    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

impl Init {
    /// Draw an F32 tensor of `shape`.
    pub fn tensor<R: Runtime<DType = DType>>(
        self,
        shape: &[usize],
        rng: &mut SplitMix64,
        device: &R::Device,
    ) -> Tensor<R> {
        let n: usize = shape.iter().product();
        let bound = match self {
            Init::Zeros => 0.0,
            Init::Uniform(b) => b,
            Init::PyTorchLinear => {
                let fan_in = shape.last().copied().unwrap_or(1).max(1);
                1.0 / (fan_in as f32).sqrt()
            }
            Init::PyTorchEmbedding => 1.0,
        };
        let data: Vec<f32> = (0..n)
            .map(|_| {
                if bound == 0.0 {
                    0.0
                } else {
                    (rng.next_f32() * 2.0 - 1.0) * bound
                }
            })
            .collect();
        Tensor::<R>::from_slice(&data, shape, device)
    }
}

/// Deterministic permutation of `[0, len)` (Fisher-Yates).
pub fn shuffled_indices(len: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = SplitMix64::new(seed);
    for i in (1..len).rev() {
        let j = rng.below(i + 1);
        indices.swap(i, j);
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_same_seed_same_values() {
        let (_client, device) = cpu_setup();
        let a = Init::PyTorchLinear.tensor::<CpuRuntime>(&[3, 4], &mut SplitMix64::new(7), &device);
        let b = Init::PyTorchLinear.tensor::<CpuRuntime>(&[3, 4], &mut SplitMix64::new(7), &device);
        assert_eq!(a.to_vec::<f32>(), b.to_vec::<f32>());
    }

    #[test]
    fn test_bounds() {
        let (_client, device) = cpu_setup();
        let t = Init::Uniform(0.1).tensor::<CpuRuntime>(&[100], &mut SplitMix64::new(1), &device);
        assert!(t.to_vec::<f32>().iter().all(|v| v.abs() <= 0.1));

        let z = Init::Zeros.tensor::<CpuRuntime>(&[4], &mut SplitMix64::new(1), &device);
        assert_eq!(z.to_vec::<f32>(), vec![0.0; 4]);
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let mut idx = shuffled_indices(50, 42);
        assert_eq!(idx, shuffled_indices(50, 42));
        assert_ne!(idx, (0..50).collect::<Vec<_>>());
        idx.sort_unstable();
        assert_eq!(idx, (0..50).collect::<Vec<_>>());
        assert_eq!(shuffled_indices(1, 3), vec![0]);
        assert!(shuffled_indices(0, 3).is_empty());
    }
}

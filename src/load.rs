// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::fmt;

use crate::config::MAX_SIZE_TIER;

#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    InvalidSize(usize),
    NonFinite { size: usize },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::InvalidSize(size) => write!(f, "invalid workload size {}", size),
            LoadError::NonFinite { size } => {
                write!(f, "workload of size {} produced a non-finite result", size)
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// One bounded unit of CPU work. Cost must grow with `size`. A call is not
/// interruptible; callers check for stop requests between calls.
pub trait LoadGenerator {
    fn burn(&mut self, size: usize) -> Result<(), LoadError>;
}

/// Dense square matrix product followed by a normalise and exponentiate
/// pass. Cost is cubic in `size`.
pub struct MatrixBurner {
    seed: u64,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
}

impl MatrixBurner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed: seed | 1,
            a: Vec::new(),
            b: Vec::new(),
            c: Vec::new(),
        }
    }

    // LCG, uniform in [0, 1).
    fn next_unit(&mut self) -> f64 {
        self.seed = self
            .seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.seed >> 11) as f64 / (1u64 << 53) as f64
    }

    fn fill(&mut self, size: usize) -> Result<(), LoadError> {
        let n = size
            .checked_mul(size)
            .ok_or(LoadError::InvalidSize(size))?;
        for m in [&mut self.a, &mut self.b, &mut self.c] {
            m.try_reserve_exact(n.saturating_sub(m.len()))
                .map_err(|_| LoadError::InvalidSize(size))?;
        }
        self.a.resize(n, 0.0);
        self.b.resize(n, 0.0);
        self.c.clear();
        self.c.resize(n, 0.0);
        for i in 0..n {
            self.a[i] = self.next_unit();
            self.b[i] = self.next_unit();
        }
        Ok(())
    }

    fn multiply(&mut self, size: usize) {
        // i-k-j order keeps the inner loop streaming through rows.
        for i in 0..size {
            let row = i * size;
            for k in 0..size {
                let aik = self.a[row + k];
                let b_row = k * size;
                for j in 0..size {
                    self.c[row + j] += aik * self.b[b_row + j];
                }
            }
        }
    }
}

impl Default for MatrixBurner {
    fn default() -> Self {
        Self::new(std::process::id() as u64)
    }
}

impl LoadGenerator for MatrixBurner {
    fn burn(&mut self, size: usize) -> Result<(), LoadError> {
        if size == 0 || size > MAX_SIZE_TIER {
            return Err(LoadError::InvalidSize(size));
        }

        self.fill(size)?;
        self.multiply(size);

        let max = self.c.iter().cloned().fold(f64::MIN, f64::max);
        if !max.is_finite() || max <= 0.0 {
            return Err(LoadError::NonFinite { size });
        }
        let sum: f64 = self.c.iter().map(|v| (v / max).exp().abs()).sum();
        if !std::hint::black_box(sum).is_finite() {
            return Err(LoadError::NonFinite { size });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burn_small() {
        let mut burner = MatrixBurner::new(42);
        assert_eq!(burner.burn(16), Ok(()));
        assert_eq!(burner.burn(1), Ok(()));
    }

    #[test]
    fn test_burn_zero_is_invalid() {
        let mut burner = MatrixBurner::new(42);
        assert_eq!(burner.burn(0), Err(LoadError::InvalidSize(0)));
    }

    #[test]
    fn test_burn_oversized_is_invalid() {
        let mut burner = MatrixBurner::new(42);
        assert_eq!(
            burner.burn(MAX_SIZE_TIER + 1),
            Err(LoadError::InvalidSize(MAX_SIZE_TIER + 1))
        );
        assert_eq!(burner.burn(1 << 33), Err(LoadError::InvalidSize(1 << 33)));
        assert!(burner.a.is_empty());
    }

    #[test]
    fn test_fill_overflow_is_invalid() {
        let mut burner = MatrixBurner::new(42);
        assert_eq!(
            burner.fill(usize::MAX),
            Err(LoadError::InvalidSize(usize::MAX))
        );
        assert!(burner.a.is_empty());
    }

    #[test]
    fn test_multiply_identity() {
        let mut burner = MatrixBurner::new(7);
        burner.fill(3).unwrap();
        burner.b = vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        burner.multiply(3);
        assert_eq!(burner.c, burner.a);
    }

    #[test]
    fn test_unit_range() {
        let mut burner = MatrixBurner::new(3);
        for _ in 0..1000 {
            let v = burner.next_unit();
            assert!((0.0..1.0).contains(&v));
        }
    }
}

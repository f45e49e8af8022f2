//! The value-type / metric dispatch boundary (§9 DESIGN NOTES "Dynamic
//! dispatch"). The source combines four element types with three distance
//! functions through virtual calls; here a tagged-variant enum picks the
//! encoding at the outer boundary (CLI, wire format) and every downstream
//! computation works on plain `&[f32]`, decoded once on the way in.

use crate::error::SpfreshError;
use serde::{Deserialize, Serialize};

/// Element type `T` a vector file or wire record is stored as (§6 `--value-type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Float,
    Int8,
    Int16,
    UInt8,
}

impl ValueType {
    #[must_use]
    pub fn element_size(self) -> usize {
        match self {
            ValueType::Float => 4,
            ValueType::Int8 | ValueType::UInt8 => 1,
            ValueType::Int16 => 2,
        }
    }

    /// Decode `dim` consecutive elements starting at `bytes[0]` into `f32`.
    pub fn decode(self, bytes: &[u8], dim: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(dim);
        match self {
            ValueType::Float => {
                for chunk in bytes[..dim * 4].chunks_exact(4) {
                    out.push(f32::from_le_bytes(chunk.try_into().unwrap()));
                }
            }
            ValueType::Int8 => {
                for &b in &bytes[..dim] {
                    out.push(f32::from(b as i8));
                }
            }
            ValueType::UInt8 => {
                for &b in &bytes[..dim] {
                    out.push(f32::from(b));
                }
            }
            ValueType::Int16 => {
                for chunk in bytes[..dim * 2].chunks_exact(2) {
                    out.push(f32::from(i16::from_le_bytes(chunk.try_into().unwrap())));
                }
            }
        }
        out
    }

    /// Encode `values` (already in the element's native range) into bytes.
    pub fn encode(self, values: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.element_size());
        match self {
            ValueType::Float => {
                for &v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            ValueType::Int8 => {
                for &v in values {
                    out.push((v as i8) as u8);
                }
            }
            ValueType::UInt8 => {
                for &v in values {
                    out.push(v as u8);
                }
            }
            ValueType::Int16 => {
                for &v in values {
                    out.extend_from_slice(&(v as i16).to_le_bytes());
                }
            }
        }
        out
    }
}

/// A decoded vector: always `f32` internally regardless of on-disk `ValueType`.
#[derive(Debug, Clone, PartialEq)]
pub struct Vector {
    pub dim: usize,
    pub data: Vec<f32>,
}

impl Vector {
    #[must_use]
    pub fn new(data: Vec<f32>) -> Self {
        let dim = data.len();
        Self { dim, data }
    }

    pub fn check_dim(&self, expected: usize) -> Result<(), SpfreshError> {
        if self.dim != expected {
            return Err(SpfreshError::DimensionMismatch {
                expected,
                actual: self.dim,
            });
        }
        Ok(())
    }
}

/// Distance metric (§4.E `distance(a, b)`). Internal math is generic over
/// plain `f32` slices; the metric itself is the only thing chosen dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    L2,
    Cosine,
    InnerProduct,
}

impl Metric {
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            Metric::L2 => l2_distance(a, b),
            Metric::Cosine => cosine_distance(a, b),
            Metric::InnerProduct => inner_product_distance(a, b),
        }
    }
}

#[inline]
fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(feature = "nightly-simd")]
    {
        l2_distance_simd(a, b)
    }
    #[cfg(not(feature = "nightly-simd"))]
    {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}

/// SIMD L2 over slices of arbitrary (non-const) length: 8-lane chunks plus
/// a scalar tail, the same chunk-then-tail shape as the teacher's
/// `poincare_distance_sq` (there over a `const N: usize` array; here over
/// a runtime-length slice, since postings carry a dimension fixed at
/// collection build time, not at compile time).
#[cfg(feature = "nightly-simd")]
fn l2_distance_simd(a: &[f32], b: &[f32]) -> f32 {
    use std::simd::prelude::*;
    const LANES: usize = 8;
    let mut acc = f32x8::splat(0.0);
    let chunks = a.len() / LANES;
    for i in 0..chunks {
        let start = i * LANES;
        let av = f32x8::from_slice(&a[start..start + LANES]);
        let bv = f32x8::from_slice(&b[start..start + LANES]);
        let diff = av - bv;
        acc += diff * diff;
    }
    let mut sum = acc.reduce_sum();
    for i in chunks * LANES..a.len() {
        let diff = a[i] - b[i];
        sum += diff * diff;
    }
    sum.sqrt()
}

#[inline]
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 1.0;
    }
    1.0 - dot / (na * nb)
}

#[inline]
fn inner_product_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    -dot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_float() {
        let vt = ValueType::Float;
        let values = vec![1.0, -2.5, 3.25];
        let bytes = vt.encode(&values);
        let back = vt.decode(&bytes, values.len());
        assert_eq!(values, back);
    }

    #[test]
    fn roundtrip_int8() {
        let vt = ValueType::Int8;
        let values = vec![1.0, -5.0, 127.0, -128.0];
        let bytes = vt.encode(&values);
        let back = vt.decode(&bytes, values.len());
        assert_eq!(values, back);
    }

    #[test]
    fn l2_zero_for_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(Metric::L2.distance(&v, &v), 0.0);
    }

    #[test]
    fn cosine_one_for_orthogonal() {
        assert!((Metric::Cosine.distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
    }
}

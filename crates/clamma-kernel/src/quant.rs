//! Group-wise symmetric int8 quantization (spec component B).

use crate::error::{KernelError, Result};

/// A quantized tensor: `len(q) == group_size * len(s)`, and the semantic
/// value at position `i` is `q[i] * s[i / group_size]`.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub q: Vec<i8>,
    pub s: Vec<f32>,
    pub group_size: usize,
}

impl QuantizedTensor {
    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}

/// Quantize `x` into groups of `group_size` elements, writing into caller-
/// supplied buffers (`q.len() == x.len()`, `s.len() == x.len() / group_size`).
///
/// For each group, `scale = max(|x|) / 127`; values are rounded to the
/// nearest int8 (ties away from zero) and clamped. A fully-zero group gets
/// scale 0 and all-zero codes, per spec. Used by the forward engine to
/// requantize an activation vector into its preallocated scratch each step
/// without reallocating.
pub fn quantize_into(x: &[f32], group_size: usize, q: &mut [i8], s: &mut [f32]) -> Result<()> {
    if group_size == 0 || x.len() % group_size != 0 {
        return Err(KernelError::BadGroupSize {
            len: x.len(),
            group_size,
        });
    }
    let num_groups = x.len() / group_size;
    if q.len() != x.len() || s.len() != num_groups {
        return Err(KernelError::DimMismatch(format!(
            "quantize_into: x.len()={}, q.len()={}, s.len()={}, expected s.len()={}",
            x.len(),
            q.len(),
            s.len(),
            num_groups
        )));
    }

    for g in 0..num_groups {
        let group = &x[g * group_size..(g + 1) * group_size];
        let wmax = group.iter().fold(0f32, |acc, v| acc.max(v.abs()));

        if wmax == 0.0 {
            s[g] = 0.0;
            for i in 0..group_size {
                q[g * group_size + i] = 0;
            }
            continue;
        }

        let scale = wmax / 127.0;
        s[g] = scale;
        for (i, &v) in group.iter().enumerate() {
            let quantized = round_ties_away_from_zero(v / scale);
            q[g * group_size + i] = quantized.clamp(-127.0, 127.0) as i8;
        }
    }

    Ok(())
}

/// Quantize `x` into groups of `group_size` elements.
///
/// For each group, `scale = max(|x|) / 127`; values are rounded to the
/// nearest int8 (ties away from zero) and clamped. A fully-zero group gets
/// scale 0 and all-zero codes, per spec.
pub fn quantize(x: &[f32], group_size: usize) -> Result<QuantizedTensor> {
    if group_size == 0 || x.len() % group_size != 0 {
        return Err(KernelError::BadGroupSize {
            len: x.len(),
            group_size,
        });
    }

    let num_groups = x.len() / group_size;
    let mut q = vec![0i8; x.len()];
    let mut s = vec![0f32; num_groups];
    quantize_into(x, group_size, &mut q, &mut s)?;

    Ok(QuantizedTensor { q, s, group_size })
}

/// Dequantize `qt` into a plain float vector.
pub fn dequantize(qt: &QuantizedTensor) -> Vec<f32> {
    let mut out = vec![0f32; qt.q.len()];
    for (i, o) in out.iter_mut().enumerate() {
        *o = qt.q[i] as f32 * qt.s[i / qt.group_size];
    }
    out
}

fn round_ties_away_from_zero(v: f32) -> f32 {
    if v >= 0.0 {
        (v + 0.5).floor()
    } else {
        (v - 0.5).ceil()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quantize_dequantize_bounds_error() {
        let x = vec![1.0, -2.0, 3.0, -4.0];
        let qt = quantize(&x, 4).unwrap();
        let back = dequantize(&qt);
        let group_max = 4.0f32;
        let tol = group_max / 127.0 / 2.0 + 1e-4;
        for (a, b) in x.iter().zip(back.iter()) {
            assert!((a - b).abs() <= tol, "{} vs {}", a, b);
        }
    }

    #[test]
    fn zero_group_quantizes_to_zero_scale() {
        let x = vec![0.0; 8];
        let qt = quantize(&x, 4).unwrap();
        assert_eq!(qt.s, vec![0.0, 0.0]);
        assert!(qt.q.iter().all(|&v| v == 0));
    }

    #[test]
    fn quantize_dequantize_quantize_is_idempotent() {
        let x = vec![0.1, 0.2, -0.3, 10.0, -5.0, 2.0, 0.0, -0.001];
        let qt = quantize(&x, 8).unwrap();
        let back = dequantize(&qt);
        let qt2 = quantize(&back, 8).unwrap();
        assert_eq!(qt.q, qt2.q);
        assert_relative_eq!(qt.s[0], qt2.s[0], epsilon = 1e-6);
    }

    #[test]
    fn rejects_non_multiple_group_size() {
        let x = vec![1.0, 2.0, 3.0];
        assert!(quantize(&x, 4).is_err());
    }
}

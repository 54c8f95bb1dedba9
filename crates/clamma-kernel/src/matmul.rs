//! Single-threaded matmul kernels over a sub-range of output rows (spec
//! component C). The worker pool slices `[0, d)` into row bands and calls
//! these once per band; the forward engine calls them directly with the
//! full range when run without the pool (e.g. in tests).

use crate::error::{KernelError, Result};

/// `xout[i - row_lo] = sum_j w[i, j] * x[j]` for `i` in `[row_lo, row_hi)`.
///
/// `w` is row-major `[d, n]`; `xout` holds exactly the `row_hi - row_lo` band
/// being computed, not the full `d`-length output. This lets a dispatcher
/// hand each worker a disjoint sub-slice of the real output buffer rather
/// than the whole thing, so concurrent shards never construct overlapping
/// `&mut` views of the same memory (see `clamma_pool::job::Job::run`).
pub fn matmul_range(
    xout: &mut [f32],
    x: &[f32],
    w: &[f32],
    n: usize,
    d: usize,
    row_lo: usize,
    row_hi: usize,
) -> Result<()> {
    if x.len() != n {
        return Err(KernelError::DimMismatch(format!(
            "x.len()={} but n={}",
            x.len(),
            n
        )));
    }
    if w.len() != n * d {
        return Err(KernelError::DimMismatch(format!(
            "w.len()={} but n*d={}",
            w.len(),
            n * d
        )));
    }
    if xout.len() != row_hi - row_lo {
        return Err(KernelError::DimMismatch(format!(
            "xout.len()={} but row_hi-row_lo={}",
            xout.len(),
            row_hi - row_lo
        )));
    }

    for (local, i) in (row_lo..row_hi).enumerate() {
        let row = &w[i * n..(i + 1) * n];
        let mut acc = 0f32;
        for j in 0..n {
            acc += row[j] * x[j];
        }
        xout[local] = acc;
    }

    Ok(())
}

/// Quantized counterpart of [`matmul_range`].
///
/// `q_w`/`s_w` hold the quantized weight matrix `[d, n]` with group size
/// `group_size`; `q_x`/`s_x` hold the quantized activation vector of length
/// `n`. The int32 accumulator per group never saturates: its magnitude is
/// bounded by `group_size * 127^2`.
#[allow(clippy::too_many_arguments)]
pub fn matmul_qt_range(
    xout: &mut [f32],
    q_x: &[i8],
    s_x: &[f32],
    q_w: &[i8],
    s_w: &[f32],
    n: usize,
    d: usize,
    group_size: usize,
    row_lo: usize,
    row_hi: usize,
) -> Result<()> {
    if n % group_size != 0 {
        return Err(KernelError::BadGroupSize {
            len: n,
            group_size,
        });
    }
    if q_x.len() != n {
        return Err(KernelError::DimMismatch(format!(
            "q_x.len()={} but n={}",
            q_x.len(),
            n
        )));
    }
    if q_w.len() != n * d {
        return Err(KernelError::DimMismatch(format!(
            "q_w.len()={} but n*d={}",
            q_w.len(),
            n * d
        )));
    }
    if xout.len() != row_hi - row_lo {
        return Err(KernelError::DimMismatch(format!(
            "xout.len()={} but row_hi-row_lo={}",
            xout.len(),
            row_hi - row_lo
        )));
    }

    let groups_per_row = n / group_size;

    for (local, i) in (row_lo..row_hi).enumerate() {
        let row_q = &q_w[i * n..(i + 1) * n];
        let row_s = &s_w[i * groups_per_row..(i + 1) * groups_per_row];
        let mut val = 0f32;

        for g in 0..groups_per_row {
            let mut ival: i32 = 0;
            let base = g * group_size;
            for k in 0..group_size {
                ival += q_x[base + k] as i32 * row_q[base + k] as i32;
            }
            val += ival as f32 * row_s[g] * s_x[g];
        }

        xout[local] = val;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::quantize;
    use approx::assert_relative_eq;

    #[test]
    fn float_matmul_matches_naive() {
        let n = 3;
        let d = 2;
        let w = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = vec![1.0, 1.0, 1.0];
        let mut xout = vec![0.0; d];
        matmul_range(&mut xout, &x, &w, n, d, 0, d).unwrap();
        assert_eq!(xout, vec![6.0, 15.0]);
    }

    #[test]
    fn quantized_matmul_is_close_to_float() {
        let n = 8;
        let d = 2;
        let group_size = 4;
        let w: Vec<f32> = (0..n * d).map(|i| (i as f32 * 0.1) - 1.0).collect();
        let x: Vec<f32> = (0..n).map(|i| (i as f32 * 0.3) - 0.5).collect();

        let mut expected = vec![0.0; d];
        matmul_range(&mut expected, &x, &w, n, d, 0, d).unwrap();

        let qw = quantize(&w, group_size).unwrap();
        let qx = quantize(&x, group_size).unwrap();
        let mut actual = vec![0.0; d];
        matmul_qt_range(
            &mut actual,
            &qx.q,
            &qx.s,
            &qw.q,
            &qw.s,
            n,
            d,
            group_size,
            0,
            d,
        )
        .unwrap();

        for (a, b) in expected.iter().zip(actual.iter()) {
            assert_relative_eq!(a, b, epsilon = 0.2);
        }
    }

    #[test]
    fn row_band_computes_only_its_own_rows() {
        let n = 2;
        let d = 4;
        let w = vec![1.0; n * d];
        let x = vec![1.0, 1.0];
        let mut band = vec![-1.0; 2];
        matmul_range(&mut band, &x, &w, n, d, 1, 3).unwrap();
        assert_eq!(band, vec![2.0, 2.0]);
    }

    #[test]
    fn mismatched_band_length_is_rejected() {
        let n = 2;
        let d = 4;
        let w = vec![1.0; n * d];
        let x = vec![1.0, 1.0];
        let mut xout = vec![0.0; d];
        assert!(matmul_range(&mut xout, &x, &w, n, d, 1, 3).is_err());
    }
}

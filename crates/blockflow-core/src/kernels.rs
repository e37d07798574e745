//! Tile kernels
//!
//! Reference implementations of the per-tile operations the pipelines are
//! built from. They work in logical coordinates through [`TileRef`] and
//! [`TileMut`], so transposed and conjugate-transposed operands need no copies.

use crate::error::{Error, Result};
use crate::layout::{Diag, Side, Uplo};
use crate::numeric::Scalar;
use crate::tile::{Tile, TileMut, TileRef};

fn check(expected: usize, actual: usize, context: &str) -> Result<()> {
    if expected != actual {
        return Err(Error::size_mismatch(expected, actual, context));
    }
    Ok(())
}

/// `C = alpha * A * B + beta * C`
///
/// With `beta == 0` the previous contents of `C` are not read.
pub fn gemm<T: Scalar>(
    alpha: T,
    a: TileRef<'_, T>,
    b: TileRef<'_, T>,
    beta: T,
    c: &mut TileMut<'_, T>,
) -> Result<()> {
    check(c.rows(), a.rows(), "gemm rows")?;
    check(c.cols(), b.cols(), "gemm columns")?;
    check(a.cols(), b.rows(), "gemm inner dimension")?;
    for j in 0..c.cols() {
        for i in 0..c.rows() {
            let mut sum = T::zero();
            for l in 0..a.cols() {
                sum += a.get(i, l) * b.get(l, j);
            }
            let value = if beta == T::zero() {
                alpha * sum
            } else {
                alpha * sum + beta * c.get(i, j)
            };
            c.set(i, j, value);
        }
    }
    Ok(())
}

/// `C = beta * C`
pub fn scale<T: Scalar>(beta: T, c: &mut TileMut<'_, T>) {
    if beta == T::one() {
        return;
    }
    for j in 0..c.cols() {
        for i in 0..c.rows() {
            let value = if beta == T::zero() {
                T::zero()
            } else {
                beta * c.get(i, j)
            };
            c.set(i, j, value);
        }
    }
}

/// Triangular solve with one tile
///
/// `Left`: `B = alpha * A^-1 * B`; `Right`: `B = alpha * B * A^-1`. Only the
/// `uplo` triangle of the leading square block of `A` is read; with
/// `Diag::Unit` its diagonal is not read either.
pub fn trsm<T: Scalar>(
    side: Side,
    uplo: Uplo,
    diag: Diag,
    alpha: T,
    a: TileRef<'_, T>,
    b: &mut TileMut<'_, T>,
) -> Result<()> {
    let n = match side {
        Side::Left => b.rows(),
        Side::Right => b.cols(),
    };
    if a.rows() < n || a.cols() < n {
        return Err(Error::size_mismatch(n, a.rows().min(a.cols()), "trsm triangular tile"));
    }
    let pivot = |k: usize| match diag {
        Diag::Unit => T::one(),
        Diag::NonUnit => a.get(k, k),
    };
    match side {
        Side::Left => {
            for c in 0..b.cols() {
                let order: Box<dyn Iterator<Item = usize>> = match uplo {
                    Uplo::Lower => Box::new(0..n),
                    Uplo::Upper => Box::new((0..n).rev()),
                };
                for r in order {
                    let mut x = alpha * b.get(r, c);
                    let terms = match uplo {
                        Uplo::Lower => 0..r,
                        Uplo::Upper => r + 1..n,
                    };
                    for t in terms {
                        x -= a.get(r, t) * b.get(t, c);
                    }
                    b.set(r, c, x / pivot(r));
                }
            }
        }
        Side::Right => {
            for r in 0..b.rows() {
                let order: Box<dyn Iterator<Item = usize>> = match uplo {
                    Uplo::Upper => Box::new(0..n),
                    Uplo::Lower => Box::new((0..n).rev()),
                };
                for c in order {
                    let mut x = alpha * b.get(r, c);
                    let terms = match uplo {
                        Uplo::Upper => 0..c,
                        Uplo::Lower => c + 1..n,
                    };
                    for t in terms {
                        x -= b.get(r, t) * a.get(t, c);
                    }
                    b.set(r, c, x / pivot(c));
                }
            }
        }
    }
    Ok(())
}

/// `B = B * U^-1` for the upper factor of a packed LU tile
///
/// Columns whose pivot is exactly zero are left unscaled, matching what
/// partial pivoting leaves in a singular panel.
pub fn trsm_lu_lower<T: Scalar>(u: TileRef<'_, T>, b: &mut TileMut<'_, T>) -> Result<()> {
    let n = b.cols();
    if u.rows() < n || u.cols() != n {
        return Err(Error::size_mismatch(n, u.cols(), "packed LU tile columns"));
    }
    for r in 0..b.rows() {
        for c in 0..n {
            let mut x = b.get(r, c);
            for t in 0..c {
                x -= b.get(r, t) * u.get(t, c);
            }
            let pivot = u.get(c, c);
            b.set(r, c, if pivot == T::zero() { x } else { x / pivot });
        }
    }
    Ok(())
}

/// Copy `src` into `dst`
pub fn copy<T: Scalar>(src: TileRef<'_, T>, dst: &mut TileMut<'_, T>) -> Result<()> {
    check(dst.rows(), src.rows(), "copy rows")?;
    check(dst.cols(), src.cols(), "copy columns")?;
    for j in 0..src.cols() {
        for i in 0..src.rows() {
            dst.set(i, j, src.get(i, j));
        }
    }
    Ok(())
}

/// Interchange row `ra` of `a` with row `rb` of `b`
pub fn swap_rows<T: Scalar>(a: &mut Tile<T>, ra: usize, b: &mut Tile<T>, rb: usize) -> Result<()> {
    check(a.cols(), b.cols(), "row swap width")?;
    for j in 0..a.cols() {
        let tmp = a.get(ra, j);
        a.set(ra, j, b.get(rb, j));
        b.set(rb, j, tmp);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Layout, Op};
    use approx::assert_relative_eq;
    use num_complex::Complex;

    fn tile(rows: usize, cols: usize, values: &[f64]) -> Tile<f64> {
        // values given row by row
        Tile::from_fn(rows, cols, Layout::ColMajor, |i, j| values[i * cols + j])
    }

    #[test]
    fn test_gemm_basic() {
        let a = tile(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = tile(2, 2, &[5.0, 6.0, 7.0, 8.0]);
        let mut c = tile(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        gemm(
            -1.0,
            a.view(Op::NoTrans),
            b.view(Op::NoTrans),
            2.0,
            &mut c.view_mut(Op::NoTrans),
        )
        .unwrap();
        assert_eq!(c.row(0), vec![2.0 - 19.0, 2.0 - 22.0]);
        assert_eq!(c.row(1), vec![2.0 - 43.0, 2.0 - 50.0]);
    }

    #[test]
    fn test_gemm_transposed_operand() {
        let a = tile(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = tile(2, 1, &[1.0, 1.0]);
        let mut c = Tile::zeros(3, 1, Layout::RowMajor);
        gemm(
            1.0,
            a.view(Op::Trans),
            b.view(Op::NoTrans),
            0.0,
            &mut c.view_mut(Op::NoTrans),
        )
        .unwrap();
        assert_eq!(c.data(), &[5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_gemm_dimension_check() {
        let a = Tile::<f64>::zeros(2, 3, Layout::ColMajor);
        let mut c = Tile::<f64>::zeros(2, 2, Layout::ColMajor);
        let err = gemm(
            1.0,
            a.view(Op::NoTrans),
            a.view(Op::NoTrans),
            0.0,
            &mut c.view_mut(Op::NoTrans),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn test_trsm_all_sides() {
        let lower = tile(3, 3, &[2.0, 0.0, 0.0, 1.0, 3.0, 0.0, -1.0, 2.0, 4.0]);
        let x = tile(3, 2, &[1.0, 2.0, -1.0, 0.5, 3.0, 1.0]);
        let cases = [
            (Side::Left, Uplo::Lower, Op::NoTrans),
            (Side::Left, Uplo::Upper, Op::Trans),
        ];
        for (side, uplo, op) in cases {
            // b = A x, then solve
            let mut b = Tile::zeros(3, 2, Layout::ColMajor);
            gemm(1.0, lower.view(op), x.view(Op::NoTrans), 0.0, &mut b.view_mut(Op::NoTrans))
                .unwrap();
            trsm(side, uplo, Diag::NonUnit, 1.0, lower.view(op), &mut b.view_mut(Op::NoTrans))
                .unwrap();
            for i in 0..3 {
                for j in 0..2 {
                    assert_relative_eq!(b.get(i, j), x.get(i, j), epsilon = 1e-12);
                }
            }
        }

        let xr = tile(2, 3, &[1.0, 2.0, -1.0, 0.5, 3.0, 1.0]);
        for (uplo, op) in [(Uplo::Lower, Op::NoTrans), (Uplo::Upper, Op::Trans)] {
            let mut b = Tile::zeros(2, 3, Layout::ColMajor);
            gemm(1.0, xr.view(Op::NoTrans), lower.view(op), 0.0, &mut b.view_mut(Op::NoTrans))
                .unwrap();
            trsm(Side::Right, uplo, Diag::NonUnit, 1.0, lower.view(op), &mut b.view_mut(Op::NoTrans))
                .unwrap();
            for i in 0..2 {
                for j in 0..3 {
                    assert_relative_eq!(b.get(i, j), xr.get(i, j), epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_trsm_unit_ignores_diagonal() {
        let a = tile(2, 2, &[9.0, 0.0, 2.0, 9.0]);
        let mut b = tile(2, 1, &[1.0, 4.0]);
        trsm(Side::Left, Uplo::Lower, Diag::Unit, 2.0, a.view(Op::NoTrans), &mut b.view_mut(Op::NoTrans))
            .unwrap();
        assert_eq!(b.get(0, 0), 2.0);
        assert_eq!(b.get(1, 0), 8.0 - 4.0);
    }

    #[test]
    fn test_trsm_complex_conj_trans() {
        let a = Tile::from_fn(2, 2, Layout::ColMajor, |i, j| {
            if i >= j {
                Complex::new(1.0 + i as f64, j as f64 - 0.5)
            } else {
                Complex::new(0.0, 0.0)
            }
        });
        let x = Tile::from_fn(2, 1, Layout::ColMajor, |i, _| Complex::new(i as f64, 1.0));
        let mut b = Tile::zeros(2, 1, Layout::ColMajor);
        gemm(
            Complex::new(1.0, 0.0),
            a.view(Op::ConjTrans),
            x.view(Op::NoTrans),
            Complex::new(0.0, 0.0),
            &mut b.view_mut(Op::NoTrans),
        )
        .unwrap();
        trsm(
            Side::Left,
            Uplo::Upper,
            Diag::NonUnit,
            Complex::new(1.0, 0.0),
            a.view(Op::ConjTrans),
            &mut b.view_mut(Op::NoTrans),
        )
        .unwrap();
        for i in 0..2 {
            assert_relative_eq!(b.get(i, 0).re, x.get(i, 0).re, epsilon = 1e-12);
            assert_relative_eq!(b.get(i, 0).im, x.get(i, 0).im, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_trsm_leading_block_of_wide_tile() {
        let a = tile(1, 3, &[2.0, 7.0, 7.0]);
        let mut b = tile(1, 2, &[4.0, 6.0]);
        trsm(Side::Left, Uplo::Lower, Diag::NonUnit, 1.0, a.view(Op::NoTrans), &mut b.view_mut(Op::NoTrans))
            .unwrap();
        assert_eq!(b.row(0), vec![2.0, 3.0]);
        let mut too_tall = Tile::<f64>::zeros(2, 1, Layout::ColMajor);
        assert!(trsm(Side::Left, Uplo::Lower, Diag::Unit, 1.0, a.view(Op::NoTrans), &mut too_tall.view_mut(Op::NoTrans))
            .is_err());
    }

    #[test]
    fn test_lu_lower_skips_zero_pivot() {
        let u = tile(2, 2, &[2.0, 1.0, 0.0, 0.0]);
        let mut b = tile(1, 2, &[4.0, 3.0]);
        trsm_lu_lower(u.view(Op::NoTrans), &mut b.view_mut(Op::NoTrans)).unwrap();
        assert_eq!(b.get(0, 0), 2.0);
        assert_eq!(b.get(0, 1), 1.0);
    }

    #[test]
    fn test_swap_rows_between_tiles() {
        let mut a = tile(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let mut b = Tile::from_fn(2, 2, Layout::RowMajor, |i, j| 10.0 * (i + 1) as f64 + j as f64);
        swap_rows(&mut a, 1, &mut b, 0).unwrap();
        assert_eq!(a.row(1), vec![10.0, 11.0]);
        assert_eq!(b.row(0), vec![3.0, 4.0]);
    }

    #[test]
    fn test_scale_and_copy() {
        let src = tile(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let mut dst = Tile::zeros(2, 2, Layout::RowMajor);
        copy(src.view(Op::Trans), &mut dst.view_mut(Op::NoTrans)).unwrap();
        assert_eq!(dst.row(0), vec![1.0, 3.0]);
        scale(0.5, &mut dst.view_mut(Op::NoTrans));
        assert_eq!(dst.row(1), vec![1.0, 2.0]);
    }
}

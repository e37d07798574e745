//! Sweep order and the lookahead window
//!
//! A [`Sweep`] lists the block indices in the order the panels visit them.
//! After the panel of step `s`, the next `lookahead` indices form the window
//! that is updated eagerly at high priority; everything after that is left to
//! the trailing engine.

use crate::trailing::Contribution;
use blockflow_core::{ParallelEngine, Result, Scalar, Target, Uplo};
use std::ops::Range;

/// Panel order of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sweep {
    order: Vec<usize>,
    lookahead: usize,
}

impl Sweep {
    /// `0, 1, ..., n - 1`
    pub fn forward(n: usize, lookahead: usize) -> Self {
        Self {
            order: (0..n).collect(),
            lookahead,
        }
    }

    /// `n - 1, ..., 1, 0`
    pub fn backward(n: usize, lookahead: usize) -> Self {
        Self {
            order: (0..n).rev().collect(),
            lookahead,
        }
    }

    /// Lower triangular operands are swept top-down, upper ones bottom-up
    pub fn for_uplo(uplo: Uplo, n: usize, lookahead: usize) -> Self {
        match uplo {
            Uplo::Lower => Self::forward(n, lookahead),
            Uplo::Upper => Self::backward(n, lookahead),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    /// Block index of step `s`
    pub fn index(&self, s: usize) -> usize {
        self.order[s]
    }

    pub fn indices(&self) -> &[usize] {
        &self.order
    }

    /// Indices still to be visited after step `s`
    pub fn rest(&self, s: usize) -> &[usize] {
        &self.order[s + 1..]
    }

    /// Indices updated eagerly after step `s`
    pub fn window(&self, s: usize) -> &[usize] {
        let rest = self.rest(s);
        &rest[..self.lookahead.min(rest.len())]
    }

    /// Indices left to the trailing update of step `s`
    pub fn trailing(&self, s: usize) -> &[usize] {
        let rest = self.rest(s);
        &rest[self.lookahead.min(rest.len())..]
    }

    /// The trailing indices as a contiguous range
    pub fn trailing_range(&self, s: usize) -> Range<usize> {
        let trailing = self.trailing(s);
        match (trailing.iter().min(), trailing.iter().max()) {
            (Some(&lo), Some(&hi)) => lo..hi + 1,
            _ => 0..0,
        }
    }

    /// Scale applied at step `s`: `alpha` on the first step, one afterwards
    pub fn multiplier<T: Scalar>(&self, s: usize, alpha: T) -> T {
        if s == 0 {
            alpha
        } else {
            T::one()
        }
    }
}

/// Update one window entry right after the panel
///
/// Host targets always run one task per tile here; the window is small and
/// sits on the critical path.
pub fn lookahead_update<T: Scalar>(
    contribution: &Contribution<'_, T>,
    target: Target,
    engine: &ParallelEngine,
) -> Result<usize> {
    let target = if target.is_device() {
        Target::Devices
    } else {
        Target::HostTask
    };
    let updated = contribution.apply_updates(target, engine)?;
    tracing::trace!(step = contribution.k, updated, "lookahead update");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_window() {
        let sweep = Sweep::forward(6, 2);
        assert_eq!(sweep.window(0), &[1, 2]);
        assert_eq!(sweep.trailing(0), &[3, 4, 5]);
        assert_eq!(sweep.trailing_range(0), 3..6);
        assert_eq!(sweep.window(4), &[5]);
        assert!(sweep.trailing(4).is_empty());
        assert_eq!(sweep.trailing_range(4), 0..0);
        assert!(sweep.rest(5).is_empty());
    }

    #[test]
    fn test_backward_window() {
        let sweep = Sweep::for_uplo(Uplo::Upper, 5, 1);
        assert_eq!(sweep.index(0), 4);
        assert_eq!(sweep.window(0), &[3]);
        assert_eq!(sweep.trailing(0), &[2, 1, 0]);
        assert_eq!(sweep.trailing_range(0), 0..3);
    }

    #[test]
    fn test_zero_lookahead() {
        let sweep = Sweep::forward(3, 0);
        assert!(sweep.window(0).is_empty());
        assert_eq!(sweep.trailing(0), &[1, 2]);
    }

    #[test]
    fn test_multiplier_applied_once() {
        let sweep = Sweep::backward(4, 1);
        let scales: Vec<f64> = (0..sweep.len()).map(|s| sweep.multiplier(s, 3.0)).collect();
        assert_eq!(scales, vec![3.0, 1.0, 1.0, 1.0]);
    }
}

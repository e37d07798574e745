//! BLAS-style enumerations shared by kernels, views and pipelines

use serde::{Deserialize, Serialize};

/// Storage order of a tile buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Column-major (host default)
    ColMajor,
    /// Row-major (device default, contiguous rows make swaps cheap)
    RowMajor,
}

/// Logical transposition applied when reading or writing a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    NoTrans,
    Trans,
    ConjTrans,
}

impl Op {
    /// Compose with a transpose
    pub fn transposed(self) -> Self {
        match self {
            Op::NoTrans => Op::Trans,
            Op::Trans => Op::NoTrans,
            Op::ConjTrans => Op::NoTrans,
        }
    }

    /// Compose with a conjugate transpose
    pub fn conj_transposed(self) -> Self {
        match self {
            Op::NoTrans => Op::ConjTrans,
            Op::ConjTrans => Op::NoTrans,
            // conj(A^T)^T = conj(A); not representable, callers reject it
            Op::Trans => Op::ConjTrans,
        }
    }

    /// Whether rows and columns are swapped
    #[inline]
    pub fn swaps_indices(self) -> bool {
        !matches!(self, Op::NoTrans)
    }

    /// Whether values are conjugated
    #[inline]
    pub fn conjugates(self) -> bool {
        matches!(self, Op::ConjTrans)
    }
}

/// Triangle of a triangular operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uplo {
    Lower,
    Upper,
}

impl Uplo {
    /// The triangle seen through a transposition
    pub fn flip(self) -> Self {
        match self {
            Uplo::Lower => Uplo::Upper,
            Uplo::Upper => Uplo::Lower,
        }
    }
}

/// Whether the diagonal of a triangular operand is implicitly one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Diag {
    Unit,
    NonUnit,
}

/// Side on which the triangular operand is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

/// Direction in which row interchanges are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

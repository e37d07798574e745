//! Pivot records and row interchanges
//!
//! The diagonal owner of block-column `k` decides the interchanges of the
//! panel and publishes them to every rank with the transport's collective
//! broadcast. Each rank then applies the interchanges to the tiles it owns;
//! a swap between rows held by two different ranks becomes a pairwise row
//! exchange. Swaps of already factored columns are deferred until the
//! pipeline has finished.

use crate::broadcast::relabel;
use blockflow_core::{
    Channel, Error, MatrixView, Placement, Result, Scalar, Tag, Transport,
};
use bytemuck::{Pod, Zeroable};

/// One interchange: panel row `c` of step `k` swaps with `(tile_row, offset)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pivot {
    pub tile_row: usize,
    pub offset: usize,
}

impl Pivot {
    pub fn new(tile_row: usize, offset: usize) -> Self {
        Self { tile_row, offset }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct WireHeader {
    count: u64,
    /// `u64::MAX` when every pivot is nonzero
    zero_pivot: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct WirePivot {
    tile_row: u64,
    offset: u64,
}

/// Pivot records of one panel as they travel between ranks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanelPivots {
    pub pivots: Vec<Pivot>,
    /// Global row of the first exactly-zero pivot of the panel
    pub zero_pivot: Option<usize>,
}

impl PanelPivots {
    pub fn encode(&self) -> Vec<u8> {
        let header = WireHeader {
            count: self.pivots.len() as u64,
            zero_pivot: self.zero_pivot.map_or(u64::MAX, |row| row as u64),
        };
        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        for pivot in &self.pivots {
            let record = WirePivot {
                tile_row: pivot.tile_row as u64,
                offset: pivot.offset as u64,
            };
            bytes.extend_from_slice(bytemuck::bytes_of(&record));
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header_len = std::mem::size_of::<WireHeader>();
        let record_len = std::mem::size_of::<WirePivot>();
        if bytes.len() < header_len {
            return Err(Error::size_mismatch(header_len, bytes.len(), "pivot header"));
        }
        let header: WireHeader = bytemuck::pod_read_unaligned(&bytes[..header_len]);
        let count = header.count as usize;
        let expected = header_len + count * record_len;
        if bytes.len() != expected {
            return Err(Error::size_mismatch(expected, bytes.len(), "pivot records"));
        }
        let pivots = bytes[header_len..]
            .chunks_exact(record_len)
            .map(|chunk| {
                let record: WirePivot = bytemuck::pod_read_unaligned(chunk);
                Pivot::new(record.tile_row as usize, record.offset as usize)
            })
            .collect();
        let zero_pivot = (header.zero_pivot != u64::MAX).then_some(header.zero_pivot as usize);
        Ok(Self { pivots, zero_pivot })
    }
}

/// Publish the diagonal owner's pivots of step `k` to every rank
///
/// `local` must be `Some` exactly on `root`.
pub fn exchange_pivots(
    transport: &dyn Transport,
    root: usize,
    k: usize,
    local: Option<&PanelPivots>,
) -> Result<PanelPivots> {
    let tag = Tag::new(k, Channel::Pivot, 0, 0);
    let payload = local.map(PanelPivots::encode).unwrap_or_default();
    let bytes = transport.broadcast_all(root, tag, payload)?;
    PanelPivots::decode(&bytes)
}

/// Pivot table of a whole factorization, indexed by block-column
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pivots {
    steps: Vec<Vec<Pivot>>,
    row_offsets: Vec<usize>,
}

impl Pivots {
    /// `tile_rows[i]` is the height of block-row `i`
    pub fn new(steps: Vec<Vec<Pivot>>, tile_rows: &[usize]) -> Self {
        let mut row_offsets = Vec::with_capacity(tile_rows.len() + 1);
        let mut offset = 0;
        row_offsets.push(0);
        for rows in tile_rows {
            offset += rows;
            row_offsets.push(offset);
        }
        Self { steps, row_offsets }
    }

    /// Number of factored block-columns
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, k: usize) -> &[Pivot] {
        &self.steps[k]
    }

    pub fn steps(&self) -> &[Vec<Pivot>] {
        &self.steps
    }

    /// LAPACK-style interchange vector: row `r` was swapped with `ipiv[r]`
    pub fn to_ipiv(&self) -> Vec<usize> {
        let mut ipiv = Vec::new();
        for step in &self.steps {
            for pivot in step {
                ipiv.push(self.row_offsets[pivot.tile_row] + pivot.offset);
            }
        }
        ipiv
    }

    /// Row permutation of an `m`-row matrix: row `r` of `P * A` is row `perm[r]` of `A`
    pub fn permutation(&self, m: usize) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..m).collect();
        for (row, target) in self.to_ipiv().into_iter().enumerate() {
            if row < m && target < m {
                perm.swap(row, target);
            }
        }
        perm
    }
}

fn encode_row<T: Scalar>(row: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(row).to_vec()
}

fn decode_row<T: Scalar>(bytes: &[u8], len: usize) -> Result<Vec<T>> {
    let expected = len * std::mem::size_of::<T>();
    if bytes.len() != expected {
        return Err(Error::size_mismatch(expected, bytes.len(), "row exchange"));
    }
    Ok(bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

fn read_row<T: Scalar>(a: &MatrixView<T>, i: usize, j: usize, r: usize) -> Result<Vec<T>> {
    let tile = a.read(i, j)?;
    let view = tile.view(a.op());
    Ok((0..view.cols()).map(|c| view.get(r, c)).collect())
}

fn write_row<T: Scalar>(a: &MatrixView<T>, i: usize, j: usize, r: usize, row: &[T]) -> Result<()> {
    a.update(i, j, Placement::InPlace, |t| {
        for (c, &value) in row.iter().enumerate() {
            t.set(r, c, value);
        }
    })
}

/// Which message family and offset a permutation pass uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapPass {
    pub stage: usize,
    pub channel: Channel,
    pub offset: usize,
}

impl SwapPass {
    pub fn new(stage: usize, channel: Channel, offset: usize) -> Self {
        Self {
            stage,
            channel,
            offset,
        }
    }
}

/// Apply the interchanges of step `k` to block-column `j` of `a`
///
/// Every rank calls this with the same arguments; each applies the swaps
/// touching its own tiles, in pivot order. Returns the rows this rank
/// rewrote.
pub fn permute_rows<T: Scalar>(
    a: &MatrixView<T>,
    k: usize,
    pivots: &[Pivot],
    j: usize,
    pass: SwapPass,
    transport: &dyn Transport,
) -> Result<usize> {
    let me = transport.rank();
    let mut rewritten = 0;
    for (c, pivot) in pivots.iter().enumerate() {
        let (ti, r) = (pivot.tile_row, pivot.offset);
        if (ti, r) == (k, c) {
            continue;
        }
        match (a.tile_exists(k, j), a.tile_exists(ti, j)) {
            (false, false) => continue,
            (true, true) => {}
            (false, true) => return Err(Error::TileUnavailable { row: k, col: j, rank: me }),
            (true, false) => return Err(Error::TileUnavailable { row: ti, col: j, rank: me }),
        }
        let (top, other) = (a.tile_rank(k, j), a.tile_rank(ti, j));
        if top == other {
            if top != me {
                continue;
            }
            if ti == k {
                a.update(k, j, Placement::InPlace, |t| {
                    for col in 0..t.cols() {
                        let tmp = t.get(c, col);
                        t.set(c, col, t.get(r, col));
                        t.set(r, col, tmp);
                    }
                })?;
            } else {
                let upper = read_row(a, k, j, c)?;
                let lower = read_row(a, ti, j, r)?;
                write_row(a, k, j, c, &lower)?;
                write_row(a, ti, j, r, &upper)?;
            }
            rewritten += 2;
            continue;
        }

        let (mine, peer) = if me == top {
            ((k, c), other)
        } else if me == other {
            ((ti, r), top)
        } else {
            continue;
        };
        let tag = Tag::new(pass.stage, pass.channel, pass.offset, c * a.nt() + j);
        let row = read_row(a, mine.0, j, mine.1)?;
        let len = row.len();
        transport
            .send(peer, tag, encode_row(&row))
            .map_err(|e| relabel(e, "row exchange", pass.stage))?;
        let bytes = transport
            .recv(peer, tag)
            .map_err(|e| relabel(e, "row exchange", pass.stage))?;
        write_row(a, mine.0, j, mine.1, &decode_row(&bytes, len)?)?;
        rewritten += 1;
    }
    Ok(rewritten)
}

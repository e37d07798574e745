//! Tile broadcast director
//!
//! A [`Directive`] pushes one freshly produced tile to every rank that owns a
//! tile consuming it. Consumers are described as groups of destination
//! tiles; each group is one independent consumer round, so a receiving
//! rank's copy gets one unit of life per group in which it owns an existing
//! destination tile. Consumers tick the copy once per round and the copy is
//! reclaimed when its life runs out.

use blockflow_core::{
    Channel, Error, Layout, MatrixView, Result, Scalar, Tag, Tile, Transport,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::Range;

/// Rectangle of destination tiles, in destination view coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRange {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl TileRange {
    pub fn new(rows: Range<usize>, cols: Range<usize>) -> Self {
        Self { rows, cols }
    }

    /// Single tile
    pub fn tile(i: usize, j: usize) -> Self {
        Self::new(i..i + 1, j..j + 1)
    }

    pub fn row(i: usize, cols: Range<usize>) -> Self {
        Self::new(i..i + 1, cols)
    }

    pub fn col(rows: Range<usize>, j: usize) -> Self {
        Self::new(rows, j..j + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.cols.is_empty()
    }

    fn tiles(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.cols
            .clone()
            .flat_map(move |j| self.rows.clone().map(move |i| (i, j)))
    }
}

/// One pending tile propagation
#[derive(Debug, Clone)]
pub struct Directive {
    pub tag: Tag,
    /// Source tile in view coordinates
    pub source: (usize, usize),
    pub owner: usize,
    /// Life of the copy on each rank; zero means no copy
    pub lives: Vec<usize>,
    /// Layout the tile travels and lands in
    pub layout: Layout,
}

impl Directive {
    /// Ranks that receive a copy
    pub fn destinations(&self) -> impl Iterator<Item = usize> + '_ {
        self.lives
            .iter()
            .enumerate()
            .filter(move |&(rank, &life)| life > 0 && rank != self.owner)
            .map(|(rank, _)| rank)
    }

    pub fn life(&self, rank: usize) -> usize {
        if rank == self.owner {
            0
        } else {
            self.lives.get(rank).copied().unwrap_or(0)
        }
    }
}

#[derive(Debug, Default)]
struct DirectorState {
    /// In-flight tags per stage with their destination ranks
    in_flight: HashMap<usize, HashMap<Tag, Vec<usize>>>,
    /// Tags this rank has received a copy for
    delivered: HashSet<Tag>,
}

/// Builds and executes broadcast directives for one rank
#[derive(Debug)]
pub struct BroadcastDirector {
    rank: usize,
    state: Mutex<DirectorState>,
}

impl BroadcastDirector {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            state: Mutex::new(DirectorState::default()),
        }
    }

    /// Build the directive sending `source(i, j)` to the consumers in `groups`
    ///
    /// Returns `None` when the source tile does not exist. The tag is derived
    /// from the stage, channel, offset and the source's storage index; a tag
    /// already in flight in this stage towards any of the same ranks is
    /// rejected.
    #[allow(clippy::too_many_arguments)]
    pub fn directive<T: Scalar>(
        &self,
        stage: usize,
        channel: Channel,
        offset: usize,
        source: &MatrixView<T>,
        (i, j): (usize, usize),
        dest: &MatrixView<T>,
        groups: &[TileRange],
        layout: Layout,
    ) -> Result<Option<Directive>> {
        if !source.tile_exists(i, j) {
            return Ok(None);
        }
        let (si, sj) = source.storage_index(i, j);
        let index = si + sj * source.matrix().mt();
        let tag = Tag::new(stage, channel, offset, index);
        let owner = source.tile_rank(i, j);

        let mut lives = vec![0; dest.num_ranks()];
        for group in groups.iter().filter(|g| !g.is_empty()) {
            let mut seen = HashSet::new();
            for (di, dj) in group.tiles() {
                if dest.tile_exists(di, dj) {
                    let rank = dest.tile_rank(di, dj);
                    if seen.insert(rank) {
                        lives[rank] += 1;
                    }
                }
            }
        }

        let directive = Directive {
            tag,
            source: (i, j),
            owner,
            lives,
            layout,
        };
        let ranks: Vec<usize> = directive.destinations().collect();
        let mut state = self.state.lock();
        let stage_tags = state.in_flight.entry(stage).or_default();
        if let Some(existing) = stage_tags.get(&tag) {
            if existing.iter().any(|r| ranks.contains(r)) {
                return Err(Error::Broadcast(format!(
                    "tag {tag} already in flight to overlapping ranks"
                )));
            }
        }
        stage_tags.insert(tag, ranks);
        Ok(Some(directive))
    }

    /// Carry out a directive on this rank; returns the bytes sent
    ///
    /// The owner sends, every destination receives and installs its copy,
    /// other ranks do nothing.
    pub fn execute<T: Scalar>(
        &self,
        directive: &Directive,
        source: &MatrixView<T>,
        transport: &dyn Transport,
    ) -> Result<usize> {
        let (i, j) = directive.source;
        let tag = directive.tag;
        if self.rank == directive.owner {
            let tile = source.read(i, j)?.to_layout(directive.layout);
            let mut sent = 0;
            for dest in directive.destinations() {
                let payload = tile.as_bytes().to_vec();
                sent += payload.len();
                transport
                    .send(dest, tag, payload)
                    .map_err(|e| relabel(e, "tile broadcast", tag.stage))?;
            }
            tracing::trace!(%tag, sent, "tile sent");
            return Ok(sent);
        }

        let life = directive.life(self.rank);
        if life == 0 {
            return Ok(0);
        }
        if !self.state.lock().delivered.insert(tag) {
            return Err(Error::Broadcast(format!(
                "{tag} delivered twice to rank {}",
                self.rank
            )));
        }
        let bytes = transport
            .recv(directive.owner, tag)
            .map_err(|e| relabel(e, "tile broadcast", tag.stage))?;
        let (si, sj) = source.storage_index(i, j);
        let matrix = source.matrix();
        let tile = Tile::from_bytes(matrix.tile_rows(si), matrix.tile_cols(sj), directive.layout, &bytes)?;
        source.install_remote(i, j, tile, life)?;
        tracing::trace!(%tag, life, "tile received");
        Ok(0)
    }

    /// Forget the in-flight tags of a finished stage
    pub fn retire(&self, stage: usize) -> usize {
        self.state
            .lock()
            .in_flight
            .remove(&stage)
            .map(|tags| tags.len())
            .unwrap_or(0)
    }

    /// Stages with directives still registered
    pub fn open_stages(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

/// Attach the pipeline operation name to a transport failure
pub(crate) fn relabel(err: Error, operation: &'static str, stage: usize) -> Error {
    match err {
        Error::Transport { reason, .. } => Error::Transport {
            operation,
            stage,
            reason,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::{BlockCyclic, Distribution, LocalFabric, TiledMatrix};
    use std::sync::Arc;

    fn matrix(p: usize, q: usize, rank: usize) -> TiledMatrix<f64> {
        let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::new(p, q).unwrap());
        let data: Vec<f64> = (0..64).map(|v| v as f64).collect();
        TiledMatrix::from_col_major(8, 8, 2, 2, blockflow_core::Shape::General, &data, 8, dist, rank)
            .unwrap()
    }

    #[test]
    fn test_lives_count_groups() {
        let a = matrix(2, 1, 0).view();
        let director = BroadcastDirector::new(0);
        let groups = [
            TileRange::tile(1, 2),
            TileRange::tile(2, 2),
            TileRange::col(3..4, 2),
        ];
        let directive = director
            .directive(0, Channel::Tile, 1, &a, (0, 2), &a, &groups, Layout::ColMajor)
            .unwrap()
            .unwrap();
        assert_eq!(directive.owner, 0);
        assert_eq!(directive.life(1), 2);
        assert_eq!(directive.life(0), 0);
        assert_eq!(directive.destinations().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_tag_collision_rejected() {
        let a = matrix(2, 1, 0).view();
        let director = BroadcastDirector::new(0);
        let groups = [TileRange::col(1..4, 0)];
        director
            .directive(3, Channel::Tile, 0, &a, (0, 0), &a, &groups, Layout::ColMajor)
            .unwrap();
        let err = director
            .directive(3, Channel::Tile, 0, &a, (0, 0), &a, &groups, Layout::ColMajor)
            .unwrap_err();
        assert!(matches!(err, Error::Broadcast(_)));
        // different offset, different tag
        assert!(director
            .directive(3, Channel::Tile, 1, &a, (0, 0), &a, &groups, Layout::ColMajor)
            .is_ok());
        assert_eq!(director.retire(3), 2);
        assert_eq!(director.open_stages(), 0);
    }

    #[test]
    fn test_broadcast_and_reclaim() {
        let results = LocalFabric::run(2, |ep| {
            let a = matrix(2, 1, ep.rank()).view();
            let director = BroadcastDirector::new(ep.rank());
            let groups = [TileRange::tile(1, 1), TileRange::tile(3, 1)];
            let directive = director
                .directive(0, Channel::Tile, 0, &a, (0, 1), &a, &groups, Layout::RowMajor)
                .unwrap()
                .unwrap();
            director.execute(&directive, &a, &ep).unwrap();
            if ep.rank() == 1 {
                let copy = a.read(0, 1).unwrap();
                assert_eq!(copy.layout(), Layout::RowMajor);
                assert_eq!(copy.get(1, 0), 17.0);
                assert_eq!(a.remote_life(0, 1), Some(2));
                a.tick(0, 1).unwrap();
                a.tick(0, 1).unwrap();
            }
            a.matrix().remote_count()
        });
        assert_eq!(results, vec![0, 0]);
    }

    #[test]
    fn test_duplicate_delivery_rejected() {
        let results = LocalFabric::run(2, |ep| {
            let a = matrix(2, 1, ep.rank()).view();
            let director = BroadcastDirector::new(ep.rank());
            let groups = [TileRange::tile(1, 0)];
            let directive = director
                .directive(0, Channel::Tile, 0, &a, (0, 0), &a, &groups, Layout::ColMajor)
                .unwrap()
                .unwrap();
            director.execute(&directive, &a, &ep).unwrap();
            if ep.rank() == 1 {
                a.tick(0, 0).unwrap();
            }
            // replaying a consumed directive must not install a fresh copy
            director.execute(&directive, &a, &ep)
        });
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Broadcast(_))));
    }

    #[test]
    fn test_missing_source() {
        let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::single());
        let band = TiledMatrix::<f64>::with_shape(
            8,
            8,
            2,
            2,
            blockflow_core::Shape::Band { kl: 1, ku: 1 },
            dist,
            0,
        )
        .unwrap()
        .view();
        let director = BroadcastDirector::new(0);
        let directive = director
            .directive(0, Channel::Tile, 0, &band, (3, 0), &band, &[], Layout::ColMajor)
            .unwrap();
        assert!(directive.is_none());
    }
}

//! Candidate enumeration and sampling.

use crate::entity::ScheduleEntity;
use graphforge_graph::{Subgraph, TensorMeta};

/// Probability that a seeded sample keeps each knob of its seed.
const SEED_KEEP_PROBABILITY: f64 = 0.8;

fn pow2_tiles(dim: usize) -> Vec<usize> {
    let mut tiles = vec![1];
    let mut t = 2;
    while t <= dim.min(128) {
        tiles.push(t);
        t *= 2;
    }
    tiles
}

/// The enumerable knob space for one subgraph.
///
/// Axes are derived from the subgraph's dominant matmul shape; sampling
/// is uniform per axis, or biased toward a seed entity. All randomness
/// flows through the owned RNG so tests can fix a seed.
#[derive(Debug)]
pub struct CandidateSpace {
    tiles_m: Vec<usize>,
    tiles_n: Vec<usize>,
    tiles_k: Vec<usize>,
    vector_widths: Vec<usize>,
    unrolls: Vec<usize>,
    rng: fastrand::Rng,
}

impl CandidateSpace {
    pub fn for_subgraph(subgraph: &Subgraph, metas: &[TensorMeta]) -> Self {
        let (m, n, k) = subgraph.dominant_matmul(metas).unwrap_or((64, 64, 64));
        Self {
            tiles_m: pow2_tiles(m),
            tiles_n: pow2_tiles(n),
            tiles_k: pow2_tiles(k),
            vector_widths: vec![1, 4, 8, 16],
            unrolls: vec![1, 2, 4, 8],
            rng: fastrand::Rng::new(),
        }
    }

    /// Fix the sampling RNG for reproducible runs.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = fastrand::Rng::with_seed(seed);
    }

    /// Number of distinct entities in the space.
    pub fn size(&self) -> u64 {
        [
            self.tiles_m.len(),
            self.tiles_n.len(),
            self.tiles_k.len(),
            self.vector_widths.len(),
            self.unrolls.len(),
            2,
        ]
        .iter()
        .map(|&len| len as u64)
        .product()
    }

    fn pick(rng: &mut fastrand::Rng, axis: &[usize]) -> usize {
        axis[rng.usize(..axis.len())]
    }

    /// Uniform sample from the full space.
    pub fn choose_one(&mut self) -> ScheduleEntity {
        let rng = &mut self.rng;
        ScheduleEntity {
            tile_m: Self::pick(rng, &self.tiles_m),
            tile_n: Self::pick(rng, &self.tiles_n),
            tile_k: Self::pick(rng, &self.tiles_k),
            vector_width: Self::pick(rng, &self.vector_widths),
            unroll: Self::pick(rng, &self.unrolls),
            fuse: rng.bool(),
        }
    }

    /// Sample from the mutation neighborhood of `seed`: each knob is kept
    /// with high probability and resampled otherwise, so results cluster
    /// near the seed but occasionally land far away.
    pub fn choose_one_with_seed(&mut self, seed: &ScheduleEntity) -> ScheduleEntity {
        let rng = &mut self.rng;
        let mut keep = |kept: usize, axis: &[usize]| -> usize {
            if rng.f64() < SEED_KEEP_PROBABILITY {
                kept
            } else {
                Self::pick(rng, axis)
            }
        };
        let tile_m = keep(seed.tile_m, &self.tiles_m);
        let tile_n = keep(seed.tile_n, &self.tiles_n);
        let tile_k = keep(seed.tile_k, &self.tiles_k);
        let vector_width = keep(seed.vector_width, &self.vector_widths);
        let unroll = keep(seed.unroll, &self.unrolls);
        let fuse = if rng.f64() < SEED_KEEP_PROBABILITY {
            seed.fuse
        } else {
            rng.bool()
        };
        ScheduleEntity {
            tile_m,
            tile_n,
            tile_k,
            vector_width,
            unroll,
            fuse,
        }
    }
}

//! Schedule entities: points in the knob space.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One point of the schedule space: a complete knob assignment.
///
/// Entities are immutable values; equality and hashing cover all knobs.
/// The textual form round-trips through [`ScheduleEntity::parse`] and is
/// embedded in reference files, so it must not contain `|`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleEntity {
    pub tile_m: usize,
    pub tile_n: usize,
    pub tile_k: usize,
    pub vector_width: usize,
    pub unroll: usize,
    pub fuse: bool,
}

impl ScheduleEntity {
    pub fn parse(text: &str) -> Result<Self> {
        let mut entity = ScheduleEntity {
            tile_m: 0,
            tile_n: 0,
            tile_k: 0,
            vector_width: 0,
            unroll: 0,
            fuse: false,
        };
        let mut seen = 0u8;
        for field in text.split(';') {
            let (key, value) = field
                .split_once('=')
                .with_context(|| format!("bad entity field {field:?}"))?;
            let parsed: usize = value
                .parse()
                .with_context(|| format!("bad entity value {value:?}"))?;
            match key {
                "tm" => entity.tile_m = parsed,
                "tn" => entity.tile_n = parsed,
                "tk" => entity.tile_k = parsed,
                "vw" => entity.vector_width = parsed,
                "ur" => entity.unroll = parsed,
                "fs" => entity.fuse = parsed != 0,
                other => bail!("unknown entity field {other:?}"),
            }
            seen += 1;
        }
        if seen != 6 {
            bail!("entity {text:?} has {seen} fields, expected 6");
        }
        Ok(entity)
    }
}

impl std::fmt::Display for ScheduleEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tm={};tn={};tk={};vw={};ur={};fs={}",
            self.tile_m,
            self.tile_n,
            self.tile_k,
            self.vector_width,
            self.unroll,
            self.fuse as usize
        )
    }
}

//! `walkmap`: walkable-tile grid + pathfinding for office maps.
//!
//! The map ships as a tile-map document (tilesets + tile layers + object
//! layers). We rasterise everything that blocks movement into a dense
//! `height x width` grid of 0 (walkable) / 1 (blocked), then run A* over it.
//! A precomputed grid sidecar can be loaded instead, but only if its hashes
//! prove it was generated from exactly this map.

mod grid;
mod path;
mod tilemap;

pub use grid::{build_grid, validate_precomputed, Grid, PrecomputedGrid};
pub use path::WalkableMap;
pub use tilemap::TileMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalkmapError {
    #[error("malformed tile map: {0}")]
    MalformedMap(String),
    #[error("precomputed grid dimensions {got_w}x{got_h} do not match map {want_w}x{want_h}")]
    DimensionMismatch {
        got_w: usize,
        got_h: usize,
        want_w: usize,
        want_h: usize,
    },
    #[error("precomputed grid tile size {got_w}x{got_h} does not match map {want_w}x{want_h}")]
    TileSizeMismatch {
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },
    #[error("map hash mismatch: sidecar was generated from a different map file")]
    MapHashMismatch,
    #[error("grid hash mismatch: sidecar grid does not match its recorded hash")]
    GridHashMismatch,
}

//! A* over the walkability grid.

use std::collections::{HashMap, HashSet};

use crate::grid::{build_grid, validate_precomputed, Grid, PrecomputedGrid};
use crate::tilemap::TileMap;
use crate::WalkmapError;

/// A loaded map ready for pathfinding queries.
///
/// Queries are synchronous and CPU-bound; callers on an async runtime should
/// dispatch them to a blocking executor.
#[derive(Debug, Clone)]
pub struct WalkableMap {
    grid: Grid,
}

#[derive(Debug, Clone, Copy)]
struct OpenNode {
    g: u32,
    f: u32,
    /// Discovery order, used to break f-score ties deterministically.
    order: u64,
}

impl WalkableMap {
    pub fn from_grid(grid: Grid) -> Self {
        Self { grid }
    }

    /// Build the grid from the tile-map document.
    pub fn from_map_bytes(map_bytes: &[u8]) -> Result<Self, WalkmapError> {
        let map = TileMap::parse(map_bytes)?;
        Ok(Self {
            grid: build_grid(&map)?,
        })
    }

    /// Load from a precomputed sidecar, verifying it against the map file.
    /// On any mismatch this fails; callers fall back to `from_map_bytes`.
    pub fn from_precomputed(
        pre: &PrecomputedGrid,
        map_bytes: &[u8],
    ) -> Result<Self, WalkmapError> {
        let map = TileMap::parse(map_bytes)?;
        Ok(Self {
            grid: validate_precomputed(pre, &map, map_bytes)?,
        })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn tile_at(&self, px: f64, py: f64) -> (usize, usize) {
        let tx = (px / self.grid.tile_width as f64).floor();
        let ty = (py / self.grid.tile_height as f64).floor();
        (
            (tx.max(0.0) as usize).min(self.grid.width - 1),
            (ty.max(0.0) as usize).min(self.grid.height - 1),
        )
    }

    fn center(&self, tile: (usize, usize)) -> (f64, f64) {
        (
            (tile.0 as f64 + 0.5) * self.grid.tile_width as f64,
            (tile.1 as f64 + 0.5) * self.grid.tile_height as f64,
        )
    }

    /// A* from a start pixel to a target pixel. Returns centre-pixel
    /// waypoints for every tile on the path (start tile included), or `None`
    /// when the target is unreachable.
    pub fn find_path(&self, start: (f64, f64), target: (f64, f64)) -> Option<Vec<(f64, f64)>> {
        let start_tile = self.tile_at(start.0, start.1);
        let goal_tile = self.tile_at(target.0, target.1);
        if start_tile == goal_tile {
            return Some(vec![self.center(goal_tile)]);
        }

        let mut open: HashMap<(usize, usize), OpenNode> = HashMap::new();
        let mut came_from: HashMap<(usize, usize), (usize, usize)> = HashMap::new();
        let mut closed: HashSet<(usize, usize)> = HashSet::new();
        let mut order = 0u64;

        open.insert(
            start_tile,
            OpenNode {
                g: 0,
                f: manhattan(start_tile, goal_tile),
                order,
            },
        );

        while !open.is_empty() {
            // Lowest f wins; earlier discovery breaks ties.
            let current = *open
                .iter()
                .min_by_key(|(_, n)| (n.f, n.order))
                .map(|(pos, _)| pos)
                .expect("open set is non-empty");
            let node = open.remove(&current).expect("current is in the open set");

            if current == goal_tile {
                return Some(self.reconstruct(&came_from, current));
            }
            closed.insert(current);

            for next in self.neighbors(current) {
                if closed.contains(&next) {
                    continue;
                }
                let g = node.g + 1;
                let better = match open.get(&next) {
                    Some(existing) => g < existing.g,
                    None => true,
                };
                if better {
                    order += 1;
                    came_from.insert(next, current);
                    open.insert(
                        next,
                        OpenNode {
                            g,
                            f: g + manhattan(next, goal_tile),
                            order,
                        },
                    );
                }
            }
        }

        None
    }

    fn neighbors(&self, (x, y): (usize, usize)) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(4);
        if y > 0 && !self.grid.is_blocked(x, y - 1) {
            out.push((x, y - 1));
        }
        if y + 1 < self.grid.height && !self.grid.is_blocked(x, y + 1) {
            out.push((x, y + 1));
        }
        if x > 0 && !self.grid.is_blocked(x - 1, y) {
            out.push((x - 1, y));
        }
        if x + 1 < self.grid.width && !self.grid.is_blocked(x + 1, y) {
            out.push((x + 1, y));
        }
        out
    }

    fn reconstruct(
        &self,
        came_from: &HashMap<(usize, usize), (usize, usize)>,
        goal: (usize, usize),
    ) -> Vec<(f64, f64)> {
        let mut tiles = vec![goal];
        let mut cur = goal;
        while let Some(&prev) = came_from.get(&cur) {
            tiles.push(prev);
            cur = prev;
        }
        tiles.reverse();
        tiles.into_iter().map(|t| self.center(t)).collect()
    }
}

fn manhattan(a: (usize, usize), b: (usize, usize)) -> u32 {
    (a.0.abs_diff(b.0) + a.1.abs_diff(b.1)) as u32
}

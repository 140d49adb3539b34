//! Blocker rasterisation: tile-map document -> dense walkability grid.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tilemap::{MapObject, TileMap};
use crate::WalkmapError;

/// Tile GIDs carry three flip bits in the top of the u32; strip them before
/// comparing against tileset ids.
const GID_MASK: u32 = 0x1FFF_FFFF;

/// Tiles touched only on their right/bottom edge do not count as
/// intersected.
const EDGE_EPS: f64 = 1e-4;

/// Object layers whose contents block movement. Anything else (spawn
/// markers, zones, decals) is ignored.
const BLOCKING_OBJECT_LAYERS: &[&str] = &[
    "Wall",
    "Objects",
    "ObjectsOnCollide",
    "GenericObjects",
    "GenericObjectsOnCollide",
    "Computer",
    "Whiteboard",
    "VendingMachine",
    "Chair",
];

#[derive(Debug, Clone)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    pub tile_width: u32,
    pub tile_height: u32,
    cells: Vec<u8>,
}

impl Grid {
    fn empty(width: usize, height: usize, tile_width: u32, tile_height: u32) -> Self {
        Self {
            width,
            height,
            tile_width,
            tile_height,
            cells: vec![0; width * height],
        }
    }

    pub fn is_blocked(&self, x: usize, y: usize) -> bool {
        x >= self.width || y >= self.height || self.cells[y * self.width + x] != 0
    }

    fn block(&mut self, x: usize, y: usize) {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x] = 1;
        }
    }

    /// Row-major rows of 0/1, as the sidecar generator emits them.
    pub fn rows(&self) -> Vec<Vec<u8>> {
        self.cells
            .chunks(self.width)
            .map(|row| row.to_vec())
            .collect()
    }

    pub fn blocked_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c != 0).count()
    }
}

/// Build the walkability grid from the tile-map document.
pub fn build_grid(map: &TileMap) -> Result<Grid, WalkmapError> {
    if map.width == 0 || map.height == 0 {
        return Err(WalkmapError::MalformedMap("zero-sized map".to_string()));
    }
    let mut grid = Grid::empty(map.width, map.height, map.tile_width, map.tile_height);

    // GIDs whose tileset tile carries collides=true.
    let mut blocking_gids: HashSet<u32> = HashSet::new();
    for ts in &map.tilesets {
        for tile in &ts.tiles {
            if tile.collides() {
                blocking_gids.insert(ts.firstgid + tile.id);
            }
        }
    }

    for layer in &map.layers {
        match layer.kind.as_str() {
            "tilelayer" => {
                for (i, raw) in layer.data.iter().enumerate() {
                    if blocking_gids.contains(&(raw & GID_MASK)) {
                        grid.block(i % map.width, i / map.width);
                    }
                }
            }
            "objectgroup" => {
                if !BLOCKING_OBJECT_LAYERS.contains(&layer.name.as_str()) {
                    continue;
                }
                for obj in &layer.objects {
                    rasterize_object(&mut grid, obj);
                }
            }
            _ => {}
        }
    }

    Ok(grid)
}

fn rasterize_object(grid: &mut Grid, obj: &MapObject) {
    let left = obj.x;
    // Tile objects anchor at their bottom-left corner.
    let top = if obj.gid.is_some() {
        obj.y - obj.height
    } else {
        obj.y
    };

    if let Some(points) = obj.polygon.as_ref() {
        if points.len() >= 3 {
            let verts = points
                .iter()
                .map(|p| rotate_about(obj.x + p.x, obj.y + p.y, obj.x, obj.y, obj.rotation))
                .collect::<Vec<_>>();
            rasterize_polygon(grid, &verts);
        }
        return;
    }

    if obj.ellipse == Some(true) {
        rasterize_ellipse(grid, left, top, obj.width, obj.height);
        return;
    }

    if obj.rotation != 0.0 {
        let verts = [
            (left, top),
            (left + obj.width, top),
            (left + obj.width, top + obj.height),
            (left, top + obj.height),
        ]
        .iter()
        .map(|&(x, y)| rotate_about(x, y, left, top, obj.rotation))
        .collect::<Vec<_>>();
        rasterize_polygon(grid, &verts);
        return;
    }

    rasterize_rect(grid, left, top, obj.width, obj.height);
}

fn rotate_about(x: f64, y: f64, cx: f64, cy: f64, degrees: f64) -> (f64, f64) {
    if degrees == 0.0 {
        return (x, y);
    }
    let rad = degrees.to_radians();
    let (sin, cos) = rad.sin_cos();
    let (dx, dy) = (x - cx, y - cy);
    (cx + dx * cos - dy * sin, cy + dx * sin + dy * cos)
}

fn rasterize_rect(grid: &mut Grid, left: f64, top: f64, w: f64, h: f64) {
    if w <= 0.0 || h <= 0.0 {
        return;
    }
    let (tw, th) = (grid.tile_width as f64, grid.tile_height as f64);
    let x0 = (left / tw).floor().max(0.0) as usize;
    let y0 = (top / th).floor().max(0.0) as usize;
    let x1 = ((left + w - EDGE_EPS) / tw).floor() as isize;
    let y1 = ((top + h - EDGE_EPS) / th).floor() as isize;
    if x1 < 0 || y1 < 0 {
        return;
    }
    for ty in y0..=(y1 as usize).min(grid.height.saturating_sub(1)) {
        for tx in x0..=(x1 as usize).min(grid.width.saturating_sub(1)) {
            grid.block(tx, ty);
        }
    }
}

fn rasterize_polygon(grid: &mut Grid, verts: &[(f64, f64)]) {
    let (tw, th) = (grid.tile_width as f64, grid.tile_height as f64);

    let min_x = verts.iter().map(|v| v.0).fold(f64::INFINITY, f64::min);
    let max_x = verts.iter().map(|v| v.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = verts.iter().map(|v| v.1).fold(f64::INFINITY, f64::min);
    let max_y = verts.iter().map(|v| v.1).fold(f64::NEG_INFINITY, f64::max);

    let ty0 = (min_y / th).floor().max(0.0) as usize;
    let ty1 = ((max_y / th).floor() as isize).min(grid.height as isize - 1);
    let tx0 = (min_x / tw).floor().max(0.0) as usize;
    let tx1 = ((max_x / tw).floor() as isize).min(grid.width as isize - 1);
    if ty1 < 0 || tx1 < 0 {
        return;
    }

    // Scanline at each row's vertical midpoint.
    for ty in ty0..=ty1 as usize {
        let mid_y = (ty as f64 + 0.5) * th;
        let mut xs: Vec<f64> = Vec::new();
        for i in 0..verts.len() {
            let a = verts[i];
            let b = verts[(i + 1) % verts.len()];
            if (a.1 <= mid_y && b.1 > mid_y) || (b.1 <= mid_y && a.1 > mid_y) {
                xs.push(a.0 + (mid_y - a.1) / (b.1 - a.1) * (b.0 - a.0));
            }
        }
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        for pair in xs.chunks(2) {
            if pair.len() < 2 {
                continue;
            }
            let (xa, xb) = (pair[0], pair[1]);
            if xb - xa <= 0.0 {
                continue;
            }
            let fx0 = (xa / tw).floor().max(0.0) as usize;
            let fx1 = ((xb - EDGE_EPS) / tw).floor() as isize;
            if fx1 < 0 {
                continue;
            }
            for tx in fx0..=(fx1 as usize).min(grid.width.saturating_sub(1)) {
                grid.block(tx, ty);
            }
        }
    }

    // Thin or axis-degenerate polygons can slip between scanlines; the
    // centre test and vertex tiles close those gaps.
    for ty in ty0..=ty1 as usize {
        for tx in tx0..=tx1 as usize {
            let cx = (tx as f64 + 0.5) * tw;
            let cy = (ty as f64 + 0.5) * th;
            if point_in_polygon(cx, cy, verts) {
                grid.block(tx, ty);
            }
        }
    }
    for &(vx, vy) in verts {
        if vx >= 0.0 && vy >= 0.0 {
            grid.block((vx / tw).floor() as usize, (vy / th).floor() as usize);
        }
    }
}

fn point_in_polygon(px: f64, py: f64, verts: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let mut j = verts.len() - 1;
    for i in 0..verts.len() {
        let (xi, yi) = verts[i];
        let (xj, yj) = verts[j];
        if ((yi > py) != (yj > py)) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn rasterize_ellipse(grid: &mut Grid, left: f64, top: f64, w: f64, h: f64) {
    if w <= 0.0 || h <= 0.0 {
        return;
    }
    let (tw, th) = (grid.tile_width as f64, grid.tile_height as f64);
    let (cx, cy) = (left + w / 2.0, top + h / 2.0);
    let (rx, ry) = (w / 2.0, h / 2.0);

    let ty0 = (top / th).floor().max(0.0) as usize;
    let ty1 = (((top + h) / th).floor() as isize).min(grid.height as isize - 1);
    let tx0 = (left / tw).floor().max(0.0) as usize;
    let tx1 = (((left + w) / tw).floor() as isize).min(grid.width as isize - 1);
    if ty1 < 0 || tx1 < 0 {
        return;
    }
    for ty in ty0..=ty1 as usize {
        for tx in tx0..=tx1 as usize {
            let dx = ((tx as f64 + 0.5) * tw - cx) / rx;
            let dy = ((ty as f64 + 0.5) * th - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                grid.block(tx, ty);
            }
        }
    }
}

/// Sidecar file written by the offline grid generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecomputedGrid {
    pub width: usize,
    pub height: usize,
    pub tile_width: u32,
    pub tile_height: u32,
    pub map_hash: String,
    pub grid_hash: String,
    pub version: u32,
    pub generated_at: String,
    pub grid: Vec<Vec<u8>>,
}

/// Accept a precomputed grid only if it provably belongs to `map_bytes`:
/// dimensions, tile sizes, the map-file hash and the grid hash must all
/// match. On success the sidecar grid becomes the live grid.
pub fn validate_precomputed(
    pre: &PrecomputedGrid,
    map: &TileMap,
    map_bytes: &[u8],
) -> Result<Grid, WalkmapError> {
    if pre.width != map.width || pre.height != map.height {
        return Err(WalkmapError::DimensionMismatch {
            got_w: pre.width,
            got_h: pre.height,
            want_w: map.width,
            want_h: map.height,
        });
    }
    if pre.tile_width != map.tile_width || pre.tile_height != map.tile_height {
        return Err(WalkmapError::TileSizeMismatch {
            got_w: pre.tile_width,
            got_h: pre.tile_height,
            want_w: map.tile_width,
            want_h: map.tile_height,
        });
    }
    if sha256_hex(map_bytes) != pre.map_hash {
        return Err(WalkmapError::MapHashMismatch);
    }
    if sha256_hex(stringify_grid(&pre.grid).as_bytes()) != pre.grid_hash {
        return Err(WalkmapError::GridHashMismatch);
    }
    if pre.grid.len() != pre.height || pre.grid.iter().any(|row| row.len() != pre.width) {
        return Err(WalkmapError::MalformedMap(
            "precomputed grid rows do not match declared dimensions".to_string(),
        ));
    }

    let mut cells = Vec::with_capacity(pre.width * pre.height);
    for row in &pre.grid {
        cells.extend(row.iter().map(|&c| u8::from(c != 0)));
    }
    Ok(Grid {
        width: pre.width,
        height: pre.height,
        tile_width: pre.tile_width,
        tile_height: pre.tile_height,
        cells,
    })
}

/// The generator hashes `JSON.stringify(grid)`; reproduce that encoding
/// exactly (compact, no whitespace).
pub fn stringify_grid(rows: &[Vec<u8>]) -> String {
    let mut s = String::with_capacity(rows.len() * (rows.first().map_or(0, |r| r.len()) * 2 + 3));
    s.push('[');
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push('[');
        for (j, c) in row.iter().enumerate() {
            if j > 0 {
                s.push(',');
            }
            s.push(if *c != 0 { '1' } else { '0' });
        }
        s.push(']');
    }
    s.push(']');
    s
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex_lower(&h.finalize())
}

fn hex_lower(b: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(b.len() * 2);
    for &x in b {
        s.push(LUT[(x >> 4) as usize] as char);
        s.push(LUT[(x & 0x0f) as usize] as char);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with_layers(layers: &str) -> TileMap {
        let doc = format!(
            r#"{{"width":8,"height":8,"tilewidth":32,"tileheight":32,"tilesets":[],"layers":[{layers}]}}"#
        );
        TileMap::parse(doc.as_bytes()).unwrap()
    }

    #[test]
    fn tile_layer_blocks_by_gid_with_flip_bits_stripped() {
        let doc = r#"{
            "width":2,"height":2,"tilewidth":32,"tileheight":32,
            "tilesets":[{"firstgid":1,"tiles":[{"id":4,"properties":[{"name":"collides","value":true}]}]}],
            "layers":[{"type":"tilelayer","name":"Ground","data":[5,2147483653,0,1]}]
        }"#;
        let map = TileMap::parse(doc.as_bytes()).unwrap();
        let grid = build_grid(&map).unwrap();
        // gid 5 = firstgid 1 + id 4; the second cell has a horizontal-flip
        // bit set on the same gid.
        assert!(grid.is_blocked(0, 0));
        assert!(grid.is_blocked(1, 0));
        assert!(!grid.is_blocked(0, 1));
        assert!(!grid.is_blocked(1, 1));
    }

    #[test]
    fn rect_excludes_edge_touch() {
        // 32x32 rect exactly covering tile (1,1): its right/bottom edges
        // touch tiles (2,1)/(1,2) but must not block them.
        let map = map_with_layers(
            r#"{"type":"objectgroup","name":"Wall","objects":[{"x":32,"y":32,"width":32,"height":32,"rotation":0}]}"#,
        );
        let grid = build_grid(&map).unwrap();
        assert!(grid.is_blocked(1, 1));
        assert!(!grid.is_blocked(2, 1));
        assert!(!grid.is_blocked(1, 2));
        assert!(!grid.is_blocked(0, 0));
    }

    #[test]
    fn tile_object_anchors_bottom_left() {
        // gid objects report y at their bottom edge: a 32x32 tile object at
        // y=64 occupies the 32..64 band, i.e. tile row 1.
        let map = map_with_layers(
            r#"{"type":"objectgroup","name":"Chair","objects":[{"x":0,"y":64,"width":32,"height":32,"rotation":0,"gid":7}]}"#,
        );
        let grid = build_grid(&map).unwrap();
        assert!(grid.is_blocked(0, 1));
        assert!(!grid.is_blocked(0, 2));
    }

    #[test]
    fn non_blocking_layer_is_ignored() {
        let map = map_with_layers(
            r#"{"type":"objectgroup","name":"SpawnPoints","objects":[{"x":0,"y":0,"width":256,"height":256,"rotation":0}]}"#,
        );
        let grid = build_grid(&map).unwrap();
        assert_eq!(grid.blocked_count(), 0);
    }

    #[test]
    fn polygon_blocks_interior_and_vertices() {
        // Triangle spanning tiles (0..4, 0..4).
        let map = map_with_layers(
            r#"{"type":"objectgroup","name":"Objects","objects":[{"x":16,"y":16,"width":0,"height":0,"rotation":0,"polygon":[{"x":0,"y":0},{"x":112,"y":0},{"x":0,"y":112}]}]}"#,
        );
        let grid = build_grid(&map).unwrap();
        assert!(grid.is_blocked(0, 0));
        // Far corner outside the hypotenuse stays walkable.
        assert!(!grid.is_blocked(4, 4));
        assert!(grid.blocked_count() > 3);
    }

    #[test]
    fn ellipse_blocks_by_tile_centre() {
        // Circle of radius 48 centred at (64,64): tile (1,1) centre is well
        // inside, tile (3,3) centre is out.
        let map = map_with_layers(
            r#"{"type":"objectgroup","name":"VendingMachine","objects":[{"x":16,"y":16,"width":96,"height":96,"rotation":0,"ellipse":true}]}"#,
        );
        let grid = build_grid(&map).unwrap();
        assert!(grid.is_blocked(1, 1));
        assert!(grid.is_blocked(2, 2));
        assert!(!grid.is_blocked(3, 3));
    }

    #[test]
    fn rotated_rect_rasterizes_as_polygon() {
        // 64x8 bar rotated 90 degrees about its top-left at (128,128) swings
        // into the column below-left of the pivot.
        let map = map_with_layers(
            r#"{"type":"objectgroup","name":"Wall","objects":[{"x":128,"y":128,"width":64,"height":8,"rotation":90}]}"#,
        );
        let grid = build_grid(&map).unwrap();
        assert!(grid.is_blocked(3, 4) || grid.is_blocked(3, 5));
        // The unrotated footprint to the right stays clear.
        assert!(!grid.is_blocked(5, 4));
    }

    fn sample_map_and_bytes() -> (TileMap, Vec<u8>) {
        let bytes = br#"{"width":4,"height":4,"tilewidth":16,"tileheight":16,"tilesets":[],"layers":[]}"#.to_vec();
        (TileMap::parse(&bytes).unwrap(), bytes)
    }

    fn sidecar_for(map: &TileMap, bytes: &[u8]) -> PrecomputedGrid {
        let grid = build_grid(map).unwrap();
        let rows = grid.rows();
        PrecomputedGrid {
            width: map.width,
            height: map.height,
            tile_width: map.tile_width,
            tile_height: map.tile_height,
            map_hash: sha256_hex(bytes),
            grid_hash: sha256_hex(stringify_grid(&rows).as_bytes()),
            version: 1,
            generated_at: "2025-01-01T00:00:00Z".to_string(),
            grid: rows,
        }
    }

    #[test]
    fn precomputed_round_trip_validates() {
        let (map, bytes) = sample_map_and_bytes();
        let pre = sidecar_for(&map, &bytes);
        let grid = validate_precomputed(&pre, &map, &bytes).unwrap();
        assert_eq!(grid.width, 4);
        assert_eq!(grid.blocked_count(), 0);
    }

    #[test]
    fn precomputed_rejects_mutated_map_bytes() {
        let (map, bytes) = sample_map_and_bytes();
        let pre = sidecar_for(&map, &bytes);
        let mut mutated = bytes.clone();
        *mutated.last_mut().unwrap() = b' ';
        assert!(matches!(
            validate_precomputed(&pre, &map, &mutated),
            Err(WalkmapError::MapHashMismatch)
        ));
    }

    #[test]
    fn precomputed_rejects_mutated_grid() {
        let (map, bytes) = sample_map_and_bytes();
        let mut pre = sidecar_for(&map, &bytes);
        pre.grid[0][0] = 1;
        assert!(matches!(
            validate_precomputed(&pre, &map, &bytes),
            Err(WalkmapError::GridHashMismatch)
        ));
    }

    #[test]
    fn precomputed_rejects_dimension_mismatch() {
        let (map, bytes) = sample_map_and_bytes();
        let mut pre = sidecar_for(&map, &bytes);
        pre.width = 5;
        assert!(matches!(
            validate_precomputed(&pre, &map, &bytes),
            Err(WalkmapError::DimensionMismatch { .. })
        ));
    }
}

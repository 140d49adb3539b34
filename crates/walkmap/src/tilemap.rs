//! Serde model of the tile-map document.
//!
//! Only the parts the grid builder reads are modelled; everything else in
//! the document (image paths, draw order, ...) is ignored by serde.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TileMap {
    pub width: usize,
    pub height: usize,
    #[serde(rename = "tilewidth")]
    pub tile_width: u32,
    #[serde(rename = "tileheight")]
    pub tile_height: u32,
    #[serde(default)]
    pub tilesets: Vec<Tileset>,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

impl TileMap {
    pub fn parse(bytes: &[u8]) -> Result<Self, crate::WalkmapError> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::WalkmapError::MalformedMap(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tileset {
    pub firstgid: u32,
    #[serde(default)]
    pub tiles: Vec<TilesetTile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TilesetTile {
    pub id: u32,
    #[serde(default)]
    pub properties: Vec<TileProperty>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TileProperty {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl TilesetTile {
    /// A tile blocks movement iff it carries `collides: true`.
    pub fn collides(&self) -> bool {
        self.properties
            .iter()
            .any(|p| p.name == "collides" && p.value == serde_json::Value::Bool(true))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Layer {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    /// Tile layers: one GID per cell, row-major, flip bits in the top three
    /// bits.
    #[serde(default)]
    pub data: Vec<u32>,
    /// Object layers.
    #[serde(default)]
    pub objects: Vec<MapObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapObject {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub rotation: f64,
    /// Present on tile objects; shifts the anchor to the bottom-left corner.
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub polygon: Option<Vec<PolyPoint>>,
    #[serde(default)]
    pub ellipse: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PolyPoint {
    pub x: f64,
    pub y: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collides_requires_true_value() {
        let t: TilesetTile = serde_json::from_str(
            r#"{"id":3,"properties":[{"name":"collides","value":true}]}"#,
        )
        .unwrap();
        assert!(t.collides());

        let t: TilesetTile = serde_json::from_str(
            r#"{"id":3,"properties":[{"name":"collides","value":false}]}"#,
        )
        .unwrap();
        assert!(!t.collides());

        let t: TilesetTile = serde_json::from_str(r#"{"id":3}"#).unwrap();
        assert!(!t.collides());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(TileMap::parse(b"not json").is_err());
    }
}

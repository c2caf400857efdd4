//! Area-of-interest parsing and validation.
//!
//! Submissions carry an AOI as exactly one of a WKT string or a GeoJSON
//! geometry object. Both forms are validated here and normalized to WKT,
//! which is what the provider query layers consume.

use anyhow::{anyhow, bail, Result};
use std::str::FromStr;
use wkt::Wkt;

/// A validated area of interest, normalized to WKT.
#[derive(Debug, Clone, PartialEq)]
pub struct Aoi {
    pub wkt: String,
}

impl Aoi {
    pub fn as_wkt(&self) -> &str {
        &self.wkt
    }

    /// Re-emit the geometry as a GeoJSON value, for providers whose query
    /// dialect takes GeoJSON instead of WKT.
    pub fn to_geojson(&self) -> Result<serde_json::Value> {
        let parsed: Wkt<f64> =
            Wkt::from_str(&self.wkt).map_err(|e| anyhow!("Invalid WKT: {}", e))?;
        match parsed.item {
            wkt::Geometry::Polygon(polygon) => Ok(serde_json::json!({
                "type": "Polygon",
                "coordinates": polygon_coordinates(&polygon),
            })),
            wkt::Geometry::MultiPolygon(multi) => {
                let coordinates: Vec<_> = multi.0.iter().map(polygon_coordinates).collect();
                Ok(serde_json::json!({
                    "type": "MultiPolygon",
                    "coordinates": coordinates,
                }))
            }
            _ => bail!("AOI must be a Polygon or MultiPolygon."),
        }
    }
}

fn polygon_coordinates(polygon: &wkt::types::Polygon<f64>) -> Vec<Vec<Vec<f64>>> {
    polygon
        .0
        .iter()
        .map(|ring| ring.0.iter().map(|coord| vec![coord.x, coord.y]).collect())
        .collect()
}

/// Parse and validate an AOI payload. Exactly one of `wkt` / `geojson` must
/// be present and the geometry must be a non-empty Polygon or MultiPolygon.
pub fn parse_aoi(wkt_text: Option<&str>, geojson_value: Option<&serde_json::Value>) -> Result<Aoi> {
    match (wkt_text, geojson_value) {
        (Some(_), Some(_)) | (None, None) => {
            bail!("AOI must contain exactly one of 'wkt' or 'geojson'.")
        }
        (Some(text), None) => parse_wkt_aoi(text),
        (None, Some(value)) => parse_geojson_aoi(value),
    }
}

fn parse_wkt_aoi(text: &str) -> Result<Aoi> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        bail!("AOI WKT is empty.");
    }

    let parsed: Wkt<f64> = Wkt::from_str(trimmed).map_err(|e| anyhow!("Invalid WKT: {}", e))?;
    match parsed.item {
        wkt::Geometry::Polygon(polygon) => {
            if polygon.0.is_empty() {
                bail!("AOI geometry is empty.");
            }
        }
        wkt::Geometry::MultiPolygon(multi) => {
            if multi.0.is_empty() || multi.0.iter().all(|p| p.0.is_empty()) {
                bail!("AOI geometry is empty.");
            }
        }
        _ => bail!("AOI must be a Polygon or MultiPolygon."),
    }

    Ok(Aoi {
        wkt: trimmed.to_string(),
    })
}

fn parse_geojson_aoi(value: &serde_json::Value) -> Result<Aoi> {
    let geojson = geojson::GeoJson::from_json_value(value.clone())
        .map_err(|e| anyhow!("Invalid GeoJSON: {}", e))?;

    let geometry = match geojson {
        geojson::GeoJson::Geometry(geometry) => geometry,
        geojson::GeoJson::Feature(feature) => feature
            .geometry
            .ok_or_else(|| anyhow!("GeoJSON feature has no geometry."))?,
        geojson::GeoJson::FeatureCollection(_) => {
            bail!("AOI must be a single geometry, not a feature collection.")
        }
    };

    let wkt = match &geometry.value {
        geojson::Value::Polygon(rings) => {
            if rings.is_empty() {
                bail!("AOI geometry is empty.");
            }
            format!("POLYGON {}", polygon_to_wkt(rings)?)
        }
        geojson::Value::MultiPolygon(polygons) => {
            if polygons.is_empty() {
                bail!("AOI geometry is empty.");
            }
            let parts = polygons
                .iter()
                .map(|rings| polygon_to_wkt(rings))
                .collect::<Result<Vec<_>>>()?;
            format!("MULTIPOLYGON ({})", parts.join(", "))
        }
        _ => bail!("AOI must be a Polygon or MultiPolygon."),
    };

    Ok(Aoi { wkt })
}

fn polygon_to_wkt(rings: &[Vec<Vec<f64>>]) -> Result<String> {
    let mut ring_texts = Vec::with_capacity(rings.len());
    for ring in rings {
        if ring.len() < 4 {
            bail!("AOI polygon ring must have at least four positions.");
        }
        let mut coords = Vec::with_capacity(ring.len());
        for position in ring {
            if position.len() < 2 {
                bail!("AOI position must have at least two coordinates.");
            }
            coords.push(format!("{} {}", position[0], position[1]));
        }
        ring_texts.push(format!("({})", coords.join(", ")));
    }
    Ok(format!("({})", ring_texts.join(", ")))
}

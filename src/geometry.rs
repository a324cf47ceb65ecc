use std::fmt;
use std::str::FromStr;

use geo::{BoundingRect, Coord, Geometry, Intersects, Polygon, Rect, Validation};
use serde::{Deserialize, Serialize};

use crate::error::StormsightError;

/// WGS84 bounding box, `west < east` and `south < north`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Accepts the 4-element (2D) and 6-element (3D) STAC bbox layouts.
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        match values.len() {
            4 => Some(Self::new(values[0], values[1], values[2], values[3])),
            6 => Some(Self::new(values[0], values[1], values[3], values[4])),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), StormsightError> {
        let values = [self.west, self.south, self.east, self.north];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(StormsightError::InvalidCriteria(
                "bounding box values must be finite".to_string(),
            ));
        }
        if self.west < -180.0 || self.east > 180.0 || self.south < -90.0 || self.north > 90.0 {
            return Err(StormsightError::InvalidCriteria(format!(
                "bounding box {self} outside WGS84 bounds"
            )));
        }
        if self.west >= self.east || self.south >= self.north {
            return Err(StormsightError::InvalidCriteria(format!(
                "degenerate bounding box {self}: west must be less than east and south less than north"
            )));
        }
        Ok(())
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.west,
                y: self.south,
            },
            Coord {
                x: self.east,
                y: self.north,
            },
        )
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.west, self.south, self.east, self.north
        )
    }
}

impl FromStr for BoundingBox {
    type Err = StormsightError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| {
                StormsightError::InvalidCriteria(format!(
                    "expected bounding box as west,south,east,north, got `{value}`"
                ))
            })?;
        let bbox = Self::from_slice(&parts).ok_or_else(|| {
            StormsightError::InvalidCriteria(format!(
                "expected 4 comma-separated values, got {}",
                parts.len()
            ))
        })?;
        bbox.validate()?;
        Ok(bbox)
    }
}

impl From<Rect<f64>> for BoundingBox {
    fn from(rect: Rect<f64>) -> Self {
        Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

/// Spatial query region: an axis-aligned box or an arbitrary polygon.
#[derive(Debug, Clone, PartialEq)]
pub enum Region {
    Bbox(BoundingBox),
    Polygon(Polygon<f64>),
}

impl Region {
    /// Reads a region from GeoJSON text: a bare geometry, a feature, or a
    /// single-feature collection, as long as it carries one polygon.
    pub fn from_geojson(text: &str) -> Result<Self, StormsightError> {
        let parsed: geojson::GeoJson = text.parse().map_err(|err: geojson::Error| {
            StormsightError::InvalidCriteria(format!("region is not valid GeoJSON: {err}"))
        })?;
        let geometry = match parsed {
            geojson::GeoJson::Geometry(geometry) => geometry,
            geojson::GeoJson::Feature(feature) => feature.geometry.ok_or_else(|| {
                StormsightError::InvalidCriteria("region feature has no geometry".to_string())
            })?,
            geojson::GeoJson::FeatureCollection(collection) => collection
                .features
                .into_iter()
                .find_map(|feature| feature.geometry)
                .ok_or_else(|| {
                    StormsightError::InvalidCriteria(
                        "region feature collection has no geometry".to_string(),
                    )
                })?,
        };
        let geojson::Value::Polygon(rings) = &geometry.value else {
            return Err(StormsightError::InvalidCriteria(format!(
                "region must be a single polygon, got {}",
                geometry.value.type_name()
            )));
        };
        let Some(exterior) = rings.first() else {
            return Err(StormsightError::InvalidCriteria(
                "region polygon has no exterior ring".to_string(),
            ));
        };
        if exterior.len() < 4 {
            return Err(StormsightError::InvalidCriteria(format!(
                "region polygon ring has {} coordinates, need at least 4",
                exterior.len()
            )));
        }
        if exterior.first() != exterior.last() {
            return Err(StormsightError::InvalidCriteria(
                "region polygon ring is not closed".to_string(),
            ));
        }
        let polygon: Polygon<f64> = geo::Geometry::try_from(geometry)
            .map_err(|err| {
                StormsightError::InvalidCriteria(format!("region polygon unreadable: {err}"))
            })
            .and_then(|geometry| match geometry {
                Geometry::Polygon(polygon) => Ok(polygon),
                _ => Err(StormsightError::InvalidCriteria(
                    "region must be a single polygon".to_string(),
                )),
            })?;
        let region = Region::Polygon(polygon);
        region.validate()?;
        Ok(region)
    }

    pub fn validate(&self) -> Result<(), StormsightError> {
        match self {
            Region::Bbox(bbox) => bbox.validate(),
            Region::Polygon(polygon) => {
                if polygon.exterior().0.len() < 4 {
                    return Err(StormsightError::InvalidCriteria(
                        "region polygon ring has fewer than 4 coordinates".to_string(),
                    ));
                }
                if !polygon.is_valid() {
                    return Err(StormsightError::InvalidCriteria(
                        "region polygon is not valid (self-intersecting or malformed ring)"
                            .to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn to_geometry(&self) -> Geometry<f64> {
        match self {
            Region::Bbox(bbox) => Geometry::Polygon(bbox.to_rect().to_polygon()),
            Region::Polygon(polygon) => Geometry::Polygon(polygon.clone()),
        }
    }
}

/// Parsed footprint of an item: the GeoJSON geometry plus its derived bbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    geometry: Geometry<f64>,
    bbox: BoundingBox,
}

impl Footprint {
    /// Footprint for items that publish only a bbox, no geometry.
    pub fn from_bbox(bbox: BoundingBox) -> Self {
        Self {
            geometry: Geometry::Polygon(bbox.to_rect().to_polygon()),
            bbox,
        }
    }

    pub fn from_geojson_value(
        value: &serde_json::Value,
        node: &str,
    ) -> Result<Self, StormsightError> {
        let parse_err = |message: String| StormsightError::Parse {
            node: node.to_string(),
            message,
        };
        let geometry: geojson::Geometry = serde_json::from_value(value.clone())
            .map_err(|err| parse_err(format!("malformed geometry: {err}")))?;
        let geometry: Geometry<f64> = geo::Geometry::try_from(geometry)
            .map_err(|err| parse_err(format!("unsupported geometry: {err}")))?;
        let bbox = geometry
            .bounding_rect()
            .map(BoundingBox::from)
            .ok_or_else(|| parse_err("geometry has no extent".to_string()))?;
        Ok(Self { geometry, bbox })
    }

    pub fn geometry(&self) -> &Geometry<f64> {
        &self.geometry
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn intersects(&self, region: &Region) -> bool {
        self.geometry.intersects(&region.to_geometry())
    }

    /// GeoJSON rendition for map-facing consumers.
    pub fn to_geojson(&self) -> serde_json::Value {
        let value = geojson::Value::from(&self.geometry);
        serde_json::to_value(geojson::Geometry::new(value)).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use geo::{LineString, polygon};

    use super::*;
    use crate::error::StormsightError;

    fn footprint(coords: Vec<(f64, f64)>) -> Footprint {
        let polygon = Polygon::new(LineString::from(coords), vec![]);
        let bbox = polygon.bounding_rect().map(BoundingBox::from).unwrap();
        Footprint {
            geometry: Geometry::Polygon(polygon),
            bbox,
        }
    }

    #[test]
    fn bbox_from_str() {
        let bbox: BoundingBox = "30.1, 36.0, 30.9, 36.8".parse().unwrap();
        assert_eq!(bbox.west, 30.1);
        assert_eq!(bbox.north, 36.8);
        assert_matches!(
            "30.1,36.0,30.9".parse::<BoundingBox>(),
            Err(StormsightError::InvalidCriteria(_))
        );
        assert_matches!(
            "a,b,c,d".parse::<BoundingBox>(),
            Err(StormsightError::InvalidCriteria(_))
        );
    }

    #[test]
    fn bbox_validation() {
        assert!(BoundingBox::new(-1.0, -1.0, 1.0, 1.0).validate().is_ok());
        assert_matches!(
            BoundingBox::new(1.0, 0.0, 1.0, 2.0).validate(),
            Err(StormsightError::InvalidCriteria(_))
        );
        assert_matches!(
            BoundingBox::new(2.0, 0.0, 1.0, 2.0).validate(),
            Err(StormsightError::InvalidCriteria(_))
        );
        assert_matches!(
            BoundingBox::new(-200.0, 0.0, 1.0, 2.0).validate(),
            Err(StormsightError::InvalidCriteria(_))
        );
        assert_matches!(
            BoundingBox::new(f64::NAN, 0.0, 1.0, 2.0).validate(),
            Err(StormsightError::InvalidCriteria(_))
        );
    }

    #[test]
    fn bbox_three_d_slice() {
        let bbox = BoundingBox::from_slice(&[1.0, 2.0, 0.0, 3.0, 4.0, 100.0]).unwrap();
        assert_eq!(bbox.to_array(), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn self_intersecting_region_rejected() {
        let bowtie = polygon![
            (x: 0.0, y: 0.0),
            (x: 2.0, y: 2.0),
            (x: 2.0, y: 0.0),
            (x: 0.0, y: 2.0),
            (x: 0.0, y: 0.0),
        ];
        assert_matches!(
            Region::Polygon(bowtie).validate(),
            Err(StormsightError::InvalidCriteria(_))
        );
    }

    #[test]
    fn region_from_geojson() {
        let text = r#"{"type":"Polygon","coordinates":[[[0.0,0.0],[2.0,0.0],[2.0,2.0],[0.0,2.0],[0.0,0.0]]]}"#;
        let region = Region::from_geojson(text).unwrap();
        assert_matches!(region, Region::Polygon(_));

        let unclosed = r#"{"type":"Polygon","coordinates":[[[0.0,0.0],[2.0,0.0],[2.0,2.0],[0.0,2.0]]]}"#;
        assert_matches!(
            Region::from_geojson(unclosed),
            Err(StormsightError::InvalidCriteria(_))
        );

        let point = r#"{"type":"Point","coordinates":[0.0,0.0]}"#;
        assert_matches!(
            Region::from_geojson(point),
            Err(StormsightError::InvalidCriteria(_))
        );
    }

    #[test]
    fn footprint_parse_and_bbox() {
        let value = serde_json::json!({
            "type": "Polygon",
            "coordinates": [[[10.0, 20.0], [11.0, 20.0], [11.0, 21.0], [10.0, 21.0], [10.0, 20.0]]]
        });
        let footprint = Footprint::from_geojson_value(&value, "item-1").unwrap();
        assert_eq!(footprint.bbox().to_array(), [10.0, 20.0, 11.0, 21.0]);

        let bad = serde_json::json!({"type": "Polygon"});
        assert_matches!(
            Footprint::from_geojson_value(&bad, "item-1"),
            Err(StormsightError::Parse { node, .. }) if node == "item-1"
        );
    }

    #[test]
    fn exact_intersection_beats_bbox_overlap() {
        // Thin diagonal footprint whose bbox covers the whole unit square.
        let diagonal = footprint(vec![
            (0.0, 0.0),
            (0.1, 0.0),
            (10.0, 9.9),
            (10.0, 10.0),
            (9.9, 10.0),
            (0.0, 0.1),
            (0.0, 0.0),
        ]);
        // Query box in the far corner of the bbox, away from the diagonal.
        let corner = Region::Bbox(BoundingBox::new(0.5, 8.0, 1.5, 9.0));
        assert!(!diagonal.intersects(&corner));

        let on_diagonal = Region::Bbox(BoundingBox::new(4.0, 4.0, 6.0, 6.0));
        assert!(diagonal.intersects(&on_diagonal));
    }
}

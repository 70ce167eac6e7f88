use crate::merge::Table;
use crate::types::{AttrValue, SpatialUnit, UnitCollection};
use anyhow::{anyhow, Context, Result};
use csv::ReaderBuilder;
use geo::MultiPolygon;
use geojson::GeoJson;
use shapefile::dbase::FieldValue;
use shapefile::Reader;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

/// Loads a polygon collection from an http(s) URL or a local GeoJSON/shapefile.
pub async fn load_collection(source: &str, id_column: &str) -> Result<UnitCollection> {
    let units = if is_remote(source) {
        let text = fetch_text(source).await?;
        let geojson: GeoJson = text
            .parse()
            .with_context(|| format!("Failed to parse GeoJSON from {}", source))?;
        units_from_geojson(geojson, id_column)?
    } else {
        let path = Path::new(source);
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s: &str| s.to_lowercase())
            .ok_or_else(|| anyhow!("Input geometry file has no extension: {}", source))?;
        match extension.as_str() {
            "shp" => load_shapefile(path, id_column)?,
            "json" | "geojson" => load_geojson_file(path, id_column)?,
            _ => return Err(anyhow!("Unsupported geometry format: {}", extension)),
        }
    };

    info!("Loaded {} units from {}", units.len(), source);
    UnitCollection::new(units).with_context(|| format!("Invalid unit collection in {}", source))
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

async fn fetch_text(url: &str) -> Result<String> {
    info!("Fetching {}", url);
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("Failed to fetch {}", url))?
        .error_for_status()
        .with_context(|| format!("Bad response from {}", url))?;
    response
        .text()
        .await
        .with_context(|| format!("Failed to read body of {}", url))
}

fn load_geojson_file(path: &Path, id_column: &str) -> Result<Vec<SpatialUnit>> {
    let mut content = String::new();
    File::open(path)
        .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?
        .read_to_string(&mut content)
        .with_context(|| format!("Failed to read GeoJSON file: {:?}", path))?;
    let geojson: GeoJson = content.parse().context("Failed to parse GeoJSON")?;
    units_from_geojson(geojson, id_column)
}

pub fn units_from_geojson(geojson: GeoJson, id_column: &str) -> Result<Vec<SpatialUnit>> {
    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut units = Vec::with_capacity(collection.features.len());
    let mut skipped = 0;

    for feature in collection.features {
        let properties = feature.properties.unwrap_or_default();

        let id = match properties.get(id_column) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                skipped += 1;
                continue;
            }
        };

        let geometry = match feature.geometry {
            Some(geom) => {
                let geometry: geo::Geometry<f64> = geom
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geojson geometry of {}: {:?}", id, e))?;
                match geometry {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => {
                        skipped += 1;
                        continue;
                    }
                }
            }
            None => {
                skipped += 1;
                continue;
            }
        };

        let attributes = properties
            .iter()
            .filter(|(name, _)| name.as_str() != id_column)
            .map(|(name, value)| (name.clone(), AttrValue::from_json(value)))
            .collect();

        units.push(SpatialUnit {
            id,
            geometry,
            attributes,
        });
    }

    if skipped > 0 {
        warn!("Skipped {} features without an id or polygon geometry", skipped);
    }
    Ok(units)
}

fn load_shapefile(path: &Path, id_column: &str) -> Result<Vec<SpatialUnit>> {
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut units = Vec::new();
    let mut skipped = 0;

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let id = match record.get(id_column) {
            Some(FieldValue::Character(Some(s))) => s.trim().to_string(),
            Some(FieldValue::Numeric(Some(n))) => n.to_string(),
            Some(FieldValue::Character(None)) | Some(FieldValue::Numeric(None)) => {
                skipped += 1;
                continue;
            }
            Some(_) => return Err(anyhow!("Shapefile join column must be a string or number")),
            None => return Err(anyhow!("Join column '{}' not found in Shapefile", id_column)),
        };

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?,
            shapefile::Shape::PolygonM(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?,
            shapefile::Shape::PolygonZ(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?,
            _ => {
                skipped += 1;
                continue;
            }
        };

        let attributes = HashMap::<String, FieldValue>::from(record)
            .into_iter()
            .filter(|(name, _)| name != id_column)
            .map(|(name, value)| (name, attr_from_dbase(value)))
            .collect();

        units.push(SpatialUnit {
            id,
            geometry,
            attributes,
        });
    }

    if skipped > 0 {
        warn!("Skipped {} shapefile records without an id or polygon shape", skipped);
    }
    Ok(units)
}

fn attr_from_dbase(value: FieldValue) -> AttrValue {
    match value {
        FieldValue::Character(Some(s)) | FieldValue::Memo(s) => AttrValue::Text(s),
        FieldValue::Numeric(Some(v)) | FieldValue::Double(v) => AttrValue::Number(v),
        FieldValue::Float(Some(v)) => AttrValue::Number(v as f64),
        FieldValue::Integer(v) => AttrValue::Number(v as f64),
        FieldValue::Character(None) | FieldValue::Numeric(None) | FieldValue::Float(None) => {
            AttrValue::Null
        }
        other => AttrValue::Text(format!("{:?}", other)),
    }
}

/// Reads the per-unit economic table.
pub fn load_table(path: &Path, join_column: &str) -> Result<Table> {
    let file = File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    let mut rdr = ReaderBuilder::new().from_reader(file);
    let headers = rdr.headers()?.clone();

    let join_col_idx = headers
        .iter()
        .position(|h| h == join_column)
        .ok_or_else(|| anyhow!("Join column '{}' not found in CSV", join_column))?;

    let columns: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != join_col_idx)
        .map(|(_, h)| h.to_string())
        .collect();

    let mut rows: HashMap<String, BTreeMap<String, AttrValue>> = HashMap::new();
    let mut duplicates = 0;

    for result in rdr.records() {
        let record = result.with_context(|| format!("Malformed row in {:?}", path))?;
        let id = record.get(join_col_idx).unwrap_or("").trim().to_string();
        if id.is_empty() {
            continue;
        }

        let values = headers
            .iter()
            .zip(record.iter())
            .enumerate()
            .filter(|(i, _)| *i != join_col_idx)
            .map(|(_, (h, cell))| (h.to_string(), AttrValue::from_cell(cell)))
            .collect();

        if rows.insert(id, values).is_some() {
            duplicates += 1;
        }
    }

    if duplicates > 0 {
        warn!("{} duplicate ids in {:?}; later rows won", duplicates, path);
    }
    info!("Loaded CSV data for {} units", rows.len());

    Ok(Table { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TRACTS: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature",
             "properties": {"GEOID": "06001", "NAME": "Tract 1", "pct": 2.5},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
            {"type": "Feature",
             "properties": {"GEOID": 6002, "NAME": "Tract 2", "pct": null},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[1,0],[2,0],[2,1],[1,1],[1,0]]]]}},
            {"type": "Feature",
             "properties": {"GEOID": "06003"},
             "geometry": {"type": "Point", "coordinates": [5, 5]}},
            {"type": "Feature",
             "properties": {"NAME": "no id"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}}
        ]
    }"#;

    #[test]
    fn geojson_features_become_units() {
        let units = units_from_geojson(TRACTS.parse().unwrap(), "GEOID").unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "06001");
        assert_eq!(units[0].attr("pct"), &AttrValue::Number(2.5));
        assert!(!units[0].attributes.contains_key("GEOID"));
        assert_eq!(units[1].id, "6002");
        assert!(units[1].attr("pct").is_null());
    }

    #[test]
    fn non_collection_is_rejected() {
        let point: GeoJson = r#"{"type": "Point", "coordinates": [1, 2]}"#.parse().unwrap();
        assert!(units_from_geojson(point, "GEOID").is_err());
    }

    #[tokio::test]
    async fn local_geojson_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracts.geojson");
        std::fs::write(&path, TRACTS).unwrap();
        let units = load_collection(path.to_str().unwrap(), "GEOID").await.unwrap();
        assert_eq!(units.len(), 2);
        assert!(units.contains("06001"));

        let bad = dir.path().join("tracts.kml");
        std::fs::write(&bad, TRACTS).unwrap();
        assert!(load_collection(bad.to_str().unwrap(), "GEOID").await.is_err());
    }

    #[test]
    fn csv_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "GEOID,median_income,county").unwrap();
        writeln!(file, "06001,52000,Alameda").unwrap();
        writeln!(file, "06002,,Alameda").unwrap();
        writeln!(file, ",1,nowhere").unwrap();
        writeln!(file, "06001, 61000 , Alameda County ").unwrap();
        file.flush().unwrap();

        let table = load_table(file.path(), "GEOID").unwrap();
        assert_eq!(table.columns, vec!["median_income".to_string(), "county".to_string()]);
        assert_eq!(table.rows.len(), 2);
        // the later 06001 row replaces the earlier one
        assert_eq!(table.rows["06001"]["median_income"], AttrValue::Number(61000.0));
        assert_eq!(table.rows["06001"]["county"], AttrValue::Text("Alameda County".into()));
        assert!(table.rows["06002"]["median_income"].is_null());
        assert_eq!(table.rows["06002"]["county"], AttrValue::Text("Alameda".into()));

        assert!(load_table(file.path(), "tract").is_err());
    }

    fn square_shape(x: f64) -> shapefile::Polygon {
        shapefile::Polygon::new(shapefile::PolygonRing::Outer(vec![
            shapefile::Point::new(x, 0.0),
            shapefile::Point::new(x, 1.0),
            shapefile::Point::new(x + 1.0, 1.0),
            shapefile::Point::new(x + 1.0, 0.0),
            shapefile::Point::new(x, 0.0),
        ]))
    }

    fn tract_record(id: Option<&str>, tested: Option<f64>, rate: Option<f32>) -> shapefile::dbase::Record {
        let mut record = shapefile::dbase::Record::default();
        record.insert(
            "GEOID".to_string(),
            FieldValue::Character(id.map(str::to_string)),
        );
        record.insert("TESTED".to_string(), FieldValue::Numeric(tested));
        record.insert("RATE".to_string(), FieldValue::Float(rate));
        record
    }

    #[tokio::test]
    async fn local_shapefile() {
        use shapefile::dbase::{FieldName, TableWriterBuilder};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracts.shp");
        {
            let table = TableWriterBuilder::new()
                .add_character_field(FieldName::try_from("GEOID").unwrap(), 12)
                .add_numeric_field(FieldName::try_from("TESTED").unwrap(), 10, 0)
                .add_float_field(FieldName::try_from("RATE").unwrap(), 10, 2);
            let mut writer = shapefile::Writer::from_path(&path, table).unwrap();
            writer
                .write_shape_and_record(&square_shape(0.0), &tract_record(Some("06001"), Some(120.0), Some(2.5)))
                .unwrap();
            writer
                .write_shape_and_record(&square_shape(1.0), &tract_record(Some("06002"), None, Some(0.5)))
                .unwrap();
            writer
                .write_shape_and_record(&square_shape(2.0), &tract_record(None, Some(10.0), None))
                .unwrap();
        }

        let units = load_shapefile(&path, "GEOID").unwrap();
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        // the record with a blank id is skipped
        assert_eq!(ids, ["06001", "06002"]);

        assert!(!units[0].attributes.contains_key("GEOID"));
        assert_eq!(units[0].attr("TESTED"), &AttrValue::Number(120.0));
        assert_eq!(units[0].attr("RATE"), &AttrValue::Number(2.5));
        assert!(units[1].attr("TESTED").is_null());
        assert_eq!(units[1].attr("RATE"), &AttrValue::Number(0.5));
        assert_eq!(units[0].geometry.0.len(), 1);

        let collection = load_collection(path.to_str().unwrap(), "GEOID").await.unwrap();
        assert_eq!(collection.len(), 2);
        assert!(collection.contains("06002"));

        assert!(load_shapefile(&path, "TRACT").is_err());
    }

    #[test]
    fn dbase_values() {
        assert_eq!(
            attr_from_dbase(FieldValue::Character(Some("Tract 1".into()))),
            AttrValue::Text("Tract 1".into())
        );
        assert_eq!(attr_from_dbase(FieldValue::Memo("note".into())), AttrValue::Text("note".into()));
        assert_eq!(attr_from_dbase(FieldValue::Numeric(Some(4.5))), AttrValue::Number(4.5));
        assert_eq!(attr_from_dbase(FieldValue::Double(-1.25)), AttrValue::Number(-1.25));
        assert_eq!(attr_from_dbase(FieldValue::Float(Some(0.5))), AttrValue::Number(0.5));
        assert_eq!(attr_from_dbase(FieldValue::Integer(42)), AttrValue::Number(42.0));
        assert!(attr_from_dbase(FieldValue::Character(None)).is_null());
        assert!(attr_from_dbase(FieldValue::Numeric(None)).is_null());
        assert!(attr_from_dbase(FieldValue::Float(None)).is_null());
        assert!(matches!(
            attr_from_dbase(FieldValue::Logical(Some(true))),
            AttrValue::Text(_)
        ));
    }
}

use crate::error::{FillError, FillResult};
use geo::{Centroid, MultiPolygon, Point};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A single attribute value carried by a unit.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AttrValue {
    #[default]
    Null,
    Number(f64),
    Text(String),
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttrValue::Null,
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(v) => AttrValue::Number(v),
                None => AttrValue::Text(n.to_string()),
            },
            serde_json::Value::String(s) => AttrValue::Text(s.clone()),
            other => AttrValue::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Null => serde_json::Value::Null,
            AttrValue::Number(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttrValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Parses a delimited-file cell: blank is null, numeric text is a number.
    pub fn from_cell(cell: &str) -> Self {
        let trimmed = cell.trim();
        if trimmed.is_empty() {
            return AttrValue::Null;
        }
        match trimmed.parse::<f64>() {
            Ok(v) => AttrValue::Number(v),
            Err(_) => AttrValue::Text(trimmed.to_string()),
        }
    }

    /// Any finite number, including numeric text.
    pub fn as_f64(&self) -> Option<f64> {
        let v = match self {
            AttrValue::Number(v) => *v,
            AttrValue::Text(s) => s.trim().parse::<f64>().ok()?,
            AttrValue::Null => return None,
        };
        v.is_finite().then_some(v)
    }

    /// Reads the value as a non-negative measurement.
    ///
    /// Null and blank text read as `None`. Anything negative, non-finite or
    /// non-numeric is `InvalidData`.
    pub fn measurement(&self, unit: &str, attribute: &str) -> FillResult<Option<f64>> {
        let value = match self {
            AttrValue::Null => return Ok(None),
            AttrValue::Number(v) => *v,
            AttrValue::Text(s) if s.trim().is_empty() => return Ok(None),
            AttrValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                FillError::InvalidData(format!(
                    "unit '{}': attribute '{}' is not numeric ({:?})",
                    unit, attribute, s
                ))
            })?,
        };
        if !value.is_finite() || value < 0.0 {
            return Err(FillError::InvalidData(format!(
                "unit '{}': attribute '{}' must be a finite non-negative number, got {}",
                unit, attribute, value
            )));
        }
        Ok(Some(value))
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => write!(f, "n/a"),
            AttrValue::Number(v) => {
                let s = format!("{:.2}", v);
                let s = s.trim_end_matches('0').trim_end_matches('.');
                write!(f, "{}", if s == "-0" { "0" } else { s })
            }
            AttrValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One spatial unit (e.g. a census tract).
#[derive(Debug, Clone)]
pub struct SpatialUnit {
    pub id: String,
    pub geometry: MultiPolygon<f64>,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl SpatialUnit {
    pub fn new(id: impl Into<String>, geometry: MultiPolygon<f64>) -> Self {
        Self {
            id: id.into(),
            geometry,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: AttrValue) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn attr(&self, name: &str) -> &AttrValue {
        static NULL: AttrValue = AttrValue::Null;
        self.attributes.get(name).unwrap_or(&NULL)
    }

    pub fn centroid(&self) -> Option<Point<f64>> {
        self.geometry.centroid()
    }
}

/// Ordered units with unique ids.
#[derive(Debug, Clone, Default)]
pub struct UnitCollection {
    units: Vec<SpatialUnit>,
    positions: HashMap<String, usize>,
}

impl UnitCollection {
    pub fn new(units: Vec<SpatialUnit>) -> FillResult<Self> {
        let mut positions = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            if positions.insert(unit.id.clone(), i).is_some() {
                return Err(FillError::InvalidData(format!(
                    "duplicate unit id '{}'",
                    unit.id
                )));
            }
        }
        Ok(Self { units, positions })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SpatialUnit> {
        self.positions.get(id).map(|&i| &self.units[i])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SpatialUnit> {
        self.units.iter()
    }

    pub fn units(&self) -> &[SpatialUnit] {
        &self.units
    }

    /// Mutable access to attributes only; ids and order cannot change.
    pub fn attributes_mut(&mut self, position: usize) -> Option<&mut BTreeMap<String, AttrValue>> {
        self.units.get_mut(position).map(|u| &mut u.attributes)
    }

    pub fn into_units(self) -> Vec<SpatialUnit> {
        self.units
    }
}

impl<'a> IntoIterator for &'a UnitCollection {
    type Item = &'a SpatialUnit;
    type IntoIter = std::slice::Iter<'a, SpatialUnit>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.iter()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use geo::{polygon, Polygon};

    /// Unit square with its lower-left corner at `(x, y)`; centroid is `(x + 0.5, y + 0.5)`.
    pub(crate) fn square(x: f64, y: f64) -> MultiPolygon<f64> {
        let p: Polygon<f64> = polygon![
            (x: x, y: y),
            (x: x + 1.0, y: y),
            (x: x + 1.0, y: y + 1.0),
            (x: x, y: y + 1.0),
            (x: x, y: y),
        ];
        MultiPolygon::new(vec![p])
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let units = vec![
            SpatialUnit::new("a", square(0.0, 0.0)),
            SpatialUnit::new("a", square(1.0, 0.0)),
        ];
        assert!(matches!(UnitCollection::new(units), Err(FillError::InvalidData(_))));
    }

    #[test]
    fn measurement_reading() {
        assert_eq!(AttrValue::Null.measurement("u", "t"), Ok(None));
        assert_eq!(AttrValue::Text("  ".into()).measurement("u", "t"), Ok(None));
        assert_eq!(AttrValue::Text("12.5".into()).measurement("u", "t"), Ok(Some(12.5)));
        assert_eq!(AttrValue::Number(0.0).measurement("u", "t"), Ok(Some(0.0)));
        assert!(AttrValue::Number(-1.0).measurement("u", "t").is_err());
        assert!(AttrValue::Number(f64::NAN).measurement("u", "t").is_err());
        assert!(AttrValue::Text("<5".into()).measurement("u", "t").is_err());
    }

    #[test]
    fn cells_and_display() {
        assert_eq!(AttrValue::from_cell(""), AttrValue::Null);
        assert_eq!(AttrValue::from_cell("42"), AttrValue::Number(42.0));
        assert_eq!(AttrValue::from_cell("Tract 1"), AttrValue::Text("Tract 1".into()));
        assert_eq!(AttrValue::from_cell("  Alameda "), AttrValue::Text("Alameda".into()));
        assert_eq!(AttrValue::from_cell(" 7.5 "), AttrValue::Number(7.5));
        assert_eq!(AttrValue::Number(2.5).to_string(), "2.5");
        assert_eq!(AttrValue::Number(3.0).to_string(), "3");
        assert_eq!(AttrValue::Number(1.23456).to_string(), "1.23");
        assert_eq!(AttrValue::Null.to_string(), "n/a");
    }

    #[test]
    fn centroid_of_square() {
        let unit = SpatialUnit::new("a", square(2.0, 4.0));
        let c = unit.centroid().unwrap();
        assert!((c.x() - 2.5).abs() < 1e-12);
        assert!((c.y() - 4.5).abs() < 1e-12);
    }
}

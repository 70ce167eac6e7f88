use crate::error::FillResult;
use crate::types::{AttrValue, SpatialUnit, UnitCollection};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Which side wins when both collections carry an attribute of the same name.
///
/// Names in `reference_fields` (display names and the like) come from the
/// reference collection. Every other shared name comes from the measured
/// collection. Geometry always comes from the reference when it has the unit.
#[derive(Debug, Clone, Default)]
pub struct MergePolicy {
    pub reference_fields: BTreeSet<String>,
}

impl MergePolicy {
    pub fn new<I, S>(reference_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reference_fields: reference_fields.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Units the measured collection does not cover.
    pub reference_only: Vec<String>,
    pub measured_only: Vec<String>,
    pub conflicts_to_reference: usize,
    pub conflicts_to_measured: usize,
}

#[derive(Debug, Clone)]
pub struct Merged {
    pub dataset: UnitCollection,
    pub report: MergeReport,
}

/// Full outer join of `measured` and `reference` on unit id.
///
/// Reference order comes first, then units only the measured side knows.
pub fn merge_collections(
    measured: &UnitCollection,
    reference: &UnitCollection,
    policy: &MergePolicy,
) -> FillResult<Merged> {
    let measured_names: BTreeSet<&String> = measured
        .iter()
        .flat_map(|u| u.attributes.keys())
        .collect();

    let mut report = MergeReport::default();
    let mut units = Vec::with_capacity(reference.len() + measured.len());

    for ref_unit in reference {
        let mut attributes = ref_unit.attributes.clone();
        match measured.get(&ref_unit.id) {
            Some(m_unit) => {
                for (name, value) in &m_unit.attributes {
                    if !attributes.contains_key(name) {
                        attributes.insert(name.clone(), value.clone());
                    } else if policy.reference_fields.contains(name) {
                        report.conflicts_to_reference += 1;
                    } else {
                        report.conflicts_to_measured += 1;
                        attributes.insert(name.clone(), value.clone());
                    }
                }
            }
            None => {
                report.reference_only.push(ref_unit.id.clone());
                for name in &measured_names {
                    if !attributes.contains_key(*name) {
                        attributes.insert((*name).clone(), AttrValue::Null);
                    }
                }
            }
        }
        units.push(SpatialUnit {
            id: ref_unit.id.clone(),
            geometry: ref_unit.geometry.clone(),
            attributes,
        });
    }

    let reference_names: BTreeSet<&String> = reference
        .iter()
        .flat_map(|u| u.attributes.keys())
        .collect();
    for m_unit in measured {
        if reference.contains(&m_unit.id) {
            continue;
        }
        report.measured_only.push(m_unit.id.clone());
        let mut unit = m_unit.clone();
        for name in &reference_names {
            unit.attributes
                .entry((*name).clone())
                .or_insert(AttrValue::Null);
        }
        units.push(unit);
    }

    info!(
        "Merged {} measured and {} reference units into {} ({} gaps, {} measured-only)",
        measured.len(),
        reference.len(),
        units.len(),
        report.reference_only.len(),
        report.measured_only.len()
    );
    debug!(
        "Attribute conflicts: {} to reference, {} to measured",
        report.conflicts_to_reference, report.conflicts_to_measured
    );

    Ok(Merged {
        dataset: UnitCollection::new(units)?,
        report,
    })
}

/// Tabular attributes keyed by unit id.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: HashMap<String, BTreeMap<String, AttrValue>>,
}

/// Which side wins when a table column shares a name with a unit attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    Existing,
    Incoming,
}

/// Left join of `table` onto `collection`.
pub fn join_table(collection: &UnitCollection, table: &Table, precedence: Precedence) -> FillResult<UnitCollection> {
    let mut matched = 0;
    let mut units = Vec::with_capacity(collection.len());
    for unit in collection {
        let mut unit = unit.clone();
        let row = table.rows.get(&unit.id);
        if row.is_some() {
            matched += 1;
        }
        for column in &table.columns {
            let incoming = row.and_then(|r| r.get(column));
            match (unit.attributes.contains_key(column), incoming) {
                (false, value) => {
                    unit.attributes
                        .insert(column.clone(), value.cloned().unwrap_or_default());
                }
                (true, Some(value)) if precedence == Precedence::Incoming => {
                    unit.attributes.insert(column.clone(), value.clone());
                }
                _ => {}
            }
        }
        units.push(unit);
    }

    let unknown = table
        .rows
        .keys()
        .filter(|id| !collection.contains(id))
        .count();
    info!("Joined table rows onto {} of {} units", matched, collection.len());
    if unknown > 0 {
        warn!("{} table rows matched no unit and were skipped", unknown);
    }

    UnitCollection::new(units)
}

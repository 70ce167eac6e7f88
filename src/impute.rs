//! Neighbor-mean imputation of suppressed percentages, clamped to the range
//! implied by the suppressed numerator.
//!
//! A suppressed measurement is a percentage whose numerator is known to lie
//! in `suppressed_min..=suppressed_max` (1..=5 by default). With `N` units
//! tested that gives `low = suppressed_min / N * 100` and
//! `high = suppressed_max / N * 100`. The neighbor mean is pulled into that
//! range, checking the lower bound first.

use crate::error::FillResult;
use crate::neighbors::NeighborIndex;
use crate::types::{AttrValue, UnitCollection};
use rayon::prelude::*;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Parallel,
}

#[derive(Debug, Clone)]
pub struct ImputeOptions {
    /// Attribute to fill.
    pub target: String,
    /// Attribute holding the number of individuals tested.
    pub sample_size: String,
    pub suppressed_min: f64,
    pub suppressed_max: f64,
    pub mode: ExecutionMode,
}

impl ImputeOptions {
    pub fn new(target: impl Into<String>, sample_size: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            sample_size: sample_size.into(),
            suppressed_min: 1.0,
            suppressed_max: 5.0,
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Which branch produced an imputed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    LowBound,
    HighBound,
    NeighborMean,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub id: String,
    pub candidate: f64,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub value: f64,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImputationReport {
    pub fills: Vec<Fill>,
    /// Units whose target is still null after the pass.
    pub unresolved: Vec<String>,
}

impl ImputationReport {
    pub fn filled(&self) -> usize {
        self.fills.len()
    }

    pub fn count(&self, resolution: Resolution) -> usize {
        self.fills.iter().filter(|f| f.resolution == resolution).count()
    }
}

#[derive(Debug, Clone)]
pub struct Imputation {
    pub dataset: UnitCollection,
    pub report: ImputationReport,
}

/// Outcome for one unit whose target was null.
enum Outcome {
    Filled(Fill),
    Missing(String),
}

/// Bounds implied by the sample size, if it is defined and positive.
pub fn bounds(sample_size: Option<f64>, suppressed_min: f64, suppressed_max: f64) -> Option<(f64, f64)> {
    match sample_size {
        Some(n) if n > 0.0 => Some((suppressed_min / n * 100.0, suppressed_max / n * 100.0)),
        _ => None,
    }
}

/// Picks the value for a unit. The low check runs before the high check even
/// when `low > high`.
pub fn resolve(candidate: Option<f64>, low: Option<f64>, high: Option<f64>) -> Option<(f64, Resolution)> {
    let candidate = candidate?;
    if let Some(low) = low {
        if low > candidate {
            return Some((low, Resolution::LowBound));
        }
    }
    if let Some(high) = high {
        if high < candidate {
            return Some((high, Resolution::HighBound));
        }
    }
    Some((candidate, Resolution::NeighborMean))
}

/// Fills null `target` values in `dataset` and returns the updated copy.
///
/// Neighbor means read the values as they were before the pass, so the
/// result does not depend on unit order or on `options.mode`.
pub fn impute(
    dataset: &UnitCollection,
    index: &NeighborIndex,
    options: &ImputeOptions,
) -> FillResult<Imputation> {
    let snapshot: Vec<Option<f64>> = dataset
        .iter()
        .map(|unit| unit.attr(&options.target).measurement(&unit.id, &options.target))
        .collect::<FillResult<_>>()?;

    let pending: Vec<usize> = snapshot
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_none())
        .map(|(i, _)| i)
        .collect();

    let fill_one = |&position: &usize| -> FillResult<Outcome> {
        let unit = &dataset.units()[position];
        let n = unit
            .attr(&options.sample_size)
            .measurement(&unit.id, &options.sample_size)?;
        let candidate = index
            .neighbors_of(&unit.id)
            .and_then(|list| neighbor_mean(dataset, &snapshot, list));
        let (low, high) = match bounds(n, options.suppressed_min, options.suppressed_max) {
            Some((low, high)) => (Some(low), Some(high)),
            None => (None, None),
        };
        Ok(match (candidate, resolve(candidate, low, high)) {
            (Some(candidate), Some((value, resolution))) => Outcome::Filled(Fill {
                id: unit.id.clone(),
                candidate,
                low,
                high,
                value,
                resolution,
            }),
            _ => Outcome::Missing(unit.id.clone()),
        })
    };

    let outcomes: Vec<Outcome> = match options.mode {
        ExecutionMode::Sequential => pending.iter().map(fill_one).collect::<FillResult<_>>()?,
        ExecutionMode::Parallel => pending.par_iter().map(fill_one).collect::<FillResult<_>>()?,
    };

    let mut out = dataset.clone();
    let mut report = ImputationReport::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Filled(fill) => {
                if let Some(attrs) = out.position(&fill.id).and_then(|p| out.attributes_mut(p)) {
                    attrs.insert(options.target.clone(), AttrValue::Number(fill.value));
                }
                report.fills.push(fill);
            }
            Outcome::Missing(id) => report.unresolved.push(id),
        }
    }

    info!(
        "Imputed '{}' for {} of {} units ({} low bound, {} high bound, {} neighbor mean)",
        options.target,
        report.filled(),
        pending.len(),
        report.count(Resolution::LowBound),
        report.count(Resolution::HighBound),
        report.count(Resolution::NeighborMean),
    );
    if !report.unresolved.is_empty() {
        warn!(
            "{} units still have no '{}' value",
            report.unresolved.len(),
            options.target
        );
    }

    Ok(Imputation {
        dataset: out,
        report,
    })
}

fn neighbor_mean(dataset: &UnitCollection, snapshot: &[Option<f64>], neighbors: &[String]) -> Option<f64> {
    let values: Vec<f64> = neighbors
        .iter()
        .filter_map(|id| dataset.position(id))
        .filter_map(|p| snapshot[p])
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

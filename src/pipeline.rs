use crate::config::AppConfig;
use crate::data;
use crate::impute::{impute, ImputationReport};
use crate::merge::{join_table, merge_collections, MergePolicy, MergeReport, Precedence};
use crate::neighbors::NeighborIndex;
use crate::render::{self, RenderSummary};
use crate::types::UnitCollection;
use anyhow::{Context, Result};
use tracing::info;

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub dataset: UnitCollection,
    pub merge: MergeReport,
    pub imputation: ImputationReport,
    pub render: RenderSummary,
}

/// Load, merge, join, impute and render, in that order.
pub async fn run(config: &AppConfig) -> Result<PipelineOutput> {
    // 1. Load both polygon sources; either failing aborts the run
    let (measured, reference) = tokio::try_join!(
        data::load_collection(&config.input.measured, &config.input.join_column_measured),
        data::load_collection(&config.input.reference, &config.input.join_column_reference),
    )?;

    // 2. Merge, then attach the economic table
    let policy = MergePolicy::new(config.merge.reference_fields.iter().cloned());
    let merged = merge_collections(&measured, &reference, &policy)?;
    let mut dataset = merged.dataset;
    if let (Some(path), Some(column)) = (&config.input.economics_csv, &config.input.join_column_csv) {
        let table = data::load_table(path, column)?;
        dataset = join_table(&dataset, &table, Precedence::Existing)?;
    }

    // 3. Neighbors over the complete reference geometry
    let index = NeighborIndex::build(&reference, config.imputation.neighbors)
        .context("Failed to build neighbor index")?;
    info!("Built {}-nearest neighbor index over {} units", index.k(), index.len());

    // 4. Fill gaps
    let imputation = impute(&dataset, &index, &config.impute_options())
        .with_context(|| format!("Failed to impute '{}'", config.imputation.target))?;

    // 5. Map
    let summary = render::render(&imputation.dataset, &config.render_config(), &config.output.dir)?;

    Ok(PipelineOutput {
        dataset: imputation.dataset,
        merge: merged.report,
        imputation: imputation.report,
        render: summary,
    })
}

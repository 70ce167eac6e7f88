use crate::impute::{ExecutionMode, ImputeOptions};
use crate::render::RenderConfig;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    pub imputation: ImputationConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    /// URL or path of the partial measurement dataset.
    pub measured: String,
    /// URL or path of the complete boundary dataset.
    pub reference: String,
    pub join_column_measured: String,
    pub join_column_reference: String,
    pub economics_csv: Option<PathBuf>,
    pub join_column_csv: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MergeConfig {
    /// Attributes taken from the reference side on conflict.
    #[serde(default)]
    pub reference_fields: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImputationConfig {
    pub target: String,
    pub sample_size: String,
    pub neighbors: usize,
    #[serde(default = "default_suppressed_min")]
    pub suppressed_min: f64,
    #[serde(default = "default_suppressed_max")]
    pub suppressed_max: f64,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Binning {
    #[default]
    EqualInterval,
    Quantile,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Attribute shaded on the map; defaults to the imputation target.
    pub attribute: Option<String>,
    #[serde(default = "default_palette")]
    pub palette: String,
    #[serde(default = "default_bins")]
    pub bins: usize,
    #[serde(default)]
    pub binning: Binning,
    #[serde(default = "default_nan_color")]
    pub nan_color: String,
    /// Tooltip template, e.g. `"{NAME}: {pct_positive}%"`.
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default = "default_png_width")]
    pub png_width: u32,
}

fn default_suppressed_min() -> f64 {
    1.0
}

fn default_suppressed_max() -> f64 {
    5.0
}

fn default_parallel() -> bool {
    true
}

fn default_palette() -> String {
    "YlOrRd".to_string()
}

fn default_bins() -> usize {
    6
}

fn default_nan_color() -> String {
    "#d3d3d3".to_string()
}

fn default_label() -> String {
    "{id}".to_string()
}

fn default_png_width() -> u32 {
    1600
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.imputation.neighbors == 0 {
            bail!("imputation.neighbors must be at least 1");
        }
        if self.imputation.target.trim().is_empty() || self.imputation.sample_size.trim().is_empty() {
            bail!("imputation.target and imputation.sample_size must be set");
        }
        if self.output.bins == 0 {
            bail!("output.bins must be at least 1");
        }
        if self.output.png_width == 0 {
            bail!("output.png_width must be positive");
        }
        if self.input.economics_csv.is_some() && self.input.join_column_csv.is_none() {
            bail!("input.join_column_csv is required when input.economics_csv is set");
        }
        Ok(())
    }

    pub fn impute_options(&self) -> ImputeOptions {
        let mut options = ImputeOptions::new(&self.imputation.target, &self.imputation.sample_size);
        options.suppressed_min = self.imputation.suppressed_min;
        options.suppressed_max = self.imputation.suppressed_max;
        options.with_mode(if self.imputation.parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        })
    }

    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            attribute: self.map_attribute().to_string(),
            palette: self.output.palette.clone(),
            bins: self.output.bins,
            binning: self.output.binning,
            nan_color: self.output.nan_color.clone(),
            label: self.output.label.clone(),
            png_width: self.output.png_width,
        }
    }

    pub fn map_attribute(&self) -> &str {
        self.output
            .attribute
            .as_deref()
            .unwrap_or(&self.imputation.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[input]
measured = "https://example.org/positivity.geojson"
reference = "data/tracts.geojson"
join_column_measured = "GEOID"
join_column_reference = "GEOID"

[imputation]
target = "pct_positive"
sample_size = "tested"
neighbors = 5

[output]
dir = "output"
"#;

    #[test]
    fn defaults_are_filled_in() {
        let config = AppConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.imputation.suppressed_min, 1.0);
        assert_eq!(config.imputation.suppressed_max, 5.0);
        assert!(config.imputation.parallel);
        assert_eq!(config.output.palette, "YlOrRd");
        assert_eq!(config.output.bins, 6);
        assert_eq!(config.output.binning, Binning::EqualInterval);
        assert!(config.merge.reference_fields.is_empty());
        assert_eq!(config.map_attribute(), "pct_positive");
        assert_eq!(config.impute_options().mode, ExecutionMode::Parallel);
    }

    #[test]
    fn zero_neighbors_rejected() {
        let bad = MINIMAL.replace("neighbors = 5", "neighbors = 0");
        assert!(AppConfig::from_toml(&bad).is_err());
    }

    #[test]
    fn csv_needs_join_column() {
        let bad = MINIMAL.replace(
            "join_column_reference = \"GEOID\"",
            "join_column_reference = \"GEOID\"\neconomics_csv = \"econ.csv\"",
        );
        assert!(AppConfig::from_toml(&bad).is_err());
    }
}

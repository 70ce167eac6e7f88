pub mod config;
pub mod data;
pub mod error;
pub mod impute;
pub mod merge;
pub mod neighbors;
pub mod pipeline;
pub mod render;
pub mod types;

pub use error::{FillError, FillResult};
pub use impute::{impute, ExecutionMode, ImputationReport, ImputeOptions, Resolution};
pub use merge::{join_table, merge_collections, MergePolicy, MergeReport, Precedence};
pub use neighbors::NeighborIndex;
pub use types::{AttrValue, SpatialUnit, UnitCollection};

//! Per-region ingest configuration: which raw files a region receives and which
//! ingest views are materialized from them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use crate::StateCode;

/// Raw file tags with this prefix hold reference data curated by hand rather than
/// data exported by the state agency.
pub const REFERENCE_TABLE_TAG_PREFIX: &str = "RECIDIVIZ_REFERENCE_";

static RAW_TABLE_PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(?P<tag>[A-Za-z0-9_]+)\}").expect("valid raw table placeholder regex")
});

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no configuration for region {0}")]
    UnknownRegion(StateCode),

    #[error("region {0} is configured more than once")]
    DuplicateRegion(StateCode),

    #[error("region {region} ranks ingest view [{view}] which is not defined")]
    UnknownIngestView { region: StateCode, view: String },

    #[error("ingest view [{view}] in region {region} references unknown raw file tag [{tag}]")]
    UnknownRawFileTag {
        region: StateCode,
        view: String,
        tag: String,
    },

    #[error("ingest view [{view}] in region {region} does not read any raw table")]
    NoRawTableDependencies { region: StateCode, view: String },

    #[error("ingest view [{view}] in region {region} has no ordering columns")]
    NoOrderByColumns { region: StateCode, view: String },

    #[error("raw file [{tag}] in region {region} has no primary keys")]
    MissingPrimaryKeys { region: StateCode, tag: String },

    #[error("unable to read region config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid region config: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shape of one raw data file export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFileConfig {
    pub file_tag: String,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    pub columns: Vec<String>,
    /// Code tables map codes to descriptions and may be re-sent with old dates.
    #[serde(default)]
    pub is_code_table: bool,
    /// Each export contains the full history, so only the latest file matters.
    #[serde(default)]
    pub always_historical_export: bool,
}

impl RawFileConfig {
    pub fn is_reference_table(&self) -> bool {
        self.is_code_table || self.file_tag.starts_with(REFERENCE_TABLE_TAG_PREFIX)
    }
}

/// A query over raw tables whose results are materialized incrementally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestViewDefinition {
    pub name: String,
    /// SQL referencing raw tables as `{file_tag}`.
    pub query_template: String,
    pub order_by_columns: Vec<String>,
    /// Create each raw table snapshot as a temp table before running the query
    /// instead of inlining it as a CTE.
    #[serde(default)]
    pub materialize_raw_data_table_views: bool,
}

impl IngestViewDefinition {
    /// Raw file tags referenced by the query, in order of first appearance.
    pub fn raw_table_dependencies(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        RAW_TABLE_PLACEHOLDER_RE
            .captures_iter(&self.query_template)
            .map(|caps| caps["tag"].to_string())
            .filter(|tag| seen.insert(tag.clone()))
            .collect()
    }

    /// Replaces every `{file_tag}` placeholder using `f`.
    pub fn render_query(&self, f: impl Fn(&str) -> String) -> String {
        RAW_TABLE_PLACEHOLDER_RE
            .replace_all(&self.query_template, |caps: &regex::Captures<'_>| {
                f(&caps["tag"])
            })
            .into_owned()
    }

    pub fn order_by_cols_str(&self) -> String {
        self.order_by_columns.join(", ")
    }
}

/// Everything the pipeline needs to know about one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub region_code: StateCode,
    /// Whether ingest is allowed to run for this region.
    #[serde(default)]
    pub launched: bool,
    /// Ingest views in the order they are materialized.
    pub ingest_view_rank_list: Vec<String>,
    #[serde(default)]
    pub raw_files: Vec<RawFileConfig>,
    #[serde(default)]
    pub ingest_views: Vec<IngestViewDefinition>,
}

impl RegionConfig {
    pub fn validate(&self) -> Result<()> {
        for raw_file in &self.raw_files {
            if raw_file.primary_keys.is_empty() && !raw_file.always_historical_export {
                return Err(Error::MissingPrimaryKeys {
                    region: self.region_code.clone(),
                    tag: raw_file.file_tag.clone(),
                });
            }
        }
        for view_name in &self.ingest_view_rank_list {
            if self.ingest_view(view_name).is_none() {
                return Err(Error::UnknownIngestView {
                    region: self.region_code.clone(),
                    view: view_name.clone(),
                });
            }
        }
        for view in &self.ingest_views {
            let deps = view.raw_table_dependencies();
            if deps.is_empty() {
                return Err(Error::NoRawTableDependencies {
                    region: self.region_code.clone(),
                    view: view.name.clone(),
                });
            }
            if view.order_by_columns.is_empty() {
                return Err(Error::NoOrderByColumns {
                    region: self.region_code.clone(),
                    view: view.name.clone(),
                });
            }
            if let Some(tag) = deps.iter().find(|tag| self.raw_file_config(tag).is_none()) {
                return Err(Error::UnknownRawFileTag {
                    region: self.region_code.clone(),
                    view: view.name.clone(),
                    tag: tag.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn raw_file_config(&self, file_tag: &str) -> Option<&RawFileConfig> {
        self.raw_files.iter().find(|c| c.file_tag == file_tag)
    }

    pub fn ingest_view(&self, name: &str) -> Option<&IngestViewDefinition> {
        self.ingest_views.iter().find(|v| v.name == name)
    }

    /// Position of the view in the rank list.
    pub fn ingest_view_rank(&self, name: &str) -> Option<usize> {
        self.ingest_view_rank_list.iter().position(|v| v == name)
    }

    /// Ingest views that are materialized, in rank order.
    pub fn launched_ingest_views(&self) -> impl Iterator<Item = &IngestViewDefinition> {
        self.ingest_view_rank_list
            .iter()
            .filter_map(|name| self.ingest_view(name))
    }

    /// Configs of every raw table the view reads.
    pub fn raw_file_configs_for_view(
        &self,
        view: &IngestViewDefinition,
    ) -> Result<Vec<&RawFileConfig>> {
        view.raw_table_dependencies()
            .into_iter()
            .map(|tag| {
                self.raw_file_config(&tag)
                    .ok_or_else(|| Error::UnknownRawFileTag {
                        region: self.region_code.clone(),
                        view: view.name.clone(),
                        tag,
                    })
            })
            .collect()
    }
}

/// All configured regions, keyed by state code.
#[derive(Debug, Clone, Default)]
pub struct RegionRegistry {
    regions: BTreeMap<StateCode, Arc<RegionConfig>>,
}

impl RegionRegistry {
    pub fn new(regions: impl IntoIterator<Item = RegionConfig>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for region in regions {
            region.validate()?;
            let code = region.region_code.clone();
            if map.insert(code.clone(), Arc::new(region)).is_some() {
                return Err(Error::DuplicateRegion(code));
            }
        }
        Ok(Self { regions: map })
    }

    /// Parses a JSON array of region configs.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let regions: Vec<RegionConfig> = serde_json::from_str(s)?;
        Self::new(regions)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn get(&self, state_code: &StateCode) -> Result<Arc<RegionConfig>> {
        self.regions
            .get(state_code)
            .map(Arc::clone)
            .ok_or_else(|| Error::UnknownRegion(state_code.clone()))
    }

    pub fn state_codes(&self) -> impl Iterator<Item = &StateCode> {
        self.regions.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegionConfig>> {
        self.regions.values()
    }
}

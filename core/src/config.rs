//! Planner settings and the per-query planning snapshot.
//!
//! [`PlannerSettings`] holds the tunables, loaded from a TOML file with
//! `SHARDPLAN_*` environment overrides on top. [`PlanningConfig`] binds
//! them to one query: store handle, authorizations, date range and field
//! sets. It is validated once when built, before anything is scanned.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PlanError, PlanResult};
use crate::shard::{days_between, format_day, parse_day};
use crate::store::{Authorizations, Store};

const ENV_PREFIX: &str = "SHARDPLAN_";

/// Names of the index tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSettings {
    pub shard_index: String,
    /// Day bitmap index; pruning is disabled without it.
    pub day_index: Option<String>,
    /// Year bitmap index used to skip whole years.
    pub year_index: Option<String>,
    /// Holds the shards-per-day counts.
    pub metadata: String,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            shard_index: "shardIndex".into(),
            day_index: Some("shardDayIndex".into()),
            year_index: Some("shardYearIndex".into()),
            metadata: "metadata".into(),
        }
    }
}

/// Shard index lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupSettings {
    /// Threads initializing term scans (default: 8)
    pub num_index_lookup_threads: usize,
    /// Entries fetched per store round trip (default: 100)
    pub max_index_batch_size: usize,
    /// Deepest query tree accepted (default: 2500)
    pub max_depth_threshold: usize,
    /// Datatypes to restrict lookups to; empty means all.
    pub datatypes: Vec<String>,
    /// Whether record evaluation can re-check terms that exceeded the
    /// value expansion threshold on index-only fields.
    pub can_handle_exceeded_value_threshold: bool,
}

impl Default for LookupSettings {
    fn default() -> Self {
        Self {
            num_index_lookup_threads: 8,
            max_index_batch_size: 100,
            max_depth_threshold: 2500,
            datatypes: Vec::new(),
            can_handle_exceeded_value_threshold: true,
        }
    }
}

/// Day and year bitmap pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningSettings {
    /// Threads scanning the day index (default: 8)
    pub num_index_threads: usize,
    /// Pruning starts when the range is longer than this many days.
    pub day_index_threshold: usize,
    /// The year index is consulted when the range is longer than this many
    /// days; -1 disables it.
    pub year_index_threshold: i64,
}

impl Default for PruningSettings {
    fn default() -> Self {
        Self {
            num_index_threads: 8,
            day_index_threshold: 30,
            year_index_threshold: 730,
        }
    }
}

/// Shape of the emitted plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanSettings {
    /// Shard ids that do not match produce no plan.
    pub shard_id_pattern: String,
    pub collect_term_counts: bool,
    pub collect_field_counts: bool,
    /// Reorder each plan's terms, most selective first.
    pub sort_by_counts: bool,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            shard_id_pattern: r"^\d{8}(_\d+)?$".into(),
            collect_term_counts: true,
            collect_field_counts: false,
            sort_by_counts: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    pub tables: TableSettings,
    pub lookup: LookupSettings,
    pub pruning: PruningSettings,
    pub plans: PlanSettings,
}

impl PlannerSettings {
    /// Load settings from a TOML file with environment overrides applied.
    /// Falls back to defaults if the file is not found. `SHARDPLAN_CONFIG`
    /// overrides the path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> PlanResult<Self> {
        ConfigLoader::from_env().load(path)
    }
}

/// Resolves settings from a file and `SHARDPLAN_*` overrides.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    overrides: Vec<(String, String)>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader seeded from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut loader = Self::new();
        for (key, value) in vars {
            if key == "SHARDPLAN_CONFIG" {
                loader.path = Some(PathBuf::from(value));
            } else if key.starts_with(ENV_PREFIX) {
                loader.overrides.push((key, value));
            }
        }
        loader
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    pub fn load<P: AsRef<Path>>(&self, default_path: P) -> PlanResult<PlannerSettings> {
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| default_path.as_ref().to_path_buf());

        let mut settings = match fs::read_to_string(&path) {
            Ok(s) => toml::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                PlannerSettings::default()
            }
            Err(e) => return Err(e.into()),
        };
        self.apply_overrides(&mut settings)?;
        Ok(settings)
    }

    /// Apply overrides in order. A malformed value fails the load.
    pub fn apply_overrides(&self, settings: &mut PlannerSettings) -> PlanResult<()> {
        for (key, value) in &self.overrides {
            let name = key.strip_prefix(ENV_PREFIX).unwrap_or(key);
            match name {
                "LOOKUP_THREADS" => settings.lookup.num_index_lookup_threads = value.parse()?,
                "BATCH_SIZE" => settings.lookup.max_index_batch_size = value.parse()?,
                "MAX_DEPTH" => settings.lookup.max_depth_threshold = value.parse()?,
                "DATATYPES" => {
                    settings.lookup.datatypes = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }
                "INDEX_THREADS" => settings.pruning.num_index_threads = value.parse()?,
                "DAY_INDEX_THRESHOLD" => settings.pruning.day_index_threshold = value.parse()?,
                "YEAR_INDEX_THRESHOLD" => settings.pruning.year_index_threshold = value.parse()?,
                "SHARD_TABLE" => settings.tables.shard_index = value.clone(),
                "DAY_INDEX_TABLE" => settings.tables.day_index = optional(value),
                "YEAR_INDEX_TABLE" => settings.tables.year_index = optional(value),
                "METADATA_TABLE" => settings.tables.metadata = value.clone(),
                "SHARD_ID_PATTERN" => settings.plans.shard_id_pattern = value.clone(),
                "SORT_BY_COUNTS" => settings.plans.sort_by_counts = parse_flag(key, value)?,
                _ => debug!(key = %key, "ignoring unknown override"),
            }
        }
        Ok(())
    }
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_flag(key: &str, value: &str) -> PlanResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PlanError::Config(format!("{key}: expected a boolean, got '{value}'"))),
    }
}

/// Everything one planning run needs. Built once per query and never
/// shared across queries.
#[derive(Clone)]
pub struct PlanningConfig {
    settings: PlannerSettings,
    store: Arc<dyn Store>,
    auths: Authorizations,
    begin: NaiveDate,
    end: NaiveDate,
    indexed_fields: HashSet<String>,
    index_only_fields: HashSet<String>,
    known_fields: HashSet<String>,
    shard_id_pattern: Regex,
}

impl std::fmt::Debug for PlanningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanningConfig")
            .field("begin", &self.begin_day())
            .field("end", &self.end_day())
            .field("indexed_fields", &self.indexed_fields)
            .field("index_only_fields", &self.index_only_fields)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PlanningConfig {
    pub fn builder(store: Arc<dyn Store>) -> PlanningConfigBuilder {
        PlanningConfigBuilder {
            store,
            settings: PlannerSettings::default(),
            auths: Vec::new(),
            begin: None,
            end: None,
            indexed_fields: HashSet::new(),
            index_only_fields: HashSet::new(),
            known_fields: HashSet::new(),
        }
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn auths(&self) -> &Authorizations {
        &self.auths
    }

    pub fn begin(&self) -> NaiveDate {
        self.begin
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn begin_day(&self) -> String {
        format_day(self.begin)
    }

    pub fn end_day(&self) -> String {
        format_day(self.end)
    }

    /// Every day of the range, inclusive.
    pub fn days(&self) -> impl Iterator<Item = String> {
        days_between(self.begin, self.end)
    }

    pub fn days_in_range(&self) -> usize {
        ((self.end - self.begin).num_days() + 1) as usize
    }

    /// Calendar years the range touches.
    pub fn years_in_range(&self) -> usize {
        (self.end.year() - self.begin.year() + 1) as usize
    }

    pub fn indexed_fields(&self) -> &HashSet<String> {
        &self.indexed_fields
    }

    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexed_fields.contains(field)
    }

    pub fn is_index_only(&self, field: &str) -> bool {
        self.index_only_fields.contains(field)
    }

    /// False only for fields missing from a non-empty known-field set.
    pub fn is_known_field(&self, field: &str) -> bool {
        self.known_fields.is_empty()
            || self.known_fields.contains(field)
            || self.indexed_fields.contains(field)
    }

    pub fn shard_id_pattern(&self) -> &Regex {
        &self.shard_id_pattern
    }
}

pub struct PlanningConfigBuilder {
    store: Arc<dyn Store>,
    settings: PlannerSettings,
    auths: Vec<String>,
    begin: Option<String>,
    end: Option<String>,
    indexed_fields: HashSet<String>,
    index_only_fields: HashSet<String>,
    known_fields: HashSet<String>,
}

impl PlanningConfigBuilder {
    pub fn settings(mut self, settings: PlannerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn authorizations<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auths.extend(labels.into_iter().map(Into::into));
        self
    }

    /// Inclusive range, both ends `yyyyMMdd`.
    pub fn date_range(mut self, begin: impl Into<String>, end: impl Into<String>) -> Self {
        self.begin = Some(begin.into());
        self.end = Some(end.into());
        self
    }

    pub fn indexed_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexed_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Fields that exist only in the index. They are indexed too.
    pub fn index_only_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index_only_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Every field known to the data dictionary.
    pub fn known_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> PlanResult<PlanningConfig> {
        let begin = parse_day(
            self.begin
                .as_deref()
                .ok_or_else(|| PlanError::Config("missing begin date".into()))?,
        )?;
        let end = parse_day(
            self.end
                .as_deref()
                .ok_or_else(|| PlanError::Config("missing end date".into()))?,
        )?;
        if begin > end {
            return Err(PlanError::Config(format!(
                "begin date {} is after end date {}",
                format_day(begin),
                format_day(end)
            )));
        }

        let settings = self.settings;
        if settings.lookup.max_index_batch_size == 0 {
            return Err(PlanError::Config("max_index_batch_size must be positive".into()));
        }
        if settings.lookup.max_depth_threshold == 0 {
            return Err(PlanError::Config("max_depth_threshold must be positive".into()));
        }
        if settings.pruning.year_index_threshold < -1 {
            return Err(PlanError::Config(format!(
                "year_index_threshold must be -1 or a day count, got {}",
                settings.pruning.year_index_threshold
            )));
        }
        let shard_id_pattern = Regex::new(&settings.plans.shard_id_pattern)?;

        let mut indexed_fields = self.indexed_fields;
        indexed_fields.extend(self.index_only_fields.iter().cloned());

        Ok(PlanningConfig {
            settings,
            store: self.store,
            auths: Authorizations::new(self.auths),
            begin,
            end,
            indexed_fields,
            index_only_fields: self.index_only_fields,
            known_fields: self.known_fields,
            shard_id_pattern,
        })
    }
}

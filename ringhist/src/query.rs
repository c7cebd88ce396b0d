//! Read-side introspection and range fetch.
//!
//! Both operations work on a committed [`Series`] snapshot, so they never
//! block on, or observe part of, an in-flight sample.
//!
//! - [`status`] reports the definition, last update, last raw values and
//!   the time span of every archive
//! - [`fetch`] reads rows from every archive, oldest first
//!
//! # Fetch Window
//!
//! Per archive with row duration `arc_step`, the newest row is stamped
//! `end = last_update - last_update % arc_step` and the oldest row the ring
//! can hold `start = end - (rows - 1) * arc_step`. Without an explicit range
//! the window is `[start - arc_step, end + arc_step]`. The window is snapped
//! outwards to row boundaries and intersected with the rows actually written,
//! so a fresh archive returns no rows rather than a block of undefined ones.
//!
//! # Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use ringhist::backend::MemoryBackend;
//! use ringhist::query;
//! use ringhist::schema::{DatasourceDef, SeriesDefinition};
//! use ringhist::store::SeriesStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SeriesStore::new(Arc::new(MemoryBackend::new()));
//! let def = SeriesDefinition::new(60, 1_700_006_340)
//!     .with_datasource(DatasourceDef::gauge("heap", 120))
//!     .with_default_archives();
//! store.create("solr.jvm", def)?;
//! store.sample("solr.jvm", 1_700_006_400, [("heap", 10.0)])?;
//!
//! let data = query::fetch(&store, "solr.jvm", &[] as &[&str], None)?;
//! let finest = &data.archives[0];
//! assert_eq!(finest.timestamps, vec![1_700_006_400]);
//! assert_eq!(finest.datasources[0].values, vec![Some(10.0)]);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;

use crate::error::{RequestError, Result};
use crate::schema::{ConsolidationFn, DsKind};
use crate::series::Series;
use crate::store::SeriesStore;

/// Inclusive time range in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    /// First second of the range.
    pub start: u64,
    /// Last second of the range.
    pub end: u64,
}

impl TimeRange {
    /// Creates a range.
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// Read-only description of a series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesStatus {
    /// Series name.
    pub name: String,
    /// Time of the last accepted sample.
    pub last_update: u64,
    /// Base step in seconds.
    pub step: u64,
    /// Number of datasources.
    pub datasource_count: usize,
    /// Number of archives.
    pub archive_count: usize,
    /// Datasource names in definition order.
    pub datasource_names: Vec<String>,
    /// Per-datasource definition and last raw value.
    pub datasources: Vec<DatasourceStatus>,
    /// Per-archive definition and time span.
    pub archives: Vec<ArchiveStatus>,
}

/// Status of one datasource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceStatus {
    /// Datasource name.
    pub name: String,
    /// Gauge or counter.
    pub kind: DsKind,
    /// Heartbeat in seconds.
    pub heartbeat: u64,
    /// Lower bound, if any.
    pub min: Option<f64>,
    /// Upper bound, if any.
    pub max: Option<f64>,
    /// Last raw value submitted, `None` if unknown.
    pub last_value: Option<f64>,
}

/// Status of one archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStatus {
    /// Short description, e.g. `AVERAGE:0.5:10:288`.
    pub archive: String,
    /// Consolidation function.
    pub consolidation_fn: ConsolidationFn,
    /// Maximum tolerated fraction of undefined inputs per row.
    pub xff: f64,
    /// Base steps per row.
    pub steps: u32,
    /// Ring capacity in rows.
    pub rows: u32,
    /// Timestamp of the oldest row the ring can hold.
    pub start_time: u64,
    /// Timestamp of the newest row.
    pub end_time: u64,
}

impl SeriesStatus {
    /// Builds the status report of a series.
    pub fn of(series: &Series) -> Self {
        let def = series.definition();
        let last_update = series.last_update();

        let datasources = def
            .datasources
            .iter()
            .zip(series.last_values())
            .map(|(ds, (_, last_value))| DatasourceStatus {
                name: ds.name.clone(),
                kind: ds.kind,
                heartbeat: ds.heartbeat,
                min: ds.min,
                max: ds.max,
                last_value,
            })
            .collect();

        let archives = series
            .archives()
            .iter()
            .map(|archive| {
                let arc = archive.def();
                ArchiveStatus {
                    archive: arc.dump(),
                    consolidation_fn: arc.consolidation_fn,
                    xff: arc.xff,
                    steps: arc.steps,
                    rows: arc.rows,
                    start_time: archive.start_time(last_update, def.step),
                    end_time: archive.end_time(last_update, def.step),
                }
            })
            .collect();

        Self {
            name: series.name().to_string(),
            last_update,
            step: def.step,
            datasource_count: def.datasources.len(),
            archive_count: def.archives.len(),
            datasource_names: def.datasource_names(),
            datasources,
            archives,
        }
    }
}

/// Rows fetched from all archives of a series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    /// Series name.
    pub name: String,
    /// One entry per archive, in definition order.
    pub archives: Vec<ArchiveData>,
}

/// Rows fetched from one archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveData {
    /// Short description, e.g. `AVERAGE:0.5:10:288`.
    pub archive: String,
    /// Row duration in seconds.
    pub arc_step: u64,
    /// Window that was queried, before snapping to row boundaries.
    pub window: TimeRange,
    /// Row timestamps, oldest first.
    pub timestamps: Vec<u64>,
    /// One column per requested datasource, aligned with `timestamps`.
    pub datasources: Vec<DatasourceValues>,
}

/// Values of one datasource; `None` marks an undefined row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasourceValues {
    /// Datasource name.
    pub name: String,
    /// Row values, aligned with the archive timestamps.
    pub values: Vec<Option<f64>>,
}

/// Returns the status of `name`.
///
/// # Errors
///
/// Returns [`crate::error::StoreError::NotFound`] if the series does not
/// exist, or a backend/codec error if it cannot be loaded.
pub fn status(store: &SeriesStore, name: &str) -> Result<SeriesStatus> {
    let series = store.open(name)?;
    Ok(SeriesStatus::of(&series))
}

/// Fetches rows of `name` from every archive.
///
/// An empty `datasources` selects all datasources in definition order.
/// `range` overrides the default per-archive window.
///
/// # Errors
///
/// - [`crate::error::StoreError::NotFound`] if the series does not exist
/// - [`RequestError::UnknownDatasource`] if a requested datasource is not
///   part of the series
pub fn fetch<S: AsRef<str>>(
    store: &SeriesStore,
    name: &str,
    datasources: &[S],
    range: Option<TimeRange>,
) -> Result<FetchResult> {
    let series = store.open(name)?;
    fetch_series(&series, datasources, range)
}

/// Fetches rows from every archive of an already opened series.
///
/// # Errors
///
/// Returns [`RequestError::UnknownDatasource`] if a requested datasource is
/// not part of the series.
pub fn fetch_series<S: AsRef<str>>(
    series: &Series,
    datasources: &[S],
    range: Option<TimeRange>,
) -> Result<FetchResult> {
    let def = series.definition();
    let (names, indices) = if datasources.is_empty() {
        (def.datasource_names(), (0..def.datasources.len()).collect())
    } else {
        let mut names = Vec::with_capacity(datasources.len());
        let mut indices = Vec::with_capacity(datasources.len());
        for ds in datasources {
            let ds = ds.as_ref();
            let index = def
                .datasource_index(ds)
                .ok_or_else(|| RequestError::UnknownDatasource {
                    series: series.name().to_string(),
                    datasource: ds.to_string(),
                })?;
            names.push(ds.to_string());
            indices.push(index);
        }
        (names, indices)
    };

    let last_update = series.last_update();
    let archives = series
        .archives()
        .iter()
        .map(|archive| {
            let arc_step = archive.arc_step(def.step);
            let window = range.unwrap_or_else(|| {
                TimeRange::new(
                    archive
                        .start_time(last_update, def.step)
                        .saturating_sub(arc_step),
                    archive
                        .end_time(last_update, def.step)
                        .saturating_add(arc_step),
                )
            });
            let rows = archive.read(&indices, last_update, def.step, window.start, window.end);
            let datasources = names
                .iter()
                .zip(rows.values)
                .map(|(name, column)| DatasourceValues {
                    name: name.clone(),
                    values: column
                        .into_iter()
                        .map(|v| (!v.is_nan()).then_some(v))
                        .collect(),
                })
                .collect();
            ArchiveData {
                archive: archive.def().dump(),
                arc_step,
                window,
                timestamps: rows.timestamps,
                datasources,
            }
        })
        .collect();

    Ok(FetchResult {
        name: series.name().to_string(),
        archives,
    })
}

//! Series definition types for ringhist.
//!
//! A [`SeriesDefinition`] fixes everything about a series' storage layout at
//! creation time: the base step, the start time anchor, the datasources that
//! are tracked and the archives that consolidate them at coarser resolutions.
//! Definitions are immutable once a series has been created.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{DefinitionError, Result};

/// Default xff used by the collection archive schedule.
pub const DEFAULT_XFF: f64 = 0.5;

/// Default archive schedule as `(steps_per_row, row_count)` pairs.
///
/// With a 60s base step these keep roughly 4 hours, 48 hours, 2 weeks,
/// 2 months and 1 year of history.
pub const DEFAULT_ARCHIVE_SCHEDULE: [(u32, u32); 5] =
    [(1, 240), (10, 288), (60, 336), (240, 180), (1440, 365)];

/// Complete, immutable layout of one series.
///
/// # Example
///
/// ```rust
/// use ringhist::schema::{ArchiveDef, ConsolidationFn, DatasourceDef, SeriesDefinition};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let def = SeriesDefinition::new(60, 1_700_000_000)
///     .with_datasource(DatasourceDef::gauge("memory.heap.used", 120))
///     .with_datasource(DatasourceDef::counter("QUERY./select.requests", 120))
///     .with_archive(ArchiveDef::new(ConsolidationFn::Average, 0.5, 1, 240))
///     .with_archive(ArchiveDef::new(ConsolidationFn::Average, 0.5, 10, 288));
/// def.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesDefinition {
    /// Base sampling interval in seconds.
    pub step: u64,

    /// Epoch-seconds anchor; the first accepted sample must be later.
    pub start_time: u64,

    /// Tracked datasources, in definition order.
    pub datasources: Vec<DatasourceDef>,

    /// Consolidating archives, in definition order.
    pub archives: Vec<ArchiveDef>,
}

impl SeriesDefinition {
    /// Creates an empty definition with the given step and start time.
    pub fn new(step: u64, start_time: u64) -> Self {
        Self {
            step,
            start_time,
            datasources: Vec::new(),
            archives: Vec::new(),
        }
    }

    /// Adds a datasource.
    #[must_use]
    pub fn with_datasource(mut self, datasource: DatasourceDef) -> Self {
        self.datasources.push(datasource);
        self
    }

    /// Adds an archive.
    #[must_use]
    pub fn with_archive(mut self, archive: ArchiveDef) -> Self {
        self.archives.push(archive);
        self
    }

    /// Adds the default five-archive AVERAGE schedule.
    #[must_use]
    pub fn with_default_archives(mut self) -> Self {
        self.archives.extend(default_archives());
        self
    }

    /// Builds the definition used for a collected registry.
    ///
    /// Counters and gauges get a heartbeat of two collection periods and no
    /// bounds. The start time is set one step before `now` so the first
    /// sample taken at `now` is always accepted.
    pub fn for_collection<S: AsRef<str>>(
        counters: &[S],
        gauges: &[S],
        step: u64,
        now: u64,
    ) -> Self {
        let heartbeat = step.saturating_mul(2);
        let mut def = Self::new(step, now.saturating_sub(step));
        for name in counters {
            def.datasources
                .push(DatasourceDef::counter(name.as_ref(), heartbeat));
        }
        for name in gauges {
            def.datasources.push(DatasourceDef::gauge(name.as_ref(), heartbeat));
        }
        def.with_default_archives()
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError`] if the step is zero, there are no
    /// datasources or archives, a datasource or archive is invalid, or names
    /// and archives are duplicated.
    pub fn validate(&self) -> Result<()> {
        if self.step == 0 {
            return Err(DefinitionError::ZeroStep.into());
        }
        if self.datasources.is_empty() {
            return Err(DefinitionError::NoDatasources.into());
        }
        if self.archives.is_empty() {
            return Err(DefinitionError::NoArchives.into());
        }

        let mut names = HashSet::new();
        for ds in &self.datasources {
            ds.validate()?;
            if !names.insert(ds.name.as_str()) {
                return Err(DefinitionError::DuplicateDatasource {
                    name: ds.name.clone(),
                }
                .into());
            }
        }

        let mut seen = HashSet::new();
        for (index, archive) in self.archives.iter().enumerate() {
            archive.validate(index, self.step)?;
            if !seen.insert((archive.consolidation_fn, archive.steps)) {
                return Err(DefinitionError::DuplicateArchive {
                    consolidation_fn: archive.consolidation_fn,
                    steps: archive.steps,
                }
                .into());
            }
        }

        Ok(())
    }

    /// Returns the index of the named datasource.
    pub fn datasource_index(&self, name: &str) -> Option<usize> {
        self.datasources.iter().position(|ds| ds.name == name)
    }

    /// Returns datasource names in definition order.
    pub fn datasource_names(&self) -> Vec<String> {
        self.datasources.iter().map(|ds| ds.name.clone()).collect()
    }
}

/// Returns the default archive schedule (all AVERAGE, xff 0.5).
pub fn default_archives() -> Vec<ArchiveDef> {
    DEFAULT_ARCHIVE_SCHEDULE
        .iter()
        .map(|&(steps, rows)| ArchiveDef::new(ConsolidationFn::Average, DEFAULT_XFF, steps, rows))
        .collect()
}

/// How raw datasource values are turned into per-second values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsKind {
    /// The submitted value is the level itself.
    Gauge,
    /// The submitted value is a monotonically increasing counter; the stored
    /// value is its rate per second.
    Counter,
}

impl DsKind {
    /// Upper-case name used in status reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "GAUGE",
            Self::Counter => "COUNTER",
        }
    }

    pub(crate) fn to_code(self) -> u8 {
        match self {
            Self::Gauge => 0,
            Self::Counter => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Gauge),
            1 => Some(Self::Counter),
            _ => None,
        }
    }
}

/// Definition of one datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceDef {
    /// Datasource name, unique within the series.
    pub name: String,

    /// Gauge or counter.
    pub kind: DsKind,

    /// Maximum seconds between updates before the gap is stored as undefined.
    pub heartbeat: u64,

    /// Lower bound; values below it are stored as undefined.
    pub min: Option<f64>,

    /// Upper bound; values above it are stored as undefined.
    pub max: Option<f64>,
}

impl DatasourceDef {
    /// Creates an unbounded gauge.
    pub fn gauge(name: impl Into<String>, heartbeat: u64) -> Self {
        Self {
            name: name.into(),
            kind: DsKind::Gauge,
            heartbeat,
            min: None,
            max: None,
        }
    }

    /// Creates an unbounded counter.
    pub fn counter(name: impl Into<String>, heartbeat: u64) -> Self {
        Self {
            name: name.into(),
            kind: DsKind::Counter,
            heartbeat,
            min: None,
            max: None,
        }
    }

    /// Sets the bounds.
    #[must_use]
    pub fn with_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DefinitionError::InvalidDatasourceName {
                name: self.name.clone(),
                reason: "name cannot be empty".to_string(),
            }
            .into());
        }
        if self.heartbeat == 0 {
            return Err(DefinitionError::ZeroHeartbeat {
                name: self.name.clone(),
            }
            .into());
        }
        if let (Some(min), Some(max)) = (self.min, self.max)
            && min > max
        {
            return Err(DefinitionError::InvalidBounds {
                name: self.name.clone(),
                min,
                max,
            }
            .into());
        }
        Ok(())
    }

    /// Returns `value`, or NaN if it falls outside the bounds.
    pub(crate) fn clamp(&self, value: f64) -> f64 {
        if self.min.is_some_and(|min| value < min) || self.max.is_some_and(|max| value > max) {
            return f64::NAN;
        }
        value
    }
}

/// Definition of one consolidating archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDef {
    /// How base-step values are combined into a row.
    pub consolidation_fn: ConsolidationFn,

    /// Maximum fraction of undefined base-step values per row, in `[0, 1)`.
    pub xff: f64,

    /// Base steps per row.
    pub steps: u32,

    /// Ring capacity in rows.
    pub rows: u32,
}

impl ArchiveDef {
    /// Creates an archive definition.
    pub fn new(consolidation_fn: ConsolidationFn, xff: f64, steps: u32, rows: u32) -> Self {
        Self {
            consolidation_fn,
            xff,
            steps,
            rows,
        }
    }

    fn validate(&self, index: usize, step: u64) -> Result<()> {
        if self.steps == 0 {
            return Err(DefinitionError::InvalidArchive {
                index,
                reason: "steps per row cannot be zero".to_string(),
            }
            .into());
        }
        if self.rows == 0 {
            return Err(DefinitionError::InvalidArchive {
                index,
                reason: "row count cannot be zero".to_string(),
            }
            .into());
        }
        if !(0.0..1.0).contains(&self.xff) {
            return Err(DefinitionError::InvalidArchive {
                index,
                reason: format!("xff {} must be >= 0 and < 1", self.xff),
            }
            .into());
        }
        // The whole ring span must be representable in seconds
        let span = step
            .checked_mul(u64::from(self.steps))
            .and_then(|arc_step| arc_step.checked_mul(u64::from(self.rows)));
        if span.is_none() {
            return Err(DefinitionError::InvalidArchive {
                index,
                reason: format!(
                    "{} rows of {} steps of {step}s overflow the time range",
                    self.rows, self.steps
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Short description in the form `AVERAGE:0.5:10:288`.
    pub fn dump(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.consolidation_fn.as_str(),
            self.xff,
            self.steps,
            self.rows
        )
    }
}

/// Aggregation function for consolidating base-step values into archive rows.
///
/// Undefined (NaN) values never take part in the aggregation; the archive's
/// xff decides whether a row with undefined inputs is itself undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsolidationFn {
    /// Arithmetic mean of all defined values.
    Average,

    /// Minimum of all defined values.
    Min,

    /// Maximum of all defined values.
    Max,

    /// Earliest defined value.
    First,

    /// Most recent defined value.
    Last,

    /// Sum of all defined values.
    Sum,

    /// Count of defined values.
    Count,
}

impl ConsolidationFn {
    /// Upper-case name used in status reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::First => "FIRST",
            Self::Last => "LAST",
            Self::Sum => "SUM",
            Self::Count => "COUNT",
        }
    }

    pub(crate) fn to_code(self) -> u8 {
        match self {
            Self::Average => 0,
            Self::Min => 1,
            Self::Max => 2,
            Self::First => 3,
            Self::Last => 4,
            Self::Sum => 5,
            Self::Count => 6,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Average,
            1 => Self::Min,
            2 => Self::Max,
            3 => Self::First,
            4 => Self::Last,
            5 => Self::Sum,
            6 => Self::Count,
            _ => return None,
        })
    }

    /// Folds one defined value into a running accumulator.
    ///
    /// The accumulator starts as NaN. `value` must not be NaN.
    pub fn accumulate(self, acc: f64, value: f64) -> f64 {
        if acc.is_nan() {
            return match self {
                Self::Count => 1.0,
                _ => value,
            };
        }
        match self {
            Self::Average | Self::Sum => acc + value,
            Self::Min => acc.min(value),
            Self::Max => acc.max(value),
            Self::First => acc,
            Self::Last => value,
            Self::Count => acc + 1.0,
        }
    }

    /// Turns an accumulator into the row value, given how many defined values
    /// went into it.
    #[allow(clippy::cast_precision_loss)] // row windows are far below 2^52 steps
    pub fn finish(self, acc: f64, defined: u64) -> f64 {
        if acc.is_nan() || defined == 0 {
            return f64::NAN;
        }
        match self {
            Self::Average => acc / defined as f64,
            _ => acc,
        }
    }

    /// Row value for a window made of `count` copies of `value`.
    #[allow(clippy::cast_precision_loss)]
    pub fn uniform(self, value: f64, count: u64) -> f64 {
        if value.is_nan() || count == 0 {
            return f64::NAN;
        }
        match self {
            Self::Sum => value * count as f64,
            Self::Count => count as f64,
            _ => value,
        }
    }

    /// Applies this consolidation function to a slice of values.
    ///
    /// NaN values are skipped. If all values are NaN or the slice is empty,
    /// returns NaN.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ringhist::schema::ConsolidationFn;
    ///
    /// let values = [1.0, 2.0, f64::NAN, 4.0];
    ///
    /// let avg = ConsolidationFn::Average.apply(&values);
    /// assert!((avg - (7.0 / 3.0)).abs() < 1e-10);
    /// assert_eq!(ConsolidationFn::Min.apply(&values), 1.0);
    /// assert_eq!(ConsolidationFn::Max.apply(&values), 4.0);
    /// assert_eq!(ConsolidationFn::First.apply(&values), 1.0);
    /// assert_eq!(ConsolidationFn::Last.apply(&values), 4.0);
    /// assert_eq!(ConsolidationFn::Sum.apply(&values), 7.0);
    /// assert_eq!(ConsolidationFn::Count.apply(&values), 3.0);
    /// ```
    pub fn apply(self, values: &[f64]) -> f64 {
        let mut acc = f64::NAN;
        let mut defined = 0u64;
        for &value in values.iter().filter(|v| !v.is_nan()) {
            acc = self.accumulate(acc, value);
            defined += 1;
        }
        self.finish(acc, defined)
    }
}

//! Series state and the sample (write) path.
//!
//! A [`Series`] owns the full state of one named series: its definition, the
//! last update time, per-datasource bookkeeping for the base step in progress
//! and every archive ring.
//!
//! # Sample Flow
//!
//! 1. Reject timestamps at or before the last update (no mutation)
//! 2. Turn each submitted value into an update value: the level for gauges,
//!    the per-second rate for counters, undefined if the gap exceeds the
//!    heartbeat or the value is out of bounds
//! 3. Accumulate the update value over the elapsed seconds, weighted by time
//! 4. For every base step boundary crossed, compute one base-step value per
//!    datasource and push it into all archives
//!
//! Unknown datasource names are ignored and datasources missing from a
//! sample are treated as undefined for the elapsed interval.

use crate::archive::{Archive, normalize};
use crate::error::{Result, SampleError};
use crate::schema::{DatasourceDef, DsKind, SeriesDefinition};

const MAX_32BIT: f64 = 4_294_967_296.0;
const MAX_64BIT: f64 = 18_446_744_073_709_551_616.0;

/// Per-datasource state for the base step in progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DsState {
    /// Last raw value submitted, NaN if unknown.
    pub(crate) last_value: f64,
    /// Sum of update value × seconds over the defined part of the step.
    pub(crate) accum_value: f64,
    /// Seconds of the current step with an undefined update value.
    pub(crate) nan_seconds: u64,
}

/// Full in-memory state of one series.
#[derive(Debug, Clone)]
pub struct Series {
    name: String,
    def: SeriesDefinition,
    last_update: u64,
    datasources: Vec<DsState>,
    archives: Vec<Archive>,
}

impl Series {
    /// Creates a fresh series from a definition.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::DefinitionError`] if the definition is invalid.
    pub fn create(name: impl Into<String>, def: SeriesDefinition) -> Result<Self> {
        def.validate()?;
        let step = def.step;
        let last_update = def.start_time;
        let ds_count = def.datasources.len();

        let datasources = vec![
            DsState {
                last_value: f64::NAN,
                accum_value: 0.0,
                nan_seconds: last_update % step,
            };
            ds_count
        ];
        let archives = def
            .archives
            .iter()
            .map(|arc| Archive::new(arc.clone(), ds_count, last_update, step))
            .collect();

        Ok(Self {
            name: name.into(),
            def,
            last_update,
            datasources,
            archives,
        })
    }

    pub(crate) fn from_parts(
        name: String,
        def: SeriesDefinition,
        last_update: u64,
        datasources: Vec<DsState>,
        archives: Vec<Archive>,
    ) -> Self {
        Self {
            name,
            def,
            last_update,
            datasources,
            archives,
        }
    }

    /// Returns the series name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the immutable definition.
    pub fn definition(&self) -> &SeriesDefinition {
        &self.def
    }

    /// Returns the time of the last accepted sample (or the start time).
    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    /// Returns the archives in definition order.
    pub fn archives(&self) -> &[Archive] {
        &self.archives
    }

    pub(crate) fn ds_states(&self) -> &[DsState] {
        &self.datasources
    }

    /// Returns the last raw value submitted for each datasource, `None` if
    /// unknown.
    pub fn last_values(&self) -> Vec<(String, Option<f64>)> {
        self.def
            .datasources
            .iter()
            .zip(&self.datasources)
            .map(|(def, state)| {
                let value = (!state.last_value.is_nan()).then_some(state.last_value);
                (def.name.clone(), value)
            })
            .collect()
    }

    /// Applies one sample.
    ///
    /// `values` maps datasource names to raw values. Names that are not part
    /// of the definition are ignored.
    ///
    /// # Errors
    ///
    /// - [`SampleError::Stale`] if `timestamp <= last_update()`
    /// - [`SampleError::InvalidTimestamp`] if `timestamp` is too large to
    ///   advance the base step
    ///
    /// On error the series is left untouched.
    pub fn sample<'a, I>(&mut self, timestamp: u64, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        if timestamp <= self.last_update {
            return Err(SampleError::Stale {
                timestamp,
                last_update: self.last_update,
            }
            .into());
        }
        let step = self.def.step;
        if timestamp.checked_add(step).is_none() {
            return Err(SampleError::InvalidTimestamp { timestamp }.into());
        }

        let mut new_values = vec![f64::NAN; self.def.datasources.len()];
        for (name, value) in values {
            if let Some(index) = self.def.datasource_index(name) {
                new_values[index] = value;
            }
        }

        let last_time = self.last_update;
        let step_start = normalize(last_time, step);
        let step_end = step_start + step;

        if timestamp < step_end {
            // Still inside the same base step
            for ((def, state), &new_value) in self
                .def
                .datasources
                .iter()
                .zip(self.datasources.iter_mut())
                .zip(&new_values)
            {
                let update = update_value(def, last_time, state.last_value, timestamp, new_value);
                accumulate(state, last_time, timestamp, update);
                state.last_value = new_value;
            }
        } else {
            let boundary = normalize(timestamp, step);
            let num_steps = (boundary - step_end) / step + 1;
            let mut step_values = Vec::with_capacity(new_values.len());

            for ((def, state), &new_value) in self
                .def
                .datasources
                .iter()
                .zip(self.datasources.iter_mut())
                .zip(&new_values)
            {
                let update = update_value(def, last_time, state.last_value, timestamp, new_value);
                accumulate(state, last_time, boundary, update);
                step_values.push(step_total(def, state, step_start, boundary));

                state.accum_value = 0.0;
                state.nan_seconds = 0;
                accumulate(state, boundary, timestamp, update);
                state.last_value = new_value;
            }

            for archive in &mut self.archives {
                archive.archive(&step_values, num_steps, step_end, step);
            }
        }

        self.last_update = timestamp;
        Ok(())
    }
}

/// Converts a raw value into the per-second value for `(old_time, new_time]`.
#[allow(clippy::cast_precision_loss)] // second deltas are far below 2^52
fn update_value(
    def: &DatasourceDef,
    old_time: u64,
    old_value: f64,
    new_time: u64,
    new_value: f64,
) -> f64 {
    if new_time - old_time > def.heartbeat {
        return f64::NAN;
    }
    let value = match def.kind {
        DsKind::Gauge => new_value,
        DsKind::Counter => {
            if new_value.is_nan() || old_value.is_nan() {
                f64::NAN
            } else {
                let mut diff = new_value - old_value;
                if diff < 0.0 {
                    diff += MAX_32BIT;
                }
                if diff < 0.0 {
                    diff += MAX_64BIT - MAX_32BIT;
                }
                if diff >= 0.0 {
                    diff / (new_time - old_time) as f64
                } else {
                    f64::NAN
                }
            }
        }
    };
    if value.is_nan() {
        return value;
    }
    def.clamp(value)
}

#[allow(clippy::cast_precision_loss)]
fn accumulate(state: &mut DsState, old_time: u64, new_time: u64, update: f64) {
    let seconds = new_time - old_time;
    if update.is_nan() {
        state.nan_seconds += seconds;
    } else {
        state.accum_value += update * seconds as f64;
    }
}

/// Base-step value for `(step_start, boundary]`.
#[allow(clippy::cast_precision_loss)]
fn step_total(def: &DatasourceDef, state: &DsState, step_start: u64, boundary: u64) -> f64 {
    let valid = (boundary - step_start).saturating_sub(state.nan_seconds);
    if state.nan_seconds <= def.heartbeat && valid > 0 {
        state.accum_value / valid as f64
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ArchiveDef, ConsolidationFn};

    const STEP: u64 = 60;
    /// Aligned to every archive step used below.
    const T0: u64 = 1_700_006_400;

    fn gauge_series(rows: u32) -> Series {
        let def = SeriesDefinition::new(STEP, T0 - STEP)
            .with_datasource(DatasourceDef::gauge("g", 2 * STEP))
            .with_archive(ArchiveDef::new(ConsolidationFn::Average, 0.5, 1, rows));
        Series::create("test", def).unwrap()
    }

    fn finest(series: &Series) -> (Vec<u64>, Vec<f64>) {
        let rows = series.archives()[0].read(&[0], series.last_update(), STEP, 0, u64::MAX / 2);
        (rows.timestamps, rows.values.into_iter().next().unwrap())
    }

    #[test]
    fn test_gauge_aligned_samples() {
        let mut s = gauge_series(240);
        s.sample(T0, [("g", 10.0)]).unwrap();
        s.sample(T0 + 60, [("g", 20.0)]).unwrap();
        s.sample(T0 + 120, [("g", 30.0)]).unwrap();

        let (ts, values) = finest(&s);
        assert_eq!(ts, vec![T0, T0 + 60, T0 + 120]);
        assert_eq!(values, vec![10.0, 20.0, 30.0]);
        assert_eq!(s.last_update(), T0 + 120);
    }

    #[test]
    fn test_stale_sample_is_noop() {
        let mut s = gauge_series(10);
        s.sample(T0, [("g", 10.0)]).unwrap();
        let before = crate::codec::encode(&s);

        let err = s.sample(T0, [("g", 99.0)]).unwrap_err();
        assert!(err.is_stale());
        let err = s.sample(T0 - 30, [("g", 99.0)]).unwrap_err();
        assert!(err.is_stale());
        assert_eq!(crate::codec::encode(&s), before);
    }

    #[test]
    fn test_unknown_datasource_ignored() {
        let mut s = gauge_series(10);
        s.sample(T0, [("g", 1.0), ("nope", 5.0)]).unwrap();
        assert_eq!(s.last_values(), vec![("g".to_string(), Some(1.0))]);
    }

    #[test]
    fn test_unaligned_samples_are_time_weighted() {
        let mut s = gauge_series(10);
        s.sample(T0, [("g", 10.0)]).unwrap();
        // Covers (T0, T0+90]: whole step at T0+60, half of the next
        s.sample(T0 + 90, [("g", 40.0)]).unwrap();
        // Covers (T0+90, T0+120]
        s.sample(T0 + 120, [("g", 20.0)]).unwrap();

        let (ts, values) = finest(&s);
        assert_eq!(ts, vec![T0, T0 + 60, T0 + 120]);
        assert_eq!(values, vec![10.0, 40.0, 30.0]);
    }

    #[test]
    fn test_heartbeat_gap_is_undefined() {
        let mut s = gauge_series(10);
        s.sample(T0, [("g", 10.0)]).unwrap();
        // 180s of silence with a 120s heartbeat
        s.sample(T0 + 180, [("g", 50.0)]).unwrap();
        s.sample(T0 + 240, [("g", 60.0)]).unwrap();

        let (ts, values) = finest(&s);
        assert_eq!(ts, vec![T0, T0 + 60, T0 + 120, T0 + 180, T0 + 240]);
        assert_eq!(values[0], 10.0);
        assert!(values[1..4].iter().all(|v| v.is_nan()));
        assert_eq!(values[4], 60.0);
    }

    #[test]
    fn test_missing_value_is_undefined() {
        let mut s = gauge_series(10);
        s.sample(T0, [("g", 10.0)]).unwrap();
        s.sample(T0 + 60, Vec::<(&str, f64)>::new()).unwrap();
        s.sample(T0 + 120, [("g", 30.0)]).unwrap();

        let (_, values) = finest(&s);
        assert_eq!(values[0], 10.0);
        assert!(values[1].is_nan());
        assert_eq!(values[2], 30.0);
    }

    #[test]
    fn test_counter_rate_and_wrap() {
        let def = SeriesDefinition::new(STEP, T0 - STEP)
            .with_datasource(DatasourceDef::counter("c", 2 * STEP))
            .with_archive(ArchiveDef::new(ConsolidationFn::Average, 0.5, 1, 10));
        let mut s = Series::create("test", def).unwrap();

        s.sample(T0, [("c", 4_294_966_096.0)]).unwrap();
        s.sample(T0 + 60, [("c", 4_294_966_696.0)]).unwrap();
        // Wrapped past 2^32: 600 more events
        s.sample(T0 + 120, [("c", 0.0)]).unwrap();

        let (_, values) = finest(&s);
        // No previous raw value for the first step
        assert!(values[0].is_nan());
        assert_eq!(values[1], 10.0);
        assert_eq!(values[2], 10.0);
    }

    #[test]
    fn test_bounds_make_values_undefined() {
        let def = SeriesDefinition::new(STEP, T0 - STEP)
            .with_datasource(
                DatasourceDef::gauge("pct", 2 * STEP).with_bounds(Some(0.0), Some(100.0)),
            )
            .with_archive(ArchiveDef::new(ConsolidationFn::Average, 0.5, 1, 10));
        let mut s = Series::create("test", def).unwrap();

        s.sample(T0, [("pct", 50.0)]).unwrap();
        s.sample(T0 + 60, [("pct", 150.0)]).unwrap();

        let (_, values) = finest(&s);
        assert_eq!(values[0], 50.0);
        assert!(values[1].is_nan());
    }

    #[test]
    fn test_consolidation_cascade() {
        let def = SeriesDefinition::new(STEP, T0 - STEP)
            .with_datasource(DatasourceDef::gauge("g", 2 * STEP))
            .with_archive(ArchiveDef::new(ConsolidationFn::Average, 0.5, 1, 10))
            .with_archive(ArchiveDef::new(ConsolidationFn::Max, 0.5, 4, 10));
        let mut s = Series::create("test", def).unwrap();

        // T0 - 60 is mid-row for the 4-step archive: three steps before the
        // series start count as undefined, so the first row is undefined.
        for i in 0..9u32 {
            s.sample(T0 + u64::from(i) * STEP, [("g", f64::from(i))]).unwrap();
        }

        let coarse = &s.archives()[1];
        let rows = coarse.read(&[0], s.last_update(), STEP, 0, u64::MAX / 2);
        assert_eq!(rows.timestamps, vec![T0, T0 + 240, T0 + 480]);
        assert!(rows.values[0][0].is_nan());
        assert_eq!(rows.values[0][1], 4.0);
        assert_eq!(rows.values[0][2], 8.0);
    }

    #[test]
    fn test_sub_step_samples_accumulate() {
        let mut s = gauge_series(10);
        s.sample(T0, [("g", 10.0)]).unwrap();
        s.sample(T0 + 20, [("g", 30.0)]).unwrap();
        s.sample(T0 + 60, [("g", 60.0)]).unwrap();

        let (_, values) = finest(&s);
        // (30 * 20 + 60 * 40) / 60
        assert_eq!(values, vec![10.0, 50.0]);
    }

    #[test]
    fn test_invalid_timestamp() {
        let mut s = gauge_series(10);
        let err = s.sample(u64::MAX, [("g", 1.0)]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::HistoryError::Sample(SampleError::InvalidTimestamp { .. })
        ));
    }
}

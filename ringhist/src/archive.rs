//! Fixed-capacity consolidating archives.
//!
//! An [`Archive`] turns a stream of base-step values (one per datasource per
//! step) into rows of `steps` base steps each and keeps the newest `rows` of
//! them in a ring buffer.
//!
//! # Design
//!
//! - Rows are stored row-major: `values[row * ds_count + ds]`
//! - `pointer` is the next row to overwrite, which is also the oldest row
//! - Each datasource carries an accumulator and an undefined-step counter for
//!   the row currently being built
//! - A row is finalized when the base step that was just accumulated ends on
//!   an archive-step boundary (`time % (step * steps) == 0`), so rows of all
//!   series line up on the same wall-clock boundaries
//! - NaN is the undefined sentinel inside the ring

use crate::schema::ArchiveDef;

/// Rounds `time` down to a multiple of `step`.
#[inline]
pub(crate) fn normalize(time: u64, step: u64) -> u64 {
    time - time % step
}

/// Consolidation state of one datasource for the row being built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ArcState {
    /// Running accumulator, NaN until a defined value arrives.
    pub(crate) accum: f64,
    /// Base steps in this row whose value was undefined.
    pub(crate) nan_steps: u64,
}

/// One consolidating archive of a series.
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    def: ArchiveDef,
    ds_count: usize,
    /// Next row to write (oldest row once the ring is full).
    pointer: u32,
    /// Rows written since creation, saturating at capacity.
    written: u32,
    states: Vec<ArcState>,
    values: Vec<f64>,
}

impl Archive {
    /// Creates an empty archive for a series whose last update is
    /// `last_update`.
    ///
    /// Base steps between the start of the current row and `last_update` are
    /// counted as undefined, so a series created mid-row does not report a
    /// first row built from a fraction of its inputs.
    pub(crate) fn new(def: ArchiveDef, ds_count: usize, last_update: u64, step: u64) -> Self {
        let arc_step = step * u64::from(def.steps);
        let init_nan_steps = (normalize(last_update, step) - normalize(last_update, arc_step)) / step;
        let rows = def.rows as usize;
        Self {
            def,
            ds_count,
            pointer: 0,
            written: 0,
            states: vec![
                ArcState {
                    accum: f64::NAN,
                    nan_steps: init_nan_steps,
                };
                ds_count
            ],
            values: vec![f64::NAN; rows * ds_count],
        }
    }

    /// Reassembles an archive from decoded parts.
    pub(crate) fn from_parts(
        def: ArchiveDef,
        ds_count: usize,
        pointer: u32,
        written: u32,
        states: Vec<ArcState>,
        values: Vec<f64>,
    ) -> Self {
        Self {
            def,
            ds_count,
            pointer,
            written,
            states,
            values,
        }
    }

    /// Returns the archive definition.
    pub fn def(&self) -> &ArchiveDef {
        &self.def
    }

    /// Returns the ring position of the next row to be written.
    pub fn pointer(&self) -> u32 {
        self.pointer
    }

    /// Returns how many rows have been written, capped at the row count.
    pub fn written(&self) -> u32 {
        self.written
    }

    pub(crate) fn states(&self) -> &[ArcState] {
        &self.states
    }

    pub(crate) fn raw_values(&self) -> &[f64] {
        &self.values
    }

    /// Row duration in seconds.
    pub fn arc_step(&self, step: u64) -> u64 {
        step * u64::from(self.def.steps)
    }

    /// Timestamp of the newest row.
    pub fn end_time(&self, last_update: u64, step: u64) -> u64 {
        normalize(last_update, self.arc_step(step))
    }

    /// Timestamp of the oldest row the ring can hold.
    pub fn start_time(&self, last_update: u64, step: u64) -> u64 {
        let arc_step = self.arc_step(step);
        self.end_time(last_update, step)
            .saturating_sub(u64::from(self.def.rows - 1) * arc_step)
    }

    /// Feeds `num_updates` base steps carrying the same per-datasource
    /// `values` into the archive.
    ///
    /// `first_update_time` is the end of the first of those base steps.
    pub(crate) fn archive(
        &mut self,
        values: &[f64],
        mut num_updates: u64,
        first_update_time: u64,
        step: u64,
    ) {
        debug_assert_eq!(values.len(), self.ds_count);
        let arc_step = self.arc_step(step);
        let steps = u64::from(self.def.steps);

        // Finish the row in progress
        let mut update_time = first_update_time;
        while num_updates > 0 {
            self.accumulate(values);
            num_updates -= 1;
            if update_time % arc_step == 0 {
                self.finalize_row();
                break;
            }
            update_time += step;
        }

        // Whole rows made of identical inputs
        let bulk = (num_updates / steps).min(u64::from(self.def.rows));
        if bulk > 0 {
            let f = self.def.consolidation_fn;
            let row: Vec<f64> = values.iter().map(|&v| f.uniform(v, steps)).collect();
            for _ in 0..bulk {
                self.store_row(&row);
            }
        }

        // Start of the next row
        for _ in 0..num_updates % steps {
            self.accumulate(values);
        }
    }

    fn accumulate(&mut self, values: &[f64]) {
        let f = self.def.consolidation_fn;
        for (state, &value) in self.states.iter_mut().zip(values) {
            if value.is_nan() {
                state.nan_steps += 1;
            } else {
                state.accum = f.accumulate(state.accum, value);
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn finalize_row(&mut self) {
        let steps = u64::from(self.def.steps);
        let tolerated = self.def.xff * steps as f64;
        let f = self.def.consolidation_fn;
        let row: Vec<f64> = self
            .states
            .iter()
            .map(|state| {
                if state.nan_steps as f64 <= tolerated {
                    f.finish(state.accum, steps.saturating_sub(state.nan_steps))
                } else {
                    f64::NAN
                }
            })
            .collect();
        for state in &mut self.states {
            state.accum = f64::NAN;
            state.nan_steps = 0;
        }
        self.store_row(&row);
    }

    fn store_row(&mut self, row: &[f64]) {
        let offset = self.pointer as usize * self.ds_count;
        self.values[offset..offset + self.ds_count].copy_from_slice(row);
        self.pointer = (self.pointer + 1) % self.def.rows;
        self.written = (self.written + 1).min(self.def.rows);
    }

    /// Value at chronological `index` (0 = oldest slot of the full ring).
    fn value_at(&self, index: u64, ds: usize) -> f64 {
        let rows = u64::from(self.def.rows);
        #[allow(clippy::cast_possible_truncation)] // bounded by rows (u32)
        let slot = ((u64::from(self.pointer) + index) % rows) as usize;
        self.values[slot * self.ds_count + ds]
    }

    /// Reads the rows whose timestamps fall in `[from, to]` after snapping
    /// `from` down and `to` up to row boundaries.
    ///
    /// Only rows the ring has actually written are returned, oldest first.
    pub(crate) fn read(
        &self,
        ds_indices: &[usize],
        last_update: u64,
        step: u64,
        from: u64,
        to: u64,
    ) -> ArchiveRows {
        let arc_step = self.arc_step(step);
        let mut rows = ArchiveRows {
            timestamps: Vec::new(),
            values: vec![Vec::new(); ds_indices.len()],
        };
        if self.written == 0 || from > to {
            return rows;
        }

        let end = self.end_time(last_update, step);
        let first_written = end.saturating_sub(u64::from(self.written - 1) * arc_step);
        let fetch_start = normalize(from, arc_step);
        let mut fetch_end = normalize(to, arc_step);
        if fetch_end < to {
            fetch_end = fetch_end.saturating_add(arc_step);
        }

        let match_start = fetch_start.max(first_written);
        let match_end = fetch_end.min(end);
        if match_start > match_end {
            return rows;
        }

        let last_index = u64::from(self.def.rows - 1);
        let mut time = match_start;
        while time <= match_end {
            let index = last_index - (end - time) / arc_step;
            rows.timestamps.push(time);
            for (column, &ds) in rows.values.iter_mut().zip(ds_indices) {
                column.push(self.value_at(index, ds));
            }
            time += arc_step;
        }
        rows
    }
}

/// Rows read from one archive, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ArchiveRows {
    pub(crate) timestamps: Vec<u64>,
    /// One column per requested datasource, NaN for undefined rows.
    pub(crate) values: Vec<Vec<f64>>,
}

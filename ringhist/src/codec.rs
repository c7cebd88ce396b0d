//! Versioned binary layout of a series.
//!
//! Backends store each series as one opaque blob. The blob is read back
//! across process restarts, so the layout is explicit and versioned.
//!
//! # Blob Format (v1, little-endian)
//!
//! ```text
//! magic "RHST" | version u32 | name str
//! step u64 | start_time u64 | last_update u64
//! ds_count u32, then per datasource:
//!     name str | kind u8 | heartbeat u64 | min f64 | max f64
//!     last_value f64 | accum_value f64 | nan_seconds u64
//! arc_count u32, then per archive:
//!     fn u8 | xff f64 | steps u32 | rows u32 | pointer u32 | written u32
//!     per datasource: accum f64 | nan_steps u64
//!     rows × ds_count f64 values (row-major)
//! ```
//!
//! Strings are a `u32` byte length followed by UTF-8. Unbounded min/max and
//! undefined values are stored as NaN. Decoding validates every count and
//! rejects trailing bytes, and `encode(decode(blob)) == blob` for any blob
//! this module produced.

use crate::archive::{ArcState, Archive};
use crate::error::{CodecError, Result};
use crate::schema::{ArchiveDef, ConsolidationFn, DatasourceDef, DsKind, SeriesDefinition};
use crate::series::{DsState, Series};

/// Magic bytes identifying a series blob.
const MAGIC: [u8; 4] = *b"RHST";

/// Current blob format version.
const VERSION: u32 = 1;

/// Serializes the full state of a series.
pub fn encode(series: &Series) -> Vec<u8> {
    let def = series.definition();
    let mut w = Writer::default();

    w.bytes(&MAGIC);
    w.u32(VERSION);
    w.str(series.name());
    w.u64(def.step);
    w.u64(def.start_time);
    w.u64(series.last_update());

    w.len(def.datasources.len());
    for (ds, state) in def.datasources.iter().zip(series.ds_states()) {
        w.str(&ds.name);
        w.u8(ds.kind.to_code());
        w.u64(ds.heartbeat);
        w.f64(ds.min.unwrap_or(f64::NAN));
        w.f64(ds.max.unwrap_or(f64::NAN));
        w.f64(state.last_value);
        w.f64(state.accum_value);
        w.u64(state.nan_seconds);
    }

    w.len(series.archives().len());
    for archive in series.archives() {
        let arc = archive.def();
        w.u8(arc.consolidation_fn.to_code());
        w.f64(arc.xff);
        w.u32(arc.steps);
        w.u32(arc.rows);
        w.u32(archive.pointer());
        w.u32(archive.written());
        for state in archive.states() {
            w.f64(state.accum);
            w.u64(state.nan_steps);
        }
        for &value in archive.raw_values() {
            w.f64(value);
        }
    }

    w.buf
}

/// Deserializes a series blob.
///
/// # Errors
///
/// Returns [`CodecError`] if the magic or version is wrong, the blob is
/// truncated or has trailing bytes, or the decoded state is inconsistent.
pub fn decode(bytes: &[u8]) -> Result<Series> {
    let mut r = Reader::new(bytes);

    let magic = r.array4()?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic {
            expected: MAGIC,
            found: magic,
        }
        .into());
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion {
            expected: VERSION,
            found: version,
        }
        .into());
    }

    let name = r.str()?;
    let step = r.u64()?;
    let start_time = r.u64()?;
    let last_update = r.u64()?;
    let mut def = SeriesDefinition::new(step, start_time);

    let ds_count = r.u32()? as usize;
    let mut ds_states = Vec::with_capacity(ds_count.min(1024));
    for _ in 0..ds_count {
        let ds_name = r.str()?;
        let kind_code = r.u8()?;
        let kind = DsKind::from_code(kind_code)
            .ok_or_else(|| invalid(format!("unknown datasource kind {kind_code}")))?;
        let heartbeat = r.u64()?;
        let min = non_nan(r.f64()?);
        let max = non_nan(r.f64()?);
        def.datasources.push(DatasourceDef {
            name: ds_name,
            kind,
            heartbeat,
            min,
            max,
        });
        ds_states.push(DsState {
            last_value: r.f64()?,
            accum_value: r.f64()?,
            nan_seconds: r.u64()?,
        });
    }

    let arc_count = r.u32()? as usize;
    let mut archives = Vec::with_capacity(arc_count.min(64));
    for _ in 0..arc_count {
        let fn_code = r.u8()?;
        let consolidation_fn = ConsolidationFn::from_code(fn_code)
            .ok_or_else(|| invalid(format!("unknown consolidation function {fn_code}")))?;
        let xff = r.f64()?;
        let steps = r.u32()?;
        let rows = r.u32()?;
        let pointer = r.u32()?;
        let written = r.u32()?;
        if rows == 0 || pointer >= rows || written > rows {
            return Err(invalid(format!(
                "archive cursor out of range: pointer {pointer}, written {written}, rows {rows}"
            )));
        }

        let mut states = Vec::with_capacity(ds_count);
        for _ in 0..ds_count {
            states.push(ArcState {
                accum: r.f64()?,
                nan_steps: r.u64()?,
            });
        }

        let value_count = (rows as usize)
            .checked_mul(ds_count)
            .ok_or_else(|| invalid("archive size overflows".to_string()))?;
        r.ensure(value_count.saturating_mul(8))?;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            values.push(r.f64()?);
        }

        let arc_def = ArchiveDef::new(consolidation_fn, xff, steps, rows);
        def.archives.push(arc_def.clone());
        archives.push(Archive::from_parts(
            arc_def, ds_count, pointer, written, states, values,
        ));
    }

    if r.remaining() != 0 {
        return Err(invalid(format!("{} trailing bytes", r.remaining())));
    }
    def.validate()
        .map_err(|e| invalid(format!("invalid definition: {e}")))?;
    if last_update < start_time {
        return Err(invalid(format!(
            "last update {last_update} precedes start time {start_time}"
        )));
    }

    Ok(Series::from_parts(name, def, last_update, ds_states, archives))
}

fn invalid(reason: String) -> crate::error::HistoryError {
    CodecError::Invalid { reason }.into()
}

fn non_nan(value: f64) -> Option<f64> {
    (!value.is_nan()).then_some(value)
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.u64(v.to_bits());
    }

    #[allow(clippy::cast_possible_truncation)] // names and counts are far below 4 GiB
    fn len(&mut self, len: usize) {
        self.u32(len as u32);
    }

    fn str(&mut self, s: &str) {
        self.len(s.len());
        self.bytes(s.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if needed > self.remaining() {
            return Err(CodecError::Truncated {
                offset: self.offset,
                needed,
                available: self.remaining(),
            }
            .into());
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let slice = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn array4(&mut self) -> Result<[u8; 4]> {
        let mut out = [0u8; 4];
        out.copy_from_slice(self.take(4)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut out = [0u8; 4];
        out.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(out))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(out))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| invalid(format!("invalid UTF-8 name: {e}")))
    }
}

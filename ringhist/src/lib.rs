//! # ringhist
//!
//! Multi-resolution round-robin metrics history.
//!
//! ringhist keeps a fixed-size history of periodically sampled metrics. Each
//! named series holds several datasources (gauges or counters) and several
//! archives, each a ring buffer that consolidates the base step into coarser
//! rows. Storage size is fixed by the series definition, not by data volume.
//!
//! ## Key Properties
//!
//! - rrdtool-style time-weighted accumulation with heartbeat and bounds
//! - Counters stored as per-second rates, with 32/64-bit wrap handling
//! - Pluggable persistence through the [`Backend`] trait
//! - Write-through or periodic write-back persistence
//! - A cancellable async collector gated on backend readiness
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use ringhist::{DatasourceDef, MemoryBackend, SeriesDefinition, SeriesStore};
//!
//! # fn main() -> ringhist::Result<()> {
//! let store = SeriesStore::new(Arc::new(MemoryBackend::new()));
//!
//! // 60s step, default archive schedule
//! let def = SeriesDefinition::new(60, 1_700_006_340)
//!     .with_datasource(DatasourceDef::gauge("memory.heap.used", 120))
//!     .with_default_archives();
//! store.create("solr.jvm", def)?;
//!
//! store.sample("solr.jvm", 1_700_006_400, [("memory.heap.used", 512.0)])?;
//!
//! let data = ringhist::query::fetch(&store, "solr.jvm", &[] as &[&str], None)?;
//! assert_eq!(data.archives[0].datasources[0].values, vec![Some(512.0)]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`SeriesStore`]: named series, open/create/sample/delete, persistence
//! - [`SeriesDefinition`]: datasources and archives of one series
//! - [`Scheduler`]: periodic collection into the store
//! - [`MetricsHistory`]: list/status/get/delete facade for an admin layer
//!
//! ## Modules
//!
//! - [`schema`]: series, datasource and archive definitions
//! - [`series`]: per-series sample processing
//! - [`archive`]: consolidated ring buffers
//! - [`codec`]: binary encoding of series state
//! - [`backend`]: persistence adapters
//! - [`store`]: series registry and caching
//! - [`query`]: status and fetch
//! - [`format`]: output shaping
//! - [`collect`]: collection scheduler
//! - [`config`]: collector configuration
//! - [`admin`]: admin operations
//! - [`error`]: error types

pub mod admin;
pub mod archive;
pub mod backend;
pub mod codec;
pub mod collect;
pub mod config;
pub mod error;
pub mod format;
pub mod query;
pub mod schema;
pub mod series;
pub mod store;

// Re-export primary API types at crate root for convenience.
pub use admin::{Action, AdminRequest, MetricsHistory};
pub use backend::{Backend, FileBackend, MemoryBackend};
pub use collect::{CollectorHandle, MetricSource, Readiness, Scheduler};
pub use config::{CollectorConfig, GroupConfig};
pub use error::{ErrorCode, HistoryError, Result};
pub use format::{Format, ImageRenderer};
pub use query::{FetchResult, SeriesStatus, TimeRange};
pub use schema::{ArchiveDef, ConsolidationFn, DatasourceDef, DsKind, SeriesDefinition};
pub use series::Series;
pub use store::SeriesStore;

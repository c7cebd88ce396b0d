//! Admin-facing operations.
//!
//! [`MetricsHistory`] exposes the operations an admin layer routes requests
//! to: list, status, get and delete. The typed methods return
//! [`Result`]s; [`MetricsHistory::handle`] accepts a loosely typed
//! [`AdminRequest`] and produces a JSON payload, turning unknown series into
//! an explicit `"error"` entry instead of a failure.
//!
//! # Response Shapes
//!
//! ```text
//! list    {"metrics": ["solr.core.main", "solr.jvm", ...]}
//! status  {"metrics": {"<name>": {"status": {...}}}}
//! get     {"metrics": {"<name>": {"data": [...]}}}
//! delete  {"success": "ok"}
//! missing {"error": "'<name>' doesn't exist"}
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{HistoryError, RequestError, Result};
use crate::format::{self, Format, FormattedArchive, ImageRenderer};
use crate::query::{self, SeriesStatus, TimeRange};
use crate::store::{DEFAULT_LIST_LIMIT, SeriesStore};

/// Admin action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// List series names.
    List,
    /// Report the status of one series.
    Status,
    /// Fetch data of one series.
    Get,
    /// Delete one series, or all of them.
    Delete,
}

impl Action {
    /// All supported actions.
    pub const ALL: [Action; 4] = [Action::List, Action::Status, Action::Get, Action::Delete];

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Status => "status",
            Self::Get => "get",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                RequestError::UnknownAction {
                    given: s.to_string(),
                    supported: Self::ALL.map(Self::as_str).join(", "),
                }
                .into()
            })
    }
}

/// Loosely typed admin request, as decoded from query parameters or JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdminRequest {
    /// Action name; required.
    pub action: Option<String>,
    /// Series name; required by status, get and delete.
    pub name: Option<String>,
    /// Datasources to fetch; empty means all.
    pub ds: Vec<String>,
    /// Output format for get; defaults to `list`.
    pub format: Option<String>,
    /// Maximum names for list.
    pub rows: Option<usize>,
    /// Start of the fetch range.
    pub start: Option<u64>,
    /// End of the fetch range.
    pub end: Option<u64>,
}

/// Admin facade over a [`SeriesStore`].
#[derive(Clone)]
pub struct MetricsHistory {
    store: Arc<SeriesStore>,
    renderer: Option<Arc<dyn ImageRenderer>>,
}

impl fmt::Debug for MetricsHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsHistory")
            .field("store", &self.store)
            .field("renderer", &self.renderer.is_some())
            .finish()
    }
}

impl MetricsHistory {
    /// Creates a facade without an image renderer.
    pub fn new(store: Arc<SeriesStore>) -> Self {
        Self {
            store,
            renderer: None,
        }
    }

    /// Installs the renderer used for [`Format::Graph`].
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn ImageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Lists up to `limit` series names in ascending order.
    ///
    /// # Errors
    ///
    /// Returns a backend error if listing fails.
    pub fn list_series(&self, limit: usize) -> Result<Vec<String>> {
        self.store.list(limit)
    }

    /// Returns the status of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::StoreError::NotFound`] for unknown series.
    pub fn get_status(&self, name: &str) -> Result<SeriesStatus> {
        query::status(&self.store, name)
    }

    /// Fetches and shapes data of `name`.
    ///
    /// # Errors
    ///
    /// - [`crate::error::StoreError::NotFound`] for unknown series
    /// - [`RequestError`] for unknown datasources or a missing renderer
    pub fn get_data<S: AsRef<str>>(
        &self,
        name: &str,
        datasources: &[S],
        range: Option<TimeRange>,
        format: Format,
    ) -> Result<Vec<FormattedArchive>> {
        let data = query::fetch(&self.store, name, datasources, range)?;
        format::format(&data, format, self.renderer.as_deref())
    }

    /// Deletes `name`; `all` (any case) and `*` delete every series.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::StoreError::NotFound`] for unknown series, or
    /// a backend error.
    pub fn delete_series(&self, name: &str) -> Result<()> {
        if name.eq_ignore_ascii_case("all") || name == "*" {
            return self.delete_all();
        }
        self.store.delete(name)
    }

    /// Deletes every series.
    ///
    /// # Errors
    ///
    /// Returns a backend error if deletion fails.
    pub fn delete_all(&self) -> Result<()> {
        self.store.delete_all()
    }

    /// Handles a loosely typed request.
    ///
    /// Unknown series produce `{"error": ...}` rather than an error.
    ///
    /// # Errors
    ///
    /// - [`RequestError`] for a missing or unknown action, a missing name
    ///   or an unknown format
    /// - backend errors, reported as [`crate::error::ErrorCode::Internal`]
    pub fn handle(&self, request: &AdminRequest) -> Result<Value> {
        let action: Action = request
            .action
            .as_deref()
            .ok_or(RequestError::MissingParam { param: "action" })?
            .parse()?;

        match action {
            Action::List => {
                let names = self.list_series(request.rows.unwrap_or(DEFAULT_LIST_LIMIT))?;
                Ok(json!({ "metrics": names }))
            }
            Action::Status => with_name(request, |name| {
                let status = self.get_status(name)?;
                Ok(json!({ "metrics": { name: { "status": status } } }))
            }),
            Action::Get => with_name(request, |name| {
                let format = match request.format.as_deref() {
                    Some(format) => format.parse()?,
                    None => Format::default(),
                };
                let range = match (request.start, request.end) {
                    (None, None) => None,
                    (start, end) => Some(TimeRange::new(
                        start.unwrap_or(0),
                        end.unwrap_or(u64::MAX / 2),
                    )),
                };
                let data = self.get_data(name, &request.ds, range, format)?;
                Ok(json!({ "metrics": { name: { "data": data } } }))
            }),
            Action::Delete => with_name(request, |name| {
                self.delete_series(name)?;
                Ok(json!({ "success": "ok" }))
            }),
        }
    }
}

/// Runs a per-series action, turning not-found into the error payload.
fn with_name<F>(request: &AdminRequest, f: F) -> Result<Value>
where
    F: FnOnce(&str) -> Result<Value>,
{
    let name = request
        .name
        .as_deref()
        .ok_or(RequestError::MissingParam { param: "name" })?;
    match f(name) {
        Err(e) if e.is_not_found() => Ok(json!({ "error": format!("'{name}' doesn't exist") })),
        other => other,
    }
}

//! Output shaping for fetched rows.
//!
//! A [`FetchResult`] can be returned in three shapes:
//!
//! - [`Format::List`]: parallel arrays of timestamps and values
//! - [`Format::String`]: one newline-joined text block for the timestamps
//!   and one per datasource
//! - [`Format::Graph`]: one rendered image per datasource, produced by an
//!   external [`ImageRenderer`]
//!
//! Undefined values stay distinguishable in every shape: `null` in lists and
//! `NaN` in text blocks.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{RequestError, Result};
use crate::query::{FetchResult, TimeRange};

/// Output shape of fetched data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Parallel arrays.
    #[default]
    List,
    /// Newline-joined text blocks.
    String,
    /// Rendered images.
    Graph,
}

impl Format {
    /// All supported formats.
    pub const ALL: [Format; 3] = [Format::List, Format::String, Format::Graph];

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::String => "string",
            Self::Graph => "graph",
        }
    }

    /// Comma-separated list of supported format names.
    pub fn supported() -> String {
        Self::ALL.map(Self::as_str).join(", ")
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = crate::error::HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                RequestError::UnknownFormat {
                    given: s.to_string(),
                    supported: Self::supported(),
                }
                .into()
            })
    }
}

/// Renders one datasource of one archive as an image.
///
/// Implementations return the encoded image as a string (for example a
/// base64 PNG) ready to be embedded in a response.
pub trait ImageRenderer: Send + Sync {
    /// Renders `values` over `window`.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be produced.
    fn render(
        &self,
        title: &str,
        window: TimeRange,
        timestamps: &[u64],
        values: &[Option<f64>],
    ) -> Result<String>;
}

/// One shaped column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Column {
    /// Row timestamps.
    Timestamps(Vec<u64>),
    /// Row values, `None` for undefined.
    Values(Vec<Option<f64>>),
    /// Newline-joined text block.
    Text(String),
    /// Encoded image from an [`ImageRenderer`].
    Image(String),
}

/// A named shaped column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedColumn {
    /// Datasource name.
    pub name: String,
    /// Shaped data.
    pub data: Column,
}

/// One shaped archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedArchive {
    /// Short archive description, e.g. `AVERAGE:0.5:1:240`.
    pub archive: String,
    /// Timestamps; absent for graphs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Column>,
    /// One column per datasource.
    pub values: Vec<NamedColumn>,
}

/// Shapes `result` into `format`.
///
/// # Errors
///
/// - [`RequestError::NoRenderer`] if `format` is [`Format::Graph`] and no
///   renderer was given
/// - any error returned by the renderer
pub fn format(
    result: &FetchResult,
    format: Format,
    renderer: Option<&dyn ImageRenderer>,
) -> Result<Vec<FormattedArchive>> {
    let renderer = match (format, renderer) {
        (Format::Graph, None) => return Err(RequestError::NoRenderer.into()),
        (_, renderer) => renderer,
    };

    let mut out = Vec::with_capacity(result.archives.len());
    for archive in &result.archives {
        let timestamps = match format {
            Format::List => Some(Column::Timestamps(archive.timestamps.clone())),
            Format::String => Some(Column::Text(join_lines(
                archive.timestamps.iter().map(u64::to_string),
            ))),
            Format::Graph => None,
        };

        let mut values = Vec::with_capacity(archive.datasources.len());
        for ds in &archive.datasources {
            let data = match (format, renderer) {
                (Format::List, _) => Column::Values(ds.values.clone()),
                (Format::String, _) => Column::Text(join_lines(ds.values.iter().map(|v| {
                    v.map_or_else(|| "NaN".to_string(), |v| v.to_string())
                }))),
                (Format::Graph, Some(renderer)) => Column::Image(renderer.render(
                    &ds.name,
                    archive.window,
                    &archive.timestamps,
                    &ds.values,
                )?),
                (Format::Graph, None) => return Err(RequestError::NoRenderer.into()),
            };
            values.push(NamedColumn {
                name: ds.name.clone(),
                data,
            });
        }

        out.push(FormattedArchive {
            archive: archive.archive.clone(),
            timestamps,
            values,
        });
    }
    Ok(out)
}

fn join_lines<I: Iterator<Item = String>>(items: I) -> String {
    items.collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ArchiveData, DatasourceValues};

    fn result() -> FetchResult {
        FetchResult {
            name: "solr.jvm".to_string(),
            archives: vec![ArchiveData {
                archive: "AVERAGE:0.5:1:240".to_string(),
                arc_step: 60,
                window: TimeRange::new(0, 240),
                timestamps: vec![60, 120, 180],
                datasources: vec![DatasourceValues {
                    name: "heap".to_string(),
                    values: vec![Some(10.0), None, Some(2.5)],
                }],
            }],
        }
    }

    struct CountingRenderer;

    impl ImageRenderer for CountingRenderer {
        fn render(
            &self,
            title: &str,
            window: TimeRange,
            timestamps: &[u64],
            values: &[Option<f64>],
        ) -> Result<String> {
            Ok(format!(
                "{title}:{}-{}:{}:{}",
                window.start,
                window.end,
                timestamps.len(),
                values.iter().flatten().count()
            ))
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!("list".parse::<Format>().unwrap(), Format::List);
        assert_eq!("STRING".parse::<Format>().unwrap(), Format::String);
        assert_eq!("Graph".parse::<Format>().unwrap(), Format::Graph);

        let err = "svg".parse::<Format>().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BadRequest);
        assert!(err.to_string().contains("list, string, graph"));
    }

    #[test]
    fn test_list() {
        let shaped = format(&result(), Format::List, None).unwrap();
        assert_eq!(shaped[0].timestamps, Some(Column::Timestamps(vec![60, 120, 180])));
        assert_eq!(
            shaped[0].values[0].data,
            Column::Values(vec![Some(10.0), None, Some(2.5)])
        );

        let json = serde_json::to_value(&shaped).unwrap();
        assert_eq!(json[0]["values"][0]["data"][1], serde_json::Value::Null);
    }

    #[test]
    fn test_string() {
        let shaped = format(&result(), Format::String, None).unwrap();
        assert_eq!(shaped[0].timestamps, Some(Column::Text("60\n120\n180".to_string())));
        assert_eq!(shaped[0].values[0].data, Column::Text("10\nNaN\n2.5".to_string()));
    }

    #[test]
    fn test_graph() {
        let renderer = CountingRenderer;
        let shaped = format(&result(), Format::Graph, Some(&renderer)).unwrap();
        assert_eq!(shaped[0].timestamps, None);
        assert_eq!(shaped[0].values[0].data, Column::Image("heap:0-240:3:2".to_string()));

        let err = format(&result(), Format::Graph, None).unwrap_err();
        assert!(matches!(
            err,
            crate::error::HistoryError::Request(RequestError::NoRenderer)
        ));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-chain document model.
//!
//! Two document shapes are accepted: version 1 (`{"version": "1", "list":
//! [...]}`) and the legacy shape keyed by stringified integers. Both are
//! resolved once into [`ChainStep`]s; nothing downstream branches on the
//! document shape.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ChainError;

/// Webhooks notified about job progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhooks {
    /// Receives the status record on every update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
    /// Receives the terminal status record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<String>,
}

/// Source kind of an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportType {
    /// Raster file at a URL.
    Raster,
    /// Vector file at a URL.
    Vector,
    /// Plain file at a URL.
    File,
    /// PostGIS table.
    Postgis,
    /// Sentinel-2 scene band.
    Sentinel2,
    /// Landsat scene.
    Landsat,
}

/// Import annotation of an input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDescr {
    /// Source kind.
    #[serde(rename = "type")]
    pub kind: ImportType,
    /// URL, scene id or database connection string.
    pub source: String,
    /// `user:password` for protected downloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<String>,
    /// Sentinel-2 band (e.g. `B04`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinel_band: Option<String>,
    /// Landsat atmospheric correction method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landsat_atcor: Option<String>,
    /// Vector layer to read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_layer: Option<String>,
}

/// Accepted export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    /// Cloud optimized GeoTIFF.
    #[serde(rename = "COG")]
    Cog,
    /// GeoTIFF.
    GTiff,
    /// GeoPackage.
    #[serde(rename = "GPKG")]
    Gpkg,
    /// SQLite.
    SQLite,
    /// GML.
    #[serde(rename = "GML")]
    Gml,
    /// GeoJSON.
    GeoJSON,
    /// ESRI Shapefile.
    #[serde(rename = "ESRI_Shapefile")]
    EsriShapefile,
    /// Comma separated values.
    #[serde(rename = "CSV")]
    Csv,
    /// Plain text.
    #[serde(rename = "TXT")]
    Txt,
    /// PostgreSQL database.
    PostgreSQL,
    /// Apache Parquet.
    #[serde(rename = "parquet")]
    Parquet,
}

impl ExportFormat {
    /// Driver name as passed to GDAL/OGR.
    pub fn driver(self) -> &'static str {
        match self {
            Self::Cog => "COG",
            Self::GTiff => "GTiff",
            Self::Gpkg => "GPKG",
            Self::SQLite => "SQLite",
            Self::Gml => "GML",
            Self::GeoJSON => "GeoJSON",
            Self::EsriShapefile => "ESRI_Shapefile",
            Self::Csv => "CSV",
            Self::Txt => "TXT",
            Self::PostgreSQL => "PostgreSQL",
            Self::Parquet => "Parquet",
        }
    }

    /// File suffix of exported files.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Cog | Self::GTiff => ".tif",
            Self::Gpkg => ".gpkg",
            Self::SQLite => ".sqlite",
            Self::Gml => ".gml",
            Self::GeoJSON => ".geojson",
            Self::EsriShapefile => ".shp",
            Self::Csv => ".csv",
            Self::Txt => ".txt",
            Self::PostgreSQL => "",
            Self::Parquet => ".parquet",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.driver())
    }
}

/// Kind of data being exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportType {
    /// Raster map.
    Raster,
    /// Vector map.
    Vector,
    /// Space-time raster dataset.
    Strds,
    /// Temporary file.
    File,
    /// Space-time vector dataset.
    Stvds,
}

/// Export annotation of an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDescr {
    /// Output format.
    pub format: ExportFormat,
    /// Data kind.
    #[serde(rename = "type")]
    pub kind: ExportType,
    /// Connection string of PostgreSQL exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbstring: Option<String>,
    /// Layer name for vector exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_layer: Option<String>,
}

/// How captured stdout is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdoutFormat {
    /// Rows of delimited columns.
    Table,
    /// Delimited values.
    List,
    /// `key{delimiter}value` lines.
    Kv,
}

/// Stdout parsing request of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdoutParser {
    /// Key of the parsed result in `process_results` (defaults to the step id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Parsing format.
    pub format: StdoutFormat,
    /// Field delimiter.
    pub delimiter: String,
}

fn scalar(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::from(f),
        _ => Value::String(raw.to_string()),
    }
}

impl StdoutParser {
    /// Parse captured stdout.
    ///
    /// Numeric fields become JSON numbers; blank lines are skipped.
    pub fn parse(&self, stdout: &str) -> Value {
        let delimiter = if self.delimiter.is_empty() {
            "|"
        } else {
            self.delimiter.as_str()
        };
        let lines = stdout.lines().filter(|l| !l.trim().is_empty());
        match self.format {
            StdoutFormat::Kv => {
                let mut object = Map::new();
                for line in lines {
                    if let Some((key, value)) = line.split_once(delimiter) {
                        object.insert(key.trim().to_string(), scalar(value));
                    }
                }
                Value::Object(object)
            }
            StdoutFormat::List => Value::Array(
                lines
                    .flat_map(|line| line.split(delimiter))
                    .filter(|v| !v.trim().is_empty())
                    .map(scalar)
                    .collect(),
            ),
            StdoutFormat::Table => Value::Array(
                lines
                    .map(|line| Value::Array(line.split(delimiter).map(scalar).collect()))
                    .collect(),
            ),
        }
    }
}

/// One input or output of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoParam {
    /// Module parameter name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    /// Parameter value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Import annotation (inputs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_descr: Option<ImportDescr>,
    /// Export annotation (outputs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportDescr>,
}

/// Canonical step of a process chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStep {
    /// Step id, unique within the chain.
    #[serde(default)]
    pub id: Option<String>,
    /// GRASS module name.
    #[serde(default)]
    pub module: Option<String>,
    /// Executable path or name.
    #[serde(default)]
    pub exe: Option<String>,
    /// Python code evaluated with `python3 -c`.
    #[serde(default)]
    pub evaluate: Option<String>,
    /// Inputs.
    #[serde(default)]
    pub inputs: Vec<IoParam>,
    /// Outputs.
    #[serde(default)]
    pub outputs: Vec<IoParam>,
    /// Module flags (e.g. `"pg"`).
    #[serde(default)]
    pub flags: Option<String>,
    /// Executable arguments.
    #[serde(default)]
    pub params: Vec<String>,
    /// `"<id>::stdout"` or `"<id>::stderr"`.
    #[serde(default)]
    pub stdin: Option<String>,
    /// Stdout parsing request.
    #[serde(default)]
    pub stdout: Option<StdoutParser>,
    /// Pass `--o`.
    #[serde(default)]
    pub overwrite: bool,
    /// Pass `--v`.
    #[serde(default)]
    pub verbose: bool,
    /// Pass `--qq`.
    #[serde(default)]
    pub superquiet: bool,
}

/// Version 1 document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChainV1 {
    /// Document version, `"1"`.
    pub version: String,
    /// Ordered steps.
    pub list: Vec<ChainStep>,
    /// Optional webhooks.
    #[serde(default)]
    pub webhooks: Option<Webhooks>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LegacyInput {
    Name(String),
    Described {
        name: String,
        #[serde(default)]
        import_descr: Option<ImportDescr>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyOutput {
    name: String,
    #[serde(default)]
    export: Option<ExportDescr>,
}

/// Step of the legacy document shape.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    executable: Option<String>,
    #[serde(default)]
    inputs: BTreeMap<String, LegacyInput>,
    #[serde(default)]
    outputs: BTreeMap<String, LegacyOutput>,
    #[serde(default)]
    flags: Option<String>,
    #[serde(default)]
    parameters: Vec<String>,
    #[serde(default)]
    stdin: Option<String>,
    #[serde(default)]
    overwrite: bool,
    #[serde(default)]
    verbose: bool,
    #[serde(default)]
    superquiet: bool,
}

impl LegacyStep {
    fn into_step(self, key: &str) -> ChainStep {
        let inputs = self
            .inputs
            .into_iter()
            .map(|(param, input)| match input {
                LegacyInput::Name(value) => IoParam {
                    param: Some(param),
                    value: Some(value),
                    ..IoParam::default()
                },
                LegacyInput::Described { name, import_descr } => IoParam {
                    param: Some(param),
                    value: Some(name),
                    import_descr,
                    export: None,
                },
            })
            .collect();
        let outputs = self
            .outputs
            .into_iter()
            .map(|(param, output)| IoParam {
                param: Some(param),
                value: Some(output.name),
                import_descr: None,
                export: output.export,
            })
            .collect();
        ChainStep {
            id: Some(self.id.unwrap_or_else(|| key.to_string())),
            module: self.module,
            exe: self.executable,
            evaluate: None,
            inputs,
            outputs,
            flags: self.flags,
            params: self.parameters,
            stdin: self.stdin,
            stdout: None,
            overwrite: self.overwrite,
            verbose: self.verbose,
            superquiet: self.superquiet,
        }
    }
}

/// Legacy document: steps keyed by stringified integers.
#[derive(Debug, Clone)]
pub struct LegacyChain {
    /// Steps sorted by their integer key.
    pub steps: Vec<(u64, String, LegacyStep)>,
    /// Optional webhooks.
    pub webhooks: Option<Webhooks>,
}

/// A process-chain document in one of the accepted shapes.
#[derive(Debug, Clone)]
pub enum ChainDocument {
    /// `{"version": "1", "list": [...]}`
    V1(ChainV1),
    /// `{"1": {...}, "2": {...}}`
    Legacy(LegacyChain),
}

fn invalid(e: serde_json::Error) -> ChainError {
    ChainError::InvalidDocument(e.to_string())
}

impl ChainDocument {
    /// Detect the document shape and deserialize it.
    pub fn from_value(value: &Value) -> Result<Self, ChainError> {
        let object = value
            .as_object()
            .ok_or_else(|| ChainError::InvalidDocument("document must be an object".into()))?;

        if object.contains_key("list") {
            if !object.contains_key("version") {
                return Err(ChainError::missing("version", "process chain"));
            }
            let chain: ChainV1 = serde_json::from_value(value.clone()).map_err(invalid)?;
            if chain.version != "1" {
                return Err(ChainError::InvalidDocument(format!(
                    "unsupported version '{}'",
                    chain.version
                )));
            }
            return Ok(Self::V1(chain));
        }

        let mut steps = Vec::new();
        let mut webhooks = None;
        for (key, raw) in object {
            if key == "webhooks" {
                webhooks = Some(serde_json::from_value(raw.clone()).map_err(invalid)?);
                continue;
            }
            let index = u64::from_str(key).map_err(|_| {
                ChainError::InvalidDocument(format!("unexpected key '{key}' in legacy chain"))
            })?;
            let step: LegacyStep = serde_json::from_value(raw.clone()).map_err(invalid)?;
            steps.push((index, key.clone(), step));
        }
        if steps.is_empty() {
            return Err(ChainError::InvalidDocument("process chain is empty".into()));
        }
        steps.sort_by_key(|(index, _, _)| *index);
        Ok(Self::Legacy(LegacyChain { steps, webhooks }))
    }

    /// Canonical steps and webhooks.
    pub fn into_steps(self) -> (Vec<ChainStep>, Webhooks) {
        match self {
            Self::V1(chain) => (chain.list, chain.webhooks.unwrap_or_default()),
            Self::Legacy(chain) => (
                chain
                    .steps
                    .into_iter()
                    .map(|(_, key, step)| step.into_step(&key))
                    .collect(),
                chain.webhooks.unwrap_or_default(),
            ),
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-chain compiler.
//!
//! [`ProcessChainConverter::compile`] turns a process-chain document into an
//! ordered list of [`Process`]es plus the side tables the engine needs:
//!
//! - required mapsets (from `@mapset` suffixes of inputs)
//! - export requests (from `export` blocks of outputs)
//! - stdout parsers keyed by step id
//! - the `$file::<id>` table mapping file ids to paths in the temp directory
//!
//! File ids resolve to `{temp_file_dir}/file_{id}`, so the same id always
//! maps to the same path within a job and across resumed iterations.

pub mod error;
pub mod import;
pub mod mapsets;
pub mod model;

pub use error::ChainError;
pub use import::{DirectUrlResolver, DownloadTarget, ImportResolver, SceneFile};
pub use mapsets::extract_mapsets;
pub use model::{
    ChainDocument, ChainStep, ExportDescr, ExportFormat, ExportType, ImportDescr, ImportType,
    IoParam, StdoutFormat, StdoutParser, Webhooks,
};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::process::{Process, StdStream, StdinSource};

const FILE_TOKEN: &str = "$file::";
const FORBIDDEN_CHARACTERS: [char; 1] = ['&'];
const IMPORTER: &str = "importer";
const EXPORTER: &str = "exporter";

/// Compiler settings taken from the configuration.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Modules and executables a chain may run (None = all).
    pub allowed_modules: Option<BTreeSet<String>>,
    /// Maximum number of compiled processes.
    pub process_num_limit: usize,
    /// Timeout of webhook probes.
    pub webhook_timeout: Duration,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            allowed_modules: None,
            process_num_limit: 1000,
            webhook_timeout: Duration::from_secs(10),
        }
    }
}

impl ChainSettings {
    /// Settings from the global configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            allowed_modules: config.allowed_modules.clone(),
            process_num_limit: config.process_num_limit,
            webhook_timeout: config.webhook_timeout,
        }
    }
}

/// An output to export after the chain has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    /// Step that declared the export.
    pub process_id: String,
    /// Map name, or the resolved path for file exports.
    pub name: String,
    /// Export annotation.
    pub export: ExportDescr,
}

/// Result of compiling a process chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledChain {
    /// Processes in execution order.
    pub processes: Vec<Process>,
    /// Mapsets referenced by inputs.
    pub required_mapsets: BTreeSet<String>,
    /// Export requests in document order.
    pub exports: Vec<ExportRequest>,
    /// Stdout parsers keyed by step id.
    pub stdout_parsers: BTreeMap<String, StdoutParser>,
    /// `$file::<id>` table.
    pub temp_files: BTreeMap<String, PathBuf>,
    /// Webhooks of the chain.
    pub webhooks: Webhooks,
}

impl CompiledChain {
    /// Number of processes.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether the chain compiled to no processes.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Parse a process's stdout if a parser was requested for it.
    ///
    /// Returns the result key and the parsed value.
    pub fn parse_stdout(&self, process_id: &str, stdout: &str) -> Option<(String, Value)> {
        let parser = self.stdout_parsers.get(process_id)?;
        let key = parser.id.clone().unwrap_or_else(|| process_id.to_string());
        Some((key, parser.parse(stdout)))
    }
}

struct Compilation {
    temp_file_dir: PathBuf,
    processes: Vec<Process>,
    required_mapsets: BTreeSet<String>,
    exports: Vec<ExportRequest>,
    stdout_parsers: BTreeMap<String, StdoutParser>,
    temp_files: BTreeMap<String, PathBuf>,
    known_ids: BTreeSet<String>,
    import_counter: usize,
}

impl Compilation {
    fn new(temp_file_dir: &Path) -> Self {
        Self {
            temp_file_dir: temp_file_dir.to_path_buf(),
            processes: Vec::new(),
            required_mapsets: BTreeSet::new(),
            exports: Vec::new(),
            stdout_parsers: BTreeMap::new(),
            temp_files: BTreeMap::new(),
            known_ids: BTreeSet::new(),
            import_counter: 0,
        }
    }

    /// Replace every `$file::<id>` token with its path.
    fn resolve_files(&mut self, value: &str) -> Result<String, ChainError> {
        let mut resolved = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(pos) = rest.find(FILE_TOKEN) {
            resolved.push_str(&rest[..pos]);
            let tail = &rest[pos + FILE_TOKEN.len()..];
            let end = tail
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
                .unwrap_or(tail.len());
            let file_id = &tail[..end];
            if file_id.is_empty() {
                return Err(ChainError::InvalidFileId(value.to_string()));
            }
            let dir = &self.temp_file_dir;
            let path = self
                .temp_files
                .entry(file_id.to_string())
                .or_insert_with(|| dir.join(format!("file_{file_id}")));
            resolved.push_str(&path.to_string_lossy());
            rest = &tail[end..];
        }
        resolved.push_str(rest);
        Ok(resolved)
    }

    fn next_import(&mut self, step: &str) -> (String, usize) {
        self.import_counter += 1;
        (
            format!("{step}_import_{}", self.import_counter),
            self.import_counter,
        )
    }

    fn finish(self, webhooks: Webhooks) -> CompiledChain {
        CompiledChain {
            processes: self.processes,
            required_mapsets: self.required_mapsets,
            exports: self.exports,
            stdout_parsers: self.stdout_parsers,
            temp_files: self.temp_files,
            webhooks,
        }
    }
}

fn check_forbidden(step: &str, value: &str) -> Result<(), ChainError> {
    match value.chars().find(|c| FORBIDDEN_CHARACTERS.contains(c)) {
        Some(character) => Err(ChainError::ForbiddenCharacter {
            step: step.to_string(),
            character,
            value: value.to_string(),
        }),
        None => Ok(()),
    }
}

fn validate_export(step: &str, raw_value: &str, export: &ExportDescr) -> Result<(), ChainError> {
    let invalid = |reason: &str| ChainError::InvalidExport {
        step: step.to_string(),
        reason: reason.to_string(),
    };
    if export.format == ExportFormat::PostgreSQL
        && export.dbstring.as_deref().is_none_or(str::is_empty)
    {
        return Err(invalid("PostgreSQL exports require a dbstring"));
    }
    if export.kind == ExportType::File && !raw_value.contains(FILE_TOKEN) {
        return Err(invalid("file exports must reference a $file:: placeholder"));
    }
    Ok(())
}

fn parse_stdin(step: &str, reference: &str, known: &BTreeSet<String>) -> Result<StdinSource, ChainError> {
    let unknown = || ChainError::UnknownStdinReference {
        step: step.to_string(),
        reference: reference.to_string(),
    };
    let (process_id, stream) = reference.rsplit_once("::").ok_or_else(unknown)?;
    let stream = match stream {
        "stdout" => StdStream::Stdout,
        "stderr" => StdStream::Stderr,
        _ => {
            return Err(ChainError::InvalidDocument(format!(
                "stdin of step '{step}' must end with ::stdout or ::stderr"
            )));
        }
    };
    if !known.contains(process_id) {
        return Err(unknown());
    }
    Ok(StdinSource {
        process_id: process_id.to_string(),
        stream,
    })
}

fn landsat_sensor(scene_id: &str) -> Option<(&'static str, &'static [&'static str])> {
    const OLI: &[&str] = &["1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11"];
    const ETM: &[&str] = &["1", "2", "3", "4", "5", "61", "62", "7", "8"];
    const TM: &[&str] = &["1", "2", "3", "4", "5", "6", "7"];
    match scene_id.get(..4)? {
        "LC08" | "LC09" => Some(("oli8", OLI)),
        "LE07" => Some(("tm7", ETM)),
        "LT05" => Some(("tm5", TM)),
        "LT04" => Some(("tm4", TM)),
        _ => None,
    }
}

fn map_name(raw: &str) -> String {
    import::sanitize_file_name(raw).replace(['.', '-'], "_")
}

/// Compiles process-chain documents into process lists.
#[derive(Clone)]
pub struct ProcessChainConverter {
    settings: ChainSettings,
    temp_file_dir: PathBuf,
    resolver: Arc<dyn ImportResolver>,
    http: reqwest::Client,
}

impl ProcessChainConverter {
    /// Create a converter whose `$file::` paths live in `temp_file_dir`.
    pub fn new(settings: ChainSettings, temp_file_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            temp_file_dir: temp_file_dir.into(),
            resolver: Arc::new(DirectUrlResolver),
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom import resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ImportResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Use a custom HTTP client for webhook probes.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Directory holding `$file::` paths.
    pub fn temp_file_dir(&self) -> &Path {
        &self.temp_file_dir
    }

    /// Compile a process-chain document.
    pub async fn compile(&self, document: &Value) -> Result<CompiledChain, ChainError> {
        let (steps, webhooks) = ChainDocument::from_value(document)?.into_steps();

        let mut compilation = Compilation::new(&self.temp_file_dir);
        for (index, step) in steps.into_iter().enumerate() {
            self.compile_step(&mut compilation, index, step).await?;
        }

        self.check_permissions(&compilation.processes)?;

        let count = compilation.processes.len();
        if count > self.settings.process_num_limit {
            return Err(ChainError::TooManyProcesses {
                count,
                limit: self.settings.process_num_limit,
            });
        }

        if let Some(url) = &webhooks.finished {
            self.probe_webhook(url).await?;
        }
        if let Some(url) = &webhooks.update {
            self.probe_webhook(url).await?;
        }

        let compiled = compilation.finish(webhooks);
        info!(
            processes = compiled.len(),
            required_mapsets = compiled.required_mapsets.len(),
            exports = compiled.exports.len(),
            "Process chain compiled"
        );
        Ok(compiled)
    }

    fn check_permissions(&self, processes: &[Process]) -> Result<(), ChainError> {
        let Some(allowed) = &self.settings.allowed_modules else {
            return Ok(());
        };
        match processes
            .iter()
            .find(|p| !p.skip_permission_check && !allowed.contains(&p.name))
        {
            Some(p) => Err(ChainError::ModuleNotAllowed(p.name.clone())),
            None => Ok(()),
        }
    }

    async fn probe_webhook(&self, url: &str) -> Result<(), ChainError> {
        let unreachable = |reason: String| ChainError::WebhookUnreachable {
            url: url.to_string(),
            reason,
        };
        let response = self
            .http
            .head(url)
            .timeout(self.settings.webhook_timeout)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unreachable(format!("HTTP {}", response.status())));
        }
        debug!(url = %url, "Webhook reachable");
        Ok(())
    }

    async fn compile_step(
        &self,
        c: &mut Compilation,
        index: usize,
        step: ChainStep,
    ) -> Result<(), ChainError> {
        let id = step
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ChainError::missing("id", format!("step {}", index + 1)))?;
        let context = format!("step '{id}'");
        if c.known_ids.contains(&id) {
            return Err(ChainError::InvalidDocument(format!(
                "duplicate process id '{id}'"
            )));
        }

        let declared = [&step.module, &step.exe, &step.evaluate]
            .iter()
            .filter(|v| v.is_some())
            .count();
        if declared == 0 {
            return Err(ChainError::missing("module", context));
        }
        if declared > 1 {
            return Err(ChainError::InvalidDocument(format!(
                "{context} must declare exactly one of module, exe, evaluate"
            )));
        }

        let module = step.module.as_deref();
        let is_pseudo = matches!(module, Some(IMPORTER | EXPORTER));
        let mut args = Vec::new();

        for input in &step.inputs {
            let value = input
                .value
                .as_deref()
                .ok_or_else(|| ChainError::missing("value", format!("input of {context}")))?;
            check_forbidden(&id, value)?;

            let value = match &input.import_descr {
                Some(descr) => self.compile_import(c, &id, descr, value).await?,
                None => {
                    c.required_mapsets.extend(extract_mapsets(value));
                    c.resolve_files(value)?
                }
            };
            if module.is_some() && !is_pseudo {
                let param = input
                    .param
                    .as_deref()
                    .ok_or_else(|| ChainError::missing("param", format!("input of {context}")))?;
                args.push(format!("{param}={value}"));
            }
        }

        for output in &step.outputs {
            let raw = output
                .value
                .as_deref()
                .ok_or_else(|| ChainError::missing("value", format!("output of {context}")))?;
            check_forbidden(&id, raw)?;
            if module == Some(EXPORTER) {
                c.required_mapsets.extend(extract_mapsets(raw));
            } else if mapsets::has_mapset_suffix(raw) {
                return Err(ChainError::OutputWithMapset {
                    step: id.clone(),
                    value: raw.to_string(),
                });
            }

            let value = c.resolve_files(raw)?;
            if let Some(export) = &output.export {
                validate_export(&id, raw, export)?;
                c.exports.push(ExportRequest {
                    process_id: id.clone(),
                    name: value.clone(),
                    export: export.clone(),
                });
            }
            if module.is_some() && !is_pseudo {
                let param = output
                    .param
                    .as_deref()
                    .ok_or_else(|| ChainError::missing("param", format!("output of {context}")))?;
                args.push(format!("{param}={value}"));
            }
        }

        let stdin = match &step.stdin {
            Some(reference) => Some(parse_stdin(&id, reference, &c.known_ids)?),
            None => None,
        };
        if let Some(parser) = &step.stdout {
            c.stdout_parsers.insert(id.clone(), parser.clone());
        }

        let process = if let Some(name) = module {
            if let Some(flags) = step.flags.as_deref().filter(|f| !f.is_empty()) {
                check_forbidden(&id, flags)?;
                args.push(format!("-{flags}"));
            }
            if step.overwrite {
                args.push("--o".to_string());
            }
            if step.verbose {
                args.push("--v".to_string());
            }
            if step.superquiet {
                args.push("--qq".to_string());
            }
            (!is_pseudo).then(|| Process::module(id.clone(), name, args))
        } else if let Some(exe) = &step.exe {
            let mut exe_args = Vec::with_capacity(step.params.len());
            for param in &step.params {
                check_forbidden(&id, param)?;
                exe_args.push(c.resolve_files(param)?);
            }
            Some(Process::executable(id.clone(), exe.clone(), exe_args))
        } else if let Some(code) = &step.evaluate {
            check_forbidden(&id, code)?;
            Some(Process::executable(
                id.clone(),
                "python3",
                vec!["-c".to_string(), code.clone()],
            ))
        } else {
            None
        };

        if let Some(mut process) = process {
            if let Some(source) = stdin {
                process = process.with_stdin(source);
            }
            c.processes.push(process);
        }
        c.known_ids.insert(id);
        Ok(())
    }

    fn download(&self, c: &mut Compilation, step: &str, target: &DownloadTarget, auth: Option<&str>) -> PathBuf {
        let (process_id, n) = c.next_import(step);
        let path = self
            .temp_file_dir
            .join(format!("import_{n}_{}", target.file_name));
        let mut args = vec![
            "-t5".to_string(),
            "-c".to_string(),
            "-q".to_string(),
            "-O".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        if let Some((user, password)) = auth.and_then(|a| a.split_once(':')) {
            args.push(format!("--user={user}"));
            args.push(format!("--password={password}"));
        }
        args.push(target.url.clone());
        c.processes
            .push(Process::executable(process_id, "wget", args).skipping_permission_check());
        path
    }

    fn push_generated(c: &mut Compilation, step: &str, module: &str, args: Vec<String>) {
        let (process_id, _) = c.next_import(step);
        c.processes
            .push(Process::module(process_id, module, args).skipping_permission_check());
    }

    /// Generate download and import processes; returns the value the
    /// consuming step sees.
    async fn compile_import(
        &self,
        c: &mut Compilation,
        step: &str,
        descr: &ImportDescr,
        value: &str,
    ) -> Result<String, ChainError> {
        let failed = |reason: String| ChainError::ImportFailed {
            step: step.to_string(),
            reason,
        };
        let auth = descr.basic_auth.as_deref();

        match descr.kind {
            ImportType::Raster | ImportType::Vector => {
                let target = self.resolver.resolve_url(&descr.source).await.map_err(failed)?;
                let path = self.download(c, step, &target, auth);
                let input = format!("input={}", path.to_string_lossy());
                let output = format!("output={value}");
                if descr.kind == ImportType::Raster {
                    Self::push_generated(c, step, "r.import", vec![input, output, "--q".into()]);
                } else {
                    let mut args = vec![input, output];
                    if let Some(layer) = &descr.vector_layer {
                        args.push(format!("layer={layer}"));
                    }
                    args.push("--q".into());
                    Self::push_generated(c, step, "v.import", args);
                }
                Ok(value.to_string())
            }
            ImportType::File => {
                let target = self.resolver.resolve_url(&descr.source).await.map_err(failed)?;
                let path = self.download(c, step, &target, auth);
                Ok(path.to_string_lossy().into_owned())
            }
            ImportType::Postgis => {
                check_forbidden(step, &descr.source)?;
                let mut args = vec![
                    format!("input=PG:{}", descr.source),
                    format!("output={value}"),
                ];
                if let Some(layer) = &descr.vector_layer {
                    args.push(format!("layer={layer}"));
                }
                args.push("--q".into());
                Self::push_generated(c, step, "v.in.ogr", args);
                Ok(value.to_string())
            }
            ImportType::Sentinel2 => {
                let band = descr
                    .sentinel_band
                    .clone()
                    .ok_or_else(|| ChainError::missing("sentinel_band", format!("import of step '{step}'")))?;
                let files = self
                    .resolver
                    .resolve_scene(ImportType::Sentinel2, &descr.source, std::slice::from_ref(&band))
                    .await
                    .map_err(failed)?;
                let imported = format!("{}_{}", map_name(&descr.source), map_name(&band));
                for file in files.iter().filter(|f| f.band == band) {
                    let path = self.download(c, step, &file.target, auth);
                    Self::push_generated(
                        c,
                        step,
                        "r.import",
                        vec![
                            format!("input={}", path.to_string_lossy()),
                            format!("output={imported}"),
                            "--q".into(),
                        ],
                    );
                }
                Self::push_generated(
                    c,
                    step,
                    "g.rename",
                    vec![format!("raster={imported},{value}")],
                );
                Ok(value.to_string())
            }
            ImportType::Landsat => {
                let (sensor, band_numbers) = landsat_sensor(&descr.source)
                    .ok_or_else(|| failed(format!("unknown Landsat sensor of scene '{}'", descr.source)))?;
                let method = descr.landsat_atcor.as_deref().unwrap_or("uncorrected");
                if !["uncorrected", "dos1", "dos2", "dos2b", "dos3", "dos4"].contains(&method) {
                    return Err(failed(format!("unknown atmospheric correction '{method}'")));
                }
                let mut bands: Vec<String> = band_numbers.iter().map(|b| format!("B{b}")).collect();
                bands.push("MTL".to_string());
                let files = self
                    .resolver
                    .resolve_scene(ImportType::Landsat, &descr.source, &bands)
                    .await
                    .map_err(failed)?;

                let prefix = map_name(&descr.source);
                let mut metfile = None;
                for file in &files {
                    let path = self.download(c, step, &file.target, auth);
                    match file.band.strip_prefix('B') {
                        Some(number) if file.band != "MTL" => Self::push_generated(
                            c,
                            step,
                            "r.import",
                            vec![
                                format!("input={}", path.to_string_lossy()),
                                format!("output={prefix}.{number}"),
                                "--q".into(),
                            ],
                        ),
                        _ => metfile = Some(path),
                    }
                }
                let metfile = metfile
                    .ok_or_else(|| failed(format!("scene '{}' has no MTL metadata file", descr.source)))?;
                Self::push_generated(
                    c,
                    step,
                    "i.landsat.toar",
                    vec![
                        format!("input={prefix}."),
                        format!("output={value}_{method}."),
                        format!("sensor={sensor}"),
                        format!("metfile={}", metfile.to_string_lossy()),
                        format!("method={method}"),
                    ],
                );
                Ok(value.to_string())
            }
        }
    }
}

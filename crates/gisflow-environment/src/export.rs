// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Export of chain outputs into the download cache.
//!
//! Raster maps go through `r.out.gdal`, vector maps through `v.out.ogr`,
//! space-time datasets through `t.rast.export`/`t.vect.export`. File exports
//! copy a `$file::` temp file. PostgreSQL exports write into the database
//! and produce no download.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use gisflow_core::Process;
use gisflow_core::chain::{ExportFormat, ExportRequest, ExportType};
use tracing::info;

use crate::engine::ProcessingEngine;
use crate::error::{Error, Result};
use crate::fsops;

const RASTER_CREATE_OPTIONS: &str = "createopt=BIGTIFF=YES,COMPRESS=LZW";

/// Map name without its `@mapset` suffix.
fn map_name(name: &str) -> &str {
    name.split_once('@').map(|(n, _)| n).unwrap_or(name)
}

/// The export process for `request` and the path it writes, if any.
pub(crate) fn export_process(
    process_id: String,
    request: &ExportRequest,
    out_dir: &Path,
) -> Option<(Process, Option<PathBuf>)> {
    let export = &request.export;
    let base = map_name(&request.name);
    let driver = export.format.driver();
    match export.kind {
        ExportType::Raster => {
            let output = out_dir.join(format!("{base}{}", export.format.suffix()));
            let args = vec![
                "-fm".to_string(),
                format!("input={}", request.name),
                format!("format={driver}"),
                format!("output={}", output.display()),
                RASTER_CREATE_OPTIONS.to_string(),
            ];
            Some((Process::module(process_id, "r.out.gdal", args), Some(output)))
        }
        ExportType::Vector => {
            let mut args = vec![
                "-e".to_string(),
                format!("input={}", request.name),
                format!("format={driver}"),
            ];
            let output = if export.format == ExportFormat::PostgreSQL {
                args.push(format!("output={}", export.dbstring.as_deref().unwrap_or_default()));
                None
            } else {
                let path = out_dir.join(format!("{base}{}", export.format.suffix()));
                args.push(format!("output={}", path.display()));
                Some(path)
            };
            if let Some(layer) = &export.output_layer {
                args.push(format!("output_layer={layer}"));
            }
            Some((Process::module(process_id, "v.out.ogr", args), output))
        }
        ExportType::Strds | ExportType::Stvds => {
            let (module, format) = if export.kind == ExportType::Strds {
                ("t.rast.export", driver)
            } else {
                ("t.vect.export", "GML")
            };
            let output = out_dir.join(format!("{base}.tar.gz"));
            let args = vec![
                format!("input={}", request.name),
                format!("output={}", output.display()),
                format!("format={format}"),
                "compression=gzip".to_string(),
            ];
            Some((Process::module(process_id, module, args), Some(output)))
        }
        ExportType::File => None,
    }
}

fn store_download(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_dir() {
        fsops::copy_dir(src, dst, &[])?;
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

/// Download file name of a file export.
fn file_export_name(path: &Path, format: ExportFormat) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    if name.ends_with(format.suffix()) {
        name
    } else {
        format!("{name}{}", format.suffix())
    }
}

/// Run every export and return the download paths produced.
pub(crate) async fn export_resources(
    engine: &mut ProcessingEngine,
    exports: &[ExportRequest],
) -> Result<Vec<String>> {
    let rdc = engine.rdc();
    let download_dir = engine
        .ctx()
        .config
        .download_cache
        .join(&rdc.user_id)
        .join(&rdc.resource_id);
    fs::create_dir_all(&download_dir)?;
    let out_dir = engine.temp_file_dir().to_path_buf();

    let mut urls = Vec::new();
    for (n, request) in exports.iter().enumerate() {
        let process_id = format!("{}_export_{n}", request.process_id);
        let produced = match export_process(process_id, request, &out_dir) {
            Some((process, output)) => {
                let process = process.skipping_permission_check();
                engine.run_process(&process, None).await?;
                output
            }
            None => {
                let path = PathBuf::from(&request.name);
                if !path.exists() {
                    return Err(Error::Other(format!(
                        "file <{}> of step '{}' was not written",
                        path.display(),
                        request.process_id
                    )));
                }
                Some(path)
            }
        };

        let Some(produced) = produced else {
            continue;
        };
        let file_name = match request.export.kind {
            ExportType::File => file_export_name(&produced, request.export.format),
            _ => produced
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("export_{n}")),
        };
        let target = download_dir.join(file_name);
        let src = produced.clone();
        let dst = target.clone();
        tokio::task::spawn_blocking(move || store_download(&src, &dst))
            .await
            .map_err(|e| Error::Other(e.to_string()))??;
        info!(
            resource_id = %engine.rdc().resource_id,
            export = %request.name,
            target = %target.display(),
            "Resource exported"
        );
        urls.push(target.display().to_string());
    }
    Ok(urls)
}

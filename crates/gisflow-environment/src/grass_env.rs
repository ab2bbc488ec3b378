// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scoped GRASS session environment.
//!
//! A session is a `gisrc` file naming the database, location and mapset plus
//! the environment variables GRASS modules need. The gisrc file is removed
//! when the session is dropped, so the environment is torn down on every
//! exit path of a job.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// A GRASS session bound to one mapset.
#[derive(Debug)]
pub struct GrassSession {
    gisrc: PathBuf,
    env: BTreeMap<String, String>,
}

fn gisrc_content(gisdbase: &Path, location: &str, mapset: &str) -> String {
    format!(
        "GISDBASE: {}\nLOCATION_NAME: {location}\nMAPSET: {mapset}\nGUI: text\n",
        gisdbase.display()
    )
}

impl GrassSession {
    /// Write a gisrc into `work_dir` and build the session environment.
    pub fn setup(
        gis_base: &Path,
        gisdbase: &Path,
        location: &str,
        mapset: &str,
        work_dir: &Path,
    ) -> io::Result<Self> {
        fs::create_dir_all(work_dir)?;
        let gisrc = work_dir.join(".gisrc");
        fs::write(&gisrc, gisrc_content(gisdbase, location, mapset))?;

        let base = gis_base.display().to_string();
        let path = match std::env::var("PATH") {
            Ok(p) if !p.is_empty() => format!("{base}/bin:{base}/scripts:{p}"),
            _ => format!("{base}/bin:{base}/scripts:/usr/local/bin:/usr/bin:/bin"),
        };
        let mut env = BTreeMap::new();
        env.insert("GISBASE".to_string(), base.clone());
        env.insert("GISRC".to_string(), gisrc.display().to_string());
        env.insert("PATH".to_string(), path);
        env.insert("LD_LIBRARY_PATH".to_string(), format!("{base}/lib"));
        env.insert("PYTHONPATH".to_string(), format!("{base}/etc/python"));
        env.insert("GIS_LOCK".to_string(), std::process::id().to_string());
        env.insert("GRASS_SKIP_MAPSET_OWNER_CHECK".to_string(), "1".to_string());
        env.insert("GRASS_MESSAGE_FORMAT".to_string(), "plain".to_string());
        env.insert("GRASS_TGIS_RAISE_ON_ERROR".to_string(), "1".to_string());

        debug!(gisrc = %gisrc.display(), location = %location, mapset = %mapset, "GRASS session created");
        Ok(Self { gisrc, env })
    }

    /// Point the session at another mapset.
    pub fn switch_mapset(&self, gisdbase: &Path, location: &str, mapset: &str) -> io::Result<()> {
        fs::write(&self.gisrc, gisrc_content(gisdbase, location, mapset))
    }

    /// Environment variables for module invocations.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Path of the gisrc file.
    pub fn gisrc(&self) -> &Path {
        &self.gisrc
    }

    /// Read back the mapset directory a gisrc file points at.
    pub fn mapset_path_from_gisrc(gisrc: &Path) -> io::Result<PathBuf> {
        let content = fs::read_to_string(gisrc)?;
        let mut gisdbase = None;
        let mut location = None;
        let mut mapset = None;
        for line in content.lines() {
            match line.split_once(':') {
                Some(("GISDBASE", v)) => gisdbase = Some(v.trim().to_string()),
                Some(("LOCATION_NAME", v)) => location = Some(v.trim().to_string()),
                Some(("MAPSET", v)) => mapset = Some(v.trim().to_string()),
                _ => {}
            }
        }
        match (gisdbase, location, mapset) {
            (Some(g), Some(l), Some(m)) => Ok(PathBuf::from(g).join(l).join(m)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("incomplete gisrc file {}", gisrc.display()),
            )),
        }
    }

    /// Mapset directory of the session environment in `env`.
    pub fn mapset_path_from_env(env: &BTreeMap<String, String>) -> io::Result<PathBuf> {
        let gisrc = env
            .get("GISRC")
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "GISRC not set"))?;
        Self::mapset_path_from_gisrc(Path::new(gisrc))
    }
}

impl Drop for GrassSession {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.gisrc);
    }
}

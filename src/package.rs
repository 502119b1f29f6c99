/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Install the build and assemble the package tree
//!
//! The package step installs into the package dir, rewrites the
//! generated find-script into the location downstream consumers expect,
//! and emits a manifest describing the installed artifacts.

use std::{
    collections::BTreeSet,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;
use walkdir::WalkDir;

use crate::{cmake, config::Config, fixups, platform, Args, Paths};

pub fn package(config: &Config, args: &Args, paths: &Paths) -> Result<()> {
    let mut definitions = cmake::assemble_definitions(config, paths)?;
    if config.options.qt {
        // On a second configure, pcl_find_qt5.cmake resets QT_USE_FILE
        // to a system path. Pin it back to the build tree's copy.
        definitions.set(
            "QT_USE_FILE",
            platform::adjust_path(&paths.build_dir.join("use-qt5.cmake")),
        );
    }
    cmake::configure(config, args, paths, &definitions)?;
    cmake::install(config, args, paths)?;

    let src = paths.build_dir.join("PCLConfig.cmake");
    let dst = paths
        .package_dir
        .join(platform::find_script_dir(&config.short_version()))
        .join("PCLConfig.cmake");
    let outcomes = fixups::fix_find_script(config, &src, &dst)?;
    fixups::report(&outcomes)?;

    write_manifest(config, paths)?;

    Ok(())
}

/// What the package contains and where, for consumers that don't read
/// the find-script.
#[derive(Debug, Serialize)]
struct PackageManifest {
    name: String,
    version: String,
    /// PCL installs its headers under a versioned include dir
    include_dir: PathBuf,
    find_script_dir: PathBuf,
    pkg_config_dir: PathBuf,
    libs: Vec<String>,
    /// Directories consumers must add to their runtime search path
    runtime_dirs: Vec<PathBuf>,
}

fn write_manifest(config: &Config, paths: &Paths) -> Result<()> {
    let libs = collect_libs(&paths.package_dir.join("lib"))?;

    let runtime_dirs = if cfg!(windows) && config.options.shared {
        vec![PathBuf::from("lib")]
    } else {
        Vec::new()
    };

    let manifest = PackageManifest {
        name: "pcl".to_string(),
        version: config.version.to_string(),
        include_dir: PathBuf::from(format!("include/pcl-{}", config.short_version())),
        find_script_dir: platform::find_script_dir(&config.short_version()),
        pkg_config_dir: PathBuf::from("lib").join("pkgconfig"),
        libs,
        runtime_dirs,
    };

    let path = paths.package_dir.join("pclpack-manifest.json");
    let json = serde_json::to_vec_pretty(&manifest)?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("Wrote package manifest {}", path.display());

    Ok(())
}

/// Installed library names in the form linkers expect, without a `lib`
/// prefix or extension. Versioned shared-object names collapse onto
/// their unversioned stem.
fn collect_libs(lib_dir: &Path) -> Result<Vec<String>> {
    let mut libs = BTreeSet::new();
    if !lib_dir.exists() {
        return Ok(Vec::new());
    }

    for entry in WalkDir::new(lib_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path.extension().and_then(OsStr::to_str);
        if !matches!(ext, Some("so") | Some("a") | Some("dylib") | Some("lib")) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(OsStr::to_str) {
            let name = stem.strip_prefix("lib").unwrap_or(stem);
            libs.insert(name.to_string());
        }
    }

    Ok(libs.into_iter().collect())
}

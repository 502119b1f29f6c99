/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Recipe configuration
//!
//! A recipe cannot run without resolved dependency roots, so unlike most
//! tool config a missing `pclpack.toml` is an error rather than a default.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

/// Dependencies every build needs an install root for. qt and vtk are
/// required only when the matching option is enabled.
const REQUIRED_DEPENDENCIES: &[&str] = &["boost", "eigen", "flann", "qhull", "zlib"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory the config was read from
    #[serde(skip)]
    pub config_dir: PathBuf,

    /// Version of PCL being packaged
    pub version: semver::Version,

    #[serde(default)]
    pub options: Options,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub cmake: CmakeConfig,

    /// Resolved dependency install roots from the package manager
    #[serde(default)]
    pub dependencies: IndexMap<String, Dependency>,

    #[serde(default)]
    pub fixups: FixupConfig,
}

impl Config {
    /// `pcl-pcl-<version>`, the top-level directory inside the release archive
    pub fn archive_root(&self) -> String {
        format!("pcl-pcl-{}", self.version)
    }

    /// File name of the release archive
    pub fn archive_file(&self) -> String {
        format!("{}.tar.gz", self.archive_root())
    }

    /// `<major>.<minor>`, the truncated version PCL uses in install layout names
    pub fn short_version(&self) -> String {
        format!("{}.{}", self.version.major, self.version.minor)
    }

    /// Whether the vtk dependency participates in this build
    pub fn vtk_enabled(&self) -> bool {
        self.options.vtk && self.dependencies.contains_key("vtk")
    }

    fn validate(&self) -> Result<()> {
        for name in REQUIRED_DEPENDENCIES {
            if !self.dependencies.contains_key(*name) {
                bail!("Missing [dependencies.{}] (install root required)", name);
            }
        }
        if self.options.qt && !self.dependencies.contains_key("qt") {
            bail!("Option qt is enabled but [dependencies.qt] is missing");
        }
        if self.options.vtk && !self.dependencies.contains_key("vtk") {
            bail!("Option vtk is enabled but [dependencies.vtk] is missing");
        }
        Ok(())
    }
}

/// Build options, defaulting to the recipe's historical defaults (all on)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    /// Build shared libraries
    #[serde(default = "default_true")]
    pub shared: bool,
    /// Position-independent code (ignored for msvc)
    #[serde(default = "default_true")]
    pub fpic: bool,
    /// Compile as C++11
    #[serde(default = "default_true")]
    pub cxx11: bool,
    /// Build against Qt
    #[serde(default = "default_true")]
    pub qt: bool,
    /// Build against VTK
    #[serde(default = "default_true")]
    pub vtk: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            shared: true,
            fpic: true,
            cxx11: true,
            qt: true,
            vtk: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Base URL the release archive is downloaded from
    #[serde(default = "default_archive_url")]
    pub archive_url: String,
    /// Expected SHA-256 of the release archive
    #[serde(default)]
    pub archive_sha256: Option<String>,
    /// Directory searched for an already-fetched archive
    #[serde(default)]
    pub archive_cache: Option<PathBuf>,
    /// Upstream repository for the clone fallback
    #[serde(default = "default_git_url")]
    pub git_url: String,
    /// Globs selecting patch files, relative to the recipe dir
    #[serde(default = "default_patch_globs")]
    pub patch_globs: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            archive_url: default_archive_url(),
            archive_sha256: None,
            archive_cache: None,
            git_url: default_git_url(),
            patch_globs: default_patch_globs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CmakeConfig {
    /// Path to cmake executable. If set, then relative to the recipe dir
    #[serde(default)]
    pub cmake: Option<PathBuf>,
    /// Generator passed as -G
    #[serde(default)]
    pub generator: Option<String>,
    /// Compiler family the enclosing package manager selected
    /// ("gcc", "msvc", ...); drives a handful of flag decisions
    #[serde(default)]
    pub compiler: Option<String>,
    /// Extra flags appended to ADDITIONAL_CXX_FLAGS
    #[serde(default)]
    pub cxx_flags: Vec<String>,
}

/// One resolved upstream library
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dependency {
    /// Install root inside the package manager's cache
    pub root: PathBuf,
    /// Upstream version, where the recipe needs it (vtk's CMake module dir)
    #[serde(default)]
    pub version: Option<String>,
    /// Whether the dependency was built shared (boost linking on Windows)
    #[serde(default)]
    pub shared: Option<bool>,
    /// Override for this dependency's find-script replacement expression
    #[serde(default)]
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixupConfig {
    /// Token marking package-manager cache paths in generated scripts
    #[serde(default = "default_marker")]
    pub marker: String,
    /// Additional substitutions appended after the built-in table
    #[serde(default)]
    pub extra: IndexMap<String, String>,
}

impl Default for FixupConfig {
    fn default() -> Self {
        FixupConfig {
            marker: default_marker(),
            extra: IndexMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_archive_url() -> String {
    "https://github.com/PointCloudLibrary/pcl/archive".to_string()
}

fn default_git_url() -> String {
    "https://github.com/PointCloudLibrary/pcl.git".to_string()
}

fn default_patch_globs() -> Vec<String> {
    vec!["patches/*".to_string()]
}

fn default_marker() -> String {
    "conan".to_string()
}

pub fn read_config(dir: &Path) -> Result<Config> {
    let path = dir.join("pclpack.toml");

    let file = fs::read(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;

    let mut config: Config =
        toml::de::from_slice(&file).context(format!("Failed to parse {}", path.display()))?;
    config.config_dir = dir.to_path_buf();
    config
        .validate()
        .context(format!("Invalid config {}", path.display()))?;

    log::debug!("Read config {:#?}", config);

    Ok(config)
}

/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Obtain the PCL source tree
//!
//! Acquisition tries an explicit list of strategies in order: a local
//! archive cache, an upstream download verified against a pinned digest,
//! and finally a git clone of the release tag. The winning strategy is
//! part of the result so the operator can see where the tree came from.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context, Result};
use globset::{GlobBuilder, GlobSetBuilder};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::{config::Config, Paths};

/// One way of obtaining the source tree
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Strategy {
    CacheCopy,
    Download,
    GitClone,
}

impl fmt::Display for Strategy {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Strategy::CacheCopy => "cache-copy",
            Strategy::Download => "download",
            Strategy::GitClone => "git-clone",
        };
        fmt.write_str(name)
    }
}

/// Outcome of the fetch step
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Fetched {
    /// Source tree was already on disk; nothing acquired
    Existing,
    /// Source tree acquired by the named strategy
    Acquired(Strategy),
}

/// Fetch the source tree into `paths.source_dir` and apply patches.
pub fn fetch(config: &Config, paths: &Paths, no_patch: bool) -> Result<Fetched> {
    if paths.source_dir.exists() {
        log::info!(
            "Source tree {} already present, not fetching",
            paths.source_dir.display()
        );
        return Ok(Fetched::Existing);
    }

    let strategy = acquire(config, paths)?;

    if !no_patch {
        apply_patches(config, paths)?;
    }

    Ok(Fetched::Acquired(strategy))
}

fn acquire(config: &Config, paths: &Paths) -> Result<Strategy> {
    let strategies: [(Strategy, fn(&Config, &Paths) -> Result<()>); 3] = [
        (Strategy::CacheCopy, try_cache_copy),
        (Strategy::Download, try_download),
        (Strategy::GitClone, try_git_clone),
    ];

    let mut last_err = None;
    for (strategy, attempt) in &strategies {
        match attempt(config, paths) {
            Ok(()) => {
                log::info!("Obtained {} via {}", config.archive_root(), strategy);
                return Ok(*strategy);
            }
            Err(err) => {
                log::warn!("Source strategy {} failed: {:#}", strategy, err);
                last_err = Some(err);
            }
        }
    }

    Err(last_err
        .expect("strategy list is non-empty")
        .context("every source acquisition strategy failed"))
}

fn try_cache_copy(config: &Config, paths: &Paths) -> Result<()> {
    let cache = match config.source.archive_cache.as_ref() {
        Some(dir) => dir,
        None => bail!("no archive cache configured"),
    };
    let cached = cache.join(config.archive_file());
    if !cached.exists() {
        bail!("{} not present in cache", cached.display());
    }

    let local = paths.recipe_dir.join(config.archive_file());
    fs::copy(&cached, &local)
        .with_context(|| format!("Failed to copy {} from cache", cached.display()))?;

    unpack(config, paths, &local)
}

fn try_download(config: &Config, paths: &Paths) -> Result<()> {
    let local = paths.recipe_dir.join(config.archive_file());

    // The archive can survive from an earlier run
    if !local.exists() {
        let url = format!(
            "{}/{}",
            config.source.archive_url.trim_end_matches('/'),
            config.archive_file()
        );
        log::info!("Downloading {}", url);
        let mut curl = Command::new("curl");
        curl.arg("-fsSL").arg("-o").arg(&local).arg(&url);
        run_command(&mut curl)?;
    }

    if let Some(expected) = config.source.archive_sha256.as_deref() {
        verify_sha256(&local, expected)?;
    } else {
        log::warn!("No archive_sha256 configured, skipping verification");
    }

    unpack(config, paths, &local)
}

fn try_git_clone(config: &Config, paths: &Paths) -> Result<()> {
    let mut clone = Command::new("git");
    clone
        .arg("clone")
        .arg(&config.source.git_url)
        .arg(&paths.source_dir);
    run_command(&mut clone)?;

    let mut checkout = Command::new("git");
    checkout
        .arg("checkout")
        .arg(format!("pcl-{}", config.version))
        .current_dir(&paths.source_dir);
    run_command(&mut checkout)?;

    Ok(())
}

fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let actual = hex::encode(hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected) {
        bail!(
            "Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        );
    }
    Ok(())
}

fn unpack(config: &Config, paths: &Paths, archive: &Path) -> Result<()> {
    let mut tar = Command::new("tar");
    tar.arg("-xzf").arg(archive).current_dir(&paths.recipe_dir);
    run_command(&mut tar)?;

    // The archive unpacks as pcl-pcl-<version>; the recipe wants a
    // stable tree name.
    let unpacked = paths.recipe_dir.join(config.archive_root());
    fs::rename(&unpacked, &paths.source_dir).with_context(|| {
        format!(
            "Failed to move {} to {}",
            unpacked.display(),
            paths.source_dir.display()
        )
    })?;
    Ok(())
}

/// Apply every patch matching the configured globs, in sorted order.
fn apply_patches(config: &Config, paths: &Paths) -> Result<()> {
    let patches = find_patches(&config.source.patch_globs, &paths.recipe_dir)?;
    if patches.is_empty() {
        log::debug!("No patches to apply");
        return Ok(());
    }

    for patch in patches {
        log::info!("Applying patch {}", patch.display());
        let mut cmd = Command::new("patch");
        cmd.arg("-Np1")
            .arg("-i")
            .arg(&patch)
            .current_dir(&paths.source_dir);
        run_command(&mut cmd)
            .with_context(|| format!("Failed to apply {}", patch.display()))?;
    }
    Ok(())
}

fn find_patches(patch_globs: &[String], recipe_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut builder = GlobSetBuilder::new();
    for glob in patch_globs {
        let glob = GlobBuilder::new(glob)
            .literal_separator(true)
            .build()
            .with_context(|| format!("Invalid patch glob `{}`", glob))?;
        builder.add(glob);
    }
    let globs = builder.build()?;

    let mut patches = Vec::new();
    for entry in WalkDir::new(recipe_dir).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(recipe_dir)
            .expect("walked path is under the recipe dir");
        if globs.is_match(rel) {
            patches.push(entry.path().to_path_buf());
        }
    }
    patches.sort();
    Ok(patches)
}

// Run an external command, capturing output. A non-zero exit is an
// error carrying stderr.
fn run_command(command: &mut Command) -> Result<String> {
    log::debug!("Running {:?}", command);

    let output = command
        .output()
        .with_context(|| format!("Failed to execute `{:?}`", command))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stdout.lines() {
        log::trace!("STDOUT: {}", line);
    }
    for line in stderr.lines() {
        log::trace!("STDERR: {}", line);
    }

    if !output.status.success() {
        bail!("`{:?}` failed:\n{}", command, stderr);
    }

    Ok(stdout)
}

/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Host-specific path and layout conventions

use std::path::{Path, PathBuf};

/// Render a path for consumption by CMake. CMake accepts forward slashes
/// everywhere, and backslashes confuse its cache parser on Windows.
pub fn adjust_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if cfg!(windows) {
        s.replace('\\', "/")
    } else {
        s.into_owned()
    }
}

/// Directory of the packaged find-script, relative to the package root.
/// Windows consumers look in `cmake/`, everyone else under `share/`.
pub fn find_script_dir(short_version: &str) -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("cmake")
    } else {
        PathBuf::from("share").join(format!("pcl-{}", short_version))
    }
}

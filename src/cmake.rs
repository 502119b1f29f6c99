/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Interface with CMake
//!
//! This module defines invocations of `cmake` to configure, build and
//! install the PCL tree, and the assembly of the cache variables the
//! recipe passes to the configure step. It also defines the types for
//! deserializing `cmake -E capabilities` JSON output.

use std::{
    fmt, fs,
    io::{BufRead, BufReader},
    path::Path,
    process::{Command, Stdio},
    thread,
};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::{
    config::{Config, Dependency},
    platform::adjust_path,
    Args, Paths,
};

/// Ordered set of cache definitions passed to the configure step
#[derive(Debug, Clone, Default)]
pub struct Definitions(IndexMap<String, String>);

impl Definitions {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn to_args(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(key, value)| format!("-D{}={}", key, value))
            .collect()
    }
}

impl fmt::Display for Definitions {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        for (key, value) in &self.0 {
            writeln!(fmt, " - {}={}", key, value)?;
        }
        Ok(())
    }
}

fn is_msvc(config: &Config) -> bool {
    matches!(
        config.cmake.compiler.as_deref(),
        Some("msvc") | Some("Visual Studio")
    )
}

/// `lib/cmake/vtk-<major.minor>`, where VTK installs its CMake modules
pub fn vtk_cmake_rel_dir(vtk: &Dependency) -> Result<String> {
    let version = vtk
        .version
        .as_deref()
        .context("vtk dependency needs a version to locate its CMake module dir")?;
    let major = version.split('.').take(2).join(".");
    Ok(format!("lib/cmake/vtk-{}", major))
}

/// VTK's major version, where known. VTK 7 and older want the bare
/// Qt5Config alongside the per-component ones.
fn vtk_major(config: &Config) -> Option<u64> {
    let vtk = config.dependencies.get("vtk")?;
    vtk.version.as_deref()?.split('.').next()?.parse().ok()
}

/// Map the resolved dependency roots and build options onto the cache
/// variables PCL's CMake build understands.
pub fn assemble_definitions(config: &Config, paths: &Paths) -> Result<Definitions> {
    let mut defs = Definitions::default();

    defs.set(
        "CMAKE_INSTALL_PREFIX:PATH",
        adjust_path(&paths.package_dir),
    );

    // Boost
    let boost = &config.dependencies["boost"];
    defs.set("BOOST_ROOT:PATH", adjust_path(&boost.root));

    if config.options.fpic && !is_msvc(config) {
        defs.set("CMAKE_POSITION_INDEPENDENT_CODE:BOOL", "ON");
    }
    if config.options.cxx11 {
        defs.set("CMAKE_CXX_STANDARD", "11");
    }

    let mut cxx_flags = Vec::new();
    if config.cmake.compiler.as_deref() == Some("gcc") {
        if !cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
            cxx_flags.push("-mtune=generic".to_string());
        }
        cxx_flags.push("-frecord-gcc-switches".to_string());
    }
    cxx_flags.extend(config.cmake.cxx_flags.iter().cloned());
    if !cxx_flags.is_empty() {
        defs.set("ADDITIONAL_CXX_FLAGS:STRING", cxx_flags.iter().join(" "));
    }

    // QHull. PCL insists on the Release flavour, so only that one is
    // provided by the recipe.
    if let Some(qhull) = config.dependencies.get("qhull") {
        defs.set("QHULL_ROOT:PATH", adjust_path(&qhull.root));
    }

    // GTest
    if let Some(gtest) = config.dependencies.get("gtest") {
        defs.set("GTEST_ROOT:PATH", adjust_path(&gtest.root));
    }

    // VTK
    if config.vtk_enabled() {
        let vtk = &config.dependencies["vtk"];
        let rel_dir = vtk_cmake_rel_dir(vtk)?;
        defs.set("VTK_DIR:PATH", adjust_path(&vtk.root.join(rel_dir)));
    } else {
        defs.set("WITH_VTK:BOOL", "OFF");
    }

    // Zlib
    let zlib = &config.dependencies["zlib"];
    defs.set("ZLIB_ROOT:PATH", adjust_path(&zlib.root));

    // PCL options
    defs.set("BUILD_surface_on_nurbs:BOOL", "ON");
    defs.set(
        "BUILD_SHARED_LIBS:BOOL",
        if config.options.shared { "ON" } else { "OFF" },
    );
    if cfg!(windows) {
        let boost_shared = boost.shared.unwrap_or(false);
        defs.set(
            "PCL_BUILD_WITH_BOOST_DYNAMIC_LINKING_WIN32:BOOL",
            if boost_shared { "ON" } else { "OFF" },
        );
    }

    // Qt exposes pkg-config files, but PCL's pcl_find_qt5.cmake doesn't
    // read them, so each component dir is spelled out.
    if config.options.qt {
        let qt = &config.dependencies["qt"];
        let mut components = vec!["Core", "Gui", "OpenGL", "Widgets"];
        if matches!(vtk_major(config), Some(major) if major <= 7) {
            // VTK 7 wants Qt5Config itself
            components.push("");
        }
        for component in components {
            defs.set(
                format!("Qt5{}_DIR:PATH", component),
                adjust_path(&qt.root.join("lib").join("cmake").join(format!(
                    "Qt5{}",
                    component
                ))),
            );
        }
        defs.set(
            "QT_QMAKE_EXECUTABLE:PATH",
            adjust_path(&qt.root.join("bin").join("qmake")),
        );
    } else {
        defs.set("WITH_QT:BOOL", "OFF");
    }

    // Eigen is found with pkg-config too, but the build still requires
    // EIGEN_INCLUDE_DIR to be spelled out.
    let eigen = &config.dependencies["eigen"];
    defs.set(
        "EIGEN_INCLUDE_DIR:PATH",
        adjust_path(&eigen.root.join("include").join("eigen3")),
    );

    // Flann is found via pkg-config.

    Ok(defs)
}

/// Extra environment for build and install steps. Boost links shared
/// bzip2 without exposing its lib path, so the linker needs help on
/// Linux.
pub fn build_env(config: &Config) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if cfg!(target_os = "linux") {
        if let Some(bzip2) = config.dependencies.get("bzip2") {
            env.push((
                "LD_LIBRARY_PATH".to_string(),
                bzip2.root.join("lib").display().to_string(),
            ));
        }
    }
    env
}

// Run a cmake command
pub(crate) fn run_cmake(
    config: &Config,
    current_dir: Option<&Path>,
    env: &[(String, String)],
    args: &Args,
    opts: &[&str],
) -> Result<String> {
    let cmdline: Vec<_> = opts
        .iter()
        .cloned()
        .chain(args.cmake_options.iter().map(String::as_str))
        .collect();

    log::debug!(
        "Running CMake command {:?} in dir {:?}",
        cmdline,
        current_dir
    );

    let mut cmake_command = if let Some(cmake_path) = args.cmake_path.as_ref() {
        Command::new(cmake_path)
    } else if let Some(bin) = config.cmake.cmake.as_ref() {
        Command::new(config.config_dir.join(bin))
    } else {
        Command::new("cmake")
    };

    if let Some(current_dir) = current_dir {
        cmake_command.current_dir(current_dir);
    }

    cmake_command
        .args(&cmdline)
        .envs(env.iter().map(|(key, value)| (key, value)))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmake_command
        .spawn()
        .with_context(|| format!("Failed to execute `{:?}`", cmake_command))?;

    let stdout_thr = thread::spawn({
        let stdout = BufReader::new(child.stdout.take().unwrap());
        move || {
            let mut buf = String::new();
            for line in stdout.lines() {
                let line = line.expect("malformed stdout from cmake");
                log::trace!("STDOUT: {}", line);
                buf += &line;
                buf += "\n";
            }
            buf
        }
    });
    let stderr_thr = thread::spawn({
        let stderr = BufReader::new(child.stderr.take().unwrap());
        move || {
            let mut buf = String::new();
            for line in stderr.lines() {
                let line = line.expect("malformed stderr from cmake");
                log::trace!("cmake: {}", line);
                buf += &line;
                buf += "\n";
            }
            buf
        }
    });

    let stdout = stdout_thr.join().expect("stdout thread join failed");
    let stderr = stderr_thr.join().expect("stderr thread join failed");

    if !child.wait()?.success() {
        bail!("`{:?}` failed:\n{}", cmake_command, stderr);
    }

    Ok(stdout)
}

// Run a cmake command, assuming it returns a json output of some form.
pub(crate) fn run_cmake_json<T: DeserializeOwned>(
    config: &Config,
    current_dir: Option<&Path>,
    args: &Args,
    opts: &[&str],
) -> Result<T> {
    let json = run_cmake(config, current_dir, &[], args, opts).context("running cmake")?;

    let res = serde_json::from_str::<T>(&json).context("deserializing json")?;

    Ok(res)
}

/// Subset of `cmake -E capabilities` output
#[derive(Debug, Deserialize)]
pub struct Capabilities {
    pub version: CapabilitiesVersion,
    #[serde(default)]
    pub generators: Vec<Generator>,
}

#[derive(Debug, Deserialize)]
pub struct CapabilitiesVersion {
    pub string: String,
    pub major: u64,
}

#[derive(Debug, Deserialize)]
pub struct Generator {
    pub name: String,
}

pub fn capabilities(config: &Config, args: &Args) -> Result<Capabilities> {
    run_cmake_json(config, None, args, &["-E", "capabilities"])
        .context("probing cmake capabilities")
}

/// Run the configure step in the build dir.
pub fn configure(
    config: &Config,
    args: &Args,
    paths: &Paths,
    definitions: &Definitions,
) -> Result<()> {
    let caps = capabilities(config, args)?;
    log::info!("Configuring with CMake {}", caps.version.string);
    if caps.version.major < 3 {
        log::warn!(
            "CMake {} is older than the 3.x this recipe is exercised with",
            caps.version.string
        );
    }
    if let Some(generator) = config.cmake.generator.as_deref() {
        if !caps.generators.iter().any(|g| g.name == generator) {
            log::warn!("Generator {} not reported by this cmake", generator);
        }
    }

    fs::create_dir_all(&paths.build_dir).with_context(|| {
        format!("Failed to create build dir {}", paths.build_dir.display())
    })?;

    let env = build_env(config);
    log::info!("CMake definitions:\n{}", definitions);
    for (key, value) in &env {
        log::info!("Additional environment: {}={}", key, value);
    }

    let mut opts = vec![adjust_path(&paths.source_dir)];
    if let Some(generator) = config.cmake.generator.as_deref() {
        opts.push("-G".to_string());
        opts.push(generator.to_string());
    }
    opts.extend(definitions.to_args());

    let opts: Vec<&str> = opts.iter().map(String::as_str).collect();
    run_cmake(config, Some(&paths.build_dir), &env, args, &opts)?;

    Ok(())
}

/// Compile the configured tree.
pub fn build(config: &Config, args: &Args, paths: &Paths) -> Result<()> {
    let env = build_env(config);
    run_cmake(
        config,
        Some(&paths.build_dir),
        &env,
        args,
        &["--build", "."],
    )?;
    Ok(())
}

/// Install the built tree into the package dir.
pub fn install(config: &Config, args: &Args, paths: &Paths) -> Result<()> {
    log::info!("Installing into {}", paths.package_dir.display());
    let env = build_env(config);
    run_cmake(
        config,
        Some(&paths.build_dir),
        &env,
        args,
        &["--build", ".", "--target", "install"],
    )?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;

    fn test_config(extra: &str) -> Config {
        let toml_str = format!(
            r#"
            version = "1.7.2"

            [dependencies.boost]
            root = "/roots/boost"
            [dependencies.eigen]
            root = "/roots/eigen"
            [dependencies.flann]
            root = "/roots/flann"
            [dependencies.qhull]
            root = "/roots/qhull"
            [dependencies.zlib]
            root = "/roots/zlib"
            [dependencies.bzip2]
            root = "/roots/bzip2"
            [dependencies.qt]
            root = "/roots/qt"
            [dependencies.vtk]
            root = "/roots/vtk"
            version = "8.2.0"

            {}
            "#,
            extra
        );
        toml::from_str(&toml_str).unwrap()
    }

    fn test_paths() -> Paths {
        Paths {
            recipe_dir: PathBuf::from("/work"),
            source_dir: PathBuf::from("/work/pcl"),
            build_dir: PathBuf::from("/work/build"),
            package_dir: PathBuf::from("/work/package"),
        }
    }

    fn args_of(defs: &Definitions) -> Vec<String> {
        defs.to_args()
    }

    #[test]
    fn assembles_dependency_roots() {
        let defs = assemble_definitions(&test_config(""), &test_paths()).unwrap();
        let args = args_of(&defs);

        assert!(args.contains(&"-DCMAKE_INSTALL_PREFIX:PATH=/work/package".to_string()));
        assert!(args.contains(&"-DBOOST_ROOT:PATH=/roots/boost".to_string()));
        assert!(args.contains(&"-DQHULL_ROOT:PATH=/roots/qhull".to_string()));
        assert!(args.contains(&"-DZLIB_ROOT:PATH=/roots/zlib".to_string()));
        assert!(args.contains(&"-DEIGEN_INCLUDE_DIR:PATH=/roots/eigen/include/eigen3".to_string()));
        assert!(args.contains(&"-DVTK_DIR:PATH=/roots/vtk/lib/cmake/vtk-8.2".to_string()));
        assert!(args.contains(&"-DBUILD_SHARED_LIBS:BOOL=ON".to_string()));
        assert!(args.contains(&"-DBUILD_surface_on_nurbs:BOOL=ON".to_string()));
        assert!(args.contains(&"-DCMAKE_POSITION_INDEPENDENT_CODE:BOOL=ON".to_string()));
        assert!(args.contains(&"-DCMAKE_CXX_STANDARD=11".to_string()));
    }

    #[test]
    fn qt_component_dirs() {
        let defs = assemble_definitions(&test_config(""), &test_paths()).unwrap();
        let args = args_of(&defs);

        assert!(args.contains(&"-DQt5Core_DIR:PATH=/roots/qt/lib/cmake/Qt5Core".to_string()));
        assert!(args.contains(&"-DQt5Widgets_DIR:PATH=/roots/qt/lib/cmake/Qt5Widgets".to_string()));
        assert!(args.contains(&"-DQT_QMAKE_EXECUTABLE:PATH=/roots/qt/bin/qmake".to_string()));
        // VTK 8 does not want the bare Qt5Config
        assert!(!args.iter().any(|a| a.starts_with("-DQt5_DIR")));
    }

    #[test]
    fn old_vtk_wants_bare_qt5_dir() {
        let mut config = test_config("");
        config.dependencies.get_mut("vtk").unwrap().version = Some("6.3.0".to_string());
        let defs = assemble_definitions(&config, &test_paths()).unwrap();

        assert!(defs
            .to_args()
            .contains(&"-DQt5_DIR:PATH=/roots/qt/lib/cmake/Qt5".to_string()));
    }

    #[test]
    fn disabled_options_turn_features_off() {
        let config = test_config("[options]\nqt = false\nvtk = false\nshared = false");
        let defs = assemble_definitions(&config, &test_paths()).unwrap();
        let args = args_of(&defs);

        assert!(args.contains(&"-DWITH_QT:BOOL=OFF".to_string()));
        assert!(args.contains(&"-DWITH_VTK:BOOL=OFF".to_string()));
        assert!(args.contains(&"-DBUILD_SHARED_LIBS:BOOL=OFF".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("-DVTK_DIR")));
        assert!(!args.iter().any(|a| a.starts_with("-DQt5")));
    }

    #[test]
    fn gcc_cxx_flags() {
        let config = test_config("[cmake]\ncompiler = \"gcc\"");
        let defs = assemble_definitions(&config, &test_paths()).unwrap();

        let flags = args_of(&defs)
            .into_iter()
            .find(|a| a.starts_with("-DADDITIONAL_CXX_FLAGS:STRING="))
            .unwrap();
        assert!(flags.contains("-frecord-gcc-switches"));
    }

    #[test]
    fn vtk_rel_dir_needs_version() {
        let mut config = test_config("");
        config.dependencies.get_mut("vtk").unwrap().version = None;
        assert!(assemble_definitions(&config, &test_paths()).is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn bzip2_lib_reaches_the_linker() {
        let env = build_env(&test_config(""));
        assert_eq!(
            env,
            vec![(
                "LD_LIBRARY_PATH".to_string(),
                "/roots/bzip2/lib".to_string()
            )]
        );
    }
}

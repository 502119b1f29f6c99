/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fix up the generated find-script
//!
//! PCL's build emits PCLConfig.cmake with the package manager's private
//! cache paths baked into its quoted path literals. To make the
//! installed script portable, every literal locating a dependency is
//! rewritten to the symbolic variable the package manager resolves at
//! consumption time.
//!
//! The surrounding CMake syntax is opaque here: the scan works on quoted
//! spans within single lines, not on a parse of the script.

use std::{fs, io::Write, path::Path};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::cmake::vtk_cmake_rel_dir;
use crate::config::Config;

/// Result of one dependency's pass over the script text. "Not found" is
/// an explicit outcome so a caller has to decide to ignore it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FixOutcome {
    /// Number of quoted literals rewritten
    Replaced { occurrences: usize },
    /// No quoted literal contained the cache marker and the dependency
    NotFound,
}

/// Build the substitution table for this build's active dependencies:
/// dependency name to the expression the matching literals are replaced
/// with. Insertion order is the order substitutions run and report.
pub fn substitution_table(config: &Config) -> Result<IndexMap<String, String>> {
    let mut table = IndexMap::new();
    table.insert(
        "eigen".to_string(),
        "${CONAN_INCLUDE_DIRS_EIGEN}/eigen3".to_string(),
    );
    table.insert(
        "boost".to_string(),
        "${CONAN_INCLUDE_DIRS_BOOST}".to_string(),
    );
    table.insert(
        "flann".to_string(),
        "${CONAN_INCLUDE_DIRS_FLANN}".to_string(),
    );
    table.insert(
        "qhull".to_string(),
        "${CONAN_INCLUDE_DIRS_QHULL}".to_string(),
    );
    table.insert("pcl".to_string(), "${CONAN_PCL_ROOT}/pcl".to_string());

    if config.vtk_enabled() {
        let rel_dir = vtk_cmake_rel_dir(&config.dependencies["vtk"])?;
        table.insert("vtk".to_string(), format!("${{CONAN_VTK_ROOT}}/{}", rel_dir));
    }

    // Per-dependency overrides keep their built-in position; new names
    // append.
    for (name, dep) in &config.dependencies {
        if let Some(placeholder) = dep.placeholder.as_deref() {
            table.insert(name.clone(), placeholder.to_string());
        }
    }
    for (name, replacement) in &config.fixups.extra {
        table.insert(name.clone(), replacement.clone());
    }

    Ok(table)
}

/// Rewrite the find-script at `src` and write the result to `dst`,
/// creating `dst`'s parent if needed. A dependency with no matching
/// literal is a warning, never an error; the script is still written.
pub fn fix_find_script(
    config: &Config,
    src: &Path,
    dst: &Path,
) -> Result<Vec<(String, FixOutcome)>> {
    let table = substitution_table(config)?;

    log::info!("Fixing find-script {}", src.display());
    let mut data = fs::read_to_string(src)
        .with_context(|| format!("Failed to read find-script {}", src.display()))?;

    let mut outcomes = Vec::new();
    for (name, replacement) in &table {
        let (next, outcome) = substitute(&data, &config.fixups.marker, name, replacement);
        match outcome {
            FixOutcome::Replaced { occurrences } => {
                log::debug!("{}: rewrote {} literal(s)", name, occurrences);
                data = next;
            }
            FixOutcome::NotFound => {
                log::warn!("Could not find {} in {}", name, src.display());
            }
        }
        outcomes.push((name.clone(), outcome));
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    log::info!("Installing fixed find-script to {}", dst.display());
    fs::write(dst, data).with_context(|| format!("Failed to write {}", dst.display()))?;

    Ok(outcomes)
}

/// Print a per-dependency summary of a fixup pass.
pub fn report(outcomes: &[(String, FixOutcome)]) -> Result<()> {
    let stdout = &mut StandardStream::stdout(ColorChoice::Auto);
    let default = ColorSpec::new();
    let mut green = ColorSpec::new();
    green.set_fg(Some(Color::Green));
    let mut yellow = ColorSpec::new();
    yellow.set_fg(Some(Color::Yellow));

    for (name, outcome) in outcomes {
        match outcome {
            FixOutcome::Replaced { occurrences } => {
                stdout.set_color(&green)?;
                writeln!(stdout, "FIXED {} ({} literal(s))", name, occurrences)?;
            }
            FixOutcome::NotFound => {
                stdout.set_color(&yellow)?;
                writeln!(stdout, "MISSING {}", name)?;
            }
        }
    }
    stdout.set_color(&default)?;

    Ok(())
}

/// Content range of one double-quoted literal
#[derive(Debug, Eq, PartialEq)]
struct QuotedSpan {
    start: usize,
    end: usize,
}

/// Scan for double-quoted spans. Quotes pair up within a line; a quote
/// with no closing partner on its line opens nothing.
fn quoted_spans(text: &str) -> Vec<QuotedSpan> {
    let mut spans = Vec::new();
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let mut search = 0;
        while let Some(open) = line[search..].find('"') {
            let content_start = search + open + 1;
            match line[content_start..].find('"') {
                Some(len) => {
                    spans.push(QuotedSpan {
                        start: offset + content_start,
                        end: offset + content_start + len,
                    });
                    search = content_start + len + 1;
                }
                None => break,
            }
        }
        offset += line.len();
    }

    spans
}

/// A literal matches when it contains the cache marker with the
/// dependency name somewhere after it.
fn span_matches(content: &str, marker: &str, name: &str) -> bool {
    match content.find(marker) {
        Some(pos) => content[pos + marker.len()..].contains(name),
        None => false,
    }
}

/// Replace the content of every quoted literal matching marker+name,
/// keeping the quotes and everything outside the literals. All
/// occurrences are rewritten: generated multi-config scripts repeat
/// dependency paths, and a partially-rewritten script is worse than
/// none.
fn substitute(text: &str, marker: &str, name: &str, replacement: &str) -> (String, FixOutcome) {
    let mut out = String::with_capacity(text.len());
    let mut occurrences = 0;
    let mut cursor = 0;

    for span in quoted_spans(text) {
        let content = &text[span.start..span.end];
        if span_matches(content, marker, name) {
            out.push_str(&text[cursor..span.start]);
            out.push_str(replacement);
            cursor = span.end;
            occurrences += 1;
        }
    }
    out.push_str(&text[cursor..]);

    if occurrences == 0 {
        (out, FixOutcome::NotFound)
    } else {
        (out, FixOutcome::Replaced { occurrences })
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;

    fn test_config(vtk: bool) -> Config {
        let toml_str = format!(
            r#"
            version = "1.7.2"

            [options]
            qt = false
            vtk = {}

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
            "#,
            vtk
        );
        let mut config: Config = toml::from_str(&toml_str).unwrap();
        if vtk {
            let dep: crate::config::Dependency =
                toml::from_str("root = \"/roots/vtk\"\nversion = \"8.2.0\"").unwrap();
            config.dependencies.insert("vtk".to_string(), dep);
        }
        config
    }

    #[test]
    fn table_order_is_fixed() {
        let table = substitution_table(&test_config(true)).unwrap();
        let names: Vec<&str> = table.keys().map(String::as_str).collect();
        assert_eq!(names, ["eigen", "boost", "flann", "qhull", "pcl", "vtk"]);
    }

    #[test]
    fn vtk_entry_present_only_when_enabled() {
        let table = substitution_table(&test_config(false)).unwrap();
        assert!(!table.contains_key("vtk"));

        let table = substitution_table(&test_config(true)).unwrap();
        assert_eq!(table["vtk"], "${CONAN_VTK_ROOT}/lib/cmake/vtk-8.2");
    }

    #[test]
    fn placeholder_override_keeps_position() {
        let mut config = test_config(false);
        config.dependencies.get_mut("boost").unwrap().placeholder =
            Some("${CONAN_BOOST_ROOT}".to_string());
        let table = substitution_table(&config).unwrap();

        assert_eq!(table["boost"], "${CONAN_BOOST_ROOT}");
        let names: Vec<&str> = table.keys().map(String::as_str).collect();
        assert_eq!(names, ["eigen", "boost", "flann", "qhull", "pcl"]);
    }

    #[test]
    fn rewrites_cache_path_literal() {
        let input = r#"set(EIGEN_INC "/home/build/.cache/conan/data/eigen/3.3.4/x/y/include")"#;
        let (out, outcome) = substitute(
            input,
            "conan",
            "eigen",
            "${CONAN_INCLUDE_DIRS_EIGEN}/eigen3",
        );

        assert_eq!(outcome, FixOutcome::Replaced { occurrences: 1 });
        assert_eq!(out, r#"set(EIGEN_INC "${CONAN_INCLUDE_DIRS_EIGEN}/eigen3")"#);
        assert!(!out.contains(".cache"));
    }

    #[test]
    fn rewrites_every_occurrence() {
        let input = concat!(
            "set(A \"/x/conan/data/flann/lib\")\n",
            "set(OTHER \"/x/untouched\")\n",
            "set(B \"/x/conan/data/flann/include\")\n",
        );
        let (out, outcome) = substitute(input, "conan", "flann", "${CONAN_INCLUDE_DIRS_FLANN}");

        assert_eq!(outcome, FixOutcome::Replaced { occurrences: 2 });
        assert_eq!(
            out,
            concat!(
                "set(A \"${CONAN_INCLUDE_DIRS_FLANN}\")\n",
                "set(OTHER \"/x/untouched\")\n",
                "set(B \"${CONAN_INCLUDE_DIRS_FLANN}\")\n",
            )
        );
    }

    #[test]
    fn absent_dependency_leaves_text_alone() {
        let input = "set(A \"/x/conan/data/boost/lib\")\n";
        let (out, outcome) = substitute(input, "conan", "vtk", "${CONAN_VTK_ROOT}");

        assert_eq!(outcome, FixOutcome::NotFound);
        assert_eq!(out, input);
    }

    #[test]
    fn name_must_follow_marker() {
        // eigen appears before the marker within the literal, not after
        let input = "set(A \"/eigen-mirror/pool/conan/data/other\")\n";
        let (_, outcome) = substitute(input, "conan", "eigen", "X");
        assert_eq!(outcome, FixOutcome::NotFound);
    }

    #[test]
    fn marker_outside_quotes_does_not_match() {
        let input = "# conan eigen paths follow\nset(A \"/plain/path\")\n";
        let (out, outcome) = substitute(input, "conan", "eigen", "X");
        assert_eq!(outcome, FixOutcome::NotFound);
        assert_eq!(out, input);
    }

    #[test]
    fn empty_input_is_vacuous() {
        let (out, outcome) = substitute("", "conan", "eigen", "X");
        assert_eq!(out, "");
        assert_eq!(outcome, FixOutcome::NotFound);
    }

    #[test]
    fn quotes_pair_within_a_line() {
        let text = "a \"one\" b \"two\"\n\"three\"\n\"unterminated\n";
        let spans = quoted_spans(text);
        let contents: Vec<&str> = spans.iter().map(|s| &text[s.start..s.end]).collect();
        assert_eq!(contents, ["one", "two", "three"]);
    }

    #[test]
    fn fixes_script_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("build/PCLConfig.cmake");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(
            &src,
            concat!(
                "set(PCL_INCLUDE_DIRS \"/c/.conan/data/pcl/1.7.2/pkg/include\")\n",
                "set(EIGEN_INCLUDE_DIRS \"/c/.conan/data/eigen/3.3.4/pkg/include\")\n",
                "set(BOOST_INCLUDE_DIRS \"/c/.conan/data/boost/1.66/pkg/include\")\n",
            ),
        )
        .unwrap();

        // Destination parent does not exist yet
        let dst = dir.path().join("package/share/pcl-1.7/PCLConfig.cmake");
        let outcomes = fix_find_script(&test_config(false), &src, &dst).unwrap();

        let fixed = fs::read_to_string(&dst).unwrap();
        assert!(fixed.contains("\"${CONAN_INCLUDE_DIRS_EIGEN}/eigen3\""));
        assert!(fixed.contains("\"${CONAN_INCLUDE_DIRS_BOOST}\""));
        assert!(fixed.contains("\"${CONAN_PCL_ROOT}/pcl\""));
        assert!(!fixed.contains(".conan/data"));

        let by_name = |name: &str| {
            outcomes
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, o)| *o)
                .unwrap()
        };
        assert_eq!(by_name("eigen"), FixOutcome::Replaced { occurrences: 1 });
        assert_eq!(by_name("boost"), FixOutcome::Replaced { occurrences: 1 });
        assert_eq!(by_name("pcl"), FixOutcome::Replaced { occurrences: 1 });
        assert_eq!(by_name("flann"), FixOutcome::NotFound);
        assert_eq!(by_name("qhull"), FixOutcome::NotFound);
    }

    #[test]
    fn missing_dependency_still_writes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("PCLConfig.cmake");
        let body = "set(X \"/no/markers/here\")\n";
        fs::write(&src, body).unwrap();

        let dst = dir.path().join("out/PCLConfig.cmake");
        let outcomes = fix_find_script(&test_config(false), &src, &dst).unwrap();

        assert_eq!(fs::read_to_string(&dst).unwrap(), body);
        assert!(outcomes.iter().all(|(_, o)| *o == FixOutcome::NotFound));
    }

    #[test]
    fn missing_source_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("absent.cmake");
        let dst = dir.path().join("out.cmake");
        assert!(fix_find_script(&test_config(false), &src, &dst).is_err());
    }
}

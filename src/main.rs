/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Build and package the Point Cloud Library
//!
//! This tool runs one recipe: obtain the PCL sources, configure and
//! build them with CMake against dependency roots resolved by the
//! enclosing package manager, install the result, and rewrite the
//! generated find-script so downstream consumers locate everything
//! through the package manager's own variables instead of paths into
//! its private cache.
//!
//! ## Directory layout
//!
//! This works in a recipe directory with the following layout:
//!
//! - pclpack.toml - recipe configuration and resolved dependency roots
//! - patches/ - source patches applied after fetching
//! - pcl/ - fetched source tree
//! - build/ - CMake build tree
//! - package/ - installed package tree

use std::path::PathBuf;

use anyhow::Result;
use structopt::StructOpt;

mod cmake;
mod config;
mod fixups;
mod package;
mod platform;
mod source;

#[derive(Debug, StructOpt)]
pub struct Args {
    /// Enable debug output
    #[structopt(long, short = "D")]
    debug: bool,
    /// Path to `cmake` command
    #[structopt(long)]
    cmake_path: Option<PathBuf>,
    /// Extra cmake options
    #[structopt(long)]
    cmake_options: Vec<String>,
    /// Path to recipe dir
    #[structopt(long, default_value = ".")]
    recipe_dir: PathBuf,
    #[structopt(subcommand)]
    subcommand: SubCommand,
}

#[derive(Debug, StructOpt)]
enum SubCommand {
    /// Obtain and patch the PCL source tree
    Fetch {
        /// Don't apply source patches after unpacking
        #[structopt(long)]
        no_patch: bool,
    },
    /// Assemble CMake definitions and run the configure step
    Configure {
        /// Emit the assembled definitions to stdout, without running CMake
        #[structopt(long)]
        stdout: bool,
    },
    /// Configure and compile
    Build {},
    /// Install, fix the find-script, emit the package manifest
    Package {},
    /// Run the whole recipe: fetch, build, package
    Run {},
}

/// Computed paths
#[derive(Debug)]
pub struct Paths {
    recipe_dir: PathBuf,
    source_dir: PathBuf,
    build_dir: PathBuf,
    package_dir: PathBuf,
}

fn try_main(args: &Args) -> Result<()> {
    let recipe_dir = args.recipe_dir.canonicalize()?;
    let config = config::read_config(&recipe_dir)?;

    let paths = Paths {
        source_dir: recipe_dir.join("pcl"),
        build_dir: recipe_dir.join("build"),
        package_dir: recipe_dir.join("package"),
        recipe_dir,
    };

    log::debug!("Args = {:#?}, paths {:#?}", args, paths);

    match &args.subcommand {
        SubCommand::Fetch { no_patch } => {
            if let source::Fetched::Acquired(strategy) =
                source::fetch(&config, &paths, *no_patch)?
            {
                log::info!("Source obtained via {}", strategy);
            }
        }

        SubCommand::Configure { stdout } => {
            let definitions = cmake::assemble_definitions(&config, &paths)?;
            if *stdout {
                print!("{}", definitions);
            } else {
                cmake::configure(&config, args, &paths, &definitions)?;
            }
        }

        SubCommand::Build {} => build(&config, args, &paths)?,

        SubCommand::Package {} => package::package(&config, args, &paths)?,

        SubCommand::Run {} => {
            if let source::Fetched::Acquired(strategy) = source::fetch(&config, &paths, false)? {
                log::info!("Source obtained via {}", strategy);
            }
            build(&config, args, &paths)?;
            package::package(&config, args, &paths)?;
        }
    }

    Ok(())
}

fn build(config: &config::Config, args: &Args, paths: &Paths) -> Result<()> {
    let definitions = cmake::assemble_definitions(config, paths)?;
    cmake::configure(config, args, paths, &definitions)?;
    cmake::build(config, args, paths)
}

fn main() {
    let args = Args::from_args();

    let default_filter = if args.debug { "debug" } else { "warn" };
    env_logger::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();

    if let Err(err) = try_main(&args) {
        log::error!("{:?}", err);
        std::process::exit(1);
    }
}

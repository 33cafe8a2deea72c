use std::path::PathBuf;

use clap::{Args, ValueEnum};

use crate::backend::pre_compilation::StopAstConversion;

pub const CONTAINER_FILE: &str = "classes.dex";
pub const MAP_FILE: &str = "classes.map.json";

/// How the bodies of the previous build are used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CacheMode {
    /// Nothing is loaded
    Disabled,
    /// Lookups and fixups run and are counted, every method is still compiled
    Advisory,
    /// Hits replace compilation
    #[default]
    Enabled,
}

#[derive(Args, Debug, Clone)]
pub struct BuildOptions {
    /// Compilation unit files, one per source input
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Directory receiving the container and its identity map
    #[arg(short, long, value_name = "DIR", default_value = "out")]
    pub output: PathBuf,

    /// Directory holding the container and map of a previous build
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = CacheMode::Enabled)]
    pub cache_mode: CacheMode,

    /// Worker threads, 0 uses the available parallelism
    #[arg(short, long, default_value_t = 0)]
    pub jobs: usize,

    /// Stop the tree pipeline after a stage and write the trees instead of a container
    #[arg(long, value_enum, default_value_t = StopAstConversion::None)]
    pub stop_at: StopAstConversion,

    /// Emit line tables
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub debug_info: bool,

    /// Package recorded in the identity map
    #[arg(long, default_value = "app")]
    pub package: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            inputs: Vec::new(),
            output: PathBuf::from("out"),
            cache_dir: None,
            cache_mode: CacheMode::Enabled,
            jobs: 0,
            stop_at: StopAstConversion::None,
            debug_info: true,
            package: "app".to_string(),
        }
    }
}

impl BuildOptions {
    pub fn worker_count(&self) -> usize {
        if self.jobs > 0 {
            self.jobs
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    }
}

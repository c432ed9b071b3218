use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "patchtrack.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Rate two patches against each other and print the result
    Rate {
        /// Patch id (unique prefix is enough)
        id_a: String,
        /// Patch id (unique prefix is enough)
        id_b: String,
    },

    /// Cluster two stack snapshots and report matched and unmatched patches
    Compare {
        /// Name of the first configured stack
        stack_a: String,
        /// Name of the second configured stack
        stack_b: String,
    },

    /// Diff two previously persisted partitions
    CompareClusters {
        /// Older cluster state file
        file_a: PathBuf,
        /// Newer cluster state file
        file_b: PathBuf,
    },

    /// Incrementally update the partition from the configured stacks
    Analyse,

    /// Re-run the optimisation pass on the class containing a patch
    OptimiseCluster {
        /// Patch id (unique prefix is enough)
        id: String,
    },

    /// Force a full rebuild of derived cluster state
    Ripup {
        /// Also clear the comparison cache (corpus integrity repair)
        #[arg(long)]
        cold: bool,
    },

    /// Resolve classes against upstream and print the integration timeline
    UpstreamHistory,

    /// Print per-class time from first authoring to upstream integration
    UpstreamDuration,
}

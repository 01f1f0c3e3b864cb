use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flat_fs::DEFAULT_INODES;

#[derive(Parser)]
#[command(version, about = "Build and inspect flat-fs images")]
pub struct Cli {
    /// Image file holding the volume
    #[arg(long, short)]
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create (or overwrite) the image and format it
    Mkfs {
        /// Image size in 512-byte blocks
        #[arg(long, default_value_t = 8192)]
        blocks: u32,

        /// Directory capacity, the root included
        #[arg(long, default_value_t = DEFAULT_INODES)]
        inodes: u32,
    },
    /// Copy every regular file of a host directory into the image
    Pack {
        #[arg(long, short)]
        source: PathBuf,
    },
    /// Copy one host file into the image
    Put {
        host: PathBuf,

        /// Name inside the image, the host file name by default
        #[arg(long, short)]
        name: Option<String>,
    },
    /// Print a file to stdout
    Cat { name: String },
    /// Delete a file
    Rm { name: String },
    /// List the directory
    Ls,
    /// Show the metadata of a file
    Stat { name: String },
}

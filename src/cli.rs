use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use series_cli::records::ExportFormat;

#[derive(Parser)]
#[command(name = "series-cli")]
#[command(about = "Fetch, validate, and version time series from remote JSON sources")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding `config/settings.json` and `config/sources/`
    #[arg(short, long, default_value = ".")]
    pub root: PathBuf,

    /// Override the data directory from settings
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered sources
    Sources,

    /// Run a fetch cycle for the given sources
    Fetch {
        names: Vec<String>,

        /// Fetch every registered source
        #[arg(long, conflicts_with = "names")]
        all: bool,
    },

    /// Show stored state of every source
    Status,

    /// List stored versions of a source, newest first
    Backups { name: String },

    /// Make a stored version current again
    Restore { name: String, version: String },

    /// Write the current dataset of a source to a file
    Export {
        name: String,
        path: PathBuf,

        #[arg(short, long, value_enum, default_value_t = FormatArg::Csv)]
        format: FormatArg,
    },

    /// Summarize on-disk storage
    Stats,

    /// Stay running: trigger sources typed on stdin, print state changes,
    /// and reload source definitions when files under `config/sources` change
    Watch,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for ExportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Csv => ExportFormat::Csv,
            FormatArg::Json => ExportFormat::Json,
        }
    }
}

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use conform_catalog::CatalogFormat;

#[derive(Parser, Debug)]
#[clap(name = "conform", version)]
pub struct Opt {
    /// Path of the catalog to apply, `-` reads it from stdin
    pub catalog: PathBuf,

    /// Encoding of the catalog file
    #[clap(long = "format", value_enum, default_value_t = FormatOpt::Bin)]
    pub format: FormatOpt,

    /// Number of resources applied in parallel, 0 means one per CPU core
    #[clap(short = 'j', long = "jobs", default_value_t = 1)]
    pub jobs: usize,

    /// Shell interpreter used for script-form exec resources
    #[clap(long = "shell", default_value = "/bin/bash")]
    pub shell: PathBuf,

    /// Observe the host but do not mutate it
    #[clap(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Log one line per host mutation
    #[clap(long = "trace-mutations")]
    pub trace_mutations: bool,

    #[clap(flatten)]
    pub logger: LoggerOpt,
}

/// Encoding of the catalog file.
#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum FormatOpt {
    /// The binary wire format.
    Bin,
    /// The JSON debugging format.
    Json,
}

impl From<FormatOpt> for CatalogFormat {
    fn from(format: FormatOpt) -> CatalogFormat {
        match format {
            FormatOpt::Bin => CatalogFormat::Bincode,
            FormatOpt::Json => CatalogFormat::Json,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct LoggerOpt {
    /// Verbose mode (-v, -vv, -vvv, etc.)
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl LoggerOpt {
    /// Setup the logger with the specified verbosity.
    pub fn setup_logger(&self) {
        if std::env::var_os("RUST_LOG").is_none() {
            match self.verbose {
                0 => std::env::set_var("RUST_LOG", "warn"),
                1 => std::env::set_var("RUST_LOG", "info"),
                2 => std::env::set_var("RUST_LOG", "debug"),
                _ => std::env::set_var("RUST_LOG", "trace"),
            }
        }

        env_logger::Builder::from_default_env()
            .format_timestamp_nanos()
            .init();
        better_panic::install();
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Opt::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let opt = Opt::parse_from(["conform", "catalog.bin"]);
        assert_eq!(opt.jobs, 1);
        assert_eq!(opt.shell, PathBuf::from("/bin/bash"));
        assert!(!opt.dry_run);
    }
}

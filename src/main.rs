//! Command line front end of the applier.
//!
//! Loads a catalog, picks the system backend and runs the apply, mapping the
//! outcome onto the exit status: `0` on success, `1` on any applier error
//! (clap itself exits with `2` on a usage error).

use std::sync::Arc;

use anyhow::{Context, Error};
use clap::Parser;
use log::{info, warn};

use conform_apply::{apply, ApplyOptions, ApplyReport};
use conform_catalog::Catalog;
use conform_sys::{CancelToken, LocalSystem, LoggedSystem, SimulatedSystem, System};

use crate::error::NiceError;
use crate::opt::Opt;

mod error;
mod opt;

fn main() {
    let opt = Opt::parse();
    opt.logger.setup_logger();

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            warn!("Interrupted, waiting for the resources in flight");
            cancel.cancel();
        }) {
            warn!("Cannot bind control-C handler: {:?}", e);
        }
    }

    let catalog = load_catalog(&opt).nice_unwrap();
    let report = run(&opt, &catalog, cancel).map_err(Error::from).nice_unwrap();
    info!(
        "{} resources applied: {} changed, {} unchanged",
        report.total(),
        report.changed,
        report.unchanged
    );
}

/// Read and decode the catalog, from a file or from stdin.
fn load_catalog(opt: &Opt) -> Result<Catalog, Error> {
    let format = opt.format.into();
    if opt.catalog.as_os_str() == "-" {
        let stdin = std::io::stdin();
        Catalog::from_reader(stdin.lock(), format).context("Cannot decode the catalog from stdin")
    } else {
        let content = std::fs::read(&opt.catalog)
            .with_context(|| format!("Cannot read {}", opt.catalog.display()))?;
        Catalog::from_reader(&content[..], format)
            .with_context(|| format!("Cannot decode {}", opt.catalog.display()))
    }
}

/// Build the system backend the options ask for and run the apply.
fn run(opt: &Opt, catalog: &Catalog, cancel: CancelToken) -> Result<ApplyReport, conform_apply::ApplyError> {
    let system: Arc<dyn System> = match (opt.dry_run, opt.trace_mutations) {
        (true, true) => Arc::new(LoggedSystem::new(SimulatedSystem::new(cancel.clone()))),
        (true, false) => Arc::new(SimulatedSystem::new(cancel.clone())),
        (false, true) => Arc::new(LoggedSystem::new(LocalSystem::new(cancel.clone()))),
        (false, false) => Arc::new(LocalSystem::new(cancel.clone())),
    };
    let options = ApplyOptions {
        jobs: if opt.jobs == 0 {
            num_cpus::get()
        } else {
            opt.jobs
        },
        shell: opt.shell.clone(),
    };
    apply(catalog, system, &options, cancel)
}

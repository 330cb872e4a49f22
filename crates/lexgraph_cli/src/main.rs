//! Command-line front end for single-file lexgraph stores.
//!
//! # Responsibility
//! - Export a store as one canonical document.
//! - Migrate a store into a new single-file store.
//! - Canonicalize a repository document without opening a store.

use lexgraph_core::{
    canonicalize_document, init_logging, BackendDescriptor, EngineConfig, MetaCatalog, Session,
};
use log::error;
use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

const USAGE: &str = "usage: lexgraph [--config <file.json>] [--log-dir <abs-dir>] <command>
commands:
  version
  export <store> <out.xml>
  migrate <source-store> <target-store>
  canonicalize <in.xml> <out.xml>";

struct Options {
    config: EngineConfig,
    command: Vec<String>,
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_options(args).and_then(run) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_failed module=cli status=error error={}", err);
            eprintln!("lexgraph: {err}");
            ExitCode::FAILURE
        }
    }
}

fn parse_options(args: Vec<String>) -> Result<Options, Box<dyn Error>> {
    let mut config = EngineConfig::default();
    let mut command = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or("--config needs a file")?;
                config = EngineConfig::from_json_str(&std::fs::read_to_string(path)?)?;
            }
            "--log-dir" => {
                let dir = iter.next().ok_or("--log-dir needs a directory")?;
                init_logging(lexgraph_core::default_log_level(), &dir)?;
            }
            _ => command.push(arg),
        }
    }
    Ok(Options { config, command })
}

fn run(options: Options) -> Result<(), Box<dyn Error>> {
    let command: Vec<&str> = options.command.iter().map(String::as_str).collect();
    match command.as_slice() {
        ["version"] => {
            println!("lexgraph_core version={}", lexgraph_core::core_version());
            Ok(())
        }
        ["export", store, out] => {
            let session = Session::open(&single_file(store), options.config)?;
            session.export_document(BufWriter::new(File::create(out)?))?;
            println!("exported {} objects to {out}", session.object_count());
            Ok(())
        }
        ["migrate", source, target] => {
            let migrated = lexgraph_core::migrate(
                &single_file(source),
                &single_file(target),
                &options.config,
            )?;
            println!("migrated {} objects to {target}", migrated.object_count());
            Ok(())
        }
        ["canonicalize", input, out] => {
            let xml = std::fs::read_to_string(input)?;
            let canonical =
                canonicalize_document(&MetaCatalog::builtin(), &xml, options.config.sorter())?;
            std::fs::write(out, canonical)?;
            Ok(())
        }
        _ => Err(USAGE.into()),
    }
}

fn single_file(path: &str) -> BackendDescriptor {
    BackendDescriptor::SingleFile {
        path: PathBuf::from(path),
    }
}

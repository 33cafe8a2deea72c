use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use droid_shared::dexfile::reader;
use droidc::backend::build;
use droidc::config::BuildOptions;
use droidc::error::{report_failures, BuildError};

#[derive(Parser, Debug)]
#[command(name = "droidc", about = "Ahead-of-time compiler producing a DEX container and its identity map")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile inputs into a container
    Build(BuildOptions),
    /// Print the classes and method bodies of a container
    Dump { container: PathBuf },
}

fn dump(path: &Path) -> Result<(), BuildError> {
    let bytes = std::fs::read(path)?;
    let unreadable = |e: droid_shared::ReadError| BuildError::Input {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let ids = reader::read_ids_only(&bytes).map_err(unreadable)?;
    println!(
        "pools: {} strings, {} types, {} prototypes, {} fields, {} methods",
        ids.strings.len(),
        ids.types.len(),
        ids.protos.len(),
        ids.fields.len(),
        ids.methods.len()
    );
    for (index, string) in ids.strings.iter().enumerate() {
        println!("  string {}: {:?}", index, string);
    }
    let dex = reader::read(&bytes).map_err(unreadable)?;
    for class in &dex.classes {
        let superclass = class.superclass.as_ref().map(|c| c.descriptor()).unwrap_or("-");
        println!("class {} extends {} {:?}", class.class, superclass, class.access);
        for interface in &class.interfaces {
            println!("  implements {}", interface);
        }
        for field in &class.fields {
            match &field.value {
                Some(value) => println!("  field {} {:?} = {:?}", field.reference, field.access, value),
                None => println!("  field {} {:?}", field.reference, field.access),
            }
        }
        for method in &class.methods {
            println!("  method {} {:?}", method.reference, method.access);
            let Some(body) = &method.body else {
                continue;
            };
            println!(
                "    registers {} ins {} outs {}",
                body.registers_size, body.ins_size, body.outs_size
            );
            let mut body = body.clone();
            let offsets = body.offsets();
            for (offset, instruction) in offsets.iter().zip(body.instructions()) {
                println!("    {:04x}: {}", offset, instruction);
            }
            for handler in &body.exception_handlers {
                let catches = handler
                    .catches
                    .iter()
                    .map(|c| format!("{} -> {}", c.exception_type, c.handler))
                    .collect::<Vec<_>>();
                println!(
                    "    try {}..{} catch [{}] all {:?}",
                    handler.range.first,
                    handler.range.last,
                    catches.join(", "),
                    handler.catch_all.map(|id| id.value())
                );
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match &cli.command {
        Command::Build(options) => build(options).map(|report| {
            log::info!("built {} classes, {} methods", report.classes, report.methods);
        }),
        Command::Dump { container } => dump(container),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(BuildError::MethodFailures(failures)) => {
            report_failures(&failures);
            log::error!("{} method(s) failed to compile", failures.len());
            ExitCode::FAILURE
        }
        Err(error) => {
            log::error!("{}", error);
            ExitCode::FAILURE
        }
    }
}

mod files;
mod matcher;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use ilfuzz::constants::CORE_LIBRARY_NAME;
use ilfuzz::error::InstrumentationError;
use ilfuzz::instrumentation::Instrumenter;
use ilfuzz::options::Options;

use crate::matcher::{Matcher, parse_prefix_list};

/// Instruments managed bytecode modules for fuzzing with afl-fuzz.
///
/// Examples:
///   ilfuzz Acme.Json.dll
///   ilfuzz System.Private.CoreLib.dll System.Number
///   ilfuzz 'Acme.*.dll' --exclude Acme.Generated
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about, arg_required_else_help = true)]
struct Cli {
    /// Module to instrument. `*` and `?` are allowed in the file name.
    path: PathBuf,

    /// Class or namespace prefixes to instrument. Everything when absent.
    /// At least one is required when instrumenting System.Private.CoreLib.
    prefixes: Vec<String>,

    /// Comma separated prefixes to instrument.
    #[clap(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Comma separated prefixes to leave alone.
    #[clap(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// File with one prefix to instrument per line.
    #[clap(long, value_parser)]
    include_file: Vec<PathBuf>,

    /// File with one prefix to leave alone per line.
    #[clap(long, value_parser)]
    exclude_file: Vec<PathBuf>,

    /// Route every probe through the trace observer.
    #[clap(long)]
    use_callback: bool,

    /// Record edges in the bitset map.
    #[clap(long)]
    alternate_mode: bool,

    /// Major version to give the instrumented modules.
    #[clap(long)]
    set_version: Option<u16>,

    /// Print the instrumented types of every module.
    #[clap(long)]
    print: bool,

    /// Refuse modules that mix native and managed code.
    #[clap(long)]
    reject_mixed_mode: bool,
}

fn read_prefixes(files: &[PathBuf], into: &mut Vec<String>) -> Result<()> {
    for file in files {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read prefix list {}", file.display()))?;
        into.extend(parse_prefix_list(&text));
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let files = files::expand(&cli.path)?;

    let mut include = cli.prefixes;
    include.extend(cli.include);
    read_prefixes(&cli.include_file, &mut include)?;
    let mut exclude = cli.exclude;
    read_prefixes(&cli.exclude_file, &mut exclude)?;

    let matcher = Matcher::new(include, exclude);
    if !matcher.has_includes() && files.iter().any(|f| files::is_core_library(f)) {
        return Err(InstrumentationError::MissingCorePrefix(CORE_LIBRARY_NAME.to_string()).into());
    }

    let mut options = Options::from_env();
    options.enable_on_branch_callback |= cli.use_callback;
    options.alternate_trace_mode |= cli.alternate_mode;
    options.print_instrumented_types |= cli.print;
    options.instrument_mixed_mode = !cli.reject_mixed_mode;
    options.new_version = cli.set_version;
    log::debug!("Effective options: {options:?}");

    let mut instrumenter = Instrumenter::new(options);
    for file in &files {
        let types = instrumenter
            .instrument_file(file, |name| matcher.matches(name))
            .with_context(|| format!("Failed to instrument {}", file.display()))?;

        if instrumenter.options().print_instrumented_types {
            println!("{}:", file.display());
            println!();
            for ty in types {
                println!("{ty}");
            }
            println!();
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    ilfuzz::logging::init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;
    use ilfuzz::bytecode::{CodeType, Instruction, MethodBody, MethodDef, Module, OpCode, TypeDef};
    use ilfuzz::constants::TRACE_ASSEMBLY_NAME;

    use super::*;

    fn write_module(path: &Path, name: &str) {
        let mut module = Module::new(name);
        for type_name in ["Parser", "Internal"] {
            let mut ty = TypeDef::new("Acme", type_name);
            ty.methods.push(MethodDef {
                name: "Run".to_string(),
                return_type: "System.Void".to_string(),
                parameters: Vec::new(),
                is_static: true,
                code_type: CodeType::Il,
                body: Some(MethodBody {
                    max_stack: 1,
                    instructions: vec![Instruction::new(OpCode::Ret)],
                    ..MethodBody::default()
                }),
            });
            module.types.push(ty);
        }
        std::fs::write(path, module.to_bytes().unwrap()).unwrap();
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ilfuzz").chain(args.iter().copied())).unwrap()
    }

    fn body_len(module: &Module, ty: &str) -> usize {
        module.find_type(ty).unwrap().methods[0]
            .body
            .as_ref()
            .unwrap()
            .instructions
            .len()
    }

    #[test]
    fn instruments_every_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("Acme.One.dll");
        let second = dir.path().join("Acme.Two.dll");
        write_module(&first, "Acme.One");
        write_module(&second, "Acme.Two");

        let exclusions = dir.path().join("exclude.txt");
        std::fs::write(&exclusions, "Acme.Internal : generated code\n").unwrap();

        let pattern = dir.path().join("Acme.*.dll");
        run(cli(&[
            pattern.to_str().unwrap(),
            "--exclude-file",
            exclusions.to_str().unwrap(),
            "--set-version",
            "4",
        ]))
        .unwrap();

        for path in [&first, &second] {
            let module = Module::load(path).unwrap();
            assert!(module.references_assembly(TRACE_ASSEMBLY_NAME));
            assert_eq!(module.version.major, 4);
            assert!(body_len(&module, "Acme.Parser") > 1);
            assert_eq!(body_len(&module, "Acme.Internal"), 1);
        }
    }

    #[test]
    fn core_library_needs_a_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("System.Private.CoreLib.dll");
        write_module(&path, CORE_LIBRARY_NAME);
        let before = std::fs::read(&path).unwrap();

        let err = run(cli(&[path.to_str().unwrap()])).unwrap_err();
        assert_matches!(
            err.downcast_ref::<InstrumentationError>(),
            Some(InstrumentationError::MissingCorePrefix(_))
        );
        assert_eq!(std::fs::read(&path).unwrap(), before);

        run(cli(&[path.to_str().unwrap(), "Acme.Parser"])).unwrap();
        let module = Module::load(&path).unwrap();
        assert!(module.find_type("IlFuzz.Common.Trace").is_some());
        assert!(body_len(&module, "Acme.Parser") > 1);
        assert_eq!(body_len(&module, "Acme.Internal"), 1);
    }

    #[test]
    fn second_run_reports_already_instrumented() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Acme.dll");
        write_module(&path, "Acme");

        run(cli(&[path.to_str().unwrap(), "--include", "Acme.Parser,Acme.Internal"])).unwrap();
        let err = run(cli(&[path.to_str().unwrap()])).unwrap_err();
        assert!(format!("{err:#}").contains("already instrumented"));
    }
}

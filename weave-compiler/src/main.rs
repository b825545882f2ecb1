//! weave compiler CLI
//!
//! Command-line interface for the weave compiler.
//!
//! # Commands
//!
//! - `check <file>`: Parse and analyze only, report diagnostics
//! - `dump-generated-code <file>`: Compile and print the generated listing
//! - `stats <file>`: Count models, agents, flows and handlers
//! - `parse <file>`: Parse only, output the AST as JSON
//!
//! # Exit codes
//!
//! `check` exits 0 when the file is valid, 1 on validation errors and 2 when
//! the file cannot be read. The other commands exit 0 or 2.
//!
//! # Examples
//!
//! ```bash
//! weave check review.wv
//! weave dump-generated-code review.wv --strip-comments
//! weave stats review.wv --json
//! ```

use clap::{Parser as ClapParser, Subcommand};
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use weave_compiler::{file_stats, parse_unit, Compiler, CompilerConfig, Diagnostic};

#[derive(ClapParser)]
#[command(name = "weave")]
#[command(author, version, about = "weave workflow language compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and analyze a workflow (no output on success)
    Check {
        /// Input workflow file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Print diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compile a workflow and print the generated code
    DumpGeneratedCode {
        /// Input workflow file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Leave out `# file:line` source comments
        #[arg(long)]
        strip_comments: bool,

        /// Output file (default: stdout)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,
    },

    /// Count definitions in a workflow file
    Stats {
        /// Input workflow file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Print counts as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse a workflow and output the AST as JSON
    Parse {
        /// Input workflow file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Pretty-print the AST JSON
        #[arg(short, long)]
        pretty: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Check { input, json } => cmd_check(&input, json),
        Commands::DumpGeneratedCode {
            input,
            strip_comments,
            output,
        } => cmd_dump(&input, strip_comments, output.as_deref()),
        Commands::Stats { input, json } => cmd_stats(&input, json),
        Commands::Parse { input, pretty } => cmd_parse(&input, pretty),
    };

    match result {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{:?}", report);
            ExitCode::from(2)
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.display().to_string()
}

/// Print diagnostics with snippets. Imported files are re-read for their snippet.
fn report(diagnostics: &[Diagnostic], root: &str, source: &str) {
    for diagnostic in diagnostics {
        let text = if diagnostic.file == root {
            source.to_string()
        } else {
            fs::read_to_string(&diagnostic.file).unwrap_or_default()
        };
        eprintln!("{}", diagnostic.render(&text));
    }
}

fn cmd_check(input: &Path, json: bool) -> Result<ExitCode> {
    let source = read_source(input)?;
    let name = file_name(input);
    let compiler = Compiler::new(CompilerConfig::from_env());
    let diagnostics = compiler.validate(&source, &name);
    let errors = diagnostics.iter().filter(|d| d.is_error()).count();

    if json {
        let out = serde_json::to_string_pretty(&diagnostics).into_diagnostic()?;
        println!("{}", out);
    } else {
        report(&diagnostics, &name, &source);
    }

    if errors > 0 {
        eprintln!("check failed: {} ({} error(s))", name, errors);
        return Ok(ExitCode::from(1));
    }
    if !json {
        let stats = file_stats(&source).map_err(|e| miette!("{}", e))?;
        eprintln!("check passed: {}", name);
        eprintln!(
            "  {} model(s), {} agent(s), {} flow(s), {} handler(s)",
            stats.models, stats.agents, stats.flows, stats.handlers
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_dump(input: &Path, strip_comments: bool, output: Option<&Path>) -> Result<ExitCode> {
    let source = read_source(input)?;
    let name = file_name(input);
    let compiler = Compiler::new(CompilerConfig::from_env());

    let unit = match compiler.compile(&source, &name) {
        Ok(unit) => unit,
        Err(err) => {
            report(&err.diagnostics(), &name, &source);
            return Err(miette!("compilation failed: {}", err));
        }
    };

    let code = unit.generated_source(!strip_comments);
    match output {
        Some(path) => {
            fs::write(path, &code)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to write {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{}", code),
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_stats(input: &Path, json: bool) -> Result<ExitCode> {
    let source = read_source(input)?;
    let stats = file_stats(&source).map_err(|err| {
        report(&err.diagnostics(), "<stats>", &source);
        miette!("{}", err)
    })?;

    if json {
        println!("{}", serde_json::to_string(&stats).into_diagnostic()?);
    } else {
        println!("models: {}", stats.models);
        println!("agents: {}", stats.agents);
        println!("flows: {}", stats.flows);
        println!("handlers: {}", stats.handlers);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_parse(input: &Path, pretty: bool) -> Result<ExitCode> {
    let source = read_source(input)?;
    let name = file_name(input);
    let unit = parse_unit(&source, &name).map_err(|err| {
        report(&err.diagnostics(), &name, &source);
        miette!("{}", err)
    })?;

    let json = if pretty {
        serde_json::to_string_pretty(&unit)
    } else {
        serde_json::to_string(&unit)
    };
    println!("{}", json.into_diagnostic()?);
    Ok(ExitCode::SUCCESS)
}

use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use yaspl::bytecode::compile::compile;
use yaspl::bytecode::compile_error::CompileError;
use yaspl::bytecode::disasm::print_bytecode;
use yaspl::bytecode::image::{self, ImageError};
use yaspl::frontend::lexer::{Lexer, LexerError};
use yaspl::frontend::token_dumper::TokenDumper;
use yaspl::lang::object::ObjRef;
use yaspl::runtime::vm::vm_execute_with;
use yaspl::runtime::{Collector, GcConfig, VmConfig};

const SOURCE_EXTENSION: &str = "yaspl";

#[derive(Parser)]
#[command(name = "yaspl")]
#[command(about = "Run yaspl programs and bytecode images", long_about = None)]
struct Cli {
    /// Source file (.yaspl) or bytecode image (.ybc)
    file: PathBuf,

    /// Print the token stream and exit
    #[arg(long)]
    tokens: bool,

    /// Disable ANSI colors in the token dump
    #[arg(long, requires = "tokens")]
    no_color: bool,

    /// Friendlier token rendering
    #[arg(long, requires = "tokens")]
    pretty: bool,

    /// Print the disassembly before running
    #[arg(long)]
    bc: bool,

    /// Write a bytecode image to OUT instead of running
    #[arg(long, value_name = "OUT")]
    emit: Option<PathBuf>,

    /// Trace every executed instruction (to stderr)
    #[arg(long)]
    trace: bool,

    /// Collect garbage before every allocation
    #[arg(long)]
    stress_gc: bool,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("expected a .{} or .{} file, got '{}'", SOURCE_EXTENSION, image::EXTENSION, path.display())]
    Extension { path: PathBuf },

    #[error("--tokens needs a source file, got an image")]
    TokensFromImage,

    #[error("lexer error: {0}")]
    Lex(#[from] LexerError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    /// Already reported by the VM.
    #[error("execution failed")]
    Runtime,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.trace);

    match run(&cli) {
        Ok(()) => {}
        Err(CliError::Runtime) => process::exit(1),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

/// `RUST_LOG` wins; otherwise warnings only, or VM tracing with `--trace`.
fn init_tracing(trace: bool) {
    let fallback = if trace { "warn,yaspl::vm=trace" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let mut heap = Collector::with_config(GcConfig {
        stress: cli.stress_gc,
        ..GcConfig::default()
    });

    let function = match extension(&cli.file) {
        Some(SOURCE_EXTENSION) => {
            let source = fs::read_to_string(&cli.file).map_err(|source| CliError::Read {
                path: cli.file.clone(),
                source,
            })?;
            if cli.tokens {
                dump_tokens(&source, cli.no_color, cli.pretty)?;
                return Ok(());
            }
            compile(&source, &mut heap)?
        }
        Some(image::EXTENSION) => {
            if cli.tokens {
                return Err(CliError::TokensFromImage);
            }
            let bytes = fs::read(&cli.file).map_err(|source| CliError::Read {
                path: cli.file.clone(),
                source,
            })?;
            image::read_image(&mut heap, &bytes)?
        }
        _ => {
            return Err(CliError::Extension {
                path: cli.file.clone(),
            });
        }
    };

    if cli.bc {
        print_bytecode(&heap, function);
    }

    if let Some(out) = &cli.emit {
        return emit_image(&heap, function, out);
    }

    let config = VmConfig {
        trace_execution: cli.trace,
        ..VmConfig::default()
    };
    let result = vm_execute_with(&mut heap, function, config);

    let stats = heap.stats();
    tracing::debug!(
        collections = stats.collections,
        allocated = stats.objects_allocated,
        freed = stats.objects_freed,
        bytes = stats.bytes_allocated,
        "gc totals"
    );

    result.map(|_| ()).map_err(|_| CliError::Runtime)
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

fn dump_tokens(source: &str, no_color: bool, pretty: bool) -> Result<(), CliError> {
    let tokens = Lexer::new(source).tokenize()?;

    let mut dumper = TokenDumper::new();
    if no_color {
        dumper = dumper.no_color();
    }
    if pretty {
        dumper = dumper.pretty();
    }
    dumper.dump(&tokens);
    Ok(())
}

fn emit_image(heap: &Collector, function: ObjRef, out: &Path) -> Result<(), CliError> {
    let bytes = image::write_image(heap, function)?;
    fs::write(out, &bytes).map_err(|source| CliError::Write {
        path: out.to_path_buf(),
        source,
    })?;
    println!("wrote {} ({} bytes)", out.display(), bytes.len());
    Ok(())
}

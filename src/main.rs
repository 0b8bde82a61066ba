//! flapc command-line driver: `flapc <source>.flap [-o <output>]`
//!
//! Exit codes: 0 success, 1 user error, 2 internal error.

use anyhow::Context;
use flapc::{Arch, CompileOptions, Compiler};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

struct Args {
    source: PathBuf,
    output: Option<PathBuf>,
    arch: Option<Arch>,
    ffi_manifest: Option<PathBuf>,
}

fn usage() -> ! {
    eprintln!(
        "usage: flapc <source>.flap [-o <output>] [--arch x86_64|arm64|riscv64] [--ffi-manifest <file>]"
    );
    std::process::exit(1);
}

fn parse_args() -> Args {
    let mut source = None;
    let mut output = None;
    let mut arch = None;
    let mut ffi_manifest = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-o" => {
                let Some(v) = it.next() else { usage() };
                output = Some(PathBuf::from(v));
            }
            "--arch" => {
                let Some(v) = it.next() else { usage() };
                let Some(a) = Arch::parse(&v) else {
                    eprintln!("flapc: unknown architecture `{v}`");
                    std::process::exit(1);
                };
                arch = Some(a);
            }
            "--ffi-manifest" => {
                let Some(v) = it.next() else { usage() };
                ffi_manifest = Some(PathBuf::from(v));
            }
            "--version" => {
                println!("flapc {}", flapc::VERSION);
                std::process::exit(0);
            }
            _ if arg.starts_with('-') => usage(),
            _ => {
                if source.is_some() {
                    usage();
                }
                source = Some(PathBuf::from(arg));
            }
        }
    }

    let Some(source) = source else { usage() };
    Args {
        source,
        output,
        arch,
        ffi_manifest,
    }
}

/// Default output name: the source stem next to the source file
fn default_output(source: &Path) -> PathBuf {
    let stem = source.file_stem().unwrap_or_default();
    source.with_file_name(stem)
}

fn run(args: Args) -> anyhow::Result<i32> {
    let source_text = match std::fs::read_to_string(&args.source) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("flapc: cannot read {}: {e}", args.source.display());
            return Ok(1);
        }
    };

    let ffi_manifest = match &args.ffi_manifest {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading FFI manifest {}", path.display()))?,
        ),
        None => None,
    };

    let options = CompileOptions {
        arch: args.arch.unwrap_or_else(Arch::host),
        ffi_manifest,
        ..CompileOptions::default()
    };

    let file_name = args.source.display().to_string();
    let result = match Compiler::new(options).compile_source(&file_name, &source_text) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("flapc: {e}");
            return Ok(e.exit_code());
        }
    };

    let output = args.output.unwrap_or_else(|| default_output(&args.source));
    std::fs::write(&output, &result.image)
        .with_context(|| format!("writing {}", output.display()))?;
    let mut perms = std::fs::metadata(&output)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&output, perms)?;

    Ok(0)
}

fn main() -> ExitCode {
    let args = parse_args();
    match run(args) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("flapc: internal error: {e:#}");
            ExitCode::from(2)
        }
    }
}

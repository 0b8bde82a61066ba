//! # flapc: a whole-program native compiler for Flap
//!
//! Flap is a small systems language; this crate compiles it straight to
//! ELF64 executables for Linux. There is no intermediate representation,
//! no bytecode, and no external assembler or linker: the AST drives
//! per-architecture instruction encoders writing into in-memory section
//! buffers, a linear-scan allocator assigns registers over a uniform
//! live-interval model, and the image assembler lays out segments,
//! builds the PLT/GOT/dynamic tables, and patches every relocation site
//! before serializing the file.
//!
//! ## Quick start
//!
//! ```ignore
//! use flapc::{Compiler, CompileOptions};
//!
//! let source = r#"main = () => println("hi")"#;
//! let result = Compiler::new(CompileOptions::default())
//!     .compile_source("hello.flap", source)?;
//! std::fs::write("hello", &result.image)?;
//! ```
//!
//! ## Pipeline
//!
//! ```text
//! Source → Scanner → Parser → AST → interval prepass → CodeGen → ElfImage
//! ```
//!
//! ### Main components
//!
//! - [`lexer::Scanner`]: tokenizes Flap source with line/column tracking
//! - [`parser::Parser`]: recursive descent to the AST
//! - [`compiler::regalloc`]: live intervals + linear scan, spill frames
//! - [`compiler::x86_64`]: the production instruction encoder
//!   ([`compiler::arm64`] is experimental, [`compiler::riscv64`] a stub)
//! - [`compiler::runtime`]: channels, arenas, atomics, and the
//!   parallel-loop fan-out, emitted inline as machine code
//! - [`compiler::elf`]: segment layout, dynamic tables, relocation
//!   patching, serialization
//!
//! ## Runtime value model
//!
//! Every Flap value is 64 bits: numbers are IEEE-754 doubles; strings,
//! lists, maps, and channels are pointers to tagged heap objects; runtime
//! errors are a reserved quiet-NaN pattern carrying a four-character
//! code, consumed by `or!` and `.error`. Generated programs talk to the
//! kernel directly (`write`, `mmap`, `clone`, `futex`) and only
//! link libc when the source imports it.

/// Version of the flapc compiler
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod parser;

pub use compiler::{
    Arch, CompileOptions, CompileResult, Compiler, ElfImage, KnownLibcProvider, ManifestProvider,
    Prototype, SymbolProvider,
};
pub use error::{Error, ErrorClass, Result};
pub use lexer::{Scanner, SrcPos, Token, TokenKind};
pub use parser::{parse_source, Expr, Parser, Program, Stmt};

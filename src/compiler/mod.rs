//! # Flap native compiler
//!
//! Whole-program, single-pass compilation: the AST drives direct
//! machine-code emission into in-memory section buffers, which the image
//! assembler lays out and serializes as an ELF64 executable. No
//! intermediate representation, no external assembler or linker.
//!
//! ## Architecture
//!
//! ```text
//! Flap source → Scanner → Parser → AST
//!         regalloc prepass ──► FramePlan
//!         CodeGen ──► .text/.rodata + relocation tables
//!         ElfImage ──► layout, PLT/GOT/dynamic, patch, serialize
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use flapc::compiler::{Compiler, CompileOptions};
//!
//! let compiler = Compiler::new(CompileOptions::default());
//! let result = compiler.compile_source("hello.flap", source)?;
//! std::fs::write("hello", result.image)?;
//! ```

pub mod arm64;
pub mod codegen;
pub mod elf;
pub mod ffi;
pub mod regalloc;
pub mod reloc;
pub mod riscv64;
pub mod runtime;
pub mod section;
pub mod value;
pub mod x86_64;

pub use codegen::{CodeGen, CodeObject, EmitCtx};
pub use elf::ElfImage;
pub use ffi::{CType, KnownLibcProvider, ManifestProvider, ProviderChain, Prototype, SymbolProvider};
pub use regalloc::{
    Analysis, FramePlan, IntervalBuilder, LinearScan, LiveInterval, Location, VarId,
    DEFAULT_FRAME_BUDGET,
};
pub use reloc::{
    Label, LabelTable, Reloc, RelocKind, RelocTable, RelocTarget, Symbol, SymbolId, SymbolKind,
    SymbolTable,
};
pub use section::{align_up, SealedSection, SectionBuffer, PAGE_SIZE};

use crate::error::{Error, Result};
use crate::parser::Program;

/// Compilation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// Production backend
    X86_64,
    /// Experimental backend (encoders and relocations only)
    Arm64,
    /// Stub backend
    Riscv64,
}

impl Arch {
    /// ELF `e_machine` value
    pub fn elf_machine(self) -> u16 {
        match self {
            Arch::X86_64 => 62,
            Arch::Arm64 => 183,
            Arch::Riscv64 => 243,
        }
    }

    /// Dynamic-linker path for PT_INTERP
    pub fn interp_path(self) -> &'static str {
        match self {
            Arch::X86_64 => "/lib64/ld-linux-x86-64.so.2",
            Arch::Arm64 => "/lib/ld-linux-aarch64.so.1",
            Arch::Riscv64 => "/lib/ld-linux-riscv64-lp64d.so.1",
        }
    }

    /// The architecture this compiler itself runs on
    pub fn host() -> Arch {
        if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else if cfg!(target_arch = "riscv64") {
            Arch::Riscv64
        } else {
            Arch::X86_64
        }
    }

    /// Parse a `--arch` value
    pub fn parse(s: &str) -> Option<Arch> {
        match s {
            "x86_64" | "x86-64" | "amd64" => Some(Arch::X86_64),
            "arm64" | "aarch64" => Some(Arch::Arm64),
            "riscv64" | "riscv" => Some(Arch::Riscv64),
            _ => None,
        }
    }
}

/// Compilation options
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Target architecture
    pub arch: Arch,
    /// Stack-frame budget for spill slots, in bytes
    pub frame_budget: usize,
    /// Resolve imports at load time instead of lazily
    pub eager_bind: bool,
    /// JSON manifest overriding the seeded FFI prototypes
    pub ffi_manifest: Option<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            arch: Arch::host(),
            frame_budget: DEFAULT_FRAME_BUDGET,
            eager_bind: false,
            ffi_manifest: None,
        }
    }
}

/// Compilation result with metadata
#[derive(Debug)]
pub struct CompileResult {
    /// The finished ELF image, ready to write and mark executable
    pub image: Vec<u8>,
    /// Bytes of machine code emitted
    pub text_size: usize,
    /// Bytes of constant data emitted
    pub rodata_size: usize,
    /// Number of dynamic imports
    pub import_count: usize,
    /// Libraries the image will request at load time
    pub libraries: Vec<String>,
}

/// Flap to ELF64 compiler
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    /// Create a compiler with options
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Compile source text to an ELF image
    pub fn compile_source(&self, file: &str, source: &str) -> Result<CompileResult> {
        let program = crate::parser::parse_source(file, source)?;
        self.compile_ast(&program)
    }

    /// Compile an already-parsed program
    pub fn compile_ast(&self, program: &Program) -> Result<CompileResult> {
        if self.options.arch != Arch::X86_64 {
            // encoders and relocation support exist for the other
            // targets; the full AST pipeline is x86-64 only
            return Err(Error::unsupported(format!(
                "{:?} code generation is experimental; use --arch x86_64",
                self.options.arch
            )));
        }

        let manifest = match &self.options.ffi_manifest {
            Some(json) => Some(ManifestProvider::from_json(json)?),
            None => None,
        };
        let provider = ProviderChain::new(manifest);

        tracing::debug!(file = %program.file, "compiling");
        let obj = CodeGen::new(program, &provider, self.options.frame_budget).generate()?;
        let text_size = obj.text.len();
        let rodata_size = obj.rodata.len();
        let import_count = obj.symbols.imports_in_order().len();
        let libraries = obj.libraries.clone();

        let image = ElfImage::new(self.options.arch, self.options.eager_bind).assemble(obj)?;

        Ok(CompileResult {
            image,
            text_size,
            rodata_size,
            import_count,
            libraries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_target_the_host() {
        let c = Compiler::new(CompileOptions::default());
        assert_eq!(c.options.frame_budget, DEFAULT_FRAME_BUDGET);
    }

    #[test]
    fn compile_source_produces_an_image() {
        let compiler = Compiler::new(CompileOptions {
            arch: Arch::X86_64,
            ..CompileOptions::default()
        });
        let result = compiler
            .compile_source("hello.flap", r#"main = () => println("hi")"#)
            .unwrap();
        assert_eq!(&result.image[0..4], b"\x7FELF");
        assert!(result.text_size > 0);
        assert_eq!(result.import_count, 0);
    }

    #[test]
    fn non_x86_targets_are_gated() {
        let compiler = Compiler::new(CompileOptions {
            arch: Arch::Arm64,
            ..CompileOptions::default()
        });
        let err = compiler.compile_source("t.flap", "x = 1").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn arch_parsing_and_metadata() {
        assert_eq!(Arch::parse("x86_64"), Some(Arch::X86_64));
        assert_eq!(Arch::parse("aarch64"), Some(Arch::Arm64));
        assert_eq!(Arch::parse("vax"), None);
        assert_eq!(Arch::X86_64.elf_machine(), 62);
        assert_eq!(Arch::Arm64.elf_machine(), 183);
        assert_eq!(Arch::Riscv64.elf_machine(), 243);
    }

    #[test]
    fn ffi_manifest_overrides_seeded_prototypes() {
        let compiler = Compiler::new(CompileOptions {
            arch: Arch::X86_64,
            ffi_manifest: Some(
                r#"{"my_fn": {"args": ["double"], "ret": "double"}}"#.to_string(),
            ),
            ..CompileOptions::default()
        });
        let result = compiler
            .compile_source(
                "t.flap",
                "import m \"libm.so.6\"\nmain = () => println(m.my_fn(2))",
            )
            .unwrap();
        assert_eq!(result.libraries, vec!["libm.so.6".to_string()]);
        assert_eq!(result.import_count, 1);
    }
}

//! # Code generation
//!
//! Walks the AST and emits x86-64 machine code directly into the section
//! buffers with no intermediate representation. Register homes come from the
//! linear-scan allocator; unresolved references (forward branches, rodata
//! constants, calls) go through the relocation tables; the runtime ABI
//! helpers are emitted first at known entry labels.
//!
//! ## Value conventions during evaluation
//!
//! Every expression leaves its 64-bit value in rax. rcx/rdx and xmm0/xmm1
//! are evaluation scratch; allocated variables live in rbx/r10-r15 or
//! frame slots and are never clobbered by evaluation. Nested temporaries
//! ride on the stack, and call sites re-align rsp when the pending-push
//! count is odd.

use super::ffi::{CType, Prototype, SymbolProvider};
use super::reloc::{Label, LabelTable, RelocTable, RelocTarget, SymbolId, SymbolTable};
use super::regalloc::{Analysis, IntervalBuilder, LinearScan, Location};
use super::runtime::{self, RuntimeLib};
use super::section::SectionBuffer;
use super::value::{tag, ERR_BASE, ERR_DIV0, ERR_MASK, ERR_OVFL};
use super::x86_64::{Asm, Cond, Reg, Xmm};
use crate::error::{Error, Result};
use crate::lexer::SrcPos;
use crate::parser::{
    BinaryOp, ChannelOpKind, Expr, LambdaBody, Program, Stmt, UnaryOp, WorkerCount,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Default size of an `arena {}` region (1 MiB)
const ARENA_REGION_SIZE: i64 = 0x10_0000;

/// Output sections and tables shared by the emitters
pub struct EmitCtx {
    /// Machine code
    pub text: SectionBuffer,
    /// Constants: string objects, f64 immediates, raw byte runs
    pub rodata: SectionBuffer,
    /// Deferred patches
    pub relocs: RelocTable,
    /// Branch targets and helper entry points
    pub labels: LabelTable,
    /// User functions and dynamic imports
    pub symbols: SymbolTable,
    /// Zero-initialized runtime state (heap cursor, TLS block)
    pub bss_size: u64,
    ro_cache: HashMap<Vec<u8>, u64>,
    ro_obj_cache: HashMap<String, u64>,
}

impl EmitCtx {
    /// Fresh, empty output state
    pub fn new() -> Self {
        Self {
            text: SectionBuffer::new(),
            rodata: SectionBuffer::new(),
            relocs: RelocTable::new(),
            labels: LabelTable::new(),
            symbols: SymbolTable::new(),
            bss_size: 0,
            ro_cache: HashMap::new(),
            ro_obj_cache: HashMap::new(),
        }
    }

    /// Emitter bound to `.text` and the patch tables
    pub fn asm(&mut self) -> Asm<'_> {
        Asm::new(&mut self.text, &mut self.relocs, &mut self.labels)
    }

    /// Reserve a zeroed 8-byte-aligned `.bss` range; returns its offset
    pub fn bss_slot(&mut self, size: u64) -> u64 {
        let offset = self.bss_size;
        self.bss_size += (size + 7) & !7;
        offset
    }

    /// Place raw bytes in `.rodata` (deduplicated)
    pub fn ro_bytes(&mut self, bytes: &[u8]) -> u64 {
        if let Some(&off) = self.ro_cache.get(bytes) {
            return off;
        }
        let off = self.rodata.current_offset();
        self.rodata.write_bytes(bytes);
        self.ro_cache.insert(bytes.to_vec(), off);
        off
    }

    /// Place an f64 constant in `.rodata`
    pub fn ro_f64(&mut self, v: f64) -> u64 {
        self.rodata.align_to(8);
        self.ro_bytes(&v.to_bits().to_le_bytes())
    }

    /// Place a complete string object (tag, length, bytes, NUL) in
    /// `.rodata`; string values reference these directly
    pub fn ro_str_obj(&mut self, s: &str) -> u64 {
        if let Some(&off) = self.ro_obj_cache.get(s) {
            return off;
        }
        self.rodata.align_to(8);
        let off = self.rodata.current_offset();
        self.rodata.write_u8(tag::STRING);
        for _ in 0..7 {
            self.rodata.write_u8(0);
        }
        self.rodata.write_u64(s.len() as u64);
        self.rodata.write_bytes(s.as_bytes());
        self.rodata.write_u8(0);
        self.ro_obj_cache.insert(s.to_string(), off);
        off
    }
}

impl Default for EmitCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the image assembler needs
#[derive(Debug)]
pub struct CodeObject {
    /// Machine code with placeholder relocation sites
    pub text: SectionBuffer,
    /// Read-only constants (placed in the writable segment per the
    /// runtime-mutable-literals layout)
    pub rodata: SectionBuffer,
    /// Zero-initialized runtime state size
    pub bss_size: u64,
    /// Sites to patch once layout is final
    pub relocs: RelocTable,
    /// Bound labels
    pub labels: LabelTable,
    /// Functions and imports
    pub symbols: SymbolTable,
    /// `_start` trampoline label
    pub entry: Label,
    /// Imported libraries in DT_NEEDED order
    pub libraries: Vec<String>,
}

#[derive(Clone)]
enum Cleanup<'p> {
    /// Deferred body, re-emitted on every exit edge; `mark` is the
    /// hidden-slot index its body's loops and arenas replay from
    Defer { body: &'p [Stmt], mark: u32 },
    ArenaPop { hidden: u32 },
}

/// Hidden frame slots a statement list will consume, mirroring the
/// interval prepass: one per range loop and arena, two per parallel loop
fn count_hidden_slots(body: &[Stmt]) -> u32 {
    let mut n = 0;
    for stmt in body {
        match stmt {
            Stmt::RangeLoop { body, .. } => n += 1 + count_hidden_slots(body),
            Stmt::Arena { body, .. } => n += 1 + count_hidden_slots(body),
            Stmt::ParallelLoop { .. } => n += 2,
            Stmt::Guarded { body, .. } => n += count_hidden_slots(std::slice::from_ref(body)),
            Stmt::Defer { body, .. } | Stmt::Unsafe { body, .. } => n += count_hidden_slots(body),
            _ => {}
        }
    }
    n
}

struct LoopCtx {
    brk: Label,
    cont: Label,
    cleanup_depth: usize,
}

/// Per-function emission state
struct Frame {
    plan: super::regalloc::FramePlan,
    vars: HashMap<String, super::regalloc::VarId>,
    /// Parent-frame displacements reachable through the ctx parameter
    externals: HashMap<String, i32>,
    /// Where the worker ctx pointer lives (worker bodies only)
    ctx_var: Option<super::regalloc::VarId>,
    epilogue: Label,
    next_hidden: u32,
}

enum PendingKind<'p> {
    Lambda {
        params: Vec<String>,
        body: &'p LambdaBody,
    },
    Worker {
        var: &'p str,
        body: &'p [Stmt],
        externals: HashMap<String, i32>,
        pos: SrcPos,
    },
}

struct PendingFn<'p> {
    label: Label,
    sym: SymbolId,
    kind: PendingKind<'p>,
}

/// AST-driven code generator for x86-64
pub struct CodeGen<'p> {
    program: &'p Program,
    provider: &'p dyn SymbolProvider,
    frame_budget: usize,
    ctx: EmitCtx,
    rt: Option<RuntimeLib>,
    functions: HashMap<String, &'p Expr>,
    func_labels: HashMap<String, (Label, SymbolId)>,
    import_aliases: HashMap<String, String>,
    import_protos: HashMap<String, Prototype>,
    libraries: Vec<String>,
    pending: VecDeque<PendingFn<'p>>,
    frame: Option<Frame>,
    cleanups: Vec<Cleanup<'p>>,
    loops: Vec<LoopCtx>,
    pending_pushes: u32,
    lambda_count: u32,
    worker_count: u32,
}

impl<'p> CodeGen<'p> {
    /// Create a generator for a parsed program
    pub fn new(
        program: &'p Program,
        provider: &'p dyn SymbolProvider,
        frame_budget: usize,
    ) -> Self {
        Self {
            program,
            provider,
            frame_budget,
            ctx: EmitCtx::new(),
            rt: None,
            functions: HashMap::new(),
            func_labels: HashMap::new(),
            import_aliases: HashMap::new(),
            import_protos: HashMap::new(),
            libraries: Vec::new(),
            pending: VecDeque::new(),
            frame: None,
            cleanups: Vec::new(),
            loops: Vec::new(),
            pending_pushes: 0,
            lambda_count: 0,
            worker_count: 0,
        }
    }

    /// Walk the whole program and produce the code object
    pub fn generate(mut self) -> Result<CodeObject> {
        for imp in &self.program.imports {
            self.import_aliases
                .insert(imp.alias.clone(), imp.library.clone());
            if !self.libraries.contains(&imp.library) {
                self.libraries.push(imp.library.clone());
            }
        }

        // Top-level lambda bindings are the program's functions; a
        // rebound name keeps its label and the last body wins
        for stmt in &self.program.statements {
            if let Stmt::Assign { name, value, .. } = stmt {
                if matches!(value, Expr::Lambda { .. }) {
                    if !self.func_labels.contains_key(name) {
                        let label = self.ctx.labels.fresh();
                        let sym = self.ctx.symbols.text_local(name);
                        self.func_labels.insert(name.clone(), (label, sym));
                    }
                    self.functions.insert(name.clone(), value);
                }
            }
        }

        // _start: clear the argument registers, align, enter the program
        let start_label = self.ctx.labels.fresh();
        let main_label = self.ctx.labels.fresh();
        {
            let mut a = self.ctx.asm();
            a.bind(start_label);
            a.xor_r32(Reg::Rbp, Reg::Rbp);
            a.xor_r32(Reg::Rdi, Reg::Rdi);
            a.xor_r32(Reg::Rsi, Reg::Rsi);
            a.xor_r32(Reg::Rdx, Reg::Rdx);
            a.xor_r32(Reg::Rcx, Reg::Rcx);
            a.xor_r32(Reg::R8, Reg::R8);
            a.xor_r32(Reg::R9, Reg::R9);
            a.and_ri(Reg::Rsp, -16);
            a.call_label(main_label);
            a.mov_ri(Reg::Rax, 231);
            a.xor_r32(Reg::Rdi, Reg::Rdi);
            a.syscall();
        }

        // Runtime helpers next, at known entry labels
        self.rt = Some(runtime::emit(&mut self.ctx)?);

        // The entry function: top-level statements, then user main
        let top: Vec<&'p Stmt> = self
            .program
            .statements
            .iter()
            .filter(|s| {
                !matches!(s, Stmt::Assign { value, .. } if matches!(value, Expr::Lambda { .. }))
            })
            .collect();
        self.emit_entry(main_label, &top)?;

        // User functions
        let mut names: Vec<String> = self
            .program
            .statements
            .iter()
            .filter_map(|s| match s {
                Stmt::Assign { name, value, .. } if matches!(value, Expr::Lambda { .. }) => {
                    Some(name.clone())
                }
                _ => None,
            })
            .collect();
        let mut seen = HashSet::new();
        names.retain(|n| seen.insert(n.clone()));
        for name in names {
            let expr = self.functions[&name];
            let (label, sym) = self.func_labels[&name];
            if let Expr::Lambda { params, body, .. } = expr {
                self.emit_function(label, sym, params.clone(), body, HashMap::new(), None)?;
            }
        }

        // Lifted lambdas and parallel-loop worker bodies
        while let Some(p) = self.pending.pop_front() {
            match p.kind {
                PendingKind::Lambda { params, body } => {
                    self.emit_function(p.label, p.sym, params, body, HashMap::new(), None)?;
                }
                PendingKind::Worker {
                    var,
                    body,
                    externals,
                    pos,
                } => {
                    self.emit_worker_body(p.label, p.sym, var, body, externals, pos)?;
                }
            }
        }

        let unbound = self.ctx.labels.unbound();
        if !unbound.is_empty() {
            return Err(Error::internal(format!(
                "label {:?} was never bound",
                unbound[0]
            )));
        }

        tracing::debug!(
            text = self.ctx.text.len(),
            rodata = self.ctx.rodata.len(),
            relocs = self.ctx.relocs.len(),
            imports = self.libraries.len(),
            "code generation complete"
        );

        Ok(CodeObject {
            text: self.ctx.text,
            rodata: self.ctx.rodata,
            bss_size: self.ctx.bss_size,
            relocs: self.ctx.relocs,
            labels: self.ctx.labels,
            symbols: self.ctx.symbols,
            entry: start_label,
            libraries: self.libraries,
        })
    }

    fn rt(&self) -> RuntimeLib {
        self.rt.expect("runtime emitted before codegen")
    }

    // -----------------------------------------------------------------
    // Function scaffolding
    // -----------------------------------------------------------------

    fn emit_entry(&mut self, label: Label, top: &[&'p Stmt]) -> Result<()> {
        let stmts: Vec<Stmt> = top.iter().map(|s| (*s).clone()).collect();
        let externals = HashSet::new();
        let mut analysis = IntervalBuilder::analyze(&[], &stmts, &externals);
        let plan = LinearScan {
            frame_budget: self.frame_budget,
        }
        .run(&mut analysis)?;

        let sym = self.ctx.symbols.text_local("__flap_main");
        self.begin_function(label, sym, plan, analysis, HashMap::new(), None, &[])?;

        {
            let rt = self.rt();
            let mut a = self.ctx.asm();
            a.call_label(rt.init);
        }

        for stmt in top {
            self.emit_stmt(stmt)?;
        }
        self.emit_cleanups_down_to(0, false)?;

        // a user-defined main runs after the top-level statements
        if let Some(&(main_fn, _sym)) = self.func_labels.get("main") {
            let mut a = self.ctx.asm();
            a.call_label(main_fn);
        }

        self.end_function();
        Ok(())
    }

    fn emit_function(
        &mut self,
        label: Label,
        sym: SymbolId,
        params: Vec<String>,
        body: &'p LambdaBody,
        externals: HashMap<String, i32>,
        ctx_param: Option<()>,
    ) -> Result<()> {
        let _ = ctx_param;
        let (stmts, tail): (&'p [Stmt], Option<&'p Expr>) = match body {
            LambdaBody::Expr(e) => (&[], Some(e.as_ref())),
            LambdaBody::Block(b) => (b.as_slice(), None),
        };

        let ext_names: HashSet<String> = externals.keys().cloned().collect();
        let mut analysis = match tail {
            Some(e) => {
                let wrapped = vec![Stmt::Expr(e.clone())];
                IntervalBuilder::analyze(&params, &wrapped, &ext_names)
            }
            None => IntervalBuilder::analyze(&params, stmts, &ext_names),
        };
        let plan = LinearScan {
            frame_budget: self.frame_budget,
        }
        .run(&mut analysis)?;

        self.begin_function(label, sym, plan, analysis, externals, None, &params)?;

        match tail {
            Some(e) => {
                self.eval_expr(e)?;
            }
            None => {
                for s in stmts {
                    self.emit_stmt(s)?;
                }
                // falling off the end returns 0.0
                let mut a = self.ctx.asm();
                a.mov_ri(Reg::Rax, 0);
            }
        }
        self.emit_cleanups_down_to(0, false)?;
        self.end_function();
        Ok(())
    }

    /// Worker body: `fn(start: i64, end: i64, ctx: *frame)` looping the
    /// assigned index range in ascending order
    fn emit_worker_body(
        &mut self,
        label: Label,
        sym: SymbolId,
        var: &'p str,
        body: &'p [Stmt],
        externals: HashMap<String, i32>,
        _pos: SrcPos,
    ) -> Result<()> {
        let params = vec![
            "$start".to_string(),
            "$end".to_string(),
            "$ctx".to_string(),
        ];
        // analyze as if the body sat inside a range loop over the params
        let synthetic = vec![Stmt::RangeLoop {
            var: var.to_string(),
            start: Expr::Ident {
                name: "$start".into(),
                pos: SrcPos::default(),
            },
            end: Expr::Ident {
                name: "$end".into(),
                pos: SrcPos::default(),
            },
            inclusive: false,
            body: body.to_vec(),
            pos: SrcPos::default(),
        }];
        let ext_names: HashSet<String> = externals.keys().cloned().collect();
        let mut analysis = IntervalBuilder::analyze(&params, &synthetic, &ext_names);
        // The emitted loop reloads the bound parameters every iteration,
        // and external accesses read the ctx pointer throughout; pin all
        // three to the whole function and off the caller-saved pool
        let max_end = analysis.intervals.iter().map(|iv| iv.end).max().unwrap_or(0) + 1;
        for p in &params {
            if let Some(&v) = analysis.vars.get(p) {
                analysis.intervals[v.0 as usize].end = max_end;
                analysis.intervals[v.0 as usize].crosses_call = true;
            }
        }
        let plan = LinearScan {
            frame_budget: self.frame_budget,
        }
        .run(&mut analysis)?;

        let ctx_var = analysis.vars.get("$ctx").copied();
        self.begin_function(label, sym, plan, analysis, externals, ctx_var, &params)?;

        // integer loop: for i in start..end { var = i as f64; body }
        let hidden = self.take_hidden();
        let _ = hidden; // the synthetic range loop's bound slot
        let start_loc = self.var_loc("$start");
        let end_loc = self.var_loc("$end");
        let cond = self.fresh();
        let inc = self.fresh();
        let done = self.fresh();

        {
            let mut a = self.ctx.asm();
            a.bind(cond);
        }
        self.load_loc(start_loc, Reg::Rax);
        self.load_loc(end_loc, Reg::Rcx);
        {
            let mut a = self.ctx.asm();
            a.cmp_rr(Reg::Rax, Reg::Rcx);
            a.jcc(Cond::Ge, done);
            a.cvtsi2sd(Xmm::Xmm0, Reg::Rax);
            a.movq_rx(Reg::Rax, Xmm::Xmm0);
        }
        self.store_var_checked(var, SrcPos::default())?;

        let depth = self.cleanups.len();
        self.loops.push(LoopCtx {
            brk: done,
            cont: inc,
            cleanup_depth: depth,
        });
        for s in body {
            self.emit_stmt(s)?;
        }
        self.loops.pop();
        self.emit_cleanups_down_to(depth, true)?;

        {
            let mut a = self.ctx.asm();
            a.bind(inc);
        }
        self.load_loc(start_loc, Reg::Rax);
        {
            let mut a = self.ctx.asm();
            a.add_ri(Reg::Rax, 1);
        }
        self.store_loc(start_loc, Reg::Rax);
        {
            let mut a = self.ctx.asm();
            a.jmp(cond);
            a.bind(done);
        }

        self.emit_cleanups_down_to(0, false)?;
        self.end_function();
        Ok(())
    }

    fn begin_function(
        &mut self,
        label: Label,
        sym: SymbolId,
        plan: super::regalloc::FramePlan,
        analysis: Analysis,
        externals: HashMap<String, i32>,
        ctx_var: Option<super::regalloc::VarId>,
        params: &[String],
    ) -> Result<()> {
        let epilogue = self.ctx.labels.fresh();
        let offset = self.ctx.text.current_offset();
        self.ctx.labels.bind(label, offset);
        self.ctx.symbols.resolve_local(sym, offset);

        let frame = Frame {
            plan,
            vars: analysis.vars,
            externals,
            ctx_var,
            epilogue,
            next_hidden: 0,
        };

        {
            let mut a = self.ctx.asm();
            a.push_r(Reg::Rbp);
            a.mov_rr(Reg::Rbp, Reg::Rsp);
            for &r in &frame.plan.callee_saved {
                a.push_r(r);
            }
            if frame.plan.frame_sub > 0 {
                a.sub_ri(Reg::Rsp, frame.plan.frame_sub as i32);
            }
        }

        // park incoming arguments in their allocated homes
        for (i, p) in params.iter().enumerate().take(Reg::ARGS.len()) {
            if let Some(&v) = frame.vars.get(p) {
                let loc = frame.plan.loc(v);
                let mut a = self.ctx.asm();
                match loc {
                    Location::Reg(r) => a.mov_rr(r, Reg::ARGS[i]),
                    Location::Spill(s) => {
                        let disp = frame.plan.slot_disp(s);
                        a.mov_mr(Reg::Rbp, disp, Reg::ARGS[i]);
                    }
                    Location::FpReg(x) => {
                        a.movq_xr(x, Reg::ARGS[i]);
                    }
                }
            }
        }

        self.frame = Some(frame);
        self.cleanups.clear();
        self.loops.clear();
        self.pending_pushes = 0;
        Ok(())
    }

    /// Single epilogue: every return path lands here
    fn end_function(&mut self) {
        let frame = self.frame.take().expect("inside a function");
        let mut a = self.ctx.asm();
        a.bind(frame.epilogue);
        if frame.plan.frame_sub > 0 {
            a.add_ri(Reg::Rsp, frame.plan.frame_sub as i32);
        }
        for &r in frame.plan.callee_saved.iter().rev() {
            a.pop_r(r);
        }
        a.pop_r(Reg::Rbp);
        a.ret();
    }

    fn frame(&self) -> &Frame {
        self.frame.as_ref().expect("inside a function")
    }

    fn fresh(&mut self) -> Label {
        self.ctx.labels.fresh()
    }

    fn take_hidden(&mut self) -> u32 {
        let f = self.frame.as_mut().expect("inside a function");
        let h = f.next_hidden;
        f.next_hidden += 1;
        debug_assert!(h < f.plan.hidden_slots);
        h
    }

    fn hidden_disp(&self, h: u32) -> i32 {
        self.frame().plan.hidden_disp(h)
    }

    // -----------------------------------------------------------------
    // Variable access
    // -----------------------------------------------------------------

    fn var_loc(&self, name: &str) -> Location {
        let f = self.frame();
        let v = f.vars[name];
        f.plan.loc(v)
    }

    fn load_loc(&mut self, loc: Location, dst: Reg) {
        let disp = match loc {
            Location::Reg(r) => {
                let mut a = self.ctx.asm();
                if r != dst {
                    a.mov_rr(dst, r);
                }
                return;
            }
            Location::FpReg(x) => {
                let mut a = self.ctx.asm();
                a.movq_rx(dst, x);
                return;
            }
            Location::Spill(s) => self.frame().plan.slot_disp(s),
        };
        let mut a = self.ctx.asm();
        a.mov_rm(dst, Reg::Rbp, disp);
    }

    fn store_loc(&mut self, loc: Location, src: Reg) {
        let disp = match loc {
            Location::Reg(r) => {
                let mut a = self.ctx.asm();
                if r != src {
                    a.mov_rr(r, src);
                }
                return;
            }
            Location::FpReg(x) => {
                let mut a = self.ctx.asm();
                a.movq_xr(x, src);
                return;
            }
            Location::Spill(s) => self.frame().plan.slot_disp(s),
        };
        let mut a = self.ctx.asm();
        a.mov_mr(Reg::Rbp, disp, src);
    }

    /// Load a name into rax: locals, then worker externals, then
    /// function addresses
    fn load_var(&mut self, name: &str, pos: SrcPos) -> Result<()> {
        if self.frame().vars.contains_key(name) {
            let loc = self.var_loc(name);
            self.load_loc(loc, Reg::Rax);
            return Ok(());
        }
        let ext = self.frame().externals.get(name).copied();
        if let Some(disp) = ext {
            self.load_ctx_ptr(Reg::Rcx);
            let mut a = self.ctx.asm();
            a.mov_rm(Reg::Rax, Reg::Rcx, disp);
            return Ok(());
        }
        if let Some(&(label, _)) = self.func_labels.get(name) {
            let mut a = self.ctx.asm();
            a.lea_rip(Reg::Rax, RelocTarget::Label(label), 0);
            return Ok(());
        }
        Err(self.unresolved(name, pos, None))
    }

    fn store_var_checked(&mut self, name: &str, pos: SrcPos) -> Result<()> {
        if self.frame().vars.contains_key(name) {
            let loc = self.var_loc(name);
            self.store_loc(loc, Reg::Rax);
            return Ok(());
        }
        let ext = self.frame().externals.get(name).copied();
        if let Some(disp) = ext {
            self.load_ctx_ptr(Reg::Rcx);
            let mut a = self.ctx.asm();
            a.mov_mr(Reg::Rcx, disp, Reg::Rax);
            return Ok(());
        }
        Err(self.unresolved(name, pos, None))
    }

    fn load_ctx_ptr(&mut self, dst: Reg) {
        let ctx_var = self
            .frame()
            .ctx_var
            .expect("external access outside a worker body");
        let loc = self.frame().plan.loc(ctx_var);
        self.load_loc(loc, dst);
    }

    /// A rule violation in a program that parsed cleanly
    fn semantic(&self, pos: SrcPos, message: impl Into<String>) -> Error {
        Error::Semantic {
            file: self.program.file.clone(),
            line: pos.line,
            col: pos.col,
            message: message.into(),
        }
    }

    fn unresolved(&self, name: &str, pos: SrcPos, suggestion: Option<String>) -> Error {
        Error::UnresolvedSymbol {
            file: self.program.file.clone(),
            line: pos.line,
            col: pos.col,
            name: name.to_string(),
            suggestion: suggestion.or_else(|| {
                if self.frame.is_some() && self.frame().ctx_var.is_none() {
                    Some("lambdas do not capture enclosing locals".to_string())
                } else {
                    None
                }
            }),
        }
    }

    // -----------------------------------------------------------------
    // Temporaries and call alignment
    // -----------------------------------------------------------------

    fn push_temp(&mut self) {
        let mut a = self.ctx.asm();
        a.push_r(Reg::Rax);
        drop(a);
        self.pending_pushes += 1;
    }

    fn pop_temp(&mut self, dst: Reg) {
        let mut a = self.ctx.asm();
        a.pop_r(dst);
        drop(a);
        self.pending_pushes -= 1;
    }

    /// Frames are 16-byte aligned at statement level; re-align when an
    /// odd number of temporaries is pending around a real call
    fn with_aligned_call(&mut self, f: impl FnOnce(&mut Self)) {
        let pad = self.pending_pushes % 2 == 1;
        if pad {
            let mut a = self.ctx.asm();
            a.sub_ri(Reg::Rsp, 8);
        }
        f(self);
        if pad {
            let mut a = self.ctx.asm();
            a.add_ri(Reg::Rsp, 8);
        }
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn emit_stmt(&mut self, stmt: &'p Stmt) -> Result<()> {
        match stmt {
            Stmt::Assign { name, value, pos } => {
                self.eval_expr(value)?;
                self.store_var_checked(name, *pos)
            }
            Stmt::IndexAssign {
                target,
                index,
                value,
                ..
            } => {
                self.eval_expr(target)?;
                self.push_temp();
                self.eval_expr(index)?;
                self.push_temp();
                self.eval_expr(value)?;
                let rt = self.rt();
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rdx, Reg::Rax);
                drop(a);
                self.pop_temp(Reg::Rsi);
                self.pop_temp(Reg::Rdi);
                let mut a = self.ctx.asm();
                a.call_label(rt.index_set);
                Ok(())
            }
            Stmt::Guarded { cond, body, .. } => {
                let skip = self.fresh();
                self.eval_expr(cond)?;
                self.jump_if_false(skip);
                self.emit_stmt(body)?;
                let mut a = self.ctx.asm();
                a.bind(skip);
                Ok(())
            }
            Stmt::RangeLoop {
                var,
                start,
                end,
                inclusive,
                body,
                pos,
            } => self.emit_range_loop(var, start, end, *inclusive, body, *pos),
            Stmt::ParallelLoop {
                var,
                start,
                end,
                inclusive,
                workers,
                body,
                pos,
            } => self.emit_parallel_loop(var, start, end, *inclusive, workers, body, *pos),
            Stmt::Break { pos } => {
                let Some(lp) = self.loops.last() else {
                    return Err(self.semantic(*pos, "`break` outside a loop"));
                };
                let (brk, depth) = (lp.brk, lp.cleanup_depth);
                self.emit_cleanups_down_to(depth, false)?;
                let mut a = self.ctx.asm();
                a.jmp(brk);
                Ok(())
            }
            Stmt::Continue { pos } => {
                let Some(lp) = self.loops.last() else {
                    return Err(self.semantic(*pos, "`continue` outside a loop"));
                };
                let (cont, depth) = (lp.cont, lp.cleanup_depth);
                self.emit_cleanups_down_to(depth, false)?;
                let mut a = self.ctx.asm();
                a.jmp(cont);
                Ok(())
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(e) => {
                        self.eval_expr(e)?;
                    }
                    None => {
                        let mut a = self.ctx.asm();
                        a.mov_ri(Reg::Rax, 0);
                    }
                }
                self.push_temp();
                self.emit_cleanups_down_to(0, false)?;
                self.pop_temp(Reg::Rax);
                let epilogue = self.frame().epilogue;
                let mut a = self.ctx.asm();
                a.jmp(epilogue);
                Ok(())
            }
            Stmt::Defer { body, .. } => {
                // reserve the body's hidden slots now; each exit-edge
                // replay reuses them from the mark
                let mark = {
                    let f = self.frame.as_mut().expect("inside a function");
                    let mark = f.next_hidden;
                    f.next_hidden += count_hidden_slots(body);
                    mark
                };
                self.cleanups.push(Cleanup::Defer { body, mark });
                Ok(())
            }
            Stmt::Arena { body, .. } => {
                let hidden = self.take_hidden();
                let disp = self.hidden_disp(hidden);
                let rt = self.rt();
                {
                    let mut a = self.ctx.asm();
                    a.mov_ri(Reg::Rdi, ARENA_REGION_SIZE);
                    a.call_label(rt.arena_push);
                    a.mov_mr(Reg::Rbp, disp, Reg::Rax);
                }
                self.cleanups.push(Cleanup::ArenaPop { hidden });
                let depth = self.cleanups.len() - 1;
                for s in body {
                    self.emit_stmt(s)?;
                }
                self.emit_cleanups_down_to(depth, true)
            }
            Stmt::Unsafe { body, .. } => {
                let depth = self.cleanups.len();
                for s in body {
                    self.emit_stmt(s)?;
                }
                self.emit_cleanups_down_to(depth, true)
            }
            Stmt::Expr(e) => {
                // statement-position match arms may omit the default
                if let Expr::Match {
                    arms,
                    default: None,
                    ..
                } = e
                {
                    let end = self.fresh();
                    for arm in arms {
                        let next = self.fresh();
                        self.eval_expr(&arm.guard)?;
                        self.jump_if_false(next);
                        self.eval_expr(&arm.value)?;
                        let mut a = self.ctx.asm();
                        a.jmp(end);
                        a.bind(next);
                    }
                    let mut a = self.ctx.asm();
                    a.bind(end);
                    return Ok(());
                }
                self.eval_expr(e)?;
                Ok(())
            }
        }
    }

    /// Run (and optionally discard) cleanup handlers registered above
    /// `depth`, most recent first
    fn emit_cleanups_down_to(&mut self, depth: usize, truncate: bool) -> Result<()> {
        let handlers: Vec<Cleanup<'p>> = self.cleanups[depth..].to_vec();
        for c in handlers.iter().rev() {
            match c {
                Cleanup::Defer { body, mark } => {
                    let saved = {
                        let f = self.frame.as_mut().expect("inside a function");
                        let saved = f.next_hidden;
                        f.next_hidden = *mark;
                        saved
                    };
                    for s in body.iter() {
                        self.emit_stmt(s)?;
                    }
                    let f = self.frame.as_mut().expect("inside a function");
                    f.next_hidden = saved;
                }
                Cleanup::ArenaPop { hidden } => {
                    let disp = self.hidden_disp(*hidden);
                    let rt = self.rt();
                    let mut a = self.ctx.asm();
                    a.mov_rm(Reg::Rdi, Reg::Rbp, disp);
                    a.call_label(rt.arena_pop);
                }
            }
        }
        if truncate {
            self.cleanups.truncate(depth);
        }
        Ok(())
    }

    fn emit_range_loop(
        &mut self,
        var: &str,
        start: &'p Expr,
        end: &'p Expr,
        inclusive: bool,
        body: &'p [Stmt],
        pos: SrcPos,
    ) -> Result<()> {
        self.eval_expr(start)?;
        self.push_temp();
        self.eval_expr(end)?;
        let hidden = self.take_hidden();
        let bound_disp = self.hidden_disp(hidden);
        {
            let mut a = self.ctx.asm();
            a.mov_mr(Reg::Rbp, bound_disp, Reg::Rax);
        }
        self.pop_temp(Reg::Rax);
        self.store_var_checked(var, pos)?;

        let cond = self.fresh();
        let inc = self.fresh();
        let done = self.fresh();
        {
            let mut a = self.ctx.asm();
            a.bind(cond);
        }
        self.load_var(var, pos)?;
        {
            let mut a = self.ctx.asm();
            a.movq_xr(Xmm::Xmm0, Reg::Rax);
            a.movsd_xm(Xmm::Xmm1, Reg::Rbp, bound_disp);
            a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
            a.jcc(if inclusive { Cond::A } else { Cond::Ae }, done);
        }

        let depth = self.cleanups.len();
        self.loops.push(LoopCtx {
            brk: done,
            cont: inc,
            cleanup_depth: depth,
        });
        for s in body {
            self.emit_stmt(s)?;
        }
        self.loops.pop();
        self.emit_cleanups_down_to(depth, true)?;

        {
            let mut a = self.ctx.asm();
            a.bind(inc);
        }
        self.load_var(var, pos)?;
        {
            let mut a = self.ctx.asm();
            a.movq_xr(Xmm::Xmm0, Reg::Rax);
            a.mov_ri(Reg::Rcx, 1.0f64.to_bits() as i64);
            a.movq_xr(Xmm::Xmm1, Reg::Rcx);
            a.addsd(Xmm::Xmm0, Xmm::Xmm1);
            a.movq_rx(Reg::Rax, Xmm::Xmm0);
        }
        self.store_var_checked(var, pos)?;
        {
            let mut a = self.ctx.asm();
            a.jmp(cond);
            a.bind(done);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_parallel_loop(
        &mut self,
        var: &'p str,
        start: &'p Expr,
        end: &'p Expr,
        inclusive: bool,
        workers: &'p WorkerCount,
        body: &'p [Stmt],
        pos: SrcPos,
    ) -> Result<()> {
        // shared locals are frame-resident; workers reach them through
        // the parent frame pointer
        let mut body_locals: HashSet<String> = HashSet::new();
        body_locals.insert(var.to_string());
        let mut shared: Vec<String> = Vec::new();
        super::regalloc::free_names(body, &mut body_locals, &mut |name| {
            if !shared.iter().any(|s| s == name) {
                shared.push(name.to_string());
            }
        });
        let mut externals: HashMap<String, i32> = HashMap::new();
        for name in &shared {
            if let Some(&v) = self.frame().vars.get(name) {
                match self.frame().plan.loc(v) {
                    Location::Spill(s) => {
                        externals.insert(name.clone(), self.frame().plan.slot_disp(s));
                    }
                    _ => {
                        return Err(Error::internal(format!(
                            "shared variable `{name}` was not frame-resident"
                        )))
                    }
                }
            }
        }

        let barrier = self.take_hidden();
        let count = self.take_hidden();
        let barrier_disp = self.hidden_disp(barrier);
        let count_disp = self.hidden_disp(count);

        self.worker_count += 1;
        let body_label = self.fresh();
        let body_sym = self
            .ctx
            .symbols
            .text_local(&format!("__flap_worker_{}", self.worker_count));
        self.pending.push_back(PendingFn {
            label: body_label,
            sym: body_sym,
            kind: PendingKind::Worker {
                var,
                body,
                externals,
                pos,
            },
        });

        // lo, hi as integers; `..` includes the upper bound
        self.eval_expr(start)?;
        {
            let mut a = self.ctx.asm();
            a.movq_xr(Xmm::Xmm0, Reg::Rax);
            a.cvttsd2si(Reg::Rax, Xmm::Xmm0);
        }
        self.push_temp();
        self.eval_expr(end)?;
        {
            let mut a = self.ctx.asm();
            a.movq_xr(Xmm::Xmm0, Reg::Rax);
            a.cvttsd2si(Reg::Rax, Xmm::Xmm0);
            if inclusive {
                a.add_ri(Reg::Rax, 1);
            }
        }
        self.push_temp();

        match workers {
            WorkerCount::Auto => {
                let n = num_cpus::get() as i64;
                let mut a = self.ctx.asm();
                a.mov_ri(Reg::Rax, n.max(1));
            }
            WorkerCount::Count(e) => {
                self.eval_expr(e)?;
                let mut a = self.ctx.asm();
                a.movq_xr(Xmm::Xmm0, Reg::Rax);
                a.cvttsd2si(Reg::Rax, Xmm::Xmm0);
            }
        }
        {
            let mut a = self.ctx.asm();
            a.mov_mr(Reg::Rbp, count_disp, Reg::Rax);
        }

        let rt = self.rt();
        self.pop_temp(Reg::Rcx); // hi
        self.pop_temp(Reg::Rdx); // lo
        let mut a = self.ctx.asm();
        a.mov_rm(Reg::Rdi, Reg::Rbp, count_disp);
        a.lea_rip(Reg::Rsi, RelocTarget::Label(body_label), 0);
        a.mov_rr(Reg::R8, Reg::Rbp);
        a.lea(Reg::R9, Reg::Rbp, barrier_disp);
        a.call_label(rt.spawn_workers);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    /// Evaluate into rax
    fn eval_expr(&mut self, expr: &'p Expr) -> Result<()> {
        match expr {
            Expr::Number { value, .. } => {
                let mut a = self.ctx.asm();
                a.mov_ri(Reg::Rax, value.to_bits() as i64);
                Ok(())
            }
            Expr::Str { value, .. } => {
                let off = self.ctx.ro_str_obj(value);
                let mut a = self.ctx.asm();
                a.lea_rip(Reg::Rax, RelocTarget::Rodata(off), 0);
                Ok(())
            }
            Expr::Ident { name, pos } => self.load_var(name, *pos),
            Expr::List { items, .. } => self.eval_list_literal(items),
            Expr::Map { entries, .. } => self.eval_map_literal(entries),
            Expr::Member { object, name, pos } => Err(Error::TypeMismatch {
                file: self.program.file.clone(),
                line: pos.line,
                col: pos.col,
                name: format!("{object}.{name}"),
                message: "imported functions can only be called".into(),
            }),
            Expr::ErrorCode { value, .. } => {
                self.eval_expr(value)?;
                let rt = self.rt();
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rdi, Reg::Rax);
                a.call_label(rt.error_code_str);
                Ok(())
            }
            Expr::Unary { op, operand, .. } => self.eval_unary(*op, operand),
            Expr::Binary { op, lhs, rhs, .. } => self.eval_binary(*op, lhs, rhs),
            Expr::Call { callee, args, pos } => self.eval_call(callee, args, *pos),
            Expr::ChannelOp { op, args, pos } => self.eval_channel_op(*op, args, *pos),
            Expr::Index { target, index, .. } => {
                self.eval_expr(target)?;
                self.push_temp();
                self.eval_expr(index)?;
                let rt = self.rt();
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rsi, Reg::Rax);
                drop(a);
                self.pop_temp(Reg::Rdi);
                let mut a = self.ctx.asm();
                a.call_label(rt.index_get);
                Ok(())
            }
            Expr::Lambda { params, body, .. } => {
                self.lambda_count += 1;
                let label = self.fresh();
                let sym = self
                    .ctx
                    .symbols
                    .text_local(&format!("__flap_lambda_{}", self.lambda_count));
                self.pending.push_back(PendingFn {
                    label,
                    sym,
                    kind: PendingKind::Lambda {
                        params: params.clone(),
                        body,
                    },
                });
                let mut a = self.ctx.asm();
                a.lea_rip(Reg::Rax, RelocTarget::Label(label), 0);
                Ok(())
            }
            Expr::Match { arms, default, pos } => {
                let Some(default) = default else {
                    return Err(Error::MissingDefaultArm {
                        file: self.program.file.clone(),
                        line: pos.line,
                        col: pos.col,
                    });
                };
                // every arm funnels its value through rax, then jumps to
                // the common join
                let end = self.fresh();
                for arm in arms {
                    let next = self.fresh();
                    self.eval_expr(&arm.guard)?;
                    self.jump_if_false(next);
                    self.eval_expr(&arm.value)?;
                    let mut a = self.ctx.asm();
                    a.jmp(end);
                    a.bind(next);
                }
                self.eval_expr(default)?;
                let mut a = self.ctx.asm();
                a.bind(end);
                Ok(())
            }
        }
    }

    fn eval_list_literal(&mut self, items: &'p [Expr]) -> Result<()> {
        let rt = self.rt();
        let cap = items.len().max(4) as i64;
        {
            let mut a = self.ctx.asm();
            a.mov_ri(Reg::Rdi, cap);
            a.call_label(rt.list_new);
        }
        for (i, item) in items.iter().enumerate() {
            self.push_temp();
            self.eval_expr(item)?;
            let mut a = self.ctx.asm();
            a.mov_rr(Reg::Rdx, Reg::Rax);
            drop(a);
            self.pop_temp(Reg::Rax);
            let mut a = self.ctx.asm();
            a.mov_mr(
                Reg::Rax,
                super::value::layout::LIST_ELEMS + (i as i32) * 8,
                Reg::Rdx,
            );
        }
        let mut a = self.ctx.asm();
        a.mov_ri(Reg::Rcx, items.len() as i64);
        a.mov_mr(Reg::Rax, super::value::layout::LEN, Reg::Rcx);
        Ok(())
    }

    fn eval_map_literal(&mut self, entries: &'p [(Expr, Expr)]) -> Result<()> {
        let rt = self.rt();
        {
            let mut a = self.ctx.asm();
            a.call_label(rt.map_new);
        }
        for (k, v) in entries {
            self.push_temp(); // map
            self.eval_expr(k)?;
            self.push_temp(); // key
            self.eval_expr(v)?;
            let mut a = self.ctx.asm();
            a.mov_rr(Reg::Rdx, Reg::Rax);
            drop(a);
            self.pop_temp(Reg::Rsi);
            self.pop_temp(Reg::Rdi);
            let mut a = self.ctx.asm();
            a.call_label(rt.map_set);
        }
        Ok(())
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &'p Expr) -> Result<()> {
        self.eval_expr(operand)?;
        match op {
            UnaryOp::Neg => {
                let mut a = self.ctx.asm();
                a.mov_ri(Reg::Rcx, i64::MIN);
                a.xor_rr(Reg::Rax, Reg::Rcx);
            }
            UnaryOp::Not => {
                let falsy = self.fresh();
                let end = self.fresh();
                self.jump_if_false(falsy);
                let mut a = self.ctx.asm();
                a.mov_ri(Reg::Rax, 0);
                a.jmp(end);
                a.bind(falsy);
                a.mov_ri(Reg::Rax, 1.0f64.to_bits() as i64);
                a.bind(end);
            }
        }
        Ok(())
    }

    fn eval_binary(&mut self, op: BinaryOp, lhs: &'p Expr, rhs: &'p Expr) -> Result<()> {
        match op {
            BinaryOp::OrElse => {
                self.eval_expr(lhs)?;
                let keep = self.fresh();
                {
                    let mut a = self.ctx.asm();
                    a.mov_ri(Reg::Rcx, ERR_MASK as i64);
                    a.and_rr(Reg::Rcx, Reg::Rax);
                    a.mov_ri(Reg::Rdx, ERR_BASE as i64);
                    a.cmp_rr(Reg::Rcx, Reg::Rdx);
                    a.jcc(Cond::Ne, keep);
                }
                self.eval_expr(rhs)?;
                let mut a = self.ctx.asm();
                a.bind(keep);
                return Ok(());
            }
            BinaryOp::And => {
                let falsy = self.fresh();
                let end = self.fresh();
                self.eval_expr(lhs)?;
                self.jump_if_false(falsy);
                self.eval_expr(rhs)?;
                self.jump_if_false(falsy);
                let mut a = self.ctx.asm();
                a.mov_ri(Reg::Rax, 1.0f64.to_bits() as i64);
                a.jmp(end);
                a.bind(falsy);
                a.mov_ri(Reg::Rax, 0);
                a.bind(end);
                return Ok(());
            }
            BinaryOp::Or => {
                let truthy = self.fresh();
                let falsy = self.fresh();
                let end = self.fresh();
                self.eval_expr(lhs)?;
                self.jump_if_true(truthy);
                self.eval_expr(rhs)?;
                self.jump_if_true(truthy);
                {
                    let mut a = self.ctx.asm();
                    a.jmp(falsy);
                }
                let mut a = self.ctx.asm();
                a.bind(truthy);
                a.mov_ri(Reg::Rax, 1.0f64.to_bits() as i64);
                a.jmp(end);
                a.bind(falsy);
                a.mov_ri(Reg::Rax, 0);
                a.bind(end);
                return Ok(());
            }
            _ => {}
        }

        self.eval_expr(lhs)?;
        self.push_temp();
        self.eval_expr(rhs)?;
        {
            let mut a = self.ctx.asm();
            a.mov_rr(Reg::Rcx, Reg::Rax);
        }
        self.pop_temp(Reg::Rax);

        match op {
            BinaryOp::Add => self.emit_add_or_concat(),
            BinaryOp::Sub | BinaryOp::Mul => {
                let mut a = self.ctx.asm();
                a.movq_xr(Xmm::Xmm0, Reg::Rax);
                a.movq_xr(Xmm::Xmm1, Reg::Rcx);
                if op == BinaryOp::Sub {
                    a.subsd(Xmm::Xmm0, Xmm::Xmm1);
                } else {
                    a.mulsd(Xmm::Xmm0, Xmm::Xmm1);
                }
                a.movq_rx(Reg::Rax, Xmm::Xmm0);
                drop(a);
                self.emit_overflow_check();
                Ok(())
            }
            BinaryOp::Div | BinaryOp::Mod => {
                let err = self.fresh();
                let end = self.fresh();
                let mut a = self.ctx.asm();
                a.movq_xr(Xmm::Xmm0, Reg::Rax);
                a.movq_xr(Xmm::Xmm1, Reg::Rcx);
                a.xorps(Xmm::Xmm2, Xmm::Xmm2);
                a.ucomisd(Xmm::Xmm1, Xmm::Xmm2);
                a.jcc(Cond::E, err);
                if op == BinaryOp::Div {
                    a.divsd(Xmm::Xmm0, Xmm::Xmm1);
                } else {
                    // a - trunc(a/b)*b
                    a.movsd_xx(Xmm::Xmm2, Xmm::Xmm0);
                    a.divsd(Xmm::Xmm2, Xmm::Xmm1);
                    a.roundsd(Xmm::Xmm2, Xmm::Xmm2, 3);
                    a.mulsd(Xmm::Xmm2, Xmm::Xmm1);
                    a.subsd(Xmm::Xmm0, Xmm::Xmm2);
                }
                a.movq_rx(Reg::Rax, Xmm::Xmm0);
                a.jmp(end);
                a.bind(err);
                a.mov_ri(Reg::Rax, ERR_DIV0 as i64);
                a.bind(end);
                Ok(())
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                // unordered compares poison ZF; fold in the parity flag
                let mut a = self.ctx.asm();
                a.movq_xr(Xmm::Xmm0, Reg::Rax);
                a.movq_xr(Xmm::Xmm1, Reg::Rcx);
                a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                if op == BinaryOp::Eq {
                    a.setcc_zx(Cond::E, Reg::Rax);
                    a.setcc_zx(Cond::Np, Reg::Rcx);
                    a.and_rr(Reg::Rax, Reg::Rcx);
                } else {
                    a.setcc_zx(Cond::Ne, Reg::Rax);
                    a.setcc_zx(Cond::P, Reg::Rcx);
                    a.or_rr(Reg::Rax, Reg::Rcx);
                }
                a.cvtsi2sd(Xmm::Xmm0, Reg::Rax);
                a.movq_rx(Reg::Rax, Xmm::Xmm0);
                Ok(())
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let mut a = self.ctx.asm();
                a.movq_xr(Xmm::Xmm0, Reg::Rax);
                a.movq_xr(Xmm::Xmm1, Reg::Rcx);
                // express through `above` so unordered compares read false
                match op {
                    BinaryOp::Lt => {
                        a.ucomisd(Xmm::Xmm1, Xmm::Xmm0);
                        a.setcc_zx(Cond::A, Reg::Rax);
                    }
                    BinaryOp::Le => {
                        a.ucomisd(Xmm::Xmm1, Xmm::Xmm0);
                        a.setcc_zx(Cond::Ae, Reg::Rax);
                    }
                    BinaryOp::Gt => {
                        a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                        a.setcc_zx(Cond::A, Reg::Rax);
                    }
                    _ => {
                        a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                        a.setcc_zx(Cond::Ae, Reg::Rax);
                    }
                }
                a.cvtsi2sd(Xmm::Xmm0, Reg::Rax);
                a.movq_rx(Reg::Rax, Xmm::Xmm0);
                Ok(())
            }
            BinaryOp::OrElse | BinaryOp::And | BinaryOp::Or => unreachable!(),
        }
    }

    /// `+` concatenates when both operands are strings, else adds
    fn emit_add_or_concat(&mut self) -> Result<()> {
        let rt = self.rt();
        let numeric = self.fresh();
        let end = self.fresh();
        {
            let mut a = self.ctx.asm();
            for r in [Reg::Rax, Reg::Rcx] {
                a.test_rr(r, r);
                a.jcc(Cond::E, numeric);
                a.mov_rr(Reg::Rdx, r);
                a.shr_ri(Reg::Rdx, 48);
                a.jcc(Cond::Ne, numeric);
                a.movzx_byte(Reg::Rdx, r, 0);
                a.cmp_ri(Reg::Rdx, tag::STRING as i32);
                a.jcc(Cond::Ne, numeric);
            }
            a.mov_rr(Reg::Rdi, Reg::Rax);
            a.mov_rr(Reg::Rsi, Reg::Rcx);
            a.call_label(rt.str_concat);
            a.jmp(end);
            a.bind(numeric);
            a.movq_xr(Xmm::Xmm0, Reg::Rax);
            a.movq_xr(Xmm::Xmm1, Reg::Rcx);
            a.addsd(Xmm::Xmm0, Xmm::Xmm1);
            a.movq_rx(Reg::Rax, Xmm::Xmm0);
        }
        self.emit_overflow_check();
        let mut a = self.ctx.asm();
        a.bind(end);
        Ok(())
    }

    /// Arithmetic that lands on ±inf becomes the `ovfl` error value
    fn emit_overflow_check(&mut self) {
        let ok = self.fresh();
        let mut a = self.ctx.asm();
        a.mov_ri(Reg::Rcx, i64::MAX);
        a.and_rr(Reg::Rcx, Reg::Rax);
        a.mov_ri(Reg::Rdx, 0x7FF0_0000_0000_0000u64 as i64);
        a.cmp_rr(Reg::Rcx, Reg::Rdx);
        a.jcc(Cond::Ne, ok);
        a.mov_ri(Reg::Rax, ERR_OVFL as i64);
        a.bind(ok);
    }

    /// Falsy: +0.0/-0.0 and NaN (unordered)
    fn jump_if_false(&mut self, target: Label) {
        let mut a = self.ctx.asm();
        a.movq_xr(Xmm::Xmm0, Reg::Rax);
        a.xorps(Xmm::Xmm1, Xmm::Xmm1);
        a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
        a.jcc(Cond::E, target);
    }

    fn jump_if_true(&mut self, target: Label) {
        let mut a = self.ctx.asm();
        a.movq_xr(Xmm::Xmm0, Reg::Rax);
        a.xorps(Xmm::Xmm1, Xmm::Xmm1);
        a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
        a.jcc(Cond::Ne, target);
    }

    // -----------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------

    fn eval_call(&mut self, callee: &'p Expr, args: &'p [Expr], pos: SrcPos) -> Result<()> {
        match callee {
            Expr::Member { object, name, pos } => self.eval_ffi_call(object, name, args, *pos),
            Expr::Ident { name, pos } => {
                // user functions shadow the builtins
                if self.func_labels.contains_key(name) {
                    return self.eval_user_call(name, args, *pos);
                }
                if self.try_builtin(name, args, *pos)? {
                    return Ok(());
                }
                if self.frame().vars.contains_key(name)
                    || self.frame().externals.contains_key(name)
                {
                    // indirect call through a lambda value
                    return self.eval_indirect_call(name, args, *pos);
                }
                Err(self.unresolved(name, *pos, None))
            }
            _ => Err(self.semantic(pos, "callee must be a name or an imported member")),
        }
    }

    fn marshal_uval_args(&mut self, args: &'p [Expr], pos: SrcPos) -> Result<()> {
        if args.len() > Reg::ARGS.len() {
            return Err(Error::Unsupported(format!(
                "{}:{}:{}: calls take at most {} arguments",
                self.program.file, pos.line, pos.col,
                Reg::ARGS.len()
            )));
        }
        for arg in args {
            self.eval_expr(arg)?;
            self.push_temp();
        }
        for i in (0..args.len()).rev() {
            self.pop_temp(Reg::ARGS[i]);
        }
        Ok(())
    }

    fn eval_user_call(&mut self, name: &str, args: &'p [Expr], pos: SrcPos) -> Result<()> {
        self.marshal_uval_args(args, pos)?;
        let (_, sym) = self.func_labels[name];
        self.with_aligned_call(|s| {
            let mut a = s.ctx.asm();
            a.call_symbol(sym);
        });
        Ok(())
    }

    fn eval_indirect_call(&mut self, name: &str, args: &'p [Expr], pos: SrcPos) -> Result<()> {
        if args.len() > Reg::ARGS.len() {
            return Err(Error::Unsupported(format!(
                "{}:{}:{}: calls take at most {} arguments",
                self.program.file,
                pos.line,
                pos.col,
                Reg::ARGS.len()
            )));
        }
        // stage the callee below the arguments so filling the argument
        // registers cannot disturb it
        self.load_var(name, pos)?;
        self.push_temp();
        for arg in args {
            self.eval_expr(arg)?;
            self.push_temp();
        }
        for i in (0..args.len()).rev() {
            self.pop_temp(Reg::ARGS[i]);
        }
        self.pop_temp(Reg::R11);
        self.with_aligned_call(|s| {
            let mut a = s.ctx.asm();
            a.call_r(Reg::R11);
        });
        Ok(())
    }

    fn eval_ffi_call(
        &mut self,
        alias: &str,
        name: &str,
        args: &'p [Expr],
        pos: SrcPos,
    ) -> Result<()> {
        let Some(library) = self.import_aliases.get(alias).cloned() else {
            return Err(self.unresolved(alias, pos, None));
        };
        let cached = self.import_protos.get(name).cloned();
        let proto = match cached {
            Some(p) => p,
            None => {
                let Some(p) = self.provider.resolve(name) else {
                    return Err(self.unresolved(
                        name,
                        pos,
                        Some(format!("no prototype for `{name}` in the symbol provider")),
                    ));
                };
                self.import_protos.insert(name.to_string(), p.clone());
                p
            }
        };
        let sym = self.ctx.symbols.dyn_import(name, &library);

        if !proto.variadic && args.len() != proto.args.len() {
            return Err(Error::TypeMismatch {
                file: self.program.file.clone(),
                line: pos.line,
                col: pos.col,
                name: name.to_string(),
                message: format!("expected {} arguments, got {}", proto.args.len(), args.len()),
            });
        }
        if proto.variadic && args.len() < proto.args.len() {
            return Err(Error::TypeMismatch {
                file: self.program.file.clone(),
                line: pos.line,
                col: pos.col,
                name: name.to_string(),
                message: format!(
                    "expected at least {} arguments, got {}",
                    proto.args.len(),
                    args.len()
                ),
            });
        }

        // classify each argument; variadic extras infer from the literal
        let classes: Vec<CType> = args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                proto.args.get(i).copied().unwrap_or(match arg {
                    Expr::Str { .. } => CType::Ptr,
                    _ => CType::Double,
                })
            })
            .collect();
        for (i, (arg, class)) in args.iter().zip(&classes).enumerate() {
            if *class == CType::Ptr {
                if let Expr::Number { pos, .. } = arg {
                    return Err(Error::TypeMismatch {
                        file: self.program.file.clone(),
                        line: pos.line,
                        col: pos.col,
                        name: name.to_string(),
                        message: format!("argument {} is a number but `{name}` wants a pointer", i + 1),
                    });
                }
            }
        }

        // evaluate and convert left to right, staging on the stack
        for (arg, class) in args.iter().zip(&classes) {
            match (arg, class) {
                (Expr::Str { value, .. }, CType::Ptr) => {
                    // literal strings marshal as rodata char*
                    let off = self.ctx.ro_str_obj(value);
                    let mut a = self.ctx.asm();
                    a.lea_rip(
                        Reg::Rax,
                        RelocTarget::Rodata(off),
                        super::value::layout::STR_BYTES as i64,
                    );
                }
                (_, CType::Ptr) => {
                    self.eval_expr(arg)?;
                    // runtime string objects shift to their bytes;
                    // foreign addresses pass through unchanged
                    let through = self.fresh();
                    let mut a = self.ctx.asm();
                    a.movzx_byte(Reg::Rcx, Reg::Rax, 0);
                    a.cmp_ri(Reg::Rcx, tag::STRING as i32);
                    a.jcc(Cond::Ne, through);
                    a.add_ri(Reg::Rax, super::value::layout::STR_BYTES);
                    a.bind(through);
                }
                (_, CType::Int | CType::Long) => {
                    self.eval_expr(arg)?;
                    let mut a = self.ctx.asm();
                    a.movq_xr(Xmm::Xmm0, Reg::Rax);
                    a.cvttsd2si(Reg::Rax, Xmm::Xmm0);
                }
                (_, CType::Double) => {
                    self.eval_expr(arg)?;
                }
                (_, CType::Void) => {
                    return Err(Error::TypeMismatch {
                        file: self.program.file.clone(),
                        line: pos.line,
                        col: pos.col,
                        name: name.to_string(),
                        message: "void is not a parameter type".into(),
                    });
                }
            }
            self.push_temp();
        }

        // distribute: integer classes to rdi…, doubles to xmm0…
        let mut int_idx = vec![0usize; args.len()];
        let mut fp_idx = vec![0usize; args.len()];
        let mut n_int = 0usize;
        let mut n_fp = 0usize;
        for (i, class) in classes.iter().enumerate() {
            if class.is_fp() {
                fp_idx[i] = n_fp;
                n_fp += 1;
            } else {
                int_idx[i] = n_int;
                n_int += 1;
            }
        }
        if n_int > Reg::ARGS.len() || n_fp > Xmm::ARGS.len() {
            return Err(Error::Unsupported(
                "FFI calls are limited to six integer and eight float arguments".into(),
            ));
        }
        for i in (0..args.len()).rev() {
            self.pop_temp(Reg::Rax);
            let mut a = self.ctx.asm();
            if classes[i].is_fp() {
                a.movq_xr(Xmm::ARGS[fp_idx[i]], Reg::Rax);
            } else {
                let target = Reg::ARGS[int_idx[i]];
                a.mov_rr(target, Reg::Rax);
            }
        }
        if proto.variadic {
            // SysV: al carries the vector-register count
            let mut a = self.ctx.asm();
            a.mov_ri(Reg::Rax, n_fp as i64);
        }

        self.with_aligned_call(|s| {
            let mut a = s.ctx.asm();
            a.call_symbol(sym);
        });

        // marshal the return back to a uniform value
        let mut a = self.ctx.asm();
        match proto.ret {
            CType::Int | CType::Long => {
                a.cvtsi2sd(Xmm::Xmm0, Reg::Rax);
                a.movq_rx(Reg::Rax, Xmm::Xmm0);
            }
            CType::Double => {
                a.movq_rx(Reg::Rax, Xmm::Xmm0);
            }
            CType::Ptr => {}
            CType::Void => {
                a.mov_ri(Reg::Rax, 0);
            }
        }
        Ok(())
    }

    fn eval_channel_op(
        &mut self,
        op: ChannelOpKind,
        args: &'p [Expr],
        pos: SrcPos,
    ) -> Result<()> {
        let rt = self.rt();
        let need = match op {
            ChannelOpKind::Create => 0..=1,
            ChannelOpKind::Send => 2..=2,
            ChannelOpKind::Recv | ChannelOpKind::Close => 1..=1,
        };
        if !need.contains(&args.len()) {
            return Err(self.semantic(pos, "wrong number of channel-operation arguments"));
        }
        match op {
            ChannelOpKind::Create => {
                if let Some(cap) = args.first() {
                    self.eval_expr(cap)?;
                    let mut a = self.ctx.asm();
                    a.movq_xr(Xmm::Xmm0, Reg::Rax);
                    a.cvttsd2si(Reg::Rdi, Xmm::Xmm0);
                } else {
                    let mut a = self.ctx.asm();
                    a.mov_ri(Reg::Rdi, 0);
                }
                let mut a = self.ctx.asm();
                a.call_label(rt.chan_new);
            }
            ChannelOpKind::Send => {
                self.eval_expr(&args[0])?;
                self.push_temp();
                self.eval_expr(&args[1])?;
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rsi, Reg::Rax);
                drop(a);
                self.pop_temp(Reg::Rdi);
                let mut a = self.ctx.asm();
                a.call_label(rt.chan_send);
            }
            ChannelOpKind::Recv => {
                self.eval_expr(&args[0])?;
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rdi, Reg::Rax);
                a.call_label(rt.chan_recv);
            }
            ChannelOpKind::Close => {
                self.eval_expr(&args[0])?;
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rdi, Reg::Rax);
                a.call_label(rt.chan_close);
                a.mov_ri(Reg::Rax, 0);
            }
        }
        Ok(())
    }

    /// Builtins lower onto the runtime helpers; returns false when the
    /// name is not a builtin
    fn try_builtin(&mut self, name: &str, args: &'p [Expr], pos: SrcPos) -> Result<bool> {
        let rt = self.rt();
        match name {
            "println" | "print" => {
                self.expect_args(name, args, 1, pos)?;
                self.eval_expr(&args[0])?;
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rdi, Reg::Rax);
                a.call_label(if name == "println" {
                    rt.println_val
                } else {
                    rt.print_val
                });
                a.mov_ri(Reg::Rax, 0);
                Ok(true)
            }
            "len" => {
                self.expect_args(name, args, 1, pos)?;
                self.eval_expr(&args[0])?;
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rdi, Reg::Rax);
                a.call_label(rt.builtin_len);
                Ok(true)
            }
            "push" => {
                self.expect_args(name, args, 2, pos)?;
                self.eval_expr(&args[0])?;
                self.push_temp();
                self.eval_expr(&args[1])?;
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rsi, Reg::Rax);
                drop(a);
                self.pop_temp(Reg::Rdi);
                let mut a = self.ctx.asm();
                a.call_label(rt.list_push);
                Ok(true)
            }
            "atomic_add" => {
                self.expect_args(name, args, 2, pos)?;
                self.eval_target_addr(&args[0], pos)?;
                self.push_temp();
                self.eval_expr(&args[1])?;
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rsi, Reg::Rax);
                drop(a);
                self.pop_temp(Reg::Rdi);
                let mut a = self.ctx.asm();
                a.call_label(rt.atomic_add_f64);
                Ok(true)
            }
            "cas" => {
                self.expect_args(name, args, 3, pos)?;
                self.eval_target_addr(&args[0], pos)?;
                self.push_temp();
                self.eval_expr(&args[1])?;
                self.push_temp();
                self.eval_expr(&args[2])?;
                let mut a = self.ctx.asm();
                a.mov_rr(Reg::Rdx, Reg::Rax);
                drop(a);
                self.pop_temp(Reg::Rsi);
                self.pop_temp(Reg::Rdi);
                let mut a = self.ctx.asm();
                a.call_label(rt.cas_i64);
                a.cvtsi2sd(Xmm::Xmm0, Reg::Rax);
                a.movq_rx(Reg::Rax, Xmm::Xmm0);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Address of a mutable cell (frame slot, shared parent slot, or
    /// list element) for the atomic builtins
    fn eval_target_addr(&mut self, target: &'p Expr, pos: SrcPos) -> Result<()> {
        match target {
            Expr::Ident { name, pos } => {
                let ext = self.frame().externals.get(name).copied();
                if self.frame().vars.contains_key(name) {
                    match self.var_loc(name) {
                        Location::Spill(s) => {
                            let disp = self.frame().plan.slot_disp(s);
                            let mut a = self.ctx.asm();
                            a.lea(Reg::Rax, Reg::Rbp, disp);
                            Ok(())
                        }
                        _ => Err(Error::Unsupported(format!(
                            "{}:{}:{}: `{name}` must be frame-resident for atomic access (share it with a parallel loop)",
                            self.program.file, pos.line, pos.col
                        ))),
                    }
                } else if let Some(disp) = ext {
                    self.load_ctx_ptr(Reg::Rcx);
                    let mut a = self.ctx.asm();
                    a.lea(Reg::Rax, Reg::Rcx, disp);
                    Ok(())
                } else {
                    Err(self.unresolved(name, *pos, None))
                }
            }
            Expr::Index { target, index, .. } => {
                self.eval_expr(target)?;
                self.push_temp();
                self.eval_expr(index)?;
                {
                    let mut a = self.ctx.asm();
                    a.movq_xr(Xmm::Xmm0, Reg::Rax);
                    a.cvttsd2si(Reg::Rcx, Xmm::Xmm0);
                }
                self.pop_temp(Reg::Rax);
                let mut a = self.ctx.asm();
                a.shl_ri(Reg::Rcx, 3);
                a.add_rr(Reg::Rax, Reg::Rcx);
                a.add_ri(Reg::Rax, super::value::layout::LIST_ELEMS);
                Ok(())
            }
            _ => Err(self.semantic(pos, "atomic target must be a variable or list element")),
        }
    }

    fn expect_args(&self, name: &str, args: &[Expr], n: usize, pos: SrcPos) -> Result<()> {
        if args.len() != n {
            return Err(self.semantic(
                pos,
                format!("`{name}` takes {n} argument(s), got {}", args.len()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ffi::KnownLibcProvider;
    use crate::compiler::regalloc::DEFAULT_FRAME_BUDGET;
    use crate::parser::parse_source;

    fn gen(src: &str) -> CodeObject {
        let program = parse_source("test.flap", src).unwrap();
        let provider = KnownLibcProvider;
        CodeGen::new(&program, &provider, DEFAULT_FRAME_BUDGET)
            .generate()
            .unwrap()
    }

    fn gen_err(src: &str) -> Error {
        let program = parse_source("test.flap", src).unwrap();
        let provider = KnownLibcProvider;
        CodeGen::new(&program, &provider, DEFAULT_FRAME_BUDGET)
            .generate()
            .unwrap_err()
    }

    #[test]
    fn hello_emits_text_and_rodata() {
        let obj = gen(r#"main = () => println("hi")"#);
        assert!(obj.text.len() > 0x100, "runtime + code emitted");
        // the string object is in rodata: tag, padding, len, bytes
        let ro = obj.rodata.as_slice();
        let needle = b"hi\0";
        assert!(ro.windows(needle.len()).any(|w| w == needle));
        assert!(obj.labels.offset_of(obj.entry).is_some());
        assert!(obj.libraries.is_empty());
    }

    #[test]
    fn every_label_is_bound() {
        let obj = gen("x = 1\n@ i in 0..<10 { x = x + i }\nprintln(x)");
        assert!(obj.labels.unbound().is_empty());
    }

    #[test]
    fn ffi_call_registers_import() {
        let obj = gen("import c \"libc.so.6\"\nmain = () => c.puts(\"world\")");
        assert_eq!(obj.libraries, vec!["libc.so.6".to_string()]);
        let imports = obj.symbols.imports_in_order();
        assert_eq!(imports.len(), 1);
        assert_eq!(obj.symbols.get(imports[0]).name, "puts");
    }

    #[test]
    fn unknown_name_is_unresolved() {
        let err = gen_err("x = nope + 1");
        assert!(matches!(err, Error::UnresolvedSymbol { .. }));
    }

    #[test]
    fn ffi_arity_is_checked() {
        let err = gen_err("import c \"libc.so.6\"\nmain = () => c.puts(\"a\", \"b\")");
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn number_to_pointer_is_a_type_error() {
        let err = gen_err("import c \"libc.so.6\"\nmain = () => c.puts(5)");
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn match_without_default_in_expression_is_rejected() {
        let err = gen_err("f = n => { | n < 0 -> 1 }\nx = f(1)\nprintln(x)");
        assert!(matches!(err, Error::MissingDefaultArm { .. }));
    }

    #[test]
    fn break_outside_a_loop_is_a_semantic_error() {
        let err = gen_err("break");
        assert!(matches!(err, Error::Semantic { .. }));
        assert_eq!(err.exit_code(), 1);
        let err = gen_err("continue");
        assert!(matches!(err, Error::Semantic { .. }));
    }

    #[test]
    fn builtin_and_channel_arity_are_semantic_errors() {
        let err = gen_err("println(1, 2)");
        assert!(matches!(err, Error::Semantic { .. }));
        let err = gen_err("x = recv()");
        assert!(matches!(err, Error::Semantic { .. }));
        let err = gen_err("atomic_add(1 + 2, 3)");
        assert!(matches!(err, Error::Semantic { .. }));
    }

    #[test]
    fn parallel_loop_compiles_with_shared_counter() {
        let obj = gen("counter = 0\n@@ i in 0..<1000 { atomic_add(counter, i) }\nprintln(counter)");
        assert!(obj.labels.unbound().is_empty());
        // a worker body symbol exists
        assert!(obj
            .symbols
            .iter()
            .any(|(_, s)| s.name.starts_with("__flap_worker_")));
    }

    #[test]
    fn scenario_sources_compile() {
        for src in [
            r#"main = () => println("hi")"#,
            "x = 1/0 or! 42\nprintln(x)",
            "counter = 0\n@@ i in 0..<1000 { atomic_add(counter, i) }\nprintln(counter)",
            "import c \"libc.so.6\"\nmain = () => c.puts(\"world\")",
            "total = 0\n@ i in 0..<100 { i >= 10 -> break; total = total + i }\nprintln(total)",
            r#"classify = n => { | n < 0 -> "neg" | n == 0 -> "zero" ~> "pos" }
println(classify(-3))"#,
        ] {
            let obj = gen(src);
            assert!(obj.labels.unbound().is_empty(), "unbound labels for {src}");
        }
    }

    #[test]
    fn defer_and_arena_compile() {
        let obj = gen("arena {\n  s = \"x\" + \"y\"\n  defer { println(s) }\n  println(1)\n}");
        assert!(obj.labels.unbound().is_empty());
    }

    #[test]
    fn channels_compile() {
        let obj = gen("ch = channel(4)\nsend(ch, 1)\nx = recv(ch)\nclose(ch)\nprintln(x)");
        assert!(obj.labels.unbound().is_empty());
    }

    #[test]
    fn codegen_is_deterministic() {
        let src = "total = 0\n@ i in 0..<10 { total = total + i }\nprintln(total)";
        let a = gen(src);
        let b = gen(src);
        assert_eq!(a.text.as_slice(), b.text.as_slice());
        assert_eq!(a.rodata.as_slice(), b.rodata.as_slice());
    }
}

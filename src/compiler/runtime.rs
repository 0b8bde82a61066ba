//! # Runtime support emitted into every image
//!
//! The helpers generated code depends on (heap and arena allocation,
//! channels, atomics, the parallel-loop fan-out, string/list/map
//! operations, and number printing) are emitted inline into `.text` at
//! known entry labels. No C objects are linked; everything is direct
//! machine code over raw syscalls.
//!
//! ## Helper ABI
//!
//! Arguments arrive in the System V integer registers. Unlike real
//! calls, helpers preserve every general-purpose register except rax
//! (the return value); xmm0/xmm1 and flags are clobbered. The code
//! generator therefore treats helper calls as ordinary instructions for
//! register-allocation purposes.

use super::codegen::EmitCtx;
use super::reloc::{Label, RelocTarget};
use super::value::{layout, tag, ERR_BASE, ERR_IDX, ERR_KEY, ERR_MASK};
use super::x86_64::{Asm, Cond, Reg, Xmm};
use crate::error::Result;

// Linux x86-64 syscall numbers
const SYS_WRITE: i64 = 1;
const SYS_MMAP: i64 = 9;
const SYS_MUNMAP: i64 = 11;
const SYS_CLONE: i64 = 56;
const SYS_EXIT: i64 = 60;
const SYS_ARCH_PRCTL: i64 = 158;
const SYS_FUTEX: i64 = 202;
const SYS_EXIT_GROUP: i64 = 231;

const FUTEX_WAIT_PRIVATE: i64 = 128;
const FUTEX_WAKE_PRIVATE: i64 = 129;
const ARCH_SET_FS: i64 = 0x1002;

/// CLONE_VM | CLONE_FS | CLONE_FILES | CLONE_SIGHAND | CLONE_THREAD |
/// CLONE_SYSVSEM | CLONE_CHILD_CLEARTID
const CLONE_FLAGS: i64 = 0x250F00;

/// Global bump-heap reservation (1 GiB, NORESERVE)
const HEAP_SIZE: i64 = 0x4000_0000;
/// Worker thread stack size (1 MiB)
const WORKER_STACK: i64 = 0x10_0000;
/// Upper bound on workers per parallel loop
const MAX_WORKERS: i64 = 255;

/// Entry labels of the emitted runtime
#[derive(Debug, Clone, Copy)]
pub struct RuntimeLib {
    /// Map the heap, install the main thread's TLS slot
    pub init: Label,
    /// rdi=size → rax ptr (current arena, else global bump)
    pub alloc: Label,
    /// rdi=value: print without newline
    pub print_val: Label,
    /// rdi=value: print followed by `\n`
    pub println_val: Label,
    /// rdi=a, rsi=b (strings) → rax new string
    pub str_concat: Label,
    /// rdi=a, rsi=b (strings) → rax 0/1
    pub str_eq: Label,
    /// rdi=a, rsi=b (any values) → rax 0/1
    pub val_eq: Label,
    /// rdi=value → rax 64-bit hash
    pub val_hash: Label,
    /// rdi=capacity (i64) → rax list
    pub list_new: Label,
    /// rdi=list, rsi=value → rax list (possibly regrown)
    pub list_push: Label,
    /// rdi=value → rax f64 bits of the length
    pub builtin_len: Label,
    /// rdi=obj, rsi=key/index → rax value or error NaN
    pub index_get: Label,
    /// rdi=obj, rsi=key/index, rdx=value → rax 0 or error NaN
    pub index_set: Label,
    /// → rax empty map
    pub map_new: Label,
    /// rdi=map, rsi=key → rax value or `key ` error
    pub map_get: Label,
    /// rdi=map, rsi=key, rdx=value → rax map
    pub map_set: Label,
    /// rdi=capacity (i64) → rax channel
    pub chan_new: Label,
    /// rdi=ch, rsi=value → rax 0.0 or -1.0 (closed)
    pub chan_send: Label,
    /// rdi=ch → rax value (0.0 on closed+empty)
    pub chan_recv: Label,
    /// rdi=ch
    pub chan_close: Label,
    /// rdi=size → rax arena (installed as current)
    pub arena_push: Label,
    /// rdi=arena: restore parent, unmap region
    pub arena_pop: Label,
    /// rdi=ptr, rsi=delta → rax previous value
    pub atomic_add_i64: Label,
    /// rdi=ptr, rsi=old, rdx=new → rax 1/0
    pub cas_i64: Label,
    /// rdi=ptr, rsi=delta bits → rax new value bits (CAS loop)
    pub atomic_add_f64: Label,
    /// rdi=n, rsi=body, rdx=lo, rcx=hi, r8=ctx, r9=barrier
    pub spawn_workers: Label,
    /// rdi=value → rax error-code string ("" when not an error)
    pub error_code_str: Label,
    // internal entry points, shared by the helpers themselves
    write_str: Label,
    print_i64: Label,
    print_u6: Label,
    copy_bytes: Label,
    mutex_lock: Label,
    mutex_unlock: Label,
    cond_wait: Label,
    cond_signal: Label,
    cond_broadcast: Label,
    map_find: Label,
    idx_insert: Label,
}

/// Rodata constants the helpers reference
struct RoConsts {
    c10: u64,
    c1e6: u64,
    c0_5: u64,
    lbracket: u64,
    rbracket: u64,
    comma: u64,
    colon: u64,
    colon_sp: u64,
    dot: u64,
    minus: u64,
    newline: u64,
    nan: u64,
    inf: u64,
    echar: u64,
    err_prefix: u64,
    chan_repr: u64,
    arena_repr: u64,
    oom_msg: u64,
    empty_str_obj: u64,
}

/// BSS slots owned by the runtime
struct RtSlots {
    heap_cur: u64,
    heap_end: u64,
    tls_main: u64,
}

fn save(a: &mut Asm, regs: &[Reg]) {
    for &r in regs {
        a.push_r(r);
    }
}

fn restore(a: &mut Asm, regs: &[Reg]) {
    for &r in regs.iter().rev() {
        a.pop_r(r);
    }
}

/// Emit the whole runtime into `.text`; returns the entry labels
pub fn emit(ctx: &mut EmitCtx) -> Result<RuntimeLib> {
    let ro = RoConsts {
        c10: ctx.ro_f64(10.0),
        c1e6: ctx.ro_f64(1e6),
        c0_5: ctx.ro_f64(0.5),
        lbracket: ctx.ro_bytes(b"["),
        rbracket: ctx.ro_bytes(b"]"),
        comma: ctx.ro_bytes(b", "),
        colon: ctx.ro_bytes(b":"),
        colon_sp: ctx.ro_bytes(b": "),
        dot: ctx.ro_bytes(b"."),
        minus: ctx.ro_bytes(b"-"),
        newline: ctx.ro_bytes(b"\n"),
        nan: ctx.ro_bytes(b"nan"),
        inf: ctx.ro_bytes(b"inf"),
        echar: ctx.ro_bytes(b"e"),
        err_prefix: ctx.ro_bytes(b"error:"),
        chan_repr: ctx.ro_bytes(b"<channel>"),
        arena_repr: ctx.ro_bytes(b"<arena>"),
        oom_msg: ctx.ro_bytes(b"flap: out of memory\n"),
        empty_str_obj: ctx.ro_str_obj(""),
    };
    let slots = RtSlots {
        heap_cur: ctx.bss_slot(8),
        heap_end: ctx.bss_slot(8),
        tls_main: ctx.bss_slot(16),
    };

    let lib = RuntimeLib {
        init: ctx.labels.fresh(),
        alloc: ctx.labels.fresh(),
        print_val: ctx.labels.fresh(),
        println_val: ctx.labels.fresh(),
        str_concat: ctx.labels.fresh(),
        str_eq: ctx.labels.fresh(),
        val_eq: ctx.labels.fresh(),
        val_hash: ctx.labels.fresh(),
        list_new: ctx.labels.fresh(),
        list_push: ctx.labels.fresh(),
        builtin_len: ctx.labels.fresh(),
        index_get: ctx.labels.fresh(),
        index_set: ctx.labels.fresh(),
        map_new: ctx.labels.fresh(),
        map_get: ctx.labels.fresh(),
        map_set: ctx.labels.fresh(),
        chan_new: ctx.labels.fresh(),
        chan_send: ctx.labels.fresh(),
        chan_recv: ctx.labels.fresh(),
        chan_close: ctx.labels.fresh(),
        arena_push: ctx.labels.fresh(),
        arena_pop: ctx.labels.fresh(),
        atomic_add_i64: ctx.labels.fresh(),
        cas_i64: ctx.labels.fresh(),
        atomic_add_f64: ctx.labels.fresh(),
        spawn_workers: ctx.labels.fresh(),
        error_code_str: ctx.labels.fresh(),
        write_str: ctx.labels.fresh(),
        print_i64: ctx.labels.fresh(),
        print_u6: ctx.labels.fresh(),
        copy_bytes: ctx.labels.fresh(),
        mutex_lock: ctx.labels.fresh(),
        mutex_unlock: ctx.labels.fresh(),
        cond_wait: ctx.labels.fresh(),
        cond_signal: ctx.labels.fresh(),
        cond_broadcast: ctx.labels.fresh(),
        map_find: ctx.labels.fresh(),
        idx_insert: ctx.labels.fresh(),
    };

    emit_init(ctx, &lib, &slots);
    emit_alloc(ctx, &lib, &slots, &ro);
    emit_write_str(ctx, &lib);
    emit_print_i64(ctx, &lib);
    emit_print_u6(ctx, &lib);
    emit_print_val(ctx, &lib, &ro);
    emit_println_val(ctx, &lib, &ro);
    emit_copy_bytes(ctx, &lib);
    emit_str_concat(ctx, &lib);
    emit_str_eq(ctx, &lib);
    emit_val_eq(ctx, &lib);
    emit_val_hash(ctx, &lib);
    emit_list_new(ctx, &lib);
    emit_list_push(ctx, &lib);
    emit_builtin_len(ctx, &lib);
    emit_index_get(ctx, &lib);
    emit_index_set(ctx, &lib);
    emit_map_new(ctx, &lib);
    emit_map_find(ctx, &lib);
    emit_map_get(ctx, &lib);
    emit_idx_insert(ctx, &lib);
    emit_map_set(ctx, &lib);
    emit_mutex(ctx, &lib);
    emit_cond(ctx, &lib);
    emit_chan_new(ctx, &lib);
    emit_chan_send(ctx, &lib);
    emit_chan_recv(ctx, &lib);
    emit_chan_close(ctx, &lib);
    emit_arena(ctx, &lib);
    emit_atomics(ctx, &lib);
    emit_spawn_workers(ctx, &lib);
    emit_error_code_str(ctx, &lib, &ro);

    tracing::debug!(
        text_bytes = ctx.text.len(),
        "runtime helpers emitted"
    );
    Ok(lib)
}

/// rt_init: map the global heap, install the main thread's TLS block
fn emit_init(ctx: &mut EmitCtx, lib: &RuntimeLib, slots: &RtSlots) {
    let mut a = ctx.asm();
    a.bind(lib.init);
    let saved = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ];
    save(&mut a, &saved);

    // mmap(0, HEAP_SIZE, RW, PRIVATE|ANON|NORESERVE, -1, 0)
    a.mov_ri(Reg::Rax, SYS_MMAP);
    a.mov_ri(Reg::Rdi, 0);
    a.mov_ri(Reg::Rsi, HEAP_SIZE);
    a.mov_ri(Reg::Rdx, 3);
    a.mov_ri(Reg::R10, 0x4022);
    a.mov_ri(Reg::R8, -1);
    a.mov_ri(Reg::R9, 0);
    a.syscall();
    let ok = a.fresh_label();
    a.mov_ri(Reg::Rcx, -4096);
    a.cmp_rr(Reg::Rax, Reg::Rcx);
    a.jcc(Cond::B, ok);
    // mapping failed: nothing can run
    a.mov_ri(Reg::Rax, SYS_EXIT_GROUP);
    a.mov_ri(Reg::Rdi, 1);
    a.syscall();
    a.bind(ok);

    a.lea_rip(Reg::Rcx, RelocTarget::Bss(slots.heap_cur), 0);
    a.mov_mr(Reg::Rcx, 0, Reg::Rax);
    a.mov_rr(Reg::Rdx, Reg::Rax);
    a.mov_ri(Reg::Rsi, HEAP_SIZE);
    a.add_rr(Reg::Rdx, Reg::Rsi);
    a.lea_rip(Reg::Rcx, RelocTarget::Bss(slots.heap_end), 0);
    a.mov_mr(Reg::Rcx, 0, Reg::Rdx);

    // arch_prctl(ARCH_SET_FS, &tls_main); fs:[0] = current arena = 0
    a.lea_rip(Reg::Rsi, RelocTarget::Bss(slots.tls_main), 0);
    a.mov_ri(Reg::Rdi, ARCH_SET_FS);
    a.mov_ri(Reg::Rax, SYS_ARCH_PRCTL);
    a.syscall();

    restore(&mut a, &saved);
    a.ret();
}

/// rt_alloc: 16-byte-aligned bump allocation from the current arena,
/// falling back to the global heap
fn emit_alloc(ctx: &mut EmitCtx, lib: &RuntimeLib, slots: &RtSlots, ro: &RoConsts) {
    let mut a = ctx.asm();
    a.bind(lib.alloc);
    let saved = [Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi, Reg::R8, Reg::R11];
    save(&mut a, &saved);

    a.add_ri(Reg::Rdi, 15);
    a.and_ri(Reg::Rdi, -16);

    let global = a.fresh_label();
    let done = a.fresh_label();
    a.fs_load(Reg::Rcx, 0);
    a.test_rr(Reg::Rcx, Reg::Rcx);
    a.jcc(Cond::E, global);
    // bump inside the current arena if it has room
    a.mov_rm(Reg::Rdx, Reg::Rcx, layout::ARENA_CURSOR);
    a.mov_rr(Reg::R8, Reg::Rdx);
    a.add_rr(Reg::R8, Reg::Rdi);
    a.cmp_rm(Reg::R8, Reg::Rcx, layout::ARENA_SIZE);
    a.jcc(Cond::A, global);
    a.mov_mr(Reg::Rcx, layout::ARENA_CURSOR, Reg::R8);
    a.mov_rm(Reg::Rax, Reg::Rcx, layout::ARENA_BASE);
    a.add_rr(Reg::Rax, Reg::Rdx);
    a.jmp(done);

    a.bind(global);
    a.lea_rip(Reg::Rcx, RelocTarget::Bss(slots.heap_cur), 0);
    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.lock_xadd(Reg::Rcx, 0, Reg::Rax);
    a.mov_rr(Reg::R8, Reg::Rax);
    a.add_rr(Reg::R8, Reg::Rdi);
    a.lea_rip(Reg::Rcx, RelocTarget::Bss(slots.heap_end), 0);
    a.cmp_rm(Reg::R8, Reg::Rcx, 0);
    let oom = a.fresh_label();
    a.jcc(Cond::A, oom);
    a.jmp(done);

    a.bind(oom);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.oom_msg), 0);
    a.mov_ri(Reg::Rdx, 20);
    a.mov_ri(Reg::Rax, SYS_WRITE);
    a.mov_ri(Reg::Rdi, 2);
    a.syscall();
    a.mov_ri(Reg::Rax, SYS_EXIT_GROUP);
    a.mov_ri(Reg::Rdi, 1);
    a.syscall();

    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

/// write(1, rsi, rdx), preserving everything
fn emit_write_str(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.write_str);
    let saved = [Reg::Rax, Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi, Reg::R11];
    save(&mut a, &saved);
    a.mov_ri(Reg::Rax, SYS_WRITE);
    a.mov_ri(Reg::Rdi, 1);
    a.syscall();
    restore(&mut a, &saved);
    a.ret();
}

/// Print rdi as a signed decimal integer
fn emit_print_i64(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.print_i64);
    let saved = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R11,
    ];
    save(&mut a, &saved);
    a.sub_ri(Reg::Rsp, 48);

    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.mov_ri(Reg::R8, 0);
    let positive = a.fresh_label();
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::Ns, positive);
    a.mov_ri(Reg::R8, 1);
    a.neg_r(Reg::Rax);
    a.bind(positive);

    // digits backward from the end of the buffer
    a.lea(Reg::Rsi, Reg::Rsp, 47);
    a.mov_ri(Reg::Rcx, 10);
    let digit_loop = a.fresh_label();
    a.bind(digit_loop);
    a.xor_r32(Reg::Rdx, Reg::Rdx);
    a.div_r(Reg::Rcx);
    a.add_ri(Reg::Rdx, b'0' as i32);
    a.mov_m8_r8(Reg::Rsi, 0, Reg::Rdx);
    a.sub_ri(Reg::Rsi, 1);
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::Ne, digit_loop);

    let no_sign = a.fresh_label();
    a.test_rr(Reg::R8, Reg::R8);
    a.jcc(Cond::E, no_sign);
    a.mov_ri(Reg::Rcx, b'-' as i64);
    a.mov_m8_r8(Reg::Rsi, 0, Reg::Rcx);
    a.sub_ri(Reg::Rsi, 1);
    a.bind(no_sign);

    a.lea(Reg::Rdx, Reg::Rsp, 48);
    a.sub_rr(Reg::Rdx, Reg::Rsi);
    a.sub_ri(Reg::Rdx, 1);
    a.add_ri(Reg::Rsi, 1);
    a.mov_ri(Reg::Rax, SYS_WRITE);
    a.mov_ri(Reg::Rdi, 1);
    a.syscall();

    a.add_ri(Reg::Rsp, 48);
    restore(&mut a, &saved);
    a.ret();
}

/// Print rdi (0..=999999) as exactly six zero-padded digits
fn emit_print_u6(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.print_u6);
    let saved = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R11,
    ];
    save(&mut a, &saved);
    a.sub_ri(Reg::Rsp, 16);

    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.lea(Reg::Rsi, Reg::Rsp, 5);
    a.mov_ri(Reg::Rcx, 10);
    a.mov_ri(Reg::R8, 6);
    let lp = a.fresh_label();
    a.bind(lp);
    a.xor_r32(Reg::Rdx, Reg::Rdx);
    a.div_r(Reg::Rcx);
    a.add_ri(Reg::Rdx, b'0' as i32);
    a.mov_m8_r8(Reg::Rsi, 0, Reg::Rdx);
    a.sub_ri(Reg::Rsi, 1);
    a.sub_ri(Reg::R8, 1);
    a.jcc(Cond::Ne, lp);

    a.mov_rr(Reg::Rsi, Reg::Rsp);
    a.mov_ri(Reg::Rdx, 6);
    a.mov_ri(Reg::Rax, SYS_WRITE);
    a.mov_ri(Reg::Rdi, 1);
    a.syscall();

    a.add_ri(Reg::Rsp, 16);
    restore(&mut a, &saved);
    a.ret();
}

/// Print any value: strings verbatim, lists/maps recursively, numbers
/// with an integral fast path, six fractional digits otherwise, and a
/// computed-exponent scientific form beyond the i64 range
fn emit_print_val(ctx: &mut EmitCtx, lib: &RuntimeLib, ro: &RoConsts) {
    let mut a = ctx.asm();
    a.bind(lib.print_val);
    let saved = [
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R11,
    ];
    save(&mut a, &saved);

    let err_p = a.fresh_label();
    let num = a.fresh_label();
    let done = a.fresh_label();

    // error values carry the fixed NaN pattern
    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.mov_ri(Reg::Rcx, ERR_MASK as i64);
    a.and_rr(Reg::Rcx, Reg::Rax);
    a.mov_ri(Reg::Rdx, ERR_BASE as i64);
    a.cmp_rr(Reg::Rcx, Reg::Rdx);
    a.jcc(Cond::E, err_p);

    // heap pointers live below 2^48; anything else is a number
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::E, num);
    a.mov_rr(Reg::Rcx, Reg::Rax);
    a.shr_ri(Reg::Rcx, 48);
    a.jcc(Cond::Ne, num);

    let strp = a.fresh_label();
    let listp = a.fresh_label();
    let mapp = a.fresh_label();
    let chanp = a.fresh_label();
    let arenap = a.fresh_label();
    a.movzx_byte(Reg::Rdx, Reg::Rax, 0);
    a.cmp_ri(Reg::Rdx, tag::STRING as i32);
    a.jcc(Cond::E, strp);
    a.cmp_ri(Reg::Rdx, tag::LIST as i32);
    a.jcc(Cond::E, listp);
    a.cmp_ri(Reg::Rdx, tag::MAP as i32);
    a.jcc(Cond::E, mapp);
    a.cmp_ri(Reg::Rdx, tag::CHANNEL as i32);
    a.jcc(Cond::E, chanp);
    a.cmp_ri(Reg::Rdx, tag::ARENA as i32);
    a.jcc(Cond::E, arenap);
    a.jmp(num);

    a.bind(strp);
    a.mov_rr(Reg::Rsi, Reg::Rax);
    a.add_ri(Reg::Rsi, layout::STR_BYTES);
    a.mov_rm(Reg::Rdx, Reg::Rax, layout::LEN);
    a.call_label(lib.write_str);
    a.jmp(done);

    // [e0, e1, …]
    a.bind(listp);
    a.mov_rr(Reg::Rbx, Reg::Rax);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.lbracket), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.mov_ri(Reg::R8, 0);
    a.mov_rm(Reg::R9, Reg::Rbx, layout::LEN);
    let list_loop = a.fresh_label();
    let list_end = a.fresh_label();
    let no_comma = a.fresh_label();
    a.bind(list_loop);
    a.cmp_rr(Reg::R8, Reg::R9);
    a.jcc(Cond::Ge, list_end);
    a.test_rr(Reg::R8, Reg::R8);
    a.jcc(Cond::E, no_comma);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.comma), 0);
    a.mov_ri(Reg::Rdx, 2);
    a.call_label(lib.write_str);
    a.bind(no_comma);
    a.mov_rr(Reg::Rdi, Reg::R8);
    a.shl_ri(Reg::Rdi, 3);
    a.add_rr(Reg::Rdi, Reg::Rbx);
    a.mov_rm(Reg::Rdi, Reg::Rdi, layout::LIST_ELEMS);
    a.call_label(lib.print_val);
    a.add_ri(Reg::R8, 1);
    a.jmp(list_loop);
    a.bind(list_end);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.rbracket), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.jmp(done);

    // [k0: v0, …]; the empty map prints as [:]
    a.bind(mapp);
    a.mov_rr(Reg::Rbx, Reg::Rax);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.lbracket), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.mov_rm(Reg::R9, Reg::Rbx, layout::LEN);
    let map_some = a.fresh_label();
    let map_end = a.fresh_label();
    a.test_rr(Reg::R9, Reg::R9);
    a.jcc(Cond::Ne, map_some);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.colon), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.jmp(map_end);
    a.bind(map_some);
    a.mov_ri(Reg::R8, 0);
    let map_loop = a.fresh_label();
    let map_nc = a.fresh_label();
    a.bind(map_loop);
    a.cmp_rr(Reg::R8, Reg::R9);
    a.jcc(Cond::Ge, map_end);
    a.test_rr(Reg::R8, Reg::R8);
    a.jcc(Cond::E, map_nc);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.comma), 0);
    a.mov_ri(Reg::Rdx, 2);
    a.call_label(lib.write_str);
    a.bind(map_nc);
    a.mov_rr(Reg::Rdi, Reg::R8);
    a.shl_ri(Reg::Rdi, 4);
    a.add_rm(Reg::Rdi, Reg::Rbx, layout::MAP_ENTRIES);
    a.push_r(Reg::Rdi);
    a.mov_rm(Reg::Rdi, Reg::Rdi, 0);
    a.call_label(lib.print_val);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.colon_sp), 0);
    a.mov_ri(Reg::Rdx, 2);
    a.call_label(lib.write_str);
    a.pop_r(Reg::Rcx);
    a.mov_rm(Reg::Rdi, Reg::Rcx, 8);
    a.call_label(lib.print_val);
    a.add_ri(Reg::R8, 1);
    a.jmp(map_loop);
    a.bind(map_end);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.rbracket), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.jmp(done);

    a.bind(chanp);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.chan_repr), 0);
    a.mov_ri(Reg::Rdx, 9);
    a.call_label(lib.write_str);
    a.jmp(done);
    a.bind(arenap);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.arena_repr), 0);
    a.mov_ri(Reg::Rdx, 7);
    a.call_label(lib.write_str);
    a.jmp(done);

    // Number path
    let nan_p = a.fresh_label();
    let huge = a.fresh_label();
    let fract = a.fresh_label();
    a.bind(num);
    a.movq_xr(Xmm::Xmm0, Reg::Rdi);
    a.ucomisd(Xmm::Xmm0, Xmm::Xmm0);
    a.jcc(Cond::P, nan_p);
    a.cvttsd2si(Reg::Rax, Xmm::Xmm0);
    a.mov_ri(Reg::Rcx, i64::MIN);
    a.cmp_rr(Reg::Rax, Reg::Rcx);
    a.jcc(Cond::E, huge);
    a.cvtsi2sd(Xmm::Xmm1, Reg::Rax);
    a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
    a.jcc(Cond::Ne, fract);
    a.mov_rr(Reg::Rdi, Reg::Rax);
    a.call_label(lib.print_i64);
    a.jmp(done);

    // sign, integer part, '.', six rounded fraction digits
    a.bind(fract);
    a.movq_rx(Reg::Rax, Xmm::Xmm0);
    a.mov_rr(Reg::Rcx, Reg::Rax);
    a.shr_ri(Reg::Rcx, 63);
    let fpos = a.fresh_label();
    a.jcc(Cond::E, fpos);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.minus), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.mov_ri(Reg::Rcx, i64::MIN);
    a.xor_rr(Reg::Rax, Reg::Rcx);
    a.movq_xr(Xmm::Xmm0, Reg::Rax);
    a.bind(fpos);
    a.roundsd(Xmm::Xmm1, Xmm::Xmm0, 3);
    a.cvttsd2si(Reg::Rdi, Xmm::Xmm1);
    a.call_label(lib.print_i64);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.dot), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.subsd(Xmm::Xmm0, Xmm::Xmm1);
    a.lea_rip(Reg::Rcx, RelocTarget::Rodata(ro.c1e6), 0);
    a.movsd_xm(Xmm::Xmm1, Reg::Rcx, 0);
    a.mulsd(Xmm::Xmm0, Xmm::Xmm1);
    a.lea_rip(Reg::Rcx, RelocTarget::Rodata(ro.c0_5), 0);
    a.movsd_xm(Xmm::Xmm1, Reg::Rcx, 0);
    a.addsd(Xmm::Xmm0, Xmm::Xmm1);
    a.cvttsd2si(Reg::Rdi, Xmm::Xmm0);
    let six_ok = a.fresh_label();
    a.cmp_ri(Reg::Rdi, 1_000_000);
    a.jcc(Cond::L, six_ok);
    a.mov_ri(Reg::Rdi, 999_999);
    a.bind(six_ok);
    a.call_label(lib.print_u6);
    a.jmp(done);

    a.bind(nan_p);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.nan), 0);
    a.mov_ri(Reg::Rdx, 3);
    a.call_label(lib.write_str);
    a.jmp(done);

    // beyond i64: ±inf or scientific with a loop-computed exponent
    a.bind(huge);
    a.movq_rx(Reg::Rax, Xmm::Xmm0);
    a.mov_rr(Reg::Rcx, Reg::Rax);
    a.shr_ri(Reg::Rcx, 63);
    let hpos = a.fresh_label();
    a.jcc(Cond::E, hpos);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.minus), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.mov_ri(Reg::Rcx, i64::MIN);
    a.xor_rr(Reg::Rax, Reg::Rcx);
    a.movq_xr(Xmm::Xmm0, Reg::Rax);
    a.bind(hpos);
    let sci = a.fresh_label();
    a.movq_rx(Reg::Rax, Xmm::Xmm0);
    a.mov_ri(Reg::Rcx, 0x7FF0_0000_0000_0000u64 as i64);
    a.cmp_rr(Reg::Rax, Reg::Rcx);
    a.jcc(Cond::Ne, sci);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.inf), 0);
    a.mov_ri(Reg::Rdx, 3);
    a.call_label(lib.write_str);
    a.jmp(done);
    a.bind(sci);
    a.mov_ri(Reg::R8, 0);
    a.lea_rip(Reg::Rcx, RelocTarget::Rodata(ro.c10), 0);
    a.movsd_xm(Xmm::Xmm1, Reg::Rcx, 0);
    let norm = a.fresh_label();
    let norm_done = a.fresh_label();
    a.bind(norm);
    a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
    a.jcc(Cond::B, norm_done);
    a.divsd(Xmm::Xmm0, Xmm::Xmm1);
    a.add_ri(Reg::R8, 1);
    a.jmp(norm);
    a.bind(norm_done);
    a.roundsd(Xmm::Xmm1, Xmm::Xmm0, 3);
    a.cvttsd2si(Reg::Rdi, Xmm::Xmm1);
    a.call_label(lib.print_i64);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.dot), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.subsd(Xmm::Xmm0, Xmm::Xmm1);
    a.lea_rip(Reg::Rcx, RelocTarget::Rodata(ro.c1e6), 0);
    a.movsd_xm(Xmm::Xmm1, Reg::Rcx, 0);
    a.mulsd(Xmm::Xmm0, Xmm::Xmm1);
    a.lea_rip(Reg::Rcx, RelocTarget::Rodata(ro.c0_5), 0);
    a.movsd_xm(Xmm::Xmm1, Reg::Rcx, 0);
    a.addsd(Xmm::Xmm0, Xmm::Xmm1);
    a.cvttsd2si(Reg::Rdi, Xmm::Xmm0);
    let sci_ok = a.fresh_label();
    a.cmp_ri(Reg::Rdi, 1_000_000);
    a.jcc(Cond::L, sci_ok);
    a.mov_ri(Reg::Rdi, 999_999);
    a.bind(sci_ok);
    a.call_label(lib.print_u6);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.echar), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    a.mov_rr(Reg::Rdi, Reg::R8);
    a.call_label(lib.print_i64);
    a.jmp(done);

    // "error:" + code with trailing padding trimmed
    a.bind(err_p);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.err_prefix), 0);
    a.mov_ri(Reg::Rdx, 6);
    a.call_label(lib.write_str);
    a.sub_ri(Reg::Rsp, 16);
    a.mov_rr(Reg::Rax, Reg::Rdi);
    for i in 0..4 {
        a.shr_ri(Reg::Rax, 8);
        a.mov_m8_r8(Reg::Rsp, i, Reg::Rax);
    }
    a.mov_ri(Reg::Rdx, 4);
    let trim = a.fresh_label();
    let trimmed = a.fresh_label();
    a.bind(trim);
    a.test_rr(Reg::Rdx, Reg::Rdx);
    a.jcc(Cond::E, trimmed);
    a.mov_rr(Reg::Rcx, Reg::Rsp);
    a.add_rr(Reg::Rcx, Reg::Rdx);
    a.movzx_byte(Reg::Rcx, Reg::Rcx, -1);
    a.cmp_ri(Reg::Rcx, b' ' as i32);
    a.jcc(Cond::Ne, trimmed);
    a.sub_ri(Reg::Rdx, 1);
    a.jmp(trim);
    a.bind(trimmed);
    a.mov_rr(Reg::Rsi, Reg::Rsp);
    a.call_label(lib.write_str);
    a.add_ri(Reg::Rsp, 16);

    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

fn emit_println_val(ctx: &mut EmitCtx, lib: &RuntimeLib, ro: &RoConsts) {
    let mut a = ctx.asm();
    a.bind(lib.println_val);
    let saved = [Reg::Rdx, Reg::Rsi];
    save(&mut a, &saved);
    a.call_label(lib.print_val);
    a.lea_rip(Reg::Rsi, RelocTarget::Rodata(ro.newline), 0);
    a.mov_ri(Reg::Rdx, 1);
    a.call_label(lib.write_str);
    restore(&mut a, &saved);
    a.ret();
}

/// copy rdx bytes from rsi to rdi
fn emit_copy_bytes(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.copy_bytes);
    let saved = [Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi];
    save(&mut a, &saved);
    let lp = a.fresh_label();
    let end = a.fresh_label();
    a.bind(lp);
    a.test_rr(Reg::Rdx, Reg::Rdx);
    a.jcc(Cond::E, end);
    a.movzx_byte(Reg::Rcx, Reg::Rsi, 0);
    a.mov_m8_r8(Reg::Rdi, 0, Reg::Rcx);
    a.add_ri(Reg::Rdi, 1);
    a.add_ri(Reg::Rsi, 1);
    a.sub_ri(Reg::Rdx, 1);
    a.jmp(lp);
    a.bind(end);
    restore(&mut a, &saved);
    a.ret();
}

/// Concatenation allocates a new NUL-terminated string object
fn emit_str_concat(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.str_concat);
    let saved = [
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
    ];
    save(&mut a, &saved);
    a.mov_rr(Reg::Rbx, Reg::Rdi);
    a.mov_rr(Reg::R8, Reg::Rsi);

    a.mov_rm(Reg::Rdi, Reg::Rbx, layout::LEN);
    a.add_rm(Reg::Rdi, Reg::R8, layout::LEN);
    a.add_ri(Reg::Rdi, layout::STR_BYTES + 1);
    a.call_label(lib.alloc);

    a.mov_ri(Reg::Rcx, tag::STRING as i64);
    a.mov_m8_r8(Reg::Rax, 0, Reg::Rcx);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::LEN);
    a.add_rm(Reg::Rcx, Reg::R8, layout::LEN);
    a.mov_mr(Reg::Rax, layout::LEN, Reg::Rcx);

    a.mov_rr(Reg::Rdi, Reg::Rax);
    a.add_ri(Reg::Rdi, layout::STR_BYTES);
    a.mov_rr(Reg::Rsi, Reg::Rbx);
    a.add_ri(Reg::Rsi, layout::STR_BYTES);
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::LEN);
    a.call_label(lib.copy_bytes);

    a.mov_rr(Reg::Rdi, Reg::Rax);
    a.add_ri(Reg::Rdi, layout::STR_BYTES);
    a.add_rm(Reg::Rdi, Reg::Rbx, layout::LEN);
    a.mov_rr(Reg::Rsi, Reg::R8);
    a.add_ri(Reg::Rsi, layout::STR_BYTES);
    a.mov_rm(Reg::Rdx, Reg::R8, layout::LEN);
    a.call_label(lib.copy_bytes);

    a.mov_rr(Reg::Rdx, Reg::Rax);
    a.add_ri(Reg::Rdx, layout::STR_BYTES);
    a.add_rm(Reg::Rdx, Reg::Rax, layout::LEN);
    a.mov_ri(Reg::Rcx, 0);
    a.mov_m8_r8(Reg::Rdx, 0, Reg::Rcx);

    restore(&mut a, &saved);
    a.ret();
}

fn emit_str_eq(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.str_eq);
    let saved = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];
    save(&mut a, &saved);
    let no = a.fresh_label();
    let yes = a.fresh_label();
    let done = a.fresh_label();

    a.mov_rm(Reg::Rcx, Reg::Rdi, layout::LEN);
    a.cmp_rm(Reg::Rcx, Reg::Rsi, layout::LEN);
    a.jcc(Cond::Ne, no);
    a.mov_rr(Reg::R8, Reg::Rdi);
    a.add_ri(Reg::R8, layout::STR_BYTES);
    a.mov_rr(Reg::R9, Reg::Rsi);
    a.add_ri(Reg::R9, layout::STR_BYTES);
    let lp = a.fresh_label();
    a.bind(lp);
    a.test_rr(Reg::Rcx, Reg::Rcx);
    a.jcc(Cond::E, yes);
    a.movzx_byte(Reg::Rax, Reg::R8, 0);
    a.movzx_byte(Reg::Rdx, Reg::R9, 0);
    a.cmp_rr(Reg::Rax, Reg::Rdx);
    a.jcc(Cond::Ne, no);
    a.add_ri(Reg::R8, 1);
    a.add_ri(Reg::R9, 1);
    a.sub_ri(Reg::Rcx, 1);
    a.jmp(lp);
    a.bind(yes);
    a.mov_ri(Reg::Rax, 1);
    a.jmp(done);
    a.bind(no);
    a.mov_ri(Reg::Rax, 0);
    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

/// Content equality for strings, bit equality otherwise
fn emit_val_eq(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.val_eq);
    let bits = a.fresh_label();
    let done = a.fresh_label();

    for r in [Reg::Rdi, Reg::Rsi] {
        a.test_rr(r, r);
        a.jcc(Cond::E, bits);
        a.mov_rr(Reg::Rax, r);
        a.shr_ri(Reg::Rax, 48);
        a.jcc(Cond::Ne, bits);
        a.movzx_byte(Reg::Rax, r, 0);
        a.cmp_ri(Reg::Rax, tag::STRING as i32);
        a.jcc(Cond::Ne, bits);
    }
    a.call_label(lib.str_eq);
    a.jmp(done);
    a.bind(bits);
    a.cmp_rr(Reg::Rdi, Reg::Rsi);
    a.setcc_zx(Cond::E, Reg::Rax);
    a.bind(done);
    a.ret();
}

/// FNV-1a over string bytes, splitmix finalizer for raw bits
fn emit_val_hash(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.val_hash);
    let saved = [Reg::Rcx, Reg::Rdx, Reg::Rsi];
    save(&mut a, &saved);
    let bits = a.fresh_label();
    let done = a.fresh_label();

    a.test_rr(Reg::Rdi, Reg::Rdi);
    a.jcc(Cond::E, bits);
    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.shr_ri(Reg::Rax, 48);
    a.jcc(Cond::Ne, bits);
    a.movzx_byte(Reg::Rax, Reg::Rdi, 0);
    a.cmp_ri(Reg::Rax, tag::STRING as i32);
    a.jcc(Cond::Ne, bits);

    a.mov_ri(Reg::Rax, 0xCBF2_9CE4_8422_2325u64 as i64);
    a.mov_rm(Reg::Rcx, Reg::Rdi, layout::LEN);
    a.mov_rr(Reg::Rsi, Reg::Rdi);
    a.add_ri(Reg::Rsi, layout::STR_BYTES);
    let lp = a.fresh_label();
    a.bind(lp);
    a.test_rr(Reg::Rcx, Reg::Rcx);
    a.jcc(Cond::E, done);
    a.movzx_byte(Reg::Rdx, Reg::Rsi, 0);
    a.xor_rr(Reg::Rax, Reg::Rdx);
    a.mov_ri(Reg::Rdx, 0x0000_0100_0000_01B3);
    a.imul_rr(Reg::Rax, Reg::Rdx);
    a.add_ri(Reg::Rsi, 1);
    a.sub_ri(Reg::Rcx, 1);
    a.jmp(lp);

    a.bind(bits);
    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.mov_rr(Reg::Rcx, Reg::Rax);
    a.shr_ri(Reg::Rcx, 33);
    a.xor_rr(Reg::Rax, Reg::Rcx);
    a.mov_ri(Reg::Rcx, 0xFF51_AFD7_ED55_8CCDu64 as i64);
    a.imul_rr(Reg::Rax, Reg::Rcx);
    a.mov_rr(Reg::Rcx, Reg::Rax);
    a.shr_ri(Reg::Rcx, 33);
    a.xor_rr(Reg::Rax, Reg::Rcx);
    a.mov_ri(Reg::Rcx, 0xC4CE_B9FE_1A85_EC53u64 as i64);
    a.imul_rr(Reg::Rax, Reg::Rcx);
    a.mov_rr(Reg::Rcx, Reg::Rax);
    a.shr_ri(Reg::Rcx, 33);
    a.xor_rr(Reg::Rax, Reg::Rcx);

    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

fn emit_list_new(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.list_new);
    let saved = [Reg::Rcx, Reg::Rdx, Reg::Rdi];
    save(&mut a, &saved);
    a.mov_rr(Reg::Rcx, Reg::Rdi);
    a.shl_ri(Reg::Rdi, 3);
    a.add_ri(Reg::Rdi, layout::LIST_ELEMS);
    a.call_label(lib.alloc);
    a.mov_ri(Reg::Rdx, tag::LIST as i64);
    a.mov_m8_r8(Reg::Rax, 0, Reg::Rdx);
    a.mov_ri(Reg::Rdx, 0);
    a.mov_mr(Reg::Rax, layout::LEN, Reg::Rdx);
    a.mov_mr(Reg::Rax, layout::LIST_CAP, Reg::Rcx);
    restore(&mut a, &saved);
    a.ret();
}

/// Append; regrows by doubling (the old block stays behind in the bump
/// heap) and returns the list pointer, which may have moved
fn emit_list_push(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.list_push);
    let saved = [
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
    ];
    save(&mut a, &saved);
    a.mov_rr(Reg::Rbx, Reg::Rdi);
    a.mov_rr(Reg::R8, Reg::Rsi);

    let append = a.fresh_label();
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::LEN);
    a.cmp_rm(Reg::Rcx, Reg::Rbx, layout::LIST_CAP);
    a.jcc(Cond::L, append);

    // grow
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::LIST_CAP);
    a.shl_ri(Reg::Rdx, 1);
    let have_cap = a.fresh_label();
    a.test_rr(Reg::Rdx, Reg::Rdx);
    a.jcc(Cond::Ne, have_cap);
    a.mov_ri(Reg::Rdx, 4);
    a.bind(have_cap);
    a.mov_rr(Reg::Rdi, Reg::Rdx);
    a.call_label(lib.list_new);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::LEN);
    a.mov_mr(Reg::Rax, layout::LEN, Reg::Rcx);
    a.mov_rr(Reg::Rdi, Reg::Rax);
    a.add_ri(Reg::Rdi, layout::LIST_ELEMS);
    a.mov_rr(Reg::Rsi, Reg::Rbx);
    a.add_ri(Reg::Rsi, layout::LIST_ELEMS);
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::LEN);
    a.shl_ri(Reg::Rdx, 3);
    a.call_label(lib.copy_bytes);
    a.mov_rr(Reg::Rbx, Reg::Rax);

    a.bind(append);
    a.mov_rr(Reg::Rax, Reg::Rbx);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::LEN);
    a.mov_rr(Reg::Rdx, Reg::Rcx);
    a.shl_ri(Reg::Rdx, 3);
    a.add_rr(Reg::Rdx, Reg::Rbx);
    a.mov_mr(Reg::Rdx, layout::LIST_ELEMS, Reg::R8);
    a.add_ri(Reg::Rcx, 1);
    a.mov_mr(Reg::Rbx, layout::LEN, Reg::Rcx);
    restore(&mut a, &saved);
    a.ret();
}

fn emit_builtin_len(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.builtin_len);
    let saved = [Reg::Rcx];
    save(&mut a, &saved);
    let zero = a.fresh_label();
    let take = a.fresh_label();
    let done = a.fresh_label();

    a.test_rr(Reg::Rdi, Reg::Rdi);
    a.jcc(Cond::E, zero);
    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.shr_ri(Reg::Rax, 48);
    a.jcc(Cond::Ne, zero);
    a.movzx_byte(Reg::Rcx, Reg::Rdi, 0);
    a.cmp_ri(Reg::Rcx, tag::STRING as i32);
    a.jcc(Cond::E, take);
    a.cmp_ri(Reg::Rcx, tag::LIST as i32);
    a.jcc(Cond::E, take);
    a.cmp_ri(Reg::Rcx, tag::MAP as i32);
    a.jcc(Cond::E, take);
    a.jmp(zero);

    a.bind(take);
    a.mov_rm(Reg::Rax, Reg::Rdi, layout::LEN);
    a.cvtsi2sd(Xmm::Xmm0, Reg::Rax);
    a.movq_rx(Reg::Rax, Xmm::Xmm0);
    a.jmp(done);
    a.bind(zero);
    a.mov_ri(Reg::Rax, 0);
    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

/// Indexing dispatches on the target's tag; out-of-range and wrong
/// targets produce the `idx ` error value
fn emit_index_get(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.index_get);
    let saved = [Reg::Rcx];
    save(&mut a, &saved);
    let eidx = a.fresh_label();
    let is_map = a.fresh_label();
    let done = a.fresh_label();

    a.test_rr(Reg::Rdi, Reg::Rdi);
    a.jcc(Cond::E, eidx);
    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.shr_ri(Reg::Rax, 48);
    a.jcc(Cond::Ne, eidx);
    a.movzx_byte(Reg::Rax, Reg::Rdi, 0);
    a.cmp_ri(Reg::Rax, tag::MAP as i32);
    a.jcc(Cond::E, is_map);
    a.cmp_ri(Reg::Rax, tag::LIST as i32);
    a.jcc(Cond::Ne, eidx);

    a.movq_xr(Xmm::Xmm0, Reg::Rsi);
    a.cvttsd2si(Reg::Rcx, Xmm::Xmm0);
    a.cmp_rm(Reg::Rcx, Reg::Rdi, layout::LEN);
    a.jcc(Cond::Ae, eidx);
    a.mov_rr(Reg::Rax, Reg::Rcx);
    a.shl_ri(Reg::Rax, 3);
    a.add_rr(Reg::Rax, Reg::Rdi);
    a.mov_rm(Reg::Rax, Reg::Rax, layout::LIST_ELEMS);
    a.jmp(done);

    a.bind(is_map);
    a.call_label(lib.map_get);
    a.jmp(done);
    a.bind(eidx);
    a.mov_ri(Reg::Rax, ERR_IDX as i64);
    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

fn emit_index_set(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.index_set);
    let saved = [Reg::Rcx];
    save(&mut a, &saved);
    let eidx = a.fresh_label();
    let is_map = a.fresh_label();
    let done = a.fresh_label();

    a.test_rr(Reg::Rdi, Reg::Rdi);
    a.jcc(Cond::E, eidx);
    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.shr_ri(Reg::Rax, 48);
    a.jcc(Cond::Ne, eidx);
    a.movzx_byte(Reg::Rax, Reg::Rdi, 0);
    a.cmp_ri(Reg::Rax, tag::MAP as i32);
    a.jcc(Cond::E, is_map);
    a.cmp_ri(Reg::Rax, tag::LIST as i32);
    a.jcc(Cond::Ne, eidx);

    a.movq_xr(Xmm::Xmm0, Reg::Rsi);
    a.cvttsd2si(Reg::Rcx, Xmm::Xmm0);
    a.cmp_rm(Reg::Rcx, Reg::Rdi, layout::LEN);
    a.jcc(Cond::Ae, eidx);
    a.mov_rr(Reg::Rax, Reg::Rcx);
    a.shl_ri(Reg::Rax, 3);
    a.add_rr(Reg::Rax, Reg::Rdi);
    a.mov_mr(Reg::Rax, layout::LIST_ELEMS, Reg::Rdx);
    a.mov_ri(Reg::Rax, 0);
    a.jmp(done);

    a.bind(is_map);
    a.call_label(lib.map_set);
    a.mov_ri(Reg::Rax, 0);
    a.jmp(done);
    a.bind(eidx);
    a.mov_ri(Reg::Rax, ERR_IDX as i64);
    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

fn emit_map_new(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.map_new);
    let saved = [Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi, Reg::R8];
    save(&mut a, &saved);
    a.mov_ri(Reg::Rdi, 48);
    a.call_label(lib.alloc);
    a.mov_rr(Reg::R8, Reg::Rax);
    a.mov_ri(Reg::Rcx, tag::MAP as i64);
    a.mov_m8_r8(Reg::R8, 0, Reg::Rcx);
    a.mov_ri(Reg::Rdx, 0);
    a.mov_mr(Reg::R8, layout::LEN, Reg::Rdx);
    a.mov_ri(Reg::Rdx, 8);
    a.mov_mr(Reg::R8, layout::MAP_CAP, Reg::Rdx);
    // entry pairs, then the open-addressing index (bump memory is fresh,
    // so both start zeroed)
    a.mov_ri(Reg::Rdi, 128);
    a.call_label(lib.alloc);
    a.mov_mr(Reg::R8, layout::MAP_ENTRIES, Reg::Rax);
    a.mov_ri(Reg::Rdi, 128);
    a.call_label(lib.alloc);
    a.mov_mr(Reg::R8, layout::MAP_INDEX, Reg::Rax);
    a.mov_ri(Reg::Rdx, 16);
    a.mov_mr(Reg::R8, layout::MAP_INDEX_CAP, Reg::Rdx);
    a.mov_rr(Reg::Rax, Reg::R8);
    restore(&mut a, &saved);
    a.ret();
}

/// Linear probe for a key: rax = entry index, or -1 when absent
fn emit_map_find(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.map_find);
    let saved = [
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ];
    save(&mut a, &saved);

    a.push_r(Reg::Rdi);
    a.mov_rr(Reg::Rdi, Reg::Rsi);
    a.call_label(lib.val_hash);
    a.pop_r(Reg::Rdi);
    a.mov_rm(Reg::Rcx, Reg::Rdi, layout::MAP_INDEX_CAP);
    a.sub_ri(Reg::Rcx, 1);
    a.mov_rr(Reg::Rbx, Reg::Rax);
    a.and_rr(Reg::Rbx, Reg::Rcx);
    a.mov_rm(Reg::R8, Reg::Rdi, layout::MAP_INDEX);
    a.mov_rm(Reg::R9, Reg::Rdi, layout::MAP_ENTRIES);

    let probe = a.fresh_label();
    let not_found = a.fresh_label();
    let found = a.fresh_label();
    let next = a.fresh_label();
    let done = a.fresh_label();
    a.bind(probe);
    a.mov_rr(Reg::Rdx, Reg::Rbx);
    a.shl_ri(Reg::Rdx, 3);
    a.add_rr(Reg::Rdx, Reg::R8);
    a.mov_rm(Reg::Rdx, Reg::Rdx, 0);
    a.test_rr(Reg::Rdx, Reg::Rdx);
    a.jcc(Cond::E, not_found);
    a.mov_rr(Reg::R10, Reg::Rdx);
    a.sub_ri(Reg::R10, 1);
    a.mov_rr(Reg::R11, Reg::R10);
    a.shl_ri(Reg::R11, 4);
    a.add_rr(Reg::R11, Reg::R9);
    a.mov_rm(Reg::R11, Reg::R11, 0);
    a.push_r(Reg::Rdi);
    a.mov_rr(Reg::Rdi, Reg::R11);
    a.call_label(lib.val_eq);
    a.pop_r(Reg::Rdi);
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::Ne, found);
    a.jmp(next);
    a.bind(next);
    a.add_ri(Reg::Rbx, 1);
    a.and_rr(Reg::Rbx, Reg::Rcx);
    a.jmp(probe);
    a.bind(found);
    a.mov_rr(Reg::Rax, Reg::R10);
    a.jmp(done);
    a.bind(not_found);
    a.mov_ri(Reg::Rax, -1);
    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

fn emit_map_get(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.map_get);
    let saved = [Reg::Rcx];
    save(&mut a, &saved);
    let missing = a.fresh_label();
    let done = a.fresh_label();
    a.call_label(lib.map_find);
    a.cmp_ri(Reg::Rax, -1);
    a.jcc(Cond::E, missing);
    a.mov_rm(Reg::Rcx, Reg::Rdi, layout::MAP_ENTRIES);
    a.shl_ri(Reg::Rax, 4);
    a.add_rr(Reg::Rax, Reg::Rcx);
    a.mov_rm(Reg::Rax, Reg::Rax, 8);
    a.jmp(done);
    a.bind(missing);
    a.mov_ri(Reg::Rax, ERR_KEY as i64);
    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

/// Insert entry number rcx (1-based) for hash rdx into the index at rdi
/// with rsi buckets
fn emit_idx_insert(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.idx_insert);
    let saved = [Reg::Rax, Reg::Rdx, Reg::R8, Reg::R9];
    save(&mut a, &saved);
    a.mov_rr(Reg::R8, Reg::Rsi);
    a.sub_ri(Reg::R8, 1);
    a.and_rr(Reg::Rdx, Reg::R8);
    let probe = a.fresh_label();
    let store = a.fresh_label();
    a.bind(probe);
    a.mov_rr(Reg::R9, Reg::Rdx);
    a.shl_ri(Reg::R9, 3);
    a.add_rr(Reg::R9, Reg::Rdi);
    a.mov_rm(Reg::Rax, Reg::R9, 0);
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::E, store);
    a.add_ri(Reg::Rdx, 1);
    a.and_rr(Reg::Rdx, Reg::R8);
    a.jmp(probe);
    a.bind(store);
    a.mov_mr(Reg::R9, 0, Reg::Rcx);
    restore(&mut a, &saved);
    a.ret();
}

/// Insert or update; keeps insertion order in the entry array and
/// rebuilds the index at 75% load
fn emit_map_set(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.map_set);
    let saved = [
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ];
    save(&mut a, &saved);
    a.mov_rr(Reg::Rbx, Reg::Rdi);
    a.mov_rr(Reg::R10, Reg::Rdx);

    let insert = a.fresh_label();
    let done = a.fresh_label();
    a.call_label(lib.map_find);
    a.cmp_ri(Reg::Rax, -1);
    a.jcc(Cond::E, insert);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::MAP_ENTRIES);
    a.shl_ri(Reg::Rax, 4);
    a.add_rr(Reg::Rax, Reg::Rcx);
    a.mov_mr(Reg::Rax, 8, Reg::R10);
    a.jmp(done);

    a.bind(insert);
    // grow the entry array when full
    let no_grow_entries = a.fresh_label();
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::LEN);
    a.cmp_rm(Reg::Rcx, Reg::Rbx, layout::MAP_CAP);
    a.jcc(Cond::L, no_grow_entries);
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::MAP_CAP);
    a.shl_ri(Reg::Rdx, 1);
    a.mov_rr(Reg::Rdi, Reg::Rdx);
    a.shl_ri(Reg::Rdi, 4);
    a.call_label(lib.alloc);
    a.mov_rr(Reg::R8, Reg::Rax);
    a.mov_rr(Reg::Rdi, Reg::Rax);
    a.mov_rm(Reg::Rsi, Reg::Rbx, layout::MAP_ENTRIES);
    a.push_r(Reg::Rdx);
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::LEN);
    a.shl_ri(Reg::Rdx, 4);
    a.call_label(lib.copy_bytes);
    a.pop_r(Reg::Rdx);
    a.mov_mr(Reg::Rbx, layout::MAP_ENTRIES, Reg::R8);
    a.mov_mr(Reg::Rbx, layout::MAP_CAP, Reg::Rdx);
    a.bind(no_grow_entries);

    // rebuild the index when (len+1)*4 > icap*3
    let no_grow_index = a.fresh_label();
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::LEN);
    a.add_ri(Reg::Rcx, 1);
    a.shl_ri(Reg::Rcx, 2);
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::MAP_INDEX_CAP);
    a.mov_rr(Reg::R8, Reg::Rdx);
    a.shl_ri(Reg::R8, 1);
    a.add_rr(Reg::R8, Reg::Rdx);
    a.cmp_rr(Reg::Rcx, Reg::R8);
    a.jcc(Cond::Le, no_grow_index);
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::MAP_INDEX_CAP);
    a.shl_ri(Reg::Rdx, 1);
    a.mov_mr(Reg::Rbx, layout::MAP_INDEX_CAP, Reg::Rdx);
    a.mov_rr(Reg::Rdi, Reg::Rdx);
    a.shl_ri(Reg::Rdi, 3);
    a.call_label(lib.alloc);
    a.mov_mr(Reg::Rbx, layout::MAP_INDEX, Reg::Rax);
    // rehash every existing entry
    a.mov_ri(Reg::R9, 0);
    let rehash = a.fresh_label();
    a.bind(rehash);
    a.cmp_rm(Reg::R9, Reg::Rbx, layout::LEN);
    a.jcc(Cond::Ge, no_grow_index);
    a.mov_rr(Reg::Rcx, Reg::R9);
    a.shl_ri(Reg::Rcx, 4);
    a.add_rm(Reg::Rcx, Reg::Rbx, layout::MAP_ENTRIES);
    a.mov_rm(Reg::R11, Reg::Rcx, 0);
    a.push_r(Reg::Rdi);
    a.push_r(Reg::Rsi);
    a.push_r(Reg::Rdx);
    a.push_r(Reg::Rcx);
    a.mov_rr(Reg::Rdi, Reg::R11);
    a.call_label(lib.val_hash);
    a.mov_rr(Reg::Rdx, Reg::Rax);
    a.mov_rm(Reg::Rdi, Reg::Rbx, layout::MAP_INDEX);
    a.mov_rm(Reg::Rsi, Reg::Rbx, layout::MAP_INDEX_CAP);
    a.mov_rr(Reg::Rcx, Reg::R9);
    a.add_ri(Reg::Rcx, 1);
    a.call_label(lib.idx_insert);
    a.pop_r(Reg::Rcx);
    a.pop_r(Reg::Rdx);
    a.pop_r(Reg::Rsi);
    a.pop_r(Reg::Rdi);
    a.add_ri(Reg::R9, 1);
    a.jmp(rehash);
    a.bind(no_grow_index);

    // append the entry and index it
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::LEN);
    a.mov_rr(Reg::R8, Reg::Rcx);
    a.shl_ri(Reg::R8, 4);
    a.add_rm(Reg::R8, Reg::Rbx, layout::MAP_ENTRIES);
    a.mov_mr(Reg::R8, 0, Reg::Rsi);
    a.mov_mr(Reg::R8, 8, Reg::R10);
    a.push_r(Reg::Rdi);
    a.push_r(Reg::Rsi);
    a.push_r(Reg::Rdx);
    a.push_r(Reg::Rcx);
    a.mov_rr(Reg::Rdi, Reg::Rsi);
    a.call_label(lib.val_hash);
    a.mov_rr(Reg::Rdx, Reg::Rax);
    a.mov_rm(Reg::Rdi, Reg::Rbx, layout::MAP_INDEX);
    a.mov_rm(Reg::Rsi, Reg::Rbx, layout::MAP_INDEX_CAP);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::LEN);
    a.add_ri(Reg::Rcx, 1);
    a.call_label(lib.idx_insert);
    a.pop_r(Reg::Rcx);
    a.pop_r(Reg::Rdx);
    a.pop_r(Reg::Rsi);
    a.pop_r(Reg::Rdi);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::LEN);
    a.add_ri(Reg::Rcx, 1);
    a.mov_mr(Reg::Rbx, layout::LEN, Reg::Rcx);

    a.bind(done);
    a.mov_rr(Reg::Rax, Reg::Rbx);
    restore(&mut a, &saved);
    a.ret();
}

/// Futex mutex: 0 free, 1 held. Unlock always wakes one waiter.
fn emit_mutex(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.mutex_lock);
    let saved = [Reg::Rax, Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::R10, Reg::R11];
    save(&mut a, &saved);
    let retry = a.fresh_label();
    let got = a.fresh_label();
    a.bind(retry);
    a.xor_r32(Reg::Rax, Reg::Rax);
    a.mov_ri(Reg::Rcx, 1);
    a.lock_cmpxchg_m32(Reg::Rdi, 0, Reg::Rcx);
    a.jcc(Cond::E, got);
    a.mov_ri(Reg::Rax, SYS_FUTEX);
    a.mov_ri(Reg::Rsi, FUTEX_WAIT_PRIVATE);
    a.mov_ri(Reg::Rdx, 1);
    a.mov_ri(Reg::R10, 0);
    a.syscall();
    a.jmp(retry);
    a.bind(got);
    restore(&mut a, &saved);
    a.ret();

    a.bind(lib.mutex_unlock);
    save(&mut a, &saved);
    a.mov_m32_imm(Reg::Rdi, 0, 0);
    a.mov_ri(Reg::Rax, SYS_FUTEX);
    a.mov_ri(Reg::Rsi, FUTEX_WAKE_PRIVATE);
    a.mov_ri(Reg::Rdx, 1);
    a.mov_ri(Reg::R10, 0);
    a.syscall();
    restore(&mut a, &saved);
    a.ret();
}

/// Sequence-count condvars over futexes. `wait` takes the condvar in
/// rdi and the mutex in rsi, releasing and reacquiring around the sleep.
fn emit_cond(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.cond_wait);
    let saved = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R10,
        Reg::R11,
    ];
    save(&mut a, &saved);
    a.mov_r32_m32(Reg::Rdx, Reg::Rdi, 0);
    a.push_r(Reg::Rdi);
    a.mov_rr(Reg::Rdi, Reg::Rsi);
    a.call_label(lib.mutex_unlock);
    a.pop_r(Reg::Rdi);
    a.push_r(Reg::Rsi);
    a.mov_ri(Reg::Rax, SYS_FUTEX);
    a.mov_ri(Reg::Rsi, FUTEX_WAIT_PRIVATE);
    a.mov_ri(Reg::R10, 0);
    a.syscall();
    a.pop_r(Reg::Rsi);
    a.push_r(Reg::Rdi);
    a.mov_rr(Reg::Rdi, Reg::Rsi);
    a.call_label(lib.mutex_lock);
    a.pop_r(Reg::Rdi);
    restore(&mut a, &saved);
    a.ret();

    a.bind(lib.cond_signal);
    save(&mut a, &saved);
    a.mov_ri(Reg::Rcx, 1);
    a.lock_xadd_m32(Reg::Rdi, 0, Reg::Rcx);
    a.mov_ri(Reg::Rax, SYS_FUTEX);
    a.mov_ri(Reg::Rsi, FUTEX_WAKE_PRIVATE);
    a.mov_ri(Reg::Rdx, 1);
    a.mov_ri(Reg::R10, 0);
    a.syscall();
    restore(&mut a, &saved);
    a.ret();

    a.bind(lib.cond_broadcast);
    save(&mut a, &saved);
    a.mov_ri(Reg::Rcx, 1);
    a.lock_xadd_m32(Reg::Rdi, 0, Reg::Rcx);
    a.mov_ri(Reg::Rax, SYS_FUTEX);
    a.mov_ri(Reg::Rsi, FUTEX_WAKE_PRIVATE);
    a.mov_ri(Reg::Rdx, 0x7FFF_FFFF);
    a.mov_ri(Reg::R10, 0);
    a.syscall();
    restore(&mut a, &saved);
    a.ret();
}

fn emit_chan_new(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.chan_new);
    let saved = [Reg::Rcx, Reg::Rdx, Reg::Rdi];
    save(&mut a, &saved);
    a.mov_rr(Reg::Rcx, Reg::Rdi);
    a.mov_rr(Reg::Rdx, Reg::Rcx);
    let have_slots = a.fresh_label();
    a.test_rr(Reg::Rdx, Reg::Rdx);
    a.jcc(Cond::Ne, have_slots);
    a.mov_ri(Reg::Rdx, 1);
    a.bind(have_slots);
    a.mov_rr(Reg::Rdi, Reg::Rdx);
    a.shl_ri(Reg::Rdi, 3);
    a.add_ri(Reg::Rdi, layout::CHAN_BUF);
    a.call_label(lib.alloc);
    a.mov_ri(Reg::Rdx, tag::CHANNEL as i64);
    a.mov_m8_r8(Reg::Rax, 0, Reg::Rdx);
    a.mov_mr(Reg::Rax, layout::CHAN_CAP, Reg::Rcx);
    restore(&mut a, &saved);
    a.ret();
}

/// Send: blocks while full (or, for capacity 0, until the receiver has
/// taken the value). Returns -1.0 once the channel is closed.
fn emit_chan_send(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.chan_send);
    let saved = [
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ];
    save(&mut a, &saved);
    a.mov_rr(Reg::Rbx, Reg::Rdi);
    a.mov_rr(Reg::R8, Reg::Rsi);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.mutex_lock);

    a.mov_rm(Reg::R9, Reg::Rbx, layout::CHAN_CAP);
    let have_slots = a.fresh_label();
    a.test_rr(Reg::R9, Reg::R9);
    a.jcc(Cond::Ne, have_slots);
    a.mov_ri(Reg::R9, 1);
    a.bind(have_slots);

    let check = a.fresh_label();
    let closed = a.fresh_label();
    let put = a.fresh_label();
    let wait_room = a.fresh_label();
    a.bind(check);
    a.mov_rm(Reg::Rax, Reg::Rbx, layout::CHAN_CLOSED);
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::Ne, closed);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::CHAN_COUNT);
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::CHAN_CAP);
    let buffered = a.fresh_label();
    a.test_rr(Reg::Rdx, Reg::Rdx);
    a.jcc(Cond::Ne, buffered);
    // synchronous: one-slot handoff
    a.cmp_ri(Reg::Rcx, 1);
    a.jcc(Cond::L, put);
    a.jmp(wait_room);
    a.bind(buffered);
    a.cmp_rr(Reg::Rcx, Reg::Rdx);
    a.jcc(Cond::L, put);
    a.bind(wait_room);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_COND_SEND);
    a.lea(Reg::Rsi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.cond_wait);
    a.jmp(check);

    a.bind(put);
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::CHAN_WRITE);
    a.mov_rr(Reg::Rax, Reg::Rdx);
    a.shl_ri(Reg::Rax, 3);
    a.add_rr(Reg::Rax, Reg::Rbx);
    a.mov_mr(Reg::Rax, layout::CHAN_BUF, Reg::R8);
    a.add_ri(Reg::Rdx, 1);
    let no_wrap = a.fresh_label();
    a.cmp_rr(Reg::Rdx, Reg::R9);
    a.jcc(Cond::L, no_wrap);
    a.mov_ri(Reg::Rdx, 0);
    a.bind(no_wrap);
    a.mov_mr(Reg::Rbx, layout::CHAN_WRITE, Reg::Rdx);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::CHAN_COUNT);
    a.add_ri(Reg::Rcx, 1);
    a.mov_mr(Reg::Rbx, layout::CHAN_COUNT, Reg::Rcx);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_COND_RECV);
    a.call_label(lib.cond_signal);

    // capacity 0: stay until the receiver empties the slot
    let fin = a.fresh_label();
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::CHAN_CAP);
    a.test_rr(Reg::Rdx, Reg::Rdx);
    a.jcc(Cond::Ne, fin);
    let wait_taken = a.fresh_label();
    a.bind(wait_taken);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::CHAN_COUNT);
    a.test_rr(Reg::Rcx, Reg::Rcx);
    a.jcc(Cond::E, fin);
    a.mov_rm(Reg::Rax, Reg::Rbx, layout::CHAN_CLOSED);
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::Ne, fin);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_COND_SEND);
    a.lea(Reg::Rsi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.cond_wait);
    a.jmp(wait_taken);

    let done = a.fresh_label();
    a.bind(fin);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.mutex_unlock);
    a.mov_ri(Reg::Rax, 0);
    a.jmp(done);
    a.bind(closed);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.mutex_unlock);
    a.mov_ri(Reg::Rax, (-1.0f64).to_bits() as i64);
    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

/// Receive: blocks while empty and open; closed+empty yields 0.0
fn emit_chan_recv(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.chan_recv);
    let saved = [
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ];
    save(&mut a, &saved);
    a.mov_rr(Reg::Rbx, Reg::Rdi);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.mutex_lock);

    a.mov_rm(Reg::R9, Reg::Rbx, layout::CHAN_CAP);
    let have_slots = a.fresh_label();
    a.test_rr(Reg::R9, Reg::R9);
    a.jcc(Cond::Ne, have_slots);
    a.mov_ri(Reg::R9, 1);
    a.bind(have_slots);

    let check = a.fresh_label();
    let take = a.fresh_label();
    let closed_empty = a.fresh_label();
    a.bind(check);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::CHAN_COUNT);
    a.test_rr(Reg::Rcx, Reg::Rcx);
    a.jcc(Cond::Ne, take);
    a.mov_rm(Reg::Rax, Reg::Rbx, layout::CHAN_CLOSED);
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::Ne, closed_empty);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_COND_RECV);
    a.lea(Reg::Rsi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.cond_wait);
    a.jmp(check);

    a.bind(take);
    a.mov_rm(Reg::Rdx, Reg::Rbx, layout::CHAN_READ);
    a.mov_rr(Reg::Rax, Reg::Rdx);
    a.shl_ri(Reg::Rax, 3);
    a.add_rr(Reg::Rax, Reg::Rbx);
    a.mov_rm(Reg::R8, Reg::Rax, layout::CHAN_BUF);
    a.add_ri(Reg::Rdx, 1);
    let no_wrap = a.fresh_label();
    a.cmp_rr(Reg::Rdx, Reg::R9);
    a.jcc(Cond::L, no_wrap);
    a.mov_ri(Reg::Rdx, 0);
    a.bind(no_wrap);
    a.mov_mr(Reg::Rbx, layout::CHAN_READ, Reg::Rdx);
    a.mov_rm(Reg::Rcx, Reg::Rbx, layout::CHAN_COUNT);
    a.sub_ri(Reg::Rcx, 1);
    a.mov_mr(Reg::Rbx, layout::CHAN_COUNT, Reg::Rcx);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_COND_SEND);
    a.call_label(lib.cond_signal);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.mutex_unlock);
    a.mov_rr(Reg::Rax, Reg::R8);
    let done = a.fresh_label();
    a.jmp(done);

    a.bind(closed_empty);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.mutex_unlock);
    a.mov_ri(Reg::Rax, 0);
    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

fn emit_chan_close(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.chan_close);
    let saved = [
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R10,
        Reg::R11,
    ];
    save(&mut a, &saved);
    a.mov_rr(Reg::Rbx, Reg::Rdi);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.mutex_lock);
    a.mov_ri(Reg::Rcx, 1);
    a.mov_mr(Reg::Rbx, layout::CHAN_CLOSED, Reg::Rcx);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_COND_SEND);
    a.call_label(lib.cond_broadcast);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_COND_RECV);
    a.call_label(lib.cond_broadcast);
    a.lea(Reg::Rdi, Reg::Rbx, layout::CHAN_MUTEX);
    a.call_label(lib.mutex_unlock);
    restore(&mut a, &saved);
    a.ret();
}

/// Arenas are whole mmap regions with a 48-byte header; push installs
/// the new arena in the TLS slot, pop restores the parent and unmaps
fn emit_arena(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.arena_push);
    let saved = [
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
    ];
    save(&mut a, &saved);
    a.add_ri(Reg::Rdi, 48 + 4095);
    a.and_ri(Reg::Rdi, -4096);
    a.mov_rr(Reg::Rcx, Reg::Rdi);
    a.mov_ri(Reg::Rax, SYS_MMAP);
    a.mov_rr(Reg::Rsi, Reg::Rcx);
    a.mov_ri(Reg::Rdi, 0);
    a.mov_ri(Reg::Rdx, 3);
    a.mov_ri(Reg::R10, 0x22);
    a.mov_ri(Reg::R8, -1);
    a.mov_ri(Reg::R9, 0);
    a.syscall();
    let ok = a.fresh_label();
    a.mov_ri(Reg::Rdx, -4096);
    a.cmp_rr(Reg::Rax, Reg::Rdx);
    a.jcc(Cond::B, ok);
    a.mov_ri(Reg::Rax, SYS_EXIT_GROUP);
    a.mov_ri(Reg::Rdi, 1);
    a.syscall();
    a.bind(ok);
    a.mov_ri(Reg::Rdx, tag::ARENA as i64);
    a.mov_m8_r8(Reg::Rax, 0, Reg::Rdx);
    a.fs_load(Reg::Rdx, 0);
    a.mov_mr(Reg::Rax, layout::ARENA_PARENT, Reg::Rdx);
    a.mov_rr(Reg::Rdx, Reg::Rax);
    a.add_ri(Reg::Rdx, 48);
    a.mov_mr(Reg::Rax, layout::ARENA_BASE, Reg::Rdx);
    a.mov_rr(Reg::Rdx, Reg::Rcx);
    a.sub_ri(Reg::Rdx, 48);
    a.mov_mr(Reg::Rax, layout::ARENA_SIZE, Reg::Rdx);
    a.mov_ri(Reg::Rdx, 0);
    a.mov_mr(Reg::Rax, layout::ARENA_CURSOR, Reg::Rdx);
    a.fs_store(0, Reg::Rax);
    restore(&mut a, &saved);
    a.ret();

    a.bind(lib.arena_pop);
    let saved_pop = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R10,
        Reg::R11,
    ];
    save(&mut a, &saved_pop);
    a.mov_rm(Reg::Rcx, Reg::Rdi, layout::ARENA_PARENT);
    a.fs_store(0, Reg::Rcx);
    a.mov_rm(Reg::Rsi, Reg::Rdi, layout::ARENA_SIZE);
    a.add_ri(Reg::Rsi, 48);
    a.mov_ri(Reg::Rax, SYS_MUNMAP);
    a.syscall();
    restore(&mut a, &saved_pop);
    a.ret();
}

fn emit_atomics(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();

    a.bind(lib.atomic_add_i64);
    a.mov_rr(Reg::Rax, Reg::Rsi);
    a.lock_xadd(Reg::Rdi, 0, Reg::Rax);
    a.ret();

    a.bind(lib.cas_i64);
    a.mov_rr(Reg::Rax, Reg::Rsi);
    a.lock_cmpxchg(Reg::Rdi, 0, Reg::Rdx);
    a.setcc_zx(Cond::E, Reg::Rax);
    a.ret();

    // f64 accumulate: CAS loop over the bit pattern
    a.bind(lib.atomic_add_f64);
    let saved = [Reg::Rcx];
    save(&mut a, &saved);
    let retry = a.fresh_label();
    a.bind(retry);
    a.mov_rm(Reg::Rax, Reg::Rdi, 0);
    a.movq_xr(Xmm::Xmm0, Reg::Rax);
    a.movq_xr(Xmm::Xmm1, Reg::Rsi);
    a.addsd(Xmm::Xmm0, Xmm::Xmm1);
    a.movq_rx(Reg::Rcx, Xmm::Xmm0);
    a.lock_cmpxchg(Reg::Rdi, 0, Reg::Rcx);
    a.jcc(Cond::Ne, retry);
    a.mov_rr(Reg::Rax, Reg::Rcx);
    restore(&mut a, &saved);
    a.ret();
}

/// Fan a range out over n threads. Worker stacks are 1 MiB mmaps;
/// threads are raw `clone` with CHILD_CLEARTID so the parent can join
/// and unmap. The 4-byte barrier counts parent + workers; the parent
/// futex-waits until it reaches zero.
fn emit_spawn_workers(ctx: &mut EmitCtx, lib: &RuntimeLib) {
    let mut a = ctx.asm();
    a.bind(lib.spawn_workers);
    let saved = [
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];
    save(&mut a, &saved);
    // locals: [rsp]=ctx, [rsp+8]=chunk, [rsp+16]=id, regions at [rsp+32]
    a.sub_ri(Reg::Rsp, 2064);
    a.mov_rr(Reg::Rbx, Reg::Rdi); // n
    a.mov_rr(Reg::R12, Reg::Rsi); // body
    a.mov_rr(Reg::R13, Reg::Rdx); // lo
    a.mov_rr(Reg::R14, Reg::Rcx); // hi
    a.mov_rr(Reg::R15, Reg::R9); // barrier
    a.mov_mr(Reg::Rsp, 0, Reg::R8);

    // clamp n to [1, MAX_WORKERS]
    let min_ok = a.fresh_label();
    a.cmp_ri(Reg::Rbx, 1);
    a.jcc(Cond::Ge, min_ok);
    a.mov_ri(Reg::Rbx, 1);
    a.bind(min_ok);
    let max_ok = a.fresh_label();
    a.cmp_ri(Reg::Rbx, MAX_WORKERS as i32);
    a.jcc(Cond::Le, max_ok);
    a.mov_ri(Reg::Rbx, MAX_WORKERS);
    a.bind(max_ok);

    // empty range: nothing to do, barrier reads zero
    let out = a.fresh_label();
    let nonempty = a.fresh_label();
    a.mov_rr(Reg::Rax, Reg::R14);
    a.sub_rr(Reg::Rax, Reg::R13);
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::G, nonempty);
    a.mov_m32_imm(Reg::R15, 0, 0);
    a.jmp(out);
    a.bind(nonempty);
    a.mov_m32_r32(Reg::R15, 0, Reg::Rbx);
    a.cqo();
    a.idiv_r(Reg::Rbx);
    a.mov_mr(Reg::Rsp, 8, Reg::Rax); // chunk

    a.mov_ri(Reg::Rcx, 1);
    a.mov_mr(Reg::Rsp, 16, Reg::Rcx);
    let spawn_loop = a.fresh_label();
    let parent_run = a.fresh_label();
    let fail = a.fresh_label();
    a.bind(spawn_loop);
    a.mov_rm(Reg::Rcx, Reg::Rsp, 16);
    a.cmp_rr(Reg::Rcx, Reg::Rbx);
    a.jcc(Cond::Ge, parent_run);

    // worker stack region
    a.mov_ri(Reg::Rax, SYS_MMAP);
    a.mov_ri(Reg::Rdi, 0);
    a.mov_ri(Reg::Rsi, WORKER_STACK);
    a.mov_ri(Reg::Rdx, 3);
    a.mov_ri(Reg::R10, 0x22);
    a.mov_ri(Reg::R8, -1);
    a.mov_ri(Reg::R9, 0);
    a.syscall();
    a.mov_ri(Reg::Rdx, -4096);
    a.cmp_rr(Reg::Rax, Reg::Rdx);
    a.jcc(Cond::Ae, fail);
    a.mov_rm(Reg::Rcx, Reg::Rsp, 16);
    a.mov_rr(Reg::Rdx, Reg::Rcx);
    a.sub_ri(Reg::Rdx, 1);
    a.shl_ri(Reg::Rdx, 3);
    a.add_rr(Reg::Rdx, Reg::Rsp);
    a.mov_mr(Reg::Rdx, 32, Reg::Rax);
    // ctid word lives at the region base; nonzero until thread exit
    a.mov_ri(Reg::Rdi, 1);
    a.mov_mr(Reg::Rax, 0, Reg::Rdi);

    // child stack: body, start, end, ctx, region
    a.mov_rr(Reg::Rdx, Reg::Rax);
    a.mov_ri(Reg::Rdi, WORKER_STACK - 64);
    a.add_rr(Reg::Rdx, Reg::Rdi);
    a.mov_mr(Reg::Rdx, 0, Reg::R12);
    // start = lo + chunk*id
    a.mov_rm(Reg::Rsi, Reg::Rsp, 8);
    a.mov_rm(Reg::Rdi, Reg::Rsp, 16);
    a.imul_rr(Reg::Rsi, Reg::Rdi);
    a.add_rr(Reg::Rsi, Reg::R13);
    a.mov_mr(Reg::Rdx, 8, Reg::Rsi);
    // end = (id == n-1) ? hi : lo + chunk*(id+1)
    a.add_ri(Reg::Rdi, 1);
    let mid = a.fresh_label();
    let store_end = a.fresh_label();
    a.cmp_rr(Reg::Rdi, Reg::Rbx);
    a.jcc(Cond::L, mid);
    a.mov_rr(Reg::Rcx, Reg::R14);
    a.jmp(store_end);
    a.bind(mid);
    a.mov_rm(Reg::Rcx, Reg::Rsp, 8);
    a.imul_rr(Reg::Rcx, Reg::Rdi);
    a.add_rr(Reg::Rcx, Reg::R13);
    a.bind(store_end);
    a.mov_mr(Reg::Rdx, 16, Reg::Rcx);
    a.mov_rm(Reg::Rdi, Reg::Rsp, 0);
    a.mov_mr(Reg::Rdx, 24, Reg::Rdi);
    a.mov_mr(Reg::Rdx, 32, Reg::Rax);

    // clone(flags, child_stack, 0, ctid, 0)
    a.mov_rr(Reg::Rsi, Reg::Rdx);
    a.mov_rr(Reg::R10, Reg::Rax);
    a.mov_ri(Reg::Rdi, CLONE_FLAGS);
    a.mov_ri(Reg::Rdx, 0);
    a.mov_ri(Reg::R8, 0);
    a.mov_ri(Reg::Rax, SYS_CLONE);
    a.syscall();
    let parent_cont = a.fresh_label();
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::S, fail);
    a.jcc(Cond::Ne, parent_cont);

    // ---- child ----
    a.mov_rm(Reg::Rbp, Reg::Rsp, 32); // region (child-private copy)
    a.mov_rm(Reg::R12, Reg::Rsp, 0); // body
    a.lea(Reg::Rsi, Reg::Rbp, 8); // TLS block inside the region
    a.mov_ri(Reg::Rdi, ARCH_SET_FS);
    a.mov_ri(Reg::Rax, SYS_ARCH_PRCTL);
    a.syscall();
    a.mov_rm(Reg::Rdi, Reg::Rsp, 8);
    a.mov_rm(Reg::Rsi, Reg::Rsp, 16);
    a.mov_rm(Reg::Rdx, Reg::Rsp, 24);
    a.call_r(Reg::R12);
    // arrive at the barrier; the last one in wakes the parent
    a.mov_ri(Reg::Rcx, -1);
    a.lock_xadd_m32(Reg::R15, 0, Reg::Rcx);
    let no_wake = a.fresh_label();
    a.cmp_ri(Reg::Rcx, 1);
    a.jcc(Cond::Ne, no_wake);
    a.mov_rr(Reg::Rdi, Reg::R15);
    a.mov_ri(Reg::Rax, SYS_FUTEX);
    a.mov_ri(Reg::Rsi, FUTEX_WAKE_PRIVATE);
    a.mov_ri(Reg::Rdx, 0x7FFF_FFFF);
    a.mov_ri(Reg::R10, 0);
    a.syscall();
    a.bind(no_wake);
    a.mov_ri(Reg::Rax, SYS_EXIT);
    a.mov_ri(Reg::Rdi, 0);
    a.syscall();
    // ---- end child ----

    a.bind(parent_cont);
    a.mov_rm(Reg::Rcx, Reg::Rsp, 16);
    a.add_ri(Reg::Rcx, 1);
    a.mov_mr(Reg::Rsp, 16, Reg::Rcx);
    a.jmp(spawn_loop);

    a.bind(parent_run);
    // parent takes chunk 0
    let one_worker = a.fresh_label();
    let have_end = a.fresh_label();
    a.cmp_ri(Reg::Rbx, 1);
    a.jcc(Cond::E, one_worker);
    a.mov_rm(Reg::Rsi, Reg::Rsp, 8);
    a.add_rr(Reg::Rsi, Reg::R13);
    a.jmp(have_end);
    a.bind(one_worker);
    a.mov_rr(Reg::Rsi, Reg::R14);
    a.bind(have_end);
    a.mov_rr(Reg::Rdi, Reg::R13);
    a.mov_rm(Reg::Rdx, Reg::Rsp, 0);
    a.call_r(Reg::R12);
    a.mov_ri(Reg::Rcx, -1);
    a.lock_xadd_m32(Reg::R15, 0, Reg::Rcx);

    // join: futex-wait until the barrier hits zero
    let wait = a.fresh_label();
    let joined = a.fresh_label();
    a.bind(wait);
    a.mov_r32_m32(Reg::Rax, Reg::R15, 0);
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::E, joined);
    a.mov_rr(Reg::Rdx, Reg::Rax);
    a.mov_rr(Reg::Rdi, Reg::R15);
    a.mov_ri(Reg::Rsi, FUTEX_WAIT_PRIVATE);
    a.mov_ri(Reg::R10, 0);
    a.mov_ri(Reg::Rax, SYS_FUTEX);
    a.syscall();
    a.jmp(wait);
    a.bind(joined);

    // reap: wait for each CHILD_CLEARTID word, then unmap the stack
    a.mov_ri(Reg::Rcx, 1);
    a.mov_mr(Reg::Rsp, 16, Reg::Rcx);
    let clean = a.fresh_label();
    a.bind(clean);
    a.mov_rm(Reg::Rcx, Reg::Rsp, 16);
    a.cmp_rr(Reg::Rcx, Reg::Rbx);
    a.jcc(Cond::Ge, out);
    a.mov_rr(Reg::Rdx, Reg::Rcx);
    a.sub_ri(Reg::Rdx, 1);
    a.shl_ri(Reg::Rdx, 3);
    a.add_rr(Reg::Rdx, Reg::Rsp);
    a.mov_rm(Reg::R12, Reg::Rdx, 32);
    let ctid = a.fresh_label();
    let unmap = a.fresh_label();
    a.bind(ctid);
    a.mov_r32_m32(Reg::Rax, Reg::R12, 0);
    a.test_rr(Reg::Rax, Reg::Rax);
    a.jcc(Cond::E, unmap);
    a.mov_rr(Reg::Rdx, Reg::Rax);
    a.mov_rr(Reg::Rdi, Reg::R12);
    a.mov_ri(Reg::Rsi, FUTEX_WAIT_PRIVATE);
    a.mov_ri(Reg::R10, 0);
    a.mov_ri(Reg::Rax, SYS_FUTEX);
    a.syscall();
    a.jmp(ctid);
    a.bind(unmap);
    a.mov_rr(Reg::Rdi, Reg::R12);
    a.mov_ri(Reg::Rsi, WORKER_STACK);
    a.mov_ri(Reg::Rax, SYS_MUNMAP);
    a.syscall();
    a.mov_rm(Reg::Rcx, Reg::Rsp, 16);
    a.add_ri(Reg::Rcx, 1);
    a.mov_mr(Reg::Rsp, 16, Reg::Rcx);
    a.jmp(clean);

    a.bind(out);
    a.add_ri(Reg::Rsp, 2064);
    restore(&mut a, &saved);
    a.ret();

    a.bind(fail);
    a.mov_ri(Reg::Rax, SYS_EXIT_GROUP);
    a.mov_ri(Reg::Rdi, 1);
    a.syscall();
}

/// `.error` accessor: the 4-character code as a string, or ""
fn emit_error_code_str(ctx: &mut EmitCtx, lib: &RuntimeLib, ro: &RoConsts) {
    let mut a = ctx.asm();
    a.bind(lib.error_code_str);
    let saved = [Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi, Reg::R8];
    save(&mut a, &saved);
    let not_err = a.fresh_label();
    let done = a.fresh_label();

    a.mov_rr(Reg::Rax, Reg::Rdi);
    a.mov_ri(Reg::Rcx, ERR_MASK as i64);
    a.and_rr(Reg::Rcx, Reg::Rax);
    a.mov_ri(Reg::Rdx, ERR_BASE as i64);
    a.cmp_rr(Reg::Rcx, Reg::Rdx);
    a.jcc(Cond::Ne, not_err);

    a.sub_ri(Reg::Rsp, 16);
    a.mov_rr(Reg::Rax, Reg::Rdi);
    for i in 0..4 {
        a.shr_ri(Reg::Rax, 8);
        a.mov_m8_r8(Reg::Rsp, i, Reg::Rax);
    }
    // trim the space padding
    a.mov_ri(Reg::Rdx, 4);
    let trim = a.fresh_label();
    let trimmed = a.fresh_label();
    a.bind(trim);
    a.test_rr(Reg::Rdx, Reg::Rdx);
    a.jcc(Cond::E, trimmed);
    a.mov_rr(Reg::Rcx, Reg::Rsp);
    a.add_rr(Reg::Rcx, Reg::Rdx);
    a.movzx_byte(Reg::Rcx, Reg::Rcx, -1);
    a.cmp_ri(Reg::Rcx, b' ' as i32);
    a.jcc(Cond::Ne, trimmed);
    a.sub_ri(Reg::Rdx, 1);
    a.jmp(trim);
    a.bind(trimmed);
    a.mov_rr(Reg::R8, Reg::Rdx);
    a.mov_rr(Reg::Rdi, Reg::R8);
    a.add_ri(Reg::Rdi, layout::STR_BYTES + 1);
    a.call_label(lib.alloc);
    a.mov_ri(Reg::Rcx, tag::STRING as i64);
    a.mov_m8_r8(Reg::Rax, 0, Reg::Rcx);
    a.mov_mr(Reg::Rax, layout::LEN, Reg::R8);
    a.mov_rr(Reg::Rdi, Reg::Rax);
    a.add_ri(Reg::Rdi, layout::STR_BYTES);
    a.lea(Reg::Rsi, Reg::Rsp, 0);
    a.mov_rr(Reg::Rdx, Reg::R8);
    a.call_label(lib.copy_bytes);
    a.mov_rr(Reg::Rdx, Reg::Rax);
    a.add_ri(Reg::Rdx, layout::STR_BYTES);
    a.add_rr(Reg::Rdx, Reg::R8);
    a.mov_ri(Reg::Rcx, 0);
    a.mov_m8_r8(Reg::Rdx, 0, Reg::Rcx);
    a.add_ri(Reg::Rsp, 16);
    a.jmp(done);

    a.bind(not_err);
    a.lea_rip(Reg::Rax, RelocTarget::Rodata(ro.empty_str_obj), 0);
    a.bind(done);
    restore(&mut a, &saved);
    a.ret();
}

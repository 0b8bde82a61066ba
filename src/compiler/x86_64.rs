//! # x86-64 instruction encoder
//!
//! Emits System V AMD64 machine code straight into the `.text` section
//! buffer. Sites whose displacement is unknown at emit time (forward
//! branches, calls, RIP-relative `.rodata` loads) get the fixed
//! `0x12345678` placeholder and a relocation record; the image assembler
//! patches them after layout.

use super::reloc::{
    Label, LabelTable, Reloc, RelocKind, RelocTable, RelocTarget, SymbolId, PLACEHOLDER_REL32,
};
use super::section::SectionBuffer;

/// x86-64 general-purpose registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    /// Return value / scratch
    Rax = 0,
    /// Fourth argument / scratch
    Rcx = 1,
    /// Third argument / scratch
    Rdx = 2,
    /// Callee-saved
    Rbx = 3,
    /// Stack pointer
    Rsp = 4,
    /// Frame pointer
    Rbp = 5,
    /// Second argument
    Rsi = 6,
    /// First argument
    Rdi = 7,
    /// Fifth argument
    R8 = 8,
    /// Sixth argument
    R9 = 9,
    /// Caller-saved scratch
    R10 = 10,
    /// Caller-saved scratch
    R11 = 11,
    /// Callee-saved
    R12 = 12,
    /// Callee-saved
    R13 = 13,
    /// Callee-saved
    R14 = 14,
    /// Callee-saved
    R15 = 15,
}

impl Reg {
    /// Low three encoding bits
    pub fn low(self) -> u8 {
        self as u8 & 7
    }

    /// True for r8-r15 (need a REX extension bit)
    pub fn extended(self) -> bool {
        self as u8 >= 8
    }

    /// Callee-saved under the System V ABI
    pub fn is_callee_saved(self) -> bool {
        matches!(self, Reg::Rbx | Reg::Rbp | Reg::R12 | Reg::R13 | Reg::R14 | Reg::R15)
    }

    /// Integer argument registers in ABI order
    pub const ARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
}

/// SSE registers (all caller-saved under the System V ABI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    /// Low three encoding bits
    pub fn low(self) -> u8 {
        self as u8 & 7
    }

    /// True for xmm8-xmm15
    pub fn extended(self) -> bool {
        self as u8 >= 8
    }

    /// FP argument registers in ABI order
    pub const ARGS: [Xmm; 8] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
        Xmm::Xmm6,
        Xmm::Xmm7,
    ];
}

/// Condition codes for `jcc`/`setcc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Overflow
    O = 0x0,
    /// No overflow
    No = 0x1,
    /// Below (unsigned <)
    B = 0x2,
    /// Above or equal (unsigned >=)
    Ae = 0x3,
    /// Equal
    E = 0x4,
    /// Not equal
    Ne = 0x5,
    /// Below or equal (unsigned <=)
    Be = 0x6,
    /// Above (unsigned >)
    A = 0x7,
    /// Sign
    S = 0x8,
    /// No sign
    Ns = 0x9,
    /// Parity (unordered compare)
    P = 0xA,
    /// No parity
    Np = 0xB,
    /// Less (signed <)
    L = 0xC,
    /// Greater or equal (signed >=)
    Ge = 0xD,
    /// Less or equal (signed <=)
    Le = 0xE,
    /// Greater (signed >)
    G = 0xF,
}

const REX_BASE: u8 = 0x40;
const REX_W: u8 = 0x08;
const REX_R: u8 = 0x04;
const REX_B: u8 = 0x01;

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Mnemonic-level emitter over `.text`, bound to the relocation and
/// label tables so call/branch sites register themselves.
pub struct Asm<'a> {
    text: &'a mut SectionBuffer,
    relocs: &'a mut RelocTable,
    labels: &'a mut LabelTable,
}

impl<'a> Asm<'a> {
    /// Bind an emitter to the output tables
    pub fn new(
        text: &'a mut SectionBuffer,
        relocs: &'a mut RelocTable,
        labels: &'a mut LabelTable,
    ) -> Self {
        Self {
            text,
            relocs,
            labels,
        }
    }

    /// Current `.text` offset
    pub fn offset(&self) -> u64 {
        self.text.current_offset()
    }

    /// Allocate a fresh label
    pub fn fresh_label(&mut self) -> Label {
        self.labels.fresh()
    }

    /// Bind a label to the current offset
    pub fn bind(&mut self, label: Label) {
        self.labels.bind(label, self.text.current_offset());
    }

    // -----------------------------------------------------------------
    // Encoding helpers
    // -----------------------------------------------------------------

    fn byte(&mut self, b: u8) {
        self.text.write_u8(b);
    }

    fn rex_rr(&mut self, w: bool, reg: u8, rm: u8) {
        let mut rex = REX_BASE;
        if w {
            rex |= REX_W;
        }
        if reg >= 8 {
            rex |= REX_R;
        }
        if rm >= 8 {
            rex |= REX_B;
        }
        if rex != REX_BASE || w {
            self.byte(rex);
        }
    }

    /// REX for a memory operand with `base`; always emitted for byte ops
    fn rex_mem(&mut self, w: bool, reg: u8, base: Reg, force: bool) {
        let mut rex = REX_BASE;
        if w {
            rex |= REX_W;
        }
        if reg >= 8 {
            rex |= REX_R;
        }
        if base.extended() {
            rex |= REX_B;
        }
        if rex != REX_BASE || force {
            self.byte(rex);
        }
    }

    /// ModRM (+SIB, +disp) for `[base + disp]`
    fn mem(&mut self, reg: u8, base: Reg, disp: i32) {
        let needs_sib = base.low() == 4; // rsp/r12
        let no_disp_ok = base.low() != 5; // rbp/r13 need an explicit disp
        if disp == 0 && no_disp_ok {
            self.byte(modrm(0b00, reg, base.low()));
            if needs_sib {
                self.byte(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.byte(modrm(0b01, reg, base.low()));
            if needs_sib {
                self.byte(0x24);
            }
            self.byte(disp as i8 as u8);
        } else {
            self.byte(modrm(0b10, reg, base.low()));
            if needs_sib {
                self.byte(0x24);
            }
            self.text.write_u32(disp as u32);
        }
    }

    /// Write a rel32 placeholder and register the relocation
    fn rel32_site(&mut self, kind: RelocKind, target: RelocTarget, addend: i64) {
        let site = self.text.current_offset();
        self.text.write_u32(PLACEHOLDER_REL32);
        self.relocs.push(Reloc {
            text_offset: site,
            kind,
            target,
            addend,
        });
    }

    // -----------------------------------------------------------------
    // Moves
    // -----------------------------------------------------------------

    /// `mov dst, src`
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_rr(true, src as u8, dst as u8);
        self.byte(0x89);
        self.byte(modrm(0b11, src.low(), dst.low()));
    }

    /// `mov dst, imm` (sign-extended imm32 when it fits, else movabs)
    pub fn mov_ri(&mut self, dst: Reg, imm: i64) {
        if i32::try_from(imm).is_ok() {
            self.rex_rr(true, 0, dst as u8);
            self.byte(0xC7);
            self.byte(modrm(0b11, 0, dst.low()));
            self.text.write_u32(imm as i32 as u32);
        } else {
            let mut rex = REX_BASE | REX_W;
            if dst.extended() {
                rex |= REX_B;
            }
            self.byte(rex);
            self.byte(0xB8 + dst.low());
            self.text.write_u64(imm as u64);
        }
    }

    /// `mov dst, [base + disp]`
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_mem(true, dst as u8, base, false);
        self.byte(0x8B);
        self.mem(dst as u8, base, disp);
    }

    /// `mov [base + disp], src`
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_mem(true, src as u8, base, false);
        self.byte(0x89);
        self.mem(src as u8, base, disp);
    }

    /// `mov dword [base + disp], src32`
    pub fn mov_m32_r32(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_mem(false, src as u8, base, false);
        self.byte(0x89);
        self.mem(src as u8, base, disp);
    }

    /// `mov dst32, dword [base + disp]` (zero-extends)
    pub fn mov_r32_m32(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_mem(false, dst as u8, base, false);
        self.byte(0x8B);
        self.mem(dst as u8, base, disp);
    }

    /// `mov dword [base + disp], imm32`
    pub fn mov_m32_imm(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex_mem(false, 0, base, false);
        self.byte(0xC7);
        self.mem(0, base, disp);
        self.text.write_u32(imm as u32);
    }

    /// `movzx dst, byte [base + disp]`
    pub fn movzx_byte(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_mem(true, dst as u8, base, false);
        self.byte(0x0F);
        self.byte(0xB6);
        self.mem(dst as u8, base, disp);
    }

    /// `mov byte [base + disp], src8` (REX always emitted so sil/dil encode)
    pub fn mov_m8_r8(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_mem(false, src as u8, base, true);
        self.byte(0x88);
        self.mem(src as u8, base, disp);
    }

    /// `movzx dst, src8` (register form)
    pub fn movzx_r8(&mut self, dst: Reg, src: Reg) {
        self.rex_rr(true, dst as u8, src as u8);
        self.byte(0x0F);
        self.byte(0xB6);
        self.byte(modrm(0b11, dst.low(), src.low()));
    }

    /// `lea dst, [base + disp]`
    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_mem(true, dst as u8, base, false);
        self.byte(0x8D);
        self.mem(dst as u8, base, disp);
    }

    /// `lea dst, [rip + target]` with a PC_REL32 relocation
    pub fn lea_rip(&mut self, dst: Reg, target: RelocTarget, addend: i64) {
        self.rex_rr(true, dst as u8, 0);
        self.byte(0x8D);
        self.byte(modrm(0b00, dst.low(), 0b101));
        self.rel32_site(RelocKind::PcRel32, target, addend);
    }

    // -----------------------------------------------------------------
    // Integer ALU
    // -----------------------------------------------------------------

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex_rr(true, src as u8, dst as u8);
        self.byte(opcode);
        self.byte(modrm(0b11, src.low(), dst.low()));
    }

    /// `add dst, src`
    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    /// `sub dst, src`
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, dst, src);
    }

    /// `and dst, src`
    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, dst, src);
    }

    /// `or dst, src`
    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, dst, src);
    }

    /// `xor dst, src`
    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, dst, src);
    }

    /// `xor dst32, src32` (zeroes the full register, shorter encoding)
    pub fn xor_r32(&mut self, dst: Reg, src: Reg) {
        self.rex_rr(false, src as u8, dst as u8);
        self.byte(0x31);
        self.byte(modrm(0b11, src.low(), dst.low()));
    }

    /// `cmp dst, src`
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x39, dst, src);
    }

    /// `test dst, src`
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x85, dst, src);
    }

    fn alu_ri(&mut self, ext: u8, dst: Reg, imm: i32) {
        self.rex_rr(true, 0, dst as u8);
        if (-128..=127).contains(&imm) {
            self.byte(0x83);
            self.byte(modrm(0b11, ext, dst.low()));
            self.byte(imm as i8 as u8);
        } else {
            self.byte(0x81);
            self.byte(modrm(0b11, ext, dst.low()));
            self.text.write_u32(imm as u32);
        }
    }

    /// `add dst, imm`
    pub fn add_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(0, dst, imm);
    }

    /// `or dst, imm`
    pub fn or_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(1, dst, imm);
    }

    /// `and dst, imm`
    pub fn and_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(4, dst, imm);
    }

    /// `sub dst, imm`
    pub fn sub_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(5, dst, imm);
    }

    /// `xor dst, imm`
    pub fn xor_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(6, dst, imm);
    }

    /// `cmp dst, imm`
    pub fn cmp_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(7, dst, imm);
    }

    /// `add dst, [base + disp]`
    pub fn add_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_mem(true, dst as u8, base, false);
        self.byte(0x03);
        self.mem(dst as u8, base, disp);
    }

    /// `cmp dst, [base + disp]`
    pub fn cmp_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_mem(true, dst as u8, base, false);
        self.byte(0x3B);
        self.mem(dst as u8, base, disp);
    }

    /// `imul dst, src`
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_rr(true, dst as u8, src as u8);
        self.byte(0x0F);
        self.byte(0xAF);
        self.byte(modrm(0b11, dst.low(), src.low()));
    }

    /// `cqo` (sign-extend rax into rdx:rax)
    pub fn cqo(&mut self) {
        self.byte(0x48);
        self.byte(0x99);
    }

    fn grp3(&mut self, ext: u8, r: Reg) {
        self.rex_rr(true, 0, r as u8);
        self.byte(0xF7);
        self.byte(modrm(0b11, ext, r.low()));
    }

    /// `idiv r` (rdx:rax / r)
    pub fn idiv_r(&mut self, r: Reg) {
        self.grp3(7, r);
    }

    /// `div r` (unsigned)
    pub fn div_r(&mut self, r: Reg) {
        self.grp3(6, r);
    }

    /// `neg r`
    pub fn neg_r(&mut self, r: Reg) {
        self.grp3(3, r);
    }

    /// `not r`
    pub fn not_r(&mut self, r: Reg) {
        self.grp3(2, r);
    }

    /// `mul r` (unsigned rdx:rax = rax * r)
    pub fn mul_r(&mut self, r: Reg) {
        self.grp3(4, r);
    }

    fn shift_ri(&mut self, ext: u8, r: Reg, imm: u8) {
        self.rex_rr(true, 0, r as u8);
        self.byte(0xC1);
        self.byte(modrm(0b11, ext, r.low()));
        self.byte(imm);
    }

    fn shift_cl(&mut self, ext: u8, r: Reg) {
        self.rex_rr(true, 0, r as u8);
        self.byte(0xD3);
        self.byte(modrm(0b11, ext, r.low()));
    }

    /// `shl r, imm`
    pub fn shl_ri(&mut self, r: Reg, imm: u8) {
        self.shift_ri(4, r, imm);
    }

    /// `shr r, imm`
    pub fn shr_ri(&mut self, r: Reg, imm: u8) {
        self.shift_ri(5, r, imm);
    }

    /// `sar r, imm`
    pub fn sar_ri(&mut self, r: Reg, imm: u8) {
        self.shift_ri(7, r, imm);
    }

    /// `rol r, imm`
    pub fn rol_ri(&mut self, r: Reg, imm: u8) {
        self.shift_ri(0, r, imm);
    }

    /// `ror r, imm`
    pub fn ror_ri(&mut self, r: Reg, imm: u8) {
        self.shift_ri(1, r, imm);
    }

    /// `shl r, cl`
    pub fn shl_cl(&mut self, r: Reg) {
        self.shift_cl(4, r);
    }

    /// `shr r, cl`
    pub fn shr_cl(&mut self, r: Reg) {
        self.shift_cl(5, r);
    }

    /// `sar r, cl`
    pub fn sar_cl(&mut self, r: Reg) {
        self.shift_cl(7, r);
    }

    // -----------------------------------------------------------------
    // Stack, branches, calls
    // -----------------------------------------------------------------

    /// `push r`
    pub fn push_r(&mut self, r: Reg) {
        if r.extended() {
            self.byte(REX_BASE | REX_B);
        }
        self.byte(0x50 + r.low());
    }

    /// `pop r`
    pub fn pop_r(&mut self, r: Reg) {
        if r.extended() {
            self.byte(REX_BASE | REX_B);
        }
        self.byte(0x58 + r.low());
    }

    /// `jcc label` (rel32 with placeholder + relocation)
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.byte(0x0F);
        self.byte(0x80 + cond as u8);
        self.rel32_site(RelocKind::PcRel32, RelocTarget::Label(label), 0);
    }

    /// `jmp label`
    pub fn jmp(&mut self, label: Label) {
        self.byte(0xE9);
        self.rel32_site(RelocKind::PcRel32, RelocTarget::Label(label), 0);
    }

    /// `jmp r`
    pub fn jmp_r(&mut self, r: Reg) {
        if r.extended() {
            self.byte(REX_BASE | REX_B);
        }
        self.byte(0xFF);
        self.byte(modrm(0b11, 4, r.low()));
    }

    /// `call label` (CALL32 placeholder + relocation)
    pub fn call_label(&mut self, label: Label) {
        self.byte(0xE8);
        self.rel32_site(RelocKind::Call32, RelocTarget::Label(label), 0);
    }

    /// `call symbol`: user function or PLT stub, decided at layout
    pub fn call_symbol(&mut self, sym: SymbolId) {
        self.byte(0xE8);
        self.rel32_site(RelocKind::Call32, RelocTarget::Symbol(sym), 0);
    }

    /// `call r`
    pub fn call_r(&mut self, r: Reg) {
        if r.extended() {
            self.byte(REX_BASE | REX_B);
        }
        self.byte(0xFF);
        self.byte(modrm(0b11, 2, r.low()));
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.byte(0xC3);
    }

    /// `syscall`
    pub fn syscall(&mut self) {
        self.byte(0x0F);
        self.byte(0x05);
    }

    /// `pause` (spin-loop hint)
    pub fn pause(&mut self) {
        self.byte(0xF3);
        self.byte(0x90);
    }

    /// `mov dst, fs:[disp]`, the reserved TLS slot (current arena)
    pub fn fs_load(&mut self, dst: Reg, disp: u32) {
        self.byte(0x64);
        self.rex_rr(true, dst as u8, 0);
        self.byte(0x8B);
        self.byte(modrm(0b00, dst.low(), 0b100));
        self.byte(0x25); // SIB: [disp32], no base, no index
        self.text.write_u32(disp);
    }

    /// `mov fs:[disp], src`
    pub fn fs_store(&mut self, disp: u32, src: Reg) {
        self.byte(0x64);
        self.rex_rr(true, src as u8, 0);
        self.byte(0x89);
        self.byte(modrm(0b00, src.low(), 0b100));
        self.byte(0x25);
        self.text.write_u32(disp);
    }

    /// `setcc dst8` followed by `movzx dst, dst8`
    pub fn setcc_zx(&mut self, cond: Cond, dst: Reg) {
        // setcc needs a REX prefix for sil/dil/spl/bpl and r8b-r15b
        let rm = dst as u8;
        if rm >= 4 {
            let mut rex = REX_BASE;
            if dst.extended() {
                rex |= REX_B;
            }
            self.byte(rex);
        }
        self.byte(0x0F);
        self.byte(0x90 + cond as u8);
        self.byte(modrm(0b11, 0, dst.low()));
        self.movzx_r8(dst, dst);
    }

    // -----------------------------------------------------------------
    // Atomics
    // -----------------------------------------------------------------

    /// `lock xadd [base + disp], src` (64-bit fetch-and-add)
    pub fn lock_xadd(&mut self, base: Reg, disp: i32, src: Reg) {
        self.byte(0xF0);
        self.rex_mem(true, src as u8, base, false);
        self.byte(0x0F);
        self.byte(0xC1);
        self.mem(src as u8, base, disp);
    }

    /// `lock xadd dword [base + disp], src32`
    pub fn lock_xadd_m32(&mut self, base: Reg, disp: i32, src: Reg) {
        self.byte(0xF0);
        self.rex_mem(false, src as u8, base, false);
        self.byte(0x0F);
        self.byte(0xC1);
        self.mem(src as u8, base, disp);
    }

    /// `lock cmpxchg [base + disp], src` (compares with rax)
    pub fn lock_cmpxchg(&mut self, base: Reg, disp: i32, src: Reg) {
        self.byte(0xF0);
        self.rex_mem(true, src as u8, base, false);
        self.byte(0x0F);
        self.byte(0xB1);
        self.mem(src as u8, base, disp);
    }

    /// `lock cmpxchg dword [base + disp], src32` (compares with eax)
    pub fn lock_cmpxchg_m32(&mut self, base: Reg, disp: i32, src: Reg) {
        self.byte(0xF0);
        self.rex_mem(false, src as u8, base, false);
        self.byte(0x0F);
        self.byte(0xB1);
        self.mem(src as u8, base, disp);
    }

    // -----------------------------------------------------------------
    // Scalar SSE2
    // -----------------------------------------------------------------

    fn sse_rr(&mut self, prefix: u8, w: bool, opcode: u8, reg: u8, rm: u8) {
        self.byte(prefix);
        let mut rex = REX_BASE;
        if w {
            rex |= REX_W;
        }
        if reg >= 8 {
            rex |= REX_R;
        }
        if rm >= 8 {
            rex |= REX_B;
        }
        if rex != REX_BASE || w {
            self.byte(rex);
        }
        self.byte(0x0F);
        self.byte(opcode);
        self.byte(modrm(0b11, reg & 7, rm & 7));
    }

    /// `movq xmm, r64`
    pub fn movq_xr(&mut self, dst: Xmm, src: Reg) {
        self.sse_rr(0x66, true, 0x6E, dst as u8, src as u8);
    }

    /// `movq r64, xmm`
    pub fn movq_rx(&mut self, dst: Reg, src: Xmm) {
        self.sse_rr(0x66, true, 0x7E, src as u8, dst as u8);
    }

    /// `movsd dst, src` (register form)
    pub fn movsd_xx(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, false, 0x10, dst as u8, src as u8);
    }

    /// `movsd xmm, [base + disp]`
    pub fn movsd_xm(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.byte(0xF2);
        self.rex_mem(false, dst as u8, base, false);
        self.byte(0x0F);
        self.byte(0x10);
        self.mem(dst as u8, base, disp);
    }

    /// `movsd [base + disp], xmm`
    pub fn movsd_mx(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.byte(0xF2);
        self.rex_mem(false, src as u8, base, false);
        self.byte(0x0F);
        self.byte(0x11);
        self.mem(src as u8, base, disp);
    }

    /// `addsd dst, src`
    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, false, 0x58, dst as u8, src as u8);
    }

    /// `subsd dst, src`
    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, false, 0x5C, dst as u8, src as u8);
    }

    /// `mulsd dst, src`
    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, false, 0x59, dst as u8, src as u8);
    }

    /// `divsd dst, src`
    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, false, 0x5E, dst as u8, src as u8);
    }

    /// `sqrtsd dst, src`
    pub fn sqrtsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, false, 0x51, dst as u8, src as u8);
    }

    /// `ucomisd a, b`
    pub fn ucomisd(&mut self, a: Xmm, b: Xmm) {
        self.sse_rr(0x66, false, 0x2E, a as u8, b as u8);
    }

    /// `cvtsi2sd xmm, r64`
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg) {
        self.sse_rr(0xF2, true, 0x2A, dst as u8, src as u8);
    }

    /// `cvttsd2si r64, xmm` (truncating)
    pub fn cvttsd2si(&mut self, dst: Reg, src: Xmm) {
        self.sse_rr(0xF2, true, 0x2C, dst as u8, src as u8);
    }

    /// `roundsd dst, src, mode` (0=nearest, 1=floor, 2=ceil, 3=trunc)
    pub fn roundsd(&mut self, dst: Xmm, src: Xmm, mode: u8) {
        self.byte(0x66);
        let mut rex = REX_BASE;
        if (dst as u8) >= 8 {
            rex |= REX_R;
        }
        if (src as u8) >= 8 {
            rex |= REX_B;
        }
        if rex != REX_BASE {
            self.byte(rex);
        }
        self.byte(0x0F);
        self.byte(0x3A);
        self.byte(0x0B);
        self.byte(modrm(0b11, dst.low(), src.low()));
        self.byte(mode);
    }

    /// `xorps dst, src` (cheap xmm zeroing when dst == src)
    pub fn xorps(&mut self, dst: Xmm, src: Xmm) {
        let mut rex = REX_BASE;
        if (dst as u8) >= 8 {
            rex |= REX_R;
        }
        if (src as u8) >= 8 {
            rex |= REX_B;
        }
        if rex != REX_BASE {
            self.byte(rex);
        }
        self.byte(0x0F);
        self.byte(0x57);
        self.byte(modrm(0b11, dst.low(), src.low()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut Asm)) -> Vec<u8> {
        let mut text = SectionBuffer::new();
        let mut relocs = RelocTable::new();
        let mut labels = LabelTable::new();
        let mut asm = Asm::new(&mut text, &mut relocs, &mut labels);
        f(&mut asm);
        text.as_slice().to_vec()
    }

    #[test]
    fn mov_register_forms() {
        assert_eq!(emit(|a| a.mov_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
        assert_eq!(emit(|a| a.mov_rr(Reg::R8, Reg::Rdi)), [0x49, 0x89, 0xF8]);
        assert_eq!(
            emit(|a| a.mov_ri(Reg::Rax, 42)),
            [0x48, 0xC7, 0xC0, 0x2A, 0, 0, 0]
        );
        // movabs for wide immediates
        let bytes = emit(|a| a.mov_ri(Reg::Rax, 0x1122334455667788));
        assert_eq!(&bytes[..2], &[0x48, 0xB8]);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn memory_operands() {
        assert_eq!(
            emit(|a| a.mov_rm(Reg::Rax, Reg::Rbp, -8)),
            [0x48, 0x8B, 0x45, 0xF8]
        );
        assert_eq!(
            emit(|a| a.mov_mr(Reg::Rsp, 8, Reg::Rcx)),
            [0x48, 0x89, 0x4C, 0x24, 0x08]
        );
        // rbp with zero displacement still encodes disp8
        assert_eq!(
            emit(|a| a.mov_rm(Reg::Rax, Reg::Rbp, 0)),
            [0x48, 0x8B, 0x45, 0x00]
        );
        // r13 shares the rbp quirk
        assert_eq!(
            emit(|a| a.mov_rm(Reg::Rax, Reg::R13, 0)),
            [0x49, 0x8B, 0x45, 0x00]
        );
        // large displacement gets the disp32 form
        assert_eq!(
            emit(|a| a.mov_rm(Reg::Rax, Reg::Rdi, 0x1000)),
            [0x48, 0x8B, 0x87, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn push_pop_rex() {
        assert_eq!(emit(|a| a.push_r(Reg::Rbx)), [0x53]);
        assert_eq!(emit(|a| a.push_r(Reg::R12)), [0x41, 0x54]);
        assert_eq!(emit(|a| a.pop_r(Reg::R15)), [0x41, 0x5F]);
    }

    #[test]
    fn alu_forms() {
        assert_eq!(emit(|a| a.add_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x01, 0xD8]);
        assert_eq!(emit(|a| a.cmp_ri(Reg::Rax, 0)), [0x48, 0x83, 0xF8, 0x00]);
        assert_eq!(emit(|a| a.test_rr(Reg::Rax, Reg::Rax)), [0x48, 0x85, 0xC0]);
        assert_eq!(
            emit(|a| a.imul_rr(Reg::Rax, Reg::Rbx)),
            [0x48, 0x0F, 0xAF, 0xC3]
        );
        assert_eq!(emit(|a| a.idiv_r(Reg::Rbx)), [0x48, 0xF7, 0xFB]);
        assert_eq!(emit(|a| a.shl_ri(Reg::Rax, 3)), [0x48, 0xC1, 0xE0, 0x03]);
        assert_eq!(emit(|a| a.and_ri(Reg::Rsp, -16)), [0x48, 0x83, 0xE4, 0xF0]);
    }

    #[test]
    fn sse_scalar_forms() {
        assert_eq!(
            emit(|a| a.addsd(Xmm::Xmm0, Xmm::Xmm1)),
            [0xF2, 0x0F, 0x58, 0xC1]
        );
        assert_eq!(
            emit(|a| a.movq_xr(Xmm::Xmm0, Reg::Rax)),
            [0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
        assert_eq!(
            emit(|a| a.movq_rx(Reg::Rax, Xmm::Xmm0)),
            [0x66, 0x48, 0x0F, 0x7E, 0xC0]
        );
        assert_eq!(
            emit(|a| a.cvttsd2si(Reg::Rax, Xmm::Xmm0)),
            [0xF2, 0x48, 0x0F, 0x2C, 0xC0]
        );
        assert_eq!(
            emit(|a| a.ucomisd(Xmm::Xmm0, Xmm::Xmm1)),
            [0x66, 0x0F, 0x2E, 0xC1]
        );
        assert_eq!(
            emit(|a| a.roundsd(Xmm::Xmm0, Xmm::Xmm1, 3)),
            [0x66, 0x0F, 0x3A, 0x0B, 0xC1, 0x03]
        );
    }

    #[test]
    fn atomic_forms() {
        assert_eq!(
            emit(|a| a.lock_xadd(Reg::Rdi, 0, Reg::Rax)),
            [0xF0, 0x48, 0x0F, 0xC1, 0x07]
        );
        assert_eq!(
            emit(|a| a.lock_cmpxchg(Reg::Rdi, 0, Reg::Rsi)),
            [0xF0, 0x48, 0x0F, 0xB1, 0x37]
        );
    }

    #[test]
    fn misc_forms() {
        assert_eq!(emit(|a| a.syscall()), [0x0F, 0x05]);
        assert_eq!(emit(|a| a.ret()), [0xC3]);
        assert_eq!(emit(|a| a.call_r(Reg::Rax)), [0xFF, 0xD0]);
        assert_eq!(emit(|a| a.cqo()), [0x48, 0x99]);
        // sete al; movzx rax, al
        assert_eq!(
            emit(|a| a.setcc_zx(Cond::E, Reg::Rax)),
            [0x0F, 0x94, 0xC0, 0x48, 0x0F, 0xB6, 0xC0]
        );
    }

    #[test]
    fn branch_sites_register_relocations() {
        let mut text = SectionBuffer::new();
        let mut relocs = RelocTable::new();
        let mut labels = LabelTable::new();
        let mut asm = Asm::new(&mut text, &mut relocs, &mut labels);
        let end = asm.fresh_label();
        asm.jcc(Cond::Ne, end);
        asm.jmp(end);
        asm.bind(end);
        assert_eq!(relocs.len(), 2);
        // je rel32: 0F 85 78 56 34 12 (placeholder)
        assert_eq!(
            &text.as_slice()[..6],
            &[0x0F, 0x85, 0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(labels.offset_of(end), Some(11));
    }

    #[test]
    fn rip_relative_lea_records_site() {
        let mut text = SectionBuffer::new();
        let mut relocs = RelocTable::new();
        let mut labels = LabelTable::new();
        let mut asm = Asm::new(&mut text, &mut relocs, &mut labels);
        asm.lea_rip(Reg::Rax, RelocTarget::Rodata(0x40), 16);
        assert_eq!(
            text.as_slice(),
            &[0x48, 0x8D, 0x05, 0x78, 0x56, 0x34, 0x12]
        );
        let reloc = relocs.iter().next().unwrap();
        assert_eq!(reloc.text_offset, 3);
        assert_eq!(reloc.kind, RelocKind::PcRel32);
        assert_eq!(reloc.addend, 16);
    }
}

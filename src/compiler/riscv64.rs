//! # RISC-V 64 instruction encoder (stub)
//!
//! Encodes the RV64IM basics; everything beyond the floor reports
//! `Unsupported`. `jal` to unresolved targets writes the `0x0000006F`
//! placeholder and records a `RISCV_JAL21` relocation.

use super::reloc::{Reloc, RelocKind, RelocTable, RelocTarget, SymbolId};
use super::section::SectionBuffer;
use crate::error::{Error, Result};

/// RISC-V integer register number (x0-x31)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RvReg(pub u8);

/// Hard-wired zero
pub const ZERO: RvReg = RvReg(0);
/// Return address
pub const RA: RvReg = RvReg(1);
/// Stack pointer
pub const SP: RvReg = RvReg(2);

impl RvReg {
    /// Callee-saved (s0-s11)
    pub fn is_callee_saved(self) -> bool {
        matches!(self.0, 8 | 9 | 18..=27)
    }
}

fn r_type(funct7: u32, rs2: RvReg, rs1: RvReg, funct3: u32, rd: RvReg, opcode: u32) -> u32 {
    funct7 << 25 | (rs2.0 as u32) << 20 | (rs1.0 as u32) << 15 | funct3 << 12 | (rd.0 as u32) << 7
        | opcode
}

fn i_type(imm: i32, rs1: RvReg, funct3: u32, rd: RvReg, opcode: u32) -> u32 {
    ((imm as u32) & 0xFFF) << 20 | (rs1.0 as u32) << 15 | funct3 << 12 | (rd.0 as u32) << 7
        | opcode
}

fn s_type(imm: i32, rs2: RvReg, rs1: RvReg, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    (imm >> 5 & 0x7F) << 25
        | (rs2.0 as u32) << 20
        | (rs1.0 as u32) << 15
        | funct3 << 12
        | (imm & 0x1F) << 7
        | opcode
}

fn b_type(imm: i32, rs2: RvReg, rs1: RvReg, funct3: u32) -> u32 {
    let imm = imm as u32;
    (imm >> 12 & 1) << 31
        | (imm >> 5 & 0x3F) << 25
        | (rs2.0 as u32) << 20
        | (rs1.0 as u32) << 15
        | funct3 << 12
        | (imm >> 1 & 0xF) << 8
        | (imm >> 11 & 1) << 7
        | 0x63
}

/// Word-at-a-time emitter for RV64
pub struct AsmRv<'a> {
    text: &'a mut SectionBuffer,
    relocs: &'a mut RelocTable,
}

impl<'a> AsmRv<'a> {
    /// Bind an emitter to the output tables
    pub fn new(text: &'a mut SectionBuffer, relocs: &'a mut RelocTable) -> Self {
        Self { text, relocs }
    }

    fn word(&mut self, w: u32) {
        self.text.write_u32(w);
    }

    /// `addi rd, rs1, imm`
    pub fn addi(&mut self, rd: RvReg, rs1: RvReg, imm: i32) -> Result<()> {
        if !(-2048..=2047).contains(&imm) {
            return Err(Error::unsupported("riscv64: addi immediate out of range"));
        }
        self.word(i_type(imm, rs1, 0, rd, 0x13));
        Ok(())
    }

    /// `mv rd, rs` (`addi rd, rs, 0`)
    pub fn mv(&mut self, rd: RvReg, rs: RvReg) {
        self.word(i_type(0, rs, 0, rd, 0x13));
    }

    /// `lui rd, imm20`
    pub fn lui(&mut self, rd: RvReg, imm20: u32) {
        self.word(imm20 << 12 | (rd.0 as u32) << 7 | 0x37);
    }

    /// `ld rd, imm(rs1)`
    pub fn ld(&mut self, rd: RvReg, rs1: RvReg, imm: i32) -> Result<()> {
        if !(-2048..=2047).contains(&imm) {
            return Err(Error::unsupported("riscv64: load offset out of range"));
        }
        self.word(i_type(imm, rs1, 3, rd, 0x03));
        Ok(())
    }

    /// `sd rs2, imm(rs1)`
    pub fn sd(&mut self, rs2: RvReg, rs1: RvReg, imm: i32) -> Result<()> {
        if !(-2048..=2047).contains(&imm) {
            return Err(Error::unsupported("riscv64: store offset out of range"));
        }
        self.word(s_type(imm, rs2, rs1, 3, 0x23));
        Ok(())
    }

    /// `add rd, rs1, rs2`
    pub fn add(&mut self, rd: RvReg, rs1: RvReg, rs2: RvReg) {
        self.word(r_type(0, rs2, rs1, 0, rd, 0x33));
    }

    /// `sub rd, rs1, rs2`
    pub fn sub(&mut self, rd: RvReg, rs1: RvReg, rs2: RvReg) {
        self.word(r_type(0x20, rs2, rs1, 0, rd, 0x33));
    }

    /// `mul rd, rs1, rs2`
    pub fn mul(&mut self, rd: RvReg, rs1: RvReg, rs2: RvReg) {
        self.word(r_type(1, rs2, rs1, 0, rd, 0x33));
    }

    /// `div rd, rs1, rs2`
    pub fn div(&mut self, rd: RvReg, rs1: RvReg, rs2: RvReg) {
        self.word(r_type(1, rs2, rs1, 4, rd, 0x33));
    }

    /// `beq rs1, rs2, imm` (byte offset)
    pub fn beq(&mut self, rs1: RvReg, rs2: RvReg, imm: i32) -> Result<()> {
        self.branch(0, rs1, rs2, imm)
    }

    /// `bne rs1, rs2, imm`
    pub fn bne(&mut self, rs1: RvReg, rs2: RvReg, imm: i32) -> Result<()> {
        self.branch(1, rs1, rs2, imm)
    }

    /// `blt rs1, rs2, imm`
    pub fn blt(&mut self, rs1: RvReg, rs2: RvReg, imm: i32) -> Result<()> {
        self.branch(4, rs1, rs2, imm)
    }

    /// `bge rs1, rs2, imm`
    pub fn bge(&mut self, rs1: RvReg, rs2: RvReg, imm: i32) -> Result<()> {
        self.branch(5, rs1, rs2, imm)
    }

    fn branch(&mut self, funct3: u32, rs1: RvReg, rs2: RvReg, imm: i32) -> Result<()> {
        if !(-4096..=4095).contains(&imm) || imm % 2 != 0 {
            return Err(Error::unsupported("riscv64: branch offset out of range"));
        }
        self.word(b_type(imm, rs2, rs1, funct3));
        Ok(())
    }

    /// `jal ra, symbol`: placeholder word plus a `RISCV_JAL21` relocation
    pub fn jal_symbol(&mut self, sym: SymbolId) {
        let site = self.text.current_offset();
        self.word(0x0000_006F | (RA.0 as u32) << 7);
        self.relocs.push(Reloc {
            text_offset: site,
            kind: RelocKind::RiscvJal21,
            target: RelocTarget::Symbol(sym),
            addend: 0,
        });
    }

    /// `jalr rd, 0(rs1)`
    pub fn jalr(&mut self, rd: RvReg, rs1: RvReg) {
        self.word(i_type(0, rs1, 0, rd, 0x67));
    }

    /// `ret` (`jalr zero, 0(ra)`)
    pub fn ret(&mut self) {
        self.jalr(ZERO, RA);
    }

    /// `ecall`
    pub fn ecall(&mut self) {
        self.word(0x0000_0073);
    }
}

/// Encode the J-type immediate layout used when patching `RISCV_JAL21`
/// sites (also used by the image assembler)
pub fn jal_imm_word(base_word: u32, byte_offset: i32) -> u32 {
    let imm = byte_offset as u32;
    base_word & 0xFFF
        | (imm >> 20 & 1) << 31
        | (imm >> 1 & 0x3FF) << 21
        | (imm >> 11 & 1) << 20
        | (imm >> 12 & 0xFF) << 12
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::reloc::SymbolTable;

    fn emit(f: impl FnOnce(&mut AsmRv) -> Result<()>) -> Vec<u32> {
        let mut text = SectionBuffer::new();
        let mut relocs = RelocTable::new();
        let mut asm = AsmRv::new(&mut text, &mut relocs);
        f(&mut asm).unwrap();
        text.as_slice()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn known_encodings() {
        assert_eq!(
            emit(|a| {
                a.add(RvReg(1), RvReg(2), RvReg(3));
                Ok(())
            }),
            [0x003100B3]
        );
        assert_eq!(emit(|a| a.addi(RvReg(1), RvReg(2), 5)), [0x00510093]);
        assert_eq!(emit(|a| a.ld(RvReg(1), RvReg(2), 8)), [0x00813083]);
        assert_eq!(emit(|a| a.sd(RvReg(1), RvReg(2), 8)), [0x00113423]);
        assert_eq!(
            emit(|a| {
                a.mul(RvReg(1), RvReg(2), RvReg(3));
                Ok(())
            }),
            [0x023100B3]
        );
        assert_eq!(
            emit(|a| {
                a.div(RvReg(1), RvReg(2), RvReg(3));
                Ok(())
            }),
            [0x023140B3]
        );
        assert_eq!(
            emit(|a| {
                a.ecall();
                Ok(())
            }),
            [0x00000073]
        );
        assert_eq!(
            emit(|a| {
                a.ret();
                Ok(())
            }),
            [0x00008067]
        );
    }

    #[test]
    fn out_of_range_offsets_are_unsupported() {
        let mut text = SectionBuffer::new();
        let mut relocs = RelocTable::new();
        let mut asm = AsmRv::new(&mut text, &mut relocs);
        assert!(asm.addi(RvReg(1), RvReg(2), 5000).is_err());
        assert!(asm.beq(RvReg(1), RvReg(2), 3).is_err());
    }

    #[test]
    fn jal_records_placeholder() {
        let mut text = SectionBuffer::new();
        let mut relocs = RelocTable::new();
        let mut syms = SymbolTable::new();
        let id = syms.text_local("helper");
        let mut asm = AsmRv::new(&mut text, &mut relocs);
        asm.jal_symbol(id);
        let word = u32::from_le_bytes(text.as_slice()[..4].try_into().unwrap());
        assert_eq!(word & 0x7F, 0x6F);
        assert_eq!(relocs.iter().next().unwrap().kind, RelocKind::RiscvJal21);
    }

    #[test]
    fn jal_imm_packing() {
        // jal zero, +8 → imm fields for 8
        let w = jal_imm_word(0x6F, 8);
        assert_eq!(w & 0xFFF, 0x6F);
        assert_eq!(w >> 21 & 0x3FF, 4); // imm[10:1] = 4
    }
}

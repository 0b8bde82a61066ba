//! # ELF64 image assembly
//!
//! Lays the emitted sections out into load segments, builds the dynamic
//! tables (dynsym/dynstr/hash/rela.plt/plt/got/dynamic) when imports are
//! present, patches every relocation site against the final addresses,
//! and serializes the file. Images are `ET_DYN`, fully PC-relative, and
//! loadable by the stock Linux loaders; without imports the result is a
//! static PIE with no interpreter.

use super::codegen::CodeObject;
use super::reloc::{RelocKind, RelocTarget, SymbolId, SymbolKind};
use super::riscv64::jal_imm_word;
use super::section::{align_up, SectionBuffer, PAGE_SIZE};
use super::Arch;
use crate::error::{Error, Result};
use std::collections::HashMap;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_DYN: u16 = 3;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_PLTRELSZ: u64 = 2;
const DT_PLTGOT: u64 = 3;
const DT_HASH: u64 = 4;
const DT_STRTAB: u64 = 5;
const DT_SYMTAB: u64 = 6;
const DT_RELA: u64 = 7;
const DT_STRSZ: u64 = 10;
const DT_SYMENT: u64 = 11;
const DT_PLTREL: u64 = 20;
const DT_JMPREL: u64 = 23;
const DT_BIND_NOW: u64 = 24;

const STB_GLOBAL: u8 = 1;
const STT_FUNC: u8 = 2;

const R_X86_64_JUMP_SLOT: u32 = 7;
const R_AARCH64_JUMP_SLOT: u32 = 1026;
const R_RISCV_JUMP_SLOT: u32 = 5;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;
const PLT_ENTRY: u64 = 16;

/// Standard SysV ELF hash
fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &b in name.as_bytes() {
        h = (h << 4).wrapping_add(b as u32);
        let g = h & 0xF000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// Assembles one image from a finished code object
pub struct ElfImage {
    arch: Arch,
    base: u64,
    eager_bind: bool,
}

struct Layout {
    interp_off: u64,
    dynsym_off: u64,
    dynstr_off: u64,
    hash_off: u64,
    relaplt_off: u64,
    ro_end: u64,
    rx_off: u64,
    plt_off: u64,
    text_off: u64,
    rx_end: u64,
    rw_off: u64,
    dynamic_off: u64,
    got_off: u64,
    rodata_off: u64,
    rw_file_end: u64,
    bss_vaddr: u64,
    rw_memsz: u64,
    dynstr: Vec<u8>,
    lib_name_offs: Vec<u64>,
    sym_name_offs: Vec<u64>,
    dyn_count: u64,
}

impl ElfImage {
    /// Image assembler for `arch` at the conventional base
    pub fn new(arch: Arch, eager_bind: bool) -> Self {
        Self {
            arch,
            base: 0x40_0000,
            eager_bind,
        }
    }

    /// Lay out, patch, and serialize the image
    pub fn assemble(&self, obj: CodeObject) -> Result<Vec<u8>> {
        let imports = obj.symbols.imports_in_order();
        let dynamic = !imports.is_empty();
        if dynamic && self.arch != Arch::X86_64 {
            return Err(Error::unsupported(format!(
                "dynamic linking is only wired up for x86-64 (target {:?})",
                self.arch
            )));
        }

        let layout = self.layout(&obj, &imports, dynamic)?;
        let import_index: HashMap<SymbolId, usize> = imports
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();

        let entry_off = obj
            .labels
            .offset_of(obj.entry)
            .ok_or_else(|| Error::internal("entry label unbound"))?;
        let e_entry = self.base + layout.text_off + entry_off;

        let CodeObject {
            text,
            rodata,
            relocs,
            labels,
            symbols,
            ..
        } = obj;
        let mut text = text.seal();
        self.patch_text(
            &relocs,
            &labels,
            &symbols,
            &layout,
            &import_index,
            &mut text,
            dynamic,
        )?;

        let mut out = SectionBuffer::new();
        self.write_ehdr(&mut out, e_entry, dynamic);
        self.write_phdrs(&mut out, &layout, dynamic);

        if dynamic {
            // read-only tables
            pad_to(&mut out, layout.interp_off);
            out.write_bytes(self.arch.interp_path().as_bytes());
            out.write_u8(0);
            pad_to(&mut out, layout.dynsym_off);
            self.write_dynsym(&mut out, &imports, &layout);
            pad_to(&mut out, layout.dynstr_off);
            out.write_bytes(&layout.dynstr);
            pad_to(&mut out, layout.hash_off);
            self.write_hash(&mut out, &symbols, &imports);
            pad_to(&mut out, layout.relaplt_off);
            self.write_relaplt(&mut out, &imports, &layout);
        }

        // executable segment
        pad_to(&mut out, layout.rx_off);
        if dynamic {
            self.write_plt(&mut out, &imports, &layout);
        }
        pad_to(&mut out, layout.text_off);
        out.write_bytes(text.as_slice());

        // writable segment
        pad_to(&mut out, layout.rw_off);
        if dynamic {
            self.write_dynamic(&mut out, &layout);
            pad_to(&mut out, layout.got_off);
            self.write_got(&mut out, &imports, &layout);
        }
        pad_to(&mut out, layout.rodata_off);
        out.write_bytes(rodata.as_slice());

        tracing::debug!(
            size = out.len(),
            entry = format_args!("{e_entry:#x}"),
            imports = imports.len(),
            dynamic,
            "image assembled"
        );
        Ok(out.seal().as_slice().to_vec())
    }

    fn layout(&self, obj: &CodeObject, imports: &[SymbolId], dynamic: bool) -> Result<Layout> {
        let n = imports.len() as u64;
        let phnum: u64 = if dynamic { 5 } else { 3 };
        let hdr_end = EHDR_SIZE + PHDR_SIZE * phnum;

        // dynstr: NUL, library names, symbol names
        let mut dynstr = vec![0u8];
        let mut lib_name_offs = Vec::new();
        for lib in &obj.libraries {
            lib_name_offs.push(dynstr.len() as u64);
            dynstr.extend_from_slice(lib.as_bytes());
            dynstr.push(0);
        }
        let mut sym_name_offs = Vec::new();
        for &id in imports {
            sym_name_offs.push(dynstr.len() as u64);
            dynstr.extend_from_slice(obj.symbols.get(id).name.as_bytes());
            dynstr.push(0);
        }

        let dyn_count =
            obj.libraries.len() as u64 + 9 + if self.eager_bind { 1 } else { 0 } + 1;

        let (interp_off, dynsym_off, dynstr_off, hash_off, relaplt_off, ro_end);
        if dynamic {
            interp_off = align_up(hdr_end, 8);
            let interp_len = self.arch.interp_path().len() as u64 + 1;
            dynsym_off = align_up(interp_off + interp_len, 8);
            dynstr_off = dynsym_off + SYM_SIZE * (1 + n);
            hash_off = align_up(dynstr_off + dynstr.len() as u64, 8);
            let nbucket = n.max(1);
            let hash_len = 4 * (2 + nbucket + 1 + n);
            relaplt_off = align_up(hash_off + hash_len, 8);
            ro_end = relaplt_off + RELA_SIZE * n;
        } else {
            interp_off = hdr_end;
            dynsym_off = hdr_end;
            dynstr_off = hdr_end;
            hash_off = hdr_end;
            relaplt_off = hdr_end;
            ro_end = hdr_end;
        }

        let rx_off = align_up(ro_end, PAGE_SIZE);
        let plt_off = rx_off;
        let plt_len = if dynamic { PLT_ENTRY * (1 + n) } else { 0 };
        let text_off = plt_off + plt_len;
        let rx_end = text_off + obj.text.len() as u64;

        let rw_off = align_up(rx_end, PAGE_SIZE);
        let dynamic_off = rw_off;
        let dyn_len = if dynamic { 16 * dyn_count } else { 0 };
        let got_off = dynamic_off + dyn_len;
        let got_len = if dynamic { 8 * (3 + n) } else { 0 };
        let rodata_off = align_up(got_off + got_len, 8);
        let rw_file_end = rodata_off + obj.rodata.len() as u64;
        let bss_start = align_up(rw_file_end, 8);
        let bss_vaddr = self.base + bss_start;
        let rw_memsz = bss_start - rw_off + obj.bss_size;

        Ok(Layout {
            interp_off,
            dynsym_off,
            dynstr_off,
            hash_off,
            relaplt_off,
            ro_end,
            rx_off,
            plt_off,
            text_off,
            rx_end,
            rw_off,
            dynamic_off,
            got_off,
            rodata_off,
            rw_file_end,
            bss_vaddr,
            rw_memsz,
            dynstr,
            lib_name_offs,
            sym_name_offs,
            dyn_count,
        })
    }

    fn write_ehdr(&self, out: &mut SectionBuffer, e_entry: u64, dynamic: bool) {
        out.write_bytes(&ELF_MAGIC);
        out.write_u8(ELFCLASS64);
        out.write_u8(ELFDATA2LSB);
        out.write_u8(EV_CURRENT);
        out.write_u8(0); // ELFOSABI_NONE
        out.write_bytes(&[0u8; 8]);
        out.write_u16(ET_DYN);
        out.write_u16(self.arch.elf_machine());
        out.write_u32(1);
        out.write_u64(e_entry);
        out.write_u64(EHDR_SIZE); // e_phoff
        out.write_u64(0); // e_shoff: executables need no section headers
        out.write_u32(0); // e_flags
        out.write_u16(EHDR_SIZE as u16);
        out.write_u16(PHDR_SIZE as u16);
        out.write_u16(if dynamic { 5 } else { 3 });
        out.write_u16(0); // e_shentsize
        out.write_u16(0); // e_shnum
        out.write_u16(0); // e_shstrndx
    }

    fn phdr(
        &self,
        out: &mut SectionBuffer,
        p_type: u32,
        flags: u32,
        off: u64,
        filesz: u64,
        memsz: u64,
        align: u64,
    ) {
        out.write_u32(p_type);
        out.write_u32(flags);
        out.write_u64(off);
        out.write_u64(self.base + off);
        out.write_u64(self.base + off);
        out.write_u64(filesz);
        out.write_u64(memsz);
        out.write_u64(align);
    }

    fn write_phdrs(&self, out: &mut SectionBuffer, l: &Layout, dynamic: bool) {
        if dynamic {
            let interp_len = self.arch.interp_path().len() as u64 + 1;
            self.phdr(out, PT_INTERP, PF_R, l.interp_off, interp_len, interp_len, 1);
        }
        self.phdr(out, PT_LOAD, PF_R, 0, l.ro_end, l.ro_end, PAGE_SIZE);
        self.phdr(
            out,
            PT_LOAD,
            PF_R | PF_X,
            l.rx_off,
            l.rx_end - l.rx_off,
            l.rx_end - l.rx_off,
            PAGE_SIZE,
        );
        self.phdr(
            out,
            PT_LOAD,
            PF_R | PF_W,
            l.rw_off,
            l.rw_file_end - l.rw_off,
            l.rw_memsz,
            PAGE_SIZE,
        );
        if dynamic {
            self.phdr(
                out,
                PT_DYNAMIC,
                PF_R | PF_W,
                l.dynamic_off,
                16 * l.dyn_count,
                16 * l.dyn_count,
                8,
            );
        }
    }

    fn write_dynsym(&self, out: &mut SectionBuffer, imports: &[SymbolId], l: &Layout) {
        out.write_bytes(&[0u8; SYM_SIZE as usize]); // index 0: null symbol
        for (i, _id) in imports.iter().enumerate() {
            out.write_u32(l.sym_name_offs[i] as u32);
            out.write_u8((STB_GLOBAL << 4) | STT_FUNC);
            out.write_u8(0);
            out.write_u16(0); // SHN_UNDEF
            out.write_u64(0);
            out.write_u64(0);
        }
    }

    fn write_hash(
        &self,
        out: &mut SectionBuffer,
        symbols: &super::reloc::SymbolTable,
        imports: &[SymbolId],
    ) {
        let n = imports.len() as u32;
        let nbucket = n.max(1);
        let nchain = n + 1;
        let mut buckets = vec![0u32; nbucket as usize];
        let mut chains = vec![0u32; nchain as usize];
        for (i, &id) in imports.iter().enumerate() {
            let symidx = i as u32 + 1;
            let h = elf_hash(&symbols.get(id).name) % nbucket;
            chains[symidx as usize] = buckets[h as usize];
            buckets[h as usize] = symidx;
        }
        out.write_u32(nbucket);
        out.write_u32(nchain);
        for b in buckets {
            out.write_u32(b);
        }
        for c in chains {
            out.write_u32(c);
        }
    }

    fn jump_slot_type(&self) -> u32 {
        match self.arch {
            Arch::X86_64 => R_X86_64_JUMP_SLOT,
            Arch::Arm64 => R_AARCH64_JUMP_SLOT,
            Arch::Riscv64 => R_RISCV_JUMP_SLOT,
        }
    }

    fn write_relaplt(&self, out: &mut SectionBuffer, imports: &[SymbolId], l: &Layout) {
        let got_vaddr = self.base + l.got_off;
        for i in 0..imports.len() as u64 {
            out.write_u64(got_vaddr + (3 + i) * 8);
            out.write_u64(((i + 1) << 32) | self.jump_slot_type() as u64);
            out.write_u64(0);
        }
    }

    /// Lazy-binding PLT. Entry 0 is the resolver trampoline; each import
    /// entry jumps through its GOT slot, which initially points back at
    /// the entry's own push.
    fn write_plt(&self, out: &mut SectionBuffer, imports: &[SymbolId], l: &Layout) {
        let plt_vaddr = self.base + l.plt_off;
        let got_vaddr = self.base + l.got_off;

        // plt0: push [got+8]; jmp [got+16]; pad
        out.write_u8(0xFF);
        out.write_u8(0x35);
        out.write_u32((got_vaddr + 8).wrapping_sub(plt_vaddr + 6) as u32);
        out.write_u8(0xFF);
        out.write_u8(0x25);
        out.write_u32((got_vaddr + 16).wrapping_sub(plt_vaddr + 12) as u32);
        out.write_u32(0x0040_1F0F); // 4-byte nop

        for i in 0..imports.len() as u64 {
            let entry_vaddr = plt_vaddr + PLT_ENTRY * (1 + i);
            let slot_vaddr = got_vaddr + (3 + i) * 8;
            // jmp [rip + got_slot]
            out.write_u8(0xFF);
            out.write_u8(0x25);
            out.write_u32(slot_vaddr.wrapping_sub(entry_vaddr + 6) as u32);
            // push relocation index
            out.write_u8(0x68);
            out.write_u32(i as u32);
            // jmp plt0
            out.write_u8(0xE9);
            out.write_u32(plt_vaddr.wrapping_sub(entry_vaddr + 16) as u32);
        }
    }

    fn write_got(&self, out: &mut SectionBuffer, imports: &[SymbolId], l: &Layout) {
        let plt_vaddr = self.base + l.plt_off;
        out.write_u64(self.base + l.dynamic_off); // link map anchor
        out.write_u64(0); // filled by the loader
        out.write_u64(0); // resolver, filled by the loader
        for i in 0..imports.len() as u64 {
            // back to the entry's push: plt_entry + 6
            out.write_u64(plt_vaddr + PLT_ENTRY * (1 + i) + 6);
        }
    }

    fn write_dynamic(&self, out: &mut SectionBuffer, l: &Layout) {
        let mut tag = |out: &mut SectionBuffer, t: u64, v: u64| {
            out.write_u64(t);
            out.write_u64(v);
        };
        for &off in &l.lib_name_offs {
            tag(out, DT_NEEDED, off);
        }
        tag(out, DT_SYMTAB, self.base + l.dynsym_off);
        tag(out, DT_STRTAB, self.base + l.dynstr_off);
        tag(out, DT_HASH, self.base + l.hash_off);
        tag(out, DT_PLTRELSZ, l.ro_end - l.relaplt_off);
        tag(out, DT_PLTREL, DT_RELA);
        tag(out, DT_JMPREL, self.base + l.relaplt_off);
        tag(out, DT_PLTGOT, self.base + l.got_off);
        tag(out, DT_STRSZ, l.dynstr.len() as u64);
        tag(out, DT_SYMENT, SYM_SIZE);
        if self.eager_bind {
            tag(out, DT_BIND_NOW, 1);
        }
        tag(out, DT_NULL, 0);
    }

    /// Apply every recorded relocation against final addresses. Each
    /// site is verified to still hold its placeholder pattern first.
    #[allow(clippy::too_many_arguments)]
    fn patch_text(
        &self,
        relocs: &super::reloc::RelocTable,
        labels: &super::reloc::LabelTable,
        symbols: &super::reloc::SymbolTable,
        l: &Layout,
        import_index: &HashMap<SymbolId, usize>,
        text: &mut super::section::SealedSection,
        dynamic: bool,
    ) -> Result<()> {
        let text_vaddr = self.base + l.text_off;
        let plt_vaddr = self.base + l.plt_off;
        let rodata_vaddr = self.base + l.rodata_off;

        for reloc in relocs.iter() {
            let target = match reloc.target {
                RelocTarget::Label(label) => {
                    let off = labels.offset_of(label).ok_or_else(|| {
                        Error::internal(format!("relocation against unbound label {label:?}"))
                    })?;
                    text_vaddr + off
                }
                RelocTarget::Rodata(off) => rodata_vaddr + off,
                RelocTarget::Bss(off) => l.bss_vaddr + off,
                RelocTarget::Symbol(id) => {
                    let sym = symbols.get(id);
                    match sym.kind {
                        SymbolKind::TextLocal => {
                            let off = sym.text_offset.ok_or_else(|| {
                                Error::internal(format!(
                                    "local symbol `{}` has no address",
                                    sym.name
                                ))
                            })?;
                            text_vaddr + off
                        }
                        SymbolKind::DynImport => {
                            if !dynamic {
                                return Err(Error::internal(
                                    "import relocation in a static image",
                                ));
                            }
                            let idx = import_index[&id] as u64;
                            plt_vaddr + PLT_ENTRY * (1 + idx)
                        }
                    }
                }
            };
            let target = target.wrapping_add(reloc.addend as u64);
            let site = text_vaddr + reloc.text_offset;
            let have = text.read_u32_at(reloc.text_offset)?;

            match reloc.kind {
                RelocKind::PcRel32 | RelocKind::Call32 => {
                    if have != reloc.kind.placeholder() {
                        return Err(Error::internal(format!(
                            "{} site at {:#x} holds {have:#010x}, not the placeholder",
                            reloc.kind.name(),
                            reloc.text_offset
                        )));
                    }
                    let disp = (target as i64) - (site as i64 + 4);
                    if disp > i32::MAX as i64 || disp < i32::MIN as i64 {
                        return Err(Error::RelocationOverflow {
                            kind: reloc.kind.name(),
                            disp,
                            bits: 32,
                        });
                    }
                    text.patch_u32_at(reloc.text_offset, disp as i32 as u32)?;
                }
                RelocKind::Arm64Bl26 => {
                    if have != reloc.kind.placeholder() {
                        return Err(Error::internal(format!(
                            "BL26 site at {:#x} holds {have:#010x}",
                            reloc.text_offset
                        )));
                    }
                    let disp = (target as i64) - (site as i64);
                    if disp % 4 != 0 || disp >= (1 << 27) || disp < -(1 << 27) {
                        return Err(Error::RelocationOverflow {
                            kind: reloc.kind.name(),
                            disp,
                            bits: 26,
                        });
                    }
                    let word = 0x9400_0000u32 | (((disp >> 2) as u32) & 0x03FF_FFFF);
                    text.patch_u32_at(reloc.text_offset, word)?;
                }
                RelocKind::RiscvJal21 => {
                    if have & 0x7F != 0x6F || have & 0xFFFF_F000 != 0 {
                        return Err(Error::internal(format!(
                            "JAL21 site at {:#x} holds {have:#010x}",
                            reloc.text_offset
                        )));
                    }
                    let disp = (target as i64) - (site as i64);
                    if disp % 2 != 0 || disp >= (1 << 20) || disp < -(1 << 20) {
                        return Err(Error::RelocationOverflow {
                            kind: reloc.kind.name(),
                            disp,
                            bits: 21,
                        });
                    }
                    text.patch_u32_at(reloc.text_offset, jal_imm_word(have, disp as i32))?;
                }
            }
        }
        Ok(())
    }
}

fn pad_to(out: &mut SectionBuffer, offset: u64) {
    debug_assert!(out.current_offset() <= offset);
    while out.current_offset() < offset {
        out.write_u8(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::CodeGen;
    use crate::compiler::ffi::KnownLibcProvider;
    use crate::compiler::regalloc::DEFAULT_FRAME_BUDGET;
    use crate::parser::parse_source;

    fn build(src: &str) -> Vec<u8> {
        let program = parse_source("test.flap", src).unwrap();
        let provider = KnownLibcProvider;
        let obj = CodeGen::new(&program, &provider, DEFAULT_FRAME_BUDGET)
            .generate()
            .unwrap();
        ElfImage::new(Arch::X86_64, false).assemble(obj).unwrap()
    }

    fn u16le(b: &[u8], off: usize) -> u16 {
        u16::from_le_bytes([b[off], b[off + 1]])
    }

    fn u64le(b: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn static_image_has_three_load_segments_and_no_interp() {
        let img = build(r#"main = () => println("hi")"#);
        assert_eq!(&img[0..4], &ELF_MAGIC);
        assert_eq!(u16le(&img, 16), ET_DYN);
        assert_eq!(u16le(&img, 18), 62); // EM_X86_64
        let phnum = u16le(&img, 56);
        assert_eq!(phnum, 3);
        for i in 0..phnum as usize {
            let p = 64 + i * 56;
            let p_type = u32::from_le_bytes(img[p..p + 4].try_into().unwrap());
            assert_ne!(p_type, PT_INTERP);
        }
    }

    #[test]
    fn entry_lies_inside_the_executable_segment() {
        let img = build("x = 1\nprintln(x)");
        let e_entry = u64le(&img, 24);
        let phnum = u16le(&img, 56) as usize;
        let mut hit = false;
        for i in 0..phnum {
            let p = 64 + i * 56;
            let p_type = u32::from_le_bytes(img[p..p + 4].try_into().unwrap());
            let flags = u32::from_le_bytes(img[p + 4..p + 8].try_into().unwrap());
            let vaddr = u64le(&img, p + 16);
            let memsz = u64le(&img, p + 40);
            if p_type == PT_LOAD && flags & PF_X != 0 {
                hit |= e_entry >= vaddr && e_entry < vaddr + memsz;
            }
        }
        assert!(hit, "e_entry not inside a PF_X PT_LOAD");
    }

    #[test]
    fn dynamic_image_carries_interp_and_needed() {
        let img = build("import c \"libc.so.6\"\nmain = () => c.puts(\"world\")");
        let phnum = u16le(&img, 56) as usize;
        assert_eq!(phnum, 5);
        let mut interp = None;
        let mut dyn_seg = None;
        for i in 0..phnum {
            let p = 64 + i * 56;
            let p_type = u32::from_le_bytes(img[p..p + 4].try_into().unwrap());
            let off = u64le(&img, p + 8) as usize;
            let filesz = u64le(&img, p + 32) as usize;
            match p_type {
                PT_INTERP => interp = Some((off, filesz)),
                PT_DYNAMIC => dyn_seg = Some((off, filesz)),
                _ => {}
            }
        }
        let (ioff, ilen) = interp.expect("PT_INTERP present");
        assert_eq!(
            &img[ioff..ioff + ilen - 1],
            b"/lib64/ld-linux-x86-64.so.2"
        );

        // walk .dynamic: DT_NEEDED present, DT_NULL last
        let (doff, dlen) = dyn_seg.expect("PT_DYNAMIC present");
        let mut tags = Vec::new();
        let mut p = doff;
        while p + 16 <= doff + dlen {
            tags.push((u64le(&img, p), u64le(&img, p + 8)));
            p += 16;
        }
        assert_eq!(tags.last().unwrap().0, DT_NULL);
        assert!(tags.iter().any(|&(t, _)| t == DT_NEEDED));
        assert!(tags.iter().any(|&(t, _)| t == DT_JMPREL));
        assert!(tags.iter().any(|&(t, v)| t == DT_PLTREL && v == DT_RELA));
    }

    #[test]
    fn no_placeholder_survives_patching() {
        let program = parse_source(
            "t.flap",
            "total = 0\n@ i in 0..<100 { i >= 10 -> break; total = total + i }\nprintln(total)",
        )
        .unwrap();
        let provider = KnownLibcProvider;
        let obj = CodeGen::new(&program, &provider, DEFAULT_FRAME_BUDGET)
            .generate()
            .unwrap();
        let sites: Vec<u64> = obj.relocs.iter().map(|r| r.text_offset).collect();
        let text_off_guess = {
            // layout is deterministic: recompute through assembly
            let img = ElfImage::new(Arch::X86_64, false).assemble(obj).unwrap();
            // find the RX segment file offset
            let phnum = u16le(&img, 56) as usize;
            let mut rx = 0;
            for i in 0..phnum {
                let p = 64 + i * 56;
                let p_type = u32::from_le_bytes(img[p..p + 4].try_into().unwrap());
                let flags = u32::from_le_bytes(img[p + 4..p + 8].try_into().unwrap());
                if p_type == PT_LOAD && flags & PF_X != 0 {
                    rx = u64le(&img, p + 8);
                }
            }
            (img, rx)
        };
        let (img, rx) = text_off_guess;
        for site in sites {
            let at = (rx + site) as usize;
            let word = u32::from_le_bytes(img[at..at + 4].try_into().unwrap());
            assert_ne!(word, 0x12345678, "unpatched placeholder at {site:#x}");
        }
    }

    #[test]
    fn images_are_byte_identical_across_runs() {
        let src = "import c \"libc.so.6\"\nmain = () => c.puts(\"world\")";
        assert_eq!(build(src), build(src));
    }

    #[test]
    fn hash_function_matches_reference_values() {
        // classic SysV elf_hash test vectors
        assert_eq!(elf_hash(""), 0);
        assert_eq!(elf_hash("printf"), 0x077905a6);
        assert_eq!(elf_hash("exit"), 0x0006cf04);
    }
}

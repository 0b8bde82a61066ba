//! Round-trip verification: emitted images re-read with a standard ELF
//! parser must expose exactly the layout the assembler intended.

use elf::abi;
use elf::endian::LittleEndian;
use elf::ElfBytes;
use flapc::{Arch, CompileOptions, Compiler};

const BASE: u64 = 0x40_0000;

fn build(src: &str) -> Vec<u8> {
    Compiler::new(CompileOptions {
        arch: Arch::X86_64,
        ..CompileOptions::default()
    })
    .compile_source("test.flap", src)
    .unwrap()
    .image
}

#[test]
fn static_image_parses_and_entry_is_executable() {
    let img = build(r#"main = () => println("hi")"#);
    let f = ElfBytes::<LittleEndian>::minimal_parse(&img).unwrap();
    assert_eq!(f.ehdr.e_type, abi::ET_DYN);
    assert_eq!(f.ehdr.e_machine, abi::EM_X86_64);

    let segs = f.segments().expect("program headers");
    let mut in_exec = false;
    let mut interp = false;
    for s in segs.iter() {
        if s.p_type == abi::PT_INTERP {
            interp = true;
        }
        if s.p_type == abi::PT_LOAD && s.p_flags & abi::PF_X != 0 {
            in_exec |= f.ehdr.e_entry >= s.p_vaddr && f.ehdr.e_entry < s.p_vaddr + s.p_memsz;
        }
    }
    assert!(in_exec, "e_entry inside a PF_X PT_LOAD");
    assert!(!interp, "no PT_INTERP without imports");
}

#[test]
fn dynamic_image_has_interp_and_needed_libc() {
    let img = build("import c \"libc.so.6\"\nmain = () => c.puts(\"world\")");
    let f = ElfBytes::<LittleEndian>::minimal_parse(&img).unwrap();

    let segs = f.segments().expect("program headers");
    let mut interp_seen = false;
    for s in segs.iter() {
        if s.p_type == abi::PT_INTERP {
            interp_seen = true;
            let off = s.p_offset as usize;
            let len = s.p_filesz as usize;
            assert_eq!(&img[off..off + len - 1], b"/lib64/ld-linux-x86-64.so.2");
        }
    }
    assert!(interp_seen, "PT_INTERP present with imports");

    // walk .dynamic the way a loader would
    let dyns = f
        .dynamic()
        .expect("parseable dynamic section")
        .expect("PT_DYNAMIC present");
    let mut needed_off = None;
    let mut strtab = None;
    let mut jmprel = None;
    let mut pltrelsz = None;
    let mut pltgot = None;
    let mut last_tag = -1i64;
    for d in dyns.iter() {
        last_tag = d.d_tag;
        match d.d_tag {
            abi::DT_NEEDED => needed_off = Some(d.d_val()),
            abi::DT_STRTAB => strtab = Some(d.d_ptr()),
            abi::DT_JMPREL => jmprel = Some(d.d_ptr()),
            abi::DT_PLTRELSZ => pltrelsz = Some(d.d_val()),
            abi::DT_PLTGOT => pltgot = Some(d.d_ptr()),
            _ => {}
        }
    }
    assert_eq!(last_tag, abi::DT_NULL, "dynamic table ends with DT_NULL");

    // DT_NEEDED resolves to "libc.so.6" through DT_STRTAB
    let str_off = (strtab.unwrap() - BASE) as usize + needed_off.unwrap() as usize;
    let end = img[str_off..].iter().position(|&b| b == 0).unwrap();
    assert_eq!(&img[str_off..str_off + end], b"libc.so.6");

    // one R_X86_64_JUMP_SLOT per import, pointing into the GOT
    let rel_off = (jmprel.unwrap() - BASE) as usize;
    let rel_len = pltrelsz.unwrap() as usize;
    assert_eq!(rel_len % 24, 0);
    let n = rel_len / 24;
    assert_eq!(n, 1);
    let r_offset = u64::from_le_bytes(img[rel_off..rel_off + 8].try_into().unwrap());
    let r_info = u64::from_le_bytes(img[rel_off + 8..rel_off + 16].try_into().unwrap());
    assert_eq!(r_info & 0xFFFF_FFFF, abi::R_X86_64_JUMP_SLOT as u64);
    assert_eq!(r_info >> 32, 1, "first dynsym entry");
    let got = pltgot.unwrap();
    assert_eq!(r_offset, got + 3 * 8, "slot after the three reserved ones");

    // the GOT slot initially points back into the PLT (resolve-me stub)
    let got_slot_off = (r_offset - BASE) as usize;
    let initial = u64::from_le_bytes(img[got_slot_off..got_slot_off + 8].try_into().unwrap());
    let exec = f
        .segments()
        .unwrap()
        .iter()
        .find(|s| s.p_type == abi::PT_LOAD && s.p_flags & abi::PF_X != 0)
        .unwrap();
    assert!(
        initial >= exec.p_vaddr && initial < exec.p_vaddr + exec.p_memsz,
        "GOT slot seeds a PLT address"
    );
}

#[test]
fn sysv_hash_table_finds_every_import() {
    let img = build(
        "import c \"libc.so.6\"\nmain = () => {\n  c.puts(\"a\")\n  c.putchar(10)\n  c.exit(0)\n}",
    );
    let f = ElfBytes::<LittleEndian>::minimal_parse(&img).unwrap();
    let dyns = f.dynamic().unwrap().unwrap();
    let mut hash = None;
    let mut symtab = None;
    let mut strtab = None;
    for d in dyns.iter() {
        match d.d_tag {
            abi::DT_HASH => hash = Some(d.d_ptr()),
            abi::DT_SYMTAB => symtab = Some(d.d_ptr()),
            abi::DT_STRTAB => strtab = Some(d.d_ptr()),
            _ => {}
        }
    }
    let hash_off = (hash.unwrap() - BASE) as usize;
    let sym_off = (symtab.unwrap() - BASE) as usize;
    let str_off = (strtab.unwrap() - BASE) as usize;

    let u32at = |off: usize| u32::from_le_bytes(img[off..off + 4].try_into().unwrap());
    let nbucket = u32at(hash_off) as usize;
    let nchain = u32at(hash_off + 4) as usize;
    assert_eq!(nchain, 4, "null symbol + three imports");

    // every dynsym name must be reachable through its hash chain
    fn sysv_hash(name: &[u8]) -> u32 {
        let mut h: u32 = 0;
        for &b in name {
            h = (h << 4).wrapping_add(b as u32);
            let g = h & 0xF000_0000;
            if g != 0 {
                h ^= g >> 24;
            }
            h &= !g;
        }
        h
    }

    for symidx in 1..nchain {
        let name_off = u32at(sym_off + symidx * 24) as usize;
        let name_start = str_off + name_off;
        let name_end = img[name_start..].iter().position(|&b| b == 0).unwrap();
        let name = &img[name_start..name_start + name_end];

        let bucket = (sysv_hash(name) as usize) % nbucket;
        let mut cur = u32at(hash_off + 8 + bucket * 4) as usize;
        let mut found = false;
        while cur != 0 {
            if cur == symidx {
                found = true;
                break;
            }
            cur = u32at(hash_off + 8 + nbucket * 4 + cur * 4) as usize;
        }
        assert!(
            found,
            "symbol {} not reachable via its hash chain",
            String::from_utf8_lossy(name)
        );
    }
}

#[test]
fn segments_do_not_overlap_and_are_page_aligned() {
    let img = build("import c \"libc.so.6\"\ntotal = 0\n@ i in 0..<10 { total = total + i }\nmain = () => c.puts(\"done\")");
    let f = ElfBytes::<LittleEndian>::minimal_parse(&img).unwrap();
    let mut loads: Vec<(u64, u64)> = f
        .segments()
        .unwrap()
        .iter()
        .filter(|s| s.p_type == abi::PT_LOAD)
        .map(|s| (s.p_vaddr, s.p_memsz))
        .collect();
    loads.sort();
    for pair in loads.windows(2) {
        let (a_start, a_sz) = pair[0];
        let (b_start, _) = pair[1];
        assert!(a_start + a_sz <= b_start, "LOAD segments overlap");
        assert_eq!(b_start % 0x1000, 0, "segment start page-aligned");
    }
    // file offsets congruent to vaddrs modulo the page size
    for s in f.segments().unwrap().iter().filter(|s| s.p_type == abi::PT_LOAD) {
        assert_eq!(s.p_offset % 0x1000, s.p_vaddr % 0x1000);
    }
}

#[test]
fn image_round_trips_through_disk() {
    let img = build(r#"main = () => println("hi")"#);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello");
    std::fs::write(&path, &img).unwrap();
    let back = std::fs::read(&path).unwrap();
    assert_eq!(img, back);
    ElfBytes::<LittleEndian>::minimal_parse(&back).unwrap();
}

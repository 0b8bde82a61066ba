//! Property tests over the allocator and the compilation pipeline.

use flapc::compiler::regalloc::{IntervalBuilder, LinearScan};
use flapc::{parse_source, Arch, CompileOptions, Compiler};
use proptest::prelude::*;
use std::collections::HashSet;

fn compile(src: &str) -> Result<Vec<u8>, flapc::Error> {
    Compiler::new(CompileOptions {
        arch: Arch::X86_64,
        ..CompileOptions::default()
    })
    .compile_source("prop.flap", src)
    .map(|r| r.image)
}

/// A little generator for straight-line arithmetic programs
fn arith_program(vars: usize, uses: &[usize]) -> String {
    let mut src = String::new();
    for i in 0..vars {
        src.push_str(&format!("v{i} = {}\n", i * 3 + 1));
    }
    let mut expr = String::from("0");
    for &u in uses {
        expr.push_str(&format!(" + v{}", u % vars.max(1)));
    }
    src.push_str(&format!("s = {expr}\nprintln(s)\n"));
    src
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_interval_has_exactly_one_home(
        vars in 1usize..24,
        uses in proptest::collection::vec(0usize..24, 0..40),
    ) {
        let src = arith_program(vars, &uses);
        let program = parse_source("p.flap", &src).unwrap();
        let ext = HashSet::new();
        let mut analysis = IntervalBuilder::analyze(&[], &program.statements, &ext);
        let plan = LinearScan::default().run(&mut analysis).unwrap();
        for iv in &analysis.intervals {
            let homes = iv.reg.is_some() as u8
                + iv.fp_reg.is_some() as u8
                + iv.slot.is_some() as u8;
            prop_assert_eq!(homes, 1);
            prop_assert!(iv.end >= iv.start);
        }
        // the plan answers for every variable
        for (_, &v) in analysis.vars.iter() {
            let _ = plan.loc(v);
        }
    }

    #[test]
    fn arithmetic_programs_compile_deterministically(
        vars in 1usize..12,
        uses in proptest::collection::vec(0usize..12, 0..24),
    ) {
        let src = arith_program(vars, &uses);
        let a = compile(&src).unwrap();
        let b = compile(&src).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn loop_programs_compile(
        bound in 1u32..500,
        cutoff in 0u32..500,
    ) {
        let src = format!(
            "total = 0\n@ i in 0..<{bound} {{ i >= {cutoff} -> break; total = total + i }}\nprintln(total)"
        );
        prop_assert!(compile(&src).is_ok());
    }

    #[test]
    fn string_literals_land_in_the_image(s in "[a-z]{1,12}") {
        let src = format!("main = () => println(\"{s}\")");
        let img = compile(&src).unwrap();
        let mut needle = s.clone().into_bytes();
        needle.push(0);
        prop_assert!(img.windows(needle.len()).any(|w| w == needle.as_slice()));
    }
}

#[test]
fn callee_saved_pushes_mirror_in_epilogue() {
    // Force several callee-saved homes with values live across a call
    let src = "\
a = 1\nb = 2\nc = 3\nd = 4\n\
f = n => n + 1\n\
x = f(a)\n\
println(a + b + c + d + x)\n";
    let program = parse_source("m.flap", src).unwrap();
    let ext = HashSet::new();
    let mut analysis = IntervalBuilder::analyze(&[], &program.statements, &ext);
    let plan = LinearScan::default().run(&mut analysis).unwrap();
    // the plan's push list is what both prologue and epilogue consume,
    // in reverse; it must be duplicate-free and callee-saved only
    let mut seen = HashSet::new();
    for r in &plan.callee_saved {
        assert!(r.is_callee_saved());
        assert!(seen.insert(*r), "register listed twice");
    }
    assert!(compile(src).is_ok());
}

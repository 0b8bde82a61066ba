//! End-to-end compilation of representative Flap programs through the
//! public API, with structural assertions on the emitted images.

use flapc::{Arch, CompileOptions, Compiler, Error};

fn compiler() -> Compiler {
    Compiler::new(CompileOptions {
        arch: Arch::X86_64,
        ..CompileOptions::default()
    })
}

fn build(src: &str) -> flapc::CompileResult {
    compiler().compile_source("test.flap", src).unwrap()
}

#[test]
fn hello() {
    let r = build(r#"main = () => println("hi")"#);
    assert_eq!(&r.image[0..4], b"\x7FELF");
    assert_eq!(r.import_count, 0);
    // the literal is embedded with its NUL terminator
    assert!(r.image.windows(3).any(|w| w == b"hi\0"));
}

#[test]
fn divide_by_zero_defaults_through_or_bang() {
    let r = build("x = 1/0 or! 42\nprintln(x)");
    assert!(r.text_size > 0);
    assert_eq!(r.import_count, 0);
}

#[test]
fn parallel_sum_with_atomics() {
    for n in ["@@", "1 @", "2 @", "4 @"] {
        let src = format!(
            "counter = 0\n{n} i in 0..<1000 {{ atomic_add(counter, i) }}\nprintln(counter)"
        );
        let r = compiler().compile_source("par.flap", &src).unwrap();
        assert!(r.text_size > 0, "worker fan-out for `{n}`");
    }
}

#[test]
fn ffi_import_links_against_libc() {
    let r = build("import c \"libc.so.6\"\nmain = () => c.puts(\"world\")");
    assert_eq!(r.libraries, vec!["libc.so.6".to_string()]);
    assert_eq!(r.import_count, 1);
    assert!(r.image.windows(10).any(|w| w == b"libc.so.6\0"));
    assert!(r.image.windows(5).any(|w| w == b"puts\0"));
}

#[test]
fn range_loop_with_break() {
    let r = build("total = 0\n@ i in 0..<100 { i >= 10 -> break; total = total + i }\nprintln(total)");
    assert!(r.text_size > 0);
}

#[test]
fn match_with_default() {
    let r = build(
        r#"classify = n => { | n < 0 -> "neg" | n == 0 -> "zero" ~> "pos" }
println(classify(-3))"#,
    );
    assert!(r.image.windows(4).any(|w| w == b"neg\0"));
    assert!(r.image.windows(4).any(|w| w == b"pos\0"));
}

#[test]
fn recursive_guard_match_compiles() {
    // recursive calls inside arms route through the single join
    let r = build(
        "count = n => { | n <= 0 -> 0 ~> count(n - 1) + 1 }\nprintln(count(5))",
    );
    assert!(r.text_size > 0);
}

#[test]
fn channels_arena_defer() {
    let r = build(
        "ch = channel(2)\nsend(ch, 1)\nsend(ch, 2)\nx = recv(ch)\nclose(ch)\narena {\n  s = \"a\" + \"b\"\n  defer { println(s) }\n  println(x)\n}",
    );
    assert!(r.text_size > 0);
}

#[test]
fn lists_and_maps() {
    let r = build(
        "l = [1, 2, 3]\nl[0] <- 9\nm = [\"k\": 1]\nm[\"j\"] <- 2\nprintln(len(l) + len(m))\nprintln(l[5] or! 0)",
    );
    assert!(r.text_size > 0);
}

#[test]
fn error_accessor() {
    let r = build("x = 1/0 or! 0\ncode = (1/0).error\nprintln(code)\nprintln(x)");
    assert!(r.text_size > 0);
}

#[test]
fn compilation_is_idempotent() {
    let src = "import c \"libc.so.6\"\ncounter = 0\n@@ i in 0..<100 { atomic_add(counter, i) }\nmain = () => c.puts(\"done\")";
    let a = compiler().compile_source("same.flap", src).unwrap();
    let b = compiler().compile_source("same.flap", src).unwrap();
    assert_eq!(a.image, b.image, "byte-identical output across runs");
}

#[test]
fn lex_and_parse_errors_are_user_errors() {
    let c = compiler();
    let err = c.compile_source("bad.flap", "\"unterminated").unwrap_err();
    assert_eq!(err.exit_code(), 1);
    let err = c.compile_source("bad.flap", "x = ((1)").unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn codegen_rule_violations_are_semantic_not_parse_errors() {
    // these programs parse cleanly; the diagnosis must not read "parse error"
    for src in ["break", "len(1, 2)", "send(1)"] {
        let err = compiler().compile_source("sem.flap", src).unwrap_err();
        assert!(matches!(err, Error::Semantic { .. }), "for `{src}`: {err}");
        assert_eq!(err.exit_code(), 1);
        assert!(!err.to_string().contains("parse error"));
    }
}

#[test]
fn unresolved_symbol_points_at_the_use() {
    let err = compiler()
        .compile_source("u.flap", "x = 1\ny = missing_thing + x")
        .unwrap_err();
    match err {
        Error::UnresolvedSymbol { line, name, .. } => {
            assert_eq!(line, 2);
            assert_eq!(name, "missing_thing");
        }
        other => panic!("expected UnresolvedSymbol, got {other:?}"),
    }
}

#[test]
fn missing_ffi_prototype_is_reported() {
    let err = compiler()
        .compile_source(
            "f.flap",
            "import c \"libc.so.6\"\nmain = () => c.totally_unknown_fn(1)",
        )
        .unwrap_err();
    assert!(matches!(err, Error::UnresolvedSymbol { .. }));
}

#[test]
fn frame_budget_overflow_aborts() {
    let mut src = String::new();
    for i in 0..200 {
        src.push_str(&format!("v{i} = {i}\n"));
    }
    src.push_str("s = ");
    let terms: Vec<String> = (0..200).map(|i| format!("v{i}")).collect();
    src.push_str(&terms.join(" + "));
    src.push('\n');
    src.push_str("println(s)");

    let tiny = Compiler::new(CompileOptions {
        arch: Arch::X86_64,
        frame_budget: 64,
        ..CompileOptions::default()
    });
    let err = tiny.compile_source("big.flap", &src).unwrap_err();
    assert!(matches!(err, Error::StackFrameOverflow { .. }));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn eager_binding_adds_bind_now() {
    let eager = Compiler::new(CompileOptions {
        arch: Arch::X86_64,
        eager_bind: true,
        ..CompileOptions::default()
    });
    let r = eager
        .compile_source(
            "e.flap",
            "import c \"libc.so.6\"\nmain = () => c.puts(\"x\")",
        )
        .unwrap();
    let lazy = build("import c \"libc.so.6\"\nmain = () => c.puts(\"x\")");
    assert_ne!(r.image.len(), 0);
    // one extra 16-byte dynamic entry
    assert_eq!(r.image.len(), lazy.image.len() + 16);
}

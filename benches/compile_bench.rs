use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flapc::{Arch, CompileOptions, Compiler};

fn bench_compile(c: &mut Criterion) {
    let compiler = Compiler::new(CompileOptions {
        arch: Arch::X86_64,
        ..CompileOptions::default()
    });

    let hello = r#"main = () => println("hi")"#;
    c.bench_function("compile_hello", |b| {
        b.iter(|| {
            compiler
                .compile_source("bench.flap", black_box(hello))
                .unwrap()
        })
    });

    let mut loops = String::from("total = 0\n");
    for i in 0..32 {
        loops.push_str(&format!("@ i{i} in 0..<100 {{ total = total + i{i} }}\n"));
    }
    loops.push_str("println(total)\n");
    c.bench_function("compile_loops", |b| {
        b.iter(|| {
            compiler
                .compile_source("bench.flap", black_box(&loops))
                .unwrap()
        })
    });

    let ffi = "import c \"libc.so.6\"\nmain = () => c.puts(\"done\")";
    c.bench_function("compile_dynamic", |b| {
        b.iter(|| {
            compiler
                .compile_source("bench.flap", black_box(ffi))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);

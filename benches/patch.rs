//! Benchmarks for the `fix-filestreams` patch.
//!
//! Measures the phases separately over a generated module:
//! - Image encoding, decoding and writing a patched image
//! - Planning (walk, scan, resolve)
//! - Applying a plan (import, rewrite, branch fixups)

extern crate cilpatch;

use cilpatch::prelude::*;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

const TYPES: usize = 50;
const METHODS_PER_TYPE: usize = 20;
const CALLS_PER_METHOD: usize = 8;

fn corlib() -> Module {
    let mut corlib = Module::new("mscorlib", AssemblyVersion::new(4, 0, 0, 0), "mscorlib.dll");
    let stream = corlib
        .add_type_def(0x0010_2101, "System.IO", "FileStream", None)
        .unwrap();
    corlib
        .add_type_def(0x0000_0101, "System.IO", "FileMode", None)
        .unwrap();
    corlib
        .add_type_def(0x0000_0101, "System.IO", "FileAccess", None)
        .unwrap();
    for blob in [
        vec![0x20, 0x02, 0x01, 0x0E, 0x11, 0x0C],
        vec![0x20, 0x03, 0x01, 0x0E, 0x11, 0x0C, 0x11, 0x10],
    ] {
        corlib
            .add_method(
                stream,
                MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME,
                ".ctor",
                blob,
                None,
            )
            .unwrap();
    }
    corlib
}

/// One namespace of types, each method opening a few files inside a guarded loop.
fn game() -> Module {
    let mut module = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.exe");
    let corlib = module.add_assembly_ref("mscorlib", AssemblyVersion::new(4, 0, 0, 0));
    let stream = module.add_type_ref(corlib, "System.IO", "FileStream").unwrap();
    module.add_type_ref(corlib, "System.IO", "FileMode").unwrap();
    let ctor = module
        .add_member_ref(stream, ".ctor", vec![0x20, 0x02, 0x01, 0x0E, 0x11, 0x09])
        .unwrap();
    let path = module.add_user_string("Content/level.bin").unwrap();

    for type_index in 0..TYPES {
        let owner = module
            .add_type_def(0x0010_0001, "Game", &format!("Type{type_index}"), None)
            .unwrap();
        for method_index in 0..METHODS_PER_TYPE {
            let mut instructions = vec![Instruction::new(OpCode::BR_S, Operand::Target(0))];
            for _ in 0..CALLS_PER_METHOD {
                instructions.push(Instruction::new(OpCode::LDSTR, Operand::Token(path)));
                instructions.push(Instruction::simple(OpCode::LDC_I4_3));
                instructions.push(Instruction::new(OpCode::NEWOBJ, Operand::Token(ctor)));
                instructions.push(Instruction::simple(OpCode::POP));
            }
            let exit = instructions.len();
            instructions[0] = Instruction::new(OpCode::BR_S, Operand::Target(exit));
            instructions.push(Instruction::simple(OpCode::RET));

            module
                .add_method(
                    owner,
                    MethodAttributes::PUBLIC,
                    &format!("Load{method_index}"),
                    vec![0x20, 0x00, 0x01],
                    Some(MethodBody::new(2, instructions)),
                )
                .unwrap();
        }
    }
    module
}

fn all_types() -> Vec<String> {
    (0..TYPES).map(|index| format!("Game.Type{index}")).collect()
}

fn bench_image_roundtrip(c: &mut Criterion) {
    let fresh = game();
    c.bench_function("image_write", |b| {
        b.iter(|| black_box(fresh.to_bytes().unwrap()));
    });

    let bytes = fresh.to_bytes().unwrap();
    c.bench_function("image_read", |b| {
        b.iter(|| black_box(Module::from_mem(black_box(bytes.clone())).unwrap()));
    });

    let mut patched = Module::from_mem(bytes).unwrap();
    let mut assemblies = InMemoryResolver::new().with_module(corlib());
    let mut patcher = Patcher::new(CtorRewrite::filestream_read_only(), &mut assemblies);
    let plan = patcher.plan(&patched, &all_types()).unwrap();
    patcher.apply(&mut patched, &plan).unwrap();
    c.bench_function("image_write_patched", |b| {
        b.iter(|| black_box(patched.to_bytes().unwrap()));
    });
}

fn bench_plan(c: &mut Criterion) {
    let module = game();
    let types = all_types();

    c.bench_function("patch_plan", |b| {
        b.iter(|| {
            let mut assemblies = InMemoryResolver::new().with_module(corlib());
            let mut patcher = Patcher::new(CtorRewrite::filestream_read_only(), &mut assemblies);
            black_box(patcher.plan(black_box(&module), &types).unwrap())
        });
    });
}

fn bench_apply(c: &mut Criterion) {
    let module = game();
    let types = all_types();
    let mut assemblies = InMemoryResolver::new().with_module(corlib());
    let mut patcher = Patcher::new(CtorRewrite::filestream_read_only(), &mut assemblies);
    let plan = patcher.plan(&module, &types).unwrap();

    c.bench_function("patch_apply", |b| {
        b.iter(|| {
            let mut target = module.clone();
            black_box(patcher.apply(&mut target, black_box(&plan)).unwrap())
        });
    });
}

criterion_group!(benches, bench_image_roundtrip, bench_plan, bench_apply);
criterion_main!(benches);

//! End-to-end tests of the `fix-filestreams` patch.
//!
//! Every test builds its modules on the fly, saves them into a temporary directory and runs
//! the patch against the files, like the command line tool does.

mod common;

use std::{fs, path::Path};

use cilpatch::prelude::*;
use common::{count_calls, count_opcode, install_corlib, instructions, GameBuilder};

fn original() -> ConstructorRef {
    CtorRewrite::filestream_read_only().original_ref()
}

fn replacement() -> ConstructorRef {
    CtorRewrite::filestream_read_only().replacement_ref()
}

fn types(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn worker_calls_become_read_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    install_corlib(dir.path(), "mscorlib");

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);
    let other = game.add_type("Game", "Other", None);
    let load = game.add_opener(worker, "Load", 1);
    let save = game.add_opener(other, "Save", 1);
    let input = game.save(dir.path());
    let output = dir.path().join("Game.patched.exe");

    let request = FixFileStreamsRequest::new(&input, types(&["Worker"])).with_output(&output);
    let report = fix_filestreams(&request, &PatchConfig::default())?;

    assert!(report.written);
    assert_eq!(report.call_sites, 1);
    assert_eq!(report.methods.len(), 1);
    assert_eq!(report.methods[0].name, "Game.Worker::Load");

    let patched = Module::from_file(&output)?;
    let before = instructions(&game.module, load);
    let after = instructions(&patched, load);

    // Everything but the inserted push and the redirected call is unchanged
    assert_eq!(after.len(), before.len() + 1);
    assert_eq!(after[..2], before[..2]);
    assert_eq!(after[2], Instruction::simple(OpCode::LDC_I4_1));
    assert_eq!(after[4..], before[3..]);
    assert_eq!(
        patched.constructor_ref(after[3].token().unwrap())?,
        Some(replacement())
    );

    // Other was not requested
    assert_eq!(instructions(&patched, save), instructions(&game.module, save));
    assert_eq!(count_calls(&patched, save, &original()), 1);

    // The input is untouched when writing elsewhere
    assert_eq!(fs::read(&input)?, game.module.to_bytes()?);
    Ok(())
}

#[test]
fn in_place_patch_leaves_no_temp_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    install_corlib(dir.path(), "mscorlib");

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);
    let load = game.add_opener(worker, "Load", 2);
    let input = game.save(dir.path());

    let report = fix_filestreams(
        &FixFileStreamsRequest::new(&input, types(&["Worker"])),
        &PatchConfig::default(),
    )?;
    assert_eq!(report.output, input);
    assert_eq!(report.call_sites, 2);

    let patched = Module::from_file(&input)?;
    assert_eq!(count_calls(&patched, load, &original()), 0);
    assert_eq!(count_calls(&patched, load, &replacement()), 2);
    assert_eq!(dir_entries(dir.path()), vec!["Game.exe", "mscorlib.dll"]);
    Ok(())
}

#[test]
fn unknown_type_output_is_identical() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);
    game.add_opener(worker, "Load", 3);
    let input = game.save(dir.path());
    let output = dir.path().join("Game.patched.exe");

    // No corlib installed: nothing needs resolving when nothing matches
    let report = fix_filestreams(
        &FixFileStreamsRequest::new(&input, types(&["Settings"])).with_output(&output),
        &PatchConfig::default(),
    )?;

    assert_eq!(report.types_visited, 0);
    assert_eq!(report.call_sites, 0);
    assert!(report.written);
    assert_eq!(fs::read(&output)?, fs::read(&input)?);
    Ok(())
}

#[test]
fn unresolvable_reference_aborts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // Defines FileStream, but is not what the module references
    install_corlib(dir.path(), "System.Runtime");

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);
    game.add_opener(worker, "Load", 1);
    let input = game.save(dir.path());
    let original_bytes = fs::read(&input)?;

    let in_place = fix_filestreams(
        &FixFileStreamsRequest::new(&input, types(&["Worker"])),
        &PatchConfig::default(),
    );
    assert!(matches!(
        in_place,
        Err(Error::TypeNotResolved(name)) if name == "System.IO.FileStream"
    ));
    assert_eq!(fs::read(&input)?, original_bytes);

    let output = dir.path().join("Game.patched.exe");
    let elsewhere = fix_filestreams(
        &FixFileStreamsRequest::new(&input, types(&["Worker"])).with_output(&output),
        &PatchConfig::default(),
    );
    assert!(elsewhere.is_err());
    assert!(!output.exists());
    assert_eq!(dir_entries(dir.path()), vec!["Game.exe", "System.Runtime.dll"]);
    Ok(())
}

#[test]
fn compiled_library_is_patched() -> Result<()> {
    let dir = tempfile::tempdir()?;
    install_corlib(dir.path(), "mscorlib");
    let input = dir.path().join("Worker.dll");
    fs::write(&input, include_bytes!("fixtures/Worker.dll"))?;

    let save = Token::new(0x0600_0001);
    let run = Token::new(0x0600_0004);
    let touch = Token::new(0x0600_0006);
    let original_module = Module::from_file(&input)?;

    let report = fix_filestreams(
        &FixFileStreamsRequest::new(&input, types(&["Worker"])),
        &PatchConfig::default(),
    )?;
    assert_eq!(report.types_visited, 2);
    assert_eq!(report.call_sites, 3);
    assert_eq!(report.methods.len(), 3);

    let patched = Module::from_file(&input)?;
    assert_eq!(count_calls(&patched, save, &replacement()), 1);
    assert_eq!(count_calls(&patched, run, &replacement()), 1);
    assert_eq!(count_calls(&patched, touch, &original()), 1);
    assert_eq!(instructions(&patched, touch), instructions(&original_module, touch));

    // The clause follows the call site, so every index moves by the inserted push
    let handlers = |module: &Module| {
        module.method_def(save).unwrap().body.as_ref().unwrap().exception_handlers().to_vec()
    };
    let (before, after) = (handlers(&original_module), handlers(&patched));
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].try_start, before[0].try_start + 1);
    assert_eq!(after[0].handler_start, before[0].handler_start + 1);
    assert_eq!(after[0].handler_end, before[0].handler_end + 1);

    let call = instructions(&patched, save)
        .iter()
        .find(|instruction| instruction.opcode == OpCode::NEWOBJ)
        .and_then(Instruction::token)
        .unwrap();
    let parent = patched.member_ref(call)?.parent;
    let scope = patched.type_ref(parent)?.resolution_scope;
    assert_eq!(patched.assembly_ref(scope)?.name, "mscorlib");
    Ok(())
}

#[test]
fn every_original_call_is_rewritten() -> Result<()> {
    let dir = tempfile::tempdir()?;
    install_corlib(dir.path(), "mscorlib");

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);
    let methods: Vec<(usize, Token)> = (0..6)
        .map(|calls| (calls, game.add_opener(worker, &format!("Open{calls}"), calls)))
        .collect();
    let input = game.save(dir.path());

    let report = fix_filestreams(
        &FixFileStreamsRequest::new(&input, types(&["Worker"])),
        &PatchConfig::default(),
    )?;
    assert_eq!(report.call_sites, 15);
    assert_eq!(report.methods.len(), 5);

    let patched = Module::from_file(&input)?;
    for (calls, method) in methods {
        assert_eq!(count_opcode(&patched, method, OpCode::LDC_I4_1), calls);
        assert_eq!(count_calls(&patched, method, &replacement()), calls);
        assert_eq!(count_calls(&patched, method, &original()), 0);
    }

    // One imported constructor shared by all call sites
    assert_eq!(patched.member_refs().len(), 2);
    Ok(())
}

#[test]
fn nested_types_are_patched() -> Result<()> {
    let dir = tempfile::tempdir()?;
    install_corlib(dir.path(), "mscorlib");

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);
    let job = game.add_type("", "Job", Some(worker));
    let step = game.add_type("", "Step", Some(job));
    let run = game.add_opener(job, "Run", 1);
    let execute = game.add_opener(step, "Execute", 2);
    let input = game.save(dir.path());

    let report = fix_filestreams(
        &FixFileStreamsRequest::new(&input, types(&["Game.Worker"])),
        &PatchConfig::default(),
    )?;
    assert_eq!(report.types_visited, 3);
    assert_eq!(
        report
            .methods
            .iter()
            .map(|method| method.name.as_str())
            .collect::<Vec<_>>(),
        vec!["Game.Worker/Job::Run", "Game.Worker/Job/Step::Execute"]
    );

    let patched = Module::from_file(&input)?;
    assert_eq!(count_calls(&patched, run, &replacement()), 1);
    assert_eq!(count_calls(&patched, execute, &replacement()), 2);
    Ok(())
}

#[test]
fn patching_twice_is_a_no_op() -> Result<()> {
    let dir = tempfile::tempdir()?;
    install_corlib(dir.path(), "mscorlib");

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);
    let load = game.add_opener(worker, "Load", 3);
    let input = game.save(dir.path());
    let request = FixFileStreamsRequest::new(&input, types(&["Worker"]));

    let first = fix_filestreams(&request, &PatchConfig::default())?;
    let once = fs::read(&input)?;
    let second = fix_filestreams(&request, &PatchConfig::default())?;

    assert_eq!(first.call_sites, 3);
    assert_eq!(second.call_sites, 0);
    assert_eq!(fs::read(&input)?, once);

    let patched = Module::from_file(&input)?;
    assert_eq!(count_opcode(&patched, load, OpCode::LDC_I4_1), 3);
    assert_eq!(count_calls(&patched, load, &replacement()), 3);
    Ok(())
}

#[test]
fn first_defining_reference_wins() -> Result<()> {
    let dir = tempfile::tempdir()?;
    install_corlib(dir.path(), "System.Runtime");
    install_corlib(dir.path(), "mscorlib");

    let mut scopes = Vec::new();
    for run in 0..3 {
        let mut game = GameBuilder::new(&["Missing.Assembly", "System.Runtime", "mscorlib"]);
        let worker = game.add_type("Game", "Worker", None);
        let load = game.add_opener(worker, "Load", 1);
        let input = game.save(dir.path());
        let output = dir.path().join(format!("Game.{run}.exe"));

        fix_filestreams(
            &FixFileStreamsRequest::new(&input, types(&["Worker"])).with_output(&output),
            &PatchConfig::default(),
        )?;

        let patched = Module::from_file(&output)?;
        let call = instructions(&patched, load)[3].token().unwrap();
        let parent = patched.member_ref(call)?.parent;
        let scope = patched.type_ref(parent)?.resolution_scope;
        scopes.push(patched.assembly_ref(scope)?.name.clone());
    }

    assert_eq!(scopes, vec!["System.Runtime"; 3]);
    Ok(())
}

#[test]
fn search_directories_are_used() -> Result<()> {
    let game_dir = tempfile::tempdir()?;
    let framework_dir = tempfile::tempdir()?;
    install_corlib(framework_dir.path(), "mscorlib");

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);
    game.add_opener(worker, "Load", 1);
    let input = game.save(game_dir.path());
    let request = FixFileStreamsRequest::new(&input, types(&["Worker"]));

    assert!(fix_filestreams(&request, &PatchConfig::default()).is_err());

    let config = PatchConfig::default()
        .with_search_input_dir(false)
        .with_search_dir(framework_dir.path());
    assert_eq!(fix_filestreams(&request, &config)?.call_sites, 1);
    Ok(())
}

#[test]
fn branches_follow_the_rewritten_calls() -> Result<()> {
    let dir = tempfile::tempdir()?;
    install_corlib(dir.path(), "mscorlib");

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);

    // br.s over ten opener blocks (120 bytes), each block also a loop target
    let mut body = vec![Instruction::new(OpCode::BR_S, Operand::Target(41))];
    body.extend(common::open_files(game.path, game.two_param, 10));
    body.insert(41, Instruction::new(OpCode::BR, Operand::Target(1)));
    let loop_method = game.add_method(worker, "Loop", MethodBody::new(2, body));
    let input = game.save(dir.path());

    fix_filestreams(
        &FixFileStreamsRequest::new(&input, types(&["Worker"])),
        &PatchConfig::default(),
    )?;

    let patched = Module::from_file(&input)?;
    let after = instructions(&patched, loop_method);
    assert_eq!(after.len(), 53);

    // 130 bytes no longer fit a short branch
    assert_eq!(after[0].opcode, OpCode::BR);
    assert_eq!(after[0].operand, Operand::Target(51));
    assert_eq!(after[51].operand, Operand::Target(1));
    assert_eq!(after[52].opcode, OpCode::RET);
    for block in 0..10 {
        let start = 1 + block * 5;
        assert_eq!(after[start].opcode, OpCode::LDSTR);
        assert_eq!(after[start + 2].opcode, OpCode::LDC_I4_1);
        assert_eq!(after[start + 3].opcode, OpCode::NEWOBJ);
    }
    Ok(())
}

#[test]
fn dry_run_writes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    install_corlib(dir.path(), "mscorlib");

    let mut game = GameBuilder::new(&["mscorlib"]);
    let worker = game.add_type("Game", "Worker", None);
    game.add_opener(worker, "Load", 2);
    let input = game.save(dir.path());
    let output = dir.path().join("Game.patched.exe");

    let report = fix_filestreams(
        &FixFileStreamsRequest::new(&input, types(&["Worker"])).with_output(&output),
        &PatchConfig::default().with_dry_run(true),
    )?;

    assert!(!report.written);
    assert_eq!(report.call_sites, 2);
    assert!(!output.exists());
    Ok(())
}

#[test]
fn request_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("Missing.exe");

    assert!(matches!(
        fix_filestreams(
            &FixFileStreamsRequest::new(&missing, Vec::new()),
            &PatchConfig::default()
        ),
        Err(Error::Error(_))
    ));
    assert!(matches!(
        fix_filestreams(
            &FixFileStreamsRequest::new(&missing, types(&["Worker"])),
            &PatchConfig::default()
        ),
        Err(Error::FileError(_))
    ));

    let garbage = dir.path().join("Garbage.exe");
    fs::write(&garbage, b"MZ\x90\x00 definitely not a module").unwrap();
    assert!(matches!(
        fix_filestreams(
            &FixFileStreamsRequest::new(&garbage, types(&["Worker"])),
            &PatchConfig::default()
        ),
        Err(Error::GoblinErr(_))
    ));
}

//! Whole-program generation
//!
//! Block ordering, register spilling, error modes, the data section and the
//! file-level API.

use std::fs;
use tpc::{BackendConfig, CodeGenError, ErrorMode, compile_file, compile_json, compile_program, order_json};
use tpc_core::{
    AsmLine, FrameDecl, Instruction, IrOp, IrProgram, MachineBlock, Opcode, ProgramBuilder,
};

fn instructions(block: &MachineBlock) -> Vec<String> {
    block.instructions().map(Instruction::to_string).collect()
}

fn chain_program(calls: &[(&str, Option<&str>)]) -> IrProgram {
    let mut pb = ProgramBuilder::new();
    for (id, _) in calls.iter().enumerate() {
        pb.frame(FrameDecl::function(id as u32));
    }
    for (id, (name, callee)) in calls.iter().enumerate() {
        let mut b = pb.block(id as u32);
        b.label(name);
        b.push(IrOp::MethodStart);
        if let Some(callee) = callee {
            b.call(callee, 0, 0);
        }
        b.push(IrOp::MethodEnd);
        b.finish();
    }
    pb.build()
}

/// main: (1 + (2 + (3 + 4))) into local 0
fn deep_expression() -> IrProgram {
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0).with_locals(1));
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    for value in 1..=4 {
        b.constant(value);
    }
    b.push(IrOp::Add);
    b.push(IrOp::Add);
    b.push(IrOp::Add);
    b.push(IrOp::StoreLocal { index: 0 });
    b.push(IrOp::MethodEnd);
    b.finish();
    pb.build()
}

#[test]
fn test_callees_are_generated_first() {
    let program = chain_program(&[("f", Some("g")), ("g", Some("h")), ("h", None)]);
    let blocks = compile_program(&program, &BackendConfig::default()).unwrap();
    let names: Vec<&str> = blocks.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["h", "g", "f"]);
}

#[test]
fn test_cycle_aborts_compilation() {
    let program = chain_program(&[("f", Some("g")), ("g", Some("f"))]);
    match compile_program(&program, &BackendConfig::default()) {
        Err(CodeGenError::CallGraphCycle(path)) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"f".to_string()));
        }
        other => panic!("Expected CallGraphCycle, got {:?}", other),
    }
}

#[test]
fn test_fourth_value_is_spilled() {
    let blocks = compile_program(&deep_expression(), &BackendConfig::default()).unwrap();
    assert_eq!(
        instructions(&blocks[0]),
        vec![
            "ajw -3", "ldc 1", "stl 1", "ldc 2", "ldc 3", "ldc 4", "add", "add", "ldl 1", "rev",
            "add", "stl 2", "ajw 3", "ret",
        ]
    );
}

#[test]
fn test_branch_with_pending_value_is_fatal() {
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0));
    let done = pb.reserve();
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    b.constant(1);
    let branch = b.push(IrOp::Branch { target: done });
    b.push_reserved(done, IrOp::Label { name: None });
    b.push(IrOp::MethodEnd);
    b.finish();
    let program = pb.build();

    for mode in [ErrorMode::Strict, ErrorMode::Suppress] {
        let config = BackendConfig::new().with_error_mode(mode);
        match compile_program(&program, &config) {
            Err(CodeGenError::PendingValuesAtJump { at, pending }) => {
                assert_eq!(at, branch);
                assert_eq!(pending, 1);
            }
            other => panic!("Expected PendingValuesAtJump, got {:?}", other),
        }
    }
}

#[test]
fn test_conditional_branch_pops_after_label() {
    // if local0 then local0 := 1
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0).with_locals(1));
    let skip = pb.reserve();
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    b.push(IrOp::LoadLocal { index: 0 });
    b.push(IrOp::BranchIfFalse { target: skip });
    b.constant(1);
    b.push(IrOp::StoreLocal { index: 0 });
    b.push_reserved(skip, IrOp::Label { name: None });
    b.push(IrOp::MethodEnd);
    b.finish();

    let blocks = compile_program(&pb.build(), &BackendConfig::default()).unwrap();
    let label = format!("main_{}", skip);
    let at = blocks[0]
        .lines
        .iter()
        .position(|l| *l == AsmLine::Label(label.clone()))
        .unwrap();
    assert_eq!(
        blocks[0].lines[at + 1],
        AsmLine::Instr(Instruction::op(Opcode::Pop))
    );
    assert!(instructions(&blocks[0]).contains(&format!("cj {}", label)));
}

fn program_with_unknown_intrinsic() -> IrProgram {
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0).with_locals(1));
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    b.push(IrOp::Intrinsic {
        name: "frobnicate".to_string(),
        pops: 0,
        pushes: 1,
    });
    b.push(IrOp::StoreLocal { index: 0 });
    b.push(IrOp::LoadLocal { index: 9 });
    b.push(IrOp::StoreLocal { index: 0 });
    b.push(IrOp::MethodEnd);
    b.finish();
    pb.build()
}

#[test]
fn test_strict_mode_stops_at_first_error() {
    match compile_program(&program_with_unknown_intrinsic(), &BackendConfig::default()) {
        Err(CodeGenError::Unsupported { construct }) => {
            assert!(construct.contains("frobnicate"));
        }
        other => panic!("Expected Unsupported, got {:?}", other),
    }
}

#[test]
fn test_suppress_mode_leaves_placeholders() {
    let config = BackendConfig::new().with_error_mode(ErrorMode::Suppress);
    let blocks = compile_program(&program_with_unknown_intrinsic(), &config).unwrap();
    let placeholders: Vec<&AsmLine> = blocks[0]
        .lines
        .iter()
        .filter(|l| matches!(l, AsmLine::Unrecognized { .. }))
        .collect();
    assert_eq!(
        placeholders,
        vec![
            &AsmLine::Unrecognized {
                construct: "frobnicate".to_string()
            },
            &AsmLine::Unrecognized {
                construct: "load_local".to_string()
            },
        ]
    );
    // Both stores still happen.
    assert_eq!(blocks[0].count(Opcode::Stl), 2);
}

#[test]
fn test_globals_section() {
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0));
    pb.global("counter", "int", 4);
    pb.global("flag", "byte", 1);
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    let load = b.push(IrOp::LoadGlobal {
        name: "counter".to_string(),
    });
    b.constant(1);
    b.push(IrOp::Add);
    let store = b.push(IrOp::StoreGlobal {
        name: "counter".to_string(),
    });
    b.push(IrOp::MethodEnd);
    b.finish();

    let blocks = compile_program(&pb.build(), &BackendConfig::default()).unwrap();
    assert_eq!(blocks.len(), 2);
    let data = &blocks[1];
    assert_eq!(data.name, "globals");
    assert_eq!(
        data.lines,
        vec![
            AsmLine::Label("G_counter".to_string()),
            AsmLine::Reserve { bytes: 4 },
            AsmLine::Label("G_flag".to_string()),
            AsmLine::Reserve { bytes: 4 },
        ]
    );

    let code = instructions(&blocks[0]);
    assert!(code.contains(&format!("ldc G_counter - main_{}_pc", load)));
    assert!(code.contains(&format!("ldc G_counter - main_{}_pc", store)));
    assert_eq!(blocks[0].count(Opcode::Ldpi), 2);
    assert_eq!(code.iter().filter(|i| *i == "stnl 0").count(), 1);
}

#[test]
fn test_no_globals_no_data_block() {
    let blocks = compile_program(&deep_expression(), &BackendConfig::default()).unwrap();
    assert_eq!(blocks.len(), 1);
}

#[test]
fn test_unknown_global() {
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0));
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    b.constant(1);
    b.push(IrOp::StoreGlobal {
        name: "nowhere".to_string(),
    });
    b.push(IrOp::MethodEnd);
    b.finish();
    assert!(matches!(
        compile_program(&pb.build(), &BackendConfig::default()),
        Err(CodeGenError::UnknownGlobal(_))
    ));
}

#[test]
fn test_channel_io_and_timer() {
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0).with_channels(1).with_locals(1));
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    b.constant(42);
    b.push(IrOp::LoadChannel { index: 0 });
    b.push(IrOp::ChannelWrite);
    b.push(IrOp::LoadChannel { index: 0 });
    b.push(IrOp::ChannelRead);
    b.push(IrOp::TimerRead);
    b.push(IrOp::Add);
    b.push(IrOp::StoreLocal { index: 0 });
    b.push(IrOp::MethodEnd);
    b.finish();

    let blocks = compile_program(&pb.build(), &BackendConfig::default()).unwrap();
    let code = instructions(&blocks[0]);
    // channel word at fixed base 1, local at 2
    assert_eq!(
        code,
        vec![
            "ajw -3", "mint", "stl 1", "ldc 42", "ldlp 1", "rev", "outword", "ldlp 1", "ldlp 0",
            "rev", "ldc 4", "in", "ldl 0", "ldtimer", "add", "stl 2", "ajw 3", "ret",
        ]
    );
}

#[test]
fn test_compile_json_file() {
    let json = r#"{
        "frames": [{ "id": 0, "kind": "function", "locals": 1 }],
        "blocks": [{
            "frame": 0,
            "instructions": [
                { "id": 0, "op": "label", "name": "main" },
                { "id": 1, "op": "method_start" },
                { "id": 2, "op": "const", "value": 6 },
                { "id": 3, "op": "const", "value": 7 },
                { "id": 4, "op": "mul" },
                { "id": 5, "op": "store_local", "index": 0 },
                { "id": 6, "op": "method_end" }
            ]
        }]
    }"#;

    let text = compile_json(json, &BackendConfig::default()).unwrap();
    assert!(text.starts_with("; main\nmain:\n"));
    assert!(text.contains("    mul\n"));

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("main.json");
    let output = dir.path().join("main.s");
    fs::write(&input, json).unwrap();
    compile_file(&input, &output, &BackendConfig::default()).unwrap();
    assert_eq!(fs::read_to_string(&output).unwrap(), text);

    assert_eq!(order_json(json).unwrap(), vec!["main"]);
}

#[test]
fn test_invalid_json_is_reported() {
    let err = compile_json("{ not json", &BackendConfig::default()).unwrap_err();
    assert!(err.contains("Failed to parse IR"));
}

#[test]
fn test_word_size_sets_channel_transfer() {
    let json = r#"{
        "frames": [{ "id": 0, "kind": "function", "locals": 1, "channels": 1 }],
        "blocks": [{
            "frame": 0,
            "instructions": [
                { "id": 0, "op": "label", "name": "main" },
                { "id": 1, "op": "method_start" },
                { "id": 2, "op": "load_channel", "index": 0 },
                { "id": 3, "op": "channel_read" },
                { "id": 4, "op": "store_local", "index": 0 },
                { "id": 5, "op": "method_end" }
            ]
        }]
    }"#;
    let text = compile_json(json, &BackendConfig::new().with_word_bytes(2)).unwrap();
    assert!(text.contains("    ldc 2\n    in\n"));
}

#[test]
fn test_backward_jump_loop() {
    // while local0 do local0 := local0 - 1
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0).with_locals(1));
    let top = pb.reserve();
    let done = pb.reserve();
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    b.push_reserved(top, IrOp::Label { name: None });
    b.push(IrOp::LoadLocal { index: 0 });
    b.push(IrOp::BranchIfFalse { target: done });
    b.push(IrOp::LoadLocal { index: 0 });
    b.constant(1);
    b.push(IrOp::Sub);
    b.push(IrOp::StoreLocal { index: 0 });
    b.push(IrOp::Branch { target: top });
    b.push_reserved(done, IrOp::Label { name: None });
    b.push(IrOp::MethodEnd);
    b.finish();

    let blocks = compile_program(&pb.build(), &BackendConfig::default()).unwrap();
    let (top, done) = (format!("main_{}", top), format!("main_{}", done));
    assert_eq!(
        instructions(&blocks[0]),
        vec![
            "ajw -1".to_string(),
            "ldl 1".to_string(),
            format!("cj {}", done),
            "ldl 1".to_string(),
            "ldc 1".to_string(),
            "sub".to_string(),
            "stl 1".to_string(),
            format!("j {}", top),
            "pop".to_string(),
            "ajw 1".to_string(),
            "ret".to_string(),
        ]
    );
    assert_eq!(
        blocks[0].labels().collect::<Vec<_>>(),
        vec!["main", top.as_str(), done.as_str()]
    );
}

#[test]
fn test_plain_block_continues_its_function() {
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0).with_locals(1));
    let tail = pb.reserve();
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    b.constant(7);
    b.push(IrOp::StoreLocal { index: 0 });
    b.push(IrOp::Branch { target: tail });
    b.finish();
    let mut b = pb.block(0);
    b.push_reserved(tail, IrOp::Label { name: None });
    b.push(IrOp::MethodEnd);
    b.finish();

    let blocks = compile_program(&pb.build(), &BackendConfig::default()).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].name, "main");
    let tail = format!("main_{}", tail);
    assert_eq!(
        instructions(&blocks[0]),
        vec!["ajw -2", "ldc 7", "stl 1", &format!("j {}", tail), "ajw 2", "ret"]
    );
    assert_eq!(blocks[0].labels().collect::<Vec<_>>(), vec!["main", tail.as_str()]);
}

#[test]
fn test_jump_into_another_function_is_malformed() {
    let mut pb = ProgramBuilder::new();
    pb.frame(FrameDecl::function(0));
    pb.frame(FrameDecl::function(1));
    let elsewhere = pb.reserve();
    let mut b = pb.block(0);
    b.label("main");
    b.push(IrOp::MethodStart);
    b.push(IrOp::Branch { target: elsewhere });
    b.finish();
    let mut b = pb.block(1);
    b.label("other");
    b.push(IrOp::MethodStart);
    b.push_reserved(elsewhere, IrOp::Label { name: None });
    b.push(IrOp::MethodEnd);
    b.finish();

    assert!(matches!(
        compile_program(&pb.build(), &BackendConfig::default()),
        Err(CodeGenError::Malformed(_))
    ));
}

#[test]
fn test_two_named_blocks_in_one_frame_are_malformed() {
    let program = {
        let mut pb = ProgramBuilder::new();
        pb.frame(FrameDecl::function(0));
        for name in ["first", "second"] {
            let mut b = pb.block(0);
            b.label(name);
            b.push(IrOp::MethodStart);
            b.push(IrOp::MethodEnd);
            b.finish();
        }
        pb.build()
    };
    match compile_program(&program, &BackendConfig::default()) {
        Err(CodeGenError::Malformed(message)) => assert!(message.contains("runs both")),
        other => panic!("Expected Malformed, got {:?}", other),
    }
}

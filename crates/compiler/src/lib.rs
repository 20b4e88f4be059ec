//! Transputer Backend Library
//!
//! Lowers a stack-oriented IR into symbolic transputer assembly.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tpc::{BackendConfig, compile_program, render};
//!
//! let blocks = compile_program(&program, &BackendConfig::default())?;
//! print!("{}", render(&blocks));
//! ```
//!
//! Programs are built with [`tpc_core::ProgramBuilder`] or read from JSON.

pub mod call_graph;
pub mod codegen;
pub mod config;

pub use call_graph::CallGraph;
pub use codegen::{CodeGen, CodeGenError};
pub use config::{BackendConfig, ErrorMode};
pub use tpc_core::{IrProgram, MachineBlock};

use std::fs;
use std::path::Path;
use tracing::info;

/// Compile a program to machine blocks, callees first, data last.
pub fn compile_program(program: &IrProgram, config: &BackendConfig) -> Result<Vec<MachineBlock>, CodeGenError> {
    let mut codegen = CodeGen::new(program, config.clone())?;
    codegen.generate()
}

/// Render machine blocks as assembler text.
pub fn render(blocks: &[MachineBlock]) -> String {
    blocks
        .iter()
        .map(MachineBlock::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn parse_program(json: &str) -> Result<IrProgram, String> {
    serde_json::from_str(json).map_err(|e| format!("Failed to parse IR: {}", e))
}

/// Compile a JSON-encoded program to assembler text.
pub fn compile_json(json: &str, config: &BackendConfig) -> Result<String, String> {
    let program = parse_program(json)?;
    let blocks = compile_program(&program, config).map_err(|e| e.to_string())?;
    Ok(render(&blocks))
}

/// Compile an IR file to an assembler file.
pub fn compile_file(input: &Path, output: &Path, config: &BackendConfig) -> Result<(), String> {
    let json = fs::read_to_string(input).map_err(|e| format!("Failed to read IR file: {}", e))?;
    let text = compile_json(&json, config)?;
    fs::write(output, text).map_err(|e| format!("Failed to write output file: {}", e))?;
    info!(input = %input.display(), output = %output.display(), "compiled");
    Ok(())
}

/// Block names of a JSON-encoded program in generation order.
pub fn order_json(json: &str) -> Result<Vec<String>, String> {
    let program = parse_program(json)?;
    let graph = CallGraph::build(&program).map_err(|e| e.to_string())?;
    let order = graph.order().map_err(|e| e.to_string())?;
    Ok(order.into_iter().map(|i| graph.display_name(i)).collect())
}

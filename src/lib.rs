//! Crate root: wires together the compilation pipeline.
//!
//! The stages are small and run strictly one after another:
//! - `tokenizer` performs lexical analysis and produces a flat token stream.
//! - `parser` owns all syntactic knowledge and returns the functions of the
//!   program, each with its resolved locals and frame size.
//! - `codegen` lowers the parsed program into x86-64 Intel-syntax assembly.
//! - `ty` holds the type tags and the alignment helper.
//! - `error` centralises reporting utilities shared by the other modules.

pub mod error;
pub mod parser;
pub mod tokenizer;
pub mod ty;

mod codegen;

pub use error::{CompileError, CompileResult};

/// Compile a source string into Intel-syntax assembly.
pub fn generate_assembly(source: &str) -> CompileResult<String> {
  let tokens = tokenizer::tokenize(source)?;
  let program = parser::parse(tokens, source)?;
  Ok(codegen::generate(&program))
}

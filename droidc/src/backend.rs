pub mod assembly_compiler;
pub mod cache;
pub mod compiler;
pub mod compiler_utils;
pub mod peephole;
pub mod pre_compilation;
pub mod structure;

pub use assembly_compiler::{build, BuildReport};

pub mod arena;
mod asm;
mod bytecode;
mod cancel;
mod config;
pub mod convert;
mod error;
mod ffi;
pub mod heap;
mod lexer;
mod logging;
mod opcode;
mod stdlib;
mod thread;
mod value;
mod vm;

pub use self::{
    asm::*, bytecode::*, cancel::*, config::*, error::*, ffi::*, heap::{CollectStats, HeapStats},
    lexer::*, logging::*, opcode::*, stdlib::*, thread::*, value::*, vm::*,
};

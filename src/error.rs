use crate::{OperandKind, Opcode, ValueKind};
use thiserror::Error;

/// Capacity of the last-error buffer, terminator included.
pub const LAST_ERROR_SIZE: usize = 512;

/// Conditions that can only arise from malformed bytecode or a misbehaving
/// native function. They are never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("stack underflow")]
    StackUnderflow,

    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: ValueKind, found: ValueKind },

    #[error("variable slot {index} is out of range for a frame of {len} slots")]
    BadVariable { index: i64, len: usize },

    #[error("no active variable frame")]
    NoFrame,

    #[error("operand of instruction at {0} runs past the end of the code")]
    TruncatedOperand(usize),

    #[error("constant {0} does not exist")]
    BadConstant(usize),

    #[error("label offset {0} lies outside the code stream")]
    BadLabel(usize),

    #[error("call depth limit exceeded ({0})")]
    CallDepthExceeded(usize),

    #[error("operand stack limit exceeded ({0})")]
    StackOverflow(usize),

    #[error("stale list reference (epoch {found}, heap is at epoch {current})")]
    StaleList { found: u32, current: u32 },

    #[error("cannot convert {0} value")]
    BadConversion(ValueKind),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("assertion failed: {0}")]
    Fault(#[from] Fault),

    #[error("Heap out of memory. Tried to allocate {requested} bytes but only {free} bytes were free")]
    OutOfMemory { requested: usize, free: usize },

    #[error("Called run instruction, but no run function resolver has been attached")]
    NoResolver,

    #[error("Function \"{0}\" does not exist at runtime")]
    UnresolvedFunction(String),

    #[error("Illegal op: {0}")]
    IllegalOpcode(u8),

    #[error("Bytecode with name \"{0}\" is not found")]
    ChunkNotFound(String),

    #[error("Label with name \"{label}\" is not found in bytecode \"{chunk}\"")]
    LabelNotFound { chunk: String, label: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("execution cancelled")]
    Cancelled,

    #[error("{0}")]
    Native(String),

    #[error("Could not allocate memory for allocator: {0}")]
    Arena(String),

    #[error("worker thread panicked")]
    WorkerPanicked,
}

impl ExecError {
    pub fn native(message: impl Into<String>) -> Self {
        ExecError::Native(message.into())
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, ExecError::Fault(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("constant pool of \"{0}\" is full")]
    ConstantPoolFull(String),

    #[error("label id {0} does not exist")]
    UnknownLabel(usize),

    #[error("label \"{0}\" is already placed")]
    LabelAlreadyPlaced(String),

    #[error("label \"{0}\" is referenced but never placed")]
    UnplacedLabel(String),

    #[error("{opcode} does not take an operand")]
    UnexpectedOperand { opcode: Opcode },

    #[error("{opcode} takes a {expected} operand, got {found}")]
    OperandMismatch {
        opcode: Opcode,
        expected: OperandKind,
        found: OperandKind,
    },

    #[error("{opcode} requires a {expected} operand")]
    MissingOperand { opcode: Opcode, expected: OperandKind },
}

/// Truncates `message` to fit the last-error buffer without splitting a char.
pub fn bounded_message(message: &str) -> String {
    if message.len() < LAST_ERROR_SIZE {
        return message.to_string();
    }
    let mut end = LAST_ERROR_SIZE - 1;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

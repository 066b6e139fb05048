use std::fmt;

/// Instruction set of the bytecode executor.
///
/// Every opcode is a single byte. Opcodes with an operand are followed by a
/// big-endian `u16` index into the chunk's constant pool.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Illegal = 0,
    PushN = 1,
    PushI,
    PushF,
    PushB,
    PushL,
    PushLb,
    PushFn,
    Pop,
    PopC,
    Dup,
    Load,
    Store,

    // Integer arithmetic
    AddI,
    SubI,
    MulI,
    DivI,
    ModI,

    // Bitwise
    NotI,
    AndI,
    OrI,
    XorI,

    // Float arithmetic
    AddF,
    SubF,
    MulF,
    DivF,
    ModF,

    // Boolean algebra
    Not,
    And,
    Or,
    Xor,

    // Comparisons
    LessI,
    MoreI,
    LessF,
    MoreF,
    LessEqI,
    MoreEqI,
    LessEqF,
    MoreEqF,
    Eq,
    Neq,

    // Conversions
    IToF,
    IToB,
    IToA,
    FToI,
    FToB,
    FToA,
    BToI,
    BToF,
    BToA,
    AToI,
    AToF,
    AToB,
    LToA,
    NToA,
    ToI,
    ToF,
    ToB,
    ToA,

    // Lists
    AddL,
    IndexL,
    SetL,
    InsertL,
    DelL,
    LenL,

    // Branching
    Jmp,
    If,
    Call,
    Run,
    DynJmp,
    DynIf,
    DynCall,
    DynRun,
    Ret,
}

/// Literal type an operand-bearing opcode expects in its constant slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Int,
    Float,
    Bool,
    Func,
    Label,
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OperandKind::Int => "int",
            OperandKind::Float => "float",
            OperandKind::Bool => "bool",
            OperandKind::Func => "func",
            OperandKind::Label => "label",
        };
        write!(f, "{}", name)
    }
}

pub const OPERAND_LEN: usize = 2;

static OPCODES: [Opcode; 74] = [
    Opcode::Illegal,
    Opcode::PushN,
    Opcode::PushI,
    Opcode::PushF,
    Opcode::PushB,
    Opcode::PushL,
    Opcode::PushLb,
    Opcode::PushFn,
    Opcode::Pop,
    Opcode::PopC,
    Opcode::Dup,
    Opcode::Load,
    Opcode::Store,
    Opcode::AddI,
    Opcode::SubI,
    Opcode::MulI,
    Opcode::DivI,
    Opcode::ModI,
    Opcode::NotI,
    Opcode::AndI,
    Opcode::OrI,
    Opcode::XorI,
    Opcode::AddF,
    Opcode::SubF,
    Opcode::MulF,
    Opcode::DivF,
    Opcode::ModF,
    Opcode::Not,
    Opcode::And,
    Opcode::Or,
    Opcode::Xor,
    Opcode::LessI,
    Opcode::MoreI,
    Opcode::LessF,
    Opcode::MoreF,
    Opcode::LessEqI,
    Opcode::MoreEqI,
    Opcode::LessEqF,
    Opcode::MoreEqF,
    Opcode::Eq,
    Opcode::Neq,
    Opcode::IToF,
    Opcode::IToB,
    Opcode::IToA,
    Opcode::FToI,
    Opcode::FToB,
    Opcode::FToA,
    Opcode::BToI,
    Opcode::BToF,
    Opcode::BToA,
    Opcode::AToI,
    Opcode::AToF,
    Opcode::AToB,
    Opcode::LToA,
    Opcode::NToA,
    Opcode::ToI,
    Opcode::ToF,
    Opcode::ToB,
    Opcode::ToA,
    Opcode::AddL,
    Opcode::IndexL,
    Opcode::SetL,
    Opcode::InsertL,
    Opcode::DelL,
    Opcode::LenL,
    Opcode::Jmp,
    Opcode::If,
    Opcode::Call,
    Opcode::Run,
    Opcode::DynJmp,
    Opcode::DynIf,
    Opcode::DynCall,
    Opcode::DynRun,
    Opcode::Ret,
];

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        OPCODES.get(byte as usize).copied()
    }

    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        OPCODES
            .iter()
            .skip(1)
            .find(|opcode| opcode.mnemonic() == name)
            .copied()
    }

    pub fn operand(self) -> Option<OperandKind> {
        match self {
            Opcode::PushI | Opcode::PopC | Opcode::Load | Opcode::Store => {
                Some(OperandKind::Int)
            }
            Opcode::PushF => Some(OperandKind::Float),
            Opcode::PushB => Some(OperandKind::Bool),
            Opcode::PushFn | Opcode::Run => Some(OperandKind::Func),
            Opcode::PushLb | Opcode::Jmp | Opcode::If | Opcode::Call => {
                Some(OperandKind::Label)
            }
            _ => None,
        }
    }

    /// Encoded size of the instruction in bytes, opcode included.
    pub fn width(self) -> usize {
        match self.operand() {
            Some(_) => 1 + OPERAND_LEN,
            None => 1,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Illegal => "illegal",
            Opcode::PushN => "pushn",
            Opcode::PushI => "pushi",
            Opcode::PushF => "pushf",
            Opcode::PushB => "pushb",
            Opcode::PushL => "pushl",
            Opcode::PushLb => "pushlb",
            Opcode::PushFn => "pushfn",
            Opcode::Pop => "pop",
            Opcode::PopC => "popc",
            Opcode::Dup => "dup",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::AddI => "addi",
            Opcode::SubI => "subi",
            Opcode::MulI => "muli",
            Opcode::DivI => "divi",
            Opcode::ModI => "modi",
            Opcode::NotI => "noti",
            Opcode::AndI => "andi",
            Opcode::OrI => "ori",
            Opcode::XorI => "xori",
            Opcode::AddF => "addf",
            Opcode::SubF => "subf",
            Opcode::MulF => "mulf",
            Opcode::DivF => "divf",
            Opcode::ModF => "modf",
            Opcode::Not => "not",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::LessI => "lessi",
            Opcode::MoreI => "morei",
            Opcode::LessF => "lessf",
            Opcode::MoreF => "moref",
            Opcode::LessEqI => "lesseqi",
            Opcode::MoreEqI => "moreeqi",
            Opcode::LessEqF => "lesseqf",
            Opcode::MoreEqF => "moreeqf",
            Opcode::Eq => "eq",
            Opcode::Neq => "neq",
            Opcode::IToF => "itof",
            Opcode::IToB => "itob",
            Opcode::IToA => "itoa",
            Opcode::FToI => "ftoi",
            Opcode::FToB => "ftob",
            Opcode::FToA => "ftoa",
            Opcode::BToI => "btoi",
            Opcode::BToF => "btof",
            Opcode::BToA => "btoa",
            Opcode::AToI => "atoi",
            Opcode::AToF => "atof",
            Opcode::AToB => "atob",
            Opcode::LToA => "ltoa",
            Opcode::NToA => "ntoa",
            Opcode::ToI => "toi",
            Opcode::ToF => "tof",
            Opcode::ToB => "tob",
            Opcode::ToA => "toa",
            Opcode::AddL => "addl",
            Opcode::IndexL => "indexl",
            Opcode::SetL => "setl",
            Opcode::InsertL => "insertl",
            Opcode::DelL => "dell",
            Opcode::LenL => "lenl",
            Opcode::Jmp => "jmp",
            Opcode::If => "if",
            Opcode::Call => "call",
            Opcode::Run => "run",
            Opcode::DynJmp => "dynjmp",
            Opcode::DynIf => "dynif",
            Opcode::DynCall => "dyncall",
            Opcode::DynRun => "dynrun",
            Opcode::Ret => "ret",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

use crate::NativeFn;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nothing,
    Byte,
    Int,
    Float,
    Bool,
    List,
    Function,
    Label,
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            ValueKind::Nothing => "nothing",
            ValueKind::Byte => "byte",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
            ValueKind::List => "list",
            ValueKind::Function => "func",
            ValueKind::Label => "label",
        };
        write!(f, "{}", name)
    }
}

/// Handle to a list object living in the executor's active heap space.
///
/// Handles are only valid for the collection epoch they were produced in.
/// Collections rewrite every handle reachable from the operand stack and the
/// variable frames, so code that needs a list across an allocation must read
/// it back from one of those roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListRef {
    pub(crate) offset: u32,
    pub(crate) epoch: u32,
}

impl ListRef {
    pub fn offset(self) -> usize {
        self.offset as usize
    }

    pub fn epoch(self) -> u32 {
        self.epoch
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub hint: Option<Arc<str>>,
    pub native: Option<NativeFn>,
}

impl Function {
    pub fn by_hint(hint: &str) -> Self {
        Self {
            hint: Some(Arc::from(hint)),
            native: None,
        }
    }

    pub fn by_native(native: NativeFn) -> Self {
        Self {
            hint: None,
            native: Some(native),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.native.is_some()
    }

    /// Structural identity used by the constant pool.
    pub fn same_bits(&self, other: &Function) -> bool {
        let natives = match (&self.native, &other.native) {
            (Some(left), Some(right)) => left.ptr_eq(right),
            (None, None) => true,
            _ => false,
        };
        natives && self.hint == other.hint
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Function) -> bool {
        match (&self.native, &other.native, &self.hint, &other.hint) {
            (Some(left), Some(right), _, _) => left.ptr_eq(right),
            (_, _, Some(left), Some(right)) => left == right,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub name: Arc<str>,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nothing,
    Byte(u8),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(ListRef),
    Function(Function),
    Label(Label),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nothing => ValueKind::Nothing,
            Value::Byte(_) => ValueKind::Byte,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Bool(_) => ValueKind::Bool,
            Value::List(_) => ValueKind::List,
            Value::Function(_) => ValueKind::Function,
            Value::Label(_) => ValueKind::Label,
        }
    }

    /// Equality as observed by the `eq`/`neq` instructions. Values of
    /// different kinds are never equal, floats compare numerically, lists by
    /// identity and labels by code offset.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nothing, Value::Nothing) => true,
            (Value::Byte(left), Value::Byte(right)) => left == right,
            (Value::Int(left), Value::Int(right)) => left == right,
            (Value::Float(left), Value::Float(right)) => left == right,
            (Value::Bool(left), Value::Bool(right)) => left == right,
            (Value::List(left), Value::List(right)) => left.offset == right.offset,
            (Value::Function(left), Value::Function(right)) => left == right,
            (Value::Label(left), Value::Label(right)) => left.pos == right.pos,
            _ => false,
        }
    }

    /// Identity of the bit pattern, used to deduplicate constants. Unlike
    /// `equals`, `0.0` and `-0.0` differ and identical NaNs match.
    pub fn same_bits(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nothing, Value::Nothing) => true,
            (Value::Byte(left), Value::Byte(right)) => left == right,
            (Value::Int(left), Value::Int(right)) => left == right,
            (Value::Float(left), Value::Float(right)) => left.to_bits() == right.to_bits(),
            (Value::Bool(left), Value::Bool(right)) => left == right,
            (Value::List(left), Value::List(right)) => left == right,
            (Value::Function(left), Value::Function(right)) => left.same_bits(right),
            (Value::Label(left), Value::Label(right)) => left == right,
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Value::Nothing => write!(f, "nothing"),
            Value::Byte(v) if v.is_ascii_graphic() || *v == b' ' => {
                write!(f, "byte '{}' {:02x}", *v as char, v)
            }
            Value::Byte(v) => write!(f, "byte {:02x}", v),
            Value::Int(v) => write!(f, "int {}", v),
            Value::Float(v) => write!(f, "float {}", crate::convert::format_g(*v)),
            Value::Bool(v) => write!(f, "bool {}", v),
            Value::List(list) => write!(f, "list 0x{:x}", list.offset),
            Value::Function(func) => match (&func.hint, &func.native) {
                (Some(hint), Some(_)) => write!(f, "func \"{}\" (resolved)", hint),
                (Some(hint), None) => write!(f, "func \"{}\"", hint),
                (None, Some(native)) => write!(f, "func {:?}", native),
                (None, None) => write!(f, "func inval"),
            },
            Value::Label(label) => write!(f, "label <{}>", label.name),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::Byte(value)
    }
}

use crate::{BuildError, Function, Label, OperandKind, Opcode, Value};
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

/// Index into a chunk's constant pool.
pub type ConstId = u16;

/// Stable index into a chunk's label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub usize);

pub const MAX_CONSTANTS: usize = ConstId::MAX as usize + 1;

#[derive(Debug, Clone, PartialEq)]
pub struct LabelEntry {
    pub name: Arc<str>,
    pub pos: usize,
}

/// A named, finished unit of bytecode.
///
/// The only mutation after `BytecodeBuilder::build` is the executor caching
/// resolved native functions in `run` constants.
#[derive(Debug, Clone)]
pub struct Bytecode {
    pub(crate) name: String,
    pub(crate) code: Vec<u8>,
    pub(crate) constants: Vec<Value>,
    pub(crate) labels: Vec<LabelEntry>,
}

impl Bytecode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn labels(&self) -> &[LabelEntry] {
        &self.labels
    }

    pub fn find_label(&self, name: &str) -> Option<&LabelEntry> {
        self.labels.iter().find(|label| &*label.name == name)
    }

    pub(crate) fn operand_id(&self, pos: usize) -> Option<usize> {
        let high = *self.code.get(pos + 1)?;
        let low = *self.code.get(pos + 2)?;
        Some(u16::from_be_bytes([high, low]) as usize)
    }

    /// Human readable listing, one instruction per line with labels inlined.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut labels: Vec<&LabelEntry> = self.labels.iter().collect();
        labels.sort_by_key(|label| label.pos);
        let mut labels = labels.into_iter().peekable();

        let mut pos = 0;
        let mut op_count = 0;
        let _ = writeln!(out, "; === Bytecode {} ===", self.name);
        while pos < self.code.len() {
            while let Some(label) = labels.next_if(|label| label.pos <= pos) {
                let _ = writeln!(out, "{}:", label.name);
            }

            let byte = self.code[pos];
            let opcode = match Opcode::from_u8(byte) {
                Some(Opcode::Illegal) | None => {
                    let _ = writeln!(out, "    unknown");
                    pos += 1;
                    op_count += 1;
                    continue;
                }
                Some(opcode) => opcode,
            };

            match opcode.operand() {
                None => {
                    let _ = writeln!(out, "    {}", opcode);
                }
                Some(_) => match self.operand_id(pos).and_then(|id| self.constants.get(id)) {
                    Some(constant) => {
                        let _ = writeln!(out, "    {} {}", opcode, format_operand(constant));
                    }
                    None => {
                        let _ = writeln!(out, "    inval");
                        break;
                    }
                },
            }
            pos += opcode.width();
            op_count += 1;
        }
        for label in labels {
            let _ = writeln!(out, "{}:", label.name);
        }
        let _ = writeln!(
            out,
            "; Op count: {}, Code: {} bytes",
            op_count,
            self.code.len()
        );
        out
    }
}

fn format_operand(constant: &Value) -> String {
    match constant {
        Value::Int(v) => v.to_string(),
        Value::Float(v) => format!("{:?}", v),
        Value::Bool(v) => v.to_string(),
        Value::Label(label) => format!("<{}>", label.name),
        Value::Function(func) => match (&func.hint, &func.native) {
            (Some(hint), Some(native)) => format!("\"{}\" ({:?})", hint, native),
            (Some(hint), None) => format!("\"{}\"", hint),
            (None, Some(native)) => format!("({:?})", native),
            (None, None) => "inval".to_string(),
        },
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Float(u64),
    Bool(bool),
}

impl ConstKey {
    fn of(constant: &Value) -> Option<ConstKey> {
        match constant {
            Value::Int(v) => Some(ConstKey::Int(*v)),
            Value::Float(v) => Some(ConstKey::Float(v.to_bits())),
            Value::Bool(v) => Some(ConstKey::Bool(*v)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingLabel {
    name: Arc<str>,
    pos: Option<usize>,
}

/// Append-only builder for a `Bytecode` chunk.
///
/// Labels may be declared before they are placed; label operands are resolved
/// when the chunk is built, so forward branches are allowed.
#[derive(Debug, Clone)]
pub struct BytecodeBuilder {
    name: String,
    code: Vec<u8>,
    constants: Vec<Value>,
    labels: Vec<PendingLabel>,
    label_constants: HashMap<LabelId, ConstId>,
    literal_constants: HashMap<ConstKey, ConstId>,
}

impl BytecodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            code: Vec::new(),
            constants: Vec::new(),
            labels: Vec::new(),
            label_constants: HashMap::new(),
            literal_constants: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn push_op(&mut self, opcode: Opcode) -> Result<(), BuildError> {
        if let Some(expected) = opcode.operand() {
            return Err(BuildError::MissingOperand { opcode, expected });
        }
        self.code.push(opcode as u8);
        Ok(())
    }

    pub fn push_op_int(&mut self, opcode: Opcode, value: i64) -> Result<ConstId, BuildError> {
        self.check_operand(opcode, OperandKind::Int)?;
        let id = self.push_constant(Value::Int(value))?;
        self.push_op_const(opcode, id);
        Ok(id)
    }

    pub fn push_op_float(&mut self, opcode: Opcode, value: f64) -> Result<ConstId, BuildError> {
        self.check_operand(opcode, OperandKind::Float)?;
        let id = self.push_constant(Value::Float(value))?;
        self.push_op_const(opcode, id);
        Ok(id)
    }

    pub fn push_op_bool(&mut self, opcode: Opcode, value: bool) -> Result<ConstId, BuildError> {
        self.check_operand(opcode, OperandKind::Bool)?;
        let id = self.push_constant(Value::Bool(value))?;
        self.push_op_const(opcode, id);
        Ok(id)
    }

    pub fn push_op_func(&mut self, opcode: Opcode, func: Function) -> Result<ConstId, BuildError> {
        self.check_operand(opcode, OperandKind::Func)?;
        let id = self.push_constant(Value::Function(func))?;
        self.push_op_const(opcode, id);
        Ok(id)
    }

    pub fn push_op_label(&mut self, opcode: Opcode, label: LabelId) -> Result<ConstId, BuildError> {
        self.check_operand(opcode, OperandKind::Label)?;
        let id = match self.label_constants.get(&label) {
            Some(id) => *id,
            None => {
                let entry = self
                    .labels
                    .get(label.0)
                    .ok_or(BuildError::UnknownLabel(label.0))?;
                let constant = Value::Label(Label {
                    name: entry.name.clone(),
                    pos: entry.pos.unwrap_or(0),
                });
                let id = self.append_constant(constant)?;
                self.label_constants.insert(label, id);
                id
            }
        };
        self.push_op_const(opcode, id);
        Ok(id)
    }

    /// Declares a label at the current end of the stream.
    pub fn push_label(&mut self, name: &str) -> LabelId {
        self.labels.push(PendingLabel {
            name: Arc::from(name),
            pos: Some(self.code.len()),
        });
        LabelId(self.labels.len() - 1)
    }

    /// Declares a label whose position is fixed later with `place_label`.
    pub fn declare_label(&mut self, name: &str) -> LabelId {
        self.labels.push(PendingLabel {
            name: Arc::from(name),
            pos: None,
        });
        LabelId(self.labels.len() - 1)
    }

    pub fn place_label(&mut self, label: LabelId) -> Result<(), BuildError> {
        let pos = self.code.len();
        let entry = self
            .labels
            .get_mut(label.0)
            .ok_or(BuildError::UnknownLabel(label.0))?;
        if entry.pos.is_some() {
            return Err(BuildError::LabelAlreadyPlaced(entry.name.to_string()));
        }
        entry.pos = Some(pos);
        Ok(())
    }

    pub fn find_label(&self, name: &str) -> Option<LabelId> {
        self.labels
            .iter()
            .position(|label| &*label.name == name)
            .map(LabelId)
    }

    pub fn is_placed(&self, label: LabelId) -> bool {
        self.labels
            .get(label.0)
            .map_or(false, |entry| entry.pos.is_some())
    }

    /// Resolves label operands and freezes the chunk.
    pub fn build(self) -> Result<Bytecode, BuildError> {
        let Self {
            name,
            code,
            mut constants,
            labels,
            label_constants,
            ..
        } = self;

        for (label, id) in &label_constants {
            let entry = &labels[label.0];
            let pos = entry
                .pos
                .ok_or_else(|| BuildError::UnplacedLabel(entry.name.to_string()))?;
            constants[*id as usize] = Value::Label(Label {
                name: entry.name.clone(),
                pos,
            });
        }

        // Unplaced, unreferenced labels are dropped: nothing can reach them.
        let labels = labels
            .into_iter()
            .filter_map(|label| label.pos.map(|pos| LabelEntry { name: label.name, pos }))
            .collect();

        Ok(Bytecode {
            name,
            code,
            constants,
            labels,
        })
    }

    fn check_operand(&self, opcode: Opcode, found: OperandKind) -> Result<(), BuildError> {
        match opcode.operand() {
            None => Err(BuildError::UnexpectedOperand { opcode }),
            Some(expected) if expected != found => Err(BuildError::OperandMismatch {
                opcode,
                expected,
                found,
            }),
            Some(_) => Ok(()),
        }
    }

    fn push_op_const(&mut self, opcode: Opcode, id: ConstId) {
        self.code.push(opcode as u8);
        self.code.extend_from_slice(&id.to_be_bytes());
    }

    fn push_constant(&mut self, constant: Value) -> Result<ConstId, BuildError> {
        if let Some(key) = ConstKey::of(&constant) {
            if let Some(id) = self.literal_constants.get(&key) {
                return Ok(*id);
            }
            let id = self.append_constant(constant)?;
            self.literal_constants.insert(key, id);
            return Ok(id);
        }
        if let Some(index) = self
            .constants
            .iter()
            .position(|existing| existing.same_bits(&constant))
        {
            return Ok(index as ConstId);
        }
        self.append_constant(constant)
    }

    fn append_constant(&mut self, constant: Value) -> Result<ConstId, BuildError> {
        if self.constants.len() >= MAX_CONSTANTS {
            return Err(BuildError::ConstantPoolFull(self.name.clone()));
        }
        self.constants.push(constant);
        Ok((self.constants.len() - 1) as ConstId)
    }
}

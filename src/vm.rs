use crate::convert::{c_string, format_g, parse_float_prefix, parse_int_prefix};
use crate::error::bounded_message;
use crate::ffi::Resolver;
use crate::heap::{grown_capacity, item_buffer_bytes, list_object_bytes, CollectStats, Heap, HeapStats};
use crate::{
    Bytecode, CancelToken, ExecConfig, ExecError, Fault, Function, Label, ListRef, NativeFn,
    Opcode, Value, ValueKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Interprets bytecode chunks against one operand stack, a stack of variable
/// frames and a garbage collected list heap.
pub struct Executor {
    chunks: Vec<Bytecode>,
    stack: Vec<Value>,
    frames: Vec<Vec<Value>>,
    heap: Heap,
    config: ExecConfig,
    resolver: Option<Resolver>,
    resolved: HashMap<Arc<str>, NativeFn>,
    cancel: CancelToken,
    last_error: String,
}

impl Executor {
    pub fn new(config: ExecConfig) -> Result<Self, ExecError> {
        if config.memory_max > u32::MAX as usize {
            return Err(ExecError::Arena(format!(
                "memory_max of {} bytes does not fit 32 bit offsets",
                config.memory_max
            )));
        }
        let heap = Heap::new(config.memory_max, config.guard_inactive)?;
        info!("executor ready with {} bytes per arena", config.memory_max);
        Ok(Self {
            chunks: Vec::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            heap,
            config,
            resolver: None,
            resolved: HashMap::new(),
            cancel: CancelToken::new(),
            last_error: String::new(),
        })
    }

    pub fn with_memory(memory_max: usize) -> Result<Self, ExecError> {
        Self::new(ExecConfig::with_memory(memory_max))
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn set_resolver<F>(&mut self, resolver: F)
    where
        F: FnMut(&Executor, &str) -> Option<NativeFn> + Send + 'static,
    {
        self.resolver = Some(Box::new(resolver));
        self.resolved.clear();
    }

    /// Registers a chunk. Names are not checked for uniqueness; lookups
    /// return the first match.
    pub fn add_bytecode(&mut self, bytecode: Bytecode) {
        self.chunks.push(bytecode);
    }

    /// Unregisters the first chunk called `name`.
    pub fn remove_bytecode(&mut self, name: &str) -> Option<Bytecode> {
        let index = self.chunks.iter().position(|chunk| chunk.name == name)?;
        Some(self.chunks.remove(index))
    }

    pub fn chunks(&self) -> &[Bytecode] {
        &self.chunks
    }

    pub fn bytecode(&self, name: &str) -> Option<&Bytecode> {
        self.chunks.iter().find(|chunk| chunk.name == name)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn frames(&self) -> &[Vec<Value>] {
        &self.frames
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Runs `chunk` from `label`. A failure is also recorded in `last_error`.
    pub fn run(&mut self, chunk: &str, label: &str) -> Result<(), ExecError> {
        let result = self.start(chunk, label);
        if let Err(err) = &result {
            self.last_error = bounded_message(&err.to_string());
        }
        result
    }

    fn start(&mut self, chunk: &str, label: &str) -> Result<(), ExecError> {
        let index = self
            .chunks
            .iter()
            .position(|bytecode| bytecode.name == chunk)
            .ok_or_else(|| ExecError::ChunkNotFound(chunk.to_string()))?;
        let pos = self.chunks[index]
            .find_label(label)
            .map(|entry| entry.pos)
            .ok_or_else(|| ExecError::LabelNotFound {
                chunk: chunk.to_string(),
                label: label.to_string(),
            })?;
        self.run_bytecode(index, pos)
    }

    fn run_bytecode(&mut self, chunk: usize, pos: usize) -> Result<(), ExecError> {
        self.check_cancelled()?;
        if self.frames.len() >= self.config.max_call_depth {
            return Err(Fault::CallDepthExceeded(self.config.max_call_depth).into());
        }
        trace!(
            "call {}@{} at depth {}",
            self.chunks[chunk].name,
            pos,
            self.frames.len() + 1
        );

        self.frames.push(Vec::new());
        let result = self.dispatch(chunk, pos);
        self.frames.pop();
        result
    }

    fn check_cancelled(&self) -> Result<(), ExecError> {
        if self.cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        Ok(())
    }

    fn dispatch(&mut self, chunk: usize, mut pos: usize) -> Result<(), ExecError> {
        loop {
            let byte = match self.chunks[chunk].code.get(pos) {
                Some(byte) => *byte,
                None => return Ok(()),
            };
            let opcode = match Opcode::from_u8(byte) {
                Some(Opcode::Illegal) | None => return Err(ExecError::IllegalOpcode(byte)),
                Some(opcode) => opcode,
            };
            let mut next = pos + opcode.width();

            match opcode {
                Opcode::Illegal => return Err(ExecError::IllegalOpcode(byte)),
                Opcode::PushN => self.push_nothing()?,
                Opcode::PushI | Opcode::PushF | Opcode::PushB | Opcode::PushLb | Opcode::PushFn => {
                    let constant = self.constant(chunk, pos)?.clone();
                    self.push_value(constant)?;
                }
                Opcode::PushL => {
                    let list = self.allocate(list_object_bytes(), |heap| heap.alloc_list())?;
                    self.push_list(list)?;
                }
                Opcode::Pop => {
                    self.pop_value()?;
                }
                Opcode::PopC => {
                    let count = self.const_int(chunk, pos)?;
                    let count = usize::try_from(count).map_err(|_| Fault::StackUnderflow)?;
                    self.pop_multiple(count)?;
                }
                Opcode::Dup => self.dup_value()?,
                Opcode::Load => {
                    let index = self.const_int(chunk, pos)?;
                    let frame = self.frames.last().ok_or(Fault::NoFrame)?;
                    let value = usize::try_from(index)
                        .ok()
                        .and_then(|slot| frame.get(slot))
                        .cloned()
                        .ok_or(Fault::BadVariable {
                            index,
                            len: frame.len(),
                        })?;
                    self.push_value(value)?;
                }
                Opcode::Store => {
                    let index = self.const_int(chunk, pos)?;
                    let value = self.pop_value()?;
                    let frame = self.frames.last_mut().ok_or(Fault::NoFrame)?;
                    let len = frame.len();
                    match usize::try_from(index) {
                        Ok(slot) if slot == len => frame.push(value),
                        Ok(slot) if slot < len => frame[slot] = value,
                        _ => return Err(Fault::BadVariable { index, len }.into()),
                    }
                }

                Opcode::AddI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_int(left.wrapping_add(right))?;
                }
                Opcode::SubI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_int(left.wrapping_sub(right))?;
                }
                Opcode::MulI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_int(left.wrapping_mul(right))?;
                }
                Opcode::DivI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    if right == 0 {
                        return Err(ExecError::DivisionByZero);
                    }
                    self.push_int(left.wrapping_div(right))?;
                }
                Opcode::ModI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    if right == 0 {
                        return Err(ExecError::DivisionByZero);
                    }
                    self.push_int(left.wrapping_rem(right))?;
                }
                Opcode::NotI => {
                    let value = self.pop_int()?;
                    self.push_int(!value)?;
                }
                Opcode::AndI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_int(left & right)?;
                }
                Opcode::OrI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_int(left | right)?;
                }
                Opcode::XorI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_int(left ^ right)?;
                }

                Opcode::AddF => {
                    let right = self.pop_float()?;
                    let left = self.pop_float()?;
                    self.push_float(left + right)?;
                }
                Opcode::SubF => {
                    let right = self.pop_float()?;
                    let left = self.pop_float()?;
                    self.push_float(left - right)?;
                }
                Opcode::MulF => {
                    let right = self.pop_float()?;
                    let left = self.pop_float()?;
                    self.push_float(left * right)?;
                }
                Opcode::DivF => {
                    let right = self.pop_float()?;
                    let left = self.pop_float()?;
                    self.push_float(left / right)?;
                }
                Opcode::ModF => {
                    let right = self.pop_float()?;
                    let left = self.pop_float()?;
                    self.push_float(left % right)?;
                }

                Opcode::Not => {
                    let value = self.pop_bool()?;
                    self.push_bool(!value)?;
                }
                Opcode::And => {
                    let right = self.pop_bool()?;
                    let left = self.pop_bool()?;
                    self.push_bool(left && right)?;
                }
                Opcode::Or => {
                    let right = self.pop_bool()?;
                    let left = self.pop_bool()?;
                    self.push_bool(left || right)?;
                }
                Opcode::Xor => {
                    let right = self.pop_bool()?;
                    let left = self.pop_bool()?;
                    self.push_bool(left != right)?;
                }

                Opcode::LessI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_bool(left < right)?;
                }
                Opcode::MoreI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_bool(left > right)?;
                }
                Opcode::LessEqI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_bool(left <= right)?;
                }
                Opcode::MoreEqI => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    self.push_bool(left >= right)?;
                }
                Opcode::LessF => {
                    let right = self.pop_float()?;
                    let left = self.pop_float()?;
                    self.push_bool(left < right)?;
                }
                Opcode::MoreF => {
                    let right = self.pop_float()?;
                    let left = self.pop_float()?;
                    self.push_bool(left > right)?;
                }
                Opcode::LessEqF => {
                    let right = self.pop_float()?;
                    let left = self.pop_float()?;
                    self.push_bool(left <= right)?;
                }
                Opcode::MoreEqF => {
                    let right = self.pop_float()?;
                    let left = self.pop_float()?;
                    self.push_bool(left >= right)?;
                }
                Opcode::Eq => {
                    let right = self.pop_value()?;
                    let left = self.pop_value()?;
                    self.push_bool(left.equals(&right))?;
                }
                Opcode::Neq => {
                    let right = self.pop_value()?;
                    let left = self.pop_value()?;
                    self.push_bool(!left.equals(&right))?;
                }

                Opcode::IToF => {
                    let value = self.pop_int()?;
                    self.push_float(value as f64)?;
                }
                Opcode::IToB => {
                    let value = self.pop_int()?;
                    self.push_bool(value != 0)?;
                }
                Opcode::IToA => {
                    let value = self.pop_int()?;
                    self.push_string(&value.to_string())?;
                }
                Opcode::FToI => {
                    let value = self.pop_float()?;
                    self.push_int(value as i64)?;
                }
                Opcode::FToB => {
                    let value = self.pop_float()?;
                    self.push_bool(value != 0.0)?;
                }
                Opcode::FToA => {
                    let value = self.pop_float()?;
                    self.push_string(&format_g(value))?;
                }
                Opcode::BToI => {
                    let value = self.pop_bool()?;
                    self.push_int(value as i64)?;
                }
                Opcode::BToF => {
                    let value = self.pop_bool()?;
                    self.push_float(if value { 1.0 } else { 0.0 })?;
                }
                Opcode::BToA => {
                    let value = self.pop_bool()?;
                    self.push_string(if value { "true" } else { "false" })?;
                }
                Opcode::AToI => {
                    let text = self.pop_c_string()?;
                    self.push_int(parse_int_prefix(&text))?;
                }
                Opcode::AToF => {
                    let text = self.pop_c_string()?;
                    self.push_float(parse_float_prefix(&text))?;
                }
                Opcode::AToB => {
                    let text = self.pop_c_string()?;
                    self.push_bool(!text.is_empty())?;
                }
                Opcode::LToA => {
                    let list = self.pop_list()?;
                    let text = format!(
                        "list(0x{:x}, {}/{})",
                        list.offset(),
                        self.heap.list_len(list)?,
                        self.heap.list_capacity(list)?
                    );
                    self.push_string(&text)?;
                }
                Opcode::NToA => {
                    self.pop_value()?;
                    self.push_string("nothing")?;
                }
                Opcode::ToI => {
                    let value = self.pop_value()?;
                    let result = match value {
                        Value::Int(v) => v,
                        Value::Float(v) => v as i64,
                        Value::Bool(v) => v as i64,
                        Value::Byte(v) => v as i64,
                        Value::Nothing => 0,
                        Value::List(list) => parse_int_prefix(&self.c_string(list)?),
                        other => return Err(Fault::BadConversion(other.kind()).into()),
                    };
                    self.push_int(result)?;
                }
                Opcode::ToF => {
                    let value = self.pop_value()?;
                    let result = match value {
                        Value::Int(v) => v as f64,
                        Value::Float(v) => v,
                        Value::Bool(v) => v as i64 as f64,
                        Value::Byte(v) => v as f64,
                        Value::Nothing => 0.0,
                        Value::List(list) => parse_float_prefix(&self.c_string(list)?),
                        other => return Err(Fault::BadConversion(other.kind()).into()),
                    };
                    self.push_float(result)?;
                }
                Opcode::ToB => {
                    let value = self.pop_value()?;
                    let result = match value {
                        Value::Int(v) => v != 0,
                        Value::Float(v) => v != 0.0,
                        Value::Bool(v) => v,
                        Value::Byte(v) => v != 0,
                        Value::Nothing => false,
                        Value::List(list) => !self.c_string(list)?.is_empty(),
                        other => return Err(Fault::BadConversion(other.kind()).into()),
                    };
                    self.push_bool(result)?;
                }
                Opcode::ToA => {
                    let text = match self.peek_value()? {
                        Value::List(_) => None,
                        Value::Int(v) => Some(v.to_string()),
                        Value::Float(v) => Some(format_g(*v)),
                        Value::Bool(v) => Some(v.to_string()),
                        Value::Byte(v) => Some(v.to_string()),
                        Value::Nothing => Some("nothing".to_string()),
                        other => return Err(Fault::BadConversion(other.kind()).into()),
                    };
                    if let Some(text) = text {
                        self.pop_value()?;
                        self.push_string(&text)?;
                    }
                }

                Opcode::AddL => {
                    self.reserve_slot(1)?;
                    let value = self.pop_value()?;
                    let list = self.pop_list()?;
                    let pushed = self.heap.try_push(list, &value)?;
                    debug_assert!(pushed);
                }
                Opcode::IndexL => {
                    let index = self.pop_int()?;
                    let list = self.pop_list()?;
                    let value = match usize::try_from(index) {
                        Ok(index) => self.heap.list_get(list, index)?,
                        Err(_) => None,
                    };
                    self.push_value(value.unwrap_or_default())?;
                }
                Opcode::SetL => {
                    let value = self.pop_value()?;
                    let index = self.pop_int()?;
                    let list = self.pop_list()?;
                    if let Ok(index) = usize::try_from(index) {
                        self.heap.list_set(list, index, &value)?;
                    }
                }
                Opcode::InsertL => {
                    let index = self.int_at(1)?;
                    let list = self.list_at(2)?;
                    let len = self.heap.list_len(list)?;
                    match usize::try_from(index) {
                        Ok(index) if index <= len => {
                            self.reserve_slot(2)?;
                            let value = self.pop_value()?;
                            self.pop_value()?;
                            let list = self.pop_list()?;
                            let inserted = self.heap.try_insert(list, index, &value)?;
                            debug_assert!(inserted);
                        }
                        // An out of range index leaves the list in place.
                        _ => self.pop_multiple(2)?,
                    }
                }
                Opcode::DelL => {
                    let index = self.pop_int()?;
                    let list = self.pop_list()?;
                    if let Ok(index) = usize::try_from(index) {
                        self.heap.list_remove(list, index)?;
                    }
                }
                Opcode::LenL => {
                    let list = self.pop_list()?;
                    let len = self.heap.list_len(list)?;
                    self.push_int(len as i64)?;
                }

                Opcode::Jmp => {
                    let label = self.const_label(chunk, pos)?;
                    next = self.jump(chunk, pos, &label)?;
                }
                Opcode::If => {
                    let label = self.const_label(chunk, pos)?;
                    if self.pop_bool()? {
                        next = self.jump(chunk, pos, &label)?;
                    }
                }
                Opcode::Call => {
                    let label = self.const_label(chunk, pos)?;
                    let target = self.target(chunk, &label)?;
                    self.run_bytecode(chunk, target)?;
                }
                Opcode::Run => {
                    let native = self.resolve_constant(chunk, pos)?;
                    native.call(self)?;
                }
                Opcode::DynJmp => {
                    let label = self.pop_label()?;
                    next = self.jump(chunk, pos, &label)?;
                }
                Opcode::DynIf => {
                    let label = self.pop_label()?;
                    if self.pop_bool()? {
                        next = self.jump(chunk, pos, &label)?;
                    }
                }
                Opcode::DynCall => {
                    let label = self.pop_label()?;
                    let target = self.target(chunk, &label)?;
                    self.run_bytecode(chunk, target)?;
                }
                Opcode::DynRun => {
                    let func = self.pop_func()?;
                    let native = self.resolve_function(&func)?;
                    native.call(self)?;
                }
                Opcode::Ret => return Ok(()),
            }

            pos = next;
        }
    }

    fn constant(&self, chunk: usize, pos: usize) -> Result<&Value, Fault> {
        let bytecode = &self.chunks[chunk];
        let id = bytecode
            .operand_id(pos)
            .ok_or(Fault::TruncatedOperand(pos))?;
        bytecode.constants.get(id).ok_or(Fault::BadConstant(id))
    }

    fn const_int(&self, chunk: usize, pos: usize) -> Result<i64, Fault> {
        match self.constant(chunk, pos)? {
            Value::Int(value) => Ok(*value),
            other => Err(Fault::TypeMismatch {
                expected: ValueKind::Int,
                found: other.kind(),
            }),
        }
    }

    fn const_label(&self, chunk: usize, pos: usize) -> Result<Label, Fault> {
        match self.constant(chunk, pos)? {
            Value::Label(label) => Ok(label.clone()),
            other => Err(Fault::TypeMismatch {
                expected: ValueKind::Label,
                found: other.kind(),
            }),
        }
    }

    fn target(&self, chunk: usize, label: &Label) -> Result<usize, Fault> {
        if label.pos > self.chunks[chunk].code.len() {
            return Err(Fault::BadLabel(label.pos));
        }
        Ok(label.pos)
    }

    /// Target of a branch taken at `pos`. Backward branches are
    /// cancellation points.
    fn jump(&self, chunk: usize, pos: usize, label: &Label) -> Result<usize, ExecError> {
        let target = self.target(chunk, label)?;
        if target <= pos {
            self.check_cancelled()?;
        }
        Ok(target)
    }

    /// Native behind a `run` operand, resolving and caching it in the
    /// constant pool on first use.
    fn resolve_constant(&mut self, chunk: usize, pos: usize) -> Result<NativeFn, ExecError> {
        let func = match self.constant(chunk, pos)? {
            Value::Function(func) => func.clone(),
            other => {
                return Err(Fault::TypeMismatch {
                    expected: ValueKind::Function,
                    found: other.kind(),
                }
                .into())
            }
        };
        if let Some(native) = &func.native {
            return Ok(native.clone());
        }

        let native = self.resolve_function(&func)?;
        if let Some(id) = self.chunks[chunk].operand_id(pos) {
            self.chunks[chunk].constants[id] = Value::Function(Function {
                hint: func.hint,
                native: Some(native.clone()),
            });
        }
        Ok(native)
    }

    fn resolve_function(&mut self, func: &Function) -> Result<NativeFn, ExecError> {
        if let Some(native) = &func.native {
            return Ok(native.clone());
        }
        let hint = match &func.hint {
            Some(hint) => hint.clone(),
            None => return Err(ExecError::UnresolvedFunction(String::new())),
        };
        if let Some(native) = self.resolved.get(&hint) {
            return Ok(native.clone());
        }

        let mut resolver = self.resolver.take().ok_or(ExecError::NoResolver)?;
        let found = resolver(self, &*hint);
        self.resolver = Some(resolver);

        match found {
            Some(native) => {
                debug!("resolved native \"{}\"", hint);
                self.resolved.insert(hint, native.clone());
                Ok(native)
            }
            None => Err(ExecError::UnresolvedFunction(hint.to_string())),
        }
    }

    /// Runs `attempt` against the heap, collecting once and retrying when it
    /// fails. Handles held outside the roots are stale afterwards.
    fn allocate<T>(
        &mut self,
        requested: usize,
        mut attempt: impl FnMut(&mut Heap) -> Option<T>,
    ) -> Result<T, ExecError> {
        if let Some(found) = attempt(&mut self.heap) {
            return Ok(found);
        }
        self.collect()?;
        match attempt(&mut self.heap) {
            Some(found) => Ok(found),
            None => {
                let free = self.heap.free();
                warn!(
                    "out of memory: requested {} bytes, {} free after collection",
                    requested, free
                );
                Err(ExecError::OutOfMemory { requested, free })
            }
        }
    }

    /// Makes sure the list `depth` slots below the top of the stack has room
    /// for one more element.
    fn reserve_slot(&mut self, depth: usize) -> Result<(), ExecError> {
        let list = self.list_at(depth)?;
        let capacity = self.heap.list_capacity(list)?;
        if self.heap.list_len(list)? < capacity {
            return Ok(());
        }
        let capacity = grown_capacity(capacity);
        let items = self.allocate(item_buffer_bytes(capacity), |heap| {
            heap.alloc_items(capacity)
        })?;
        let list = self.list_at(depth)?;
        self.heap.install_items(list, items, capacity)?;
        Ok(())
    }

    fn value_at(&self, depth: usize) -> Result<&Value, Fault> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|index| &self.stack[index])
            .ok_or(Fault::StackUnderflow)
    }

    fn list_at(&self, depth: usize) -> Result<ListRef, Fault> {
        match self.value_at(depth)? {
            Value::List(list) => Ok(*list),
            other => Err(Fault::TypeMismatch {
                expected: ValueKind::List,
                found: other.kind(),
            }),
        }
    }

    fn int_at(&self, depth: usize) -> Result<i64, Fault> {
        match self.value_at(depth)? {
            Value::Int(value) => Ok(*value),
            other => Err(Fault::TypeMismatch {
                expected: ValueKind::Int,
                found: other.kind(),
            }),
        }
    }

    fn c_string(&self, list: ListRef) -> Result<Vec<u8>, Fault> {
        Ok(c_string(&self.heap.list_values(list)?))
    }

    fn pop_c_string(&mut self) -> Result<Vec<u8>, ExecError> {
        let list = self.pop_list()?;
        Ok(self.c_string(list)?)
    }

    /// Copies every live list into the other arena.
    pub fn collect(&mut self) -> Result<CollectStats, ExecError> {
        let roots = self.stack.iter_mut().chain(self.frames.iter_mut().flatten());
        self.heap.collect(roots)
    }

    pub fn push_value(&mut self, value: Value) -> Result<(), ExecError> {
        if self.stack.len() >= self.config.max_stack_size {
            return Err(Fault::StackOverflow(self.config.max_stack_size).into());
        }
        if let Value::List(list) = &value {
            self.heap.check(*list)?;
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop_value(&mut self) -> Result<Value, ExecError> {
        Ok(self.stack.pop().ok_or(Fault::StackUnderflow)?)
    }

    pub fn peek_value(&self) -> Result<&Value, ExecError> {
        Ok(self.value_at(0)?)
    }

    pub fn pop_multiple(&mut self, count: usize) -> Result<(), ExecError> {
        let len = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or(Fault::StackUnderflow)?;
        self.stack.truncate(len);
        Ok(())
    }

    pub fn dup_value(&mut self) -> Result<(), ExecError> {
        let value = self.peek_value()?.clone();
        self.push_value(value)
    }

    pub fn push_nothing(&mut self) -> Result<(), ExecError> {
        self.push_value(Value::Nothing)
    }

    pub fn push_byte(&mut self, value: u8) -> Result<(), ExecError> {
        self.push_value(Value::Byte(value))
    }

    pub fn push_int(&mut self, value: i64) -> Result<(), ExecError> {
        self.push_value(Value::Int(value))
    }

    pub fn push_float(&mut self, value: f64) -> Result<(), ExecError> {
        self.push_value(Value::Float(value))
    }

    pub fn push_bool(&mut self, value: bool) -> Result<(), ExecError> {
        self.push_value(Value::Bool(value))
    }

    pub fn push_func(&mut self, value: Function) -> Result<(), ExecError> {
        self.push_value(Value::Function(value))
    }

    pub fn push_label(&mut self, value: Label) -> Result<(), ExecError> {
        self.push_value(Value::Label(value))
    }

    pub fn push_list(&mut self, value: ListRef) -> Result<(), ExecError> {
        self.push_value(Value::List(value))
    }

    pub fn get_int(&self) -> Result<i64, ExecError> {
        Ok(self.int_at(0)?)
    }

    pub fn get_float(&self) -> Result<f64, ExecError> {
        match self.peek_value()? {
            Value::Float(value) => Ok(*value),
            other => Err(mismatch(ValueKind::Float, other)),
        }
    }

    pub fn get_bool(&self) -> Result<bool, ExecError> {
        match self.peek_value()? {
            Value::Bool(value) => Ok(*value),
            other => Err(mismatch(ValueKind::Bool, other)),
        }
    }

    pub fn get_func(&self) -> Result<Function, ExecError> {
        match self.peek_value()? {
            Value::Function(value) => Ok(value.clone()),
            other => Err(mismatch(ValueKind::Function, other)),
        }
    }

    pub fn get_label(&self) -> Result<Label, ExecError> {
        match self.peek_value()? {
            Value::Label(value) => Ok(value.clone()),
            other => Err(mismatch(ValueKind::Label, other)),
        }
    }

    pub fn get_list(&self) -> Result<ListRef, ExecError> {
        Ok(self.list_at(0)?)
    }

    pub fn pop_int(&mut self) -> Result<i64, ExecError> {
        match self.pop_value()? {
            Value::Int(value) => Ok(value),
            other => Err(mismatch(ValueKind::Int, &other)),
        }
    }

    pub fn pop_float(&mut self) -> Result<f64, ExecError> {
        match self.pop_value()? {
            Value::Float(value) => Ok(value),
            other => Err(mismatch(ValueKind::Float, &other)),
        }
    }

    pub fn pop_bool(&mut self) -> Result<bool, ExecError> {
        match self.pop_value()? {
            Value::Bool(value) => Ok(value),
            other => Err(mismatch(ValueKind::Bool, &other)),
        }
    }

    pub fn pop_func(&mut self) -> Result<Function, ExecError> {
        match self.pop_value()? {
            Value::Function(value) => Ok(value),
            other => Err(mismatch(ValueKind::Function, &other)),
        }
    }

    pub fn pop_label(&mut self) -> Result<Label, ExecError> {
        match self.pop_value()? {
            Value::Label(value) => Ok(value),
            other => Err(mismatch(ValueKind::Label, &other)),
        }
    }

    pub fn pop_list(&mut self) -> Result<ListRef, ExecError> {
        match self.pop_value()? {
            Value::List(value) => Ok(value),
            other => Err(mismatch(ValueKind::List, &other)),
        }
    }

    /// Pushes a new list holding the bytes of `text`.
    pub fn push_string(&mut self, text: &str) -> Result<(), ExecError> {
        let list = self.allocate(list_object_bytes(), |heap| heap.alloc_list())?;
        self.push_list(list)?;
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return Ok(());
        }

        let capacity = bytes.len();
        let items = self.allocate(item_buffer_bytes(capacity), |heap| {
            heap.alloc_items(capacity)
        })?;
        let list = self.get_list()?;
        self.heap.install_items(list, items, capacity)?;
        for byte in bytes {
            self.heap.try_push(list, &Value::Byte(*byte))?;
        }
        Ok(())
    }

    /// Pops a list and reads it as text. Elements that are not characters
    /// read as `?`.
    pub fn pop_string(&mut self) -> Result<String, ExecError> {
        let list = self.pop_list()?;
        let bytes: Vec<u8> = self
            .heap
            .list_values(list)?
            .iter()
            .map(crate::convert::element_byte)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn list_len(&self, list: ListRef) -> Result<usize, ExecError> {
        Ok(self.heap.list_len(list)?)
    }

    pub fn list_get(&self, list: ListRef, index: usize) -> Result<Option<Value>, ExecError> {
        Ok(self.heap.list_get(list, index)?)
    }

    pub fn list_values(&self, list: ListRef) -> Result<Vec<Value>, ExecError> {
        Ok(self.heap.list_values(list)?)
    }

    /// One line description of a value, used by the dumps.
    pub fn describe(&self, value: &Value) -> String {
        match value {
            Value::List(list) => match (self.heap.list_len(*list), self.heap.list_capacity(*list)) {
                (Ok(len), Ok(capacity)) => {
                    format!("list 0x{:x} ({}/{})", list.offset(), len, capacity)
                }
                _ => format!("list 0x{:x} (stale)", list.offset()),
            },
            Value::Function(Function {
                native: Some(native),
                ..
            }) => format!("func {:?}", native),
            other => other.to_string(),
        }
    }

    pub fn dump_stack(&self) -> String {
        let mut out = String::from("=== Stack info ===\n");
        if self.stack.is_empty() {
            out.push_str("    empty :(\n");
            return out;
        }
        for (index, value) in self.stack.iter().enumerate() {
            out.push_str(&format!("{}: {}\n", index, self.describe(value)));
        }
        out
    }

    pub fn dump_variables(&self) -> String {
        let mut out = String::from("=== Variable info ===\n");
        if self.frames.is_empty() {
            out.push_str("    empty :(\n");
            return out;
        }
        for frame in &self.frames {
            for (index, value) in frame.iter().enumerate() {
                out.push_str(&format!("{}: {}\n", index, self.describe(value)));
            }
            out.push('\n');
        }
        out
    }
}

fn mismatch(expected: ValueKind, found: &Value) -> ExecError {
    Fault::TypeMismatch {
        expected,
        found: found.kind(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BytecodeBuilder, NativeRegistry};
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor(chunk: Bytecode) -> Result<Executor> {
        let mut exec = Executor::with_memory(64 * 1024)?;
        exec.add_bytecode(chunk);
        Ok(exec)
    }

    fn ints(exec: &Executor, list: ListRef) -> Result<Vec<i64>> {
        exec.list_values(list)?
            .into_iter()
            .map(|value| match value {
                Value::Int(v) => Ok(v),
                other => anyhow::bail!("expected int, got {}", other),
            })
            .collect()
    }

    fn text(exec: &Executor, list: ListRef) -> Result<String> {
        let bytes: Vec<u8> = exec
            .list_values(list)?
            .iter()
            .map(crate::convert::element_byte)
            .collect();
        Ok(String::from_utf8(bytes)?)
    }

    #[test]
    fn test_add_two_constants() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, 2)?;
        builder.push_op_int(Opcode::PushI, 3)?;
        builder.push_op(Opcode::AddI)?;
        builder.push_op(Opcode::Ret)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        assert_eq!(exec.stack(), &[Value::Int(5)]);
        assert!(exec.frames().is_empty());
        Ok(())
    }

    #[test]
    fn test_countdown_loop() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, 10)?;
        builder.push_op_int(Opcode::Store, 0)?;
        let top = builder.push_label("loop");
        let done = builder.declare_label("done");
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::PushI, 0)?;
        builder.push_op(Opcode::LessEqI)?;
        builder.push_op_label(Opcode::If, done)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op(Opcode::SubI)?;
        builder.push_op_int(Opcode::Store, 0)?;
        builder.push_op_label(Opcode::Jmp, top)?;
        builder.place_label(done)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op(Opcode::Ret)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        assert_eq!(exec.stack(), &[Value::Int(0)]);
        Ok(())
    }

    #[test]
    fn test_unresolved_native_fails_cleanly() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_func(Opcode::Run, Function::by_hint("missing_fn"))?;
        builder.push_op(Opcode::Ret)?;

        let mut exec = executor(builder.build()?)?;
        exec.set_resolver(|_, _| None);
        exec.push_int(1)?;

        let err = exec.run("main", "entry").unwrap_err();
        assert!(matches!(err, ExecError::UnresolvedFunction(_)));
        assert!(exec.last_error().contains("missing_fn"));
        assert_eq!(exec.stack().len(), 1);
        assert!(exec.frames().is_empty());
        Ok(())
    }

    #[test]
    fn test_run_without_resolver() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_func(Opcode::Run, Function::by_hint("square"))?;

        let mut exec = executor(builder.build()?)?;
        let err = exec.run("main", "entry").unwrap_err();
        assert!(matches!(err, ExecError::NoResolver));
        assert_eq!(
            exec.last_error(),
            "Called run instruction, but no run function resolver has been attached"
        );
        Ok(())
    }

    #[test]
    fn test_insert_at_front_reverses() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op(Opcode::PushL)?;
        for value in 1..=3 {
            builder.push_op(Opcode::Dup)?;
            builder.push_op_int(Opcode::PushI, 0)?;
            builder.push_op_int(Opcode::PushI, value)?;
            builder.push_op(Opcode::InsertL)?;
        }

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        let list = exec.pop_list()?;
        assert_eq!(ints(&exec, list)?, vec![3, 2, 1]);
        Ok(())
    }

    #[test]
    fn test_list_edge_cases() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op(Opcode::PushL)?;
        builder.push_op_int(Opcode::Store, 0)?;
        // Index into an empty list.
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::PushI, 0)?;
        builder.push_op(Opcode::IndexL)?;
        // Out of range set and insert are ignored. Insert leaves its list behind.
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::PushI, 5)?;
        builder.push_op_int(Opcode::PushI, 9)?;
        builder.push_op(Opcode::SetL)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op_int(Opcode::PushI, 9)?;
        builder.push_op(Opcode::InsertL)?;
        builder.push_op(Opcode::Pop)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::PushI, -1)?;
        builder.push_op(Opcode::DelL)?;
        // Five appends, one delete.
        for value in 10..15 {
            builder.push_op_int(Opcode::Load, 0)?;
            builder.push_op_int(Opcode::PushI, value)?;
            builder.push_op(Opcode::AddL)?;
        }
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op(Opcode::DelL)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::PushI, 0)?;
        builder.push_op_int(Opcode::PushI, 99)?;
        builder.push_op(Opcode::SetL)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op(Opcode::LenL)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op(Opcode::Ret)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        let list = exec.pop_list()?;
        assert_eq!(ints(&exec, list)?, vec![99, 12, 13, 14]);
        assert_eq!(exec.pop_int()?, 4);
        assert_eq!(exec.pop_value()?, Value::Nothing);
        assert!(exec.stack().is_empty());
        Ok(())
    }

    #[test]
    fn test_insert_out_of_range_keeps_list() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op(Opcode::PushL)?;
        builder.push_op_int(Opcode::PushI, 5)?;
        builder.push_op_int(Opcode::PushI, 9)?;
        builder.push_op(Opcode::InsertL)?;
        builder.push_op_int(Opcode::PushI, -1)?;
        builder.push_op_int(Opcode::PushI, 9)?;
        builder.push_op(Opcode::InsertL)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        assert_eq!(exec.stack().len(), 1);
        let list = exec.pop_list()?;
        assert_eq!(exec.list_len(list)?, 0);
        Ok(())
    }

    #[test]
    fn test_call_shares_stack_with_fresh_frame() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        let double = builder.declare_label("double");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, 7)?;
        builder.push_op_int(Opcode::Store, 0)?;
        builder.push_op_int(Opcode::PushI, 21)?;
        builder.push_op_label(Opcode::Call, double)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op(Opcode::Ret)?;
        builder.place_label(double)?;
        builder.push_op_int(Opcode::Store, 0)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op(Opcode::AddI)?;
        builder.push_op(Opcode::Ret)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        assert_eq!(exec.stack(), &[Value::Int(42), Value::Int(7)]);
        Ok(())
    }

    #[test]
    fn test_dynamic_control_flow() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        let skip = builder.declare_label("skip");
        let body = builder.declare_label("body");
        builder.push_label("entry");
        builder.push_op_bool(Opcode::PushB, true)?;
        builder.push_op_label(Opcode::PushLb, skip)?;
        builder.push_op(Opcode::DynIf)?;
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.place_label(skip)?;
        builder.push_op_label(Opcode::PushLb, body)?;
        builder.push_op(Opcode::DynCall)?;
        builder.push_op_func(Opcode::PushFn, Function::by_hint("square"))?;
        builder.push_op(Opcode::DynRun)?;
        builder.push_op(Opcode::Ret)?;
        builder.place_label(body)?;
        builder.push_op_int(Opcode::PushI, 6)?;

        let mut registry = NativeRegistry::new();
        registry.register("square", |exec| {
            let value = exec.pop_int()?;
            exec.push_int(value * value)
        });

        let mut exec = executor(builder.build()?)?;
        exec.set_resolver(registry.into_resolver());
        exec.run("main", "entry")?;
        assert_eq!(exec.stack(), &[Value::Int(36)]);
        Ok(())
    }

    #[test]
    fn test_resolver_is_called_once_per_hint() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_func(Opcode::Run, Function::by_hint("bump"))?;
        builder.push_op_func(Opcode::Run, Function::by_hint("bump"))?;
        builder.push_op_func(Opcode::PushFn, Function::by_hint("bump"))?;
        builder.push_op(Opcode::DynRun)?;

        let mut exec = executor(builder.build()?)?;
        let seen = calls.clone();
        let bump = NativeFn::new(|exec| exec.push_int(1));
        exec.set_resolver(move |_, hint| {
            seen.fetch_add(1, Ordering::SeqCst);
            (hint == "bump").then(|| bump.clone())
        });

        exec.run("main", "entry")?;
        exec.run("main", "entry")?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.stack().len(), 6);
        match &exec.bytecode("main").map(|chunk| chunk.constants()[0].clone()) {
            Some(Value::Function(func)) => assert!(func.is_resolved()),
            other => panic!("expected cached function, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_native_error_propagates_through_calls() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        let inner = builder.declare_label("inner");
        builder.push_label("entry");
        builder.push_op_label(Opcode::Call, inner)?;
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.place_label(inner)?;
        builder.push_op_int(Opcode::PushI, 5)?;
        builder.push_op_int(Opcode::Store, 0)?;
        builder.push_op_func(Opcode::Run, Function::by_hint("fail"))?;

        let mut exec = executor(builder.build()?)?;
        exec.set_resolver(|_, _| Some(NativeFn::new(|_| Err(ExecError::native("boom")))));
        assert!(exec.run("main", "entry").is_err());
        assert_eq!(exec.last_error(), "boom");
        assert!(exec.frames().is_empty());
        assert!(exec.stack().is_empty());
        Ok(())
    }

    #[test]
    fn test_removed_chunk_is_not_found() -> Result<()> {
        let mut first = BytecodeBuilder::new("line");
        first.push_label("entry");
        first.push_op_int(Opcode::PushI, 1)?;
        let mut second = BytecodeBuilder::new("line");
        second.push_label("entry");
        second.push_op_int(Opcode::PushI, 2)?;

        let mut exec = executor(first.build()?)?;
        exec.add_bytecode(second.build()?);
        assert!(exec.remove_bytecode("line").is_some());
        assert_eq!(exec.chunks().len(), 1);
        exec.run("line", "entry")?;
        assert_eq!(exec.pop_int()?, 2);

        assert!(exec.remove_bytecode("line").is_some());
        assert!(exec.remove_bytecode("line").is_none());
        assert!(matches!(
            exec.run("line", "entry"),
            Err(ExecError::ChunkNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_missing_chunk_and_label() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        let mut exec = executor(builder.build()?)?;

        assert!(exec.run("other", "entry").is_err());
        assert_eq!(exec.last_error(), "Bytecode with name \"other\" is not found");
        assert!(exec.run("main", "start").is_err());
        assert_eq!(
            exec.last_error(),
            "Label with name \"start\" is not found in bytecode \"main\""
        );
        Ok(())
    }

    #[test]
    fn test_illegal_opcode() -> Result<()> {
        let chunk = Bytecode {
            name: "main".to_string(),
            code: vec![Opcode::PushN as u8, 200],
            constants: Vec::new(),
            labels: vec![crate::LabelEntry {
                name: Arc::from("entry"),
                pos: 0,
            }],
        };
        let mut exec = executor(chunk)?;
        assert!(matches!(
            exec.run("main", "entry"),
            Err(ExecError::IllegalOpcode(200))
        ));
        assert_eq!(exec.last_error(), "Illegal op: 200");
        Ok(())
    }

    #[test]
    fn test_type_mismatch_is_a_fault() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op_float(Opcode::PushF, 1.0)?;
        builder.push_op(Opcode::AddI)?;

        let mut exec = executor(builder.build()?)?;
        let err = exec.run("main", "entry").unwrap_err();
        assert!(err.is_fault());
        assert!(matches!(
            err,
            ExecError::Fault(Fault::TypeMismatch {
                expected: ValueKind::Int,
                found: ValueKind::Float
            })
        ));
        Ok(())
    }

    #[test]
    fn test_variable_slots() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op_int(Opcode::Store, 0)?;
        builder.push_op_int(Opcode::PushI, 2)?;
        builder.push_op_int(Opcode::Store, 0)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::PushI, 3)?;
        builder.push_op_int(Opcode::Store, 2)?;

        let mut exec = executor(builder.build()?)?;
        let err = exec.run("main", "entry").unwrap_err();
        assert!(matches!(
            err,
            ExecError::Fault(Fault::BadVariable { index: 2, len: 1 })
        ));
        // The failed store consumed its value.
        assert_eq!(exec.stack(), &[Value::Int(2)]);
        Ok(())
    }

    #[test]
    fn test_division_by_zero() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op_int(Opcode::PushI, 0)?;
        builder.push_op(Opcode::ModI)?;

        let mut exec = executor(builder.build()?)?;
        assert!(matches!(
            exec.run("main", "entry"),
            Err(ExecError::DivisionByZero)
        ));
        Ok(())
    }

    #[test]
    fn test_integer_arithmetic_wraps() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, i64::MAX)?;
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op(Opcode::AddI)?;
        builder.push_op_int(Opcode::PushI, i64::MIN)?;
        builder.push_op_int(Opcode::PushI, -1)?;
        builder.push_op(Opcode::DivI)?;
        builder.push_op_int(Opcode::PushI, 6)?;
        builder.push_op(Opcode::NotI)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        assert_eq!(
            exec.stack(),
            &[Value::Int(i64::MIN), Value::Int(i64::MIN), Value::Int(-7)]
        );
        Ok(())
    }

    #[test]
    fn test_equality() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op_float(Opcode::PushF, 1.0)?;
        builder.push_op(Opcode::Eq)?;
        builder.push_op_func(Opcode::PushFn, Function::by_hint("a"))?;
        builder.push_op_func(Opcode::PushFn, Function::by_hint("a"))?;
        builder.push_op(Opcode::Eq)?;
        builder.push_op(Opcode::PushL)?;
        builder.push_op(Opcode::Dup)?;
        builder.push_op(Opcode::Neq)?;
        builder.push_op(Opcode::PushN)?;
        builder.push_op(Opcode::PushN)?;
        builder.push_op(Opcode::Eq)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        assert_eq!(
            exec.stack(),
            &[
                Value::Bool(false),
                Value::Bool(true),
                Value::Bool(false),
                Value::Bool(true)
            ]
        );
        Ok(())
    }

    #[test]
    fn test_string_conversions() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, -42)?;
        builder.push_op(Opcode::IToA)?;
        builder.push_op(Opcode::Dup)?;
        builder.push_op(Opcode::AToI)?;
        builder.push_op_float(Opcode::PushF, 0.5)?;
        builder.push_op(Opcode::FToA)?;
        builder.push_op(Opcode::AToF)?;
        builder.push_op_bool(Opcode::PushB, false)?;
        builder.push_op(Opcode::BToA)?;
        builder.push_op(Opcode::PushN)?;
        builder.push_op(Opcode::NToA)?;
        builder.push_op(Opcode::ToB)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        assert_eq!(exec.pop_bool()?, true);
        let boolean = exec.pop_list()?;
        assert_eq!(text(&exec, boolean)?, "false");
        assert_eq!(exec.pop_float()?, 0.5);
        assert_eq!(exec.pop_int()?, -42);
        let number = exec.pop_list()?;
        assert_eq!(text(&exec, number)?, "-42");
        assert_eq!(exec.list_values(number)?[0], Value::Byte(b'-'));
        Ok(())
    }

    #[test]
    fn test_generic_conversions() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_float(Opcode::PushF, 3.9)?;
        builder.push_op(Opcode::ToI)?;
        builder.push_op_bool(Opcode::PushB, true)?;
        builder.push_op(Opcode::ToF)?;
        builder.push_op_float(Opcode::PushF, 2.5)?;
        builder.push_op(Opcode::ToA)?;
        builder.push_op(Opcode::Dup)?;
        builder.push_op(Opcode::ToA)?;
        builder.push_op(Opcode::ToF)?;
        builder.push_op(Opcode::PushL)?;
        builder.push_op(Opcode::ToB)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        assert_eq!(exec.pop_bool()?, false);
        assert_eq!(exec.pop_float()?, 2.5);
        let rendered = exec.pop_list()?;
        assert_eq!(text(&exec, rendered)?, "2.5");
        assert_eq!(exec.pop_float()?, 1.0);
        assert_eq!(exec.pop_int()?, 3);
        Ok(())
    }

    #[test]
    fn test_label_conversion_is_a_fault() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        let entry = builder.push_label("entry");
        builder.push_op_label(Opcode::PushLb, entry)?;
        builder.push_op(Opcode::ToI)?;

        let mut exec = executor(builder.build()?)?;
        assert!(matches!(
            exec.run("main", "entry"),
            Err(ExecError::Fault(Fault::BadConversion(ValueKind::Label)))
        ));
        Ok(())
    }

    #[test]
    fn test_list_to_text() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op(Opcode::PushL)?;
        builder.push_op(Opcode::Dup)?;
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op(Opcode::AddL)?;
        builder.push_op(Opcode::LToA)?;

        let mut exec = executor(builder.build()?)?;
        exec.run("main", "entry")?;
        let rendered = exec.pop_list()?;
        let rendered = text(&exec, rendered)?;
        assert!(rendered.starts_with("list(0x"));
        assert!(rendered.ends_with(", 1/4)"));
        Ok(())
    }

    #[test]
    fn test_collection_keeps_reachable_lists() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op(Opcode::PushL)?;
        builder.push_op_int(Opcode::Store, 0)?;
        builder.push_op_int(Opcode::PushI, 0)?;
        builder.push_op_int(Opcode::Store, 1)?;
        let top = builder.push_label("loop");
        let done = builder.declare_label("done");
        builder.push_op_int(Opcode::Load, 1)?;
        builder.push_op_int(Opcode::PushI, 200)?;
        builder.push_op(Opcode::MoreEqI)?;
        builder.push_op_label(Opcode::If, done)?;
        // Garbage that forces collections.
        builder.push_op_int(Opcode::Load, 1)?;
        builder.push_op(Opcode::IToA)?;
        builder.push_op(Opcode::Pop)?;
        builder.push_op_int(Opcode::Load, 0)?;
        builder.push_op_int(Opcode::Load, 1)?;
        builder.push_op(Opcode::AddL)?;
        builder.push_op_int(Opcode::Load, 1)?;
        builder.push_op_int(Opcode::PushI, 1)?;
        builder.push_op(Opcode::AddI)?;
        builder.push_op_int(Opcode::Store, 1)?;
        builder.push_op_label(Opcode::Jmp, top)?;
        builder.place_label(done)?;
        builder.push_op_int(Opcode::Load, 0)?;

        let mut exec = Executor::with_memory(16 * 1024)?;
        exec.add_bytecode(builder.build()?);
        exec.run("main", "entry")?;

        assert!(exec.heap_stats().collections > 0);
        let list = exec.pop_list()?;
        assert_eq!(ints(&exec, list)?, (0..200).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_out_of_memory_then_reclaim() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("fill");
        let top = builder.push_label("loop");
        builder.push_op(Opcode::PushL)?;
        builder.push_op_label(Opcode::Jmp, top)?;

        let mut exec = Executor::with_memory(1024)?;
        exec.add_bytecode(builder.build()?);

        let err = exec.run("main", "fill").unwrap_err();
        assert!(matches!(err, ExecError::OutOfMemory { requested: 40, .. }));
        assert!(exec.last_error().starts_with("Heap out of memory. Tried to allocate 40 bytes"));
        let held = exec.stack().len();
        assert_eq!(held, 1024 / 40);

        exec.pop_multiple(held)?;
        exec.push_string("reclaimed")?;
        let list = exec.pop_list()?;
        assert_eq!(text(&exec, list)?, "reclaimed");
        Ok(())
    }

    #[test]
    fn test_zero_memory_has_no_heap() -> Result<()> {
        let mut exec = Executor::with_memory(0)?;
        assert!(matches!(
            exec.push_string("x"),
            Err(ExecError::OutOfMemory { free: 0, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_stale_handle_is_rejected() -> Result<()> {
        let mut exec = Executor::with_memory(4096)?;
        exec.push_string("abc")?;
        let stale = exec.get_list()?;
        exec.collect()?;
        assert!(matches!(
            exec.list_len(stale),
            Err(ExecError::Fault(Fault::StaleList { .. }))
        ));
        assert!(exec.push_list(stale).is_err());
        let fresh = exec.get_list()?;
        assert_eq!(exec.list_len(fresh)?, 3);
        Ok(())
    }

    #[test]
    fn test_cancellation_stops_loops() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        let top = builder.push_label("entry");
        builder.push_op_func(Opcode::Run, Function::by_hint("tick"))?;
        builder.push_op_label(Opcode::Jmp, top)?;

        let mut exec = executor(builder.build()?)?;
        let token = exec.cancel_token();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let tick = NativeFn::new(move |exec| {
            if counter.fetch_add(1, Ordering::SeqCst) == 9 {
                exec.cancel_token().cancel();
            }
            Ok(())
        });
        exec.set_resolver(move |_, _| Some(tick.clone()));

        assert!(matches!(
            exec.run("main", "entry"),
            Err(ExecError::Cancelled)
        ));
        assert_eq!(ticks.load(Ordering::SeqCst), 10);
        assert!(exec.frames().is_empty());

        token.reset();
        Ok(())
    }

    #[test]
    fn test_call_depth_limit() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        let entry = builder.push_label("entry");
        builder.push_op_label(Opcode::Call, entry)?;

        let config = ExecConfig {
            memory_max: 4096,
            max_call_depth: 32,
            ..ExecConfig::default()
        };
        let mut exec = Executor::new(config)?;
        exec.add_bytecode(builder.build()?);
        assert!(matches!(
            exec.run("main", "entry"),
            Err(ExecError::Fault(Fault::CallDepthExceeded(32)))
        ));
        assert!(exec.frames().is_empty());
        Ok(())
    }

    #[test]
    fn test_stack_limit() -> Result<()> {
        let config = ExecConfig {
            memory_max: 0,
            max_stack_size: 2,
            ..ExecConfig::default()
        };
        let mut exec = Executor::new(config)?;
        exec.push_int(1)?;
        exec.dup_value()?;
        assert!(matches!(
            exec.dup_value(),
            Err(ExecError::Fault(Fault::StackOverflow(2)))
        ));
        Ok(())
    }

    #[test]
    fn test_dumps() -> Result<()> {
        let mut exec = Executor::with_memory(1024)?;
        assert_eq!(exec.dump_stack(), "=== Stack info ===\n    empty :(\n");
        assert_eq!(exec.dump_variables(), "=== Variable info ===\n    empty :(\n");

        exec.push_int(3)?;
        exec.push_func(Function::by_hint("print"))?;
        assert_eq!(
            exec.dump_stack(),
            "=== Stack info ===\n0: int 3\n1: func \"print\"\n"
        );
        Ok(())
    }

    #[test]
    fn test_executor_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Executor>();
    }
}

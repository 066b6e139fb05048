//! Natives available to every program run by the `irvm` tools.

use crate::{ExecError, Executor, Function, NativeRegistry, Value};
use std::io::Write;

/// Registers `print_value`, `print_str`, `debug`, `collect` and `square`.
pub fn register_stdlib(registry: &mut NativeRegistry) {
    registry.register("print_value", print_value);
    registry.register("print_str", print_str);
    registry.register("debug", debug_dump);
    registry.register("collect", collect);
    registry.register("square", square);
}

pub fn stdlib_registry() -> NativeRegistry {
    let mut registry = NativeRegistry::new();
    register_stdlib(&mut registry);
    registry
}

fn print_value(exec: &mut Executor) -> Result<(), ExecError> {
    let value = exec.pop_value()?;
    let text = format_value(exec, &value)?;
    emit(&format!("{}\n", text))
}

fn print_str(exec: &mut Executor) -> Result<(), ExecError> {
    let list = exec.pop_list()?;
    let text = format_str(&exec.list_values(list)?);
    emit(&format!("{}\n", text))
}

fn debug_dump(exec: &mut Executor) -> Result<(), ExecError> {
    emit(&format!("{}{}", exec.dump_stack(), exec.dump_variables()))
}

fn collect(exec: &mut Executor) -> Result<(), ExecError> {
    exec.collect()?;
    Ok(())
}

fn square(exec: &mut Executor) -> Result<(), ExecError> {
    let value = exec.pop_int()?;
    exec.push_int(value.wrapping_mul(value))
}

fn emit(text: &str) -> Result<(), ExecError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    out.write_all(text.as_bytes())
        .and_then(|_| out.flush())
        .map_err(|err| ExecError::native(format!("failed to write to stdout: {}", err)))
}

/// Renders a value the way `print_value` shows it. Lists are printed with
/// their elements, recursively.
pub fn format_value(exec: &Executor, value: &Value) -> Result<String, ExecError> {
    let text = match value {
        Value::Nothing => "nothing".to_string(),
        Value::Byte(v) => format!("0x{:02x}", v),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => format!("{}f", crate::convert::format_g(*v)),
        Value::Bool(v) => v.to_string(),
        Value::List(list) => {
            let items = exec
                .list_values(*list)?
                .iter()
                .map(|item| format_value(exec, item))
                .collect::<Result<Vec<_>, _>>()?;
            format!("list = [{}]", items.join(", "))
        }
        Value::Function(Function { hint, native }) => match (hint, native) {
            (Some(hint), Some(native)) => format!("func(\"{}\" {:?})", hint, native),
            (None, Some(native)) => format!("func({:?})", native),
            (Some(hint), None) => format!("func(\"{}\")", hint),
            (None, None) => "func()".to_string(),
        },
        Value::Label(label) => format!("label(\"{}\")", label.name),
    };
    Ok(text)
}

/// Renders list elements as a quoted string. Ints are read as code points.
pub fn format_str(items: &[Value]) -> String {
    let body: String = items
        .iter()
        .map(|item| match item {
            Value::Int(v) => u32::try_from(*v)
                .ok()
                .and_then(char::from_u32)
                .unwrap_or('?'),
            Value::Byte(v) => *v as char,
            _ => '?',
        })
        .collect();
    format!("\"{}\"", body)
}

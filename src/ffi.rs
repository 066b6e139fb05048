use crate::{ExecError, Executor};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type NativeBody = dyn Fn(&mut Executor) -> Result<(), ExecError> + Send + Sync;

/// Host function callable from bytecode through `run` and `dynrun`.
///
/// Natives take their arguments from the shared operand stack and leave
/// their results on it.
#[derive(Clone)]
pub struct NativeFn(Arc<NativeBody>);

impl NativeFn {
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(&mut Executor) -> Result<(), ExecError> + Send + Sync + 'static,
    {
        Self(Arc::new(function))
    }

    pub fn call(&self, exec: &mut Executor) -> Result<(), ExecError> {
        (self.0)(exec)
    }

    pub fn ptr_eq(&self, other: &NativeFn) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn address(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:p}", self.address())
    }
}

pub type Resolver = Box<dyn FnMut(&Executor, &str) -> Option<NativeFn> + Send>;

pub struct NativeRegistry {
    pub functions: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&mut Executor) -> Result<(), ExecError> + Send + Sync + 'static,
    {
        self.functions
            .insert(name.to_string(), NativeFn::new(function));
    }

    pub fn get_function(&self, name: &str) -> Option<&NativeFn> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Turns the registry into a resolver for `Executor::set_resolver`.
    pub fn into_resolver(self) -> impl FnMut(&Executor, &str) -> Option<NativeFn> + Send + 'static {
        move |_exec, hint| self.functions.get(hint).cloned()
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

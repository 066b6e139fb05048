pub const DEFAULT_MEMORY_MAX: usize = 1024 * 1024;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1000;
pub const DEFAULT_MAX_STACK_SIZE: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    /// Size of each of the two heap arenas in bytes.
    pub memory_max: usize,
    pub max_call_depth: usize,
    pub max_stack_size: usize,
    /// Make the inactive arena inaccessible between collections.
    pub guard_inactive: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            memory_max: DEFAULT_MEMORY_MAX,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            guard_inactive: true,
        }
    }
}

impl ExecConfig {
    pub fn with_memory(memory_max: usize) -> Self {
        Self {
            memory_max,
            ..Self::default()
        }
    }
}

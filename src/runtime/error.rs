use thiserror::Error;

/// Every fatal condition the execution core can report.
///
/// Variants carry enough context to be useful on their own; the interpreter adds
/// the active frames on top of them through [`RuntimeError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("duplicate definition of {kind} `{name}`")]
    DuplicateDefinition { kind: &'static str, name: String },

    #[error("{pool} index {index} out of range (size {size})")]
    IndexOutOfRange {
        pool: &'static str,
        index: u32,
        size: usize,
    },

    #[error("name constant #{index} is not a string (tag {tag})")]
    MalformedName { index: u32, tag: String },

    #[error("malformed type descriptor `{descriptor}`")]
    MalformedDescriptor { descriptor: String },

    #[error("malformed constant #{index}: {reason}")]
    MalformedConstant { index: u32, reason: String },

    #[error("constant #{index} with tag {tag} cannot be loaded as a value")]
    UnsupportedConstant { index: u32, tag: String },

    #[error("call stack underflow")]
    StackUnderflow,

    #[error("no active frame")]
    NoActiveFrame,

    #[error("call depth limit exceeded ({0})")]
    CallDepthExceeded(usize),

    #[error("operand stack underflow in {op}: needed {needed}, found {found}")]
    OperandStackUnderflow {
        op: &'static str,
        needed: usize,
        found: usize,
    },

    #[error("local slot {index} out of range ({count} locals)")]
    LocalOutOfRange { index: u32, count: usize },

    #[error("type mismatch in {op}: {detail}")]
    TypeMismatch { op: &'static str, detail: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("jump target {target} out of bounds (code length {len})")]
    JumpOutOfBounds { target: u32, len: usize },

    #[error("object is not an array: {0}")]
    NotAnArray(String),

    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: String, len: usize },

    #[error("invalid array size {0}")]
    InvalidArraySize(String),

    #[error("invalid heap reference #{0}")]
    InvalidHeapRef(u32),

    #[error("heap exhausted: {requested} bytes requested, {used} of {limit} bytes in use")]
    HeapExhausted {
        requested: usize,
        used: usize,
        limit: usize,
    },

    #[error("function `{0}` reached the end of its code without a return")]
    MissingReturn(String),

    #[error("`{function}` must return {expected}, got {found}")]
    ReturnTypeMismatch {
        function: String,
        expected: String,
        found: String,
    },

    #[error(
        "entry point `{name}` must take no parameters and return void;, found ({params}) -> {returns}"
    )]
    InvalidEntryPointSignature {
        name: String,
        params: String,
        returns: String,
    },

    #[error("i/o error: {0}")]
    Io(String),
}

impl VmError {
    pub fn type_mismatch(op: &'static str, detail: impl Into<String>) -> Self {
        VmError::TypeMismatch {
            op,
            detail: detail.into(),
        }
    }
}

impl From<std::io::Error> for VmError {
    fn from(err: std::io::Error) -> Self {
        VmError::Io(err.to_string())
    }
}

/// A fatal execution error together with the frames that were active when it
/// happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub kind: VmError,
    pub call_stack: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {}", self.kind)?;

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl RuntimeError {
    pub fn new(kind: VmError) -> Self {
        RuntimeError {
            kind,
            call_stack: Vec::new(),
        }
    }

    /// Record one more frame, outermost first.
    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

impl From<VmError> for RuntimeError {
    fn from(kind: VmError) -> Self {
        RuntimeError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_call_stack() {
        let err = RuntimeError::new(VmError::DivisionByZero);
        assert_eq!(err.to_string(), "runtime error: division by zero");
    }

    #[test]
    fn test_display_lists_innermost_frame_first() {
        let err = RuntimeError::new(VmError::MissingReturn("Sum".to_string()))
            .with_context("Main@4")
            .with_context("Sum@2");

        let rendered = err.to_string();
        let main_pos = rendered.find("Main@4").expect("main frame rendered");
        let sum_pos = rendered.find("Sum@2").expect("sum frame rendered");
        assert!(sum_pos < main_pos, "innermost frame should come first: {rendered}");
        assert!(rendered.contains("0: Sum@2"));
    }

    #[test]
    fn test_message_is_kind_text() {
        let err: RuntimeError = VmError::type_mismatch("ADD", "I32 and Bool").into();
        assert_eq!(err.message(), "type mismatch in ADD: I32 and Bool");
    }
}

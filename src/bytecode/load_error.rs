use crate::runtime::error::VmError;

/// A fatal problem found while reading or linking a `.ball` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub stage: &'static str,
    pub context: String,
    pub message: String,
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[loader][{}] {}: {}", self.stage, self.context, self.message)
    }
}

impl std::error::Error for LoadError {}

impl LoadError {
    pub fn new(stage: &'static str, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            context: context.into(),
            message: message.into(),
        }
    }

    /// Wrap a method-area failure raised while registering loaded records.
    pub fn from_vm(stage: &'static str, context: impl Into<String>, err: VmError) -> Self {
        Self::new(stage, context, err.to_string())
    }
}

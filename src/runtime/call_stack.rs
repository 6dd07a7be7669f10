use std::rc::Rc;

use crate::lang::value::Value;
use crate::runtime::error::VmError;
use crate::runtime::method_area::RuntimeFunction;

/// One activation: operand stack, locals and program counter.
#[derive(Debug)]
pub struct CallFrame {
    pub function: Rc<RuntimeFunction>,
    pub operands: Vec<Value>,
    pub locals: Vec<Value>,
    pub pc: usize,
}

impl CallFrame {
    pub fn new(function: Rc<RuntimeFunction>) -> Self {
        CallFrame {
            operands: Vec::with_capacity(function.max_stack()),
            locals: vec![Value::I32(0); function.locals_count()],
            pc: 0,
            function,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.operands.push(value);
    }

    pub fn pop(&mut self, op: &'static str) -> Result<Value, VmError> {
        self.operands
            .pop()
            .ok_or(VmError::OperandStackUnderflow {
                op,
                needed: 1,
                found: 0,
            })
    }

    /// Fail unless at least `needed` operands are available.
    pub fn require(&self, op: &'static str, needed: usize) -> Result<(), VmError> {
        if self.operands.len() < needed {
            return Err(VmError::OperandStackUnderflow {
                op,
                needed,
                found: self.operands.len(),
            });
        }
        Ok(())
    }

    pub fn peek(&self, op: &'static str) -> Result<&Value, VmError> {
        self.operands.last().ok_or(VmError::OperandStackUnderflow {
            op,
            needed: 1,
            found: 0,
        })
    }

    pub fn load_local(&self, index: u32) -> Result<Value, VmError> {
        self.locals
            .get(index as usize)
            .cloned()
            .ok_or(VmError::LocalOutOfRange {
                index,
                count: self.locals.len(),
            })
    }

    pub fn store_local(&mut self, index: u32, value: Value) -> Result<(), VmError> {
        let count = self.locals.len();
        let slot = self
            .locals
            .get_mut(index as usize)
            .ok_or(VmError::LocalOutOfRange { index, count })?;
        *slot = value;
        Ok(())
    }

    /// `name@pc`, as shown in runtime error backtraces.
    pub fn context(&self) -> String {
        format!("{}@{}", self.function.name, self.pc)
    }
}

/// Strictly LIFO sequence of frames. Doubles as the collector's root set.
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<CallFrame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&mut self, function: Rc<RuntimeFunction>) -> &mut CallFrame {
        self.frames.push(CallFrame::new(function));
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    pub fn pop_frame(&mut self) -> Result<CallFrame, VmError> {
        self.frames.pop().ok_or(VmError::StackUnderflow)
    }

    pub fn current_frame(&self) -> Result<&CallFrame, VmError> {
        self.frames.last().ok_or(VmError::NoActiveFrame)
    }

    pub fn current_frame_mut(&mut self) -> Result<&mut CallFrame, VmError> {
        self.frames.last_mut().ok_or(VmError::NoActiveFrame)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Every local and operand-stack slot across all live frames.
    pub fn roots(&self) -> impl Iterator<Item = &Value> {
        self.frames
            .iter()
            .flat_map(|frame| frame.locals.iter().chain(frame.operands.iter()))
    }

    /// Frame contexts, outermost first.
    pub fn backtrace(&self) -> Vec<String> {
        self.frames.iter().map(CallFrame::context).collect()
    }
}

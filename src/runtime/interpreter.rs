use log::{debug, info, trace, warn};
use std::io::{self, Write};
use std::rc::Rc;

use crate::bytecode::op::Opcode;
use crate::lang::descriptor::TypeDescriptor;
use crate::lang::value::Value;
use crate::runtime::call_stack::CallFrame;
use crate::runtime::data_area::RuntimeDataArea;
use crate::runtime::error::{RuntimeError, VmError};
use crate::runtime::heap::Heap;
use crate::runtime::jit::{ClosureCompiler, JitCompiler, from_lane, to_lane};
use crate::runtime::method_area::RuntimeFunction;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_heap_bytes: usize,
    pub gc_enabled: bool,
    pub jit_enabled: bool,
    pub jit_threshold: u32,
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_heap_bytes: 16 * 1024 * 1024,
            gc_enabled: true,
            jit_enabled: true,
            jit_threshold: 100,
            max_call_depth: 10_000,
        }
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The entry frame returned.
    Returned,
    /// `HALT` with the given exit code.
    Halted(i32),
}

enum NativeCall {
    Returned(Option<Value>),
    Unavailable,
}

pub struct Interpreter {
    config: VmConfig,
    output: Box<dyn Write>,
    jit: Option<Box<dyn JitCompiler>>,
}

impl Interpreter {
    pub fn new(config: VmConfig) -> Self {
        let jit: Option<Box<dyn JitCompiler>> = if config.jit_enabled {
            Some(Box::new(ClosureCompiler::new()))
        } else {
            None
        };
        Interpreter {
            config,
            output: Box::new(io::stdout()),
            jit,
        }
    }

    /// Redirect `PRINT` output.
    pub fn with_output(mut self, output: impl Write + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    pub fn with_compiler(mut self, compiler: Box<dyn JitCompiler>) -> Self {
        self.jit = Some(compiler);
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Execute `entry` until its frame returns, `HALT` runs, or an error
    /// occurs. The call stack is empty afterwards in every case.
    pub fn run(
        &mut self,
        data: &mut RuntimeDataArea,
        entry: Rc<RuntimeFunction>,
    ) -> Result<Outcome, RuntimeError> {
        data.call_stack.clear();
        let name = entry.name.clone();
        data.call_stack.push_frame(entry);

        let result = self.execute(data).map_err(|kind| {
            let err = data
                .call_stack
                .backtrace()
                .iter()
                .fold(RuntimeError::new(kind), |err, frame| err.with_context(frame));
            data.call_stack.clear();
            err
        });
        self.output.flush().map_err(VmError::from)?;

        let outcome = result?;
        info!(
            "{} finished: {:?} ({} live objects, {} collections)",
            name,
            outcome,
            data.heap.live_objects(),
            data.heap.collections()
        );
        Ok(outcome)
    }

    fn execute(&mut self, data: &mut RuntimeDataArea) -> Result<Outcome, VmError> {
        while !data.call_stack.is_empty() {
            if let Some(code) = self.step(data)? {
                return Ok(Outcome::Halted(code));
            }
        }
        Ok(Outcome::Returned)
    }

    /// Fetch, advance `pc`, dispatch. Returns an exit code on `HALT`.
    fn step(&mut self, data: &mut RuntimeDataArea) -> Result<Option<i32>, VmError> {
        let frame = data.call_stack.current_frame_mut()?;
        let pc = frame.pc;
        let Some(&instr) = frame.function.code().get(pc) else {
            return Err(VmError::MissingReturn(frame.function.name.clone()));
        };
        frame.pc = pc + 1;
        trace!("{}@{}: {}", frame.function.name, pc, instr);

        match instr.opcode {
            Opcode::Ldc => frame.push(data.method_area.constant_value(instr.arg())?),
            Opcode::Ldv => {
                let value = frame.load_local(instr.arg())?;
                frame.push(value);
            }
            Opcode::Store => {
                let value = frame.pop("STORE")?;
                frame.store_local(instr.arg(), value)?;
            }
            Opcode::Dup => {
                let value = frame.peek("DUP")?.clone();
                frame.push(value);
            }
            Opcode::Swap => {
                frame.require("SWAP", 2)?;
                let n = frame.operands.len();
                frame.operands.swap(n - 2, n - 1);
            }

            Opcode::Add => binary(frame, "ADD", Value::add)?,
            Opcode::Sub => binary(frame, "SUB", Value::sub)?,
            Opcode::Mul => binary(frame, "MUL", Value::mul)?,
            Opcode::Div => binary(frame, "DIV", Value::div)?,
            Opcode::Mod => binary(frame, "MOD", Value::rem)?,
            Opcode::Eq => binary(frame, "EQ", Value::equals)?,
            Opcode::Lt => binary(frame, "LT", Value::less_than)?,
            Opcode::Leq => binary(frame, "LEQ", Value::less_or_equal)?,
            Opcode::Lor => binary(frame, "LOR", Value::logical_or)?,
            Opcode::Land => binary(frame, "LAND", Value::logical_and)?,
            Opcode::Min => {
                let value = frame.pop("MIN")?;
                frame.push(value.negate()?);
            }
            Opcode::Neg => {
                let value = frame.pop("NEG")?;
                frame.push(value.not()?);
            }

            Opcode::Jmp => jump(frame, instr.arg())?,
            Opcode::Jz | Opcode::Jnz => {
                let op = instr.opcode.mnemonic();
                let cond = frame.pop(op)?;
                let falsy = cond.is_falsy().ok_or_else(|| {
                    VmError::type_mismatch(
                        op,
                        format!("condition must be an integer or boolean, got {}", cond.type_name()),
                    )
                })?;
                if falsy == (instr.opcode == Opcode::Jz) {
                    jump(frame, instr.arg())?;
                }
            }

            Opcode::NewArr => {
                let element = data.method_area.descriptor(instr.arg())?;
                let size = frame.pop("NEWARR")?;
                let len = size.as_i128().ok_or_else(|| {
                    VmError::type_mismatch(
                        "NEWARR",
                        format!("array size must be an integer, got {}", size.type_name()),
                    )
                })?;
                let len = usize::try_from(len).map_err(|_| VmError::InvalidArraySize(len.to_string()))?;
                // May collect; the size is already off the stack.
                let array = data.heap.allocate_array(&element, len, &data.call_stack)?;
                data.call_stack.current_frame_mut()?.push(Value::Ref(array));
            }
            Opcode::StElem => {
                frame.require("STELEM", 3)?;
                let value = frame.pop("STELEM")?;
                let index = frame.pop("STELEM")?;
                let array = frame.pop("STELEM")?;
                let array = array
                    .as_heap_ref()
                    .ok_or_else(|| VmError::NotAnArray(array.to_string()))?;
                data.heap.store_element(array, &index, value)?;
            }
            Opcode::LdElem => {
                frame.require("LDELEM", 2)?;
                let index = frame.pop("LDELEM")?;
                let array = frame.pop("LDELEM")?;
                let array = array
                    .as_heap_ref()
                    .ok_or_else(|| VmError::NotAnArray(array.to_string()))?;
                frame.push(data.heap.load_element(array, &index)?);
            }

            Opcode::Call => {
                let callee = Rc::clone(data.method_area.function(instr.arg())?);
                frame.require("CALL", callee.arity())?;
                let split = frame.operands.len() - callee.arity();
                let args = frame.operands.split_off(split);
                self.call(data, callee, args)?;
            }
            Opcode::Ret => {
                let value = return_value(frame)?;
                data.call_stack.pop_frame()?;
                if let (Some(value), Ok(caller)) = (value, data.call_stack.current_frame_mut()) {
                    caller.push(value);
                }
            }

            Opcode::Print => {
                let value = frame.pop("PRINT")?;
                write!(self.output, "{}", value)?;
            }
            Opcode::Halt => {
                let value = data.method_area.constant_value(instr.arg())?;
                let code = value
                    .as_i128()
                    .and_then(|n| i32::try_from(n).ok())
                    .ok_or_else(|| {
                        VmError::type_mismatch(
                            "HALT",
                            format!("exit code must fit in I32, got {} {}", value.type_name(), value),
                        )
                    })?;
                debug!("halt with exit code {} at depth {}", code, data.call_stack.depth());
                data.call_stack.clear();
                return Ok(Some(code));
            }
        }

        Ok(None)
    }

    /// Push a frame for `callee` seeded with `args`, or run its compiled form.
    fn call(
        &mut self,
        data: &mut RuntimeDataArea,
        callee: Rc<RuntimeFunction>,
        args: Vec<Value>,
    ) -> Result<(), VmError> {
        if data.call_stack.depth() >= self.config.max_call_depth {
            return Err(VmError::CallDepthExceeded(self.config.max_call_depth));
        }

        if let NativeCall::Returned(result) = self.try_native(data, &callee, &args) {
            if let Some(value) = result {
                data.call_stack.current_frame_mut()?.push(value);
            }
            return Ok(());
        }

        let frame = data.call_stack.push_frame(callee);
        frame.operands.extend(args);
        Ok(())
    }

    fn try_native(
        &self,
        data: &mut RuntimeDataArea,
        callee: &RuntimeFunction,
        args: &[Value],
    ) -> NativeCall {
        let Some(jit) = self.jit.as_ref() else {
            return NativeCall::Unavailable;
        };
        let state = &callee.jit;
        if state.is_disabled() || state.record_call() <= self.config.jit_threshold {
            return NativeCall::Unavailable;
        }

        let compiled = match state.compiled() {
            Some(compiled) => compiled,
            None => {
                if !jit.can_compile(callee, &data.method_area) {
                    debug!("{} is not compilable, staying interpreted", callee.name);
                    state.disable();
                    return NativeCall::Unavailable;
                }
                match jit.compile_function(callee, &data.method_area) {
                    Ok(compiled) => {
                        debug!("compiled {}{} after {} calls", callee.name, callee.signature(), state.calls());
                        state.install(Rc::clone(&compiled));
                        compiled
                    }
                    Err(e) => {
                        debug!("compiling {} failed: {}", callee.name, e);
                        state.disable();
                        return NativeCall::Unavailable;
                    }
                }
            }
        };

        // Arguments the compiled form was not specialised for are interpreted
        // without giving up on it.
        let Some(lanes) = native_args(callee, args, &data.heap) else {
            return NativeCall::Unavailable;
        };

        match compiled.invoke(&lanes, &mut data.heap) {
            Ok(_) if callee.return_type.is_void() => NativeCall::Returned(None),
            Ok(raw) => match from_lane(raw, &callee.return_type) {
                Some(value) => NativeCall::Returned(Some(value)),
                None => {
                    warn!("native result of {} has no {} form", callee.name, callee.return_type);
                    state.disable();
                    NativeCall::Unavailable
                }
            },
            Err(e) => {
                warn!("native call to {} failed ({}), falling back to the interpreter", callee.name, e);
                state.disable();
                NativeCall::Unavailable
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn binary(
    frame: &mut CallFrame,
    op: &'static str,
    apply: fn(&Value, &Value) -> Result<Value, VmError>,
) -> Result<(), VmError> {
    frame.require(op, 2)?;
    let b = frame.pop(op)?;
    let a = frame.pop(op)?;
    frame.push(apply(&a, &b)?);
    Ok(())
}

fn jump(frame: &mut CallFrame, target: u32) -> Result<(), VmError> {
    let len = frame.function.code().len();
    if target as usize >= len {
        return Err(VmError::JumpOutOfBounds { target, len });
    }
    frame.pc = target as usize;
    Ok(())
}

/// Pop and check the value `RET` hands to the caller; `None` for `void;`.
fn return_value(frame: &mut CallFrame) -> Result<Option<Value>, VmError> {
    if frame.function.return_type.is_void() {
        return Ok(None);
    }
    let value = frame.pop("RET")?;
    let expected = &frame.function.return_type;
    if !expected.matches(&value) {
        return Err(VmError::ReturnTypeMismatch {
            function: frame.function.name.clone(),
            expected: expected.to_string(),
            found: value.type_name().to_string(),
        });
    }
    Ok(Some(value))
}

/// Lane form of `args`, or `None` if any argument is not exactly what the
/// parameter declares (including the element type of array arguments).
fn native_args(callee: &RuntimeFunction, args: &[Value], heap: &Heap) -> Option<Vec<i64>> {
    callee
        .params
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            if !param.matches(arg) {
                return None;
            }
            if let TypeDescriptor::Array(element) = param {
                let object = heap.get(arg.as_heap_ref()?).ok()?;
                if object.element_type.as_ref() != Some(element.as_ref()) {
                    return None;
                }
            }
            to_lane(arg)
        })
        .collect()
}

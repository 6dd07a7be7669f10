//! Native compilation of hot functions.
//!
//! The interpreter counts calls per function and, past a threshold, asks a
//! [`JitCompiler`] for a directly invocable [`CompiledFunction`]. Compiled code
//! works on a flat `i64` lane and reaches the heap only through [`HeapHelper`],
//! which cannot allocate, so no collection can run while it holds raw handles.
//! Any [`JitError`] makes the interpreter disable native calls for that
//! function and interpret the call instead.

use log::debug;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

use crate::bytecode::constant::ConstantTag;
use crate::bytecode::op::Opcode;
use crate::lang::descriptor::TypeDescriptor;
use crate::lang::value::{HeapRef, Value};
use crate::runtime::error::VmError;
use crate::runtime::heap::Heap;
use crate::runtime::method_area::{MethodArea, RuntimeFunction};
use crate::runtime::optimizer::{self, Step};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JitError {
    #[error("cannot compile `{function}`: {reason}")]
    Unsupported { function: String, reason: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("native operand stack underflow")]
    StackUnderflow,

    #[error("native code ran off the end of `{0}`")]
    MissingReturn(String),

    #[error(transparent)]
    Runtime(#[from] VmError),
}

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

/// Heap access granted to compiled code. Deliberately allocation-free.
pub trait HeapHelper {
    fn array_len(&self, array: HeapRef) -> Result<usize, JitError>;
    fn load_element(&self, array: HeapRef, index: i64) -> Result<i64, JitError>;
    fn store_element(&mut self, array: HeapRef, index: i64, value: i64) -> Result<(), JitError>;
}

pub trait CompiledFunction {
    fn arity(&self) -> usize;
    fn invoke(&self, args: &[i64], heap: &mut dyn HeapHelper) -> Result<i64, JitError>;
}

pub trait JitCompiler {
    fn can_compile(&self, function: &RuntimeFunction, area: &MethodArea) -> bool;
    fn compile_function(
        &self,
        function: &RuntimeFunction,
        area: &MethodArea,
    ) -> Result<Rc<dyn CompiledFunction>, JitError>;
}

/// Per-function bookkeeping: call counter, cached compiled form, and whether
/// native invocation has been given up on.
#[derive(Default)]
pub struct JitState {
    calls: Cell<u32>,
    compiled: RefCell<Option<Rc<dyn CompiledFunction>>>,
    disabled: Cell<bool>,
}

impl JitState {
    pub fn record_call(&self) -> u32 {
        let n = self.calls.get().saturating_add(1);
        self.calls.set(n);
        n
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }

    pub fn compiled(&self) -> Option<Rc<dyn CompiledFunction>> {
        self.compiled.borrow().clone()
    }

    pub fn install(&self, compiled: Rc<dyn CompiledFunction>) {
        *self.compiled.borrow_mut() = Some(compiled);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.get()
    }

    pub fn disable(&self) {
        self.disabled.set(true);
        self.compiled.borrow_mut().take();
    }
}

impl fmt::Debug for JitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitState")
            .field("calls", &self.calls.get())
            .field("compiled", &self.compiled.borrow().is_some())
            .field("disabled", &self.disabled.get())
            .finish()
    }
}

// =============================================================================
// LANE CONVERSIONS
// =============================================================================

/// Flatten a value into the native lane: integers as-is, bools as 0/1,
/// references as their id. `None` if an integer does not fit in `i64`.
pub fn to_lane(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(*b as i64),
        Value::Ref(r) => Some(r.0 as i64),
        Value::Str(_) => None,
        other => i64::try_from(other.as_i128()?).ok(),
    }
}

/// Rebuild a tagged value from a raw lane result; `None` for `void;`.
pub fn from_lane(raw: i64, descriptor: &TypeDescriptor) -> Option<Value> {
    match descriptor {
        TypeDescriptor::Bool => Some(Value::Bool(raw != 0)),
        TypeDescriptor::Array(_) | TypeDescriptor::Class(_) => Some(Value::Ref(HeapRef(raw as u32))),
        TypeDescriptor::Int { .. } => descriptor.wrap_int(raw as i128),
        TypeDescriptor::String | TypeDescriptor::Void => None,
    }
}

impl HeapHelper for Heap {
    fn array_len(&self, array: HeapRef) -> Result<usize, JitError> {
        Ok(Heap::array_len(self, array)?)
    }

    fn load_element(&self, array: HeapRef, index: i64) -> Result<i64, JitError> {
        let value = Heap::load_element(self, array, &Value::I64(index))?;
        to_lane(&value).ok_or_else(|| {
            VmError::type_mismatch("LDELEM", format!("{} element in native code", value.type_name()))
                .into()
        })
    }

    fn store_element(&mut self, array: HeapRef, index: i64, value: i64) -> Result<(), JitError> {
        let element = self
            .get(array)?
            .element_type
            .clone()
            .ok_or_else(|| VmError::NotAnArray(array.to_string()))?;
        let value = from_lane(value, &element).ok_or_else(|| {
            VmError::type_mismatch("STELEM", format!("{} element in native code", element))
        })?;
        Ok(Heap::store_element(self, array, &Value::I64(index), value)?)
    }
}

// =============================================================================
// CLOSURE COMPILER
// =============================================================================

/// Integer width every value of a compiled function shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    I32,
    I64,
}

impl Lane {
    pub fn bits(self) -> u8 {
        match self {
            Lane::I32 => 32,
            Lane::I64 => 64,
        }
    }

    pub(crate) fn wrap(self, v: i64) -> i64 {
        match self {
            Lane::I32 => v as i32 as i64,
            Lane::I64 => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Int,
    Bool,
    Array,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KindState {
    stack: Vec<Kind>,
    locals: Vec<Option<Kind>>,
}

enum Flow {
    Next,
    Jump(usize),
    Return(i64),
}

struct Machine {
    stack: Vec<i64>,
    locals: Vec<i64>,
    // Stores are held back until the function returns so a failed native
    // call leaves the heap exactly as the interpreter will find it.
    journal: Vec<(HeapRef, i64, i64)>,
}

impl Machine {
    fn push(&mut self, v: i64) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Result<i64, JitError> {
        self.stack.pop().ok_or(JitError::StackUnderflow)
    }

    fn local(&self, index: usize) -> Result<i64, JitError> {
        self.locals
            .get(index)
            .copied()
            .ok_or_else(|| self.local_out_of_range(index))
    }

    fn set_local(&mut self, index: usize, value: i64) -> Result<(), JitError> {
        let err = self.local_out_of_range(index);
        let slot = self.locals.get_mut(index).ok_or(err)?;
        *slot = value;
        Ok(())
    }

    fn local_out_of_range(&self, index: usize) -> JitError {
        VmError::LocalOutOfRange {
            index: index as u32,
            count: self.locals.len(),
        }
        .into()
    }

    fn load(&self, heap: &dyn HeapHelper, array: HeapRef, index: i64) -> Result<i64, JitError> {
        let pending = self
            .journal
            .iter()
            .rev()
            .find(|(a, i, _)| *a == array && *i == index);
        match pending {
            Some((_, _, v)) => Ok(*v),
            None => heap.load_element(array, index),
        }
    }

    fn store(
        &mut self,
        heap: &dyn HeapHelper,
        array: HeapRef,
        index: i64,
        value: i64,
    ) -> Result<(), JitError> {
        let len = heap.array_len(array)?;
        if index < 0 || index as u64 >= len as u64 {
            return Err(VmError::IndexOutOfBounds {
                index: index.to_string(),
                len,
            }
            .into());
        }
        self.journal.push((array, index, value));
        Ok(())
    }

    fn commit(&mut self, heap: &mut dyn HeapHelper) -> Result<(), JitError> {
        for (array, index, value) in std::mem::take(&mut self.journal) {
            heap.store_element(array, index, value)?;
        }
        Ok(())
    }
}

type NativeOp = Box<dyn Fn(&mut Machine, &mut dyn HeapHelper) -> Result<Flow, JitError>>;

fn op<F>(f: F) -> NativeOp
where
    F: Fn(&mut Machine, &mut dyn HeapHelper) -> Result<Flow, JitError> + 'static,
{
    Box::new(f)
}

/// A function translated into one boxed closure per instruction.
pub struct ClosureFunction {
    name: String,
    arity: usize,
    locals: usize,
    lane: Lane,
    ops: Vec<NativeOp>,
}

impl ClosureFunction {
    pub fn lane(&self) -> Lane {
        self.lane
    }
}

impl CompiledFunction for ClosureFunction {
    fn arity(&self) -> usize {
        self.arity
    }

    fn invoke(&self, args: &[i64], heap: &mut dyn HeapHelper) -> Result<i64, JitError> {
        let mut m = Machine {
            stack: args.to_vec(),
            locals: vec![0; self.locals],
            journal: Vec::new(),
        };

        let mut pc = 0;
        loop {
            let op = self
                .ops
                .get(pc)
                .ok_or_else(|| JitError::MissingReturn(self.name.clone()))?;
            match op(&mut m, &mut *heap)? {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = target,
                Flow::Return(v) => {
                    m.commit(heap)?;
                    return Ok(v);
                }
            }
        }
    }
}

/// The bundled compiler. Accepts straight integer code over a single signed
/// lane: no calls, allocation, printing or halting.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClosureCompiler;

impl ClosureCompiler {
    pub fn new() -> Self {
        ClosureCompiler
    }

    fn unsupported(function: &RuntimeFunction, reason: impl Into<String>) -> JitError {
        JitError::Unsupported {
            function: function.name.clone(),
            reason: reason.into(),
        }
    }

    /// Pick the lane every integer in the function agrees on.
    fn select_lane(function: &RuntimeFunction, area: &MethodArea) -> Result<Lane, JitError> {
        let mut bits: Option<u8> = None;
        let mut agree = |b: u8, what: &str| -> Result<(), JitError> {
            if b != 32 && b != 64 {
                return Err(Self::unsupported(function, format!("{} is {}-bit", what, b)));
            }
            match bits {
                Some(prev) if prev != b => Err(Self::unsupported(function, "mixed integer widths")),
                _ => {
                    bits = Some(b);
                    Ok(())
                }
            }
        };

        let signature = function.params.iter().chain(std::iter::once(&function.return_type));
        for desc in signature {
            match desc {
                TypeDescriptor::Int { signed: true, bits } => agree(*bits, "an integer")?,
                TypeDescriptor::Array(inner) => match inner.as_ref() {
                    TypeDescriptor::Int { signed: true, bits } => agree(*bits, "an array element")?,
                    other => {
                        return Err(Self::unsupported(function, format!("array of {}", other)));
                    }
                },
                TypeDescriptor::Bool | TypeDescriptor::Void => {}
                other => return Err(Self::unsupported(function, format!("type {}", other))),
            }
        }

        for instr in function.code() {
            if instr.opcode != Opcode::Ldc {
                continue;
            }
            match area.constant(instr.arg())?.tag {
                ConstantTag::I32 => agree(32, "a constant")?,
                ConstantTag::I64 => agree(64, "a constant")?,
                ConstantTag::Bool => {}
                other => return Err(Self::unsupported(function, format!("{} constant", other))),
            }
        }

        Ok(match bits {
            Some(32) => Lane::I32,
            _ => Lane::I64,
        })
    }

    fn kind_of(desc: &TypeDescriptor) -> Option<Kind> {
        match desc {
            TypeDescriptor::Int { .. } => Some(Kind::Int),
            TypeDescriptor::Bool => Some(Kind::Bool),
            TypeDescriptor::Array(_) => Some(Kind::Array),
            _ => None,
        }
    }

    /// Abstract interpretation over value kinds. Rejects anything the
    /// interpreter would treat as a type error, so compiled and interpreted
    /// runs agree on every accepted function.
    fn check_kinds(function: &RuntimeFunction, area: &MethodArea, lane: Lane) -> Result<(), JitError> {
        let code = function.code();
        let fail = |pc: usize, what: &str| Self::unsupported(function, format!("{} at {}", what, pc));

        let entry = KindState {
            stack: function
                .params
                .iter()
                .map(|p| Self::kind_of(p).ok_or_else(|| fail(0, "parameter type")))
                .collect::<Result<_, _>>()?,
            locals: vec![if lane == Lane::I32 { Some(Kind::Int) } else { None }; function.locals_count()],
        };

        let mut states: Vec<Option<KindState>> = vec![None; code.len()];
        let mut worklist = vec![0usize];
        if code.is_empty() {
            return Err(fail(0, "empty body"));
        }
        states[0] = Some(entry);

        while let Some(pc) = worklist.pop() {
            let Some(mut state) = states[pc].clone() else {
                continue;
            };
            let instr = code[pc];

            let pop = |state: &mut KindState| state.stack.pop().ok_or_else(|| fail(pc, "underflow"));
            let mut successors: Vec<usize> = Vec::new();

            match instr.opcode {
                Opcode::Ldc => {
                    let kind = match area.constant(instr.arg())?.tag {
                        ConstantTag::Bool => Kind::Bool,
                        _ => Kind::Int,
                    };
                    state.stack.push(kind);
                }
                Opcode::Ldv => {
                    let kind = state
                        .locals
                        .get(instr.arg() as usize)
                        .copied()
                        .flatten()
                        .ok_or_else(|| fail(pc, "read of an unset local"))?;
                    state.stack.push(kind);
                }
                Opcode::Store => {
                    let kind = pop(&mut state)?;
                    let slot = state
                        .locals
                        .get_mut(instr.arg() as usize)
                        .ok_or_else(|| fail(pc, "local out of range"))?;
                    *slot = Some(kind);
                }
                Opcode::Dup => {
                    let k = pop(&mut state)?;
                    state.stack.extend([k, k]);
                }
                Opcode::Swap => {
                    let b = pop(&mut state)?;
                    let a = pop(&mut state)?;
                    state.stack.extend([b, a]);
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    let b = pop(&mut state)?;
                    let a = pop(&mut state)?;
                    if (a, b) != (Kind::Int, Kind::Int) {
                        return Err(fail(pc, "arithmetic on non-integers"));
                    }
                    state.stack.push(Kind::Int);
                }
                Opcode::Lt | Opcode::Leq => {
                    let b = pop(&mut state)?;
                    let a = pop(&mut state)?;
                    if (a, b) != (Kind::Int, Kind::Int) {
                        return Err(fail(pc, "ordering of non-integers"));
                    }
                    state.stack.push(Kind::Bool);
                }
                Opcode::Eq => {
                    let b = pop(&mut state)?;
                    let a = pop(&mut state)?;
                    if a != b {
                        return Err(fail(pc, "comparison of different kinds"));
                    }
                    state.stack.push(Kind::Bool);
                }
                Opcode::Lor | Opcode::Land => {
                    let b = pop(&mut state)?;
                    let a = pop(&mut state)?;
                    if (a, b) != (Kind::Bool, Kind::Bool) {
                        return Err(fail(pc, "logic on non-booleans"));
                    }
                    state.stack.push(Kind::Bool);
                }
                Opcode::Min => {
                    if pop(&mut state)? != Kind::Int {
                        return Err(fail(pc, "negation of a non-integer"));
                    }
                    state.stack.push(Kind::Int);
                }
                Opcode::Neg => {
                    if pop(&mut state)? != Kind::Bool {
                        return Err(fail(pc, "logical not of a non-boolean"));
                    }
                    state.stack.push(Kind::Bool);
                }
                Opcode::LdElem => {
                    let index = pop(&mut state)?;
                    let array = pop(&mut state)?;
                    if (array, index) != (Kind::Array, Kind::Int) {
                        return Err(fail(pc, "element load"));
                    }
                    state.stack.push(Kind::Int);
                }
                Opcode::StElem => {
                    let value = pop(&mut state)?;
                    let index = pop(&mut state)?;
                    let array = pop(&mut state)?;
                    if (array, index, value) != (Kind::Array, Kind::Int, Kind::Int) {
                        return Err(fail(pc, "element store"));
                    }
                }
                Opcode::Jz | Opcode::Jnz => {
                    if pop(&mut state)? == Kind::Array {
                        return Err(fail(pc, "branch on a reference"));
                    }
                    successors.push(instr.arg() as usize);
                }
                Opcode::Jmp => {}
                Opcode::Ret => {
                    if !function.return_type.is_void() {
                        let kind = pop(&mut state)?;
                        if Some(kind) != Self::kind_of(&function.return_type) {
                            return Err(fail(pc, "return of the wrong kind"));
                        }
                    }
                }
                Opcode::Call | Opcode::NewArr | Opcode::Print | Opcode::Halt => {
                    return Err(fail(pc, instr.opcode.mnemonic()));
                }
            }

            match instr.opcode {
                Opcode::Ret => {}
                Opcode::Jmp => successors.push(instr.arg() as usize),
                _ => successors.push(pc + 1),
            }

            for next in successors {
                if next >= code.len() {
                    return Err(fail(pc, "control leaves the function"));
                }
                if states[next].is_none() {
                    states[next] = Some(state.clone());
                    worklist.push(next);
                    continue;
                }
                if let Some(existing) = states[next].as_mut() {
                    if existing.stack != state.stack {
                        return Err(fail(next, "inconsistent stack at join"));
                    }
                    let mut changed = false;
                    for (have, incoming) in existing.locals.iter_mut().zip(&state.locals) {
                        if have.is_some() && *have != *incoming {
                            *have = None;
                            changed = true;
                        }
                    }
                    if changed {
                        worklist.push(next);
                    }
                }
            }
        }

        Ok(())
    }

    fn emit(step: Step, lane: Lane, returns: bool) -> Result<NativeOp, JitError> {
        let instr = match step {
            Step::Push(v) => {
                return Ok(op(move |m, _| {
                    m.push(v);
                    Ok(Flow::Next)
                }));
            }
            Step::Op(instr) => instr,
        };
        let arg = instr.arg();
        let slot = arg as usize;

        macro_rules! binary {
            (|$a:ident, $b:ident| $body:expr) => {
                op(move |m, _| {
                    let $b = m.pop()?;
                    let $a = m.pop()?;
                    m.push($body);
                    Ok(Flow::Next)
                })
            };
        }

        Ok(match instr.opcode {
            Opcode::Ldv => op(move |m, _| {
                let v = m.local(slot)?;
                m.push(v);
                Ok(Flow::Next)
            }),
            Opcode::Store => op(move |m, _| {
                let v = m.pop()?;
                m.set_local(slot, v)?;
                Ok(Flow::Next)
            }),
            Opcode::Dup => op(|m, _| {
                let v = m.pop()?;
                m.push(v);
                m.push(v);
                Ok(Flow::Next)
            }),
            Opcode::Swap => op(|m, _| {
                let b = m.pop()?;
                let a = m.pop()?;
                m.push(b);
                m.push(a);
                Ok(Flow::Next)
            }),
            Opcode::Add => binary!(|a, b| lane.wrap(a.wrapping_add(b))),
            Opcode::Sub => binary!(|a, b| lane.wrap(a.wrapping_sub(b))),
            Opcode::Mul => binary!(|a, b| lane.wrap(a.wrapping_mul(b))),
            Opcode::Div => op(move |m, _| {
                let b = m.pop()?;
                let a = m.pop()?;
                if b == 0 {
                    return Err(JitError::DivisionByZero);
                }
                m.push(lane.wrap(a.wrapping_div(b)));
                Ok(Flow::Next)
            }),
            Opcode::Mod => op(move |m, _| {
                let b = m.pop()?;
                let a = m.pop()?;
                if b == 0 {
                    return Err(JitError::DivisionByZero);
                }
                m.push(lane.wrap(a.wrapping_rem(b)));
                Ok(Flow::Next)
            }),
            Opcode::Min => op(move |m, _| {
                let a = m.pop()?;
                m.push(lane.wrap(a.wrapping_neg()));
                Ok(Flow::Next)
            }),
            Opcode::Neg => op(|m, _| {
                let a = m.pop()?;
                m.push((a == 0) as i64);
                Ok(Flow::Next)
            }),
            Opcode::Eq => binary!(|a, b| (a == b) as i64),
            Opcode::Lt => binary!(|a, b| (a < b) as i64),
            Opcode::Leq => binary!(|a, b| (a <= b) as i64),
            Opcode::Lor => binary!(|a, b| (a != 0 || b != 0) as i64),
            Opcode::Land => binary!(|a, b| (a != 0 && b != 0) as i64),
            Opcode::Jmp => op(move |_, _| Ok(Flow::Jump(slot))),
            Opcode::Jz => op(move |m, _| {
                Ok(if m.pop()? == 0 {
                    Flow::Jump(slot)
                } else {
                    Flow::Next
                })
            }),
            Opcode::Jnz => op(move |m, _| {
                Ok(if m.pop()? != 0 {
                    Flow::Jump(slot)
                } else {
                    Flow::Next
                })
            }),
            Opcode::LdElem => op(|m, heap| {
                let index = m.pop()?;
                let array = m.pop()?;
                let v = m.load(heap, HeapRef(array as u32), index)?;
                m.push(v);
                Ok(Flow::Next)
            }),
            Opcode::StElem => op(|m, heap| {
                let value = m.pop()?;
                let index = m.pop()?;
                let array = m.pop()?;
                m.store(heap, HeapRef(array as u32), index, value)?;
                Ok(Flow::Next)
            }),
            Opcode::Ret => op(move |m, _| {
                let v = if returns { m.pop()? } else { 0 };
                Ok(Flow::Return(v))
            }),
            Opcode::Ldc | Opcode::Call | Opcode::NewArr | Opcode::Print | Opcode::Halt => {
                return Err(JitError::Unsupported {
                    function: String::new(),
                    reason: instr.opcode.mnemonic().to_string(),
                });
            }
        })
    }

    fn analyze(&self, function: &RuntimeFunction, area: &MethodArea) -> Result<Lane, JitError> {
        let lane = Self::select_lane(function, area)?;
        Self::check_kinds(function, area, lane)?;
        Ok(lane)
    }
}

impl JitCompiler for ClosureCompiler {
    fn can_compile(&self, function: &RuntimeFunction, area: &MethodArea) -> bool {
        match self.analyze(function, area) {
            Ok(_) => true,
            Err(e) => {
                debug!("jit: {}", e);
                false
            }
        }
    }

    fn compile_function(
        &self,
        function: &RuntimeFunction,
        area: &MethodArea,
    ) -> Result<Rc<dyn CompiledFunction>, JitError> {
        let lane = self.analyze(function, area)?;
        let returns = !function.return_type.is_void();

        let steps = optimizer::optimize(optimizer::lower(function, area)?, lane);
        let ops = steps
            .iter()
            .map(|step| Self::emit(*step, lane, returns))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "jit: compiled `{}` ({} ops from {} instructions, {}-bit lane)",
            function.name,
            ops.len(),
            function.code().len(),
            lane.bits()
        );

        Ok(Rc::new(ClosureFunction {
            name: function.name.clone(),
            arity: function.arity(),
            locals: function.locals_count(),
            lane,
            ops,
        }))
    }
}

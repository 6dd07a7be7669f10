use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::constant::{Constant, ConstantTag};
use crate::bytecode::op::Instruction;
use crate::lang::descriptor::{self, TypeDescriptor};
use crate::lang::value::Value;
use crate::runtime::error::VmError;
use crate::runtime::jit::JitState;

// =============================================================================
// DEFINITIONS - what the loader hands to the method area
// =============================================================================

/// A function record with every reference still expressed as a constant index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name_index: u32,
    pub params_index: u32,
    pub return_index: u32,
    pub max_stack: u16,
    pub locals_count: u16,
    pub code: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name_index: u32,
    pub descriptor_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name_index: u32,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<u32>,
}

// =============================================================================
// RUNTIME FORMS
// =============================================================================

/// A registered function with its signature resolved.
///
/// Everything but `jit` is fixed at registration. `jit` holds the native
/// compiler bookkeeping and is only touched by the interpreter.
pub struct RuntimeFunction {
    pub name: String,
    pub def: FunctionDef,
    pub params: Vec<TypeDescriptor>,
    pub return_type: TypeDescriptor,
    pub jit: JitState,
}

impl RuntimeFunction {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn code(&self) -> &[Instruction] {
        &self.def.code
    }

    pub fn locals_count(&self) -> usize {
        self.def.locals_count as usize
    }

    pub fn max_stack(&self) -> usize {
        self.def.max_stack as usize
    }

    /// `(I32;I32;) -> I32;`
    pub fn signature(&self) -> String {
        format!(
            "({}) -> {}",
            descriptor::format_list(&self.params),
            self.return_type
        )
    }
}

impl fmt::Debug for RuntimeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("return_type", &self.return_type)
            .field("max_stack", &self.def.max_stack)
            .field("locals_count", &self.def.locals_count)
            .field("code_len", &self.def.code.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeField {
    pub name: String,
    pub descriptor: TypeDescriptor,
    pub offset: usize,
}

/// A record type with its field layout computed once, at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeClass {
    pub name: String,
    pub def: ClassDef,
    pub fields: Vec<RuntimeField>,
    pub methods: Vec<u32>,
    pub size: usize,
}

impl RuntimeClass {
    pub fn field(&self, name: &str) -> Option<&RuntimeField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Default-initialised field values in declaration order.
    pub fn default_fields(&self) -> Vec<Value> {
        self.fields
            .iter()
            .filter_map(|f| f.descriptor.default_value())
            .collect()
    }
}

// =============================================================================
// METHOD AREA
// =============================================================================

/// Append-only registry of constants, functions and classes.
/// Indices handed out by `register_*` stay valid for the area's lifetime.
#[derive(Debug, Default)]
pub struct MethodArea {
    constants: Vec<Constant>,
    functions: Vec<Rc<RuntimeFunction>>,
    classes: Vec<RuntimeClass>,
    function_names: HashMap<String, u32>,
    class_names: HashMap<String, u32>,
}

impl MethodArea {
    pub fn new() -> Self {
        Self::default()
    }

    // Constants

    pub fn register_constant(&mut self, constant: Constant) -> u32 {
        let index = self.constants.len() as u32;
        debug!("constant #{} = {}", index, constant);
        self.constants.push(constant);
        index
    }

    pub fn constant(&self, index: u32) -> Result<&Constant, VmError> {
        self.constants
            .get(index as usize)
            .ok_or(VmError::IndexOutOfRange {
                pool: "constant",
                index,
                size: self.constants.len(),
            })
    }

    pub fn constant_value(&self, index: u32) -> Result<Value, VmError> {
        self.constant(index)?.to_value(index)
    }

    /// Text of a constant used as a name; it must carry the string tag.
    pub fn constant_name(&self, index: u32) -> Result<&str, VmError> {
        let constant = self.constant(index)?;
        match constant.tag {
            ConstantTag::String | ConstantTag::Class => {
                constant.as_text().ok_or_else(|| VmError::MalformedName {
                    index,
                    tag: constant.tag.to_string(),
                })
            }
            other => Err(VmError::MalformedName {
                index,
                tag: other.to_string(),
            }),
        }
    }

    pub fn descriptor(&self, index: u32) -> Result<TypeDescriptor, VmError> {
        TypeDescriptor::parse(self.constant_name(index)?)
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    // Functions

    pub fn register_function(&mut self, def: FunctionDef) -> Result<u32, VmError> {
        let name = self.constant_name(def.name_index)?.to_string();
        let params = TypeDescriptor::parse_list(self.constant_name(def.params_index)?)?;
        let return_type = self.descriptor(def.return_index)?;

        if self.function_names.contains_key(&name) {
            return Err(VmError::DuplicateDefinition {
                kind: "function",
                name,
            });
        }

        let index = self.functions.len() as u32;
        let function = RuntimeFunction {
            name: name.clone(),
            def,
            params,
            return_type,
            jit: JitState::default(),
        };
        debug!(
            "function #{} {}{} ({} instructions, {} locals)",
            index,
            function.name,
            function.signature(),
            function.code().len(),
            function.locals_count()
        );

        self.function_names.insert(name, index);
        self.functions.push(Rc::new(function));
        Ok(index)
    }

    pub fn function(&self, index: u32) -> Result<&Rc<RuntimeFunction>, VmError> {
        self.functions
            .get(index as usize)
            .ok_or(VmError::IndexOutOfRange {
                pool: "function",
                index,
                size: self.functions.len(),
            })
    }

    pub fn function_by_name(&self, name: &str) -> Option<&Rc<RuntimeFunction>> {
        let index = *self.function_names.get(name)?;
        self.functions.get(index as usize)
    }

    pub fn function_index(&self, name: &str) -> Option<u32> {
        self.function_names.get(name).copied()
    }

    pub fn functions(&self) -> &[Rc<RuntimeFunction>] {
        &self.functions
    }

    // Classes

    pub fn register_class(&mut self, def: ClassDef) -> Result<u32, VmError> {
        let name = self.constant_name(def.name_index)?.to_string();

        let mut fields = Vec::with_capacity(def.fields.len());
        let mut offset = 0;
        for field in &def.fields {
            let field_name = self.constant_name(field.name_index)?.to_string();
            let descriptor = self.descriptor(field.descriptor_index)?;
            if descriptor.is_void() {
                return Err(VmError::MalformedDescriptor {
                    descriptor: descriptor.to_string(),
                });
            }
            if fields.iter().any(|f: &RuntimeField| f.name == field_name) {
                return Err(VmError::DuplicateDefinition {
                    kind: "field",
                    name: format!("{}.{}", name, field_name),
                });
            }
            let size = descriptor.field_size();
            fields.push(RuntimeField {
                name: field_name,
                descriptor,
                offset,
            });
            offset += size;
        }

        for &method in &def.methods {
            self.function(method)?;
        }

        if self.class_names.contains_key(&name) {
            return Err(VmError::DuplicateDefinition { kind: "class", name });
        }

        let index = self.classes.len() as u32;
        debug!(
            "class #{} {} ({} fields, {} bytes, {} methods)",
            index,
            name,
            fields.len(),
            offset,
            def.methods.len()
        );

        self.class_names.insert(name.clone(), index);
        self.classes.push(RuntimeClass {
            name,
            methods: def.methods.clone(),
            def,
            fields,
            size: offset,
        });
        Ok(index)
    }

    pub fn class(&self, index: u32) -> Result<&RuntimeClass, VmError> {
        self.classes
            .get(index as usize)
            .ok_or(VmError::IndexOutOfRange {
                pool: "class",
                index,
                size: self.classes.len(),
            })
    }

    pub fn class_by_name(&self, name: &str) -> Option<&RuntimeClass> {
        let index = *self.class_names.get(name)?;
        self.classes.get(index as usize)
    }

    pub fn classes(&self) -> &[RuntimeClass] {
        &self.classes
    }
}

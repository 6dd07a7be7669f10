//! `.ball` reader and linker.
//!
//! A file is parsed completely before anything is registered, then its
//! records are relocated onto the end of the shared [`MethodArea`] and the new
//! functions are verified. Several files (standard library first, program
//! last) can be loaded into one area this way.

use std::path::Path;
use std::rc::Rc;

use log::{debug, info};

use crate::bytecode::constant::{Constant, ConstantTag};
use crate::bytecode::load_error::LoadError;
use crate::bytecode::op::{Instruction, Opcode};
use crate::bytecode::reader::ByteReader;
use crate::bytecode::verify;
use crate::lang::descriptor::{TypeDescriptor, format_list};
use crate::runtime::error::VmError;
use crate::runtime::method_area::{ClassDef, FieldDef, FunctionDef, MethodArea, RuntimeFunction};

pub const BALL_MAGIC: u32 = 0x6261_6C6C;
pub const MAX_MAJOR_VERSION: u8 = 1;
pub const ENTRY_POINT: &str = "Main";

/// Record counts of one loaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSummary {
    pub constants: usize,
    pub functions: usize,
    pub classes: usize,
}

/// A parsed file whose indices are still local to itself.
#[derive(Debug, Default)]
struct BallFile {
    constants: Vec<Constant>,
    functions: Vec<FunctionDef>,
    classes: Vec<ClassDef>,
}

pub struct Loader<'a> {
    area: &'a mut MethodArea,
}

impl<'a> Loader<'a> {
    pub fn new(area: &'a mut MethodArea) -> Self {
        Loader { area }
    }

    /// Load a library file; no entry point is required.
    pub fn load_stdlib(&mut self, path: &Path) -> Result<LoadSummary, LoadError> {
        self.load_file(path)
    }

    /// Load the program file and resolve its entry point.
    pub fn load_program(&mut self, path: &Path) -> Result<Rc<RuntimeFunction>, LoadError> {
        self.load_file(path)?;
        resolve_entry_point(self.area)
    }

    pub fn load_program_bytes(
        &mut self,
        bytes: &[u8],
        origin: &str,
    ) -> Result<Rc<RuntimeFunction>, LoadError> {
        self.load_bytes(bytes, origin)?;
        resolve_entry_point(self.area)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<LoadSummary, LoadError> {
        let origin = path.display().to_string();
        let bytes = std::fs::read(path).map_err(|e| LoadError::new("io", &origin, e.to_string()))?;
        self.load_bytes(&bytes, &origin)
    }

    pub fn load_bytes(&mut self, bytes: &[u8], origin: &str) -> Result<LoadSummary, LoadError> {
        let mut reader = ByteReader::new(bytes);
        read_header(&mut reader, origin)?;
        let file = BallFile {
            constants: read_constants(&mut reader, origin)?,
            functions: read_functions(&mut reader, origin)?,
            classes: read_classes(&mut reader)?,
        };
        if reader.remaining() > 0 {
            debug!("{}: ignoring {} trailing bytes", origin, reader.remaining());
        }

        let summary = self.link(file, origin)?;
        info!(
            "loaded {}: {} constants, {} functions, {} classes",
            origin, summary.constants, summary.functions, summary.classes
        );
        Ok(summary)
    }

    /// Relocate and register a parsed file, then verify its functions.
    fn link(&mut self, file: BallFile, origin: &str) -> Result<LoadSummary, LoadError> {
        let const_base = self.area.constants().len() as u32;
        let fn_base = self.area.functions().len() as u32;
        let summary = LoadSummary {
            constants: file.constants.len(),
            functions: file.functions.len(),
            classes: file.classes.len(),
        };
        debug!(
            "linking {} at constant base {}, function base {}",
            origin, const_base, fn_base
        );

        for constant in file.constants {
            self.area.register_constant(constant);
        }

        for (i, def) in file.functions.into_iter().enumerate() {
            let def = relocate_function(def, const_base, fn_base);
            self.area
                .register_function(def)
                .map_err(|e| LoadError::from_vm("functions", format!("{} function #{}", origin, i), e))?;
        }

        for (i, def) in file.classes.into_iter().enumerate() {
            let def = relocate_class(def, const_base, fn_base);
            self.area
                .register_class(def)
                .map_err(|e| LoadError::from_vm("classes", format!("{} class #{}", origin, i), e))?;
        }

        verify::verify_from(self.area, fn_base as usize)
            .map_err(|e| LoadError::new("verify", origin, e.to_string()))?;

        Ok(summary)
    }
}

/// Look up `Main` and check it takes nothing and returns `void;`.
pub fn resolve_entry_point(area: &MethodArea) -> Result<Rc<RuntimeFunction>, LoadError> {
    let main = area.function_by_name(ENTRY_POINT).ok_or_else(|| {
        LoadError::new(
            "entry",
            ENTRY_POINT,
            format!("no function named `{}` is loaded", ENTRY_POINT),
        )
    })?;

    if !main.params.is_empty() || main.return_type != TypeDescriptor::Void {
        let err = VmError::InvalidEntryPointSignature {
            name: main.name.clone(),
            params: format_list(&main.params),
            returns: main.return_type.to_string(),
        };
        return Err(LoadError::from_vm("entry", ENTRY_POINT, err));
    }

    info!("entry point {}{}", main.name, main.signature());
    Ok(Rc::clone(main))
}

// =============================================================================
// Sections
// =============================================================================

fn read_header(reader: &mut ByteReader, origin: &str) -> Result<(), LoadError> {
    let magic = reader.read_u32()?;
    if magic != BALL_MAGIC {
        return Err(LoadError::new(
            "header",
            origin,
            format!("bad magic 0x{:08x}, expected 0x{:08x}", magic, BALL_MAGIC),
        ));
    }

    let version = reader.read_bytes(3)?;
    if version[0] > MAX_MAJOR_VERSION {
        return Err(LoadError::new(
            "header",
            origin,
            format!(
                "unsupported version {}.{}.{}",
                version[0], version[1], version[2]
            ),
        ));
    }

    let flags = reader.read_u8()?;
    if flags != 0 {
        return Err(LoadError::new(
            "header",
            origin,
            format!("unsupported flags 0x{:02x}", flags),
        ));
    }
    Ok(())
}

fn read_constants(reader: &mut ByteReader, origin: &str) -> Result<Vec<Constant>, LoadError> {
    let count = reader.read_u16()? as usize;
    let mut constants = Vec::with_capacity(count);

    for i in 0..count {
        let byte = reader.read_u8()?;
        let tag = ConstantTag::from_u8(byte).ok_or_else(|| {
            LoadError::new(
                "constants",
                format!("{} constant #{}", origin, i),
                format!("unknown constant tag 0x{:02x}", byte),
            )
        })?;
        let bytes = match tag.fixed_width() {
            Some(width) => reader.read_bytes(width)?,
            None => reader.read_prefixed()?,
        };
        if matches!(tag, ConstantTag::String | ConstantTag::Class) && std::str::from_utf8(bytes).is_err() {
            return Err(LoadError::new(
                "constants",
                format!("{} constant #{}", origin, i),
                "string is not valid UTF-8",
            ));
        }
        constants.push(Constant {
            tag,
            bytes: bytes.to_vec(),
        });
    }
    Ok(constants)
}

fn read_functions(reader: &mut ByteReader, origin: &str) -> Result<Vec<FunctionDef>, LoadError> {
    let count = reader.read_u16()? as usize;
    let mut functions = Vec::with_capacity(count);

    for i in 0..count {
        let name_index = reader.read_u16()? as u32;
        let params_index = reader.read_u16()? as u32;
        let return_index = reader.read_u16()? as u32;
        let max_stack = reader.read_u16()?;
        let locals_count = reader.read_u16()?;

        let len = reader.read_u16()? as usize;
        let mut code = Vec::with_capacity(len);
        for pc in 0..len {
            let raw = reader.read_u16()?;
            let opcode = Opcode::from_u16(raw).ok_or_else(|| {
                LoadError::new(
                    "functions",
                    format!("{} function #{} pc {}", origin, i, pc),
                    format!("unknown opcode 0x{:04x}", raw),
                )
            })?;
            code.push(if opcode.has_operand() {
                Instruction::with_operand(opcode, reader.read_u16()? as u32)
            } else {
                Instruction::new(opcode)
            });
        }

        functions.push(FunctionDef {
            name_index,
            params_index,
            return_index,
            max_stack,
            locals_count,
            code,
        });
    }
    Ok(functions)
}

fn read_classes(reader: &mut ByteReader) -> Result<Vec<ClassDef>, LoadError> {
    let count = reader.read_u16()? as usize;
    let mut classes = Vec::with_capacity(count);

    for _ in 0..count {
        let name_index = reader.read_u16()? as u32;
        let field_count = reader.read_u16()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(FieldDef {
                name_index: reader.read_u16()? as u32,
                descriptor_index: reader.read_u16()? as u32,
            });
        }
        let method_count = reader.read_u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            methods.push(reader.read_u16()? as u32);
        }
        classes.push(ClassDef {
            name_index,
            fields,
            methods,
        });
    }
    Ok(classes)
}

// =============================================================================
// Relocation
// =============================================================================

fn relocate_function(mut def: FunctionDef, const_base: u32, fn_base: u32) -> FunctionDef {
    def.name_index += const_base;
    def.params_index += const_base;
    def.return_index += const_base;
    for instr in &mut def.code {
        let base = match instr.opcode {
            Opcode::Ldc | Opcode::NewArr | Opcode::Halt => const_base,
            Opcode::Call => fn_base,
            _ => continue,
        };
        if let Some(operand) = instr.operand.as_mut() {
            *operand += base;
        }
    }
    def
}

fn relocate_class(mut def: ClassDef, const_base: u32, fn_base: u32) -> ClassDef {
    def.name_index += const_base;
    for field in &mut def.fields {
        field.name_index += const_base;
        field.descriptor_index += const_base;
    }
    for method in &mut def.methods {
        *method += fn_base;
    }
    def
}

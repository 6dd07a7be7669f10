//! In-memory `.ball` construction for tests.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use crate::bytecode::constant::{Constant, ConstantTag};
use crate::bytecode::loader::BALL_MAGIC;
use crate::bytecode::op::{Instruction, Opcode};
use crate::lang::descriptor::TypeDescriptor;
use crate::runtime::jit::JitState;
use crate::runtime::method_area::{ClassDef, FieldDef, FunctionDef, MethodArea, RuntimeFunction};

pub fn ins(opcode: Opcode) -> Instruction {
    Instruction::new(opcode)
}

pub fn arg(opcode: Opcode, operand: u32) -> Instruction {
    Instruction::with_operand(opcode, operand)
}

/// A void, parameterless function that is not registered anywhere.
pub fn function(name: &str, locals: u16, code: Vec<Instruction>) -> Rc<RuntimeFunction> {
    Rc::new(RuntimeFunction {
        name: name.to_string(),
        def: FunctionDef {
            name_index: 0,
            params_index: 0,
            return_index: 0,
            max_stack: 0,
            locals_count: locals,
            code,
        },
        params: vec![],
        return_type: TypeDescriptor::Void,
        jit: JitState::default(),
    })
}

/// Builds a program either as `.ball` bytes or directly as a method area.
/// Equal constants are pooled once.
#[derive(Debug, Clone)]
pub struct BallBuilder {
    pub magic: u32,
    pub version: [u8; 3],
    pub flags: u8,
    pub constants: Vec<Constant>,
    pub functions: Vec<FunctionDef>,
    pub classes: Vec<ClassDef>,
}

impl Default for BallBuilder {
    fn default() -> Self {
        BallBuilder {
            magic: BALL_MAGIC,
            version: [0, 0, 0],
            flags: 0,
            constants: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
        }
    }
}

impl BallBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(&mut self, constant: Constant) -> u32 {
        if let Some(i) = self.constants.iter().position(|c| *c == constant) {
            return i as u32;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    pub fn string(&mut self, s: &str) -> u32 {
        self.constant(Constant::string(s))
    }

    pub fn int(&mut self, n: i32) -> u32 {
        self.constant(Constant::i32(n))
    }

    pub fn function(
        &mut self,
        name: &str,
        params: &str,
        ret: &str,
        locals: u16,
        code: Vec<Instruction>,
    ) -> u32 {
        let def = FunctionDef {
            name_index: self.string(name),
            params_index: self.string(params),
            return_index: self.string(ret),
            max_stack: 0,
            locals_count: locals,
            code,
        };
        self.functions.push(def);
        (self.functions.len() - 1) as u32
    }

    pub fn class(&mut self, name: &str, fields: &[(&str, &str)], methods: Vec<u32>) -> u32 {
        let name_index = self.string(name);
        let fields = fields
            .iter()
            .map(|(field, desc)| FieldDef {
                name_index: self.string(field),
                descriptor_index: self.string(desc),
            })
            .collect();
        self.classes.push(ClassDef {
            name_index,
            fields,
            methods,
        });
        (self.classes.len() - 1) as u32
    }

    /// Register everything straight into a fresh method area.
    pub fn to_area(&self) -> MethodArea {
        let mut area = MethodArea::new();
        for c in &self.constants {
            area.register_constant(c.clone());
        }
        for f in &self.functions {
            area.register_function(f.clone()).expect("test function registers");
        }
        for c in &self.classes {
            area.register_class(c.clone()).expect("test class registers");
        }
        area
    }

    /// Serialize to the `.ball` wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(self.magic.to_be_bytes());
        out.extend(self.version);
        out.push(self.flags);

        put_u16(&mut out, self.constants.len());
        for c in &self.constants {
            out.push(c.tag as u8);
            if matches!(c.tag, ConstantTag::String | ConstantTag::Class) {
                put_u16(&mut out, c.bytes.len());
            }
            out.extend(&c.bytes);
        }

        put_u16(&mut out, self.functions.len());
        for f in &self.functions {
            for field in [f.name_index, f.params_index, f.return_index] {
                put_u16(&mut out, field as usize);
            }
            put_u16(&mut out, f.max_stack as usize);
            put_u16(&mut out, f.locals_count as usize);
            put_u16(&mut out, f.code.len());
            for instr in &f.code {
                put_u16(&mut out, instr.opcode.code() as usize);
                if let Some(operand) = instr.operand {
                    put_u16(&mut out, operand as usize);
                }
            }
        }

        put_u16(&mut out, self.classes.len());
        for c in &self.classes {
            put_u16(&mut out, c.name_index as usize);
            put_u16(&mut out, c.fields.len());
            for field in &c.fields {
                put_u16(&mut out, field.name_index as usize);
                put_u16(&mut out, field.descriptor_index as usize);
            }
            put_u16(&mut out, c.methods.len());
            for m in &c.methods {
                put_u16(&mut out, *m as usize);
            }
        }

        out
    }
}

fn put_u16(out: &mut Vec<u8>, n: usize) {
    out.extend((n as u16).to_be_bytes());
}

/// Cloneable writer whose contents can be read back after the VM is done.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Reference programs
// =============================================================================

/// `a = 2; b = 3; res = a + b; print res` → `5`
pub fn simple_ball() -> BallBuilder {
    let mut b = BallBuilder::new();
    let two = b.int(2);
    let three = b.int(3);
    b.function(
        "Main",
        "",
        "void;",
        3,
        vec![
            arg(Opcode::Ldc, two),
            arg(Opcode::Store, 0),
            arg(Opcode::Ldc, three),
            arg(Opcode::Store, 1),
            arg(Opcode::Ldv, 0),
            arg(Opcode::Ldv, 1),
            ins(Opcode::Add),
            arg(Opcode::Store, 2),
            arg(Opcode::Ldv, 2),
            ins(Opcode::Print),
            ins(Opcode::Ret),
        ],
    );
    b
}

/// Five-element int array with computed writes, every element printed →
/// `-1212-1`
pub fn array_ball() -> BallBuilder {
    use Opcode::*;

    let mut b = BallBuilder::new();
    let five = b.int(5);
    let elem = b.string("I;");
    let [i0, m1, i1, i2, i3, i4] = [0, -1, 1, 2, 3, 4].map(|n| b.int(n));

    let load = |index: u32| vec![arg(Ldv, 1), arg(Ldc, index), ins(LdElem)];

    let mut code = vec![
        arg(Ldc, five),
        arg(Store, 0),
        arg(Ldv, 0),
        arg(NewArr, elem),
        arg(Store, 1),
        // arr[0] = -1
        arg(Ldv, 1),
        arg(Ldc, i0),
        arg(Ldc, m1),
        ins(StElem),
        // arr[1] = 2
        arg(Ldv, 1),
        arg(Ldc, i1),
        arg(Ldc, i2),
        ins(StElem),
        // arr[2] = arr[0] + arr[1]
        arg(Ldv, 1),
        arg(Ldc, i2),
    ];
    code.extend(load(i0));
    code.extend(load(i1));
    code.extend([ins(Add), ins(StElem)]);

    // arr[3] = -(arr[0] * arr[1])
    code.extend([arg(Ldv, 1), arg(Ldc, i3)]);
    code.extend(load(i0));
    code.extend(load(i1));
    code.extend([ins(Mul), ins(Min), ins(StElem)]);

    // arr[4] = arr[0] * (arr[1] + arr[2]) + arr[3]
    code.extend([arg(Ldv, 1), arg(Ldc, i4)]);
    code.extend(load(i0));
    code.extend(load(i1));
    code.extend(load(i2));
    code.extend([ins(Add), ins(Mul)]);
    code.extend(load(i3));
    code.extend([ins(Add), ins(StElem)]);

    for index in [i0, i1, i2, i3, i4] {
        code.extend(load(index));
        code.push(ins(Print));
    }
    code.push(ins(Ret));

    b.function("Main", "", "void;", 2, code);
    b
}

/// `Sum(a, b)` called from `Main` with 1 and 2, result printed → `3`
pub fn function_ball() -> BallBuilder {
    use Opcode::*;

    let mut b = BallBuilder::new();
    let sum = b.function(
        "Sum",
        "I;I;",
        "I;",
        2,
        vec![arg(Store, 0), arg(Store, 1), arg(Ldv, 0), arg(Ldv, 1), ins(Add), ins(Ret)],
    );
    let one = b.int(1);
    let two = b.int(2);
    b.function(
        "Main",
        "",
        "void;",
        3,
        vec![
            arg(Ldc, one),
            arg(Store, 0),
            arg(Ldc, two),
            arg(Store, 1),
            arg(Ldv, 0),
            arg(Ldv, 1),
            arg(Call, sum),
            arg(Store, 2),
            arg(Ldv, 2),
            ins(Print),
            ins(Ret),
        ],
    );
    b
}

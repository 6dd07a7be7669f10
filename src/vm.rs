use log::info;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use crate::bytecode::disasm;
use crate::bytecode::image;
use crate::bytecode::load_error::LoadError;
use crate::bytecode::loader::{self, LoadSummary, Loader};
use crate::error::Error;
use crate::runtime::data_area::RuntimeDataArea;
use crate::runtime::interpreter::{Interpreter, Outcome, VmConfig};
use crate::runtime::method_area::RuntimeFunction;

/// Loader, runtime data areas and interpreter behind one handle.
pub struct VirtualMachine {
    data: RuntimeDataArea,
    interpreter: Interpreter,
    entry: Option<Rc<RuntimeFunction>>,
}

impl VirtualMachine {
    pub fn new(config: VmConfig) -> Self {
        VirtualMachine {
            data: RuntimeDataArea::new(config.max_heap_bytes, config.gc_enabled),
            interpreter: Interpreter::new(config),
            entry: None,
        }
    }

    pub fn with_output(mut self, output: impl Write + 'static) -> Self {
        self.interpreter = self.interpreter.with_output(output);
        self
    }

    pub fn data(&self) -> &RuntimeDataArea {
        &self.data
    }

    pub fn entry(&self) -> Option<&Rc<RuntimeFunction>> {
        self.entry.as_ref()
    }

    // Loading

    pub fn load_stdlib(&mut self, path: &Path) -> Result<LoadSummary, Error> {
        Ok(Loader::new(&mut self.data.method_area).load_stdlib(path)?)
    }

    pub fn load_stdlib_bytes(&mut self, bytes: &[u8], origin: &str) -> Result<LoadSummary, Error> {
        Ok(Loader::new(&mut self.data.method_area).load_bytes(bytes, origin)?)
    }

    pub fn load_program(&mut self, path: &Path) -> Result<(), Error> {
        let entry = Loader::new(&mut self.data.method_area).load_program(path)?;
        self.entry = Some(entry);
        Ok(())
    }

    pub fn load_program_bytes(&mut self, bytes: &[u8], origin: &str) -> Result<(), Error> {
        let entry = Loader::new(&mut self.data.method_area).load_program_bytes(bytes, origin)?;
        self.entry = Some(entry);
        Ok(())
    }

    /// Replace the (empty) method area with a saved image and resolve `Main`.
    pub fn load_image(&mut self, bytes: &[u8], origin: &str) -> Result<(), Error> {
        if !self.data.method_area.functions().is_empty() {
            return Err(LoadError::new("image", origin, "an image must be loaded into an empty VM").into());
        }
        self.data.method_area = image::load_image(bytes)?;
        self.entry = Some(loader::resolve_entry_point(&self.data.method_area)?);
        Ok(())
    }

    pub fn load_image_file(&mut self, path: &Path) -> Result<(), Error> {
        let bytes = std::fs::read(path)?;
        self.load_image(&bytes, &path.display().to_string())
    }

    pub fn save_image(&self) -> Result<Vec<u8>, Error> {
        Ok(image::save_image(&self.data.method_area)?)
    }

    // Inspection

    pub fn disassemble(&self) -> String {
        disasm::disassemble(&self.data.method_area)
    }

    pub fn statistics(&self) -> String {
        disasm::statistics(&self.data.method_area)
    }

    // Execution

    pub fn run(&mut self) -> Result<Outcome, Error> {
        let entry = self.entry.clone().ok_or_else(|| {
            LoadError::new("entry", loader::ENTRY_POINT, "no program has been loaded")
        })?;
        info!("running {}", entry.name);
        Ok(self.interpreter.run(&mut self.data, entry)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Opcode::*;
    use crate::bytecode::test_support::{BallBuilder, SharedBuffer, arg, function_ball, ins};
    use crate::runtime::error::VmError;

    /// A machine whose output goes to the returned buffer.
    fn machine(config: VmConfig) -> (VirtualMachine, SharedBuffer) {
        let buffer = SharedBuffer::new();
        let vm = VirtualMachine::new(config).with_output(buffer.clone());
        (vm, buffer)
    }

    fn library() -> BallBuilder {
        let mut b = BallBuilder::new();
        let forty_two = b.int(42);
        b.function("Answer", "", "I;", 0, vec![arg(Ldc, forty_two), ins(Ret)]);
        b
    }

    #[test]
    fn test_load_and_run_bytes() {
        let (mut vm, out) = machine(VmConfig::default());
        vm.load_program_bytes(&function_ball().to_bytes(), "sum.ball").unwrap();

        assert_eq!(vm.run().unwrap(), Outcome::Returned);
        assert_eq!(out.contents(), "3");
        assert!(vm.data().call_stack.is_empty());
    }

    #[test]
    fn test_stdlib_then_program() {
        let (mut vm, out) = machine(VmConfig::default());
        let summary = vm.load_stdlib_bytes(&library().to_bytes(), "std.ball").unwrap();
        assert_eq!(summary.functions, 1);
        vm.load_program_bytes(&function_ball().to_bytes(), "sum.ball").unwrap();

        assert_eq!(vm.data().method_area.functions().len(), 3);
        assert_eq!(vm.entry().unwrap().name, "Main");
        vm.run().unwrap();
        assert_eq!(out.contents(), "3");
    }

    #[test]
    fn test_program_name_clash_with_stdlib() {
        let (mut vm, _) = machine(VmConfig::default());
        vm.load_stdlib_bytes(&function_ball().to_bytes(), "std.ball").unwrap();
        let err = vm.load_program_bytes(&function_ball().to_bytes(), "sum.ball").unwrap_err();
        assert!(err.to_string().contains("duplicate definition of function `Sum`"), "{}", err);
    }

    #[test]
    fn test_run_without_program() {
        let (mut vm, _) = machine(VmConfig::default());
        let err = vm.run().unwrap_err();
        assert!(matches!(err, Error::Load(ref e) if e.stage == "entry"));
    }

    #[test]
    fn test_unverifiable_code_rejected_on_both_paths() {
        let mut b = BallBuilder::new();
        let one = b.int(1);
        b.function("Main", "", "void;", 0, vec![arg(Ldc, one), ins(Add), ins(Ret)]);
        let (mut vm, _) = machine(VmConfig::default());
        vm.load_program_bytes(&b.to_bytes(), "bad.ball").unwrap_err();

        // unverified code only reaches the interpreter through an image
        let (mut vm, _) = machine(VmConfig::default());
        let image = image::save_image(&b.to_area()).unwrap();
        let err = vm.load_image(&image, "bad.bimg").unwrap_err();
        assert!(matches!(err, Error::Image(_)));
    }

    #[test]
    fn test_image_round_trip_runs() {
        let (mut first, _) = machine(VmConfig::default());
        first.load_program_bytes(&function_ball().to_bytes(), "sum.ball").unwrap();
        let image = first.save_image().unwrap();

        let (mut second, out) = machine(VmConfig::default());
        second.load_image(&image, "sum.bimg").unwrap();
        assert_eq!(second.run().unwrap(), Outcome::Returned);
        assert_eq!(out.contents(), "3");
        assert_eq!(second.disassemble(), first.disassemble());
    }

    #[test]
    fn test_image_needs_empty_machine() {
        let (mut vm, _) = machine(VmConfig::default());
        vm.load_stdlib_bytes(&library().to_bytes(), "std.ball").unwrap();
        let image = vm.save_image().unwrap();
        let err = vm.load_image(&image, "again.bimg").unwrap_err();
        assert!(err.to_string().contains("empty VM"));
    }

    #[test]
    fn test_halt_outcome() {
        let mut b = BallBuilder::new();
        let three = b.int(3);
        b.function("Main", "", "void;", 0, vec![arg(Halt, three)]);
        let (mut vm, _) = machine(VmConfig::default());
        vm.load_program_bytes(&b.to_bytes(), "halt.ball").unwrap();
        assert_eq!(vm.run().unwrap(), Outcome::Halted(3));
    }

    #[test]
    fn test_division_by_zero_reports_frames() {
        let mut b = BallBuilder::new();
        let one = b.int(1);
        let zero = b.int(0);
        b.function("Main", "", "void;", 0, vec![arg(Ldc, one), arg(Ldc, zero), ins(Div), ins(Print), ins(Ret)]);
        let (mut vm, _) = machine(VmConfig::default());
        vm.load_program_bytes(&b.to_bytes(), "div.ball").unwrap();

        match vm.run() {
            Err(Error::Runtime(e)) => {
                assert_eq!(e.kind, VmError::DivisionByZero);
                assert_eq!(e.call_stack, vec!["Main@3"]);
            }
            other => panic!("expected a runtime error, got {:?}", other.map(|_| ())),
        }
    }
}

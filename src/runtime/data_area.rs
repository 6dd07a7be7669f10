use crate::runtime::call_stack::CallStack;
use crate::runtime::heap::Heap;
use crate::runtime::method_area::MethodArea;

/// Everything a running program touches, passed explicitly to the loader and
/// the interpreter.
#[derive(Debug)]
pub struct RuntimeDataArea {
    pub method_area: MethodArea,
    pub heap: Heap,
    pub call_stack: CallStack,
}

impl RuntimeDataArea {
    pub fn new(max_heap_bytes: usize, gc_enabled: bool) -> Self {
        RuntimeDataArea {
            method_area: MethodArea::new(),
            heap: Heap::new(max_heap_bytes, gc_enabled),
            call_stack: CallStack::new(),
        }
    }

    pub fn with_method_area(method_area: MethodArea, max_heap_bytes: usize, gc_enabled: bool) -> Self {
        RuntimeDataArea {
            method_area,
            heap: Heap::new(max_heap_bytes, gc_enabled),
            call_stack: CallStack::new(),
        }
    }
}

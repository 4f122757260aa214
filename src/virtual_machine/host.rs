//! The engine side of the call boundary.
//!
//! The interpreter never owns object lifetime or class metadata; it reaches
//! both through a [`Host`], which also receives the write-barrier
//! notifications and abort diagnostics.

use crate::error;
use crate::virtual_machine::errors::ScriptAbort;
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::value::{ClassId, NameTable, ObjectRef};

pub trait Host {
    fn heap(&self) -> &Heap;

    fn heap_mut(&mut self) -> &mut Heap;

    fn names(&self) -> &NameTable;

    fn names_mut(&mut self) -> &mut NameTable;

    /// Called once for every managed-pointer store, including stores of null.
    fn write_barrier(&mut self, stored: Option<ObjectRef>);

    /// `IsKindOf`: the object's runtime class is `class` or derives from it.
    fn is_kind_of(&self, obj: ObjectRef, class: ClassId) -> bool {
        self.heap().is_kind_of(obj, class)
    }

    /// `IsDescendantOf` between two class descriptors.
    fn is_descendant_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        self.heap().classes.is_descendant_of(class, ancestor)
    }

    /// Diagnostic sink for aborts that reach the top-level caller.
    fn report(&mut self, abort: &ScriptAbort) {
        error!("script abort: {}", abort);
    }
}

/// Self-contained host for tools and tests.
///
/// Counts barrier notifications and keeps reported diagnostics in memory in
/// addition to logging them.
#[derive(Default)]
pub struct StandaloneHost {
    pub heap: Heap,
    pub names: NameTable,
    pub barriers: usize,
    pub reports: Vec<String>,
}

impl StandaloneHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for StandaloneHost {
    fn heap(&self) -> &Heap {
        &self.heap
    }

    fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    fn names(&self) -> &NameTable {
        &self.names
    }

    fn names_mut(&mut self) -> &mut NameTable {
        &mut self.names
    }

    fn write_barrier(&mut self, _stored: Option<ObjectRef>) {
        self.barriers += 1;
    }

    fn report(&mut self, abort: &ScriptAbort) {
        error!("script abort: {}", abort);
        self.reports.push(abort.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::errors::AbortKind;

    #[test]
    fn default_hooks_use_the_heap() {
        let mut host = StandaloneHost::new();
        let base = host.heap.classes.define("Base", None, 0, vec![]);
        let derived = host.heap.classes.define("Derived", Some(base), 0, vec![]);
        let obj = host.heap.new_object(derived).unwrap();
        assert!(host.is_kind_of(obj, base));
        assert!(host.is_descendant_of(derived, base));
        assert!(!host.is_descendant_of(base, derived));
    }

    #[test]
    fn standalone_host_records_reports_and_barriers() {
        let mut host = StandaloneHost::new();
        host.write_barrier(None);
        host.write_barrier(None);
        host.report(&ScriptAbort::new(AbortKind::ReadNil));
        assert_eq!(host.barriers, 2);
        assert_eq!(host.reports, vec!["read from nil".to_string()]);
    }
}

//! Staged heap construction: set options first, then build. Mirrors the
//! embedding sequence: create a builder, process configuration, hand the
//! binding over, get back the one heap the VM will ever own.

use std::sync::Arc;

use crate::heap::Heap;
use crate::util::options::Options;
use crate::vm::VirtualMachine;

pub struct HeapBuilder {
    options: Options,
}

impl HeapBuilder {
    /// A builder with defaults and any `VMGC_`-prefixed environment
    /// overrides already applied.
    pub fn new() -> Self {
        HeapBuilder {
            options: Options::default(),
        }
    }

    /// Set an option by name, as from a command line. Returns false if the
    /// value fails to parse or validate (the old value is kept).
    pub fn set_option(&mut self, name: &str, value: &str) -> bool {
        self.options.set_from_str(name, value)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// Build the heap: spawn the marker pool and the collector thread,
    /// install the core marking constraints, and hand back the orchestrator.
    ///
    /// Attempts to initialize the built-in logger; if the embedder installed
    /// its own first, that one wins.
    pub fn build<VM: VirtualMachine>(self, vm: VM) -> Arc<Heap<VM>> {
        match crate::util::logger::try_init() {
            Ok(_) => debug!("vmgc initialized the logger"),
            Err(_) => debug!("logger already initialized by the embedder"),
        }
        info!(
            "vmgc {} ({}) starting: {} marker threads",
            crate::build_info::PKG_VERSION,
            *crate::build_info::GIT_VERSION,
            self.options.marker_threads
        );
        Heap::build(vm, self.options)
    }
}

impl Default for HeapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

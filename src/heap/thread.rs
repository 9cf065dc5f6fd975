//! The dedicated collector thread. It sleeps whenever it lacks the conn or
//! there is no work, and it exists so collection makes progress when no
//! mutator thread is available to drive: a mutator that holds heap access
//! always drives instead, via conn handoff.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::heap::phases::Conductor;
use crate::heap::Heap;
use crate::vm::VirtualMachine;

struct CollectorThreadState {
    handle: Option<JoinHandle<()>>,
    shutdown: bool,
}

pub(crate) struct CollectorThread {
    state: Mutex<CollectorThreadState>,
    wake: Condvar,
}

impl CollectorThread {
    pub fn new() -> Self {
        CollectorThread {
            state: Mutex::new(CollectorThreadState {
                handle: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Spawn the thread. Called once, right after the heap lands in its
    /// `Arc`; the thread parks immediately.
    pub fn start<VM: VirtualMachine>(&self, heap: Arc<Heap<VM>>) {
        let handle = std::thread::Builder::new()
            .name("vmgc-collector".to_string())
            .spawn(move || run_collector(heap))
            .expect("failed to spawn the collector thread");
        let mut state = self.state.lock().unwrap();
        assert!(state.handle.is_none(), "collector thread started twice");
        state.handle = Some(handle);
    }

    /// There may be work (or a donated conn); wake the thread to look.
    pub fn notify(&self) {
        let _state = self.state.lock().unwrap();
        self.wake.notify_all();
    }

    /// Ask the thread to exit and join it. Idempotent.
    pub fn request_shutdown_and_join(&self) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            self.wake.notify_all();
            state.handle.take()
        };
        if let Some(handle) = handle {
            handle.join().expect("collector thread panicked");
        }
    }
}

fn run_collector<VM: VirtualMachine>(heap: Arc<Heap<VM>>) {
    debug!("collector thread up");
    loop {
        {
            let mut state = heap.collector_thread.state.lock().unwrap();
            loop {
                if state.shutdown {
                    debug!("collector thread exiting");
                    return;
                }
                if !heap.global.world.mutator_has_conn() && heap.has_collector_work() {
                    break;
                }
                state = heap.collector_thread.wake.wait(state).unwrap();
            }
        }
        heap.run_conn_loop(Conductor::Collector);
    }
}

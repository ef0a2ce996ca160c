//! Execution engine: the collector that owns every heap object, the
//! dispatch loop, and the host functions bound at startup.

pub mod heap;
pub mod natives;
pub mod runtime_error;
pub mod vm;

pub use heap::{Collector, GcConfig, RootSet};
pub use runtime_error::{RuntimeError, RuntimeErrorKind};
pub use vm::{RuntimeResult, Vm, VmConfig, vm_execute};

//! Process-wide registry: live environments, debug sink, runtime flags
//!
//! One lazily-initialized registry, guarded by its own mutex, holds the
//! process-wide state the engine needs across environments: the set of open
//! environment paths (a second open of the same files would bypass the
//! in-process writer mutex and break the single-writer rule), the installed
//! debug/assert sink invoked on integrity failures, and the runtime feature
//! flags. Closing the last environment tears all of it down: the sink is
//! uninstalled and the flags reset, so a process that reopens later starts
//! from a clean slate. The flag cell is an atomic so hot read paths can
//! consult it without taking the registry mutex; every mutation still goes
//! through the guarded registry.

use crate::error::{Error, Result};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

/// Hook receiving engine diagnostics (integrity failures, broken-env marks)
pub type DebugSink = fn(level: tracing::Level, module: &str, message: &str);

bitflags! {
    /// Process-wide runtime feature flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RuntimeFlags: u32 {
        /// Verify the stored pgno of every mapped page on read
        const PARANOID_READS = 0x01;
        /// Emit per-pass detail from GC convergence and reclamation
        const GC_TRACE = 0x02;
    }
}

struct Registry {
    live: HashSet<PathBuf>,
    debug_sink: Option<DebugSink>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

// mirrored out of the registry so readers skip the mutex; mutations go
// through the guarded paths below
static RUNTIME_FLAGS: AtomicU32 = AtomicU32::new(0);

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| Mutex::new(Registry { live: HashSet::new(), debug_sink: None }))
}

/// Register a live environment; fails if the path is already open
pub fn register(path: PathBuf) -> Result<()> {
    let mut reg = registry().lock();
    if !reg.live.insert(path) {
        return Err(Error::Busy);
    }
    Ok(())
}

/// Unregister on environment close; the last close tears the registry down
pub fn unregister(path: &PathBuf) {
    let mut reg = registry().lock();
    reg.live.remove(path);
    if reg.live.is_empty() {
        teardown(&mut reg);
    }
}

fn teardown(reg: &mut Registry) {
    reg.debug_sink = None;
    RUNTIME_FLAGS.store(0, Ordering::Release);
}

/// Number of live environments in this process
pub fn live_count() -> usize {
    registry().lock().live.len()
}

/// Install (or clear) the process-wide debug sink
pub fn set_debug_sink(sink: Option<DebugSink>) {
    registry().lock().debug_sink = sink;
}

/// Hand a diagnostic to the installed sink, if any
pub(crate) fn debug_emit(level: tracing::Level, module: &str, message: &str) {
    let sink = registry().lock().debug_sink;
    if let Some(sink) = sink {
        sink(level, module, message);
    }
}

/// Replace the runtime feature flags
pub fn set_runtime_flags(flags: RuntimeFlags) {
    let _guard = registry().lock();
    RUNTIME_FLAGS.store(flags.bits(), Ordering::Release);
}

/// Current runtime feature flags
pub fn runtime_flags() -> RuntimeFlags {
    RuntimeFlags::from_bits_truncate(RUNTIME_FLAGS.load(Ordering::Acquire))
}

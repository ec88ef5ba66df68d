//! Process-wide runtime lifecycle: `init`/`destroy`, thread-count control.
//!
//! Mirrors the spec's PMPack global state — a single process-wide backend
//! selection and thread count, initialized once before any forward pass and
//! torn down once at shutdown. Inference APIs assume it is live; calling
//! them before `init()` is a fatal programmer error.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::device_utils::Backend;

struct RuntimeState {
    backend: Backend,
    num_threads: AtomicUsize,
}

static RUNTIME: OnceLock<RuntimeState> = OnceLock::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Detect CPU features, select a GEMM backend, and bring up process-wide
/// state. Safe to call more than once; later calls are no-ops.
pub fn init() {
    RUNTIME.get_or_init(|| {
        let backend = Backend::detect();
        tracing::info!(?backend, "llmpp_rt runtime initialized");
        RuntimeState {
            backend,
            num_threads: AtomicUsize::new(num_cpus_fallback()),
        }
    });
    INITIALIZED.store(true, Ordering::SeqCst);
}

/// Release process-wide state. After this call, `backend()`/`num_threads()`
/// panic again until `init()` is called again (the state itself is not
/// actually freed — `OnceLock` has no reset — but the live flag is cleared
/// so misuse is caught).
pub fn destroy() {
    INITIALIZED.store(false, Ordering::SeqCst);
    tracing::info!("llmpp_rt runtime destroyed");
}

fn state() -> &'static RuntimeState {
    assert!(
        INITIALIZED.load(Ordering::SeqCst),
        "llmpp_rt runtime used before init() (or after destroy())"
    );
    RUNTIME.get().expect("init() must run before state() is read")
}

/// Selected GEMM backend for this process.
pub fn backend() -> Backend {
    state().backend
}

/// Set the number of worker threads used by the GEMM driver's loop-4
/// parallel fan-out. Clamped to at least 1.
pub fn set_num_threads(n: usize) {
    state().num_threads.store(n.max(1), Ordering::SeqCst);
}

/// Current worker-thread count for the GEMM driver.
pub fn get_num_threads() -> usize {
    state().num_threads.load(Ordering::SeqCst)
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both tests touch the same process-wide statics, so they run as one
    // test function to avoid interleaving with `cargo test`'s default
    // multi-threaded runner.
    #[test]
    fn lifecycle_and_thread_count() {
        init();
        set_num_threads(4);
        assert_eq!(get_num_threads(), 4);
        set_num_threads(0);
        assert_eq!(get_num_threads(), 1, "thread count clamps to at least 1");

        destroy();
        let result = std::panic::catch_unwind(backend);
        assert!(result.is_err(), "state used after destroy() should panic");
        init();
    }
}

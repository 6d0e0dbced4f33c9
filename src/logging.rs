//! Logging utilities for the bridge
//!
//! Lightweight structured logging for binding, trampoline synthesis,
//! arena growth, and invocation. Uses `tracing` with minimal overhead.

pub use tracing::{debug, error, info, trace, warn, Level};

/// Initialize bridge logging with sensible defaults
///
/// For production builds, logs at INFO level and above are enabled.
/// For debug builds, DEBUG and TRACE levels are also enabled.
/// Idempotent: a second call is a no-op if a subscriber is already set.
pub fn init_bridge_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            EnvFilter::new("swiftcall=debug")
        }
        #[cfg(not(debug_assertions))]
        {
            EnvFilter::new("swiftcall=info")
        }
    });

    fmt().with_env_filter(filter).compact().try_init().ok();
}

/// Log a freshly mapped executable page
#[inline]
pub fn log_page_mapped(ptr: *const u8, len: usize) {
    debug!(
        target: "arena",
        ptr = ?ptr,
        len,
        "mapped executable page"
    );
}

/// Log a slot handed out by the arena
#[inline]
pub fn log_slot_allocated(size: usize, ptr: *const u8) {
    trace!(
        target: "arena",
        size,
        ptr = ?ptr,
        "allocated code slot"
    );
}

/// Log a synthesized trampoline
#[inline]
pub fn log_trampoline_synthesized(target: usize, entry: usize, len: usize, throws: bool) {
    debug!(
        target: "trampoline",
        fn_address = target,
        entry,
        len,
        throws,
        "trampoline synthesized"
    );
}

/// Log a completed bind
#[inline]
pub fn log_bound(target: usize, entry: usize, argument_words: usize, throws: bool) {
    info!(
        target: "bind",
        fn_address = target,
        entry,
        argument_words,
        throws,
        "function bound"
    );
}

/// Log an invocation through a binding
#[inline]
pub fn log_invoked(entry: usize, args_count: usize) {
    trace!(
        target: "call",
        entry,
        args_count,
        "invoking trampoline"
    );
}

/// Log a loaded module
#[inline]
pub fn log_library_loaded(name: &str) {
    debug!(
        target: "library",
        name,
        "library loaded"
    );
}

/// Log a resolved symbol
#[inline]
pub fn log_symbol_resolved(module: &str, symbol: &str, address: usize) {
    trace!(
        target: "library",
        module,
        symbol,
        address,
        "symbol resolved"
    );
}

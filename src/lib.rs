//! swiftcall - dynamic calling-convention bridge for Swift on AArch64
//!
//! Lets Rust code invoke functions that follow the Swift calling
//! convention by synthesizing small trampolines into executable memory
//! and marshaling typed values into flat register words.
//!
//! Architecture:
//! - `types` - type descriptors, layouts, and buffer-backed values
//! - `abi` - register/indirect classification and word-shape flattening
//! - `marshal` - typed buffers ⇄ flat 64-bit words
//! - `arena` - page-granular executable memory, bump-allocated
//! - `trampoline` - AArch64 stub synthesis (x20 context, x21 error, x8
//!   indirect result, tail branch)
//! - `call` - per-function binding and the invocation shim
//! - `library` - module loading and memoized symbol resolution

pub mod abi;
pub mod arena;
pub mod call;
pub mod library;
pub mod logging;
pub mod marshal;
pub mod trampoline;
pub mod types;

pub use abi::{classify, NativeReturn, PassingMode, WordShape};
pub use call::{bind, bind_symbol, BindError, CallError, CallOutcome, Callable};
pub use library::{ensure_initialized, find_address, Library, LoadError, ResolveError, SymbolError};
pub use trampoline::Trampoline;
pub use types::{Layout, SwiftType, TypeKind, Value};

/// Initialize the bridge's ambient state (logging)
///
/// Optional and idempotent; binding works without it.
pub fn init() {
    logging::init_bridge_logging();
}

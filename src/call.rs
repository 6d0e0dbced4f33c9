//! Call adapter - binding Swift functions and invoking them
//!
//! Binding classifies the signature once, synthesizes the trampoline, and
//! returns a [`Callable`] that marshals typed values in and out on every
//! invocation.

use core::ffi::c_void;
use core::fmt;

use crate::abi::{self, classify, NativeReturn, PassingMode, WordShape, MAX_ARGUMENT_WORDS, MAX_RETURN_WORDS};
use crate::arena::{self, ArenaError};
use crate::library;
use crate::logging;
use crate::marshal;
use crate::trampoline::{self, Trampoline};
use crate::types::{SwiftType, TypeKind, Value};

/// Errors raised at bind time, never mid-call
#[derive(Debug)]
pub enum BindError {
    /// The symbol could not be located in the named module
    SymbolNotFound { module: String, symbol: String },
    /// The module itself could not be loaded or initialized
    ModuleNotLoaded { module: String, reason: String },
    /// An indirect-result buffer was requested for a shim whose declared
    /// return is not a single pointer word
    IndirectResultRequiresPointer,
    /// The flattened argument list exceeds the register budget
    TooManyArgumentWords { words: usize },
    /// The arena could not prepare an executable slot
    Arena(ArenaError),
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SymbolNotFound { module, symbol } => {
                write!(f, "symbol `{}` not found in `{}`", symbol, module)
            }
            Self::ModuleNotLoaded { module, reason } => {
                write!(f, "module `{}` not loaded: {}", module, reason)
            }
            Self::IndirectResultRequiresPointer => {
                write!(f, "indirect results require a pointer return")
            }
            Self::TooManyArgumentWords { words } => {
                write!(
                    f,
                    "flattened arguments need {} register words, at most {} available",
                    words, MAX_ARGUMENT_WORDS
                )
            }
            Self::Arena(err) => write!(f, "executable arena failure: {}", err),
        }
    }
}

impl std::error::Error for BindError {}

impl From<ArenaError> for BindError {
    fn from(err: ArenaError) -> Self {
        Self::Arena(err)
    }
}

/// Invocation errors
#[derive(Debug)]
pub enum CallError {
    /// Trampolines only execute on AArch64 hosts
    UnsupportedArchitecture,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedArchitecture => write!(f, "architecture not supported"),
        }
    }
}

impl std::error::Error for CallError {}

/// Result of one invocation
///
/// The error register's raw post-call value is surfaced unconditionally
/// and uninterpreted; it is only meaningful for bindings made with
/// `throws = true`.
#[derive(Debug)]
pub struct CallOutcome {
    pub value: Value,
    pub error_register: u64,
}

/// How the observable result is rebuilt after the native call returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnStrategy {
    /// Single register word holds the whole value
    Scalar,
    /// Loadable aggregate spread across `words` return registers
    Registers { words: usize },
    /// The callee wrote the hidden buffer; wrap its contents
    IndirectBuffer,
    /// The returned word is a retained class reference
    ClassHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Armed,
    Fired,
}

/// Per-binding one-shot capture of the return-register state
///
/// Fires exactly once per call and re-arms when the captured words are
/// taken for reconstruction; never global, never shared across bindings.
#[derive(Debug)]
struct ReturnCapture {
    state: CaptureState,
    regs: [u64; MAX_RETURN_WORDS],
}

impl ReturnCapture {
    fn new() -> Self {
        Self {
            state: CaptureState::Armed,
            regs: [0; MAX_RETURN_WORDS],
        }
    }

    fn record(&mut self, regs: [u64; MAX_RETURN_WORDS]) {
        debug_assert_eq!(
            self.state,
            CaptureState::Armed,
            "return capture fired twice within one call"
        );
        self.regs = regs;
        self.state = CaptureState::Fired;
    }

    fn take(&mut self) -> [u64; MAX_RETURN_WORDS] {
        debug_assert_eq!(
            self.state,
            CaptureState::Fired,
            "no captured return to take"
        );
        self.state = CaptureState::Armed;
        self.regs
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.state == CaptureState::Armed
    }
}

/// Raw register state observed at the instant the call returned
#[derive(Debug, Clone, Copy)]
struct RawReturn {
    regs: [u64; MAX_RETURN_WORDS],
    error: u64,
}

/// A bound Swift function, reusable across invocations
///
/// Exclusive access (`&mut self`) serializes use of the hidden result
/// buffer and the return capture; distinct bindings own disjoint
/// trampolines and buffers and may run concurrently.
#[derive(Debug)]
pub struct Callable {
    trampoline: Trampoline,
    return_type: SwiftType,
    arg_modes: Vec<PassingMode>,
    parameter_shapes: Vec<WordShape>,
    native_return: NativeReturn,
    strategy: ReturnStrategy,
    indirect_buffer: Option<Box<[u8]>>,
    capture: ReturnCapture,
}

/// Bind a function at a known address
///
/// Classifies the signature, allocates the hidden result buffer when the
/// return goes indirect, and synthesizes the trampoline. All failures
/// surface here; a returned `Callable` never fails to marshal.
pub fn bind(
    target: usize,
    return_type: SwiftType,
    argument_types: &[SwiftType],
    context: Option<*const c_void>,
    throws: bool,
) -> Result<Callable, BindError> {
    let arg_modes: Vec<PassingMode> = argument_types.iter().map(classify).collect();
    let parameter_shapes: Vec<WordShape> = argument_types
        .iter()
        .flat_map(|ty| abi::flatten(ty))
        .collect();
    if parameter_shapes.len() > MAX_ARGUMENT_WORDS {
        return Err(BindError::TooManyArgumentWords {
            words: parameter_shapes.len(),
        });
    }

    let ret_mode = classify(&return_type);
    let (native_return, strategy, mut indirect_buffer) = match (return_type.kind(), ret_mode) {
        (TypeKind::Class, _) => (NativeReturn::Words(1), ReturnStrategy::ClassHandle, None),
        (_, PassingMode::Indirect) => {
            let buffer = vec![0u8; return_type.stride()].into_boxed_slice();
            (NativeReturn::Pointer, ReturnStrategy::IndirectBuffer, Some(buffer))
        }
        (_, PassingMode::ByValue { words }) if words > 1 => {
            // Loadable aggregate returned in registers: the declared
            // native return narrows to one word and the real value is
            // read from the captured register state.
            (NativeReturn::Words(1), ReturnStrategy::Registers { words }, None)
        }
        (_, PassingMode::ByValue { words }) => {
            (NativeReturn::Words(words), ReturnStrategy::Scalar, None)
        }
    };

    let indirect_ptr = indirect_buffer.as_mut().map(|buffer| buffer.as_mut_ptr());

    let mut arena = arena::global().lock();
    let trampoline = trampoline::synthesize(
        &mut arena,
        target,
        context,
        indirect_ptr,
        throws,
        native_return,
    )?;
    drop(arena);

    logging::log_bound(target, trampoline.entry(), parameter_shapes.len(), throws);

    Ok(Callable {
        trampoline,
        return_type,
        arg_modes,
        parameter_shapes,
        native_return,
        strategy,
        indirect_buffer,
        capture: ReturnCapture::new(),
    })
}

/// Bind by module and symbol name
///
/// Resolution runs before any memory is allocated; a missing symbol fails
/// the bind with a distinct error.
pub fn bind_symbol(
    module: &str,
    symbol: &str,
    return_type: SwiftType,
    argument_types: &[SwiftType],
    context: Option<*const c_void>,
    throws: bool,
) -> Result<Callable, BindError> {
    let target = library::find_address(module, symbol).map_err(|err| match err {
        library::ResolveError::Load(cause) => BindError::ModuleNotLoaded {
            module: module.to_string(),
            reason: cause.to_string(),
        },
        library::ResolveError::Symbol(_) => BindError::SymbolNotFound {
            module: module.to_string(),
            symbol: symbol.to_string(),
        },
    })?;
    bind(target, return_type, argument_types, context, throws)
}

impl Callable {
    /// Invoke the bound function
    ///
    /// # Safety
    /// Caller must ensure:
    /// - the bound address really is a function following the target
    ///   convention with the bound signature
    /// - every `Value` agrees with the corresponding bound argument type
    ///   (no runtime checking is performed)
    pub unsafe fn call(&mut self, args: &[Value]) -> Result<CallOutcome, CallError> {
        debug_assert_eq!(
            args.len(),
            self.arg_modes.len(),
            "argument count disagrees with the bound signature"
        );

        let words = self.flatten_arguments(args);
        logging::log_invoked(self.trampoline.entry(), args.len());
        let raw = self.invoke(&words)?;
        Ok(self.reconstruct(raw))
    }

    /// Flattened word shapes of the explicit native parameter list
    #[inline]
    pub fn parameter_shapes(&self) -> &[WordShape] {
        &self.parameter_shapes
    }

    /// The shim's declared native return
    #[inline]
    pub fn declared_return(&self) -> NativeReturn {
        self.native_return
    }

    /// Whether this binding owns a hidden indirect-result buffer
    #[inline]
    pub fn has_indirect_buffer(&self) -> bool {
        self.indirect_buffer.is_some()
    }

    /// The synthesized trampoline backing this binding
    #[inline]
    pub fn trampoline(&self) -> &Trampoline {
        &self.trampoline
    }

    #[cfg(test)]
    pub(crate) fn indirect_buffer_address(&self) -> Option<*const u8> {
        self.indirect_buffer.as_ref().map(|buffer| buffer.as_ptr() as *const u8)
    }

    #[cfg(test)]
    pub(crate) fn capture_is_armed(&self) -> bool {
        self.capture.is_armed()
    }

    fn flatten_arguments(&self, args: &[Value]) -> [u64; MAX_ARGUMENT_WORDS] {
        let mut words = [0u64; MAX_ARGUMENT_WORDS];
        let mut cursor = 0;
        for (value, mode) in args.iter().zip(&self.arg_modes) {
            for word in marshal::value_to_words(value, *mode) {
                words[cursor] = word;
                cursor += 1;
            }
        }
        words
    }

    #[cfg(target_arch = "aarch64")]
    fn invoke(&mut self, words: &[u64; MAX_ARGUMENT_WORDS]) -> Result<RawReturn, CallError> {
        let raw = unsafe { invoke_shim(self.trampoline.entry(), words) };
        if let ReturnStrategy::Registers { .. } = self.strategy {
            // One-shot capture of the live return registers; taken (and
            // re-armed) during reconstruction.
            self.capture.record(raw.regs);
        }
        Ok(raw)
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn invoke(&mut self, _words: &[u64; MAX_ARGUMENT_WORDS]) -> Result<RawReturn, CallError> {
        Err(CallError::UnsupportedArchitecture)
    }

    fn reconstruct(&mut self, raw: RawReturn) -> CallOutcome {
        let value = match self.strategy {
            ReturnStrategy::IndirectBuffer => {
                let buffer = self
                    .indirect_buffer
                    .as_ref()
                    .expect("indirect binding owns a buffer");
                Value::from_bytes(self.return_type.clone(), buffer.to_vec())
            }
            ReturnStrategy::Registers { words } => {
                let regs = self.capture.take();
                let bytes = marshal::buffer_from_words(&regs[..words], self.return_type.stride());
                Value::from_bytes(self.return_type.clone(), bytes)
            }
            ReturnStrategy::ClassHandle => {
                Value::from_handle(self.return_type.clone(), raw.regs[0] as *mut c_void)
            }
            ReturnStrategy::Scalar => {
                let bytes = marshal::buffer_from_words(&raw.regs[..1], self.return_type.stride());
                Value::from_bytes(self.return_type.clone(), bytes)
            }
        };
        CallOutcome {
            value,
            error_register: raw.error,
        }
    }
}

/// Transfer control to the trampoline with the flattened words in x0-x7
/// and read back the return-register state the instant it returns
///
/// # Safety
/// `entry` must be an installed trampoline whose target matches the words
/// being passed.
#[cfg(target_arch = "aarch64")]
unsafe fn invoke_shim(entry: usize, words: &[u64; MAX_ARGUMENT_WORDS]) -> RawReturn {
    let x0: u64;
    let x1: u64;
    let x2: u64;
    let x3: u64;
    let error: u64;

    core::arch::asm!(
        "blr {entry}",
        entry = in(reg) entry,
        inlateout("x0") words[0] => x0,
        inlateout("x1") words[1] => x1,
        inlateout("x2") words[2] => x2,
        inlateout("x3") words[3] => x3,
        inlateout("x4") words[4] => _,
        inlateout("x5") words[5] => _,
        inlateout("x6") words[6] => _,
        inlateout("x7") words[7] => _,
        // The trampoline writes the context and error registers, which
        // the C ABI otherwise treats as preserved.
        lateout("x20") _,
        lateout("x21") error,
        clobber_abi("C"),
    );

    RawReturn {
        regs: [x0, x1, x2, x3],
        error,
    }
}

//! Dynamic library loading and symbol resolution
//!
//! The narrow collaborator interface the binder consumes: ensure a
//! module's initializers have run, then resolve a symbol to an address.
//! Loaded handles are memoized process-wide, lazily and idempotently.

use core::ffi::c_void;
use core::fmt;
use core::ptr::NonNull;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::logging;

#[cfg(unix)]
use std::ffi::CString;

/// Handle to a dynamically loaded library
pub struct Library {
    handle: NonNull<c_void>,
}

impl Library {
    /// Load a library by name, searching standard paths
    ///
    /// Loading runs the module's static initializers; repeated loads of
    /// the same module are reference-counted no-ops in the loader.
    pub fn load(name: &str) -> Result<Self, LoadError> {
        let library = Self::load_impl(name)?;
        logging::log_library_loaded(name);
        Ok(library)
    }

    /// Handle covering the running process image and its dependencies
    #[cfg(unix)]
    pub fn this_process() -> Result<Self, LoadError> {
        let handle = unsafe { libc::dlopen(core::ptr::null(), libc::RTLD_NOW) };
        NonNull::new(handle)
            .map(|handle| Self { handle })
            .ok_or_else(|| LoadError::LoadFailed(last_dl_error()))
    }

    #[cfg(unix)]
    fn load_impl(name: &str) -> Result<Self, LoadError> {
        let cname = CString::new(name).map_err(|_| LoadError::InvalidName)?;

        unsafe {
            let handle = libc::dlopen(cname.as_ptr(), libc::RTLD_NOW);
            NonNull::new(handle)
                .map(|handle| Self { handle })
                .ok_or_else(|| LoadError::LoadFailed(last_dl_error()))
        }
    }

    #[cfg(windows)]
    fn load_impl(name: &str) -> Result<Self, LoadError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;

        extern "system" {
            fn LoadLibraryW(filename: *const u16) -> *mut c_void;
            fn GetLastError() -> u32;
        }

        let wide: Vec<u16> = OsStr::new(name).encode_wide().chain(Some(0)).collect();

        unsafe {
            let handle = LoadLibraryW(wide.as_ptr());
            NonNull::new(handle)
                .map(|handle| Self { handle })
                .ok_or_else(|| {
                    let code = GetLastError();
                    LoadError::LoadFailed(format!("error code: {}", code))
                })
        }
    }

    /// Resolve a symbol to its address
    pub fn symbol(&self, name: &str) -> Result<usize, SymbolError> {
        self.symbol_impl(name)
    }

    #[cfg(unix)]
    fn symbol_impl(&self, name: &str) -> Result<usize, SymbolError> {
        let cname = CString::new(name).map_err(|_| SymbolError::InvalidName)?;

        unsafe {
            let ptr = libc::dlsym(self.handle.as_ptr(), cname.as_ptr());
            if ptr.is_null() {
                Err(SymbolError::NotFound)
            } else {
                Ok(ptr as usize)
            }
        }
    }

    #[cfg(windows)]
    fn symbol_impl(&self, name: &str) -> Result<usize, SymbolError> {
        extern "system" {
            fn GetProcAddress(module: *mut c_void, name: *const u8) -> *mut c_void;
        }

        let cname = std::ffi::CString::new(name).map_err(|_| SymbolError::InvalidName)?;

        unsafe {
            let ptr = GetProcAddress(self.handle.as_ptr(), cname.as_ptr() as *const u8);
            if ptr.is_null() {
                Err(SymbolError::NotFound)
            } else {
                Ok(ptr as usize)
            }
        }
    }
}

impl Drop for Library {
    #[cfg(unix)]
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        extern "system" {
            fn FreeLibrary(module: *mut c_void) -> i32;
        }
        unsafe {
            FreeLibrary(self.handle.as_ptr());
        }
    }
}

unsafe impl Send for Library {}
unsafe impl Sync for Library {}

#[cfg(unix)]
fn last_dl_error() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown error".into()
        } else {
            std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// Library loading errors
#[derive(Debug)]
pub enum LoadError {
    InvalidName,
    LoadFailed(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName => write!(f, "invalid library name"),
            Self::LoadFailed(msg) => write!(f, "failed to load library: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

/// Symbol lookup errors
#[derive(Debug)]
pub enum SymbolError {
    InvalidName,
    NotFound,
}

impl fmt::Display for SymbolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName => write!(f, "invalid symbol name"),
            Self::NotFound => write!(f, "symbol not found"),
        }
    }
}

impl std::error::Error for SymbolError {}

/// Resolution failures, split by stage
#[derive(Debug)]
pub enum ResolveError {
    Load(LoadError),
    Symbol(SymbolError),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(err) => err.fmt(f),
            Self::Symbol(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Process-scoped memoized library table
fn loaded() -> &'static DashMap<String, Library> {
    static LOADED: Lazy<DashMap<String, Library>> = Lazy::new(DashMap::new);
    &LOADED
}

/// Module-readiness hook: make sure `module` is loaded and its static
/// initializers have run
///
/// Idempotent; invoked before every symbol lookup.
pub fn ensure_initialized(module: &str) -> Result<(), LoadError> {
    if loaded().contains_key(module) {
        return Ok(());
    }
    let library = Library::load(module)?;
    loaded().entry(module.to_string()).or_insert(library);
    Ok(())
}

/// Resolve `symbol` inside `module`, loading the module first if needed
pub fn find_address(module: &str, symbol: &str) -> Result<usize, ResolveError> {
    ensure_initialized(module).map_err(ResolveError::Load)?;

    let library = loaded()
        .get(module)
        .expect("module cached by ensure_initialized");
    let address = library.symbol(symbol).map_err(ResolveError::Symbol)?;

    logging::log_symbol_resolved(module, symbol, address);
    Ok(address)
}

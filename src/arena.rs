//! Executable memory arena - page-granular bump allocation for stubs
//!
//! Design: bump pointer within mapped pages, new page when a request does
//! not fit, no individual reclamation. Pages are mapped writable and
//! executable for the arena's lifetime; each slot is written exactly once,
//! and its address is only published after the bytes and the instruction
//! cache are settled. Installing a slot never changes the protection of
//! the page, so stubs already handed out stay executable while later
//! slots on the same page are written.

use core::fmt;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::logging;

/// Arena errors surface the OS failure; there is no recovery path for a
/// partially prepared slot.
#[derive(Debug)]
pub enum ArenaError {
    /// OS refused to map a fresh page
    MapFailed(String),
    /// Requests never span pages, so a slot cannot exceed one page
    RequestTooLarge { size: usize, page_size: usize },
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapFailed(msg) => write!(f, "failed to map executable page: {}", msg),
            Self::RequestTooLarge { size, page_size } => {
                write!(f, "slot of {} bytes exceeds page size {}", size, page_size)
            }
        }
    }
}

impl std::error::Error for ArenaError {}

/// Host page size, discovered once
pub fn page_size() -> usize {
    static PAGE_SIZE: Lazy<usize> = Lazy::new(query_page_size);
    *PAGE_SIZE
}

#[cfg(unix)]
fn query_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn query_page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { core::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    let size = info.dwPageSize as usize;
    if size > 0 {
        size
    } else {
        4096
    }
}

/// One mapped page; owns the region until the arena itself goes away
struct ExecPage {
    ptr: *mut u8,
    len: usize,
}

impl ExecPage {
    fn map(len: usize) -> Result<Self, ArenaError> {
        let ptr = map_page(len)?;
        logging::log_page_mapped(ptr, len);
        Ok(Self { ptr, len })
    }

    #[inline]
    fn end(&self) -> *mut u8 {
        unsafe { self.ptr.add(self.len) }
    }

    /// Write `code` into a slot of this page and settle the instruction
    /// cache
    ///
    /// Touches only the slot's own bytes; protection of the page (and of
    /// every previously installed slot on it) is left alone.
    fn patch(&self, slot: *mut u8, code: &[u8]) {
        debug_assert!(slot >= self.ptr && unsafe { slot.add(code.len()) } <= self.end());
        patch_slot(slot, code);
    }
}

impl Drop for ExecPage {
    fn drop(&mut self) {
        unmap_page(self.ptr, self.len);
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn map_page(len: usize) -> Result<*mut u8, ArenaError> {
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ArenaError::MapFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn map_page(len: usize) -> Result<*mut u8, ArenaError> {
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ArenaError::MapFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(ptr as *mut u8)
}

#[cfg(windows)]
fn map_page(len: usize) -> Result<*mut u8, ArenaError> {
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE};

    let ptr = unsafe {
        VirtualAlloc(
            core::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if ptr.is_null() {
        let code = unsafe { GetLastError() };
        return Err(ArenaError::MapFailed(format!("error code: {}", code)));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn unmap_page(ptr: *mut u8, len: usize) {
    if !ptr.is_null() {
        unsafe {
            libc::munmap(ptr as *mut _, len);
        }
    }
}

#[cfg(windows)]
fn unmap_page(ptr: *mut u8, _len: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;

    if !ptr.is_null() {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn patch_slot(slot: *mut u8, code: &[u8]) {
    extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }

    unsafe {
        core::ptr::copy_nonoverlapping(code.as_ptr(), slot, code.len());
        __clear_cache(
            slot as *mut libc::c_char,
            slot.add(code.len()) as *mut libc::c_char,
        );
    }
}

#[cfg(target_os = "macos")]
fn patch_slot(slot: *mut u8, code: &[u8]) {
    extern "C" {
        fn pthread_jit_write_protect_supported_np() -> libc::c_int;
        fn pthread_jit_write_protect_np(enabled: libc::c_int);
        fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
    }

    unsafe {
        // The write-protect toggle is per-thread; other threads executing
        // neighboring slots are unaffected.
        let toggle = pthread_jit_write_protect_supported_np() != 0;
        if toggle {
            pthread_jit_write_protect_np(0);
        }
        core::ptr::copy_nonoverlapping(code.as_ptr(), slot, code.len());
        sys_icache_invalidate(slot as *mut libc::c_void, code.len());
        if toggle {
            pthread_jit_write_protect_np(1);
        }
    }
}

#[cfg(windows)]
fn patch_slot(slot: *mut u8, code: &[u8]) {
    use winapi::um::processthreadsapi::{FlushInstructionCache, GetCurrentProcess};

    unsafe {
        core::ptr::copy_nonoverlapping(code.as_ptr(), slot, code.len());
        FlushInstructionCache(GetCurrentProcess(), slot as *const _, code.len());
    }
}

/// Bump allocator over an ordered sequence of executable pages
///
/// Not inherently thread-safe; the process-wide instance behind
/// [`global`] is mutex-guarded.
pub struct ExecArena {
    pages: Vec<ExecPage>,
    cursor: usize,
}

impl ExecArena {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            cursor: 0,
        }
    }

    /// Hand out a fresh slot of `size` bytes
    ///
    /// The slot never overlaps a previously returned one and never spans
    /// two pages; when the current page cannot fit the request, a new page
    /// is appended and becomes current.
    pub fn allocate(&mut self, size: usize) -> Result<*mut u8, ArenaError> {
        assert!(size > 0, "zero-sized slot request");
        let page_size = page_size();
        if size > page_size {
            return Err(ArenaError::RequestTooLarge { size, page_size });
        }

        // Instructions are word-granular; keep slots 4-byte aligned.
        let cursor = align_up(self.cursor, 4);

        let needs_page = match self.pages.last() {
            Some(page) => cursor + size > page.len,
            None => true,
        };
        if needs_page {
            self.pages.push(ExecPage::map(page_size)?);
            self.cursor = 0;
        }

        let cursor = if needs_page { 0 } else { cursor };
        let page = self.pages.last().expect("page just ensured");
        let slot = unsafe { page.ptr.add(cursor) };
        self.cursor = cursor + size;
        logging::log_slot_allocated(size, slot);
        Ok(slot)
    }

    /// Allocate an exact-size slot, copy `code` in, and settle it for
    /// execution
    ///
    /// The returned address is valid to execute once this call returns;
    /// neighboring slots stay executable throughout.
    pub fn install(&mut self, code: &[u8]) -> Result<*const u8, ArenaError> {
        let slot = self.allocate(code.len())?;
        let page = self.pages.last().expect("slot lives in the newest page");
        page.patch(slot, code);
        Ok(slot as *const u8)
    }

    /// Number of pages mapped so far
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl Default for ExecArena {
    fn default() -> Self {
        Self::new()
    }
}

// Pages are plain memory plus a raw pointer; moving the arena between
// threads is fine, shared use goes through the global mutex.
unsafe impl Send for ExecArena {}

/// Process-wide arena used by binding; lives for the process lifetime
pub fn global() -> &'static Mutex<ExecArena> {
    static GLOBAL: Lazy<Mutex<ExecArena>> = Lazy::new(|| Mutex::new(ExecArena::new()));
    &GLOBAL
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

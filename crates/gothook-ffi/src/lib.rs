//! gothook C ABI
//!
//! Exports the process-wide hook engine to C callers. Every function returns `0` on
//! success and the error's status code otherwise; nothing here panics across the
//! boundary.
//!
//! # Safety
//! String arguments must be NUL-terminated and valid for the duration of the call.
//! `old_func` passed to [`gothook_register`] must stay writable for as long as hooks can
//! be applied, since the original pointer is stored there during later refreshes.

use gothook_common::{Address, Error, Result};
use gothook_core::api;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, warn};

/// Caller-owned location receiving original function pointers
#[derive(Clone, Copy)]
struct OutPtr(usize);

impl OutPtr {
    fn store(self, original: Address) {
        // SAFETY: the registrant promised the location outlives its hooks.
        unsafe {
            std::ptr::write_volatile(self.0 as *mut *mut c_void, original.get() as *mut c_void)
        };
    }
}

fn required_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(Error::InvalidArgument(format!("{} is null", what)));
    }
    // SAFETY: non-null and NUL-terminated per the calling contract.
    let value = unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| Error::InvalidArgument(format!("{} is not UTF-8", what)))?;
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{} is empty", what)));
    }
    Ok(value)
}

fn optional_str<'a>(ptr: *const c_char, what: &str) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    required_str(ptr, what).map(Some)
}

/// Run `op` and turn its outcome into a status code
fn status(operation: &str, op: impl FnOnce() -> Result<()>) -> c_int {
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            warn!(target: "gothook::ffi", operation, code = e.status_code(), "{}", e);
            e.status_code()
        }
        Err(_) => {
            error!(target: "gothook::ffi", operation, "panic caught at C boundary");
            Error::Internal("panic".into()).status_code()
        }
    }
}

/// Hook `symbol` in every image whose pathname matches the BRE `pathname_regex`
///
/// `old_func` may be null; otherwise it receives the original pointer the first time this
/// registration patches the symbol in each image.
///
/// # Safety
/// See the crate documentation.
#[no_mangle]
pub unsafe extern "C" fn gothook_register(
    pathname_regex: *const c_char,
    symbol: *const c_char,
    new_func: *mut c_void,
    old_func: *mut *mut c_void,
) -> c_int {
    status("register", || {
        let pattern = required_str(pathname_regex, "pathname pattern")?;
        let symbol = required_str(symbol, "symbol")?;
        if new_func.is_null() {
            return Err(Error::InvalidArgument("new_func is null".into()));
        }
        let replacement = Address::new(new_func as usize);

        if old_func.is_null() {
            api::register(pattern, symbol, replacement)?;
        } else {
            let out = OutPtr(old_func as usize);
            api::register_with_sink(
                pattern,
                symbol,
                replacement,
                Box::new(move |original| out.store(original)),
            )?;
        }
        Ok(())
    })
}

/// Exclude `symbol` (or, when null, every symbol) of matching images from hooking
///
/// # Safety
/// See the crate documentation.
#[no_mangle]
pub unsafe extern "C" fn gothook_ignore(
    pathname_regex: *const c_char,
    symbol: *const c_char,
) -> c_int {
    status("ignore", || {
        let pattern = required_str(pathname_regex, "pathname pattern")?;
        let symbol = optional_str(symbol, "symbol")?;
        api::ignore(pattern, symbol)
    })
}

/// Apply registered hooks to loaded images; non-zero `is_async` runs the pass on a
/// background thread
#[no_mangle]
pub extern "C" fn gothook_refresh(is_async: c_int) -> c_int {
    status("refresh", || api::refresh(is_async != 0))
}

/// Forget processed images so the next refresh evaluates all of them
#[no_mangle]
pub extern "C" fn gothook_clear() {
    let _ = status("clear", || {
        api::clear();
        Ok(())
    });
}

#[no_mangle]
pub extern "C" fn gothook_enable_debug(flag: c_int) {
    let _ = status("enable_debug", || {
        api::set_debug(flag != 0);
        Ok(())
    });
}

/// Toggle memory fault containment; disabling it lets faults reach the process
#[no_mangle]
pub extern "C" fn gothook_enable_sigsegv_protection(flag: c_int) {
    let _ = status("enable_sigsegv_protection", || {
        api::set_fault_protection(flag != 0);
        Ok(())
    });
}

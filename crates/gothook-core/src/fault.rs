//! Fault containment for memory inspection and patching
//!
//! Reads of image memory go through the kernel (`process_vm_readv` on our own pid) so an
//! unmapped or unreadable address comes back as `EFAULT` instead of a signal. Kernels or
//! sandboxes that refuse `process_vm_readv` fall back to copying through a pipe, which
//! the kernel checks the same way. Slot writes are checked for writability the same way
//! before the atomic store, so a stale view of page protection ends in `EFAULT` rather
//! than `SIGSEGV`. Panics raised inside a guarded unit are caught too.
//!
//! With protection disabled, memory is touched directly and faults reach the process's
//! normal signal handling, which is what you want while debugging the engine itself.

use crate::traits::ForeignMemory;
use gothook_common::{Address, Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{trace, warn};

const WORD: usize = std::mem::size_of::<usize>();

/// Largest chunk pushed through the pipe at once; stays below the pipe capacity
const PIPE_CHUNK: usize = 4096;

fn fault_at(addr: Address, context: &str) -> Error {
    Error::FaultSignaled {
        address: addr.get(),
        context: context.to_string(),
    }
}

/// Kernel-checked memory access
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckedMemory;

/// Set once `process_vm_readv` proved unusable in this process
static VM_READV_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

/// Set once `process_vm_writev` proved unusable in this process
static VM_WRITEV_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

impl CheckedMemory {
    fn read_vm(&self, addr: Address, buf: &mut [u8]) -> std::result::Result<(), i32> {
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr.get() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: the local iovec covers `buf`; the remote side is validated by the kernel.
        let copied = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if copied < 0 {
            return Err(last_errno());
        }
        if copied as usize != buf.len() {
            return Err(libc::EFAULT);
        }
        Ok(())
    }

    fn write_vm(&self, addr: Address, bytes: &[u8]) -> std::result::Result<(), i32> {
        let local = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let remote = libc::iovec {
            iov_base: addr.get() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        // SAFETY: the local iovec is only read; the kernel refuses read-only remote pages.
        let copied = unsafe { libc::process_vm_writev(libc::getpid(), &local, 1, &remote, 1, 0) };
        if copied < 0 {
            return Err(last_errno());
        }
        if copied as usize != bytes.len() {
            return Err(libc::EFAULT);
        }
        Ok(())
    }

    /// Push `bytes` through a pipe and read them back into `addr`
    ///
    /// read(2) into a page without write permission fails with `EFAULT`.
    fn write_via_pipe(&self, addr: Address, bytes: &[u8]) -> std::result::Result<(), i32> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for both descriptors.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(last_errno());
        }
        let [read_fd, write_fd] = fds;

        // SAFETY: `bytes` is a valid source of `bytes.len()` bytes.
        let written =
            unsafe { libc::write(write_fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        let result = if written != bytes.len() as isize {
            Err(libc::EIO)
        } else {
            // SAFETY: read(2) validates the destination range and fails with EFAULT.
            let read =
                unsafe { libc::read(read_fd, addr.get() as *mut libc::c_void, bytes.len()) };
            if read == bytes.len() as isize {
                Ok(())
            } else if read < 0 {
                Err(last_errno())
            } else {
                Err(libc::EFAULT)
            }
        };

        // SAFETY: both descriptors were opened above and are not used afterwards.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        result
    }

    /// Fail with a fault unless `addr` can take a store of `current`
    ///
    /// `current` is what the slot already holds, so the kernel-side copy never changes
    /// what concurrent readers of the slot observe.
    fn check_writable(&self, addr: Address, current: &[u8]) -> Result<()> {
        if !VM_WRITEV_UNAVAILABLE.load(Ordering::Relaxed) {
            match self.write_vm(addr, current) {
                Ok(()) => return Ok(()),
                Err(libc::ENOSYS) | Err(libc::EPERM) => {
                    warn!(
                        target: "gothook::fault",
                        "process_vm_writev unavailable, falling back to pipe copies"
                    );
                    VM_WRITEV_UNAVAILABLE.store(true, Ordering::Relaxed);
                }
                Err(errno) => {
                    trace!(target: "gothook::fault", addr = %addr, errno, "checked write failed");
                    return Err(fault_at(addr, "checked write"));
                }
            }
        }

        self.write_via_pipe(addr, current).map_err(|errno| {
            trace!(target: "gothook::fault", addr = %addr, errno, "piped write failed");
            fault_at(addr, "piped write")
        })
    }

    fn read_via_pipe(&self, addr: Address, buf: &mut [u8]) -> std::result::Result<(), i32> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for both descriptors.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(last_errno());
        }
        let [read_fd, write_fd] = fds;

        let mut result = Ok(());
        for (index, chunk) in buf.chunks_mut(PIPE_CHUNK).enumerate() {
            let src = addr.get() + index * PIPE_CHUNK;
            // SAFETY: write(2) validates the source range and fails with EFAULT.
            let written =
                unsafe { libc::write(write_fd, src as *const libc::c_void, chunk.len()) };
            if written != chunk.len() as isize {
                result = Err(libc::EFAULT);
                break;
            }
            // SAFETY: `chunk` is a valid destination of `chunk.len()` bytes.
            let read = unsafe {
                libc::read(read_fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
            };
            if read != chunk.len() as isize {
                result = Err(libc::EIO);
                break;
            }
        }

        // SAFETY: both descriptors were opened above and are not used afterwards.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        result
    }
}

impl ForeignMemory for CheckedMemory {
    fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        if len == 0 {
            return Ok(buf);
        }
        if addr.checked_add(len).is_none() {
            return Err(fault_at(addr, "read past end of address space"));
        }

        if !VM_READV_UNAVAILABLE.load(Ordering::Relaxed) {
            match self.read_vm(addr, &mut buf) {
                Ok(()) => return Ok(buf),
                Err(libc::ENOSYS) | Err(libc::EPERM) => {
                    warn!(
                        target: "gothook::fault",
                        "process_vm_readv unavailable, falling back to pipe copies"
                    );
                    VM_READV_UNAVAILABLE.store(true, Ordering::Relaxed);
                }
                Err(errno) => {
                    trace!(target: "gothook::fault", addr = %addr, len, errno, "checked read failed");
                    return Err(fault_at(addr, "checked read"));
                }
            }
        }

        match self.read_via_pipe(addr, &mut buf) {
            Ok(()) => Ok(buf),
            Err(errno) => {
                trace!(target: "gothook::fault", addr = %addr, len, errno, "piped read failed");
                Err(fault_at(addr, "piped read"))
            }
        }
    }

    fn write_word(&self, addr: Address, value: usize) -> Result<()> {
        if !addr.is_aligned(WORD) {
            return Err(Error::InvalidArgument(format!(
                "unaligned slot address {}",
                addr
            )));
        }
        let current = self.read_bytes(addr, WORD)?;
        self.check_writable(addr, &current)?;
        // SAFETY: the address is aligned and the kernel just accepted a store to it.
        let slot = unsafe { &*(addr.get() as *const AtomicUsize) };
        slot.store(value, Ordering::SeqCst);
        Ok(())
    }
}

/// Direct memory access with no fault interception
#[derive(Debug, Default, Clone, Copy)]
pub struct RawMemory;

impl ForeignMemory for RawMemory {
    fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let ptr = addr.get() as *const u8;
        let mut buf = Vec::with_capacity(len);
        for i in 0..len {
            // SAFETY: fault containment is off, so an invalid address faults the process.
            buf.push(unsafe { std::ptr::read_volatile(ptr.wrapping_add(i)) });
        }
        Ok(buf)
    }

    fn read_word(&self, addr: Address) -> Result<usize> {
        if !addr.is_aligned(WORD) {
            let bytes = self.read_bytes(addr, WORD)?;
            let mut buf = [0u8; WORD];
            buf.copy_from_slice(&bytes);
            return Ok(usize::from_ne_bytes(buf));
        }
        // SAFETY: as above.
        Ok(unsafe { std::ptr::read_volatile(addr.get() as *const usize) })
    }

    fn write_word(&self, addr: Address, value: usize) -> Result<()> {
        if !addr.is_aligned(WORD) {
            return Err(Error::InvalidArgument(format!(
                "unaligned slot address {}",
                addr
            )));
        }
        // SAFETY: as above.
        let slot = unsafe { &*(addr.get() as *const AtomicUsize) };
        slot.store(value, Ordering::SeqCst);
        Ok(())
    }
}

static CHECKED: CheckedMemory = CheckedMemory;
static RAW: RawMemory = RawMemory;

/// Scoped "catch fault" combinator around one unit of work
#[derive(Debug)]
pub struct FaultGuard {
    enabled: AtomicBool,
}

impl Default for FaultGuard {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FaultGuard {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Memory accessor matching the current mode
    pub fn memory(&self) -> &'static dyn ForeignMemory {
        if self.is_enabled() {
            &CHECKED
        } else {
            &RAW
        }
    }

    /// Run `op` so that a fault inside it aborts only `op`
    ///
    /// The mode is sampled once at entry; toggling it while `op` runs affects the next
    /// unit of work only.
    pub fn protect<T, F>(&self, context: &str, op: F) -> Result<T>
    where
        F: FnOnce(&dyn ForeignMemory) -> Result<T>,
    {
        if !self.is_enabled() {
            return op(&RAW);
        }

        match catch_unwind(AssertUnwindSafe(|| op(&CHECKED))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(target: "gothook::fault", context, %message, "panic contained");
                Err(Error::FaultSignaled {
                    address: 0,
                    context: format!("{}: {}", context, message),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unmapped_page() -> Address {
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        Address::new(page as usize)
    }

    #[test]
    fn test_checked_read_of_valid_memory() {
        let data: [u8; 5] = [1, 2, 3, 4, 5];
        let bytes = CheckedMemory
            .read_bytes(Address::new(data.as_ptr() as usize), data.len())
            .unwrap();
        assert_eq!(bytes, data);
    }

    #[test]
    fn test_checked_read_of_protected_page_faults() {
        let page = unmapped_page();
        let err = CheckedMemory.read_bytes(page, 16).unwrap_err();
        assert!(err.is_fault());
    }

    #[test]
    fn test_pipe_read_matches_vm_read() {
        let data: Vec<u8> = (0..10_000u32).map(|v| v as u8).collect();
        let mut buf = vec![0u8; data.len()];
        CheckedMemory
            .read_via_pipe(Address::new(data.as_ptr() as usize), &mut buf)
            .unwrap();
        assert_eq!(buf, data);

        let page = unmapped_page();
        let mut small = [0u8; 8];
        assert!(CheckedMemory.read_via_pipe(page, &mut small).is_err());
    }

    #[test]
    fn test_checked_write_word() {
        let slot = Box::new(AtomicUsize::new(0x1111));
        let addr = Address::new(&*slot as *const AtomicUsize as usize);
        CheckedMemory.write_word(addr, 0x2222).unwrap();
        assert_eq!(slot.load(Ordering::SeqCst), 0x2222);
        assert_eq!(CheckedMemory.read_word(addr).unwrap(), 0x2222);

        let unaligned = Address::new(addr.get() + 1);
        assert!(matches!(
            CheckedMemory.write_word(unaligned, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_checked_write_to_protected_page_faults() {
        let page = unmapped_page();
        assert!(CheckedMemory.write_word(page, 1).unwrap_err().is_fault());
    }

    #[test]
    fn test_checked_write_to_read_only_page_faults() {
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        unsafe { *(page as *mut usize) = 0x5150 };
        assert_eq!(unsafe { libc::mprotect(page, 4096, libc::PROT_READ) }, 0);

        let addr = Address::new(page as usize);
        let err = CheckedMemory.write_word(addr, 0x6160).unwrap_err();
        assert!(err.is_fault());
        assert_eq!(CheckedMemory.read_word(addr).unwrap(), 0x5150);

        let current = 0x5150usize.to_ne_bytes();
        assert!(CheckedMemory.write_via_pipe(addr, &current).is_err());
    }

    #[test]
    fn test_write_via_pipe_stores_bytes() {
        let slot = Box::new(AtomicUsize::new(0x1111));
        let addr = Address::new(&*slot as *const AtomicUsize as usize);
        CheckedMemory
            .write_via_pipe(addr, &0x1111usize.to_ne_bytes())
            .unwrap();
        assert_eq!(slot.load(Ordering::SeqCst), 0x1111);
    }

    #[test]
    fn test_guard_contains_fault() {
        let guard = FaultGuard::default();
        let page = unmapped_page();
        let result: Result<usize> = guard.protect("test image", |mem| mem.read_word(page));
        assert!(result.unwrap_err().is_fault());
    }

    #[test]
    fn test_guard_contains_panic() {
        let guard = FaultGuard::new(true);
        let result: Result<()> = guard.protect("panicking image", |_| panic!("layout mismatch"));
        match result {
            Err(Error::FaultSignaled { context, .. }) => {
                assert!(context.contains("panicking image"));
                assert!(context.contains("layout mismatch"));
            }
            other => panic!("Expected FaultSignaled, got {:?}", other),
        }
    }

    #[test]
    fn test_guard_disabled_uses_raw_memory() {
        let guard = FaultGuard::new(false);
        assert!(!guard.is_enabled());
        let value = 0xabcdusize;
        let read = guard
            .protect("raw", |mem| mem.read_word(Address::new(&value as *const usize as usize)))
            .unwrap();
        assert_eq!(read, 0xabcd);
        guard.set_enabled(true);
        assert!(guard.is_enabled());
    }
}

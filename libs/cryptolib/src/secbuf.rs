//! Wipe-on-release buffers for key material.
//!
//! Every exit path, including unwind, goes through `Drop`, and `Drop`
//! zeroizes. The allocation is also best-effort locked against paging;
//! failure to lock (no CAP_IPC_LOCK, RLIMIT_MEMLOCK exhausted) is reported
//! once per process at debug level and otherwise ignored -- a missing lock
//! degrades the threat model, a refused operation would degrade the tool.
//!
//! Key-bearing slices must live in a `SecureBuf` (or something that derefs
//! to one) so they can never be handed to a non-wiping free path by
//! accident.

use std::ops::{Deref, DerefMut};
use std::sync::Once;

use zeroize::Zeroize;

static MLOCK_WARN: Once = Once::new();

#[cfg(test)]
pub(crate) static WIPE_EVENTS: std::sync::atomic::AtomicUsize =
    std::sync::atomic::AtomicUsize::new(0);

pub struct SecureBuf {
    buf: Vec<u8>,
}

impl SecureBuf {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> SecureBuf {
        let buf = vec![0u8; len];
        if len > 0 {
            let rc = unsafe { libc::mlock(buf.as_ptr() as *const libc::c_void, len) };
            if rc != 0 {
                MLOCK_WARN.call_once(|| {
                    log::debug!(
                        "mlock failed ({}); key material may be paged to swap",
                        std::io::Error::last_os_error()
                    );
                });
            }
        }
        SecureBuf { buf }
    }

    pub fn from_slice(data: &[u8]) -> SecureBuf {
        let mut sb = SecureBuf::new(data.len());
        sb.buf.copy_from_slice(data);
        sb
    }

    pub fn len(&self) -> usize { self.buf.len() }

    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    /// Explicit wipe; `Drop` does this too, this is for callers that want
    /// the contents gone before the binding dies. Length is unchanged.
    pub fn wipe(&mut self) {
        self.buf.as_mut_slice().zeroize();
    }
}

impl Deref for SecureBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] { &self.buf }
}

impl DerefMut for SecureBuf {
    fn deref_mut(&mut self) -> &mut [u8] { &mut self.buf }
}

impl Drop for SecureBuf {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            unsafe {
                libc::munlock(self.buf.as_ptr() as *const libc::c_void, self.buf.len());
            }
        }
        // Vec zeroize clears the whole capacity, not just the live length
        self.buf.zeroize();
        #[cfg(test)]
        WIPE_EVENTS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

// No Clone on purpose; copying key material must be spelled out with
// from_slice at the call site.

impl std::fmt::Debug for SecureBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print contents
        write!(f, "SecureBuf({} bytes)", self.buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn wipe_clears_contents_keeps_length() {
        let mut sb = SecureBuf::from_slice(b"super secret key material.......");
        assert_eq!(&sb[..12], b"super secret");
        sb.wipe();
        assert!(sb.iter().all(|&b| b == 0));
        assert_eq!(sb.len(), 32);
    }

    #[test]
    fn drop_wipes_on_unwind() {
        use std::panic;
        let before = WIPE_EVENTS.load(Ordering::SeqCst);
        let result = panic::catch_unwind(|| {
            let _sb = SecureBuf::from_slice(&[0xEEu8; 128]);
            panic!("boom");
        });
        assert!(result.is_err());
        // the wipe path ran during unwind
        assert!(WIPE_EVENTS.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn zero_length_buffer_is_fine() {
        let sb = SecureBuf::new(0);
        assert!(sb.is_empty());
    }
}

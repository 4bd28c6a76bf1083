//! Cryptographic primitives behind one interface.
//!
//! Everything the toolkit needs from a crypto library goes through the
//! [`CryptoBackend`] trait: digest sizing, streaming hash and HMAC, PBKDF2
//! and the two-tier CSPRNG. Two providers exist: a software provider built
//! on the RustCrypto crates, and an optional Linux kernel provider that
//! drives the AF_ALG socket interface. Both must produce bit-identical
//! output for the same named algorithm -- the test suite pins this with
//! known-answer vectors, so a provider that disagrees is a broken provider,
//! not a "different" one.
//!
//! The block cipher used for keyslot material lives in [`cipher`] and is
//! implemented in software only; the payload cipher never runs in user
//! space, so there is nothing to gain from pushing the keyslot path into
//! the kernel and a lot of socket plumbing to lose.
//!
//! Provider selection happens once per process and is idempotent; there is
//! no other global state in this crate. The primitives layer never changes
//! process privileges -- that policy belongs to the caller.

pub mod cipher;
pub mod rng;
pub mod secbuf;
mod soft;

#[cfg(all(target_os = "linux", feature = "kernel-crypto"))]
mod kernel;

pub use rng::{random_get, RngQuality, RngSource};
pub use secbuf::SecureBuf;

use std::fmt;
use std::sync::OnceLock;

/// Largest digest any supported algorithm produces (sha512).
pub const MAX_DIGEST_SIZE: usize = 64;

#[derive(Debug)]
pub enum CryptoError {
    /// The named algorithm is not known to this provider.
    NotFound,
    /// Argument rejected before any crypto ran (bad key/buffer length).
    Invalid,
    /// The provider itself failed.
    Io(std::io::Error),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::NotFound => f.write_str("algorithm not available"),
            CryptoError::Invalid => f.write_str("invalid argument"),
            CryptoError::Io(e) => write!(f, "crypto provider failure: {}", e),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<std::io::Error> for CryptoError {
    fn from(e: std::io::Error) -> Self { CryptoError::Io(e) }
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// A streaming hash or HMAC context.
///
/// `finalize` writes the leading `out.len()` bytes of the digest
/// (`out.len()` must not exceed the digest size) and resets the context so
/// it can be fed again. The reset-on-final contract is what makes the
/// HMAC-based PBKDF2 loop affordable on the kernel provider, where creating
/// a context costs three syscalls.
pub trait HashOp {
    fn update(&mut self, data: &[u8]) -> Result<()>;
    fn finalize(&mut self, out: &mut [u8]) -> Result<()>;
}

pub trait CryptoBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Digest size in bytes for a named algorithm, `NotFound` if unknown.
    fn hash_size(&self, alg: &str) -> Result<usize>;

    fn hash_init(&self, alg: &str) -> Result<Box<dyn HashOp>>;

    fn hmac_init(&self, alg: &str, key: &[u8]) -> Result<Box<dyn HashOp>>;

    /// PBKDF2-HMAC with the named hash. `out.len()` picks the derived key
    /// length.
    fn pbkdf2(
        &self,
        alg: &str,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        out: &mut [u8],
    ) -> Result<()>;
}

/// RFC 2898 PBKDF2 over a provider's streaming HMAC.
///
/// Shared by providers that have no native PBKDF2 (the kernel backend) and
/// used as the reference the software fast path is tested against.
#[allow(dead_code)]
pub(crate) fn pbkdf2_via_hmac(
    backend: &dyn CryptoBackend,
    alg: &str,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    out: &mut [u8],
) -> Result<()> {
    if iterations == 0 || out.is_empty() {
        return Err(CryptoError::Invalid);
    }
    let hlen = backend.hash_size(alg)?;
    let mut hmac = backend.hmac_init(alg, password)?;

    let mut u = [0u8; MAX_DIGEST_SIZE];
    let mut t = [0u8; MAX_DIGEST_SIZE];

    for (block, chunk) in out.chunks_mut(hlen).enumerate() {
        // U_1 = PRF(P, S || INT(i)), big-endian block index starting at 1
        hmac.update(salt)?;
        hmac.update(&(block as u32 + 1).to_be_bytes())?;
        hmac.finalize(&mut u[..hlen])?;
        t[..hlen].copy_from_slice(&u[..hlen]);

        for _ in 1..iterations {
            hmac.update(&u[..hlen])?;
            hmac.finalize(&mut u[..hlen])?;
            for (tb, ub) in t[..hlen].iter_mut().zip(u[..hlen].iter()) {
                *tb ^= ub;
            }
        }
        chunk.copy_from_slice(&t[..chunk.len()]);
    }

    use zeroize::Zeroize;
    u.zeroize();
    t.zeroize();
    Ok(())
}

static BACKEND: OnceLock<&'static dyn CryptoBackend> = OnceLock::new();

/// The process-wide provider. First call selects and initialises it; later
/// calls return the same instance (idempotent, thread-safe).
pub fn backend() -> &'static dyn CryptoBackend {
    *BACKEND.get_or_init(|| {
        #[cfg(all(target_os = "linux", feature = "kernel-crypto"))]
        {
            match kernel::KernelBackend::probe() {
                Ok(kb) => {
                    log::debug!("crypto backend: kernel (AF_ALG)");
                    let kb: &'static kernel::KernelBackend = Box::leak(Box::new(kb));
                    return kb as &'static dyn CryptoBackend;
                }
                Err(e) => {
                    log::warn!("AF_ALG unavailable ({}), falling back to software backend", e);
                }
            }
        }
        log::debug!("crypto backend: software");
        &soft::SoftBackend as &'static dyn CryptoBackend
    })
}

/// One-shot hash of `data`, truncated to `out.len()`.
pub fn hash_once(alg: &str, data: &[u8], out: &mut [u8]) -> Result<()> {
    let mut h = backend().hash_init(alg)?;
    h.update(data)?;
    h.finalize(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn pbkdf2_generic_matches_fast_path() {
        // RFC 6070 vector #2 for PBKDF2-HMAC-SHA1, plus a sha256 vector;
        // the generic HMAC loop and the provider's own path must agree.
        let b = &soft::SoftBackend;
        let mut fast = [0u8; 20];
        let mut generic = [0u8; 20];
        b.pbkdf2("sha1", b"password", b"salt", 2, &mut fast).unwrap();
        pbkdf2_via_hmac(b, "sha1", b"password", b"salt", 2, &mut generic).unwrap();
        assert_eq!(fast, hex!("ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957"));
        assert_eq!(fast, generic);

        let mut fast = [0u8; 32];
        let mut generic = [0u8; 32];
        b.pbkdf2("sha256", b"password", b"salt", 4096, &mut fast).unwrap();
        pbkdf2_via_hmac(b, "sha256", b"password", b"salt", 4096, &mut generic).unwrap();
        assert_eq!(
            fast,
            hex!("c5e478d59288c841aa530db6845c4c8d962893a001ce4e11a4963873aa98134a")
        );
        assert_eq!(fast, generic);
    }

    #[test]
    fn pbkdf2_long_output_spans_blocks() {
        let b = &soft::SoftBackend;
        let mut out = [0u8; 25];
        b.pbkdf2("sha1", b"passwordPASSWORDpassword", b"saltSALTsaltSALTsaltSALTsaltSALTsalt", 4096, &mut out)
            .unwrap();
        assert_eq!(out, hex!("3d2eec4fe41c849b80c8d83662c0e44a8b291a964cf2f07038"));
    }

    #[test]
    fn unknown_algorithm_is_not_found() {
        let b = &soft::SoftBackend;
        assert!(matches!(b.hash_size("md42"), Err(CryptoError::NotFound)));
        assert!(matches!(b.hash_init("md42").err(), Some(CryptoError::NotFound)));
    }

    #[test]
    fn truncated_finalize() {
        let mut out = [0u8; 4];
        hash_once("sha256", b"abc", &mut out).unwrap();
        assert_eq!(out, hex!("ba7816bf"));
    }
}

//! Linux kernel crypto API provider (AF_ALG sockets).
//!
//! One `hash`/`hmac(...)` transform socket per context; data is fed with
//! `MSG_MORE` and the digest collected with a plain `read`, after which the
//! kernel resets the transform so the context can be reused -- exactly the
//! reuse the PBKDF2 loop depends on. Kernel algorithm names differ from
//! ours for two entries (`rmd160`, `wp512`).

use std::io;
use std::os::unix::io::RawFd;

use crate::{pbkdf2_via_hmac, CryptoBackend, CryptoError, HashOp, Result};

struct KernelAlg {
    name: &'static str,
    kernel_name: &'static str,
    length: usize,
}

const HASH_ALGS: &[KernelAlg] = &[
    KernelAlg { name: "sha1", kernel_name: "sha1", length: 20 },
    KernelAlg { name: "sha256", kernel_name: "sha256", length: 32 },
    KernelAlg { name: "sha384", kernel_name: "sha384", length: 48 },
    KernelAlg { name: "sha512", kernel_name: "sha512", length: 64 },
    KernelAlg { name: "ripemd160", kernel_name: "rmd160", length: 20 },
    KernelAlg { name: "whirlpool", kernel_name: "wp512", length: 64 },
];

fn get_alg(name: &str) -> Result<&'static KernelAlg> {
    HASH_ALGS.iter().find(|a| a.name == name).ok_or(CryptoError::NotFound)
}

fn sockaddr_for(salg_type: &[u8], salg_name: &[u8]) -> libc::sockaddr_alg {
    let mut sa: libc::sockaddr_alg = unsafe { std::mem::zeroed() };
    sa.salg_family = libc::AF_ALG as u16;
    sa.salg_type[..salg_type.len()].copy_from_slice(salg_type);
    sa.salg_name[..salg_name.len()].copy_from_slice(salg_name);
    sa
}

/// Transform socket pair; `op` is the accepted operation socket.
struct AlgSocket {
    tfm: RawFd,
    op: RawFd,
    hash_len: usize,
}

impl AlgSocket {
    fn open(salg_type: &str, salg_name: &str, hash_len: usize) -> Result<Self> {
        let sa = sockaddr_for(salg_type.as_bytes(), salg_name.as_bytes());
        let tfm = unsafe { libc::socket(libc::AF_ALG, libc::SOCK_SEQPACKET, 0) };
        if tfm < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let rc = unsafe {
            libc::bind(
                tfm,
                &sa as *const libc::sockaddr_alg as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_alg>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(tfm) };
            // an unknown algorithm binds with ENOENT
            return Err(if e.raw_os_error() == Some(libc::ENOENT) {
                CryptoError::NotFound
            } else {
                e.into()
            });
        }
        let op = unsafe { libc::accept(tfm, std::ptr::null_mut(), std::ptr::null_mut()) };
        if op < 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(tfm) };
            return Err(e.into());
        }
        Ok(AlgSocket { tfm, op, hash_len })
    }

    fn set_key(&self, key: &[u8]) -> Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.tfm,
                libc::SOL_ALG,
                libc::ALG_SET_KEY,
                key.as_ptr() as *const libc::c_void,
                key.len() as libc::socklen_t,
            )
        };
        if rc < 0 { Err(io::Error::last_os_error().into()) } else { Ok(()) }
    }
}

impl Drop for AlgSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.op);
            libc::close(self.tfm);
        }
    }
}

impl HashOp for AlgSocket {
    fn update(&mut self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            let n = unsafe {
                libc::send(
                    self.op,
                    data[sent..].as_ptr() as *const libc::c_void,
                    data.len() - sent,
                    libc::MSG_MORE,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error().into());
            }
            sent += n as usize;
        }
        Ok(())
    }

    fn finalize(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() > self.hash_len {
            return Err(CryptoError::Invalid);
        }
        // a read past the MSG_MORE run finalises and resets the transform
        let mut digest = [0u8; crate::MAX_DIGEST_SIZE];
        let n = unsafe {
            libc::read(self.op, digest.as_mut_ptr() as *mut libc::c_void, self.hash_len)
        };
        if n < 0 || (n as usize) < self.hash_len {
            return Err(io::Error::last_os_error().into());
        }
        out.copy_from_slice(&digest[..out.len()]);
        Ok(())
    }
}

pub(crate) struct KernelBackend;

impl KernelBackend {
    /// One-time availability probe: open and close a sha1 hash socket.
    pub(crate) fn probe() -> Result<KernelBackend> {
        let _ = AlgSocket::open("hash", "sha1", 20)?;
        Ok(KernelBackend)
    }
}

impl CryptoBackend for KernelBackend {
    fn name(&self) -> &'static str { "kernel" }

    fn hash_size(&self, alg: &str) -> Result<usize> {
        get_alg(alg).map(|a| a.length)
    }

    fn hash_init(&self, alg: &str) -> Result<Box<dyn HashOp>> {
        let a = get_alg(alg)?;
        Ok(Box::new(AlgSocket::open("hash", a.kernel_name, a.length)?))
    }

    fn hmac_init(&self, alg: &str, key: &[u8]) -> Result<Box<dyn HashOp>> {
        let a = get_alg(alg)?;
        let sock = AlgSocket::open("hash", &format!("hmac({})", a.kernel_name), a.length)?;
        sock.set_key(key)?;
        Ok(Box::new(sock))
    }

    fn pbkdf2(
        &self,
        alg: &str,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        out: &mut [u8],
    ) -> Result<()> {
        pbkdf2_via_hmac(self, alg, password, salt, iterations, out)
    }
}

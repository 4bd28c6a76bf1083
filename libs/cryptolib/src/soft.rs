//! Software provider, built on the RustCrypto digest/MAC crates.

use digest::Digest;
use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

use crate::{CryptoBackend, CryptoError, HashOp, Result};

/// `(name, digest size)` for everything this provider knows. `whirlpool`
/// is deliberately absent: no crate for it is carried here, and callers
/// are expected to probe availability per provider.
const HASH_ALGS: &[(&str, usize)] = &[
    ("sha1", 20),
    ("sha256", 32),
    ("sha384", 48),
    ("sha512", 64),
    ("ripemd160", 20),
];

pub(crate) struct SoftBackend;

enum SoftHash {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
    Ripemd160(Ripemd160),
}

impl HashOp for SoftHash {
    fn update(&mut self, data: &[u8]) -> Result<()> {
        match self {
            SoftHash::Sha1(d) => d.update(data),
            SoftHash::Sha256(d) => d.update(data),
            SoftHash::Sha384(d) => d.update(data),
            SoftHash::Sha512(d) => d.update(data),
            SoftHash::Ripemd160(d) => d.update(data),
        }
        Ok(())
    }

    fn finalize(&mut self, out: &mut [u8]) -> Result<()> {
        // finalize_reset so the context stays usable; truncation to
        // out.len() is part of the HashOp contract.
        macro_rules! fin {
            ($d:expr) => {{
                let digest = $d.finalize_reset();
                if out.len() > digest.len() {
                    return Err(CryptoError::Invalid);
                }
                out.copy_from_slice(&digest[..out.len()]);
            }};
        }
        match self {
            SoftHash::Sha1(d) => fin!(d),
            SoftHash::Sha256(d) => fin!(d),
            SoftHash::Sha384(d) => fin!(d),
            SoftHash::Sha512(d) => fin!(d),
            SoftHash::Ripemd160(d) => fin!(d),
        }
        Ok(())
    }
}

enum SoftHmac {
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
    Sha512(Hmac<Sha512>),
    Ripemd160(Hmac<Ripemd160>),
}

impl HashOp for SoftHmac {
    fn update(&mut self, data: &[u8]) -> Result<()> {
        match self {
            SoftHmac::Sha1(m) => m.update(data),
            SoftHmac::Sha256(m) => m.update(data),
            SoftHmac::Sha384(m) => m.update(data),
            SoftHmac::Sha512(m) => m.update(data),
            SoftHmac::Ripemd160(m) => m.update(data),
        }
        Ok(())
    }

    fn finalize(&mut self, out: &mut [u8]) -> Result<()> {
        macro_rules! fin {
            ($m:expr) => {{
                let tag = $m.finalize_reset().into_bytes();
                if out.len() > tag.len() {
                    return Err(CryptoError::Invalid);
                }
                out.copy_from_slice(&tag[..out.len()]);
            }};
        }
        match self {
            SoftHmac::Sha1(m) => fin!(m),
            SoftHmac::Sha256(m) => fin!(m),
            SoftHmac::Sha384(m) => fin!(m),
            SoftHmac::Sha512(m) => fin!(m),
            SoftHmac::Ripemd160(m) => fin!(m),
        }
        Ok(())
    }
}

impl CryptoBackend for SoftBackend {
    fn name(&self) -> &'static str { "software" }

    fn hash_size(&self, alg: &str) -> Result<usize> {
        HASH_ALGS
            .iter()
            .find(|(name, _)| *name == alg)
            .map(|(_, size)| *size)
            .ok_or(CryptoError::NotFound)
    }

    fn hash_init(&self, alg: &str) -> Result<Box<dyn HashOp>> {
        let h = match alg {
            "sha1" => SoftHash::Sha1(Sha1::new()),
            "sha256" => SoftHash::Sha256(Sha256::new()),
            "sha384" => SoftHash::Sha384(Sha384::new()),
            "sha512" => SoftHash::Sha512(Sha512::new()),
            "ripemd160" => SoftHash::Ripemd160(Ripemd160::new()),
            _ => return Err(CryptoError::NotFound),
        };
        Ok(Box::new(h))
    }

    fn hmac_init(&self, alg: &str, key: &[u8]) -> Result<Box<dyn HashOp>> {
        // new_from_slice only fails on impossible key lengths, which HMAC
        // does not have.
        let m = match alg {
            "sha1" => SoftHmac::Sha1(Hmac::new_from_slice(key).map_err(|_| CryptoError::Invalid)?),
            "sha256" => {
                SoftHmac::Sha256(Hmac::new_from_slice(key).map_err(|_| CryptoError::Invalid)?)
            }
            "sha384" => {
                SoftHmac::Sha384(Hmac::new_from_slice(key).map_err(|_| CryptoError::Invalid)?)
            }
            "sha512" => {
                SoftHmac::Sha512(Hmac::new_from_slice(key).map_err(|_| CryptoError::Invalid)?)
            }
            "ripemd160" => {
                SoftHmac::Ripemd160(Hmac::new_from_slice(key).map_err(|_| CryptoError::Invalid)?)
            }
            _ => return Err(CryptoError::NotFound),
        };
        Ok(Box::new(m))
    }

    fn pbkdf2(
        &self,
        alg: &str,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        out: &mut [u8],
    ) -> Result<()> {
        if iterations == 0 || out.is_empty() {
            return Err(CryptoError::Invalid);
        }
        match alg {
            "sha1" => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, out),
            "sha256" => pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, out),
            "sha384" => pbkdf2::pbkdf2_hmac::<Sha384>(password, salt, iterations, out),
            "sha512" => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, out),
            "ripemd160" => pbkdf2::pbkdf2_hmac::<Ripemd160>(password, salt, iterations, out),
            _ => return Err(CryptoError::NotFound),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha_digests() {
        let b = SoftBackend;
        let mut h = b.hash_init("sha256").unwrap();
        h.update(b"abc").unwrap();
        let mut out = [0u8; 32];
        h.finalize(&mut out).unwrap();
        assert_eq!(
            out,
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );

        // the context must have reset
        h.update(b"abc").unwrap();
        let mut again = [0u8; 32];
        h.finalize(&mut again).unwrap();
        assert_eq!(out, again);
    }

    #[test]
    fn ripemd160_digest() {
        let mut out = [0u8; 20];
        let b = SoftBackend;
        let mut h = b.hash_init("ripemd160").unwrap();
        h.update(b"abc").unwrap();
        h.finalize(&mut out).unwrap();
        assert_eq!(out, hex!("8eb208f7e05d987a9b044a8e98c6b087f15a0bfc"));
    }

    #[test]
    fn hmac_sha256_rfc4231() {
        let b = SoftBackend;
        let mut m = b.hmac_init("sha256", &[0x0b; 20]).unwrap();
        m.update(b"Hi There").unwrap();
        let mut out = [0u8; 32];
        m.finalize(&mut out).unwrap();
        assert_eq!(
            out,
            hex!("b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7")
        );
    }

    #[test]
    fn hash_sizes() {
        let b = SoftBackend;
        assert_eq!(b.hash_size("sha1").unwrap(), 20);
        assert_eq!(b.hash_size("sha512").unwrap(), 64);
        assert!(b.hash_size("whirlpool").is_err());
    }
}

//! The volume key: the symmetric key the kernel uses on the payload.
//! Never stored in plaintext on disk, never printed, wiped on drop.

use cryptolib::{random_get, RngQuality, RngSource, SecureBuf};

use crate::api::{Error, Result, VOLUME_KEY_SIZES};

pub(crate) struct VolumeKey {
    key: SecureBuf,
}

impl VolumeKey {
    /// Copies `source` if given, else zero-filled.
    pub(crate) fn alloc(len: usize, source: Option<&[u8]>) -> Result<VolumeKey> {
        if !VOLUME_KEY_SIZES.contains(&len) {
            return Err(Error::invalid(format!("unsupported volume key size {}", len)));
        }
        if let Some(src) = source {
            if src.len() != len {
                return Err(Error::invalid("volume key length mismatch"));
            }
            return Ok(VolumeKey { key: SecureBuf::from_slice(src) });
        }
        Ok(VolumeKey { key: SecureBuf::new(len) })
    }

    /// Freshly drawn key-quality randomness; `Io` if the entropy source
    /// fails.
    pub(crate) fn generate(len: usize, source: RngSource) -> Result<VolumeKey> {
        let mut vk = VolumeKey::alloc(len, None)?;
        random_get(&mut vk.key, RngQuality::Key, source)?;
        Ok(vk)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] { &self.key }

    pub(crate) fn len(&self) -> usize { self.key.len() }
}

impl std::fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key bytes must never end up in logs
        write!(f, "VolumeKey({} bytes)", self.key.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_copies_or_zeroes() {
        let vk = VolumeKey::alloc(16, Some(&[7u8; 16])).unwrap();
        assert_eq!(vk.as_bytes(), &[7u8; 16]);
        let vk = VolumeKey::alloc(32, None).unwrap();
        assert_eq!(vk.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(VolumeKey::alloc(17, None).is_err());
        assert!(VolumeKey::alloc(0, None).is_err());
        assert!(VolumeKey::alloc(16, Some(&[0u8; 32])).is_err());
    }

    #[test]
    fn generate_is_random() {
        let a = VolumeKey::generate(32, RngSource::Urandom).unwrap();
        let b = VolumeKey::generate(32, RngSource::Urandom).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn debug_does_not_leak() {
        let vk = VolumeKey::alloc(16, Some(&[0xAB; 16])).unwrap();
        let s = format!("{:?}", vk);
        assert!(!s.contains("ab"));
        assert!(s.contains("16"));
    }
}

//! Passphrase hashing for header-less (plain) mappings.

use cryptolib::{backend, SecureBuf};

use crate::api::{Error, Result};

/// Hash a passphrase into `key_size` bytes of mapping key.
///
/// The hash spec is `"name[:len]"`; with `len` given and smaller than
/// `key_size` the tail is zero-padded. Keys longer than one digest are
/// built from rounds hashing `'A' * round || passphrase` -- the leading
/// 'A' run is a historical quirk inherited from hashalot, and has to stay
/// byte-for-byte or existing plain volumes stop opening.
pub(crate) fn plain_hash(hash_spec: &str, key_size: usize, passphrase: &[u8]) -> Result<SecureBuf> {
    if key_size == 0 {
        return Err(Error::invalid("zero key size"));
    }
    let (hash_name, hash_len) = match hash_spec.split_once(':') {
        Some((name, len)) => {
            let len: usize = len
                .parse()
                .map_err(|_| Error::invalid(format!("bad hash length in \"{}\"", hash_spec)))?;
            if len == 0 || len > key_size {
                return Err(Error::invalid(format!(
                    "hash length {} incompatible with key size {}",
                    len, key_size
                )));
            }
            (name, len)
        }
        None => (hash_spec, key_size),
    };

    let digest_size = backend().hash_size(hash_name).map_err(Error::from)?;
    let mut key = SecureBuf::new(key_size);

    let mut remaining = hash_len;
    let mut round = 0usize;
    while remaining > 0 {
        let mut h = backend().hash_init(hash_name)?;
        for _ in 0..round {
            h.update(b"A")?;
        }
        h.update(passphrase)?;
        let take = remaining.min(digest_size);
        let off = hash_len - remaining;
        h.finalize(&mut key[off..off + take])?;
        remaining -= take;
        round += 1;
    }
    // tail past hash_len stays zero
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // sha256("password")
    const SHA256_PASSWORD: [u8; 32] =
        hex!("5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8");
    // sha256("Apassword")
    const SHA256_A_PASSWORD: [u8; 32] =
        hex!("9fff15cdec1f0b4f804c2217cce94ad7194ebc18744892bc7bb52be9fd7bb942");

    #[test]
    fn single_round_equals_digest() {
        let key = plain_hash("sha256", 32, b"password").unwrap();
        assert_eq!(&key[..], &SHA256_PASSWORD);
    }

    #[test]
    fn second_round_prepends_a() {
        let key = plain_hash("sha256", 48, b"password").unwrap();
        assert_eq!(&key[..32], &SHA256_PASSWORD);
        assert_eq!(&key[32..48], &SHA256_A_PASSWORD[..16]);
    }

    #[test]
    fn explicit_length_zero_pads() {
        let key = plain_hash("sha256:20", 32, b"password").unwrap();
        assert_eq!(&key[..20], &SHA256_PASSWORD[..20]);
        assert_eq!(&key[20..], &[0u8; 12]);
    }

    #[test]
    fn short_key_truncates_digest() {
        let key = plain_hash("sha256", 16, b"password").unwrap();
        assert_eq!(&key[..], &SHA256_PASSWORD[..16]);
    }

    #[test]
    fn rejects_oversized_explicit_length() {
        assert!(plain_hash("sha256:64", 32, b"password").is_err());
        assert!(plain_hash("sha256:x", 32, b"password").is_err());
        assert!(plain_hash("nosuchhash", 32, b"password").is_err());
    }
}

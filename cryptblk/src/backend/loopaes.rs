//! loop-AES compatible keyfile handling.
//!
//! A loop-AES keyfile is a list of newline-separated passphrase records:
//! one record for single-key mode, 64 for multi-key-v2, 65 for
//! multi-key-v3 (the last record seeds the IV computation). Each record is
//! hashed to the output key length and the first byte of every hashed
//! record is XORed with a per-mode tweak constant. GPG-wrapped keyfiles
//! are not handled here; callers have to pipe them through gpg first.

use cryptolib::{backend, SecureBuf};

use crate::api::{Error, Result};

pub(crate) const LOOPAES_KEYS_MAX: usize = 65;

fn default_hash(key_len_output: usize) -> Option<&'static str> {
    match key_len_output {
        16 => Some("sha256"),
        24 => Some("sha384"),
        32 => Some("sha512"),
        _ => None,
    }
}

fn tweak(keys_count: usize) -> u8 {
    match keys_count {
        64 => 0x55,
        65 => 0xF4,
        _ => 0x00,
    }
}

fn is_gpg_armored(buffer: &[u8]) -> bool {
    let probe = &buffer[..buffer.len().min(100)];
    probe.windows(17).any(|w| w == b"BEGIN PGP MESSAGE")
}

/// Parse and hash a loop-AES keyfile. Returns the concatenated mapping key
/// (`keys_count * key_len_output` bytes) and the record count.
pub(crate) fn parse_keyfile(
    buffer: &[u8],
    hash_override: Option<&str>,
    key_len_output: usize,
) -> Result<(SecureBuf, usize)> {
    if buffer.is_empty() {
        return Err(Error::invalid("empty keyfile"));
    }
    if is_gpg_armored(buffer) {
        return Err(Error::invalid(
            "GPG encrypted keyfile detected; decrypt it externally and pass the plaintext",
        ));
    }

    // records are runs of non-EOL bytes; CR and LF both terminate
    let mut keys: Vec<&[u8]> = Vec::new();
    for record in buffer.split(|&b| b == b'\n' || b == b'\r') {
        if record.is_empty() {
            continue;
        }
        if keys.len() == LOOPAES_KEYS_MAX {
            return Err(Error::invalid("incompatible loop-AES keyfile (too many keys)"));
        }
        keys.push(record);
    }

    let keys_count = keys.len();
    if !matches!(keys_count, 1 | 64 | 65) {
        return Err(Error::invalid(format!(
            "incompatible loop-AES keyfile ({} keys)",
            keys_count
        )));
    }
    let key_len = keys[0].len();
    if key_len == 0 || keys.iter().any(|k| k.len() != key_len) {
        return Err(Error::invalid("incompatible loop-AES keyfile (uneven key lengths)"));
    }

    let hash_name = match hash_override {
        Some(h) => h,
        None => default_hash(key_len_output).ok_or_else(|| {
            Error::invalid(format!("no default keyfile hash for key size {}", key_len_output))
        })?,
    };

    let tw = tweak(keys_count);
    let mut vk = SecureBuf::new(keys_count * key_len_output);
    for (i, record) in keys.iter().enumerate() {
        let out = &mut vk[i * key_len_output..(i + 1) * key_len_output];
        let mut h = backend().hash_init(hash_name)?;
        h.update(record)?;
        h.finalize(out)?;
        out[0] ^= tw;
    }
    Ok((vk, keys_count))
}

/// Compose the kernel mapping cipher for a parsed keyfile: single-key runs
/// CBC with plain64 IVs, multi-key uses the loop-AES LMK IV scheme.
pub(crate) fn compose_cipher(base_cipher: &str, keys_count: usize) -> String {
    if keys_count == 1 {
        format!("{}-cbc-plain64", base_cipher)
    } else {
        format!("{}:{}-cbc-lmk", base_cipher, 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptolib::hash_once;

    fn keyfile(lines: usize, line: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        for _ in 0..lines {
            buf.extend_from_slice(line);
            buf.push(b'\n');
        }
        buf
    }

    #[test]
    fn sixty_five_keys_get_the_v3_tweak() {
        let buf = keyfile(65, b"0123456789abcdef0123456789abcdef");
        let (vk, count) = parse_keyfile(&buf, None, 32).unwrap();
        assert_eq!(count, 65);
        assert_eq!(vk.len(), 65 * 32);

        let mut expected = [0u8; 32];
        hash_once("sha512", b"0123456789abcdef0123456789abcdef", &mut expected).unwrap();
        for i in 0..65 {
            let rec = &vk[i * 32..(i + 1) * 32];
            assert_eq!(rec[0], expected[0] ^ 0xF4);
            assert_eq!(&rec[1..], &expected[1..]);
        }
    }

    #[test]
    fn sixty_four_keys_get_the_v2_tweak() {
        let buf = keyfile(64, b"swordfish-swordfish");
        let (vk, count) = parse_keyfile(&buf, None, 16).unwrap();
        assert_eq!(count, 64);
        let mut expected = [0u8; 16];
        hash_once("sha256", b"swordfish-swordfish", &mut expected).unwrap();
        assert_eq!(vk[0], expected[0] ^ 0x55);
    }

    #[test]
    fn single_key_is_untweaked_and_order_preserved() {
        let (vk, count) = parse_keyfile(b"only-one-key\n", None, 32).unwrap();
        assert_eq!(count, 1);
        let mut expected = [0u8; 32];
        hash_once("sha512", b"only-one-key", &mut expected).unwrap();
        assert_eq!(&vk[..], &expected);
    }

    #[test]
    fn crlf_and_hash_override() {
        // the override hash must cover the key length (sha1 -> 16 is fine,
        // sha1 -> 32 would be refused by the provider)
        let (vk, _) = parse_keyfile(b"key-a\r\n", Some("sha1"), 16).unwrap();
        let mut expected = [0u8; 16];
        hash_once("sha1", b"key-a", &mut expected).unwrap();
        assert_eq!(&vk[..], &expected);
        assert!(parse_keyfile(b"key-a\r\n", Some("sha1"), 32).is_err());
    }

    #[test]
    fn rejects_bad_shapes() {
        // wrong count
        assert!(parse_keyfile(&keyfile(2, b"abc"), None, 32).is_err());
        assert!(parse_keyfile(&keyfile(66, b"abc"), None, 32).is_err());
        // uneven lengths
        assert!(parse_keyfile(b"abc\nabcd\n", None, 32).is_err());
        // gpg armor
        assert!(parse_keyfile(b"-----BEGIN PGP MESSAGE-----\n...", None, 32).is_err());
        // empty
        assert!(parse_keyfile(b"", None, 32).is_err());
    }

    #[test]
    fn cipher_composition() {
        assert_eq!(compose_cipher("aes", 1), "aes-cbc-plain64");
        assert_eq!(compose_cipher("aes", 64), "aes:64-cbc-lmk");
        assert_eq!(compose_cipher("aes", 65), "aes:64-cbc-lmk");
    }
}

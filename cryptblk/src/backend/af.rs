//! Anti-forensic information splitter.
//!
//! A secret of L bytes is expanded to L*N bytes such that the loss of any
//! single stripe makes the secret unrecoverable: stripes 0..N-2 are pure
//! randomness, folded together through a hash-based diffuser, and the last
//! stripe is the running fold XORed with the secret. Merging replays the
//! fold. Keyslot destruction then only has to overwrite the (large,
//! sector-aligned) stripe area to kill the key, even on media that remap
//! or journal writes.

use cryptolib::{backend, random_get, RngQuality, RngSource, SecureBuf};

use crate::api::{Error, Result};

/// Diffuse `block` in place: hash digest-sized chunks, each prefixed with
/// its big-endian chunk index, the last chunk truncated to fit.
fn diffuse(block: &mut [u8], hash: &str) -> Result<()> {
    let digest_size = backend().hash_size(hash).map_err(Error::from)?;
    let mut h = backend().hash_init(hash)?;
    for (i, chunk) in block.chunks_mut(digest_size).enumerate() {
        h.update(&(i as u32).to_be_bytes())?;
        h.update(chunk)?;
        let len = chunk.len();
        h.finalize(&mut chunk[..len])?;
    }
    Ok(())
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

/// Expand `src` into `src.len() * stripes` bytes of split material.
pub(crate) fn split(src: &[u8], stripes: usize, hash: &str) -> Result<SecureBuf> {
    if stripes < 2 || src.is_empty() {
        return Err(Error::invalid("AF split needs at least 2 stripes"));
    }
    let blocksize = src.len();
    let mut dst = SecureBuf::new(blocksize * stripes);
    let mut fold = SecureBuf::new(blocksize);

    for i in 0..stripes - 1 {
        let stripe = &mut dst[i * blocksize..(i + 1) * blocksize];
        random_get(stripe, RngQuality::Normal, RngSource::Urandom)?;
        xor_into(&mut fold, stripe);
        diffuse(&mut fold, hash)?;
    }
    let last = &mut dst[(stripes - 1) * blocksize..];
    last.copy_from_slice(src);
    xor_into(last, &fold);
    Ok(dst)
}

/// Recover the secret from split material; inverse of [`split`] given the
/// same stripe count and hash.
pub(crate) fn merge(src: &[u8], blocksize: usize, stripes: usize, hash: &str) -> Result<SecureBuf> {
    if stripes < 2 || blocksize == 0 || src.len() != blocksize * stripes {
        return Err(Error::invalid("AF merge size mismatch"));
    }
    let mut fold = SecureBuf::new(blocksize);
    for i in 0..stripes - 1 {
        xor_into(&mut fold, &src[i * blocksize..(i + 1) * blocksize]);
        diffuse(&mut fold, hash)?;
    }
    let mut out = SecureBuf::from_slice(&src[(stripes - 1) * blocksize..]);
    xor_into(&mut out, &fold);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_inverts_split() {
        for &(len, stripes) in &[(16usize, 2usize), (32, 7), (32, 4000), (64, 100)] {
            let secret: Vec<u8> = (0..len).map(|i| i as u8 ^ 0x5a).collect();
            let m = split(&secret, stripes, "sha256").unwrap();
            assert_eq!(m.len(), len * stripes);
            let back = merge(&m, len, stripes, "sha256").unwrap();
            assert_eq!(&back[..], &secret[..]);
        }
    }

    #[test]
    fn merge_inverts_split_sha1() {
        // digest shorter than the block exercises the multi-chunk diffuser
        let secret = [0xc3u8; 48];
        let m = split(&secret, 10, "sha1").unwrap();
        let back = merge(&m, 48, 10, "sha1").unwrap();
        assert_eq!(&back[..], &secret[..]);
    }

    #[test]
    fn zeroing_any_stripe_destroys_secret() {
        let secret = [0x11u8; 32];
        let stripes = 16;
        let m = split(&secret, stripes, "sha256").unwrap();
        for kill in 0..stripes {
            let mut damaged = m.to_vec();
            damaged[kill * 32..(kill + 1) * 32].iter_mut().for_each(|b| *b = 0);
            let back = merge(&damaged, 32, stripes, "sha256").unwrap();
            assert_ne!(&back[..], &secret[..], "stripe {} did not diffuse", kill);
        }
    }

    #[test]
    fn split_is_randomized() {
        let secret = [9u8; 16];
        let a = split(&secret, 4, "sha256").unwrap();
        let b = split(&secret, 4, "sha256").unwrap();
        assert_ne!(&a[..], &b[..]);
    }

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(split(&[1u8; 16], 1, "sha256").is_err());
        assert!(merge(&[0u8; 64], 16, 3, "sha256").is_err());
    }
}

//! Two-tier CSPRNG.
//!
//! `Normal` quality always reads /dev/urandom and is used for bulk
//! randomness (AF stripes, wipe passes). `Key` quality reads the configured
//! source; when the caller selects `Random`, long-term key generation
//! blocks until the kernel pool has entropy rather than degrading quietly.

use std::fs::File;
use std::io::Read;

use crate::Result;

const URANDOM_PATH: &str = "/dev/urandom";
const RANDOM_PATH: &str = "/dev/random";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngQuality {
    /// Bulk randomness; never blocks.
    Normal,
    /// Long-term key material; honors the configured source.
    Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RngSource {
    #[default]
    Urandom,
    Random,
}

/// Fill `buf` from the kernel RNG. Short reads are retried; /dev/random
/// may block for an arbitrarily long time while the pool refills.
pub fn random_get(buf: &mut [u8], quality: RngQuality, source: RngSource) -> Result<()> {
    let path = match (quality, source) {
        (RngQuality::Normal, _) | (RngQuality::Key, RngSource::Urandom) => URANDOM_PATH,
        (RngQuality::Key, RngSource::Random) => RANDOM_PATH,
    };
    let mut f = File::open(path)?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "random source returned no data",
            )
            .into());
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_buffer() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        random_get(&mut a, RngQuality::Normal, RngSource::Urandom).unwrap();
        random_get(&mut b, RngQuality::Normal, RngSource::Urandom).unwrap();
        // 64 zero bytes twice in a row means the RNG is not an RNG
        assert_ne!(a, [0u8; 64]);
        assert_ne!(a, b);
    }
}

//! Sector-granular block cipher for keyslot material.
//!
//! This path encrypts only the anti-forensically expanded keyslot material,
//! never the payload (the kernel mapping owns that), so it is implemented
//! in software only. Data is processed in 512-byte sectors; the IV/tweak of
//! each sector is derived from its logical index within the region, in the
//! same way the kernel crypt target would derive it, so material written
//! here can be read back by either side.
//!
//! Supported: cipher `aes` with chain modes `ecb`, `cbc`, `xts` and IV
//! generators `plain`, `plain64`, `essiv:<hash>` (e.g. "xts-plain64",
//! "cbc-essiv:sha256"). Anything else fails before touching data.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{
    block_padding::NoPadding, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    KeyInit, KeyIvInit,
};
use aes::{Aes128, Aes192, Aes256};
use xts_mode::Xts128;
use zeroize::Zeroize;

use crate::{CryptoError, Result};

pub const SECTOR_SIZE: usize = 512;
const BLOCK: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum IvGen {
    None,
    /// 32-bit sector index, little-endian, zero padded.
    Plain,
    /// 64-bit sector index, little-endian, zero padded.
    Plain64,
    /// Sector index encrypted under the hash of the key.
    Essiv(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    Ecb,
    Cbc,
    Xts,
}

fn parse_mode(mode: &str) -> Result<(Chain, IvGen)> {
    let (chain, ivspec) = match mode.split_once('-') {
        Some((c, iv)) => (c, Some(iv)),
        None => (mode, None),
    };
    let chain = match chain {
        "ecb" => Chain::Ecb,
        "cbc" => Chain::Cbc,
        "xts" => Chain::Xts,
        _ => return Err(CryptoError::NotFound),
    };
    let iv = match ivspec {
        None | Some("null") => IvGen::None,
        Some("plain") => IvGen::Plain,
        Some("plain64") => IvGen::Plain64,
        Some(s) => match s.split_once(':') {
            Some(("essiv", hash)) => IvGen::Essiv(hash.to_string()),
            _ => return Err(CryptoError::NotFound),
        },
    };
    if chain == Chain::Ecb && iv != IvGen::None {
        return Err(CryptoError::NotFound);
    }
    Ok((chain, iv))
}

fn iv_for_sector(gen: &IvGen, essiv: Option<&EssivState>, sector: u64) -> [u8; BLOCK] {
    let mut iv = [0u8; BLOCK];
    match gen {
        IvGen::None => {}
        IvGen::Plain => iv[..4].copy_from_slice(&(sector as u32).to_le_bytes()),
        IvGen::Plain64 => iv[..8].copy_from_slice(&sector.to_le_bytes()),
        IvGen::Essiv(_) => {
            iv[..8].copy_from_slice(&sector.to_le_bytes());
            // encrypt the sector number under the salt key
            essiv.expect("essiv state").encrypt(&mut iv);
        }
    }
    iv
}

/// ESSIV state: AES keyed with H(key), key size picked by the digest size.
enum EssivState {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl EssivState {
    fn new(hash: &str, key: &[u8]) -> Result<EssivState> {
        let digest_len = crate::backend().hash_size(hash)?;
        let mut salt = [0u8; crate::MAX_DIGEST_SIZE];
        crate::hash_once(hash, key, &mut salt[..digest_len])?;
        let state = match digest_len {
            16 => EssivState::Aes128(Aes128::new(GenericArray::from_slice(&salt[..16]))),
            24 => EssivState::Aes192(Aes192::new(GenericArray::from_slice(&salt[..24]))),
            32 => EssivState::Aes256(Aes256::new(GenericArray::from_slice(&salt[..32]))),
            _ => return Err(CryptoError::NotFound),
        };
        salt.zeroize();
        Ok(state)
    }

    fn encrypt(&self, block: &mut [u8; BLOCK]) {
        let ga = GenericArray::from_mut_slice(block);
        match self {
            EssivState::Aes128(c) => c.encrypt_block(ga),
            EssivState::Aes192(c) => c.encrypt_block(ga),
            EssivState::Aes256(c) => c.encrypt_block(ga),
        }
    }
}

fn cbc_area<C>(key: &[u8], gen: &IvGen, essiv: Option<&EssivState>, first_sector: u64, data: &mut [u8], encrypt: bool) -> Result<()>
where
    C: BlockEncryptMut + BlockDecryptMut + aes::cipher::BlockCipher + KeyInit,
{
    for (i, sector) in data.chunks_mut(SECTOR_SIZE).enumerate() {
        let iv = iv_for_sector(gen, essiv, first_sector + i as u64);
        let n = sector.len();
        if encrypt {
            cbc::Encryptor::<C>::new_from_slices(key, &iv)
                .map_err(|_| CryptoError::Invalid)?
                .encrypt_padded_mut::<NoPadding>(sector, n)
                .map_err(|_| CryptoError::Invalid)?;
        } else {
            cbc::Decryptor::<C>::new_from_slices(key, &iv)
                .map_err(|_| CryptoError::Invalid)?
                .decrypt_padded_mut::<NoPadding>(sector)
                .map_err(|_| CryptoError::Invalid)?;
        }
    }
    Ok(())
}

fn ecb_area<C>(key: &[u8], data: &mut [u8], encrypt: bool) -> Result<()>
where
    C: BlockEncrypt + BlockDecrypt + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::Invalid)?;
    for block in data.chunks_mut(BLOCK) {
        let ga = GenericArray::from_mut_slice(block);
        if encrypt { cipher.encrypt_block(ga) } else { cipher.decrypt_block(ga) }
    }
    Ok(())
}

fn xts_area<C>(key: &[u8], gen: &IvGen, first_sector: u64, data: &mut [u8], encrypt: bool) -> Result<()>
where
    C: BlockEncrypt + BlockDecrypt + KeyInit + aes::cipher::BlockCipher,
{
    let half = key.len() / 2;
    let c1 = C::new_from_slice(&key[..half]).map_err(|_| CryptoError::Invalid)?;
    let c2 = C::new_from_slice(&key[half..]).map_err(|_| CryptoError::Invalid)?;
    let xts = Xts128::<C>::new(c1, c2);
    let plain32 = matches!(gen, IvGen::Plain);
    let tweak = |sector: u128| -> [u8; BLOCK] {
        let mut t = [0u8; BLOCK];
        // the kernel's plain IV wraps at 32 bits; plain64 does not
        let s = if plain32 { sector as u32 as u128 } else { sector };
        t.copy_from_slice(&s.to_le_bytes());
        t
    };
    if encrypt {
        xts.encrypt_area(data, SECTOR_SIZE, first_sector as u128, tweak);
    } else {
        xts.decrypt_area(data, SECTOR_SIZE, first_sector as u128, tweak);
    }
    Ok(())
}

fn crypt_sectors(
    name: &str,
    mode: &str,
    key: &[u8],
    first_sector: u64,
    data: &mut [u8],
    encrypt: bool,
) -> Result<()> {
    if name != "aes" {
        return Err(CryptoError::NotFound);
    }
    if data.len() % SECTOR_SIZE != 0 {
        return Err(CryptoError::Invalid);
    }
    let (chain, gen) = parse_mode(mode)?;

    let essiv = match &gen {
        IvGen::Essiv(hash) => Some(EssivState::new(hash, key)?),
        _ => None,
    };

    match chain {
        Chain::Ecb => match key.len() {
            16 => ecb_area::<Aes128>(key, data, encrypt),
            24 => ecb_area::<Aes192>(key, data, encrypt),
            32 => ecb_area::<Aes256>(key, data, encrypt),
            _ => Err(CryptoError::Invalid),
        },
        Chain::Cbc => match key.len() {
            16 => cbc_area::<Aes128>(key, &gen, essiv.as_ref(), first_sector, data, encrypt),
            24 => cbc_area::<Aes192>(key, &gen, essiv.as_ref(), first_sector, data, encrypt),
            32 => cbc_area::<Aes256>(key, &gen, essiv.as_ref(), first_sector, data, encrypt),
            _ => Err(CryptoError::Invalid),
        },
        Chain::Xts => match key.len() {
            32 => xts_area::<Aes128>(key, &gen, first_sector, data, encrypt),
            48 => xts_area::<Aes192>(key, &gen, first_sector, data, encrypt),
            64 => xts_area::<Aes256>(key, &gen, first_sector, data, encrypt),
            _ => Err(CryptoError::Invalid),
        },
    }
}

/// Encrypt `data` in place. `first_sector` is the logical index of
/// `data[0]`'s sector within the region (IV derivation only, not a device
/// offset).
pub fn cipher_encrypt(
    name: &str,
    mode: &str,
    key: &[u8],
    first_sector: u64,
    data: &mut [u8],
) -> Result<()> {
    crypt_sectors(name, mode, key, first_sector, data, true)
}

/// Inverse of [`cipher_encrypt`].
pub fn cipher_decrypt(
    name: &str,
    mode: &str,
    key: &[u8],
    first_sector: u64,
    data: &mut [u8],
) -> Result<()> {
    crypt_sectors(name, mode, key, first_sector, data, false)
}

/// Key sizes (bytes) the named cipher/mode pair accepts.
pub fn cipher_key_sizes(name: &str, mode: &str) -> Result<&'static [usize]> {
    if name != "aes" {
        return Err(CryptoError::NotFound);
    }
    match parse_mode(mode)? {
        (Chain::Xts, _) => Ok(&[32, 48, 64]),
        _ => Ok(&[16, 24, 32]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn xts_roundtrip_and_sector_sensitivity() {
        let key = [0x42u8; 64];
        let mut data = vec![7u8; SECTOR_SIZE * 3];
        let orig = data.clone();
        cipher_encrypt("aes", "xts-plain64", &key, 0, &mut data).unwrap();
        assert_ne!(data, orig);

        let mut wrong = data.clone();
        cipher_decrypt("aes", "xts-plain64", &key, 1, &mut wrong).unwrap();
        assert_ne!(wrong, orig);

        cipher_decrypt("aes", "xts-plain64", &key, 0, &mut data).unwrap();
        assert_eq!(data, orig);
    }

    #[test]
    fn cbc_essiv_roundtrip() {
        let key = [0x13u8; 32];
        let mut data = vec![0xa5u8; SECTOR_SIZE * 2];
        let orig = data.clone();
        cipher_encrypt("aes", "cbc-essiv:sha256", &key, 5, &mut data).unwrap();
        assert_ne!(data, orig);
        cipher_decrypt("aes", "cbc-essiv:sha256", &key, 5, &mut data).unwrap();
        assert_eq!(data, orig);
    }

    #[test]
    fn cbc_plain_known_iv() {
        // sector 0 of cbc-plain and cbc-plain64 share an all-zero IV, so
        // their first sectors must agree; sector 2^32 would not.
        let key = [1u8; 16];
        let mut a = vec![0u8; SECTOR_SIZE];
        let mut b = vec![0u8; SECTOR_SIZE];
        cipher_encrypt("aes", "cbc-plain", &key, 0, &mut a).unwrap();
        cipher_encrypt("aes", "cbc-plain64", &key, 0, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ecb_single_block_vector() {
        // FIPS-197 AES-128 vector
        let key = hex!("000102030405060708090a0b0c0d0e0f");
        let mut data = vec![0u8; SECTOR_SIZE];
        data[..16].copy_from_slice(&hex!("00112233445566778899aabbccddeeff"));
        cipher_encrypt("aes", "ecb", &key, 0, &mut data).unwrap();
        assert_eq!(&data[..16], hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));
    }

    #[test]
    fn rejects_unknown_cipher_and_mode() {
        let mut data = vec![0u8; SECTOR_SIZE];
        assert!(matches!(
            cipher_encrypt("serpent", "xts-plain64", &[0u8; 64], 0, &mut data),
            Err(CryptoError::NotFound)
        ));
        assert!(matches!(
            cipher_encrypt("aes", "ctr-plain64", &[0u8; 32], 0, &mut data),
            Err(CryptoError::NotFound)
        ));
        assert!(matches!(
            cipher_encrypt("aes", "xts-plain64", &[0u8; 64], 0, &mut vec![1u8; 100]),
            Err(CryptoError::Invalid)
        ));
    }
}

//! Bit-exact codec for the LUKS1 on-disk header.
//!
//! The header is 1024 bytes at offset 0 of the metadata device, all
//! multi-byte integers big-endian, strings zero-padded and zero-terminated
//! when shorter than their field. Layout:
//!
//! ```text
//! offset len  field
//!      0   6  magic "LUKS" 0xba 0xbe
//!      6   2  version (1)
//!      8  32  cipher name      ("aes")
//!     40  32  cipher mode      ("xts-plain64", "cbc-essiv:sha256", ...)
//!     72  32  hash spec        (PBKDF2 + AF + MK digest hash)
//!    104   4  payload offset, sectors
//!    108   4  key bytes
//!    112  20  MK digest        PBKDF2(mk, salt, iter) truncated
//!    132  32  MK digest salt
//!    164   4  MK digest iterations
//!    168  40  uuid, ASCII with dashes
//!    208 8*48 keyslots: state, iterations, salt[32], material offset, stripes
//! ```
//!
//! Bytes 592..1024 are zero. Keyslot material regions are allocated at
//! fixed, 8-sector-aligned offsets computed from the key size, so the
//! allocator is deterministic: a destroyed slot's region is simply reused
//! by the next add to the same index.

use std::fs::File;
use std::os::unix::fs::FileExt;

use cryptolib::{backend, random_get, RngQuality, RngSource};
use subtle::ConstantTimeEq;

use crate::api::{Error, KeyslotInfo, Result, MAX_KEYSLOTS, VOLUME_KEY_SIZES};
use crate::backend::volumekey::VolumeKey;
use crate::backend::{div_round_up, round_up, SECTOR_SIZE};

pub(crate) const LUKS_MAGIC: [u8; 6] = [b'L', b'U', b'K', b'S', 0xba, 0xbe];
pub(crate) const LUKS_VERSION: u16 = 1;
pub(crate) const LUKS_HDR_SIZE: usize = 1024;
pub(crate) const LUKS_STRIPES: u32 = 4000;
pub(crate) const LUKS_DIGEST_SIZE: usize = 20;
pub(crate) const LUKS_SALT_SIZE: usize = 32;
const LUKS_UUID_LEN: usize = 40;

const KEY_DISABLED: u32 = 0x0000_DEAD;
const KEY_ENABLED: u32 = 0x00AC_71F3;

/// Keyslot material regions start and stride on this alignment, sectors.
const ALIGN_KEYSLOTS: u64 = 8;
/// Default payload alignment, sectors (1 MiB).
pub(crate) const DEFAULT_DATA_ALIGNMENT: u64 = 2048;
/// Sectors consumed by the header itself.
const HDR_SECTORS: u64 = div_round_up(LUKS_HDR_SIZE as u64, SECTOR_SIZE as u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyslotEntry {
    pub(crate) active: u32,
    pub(crate) iterations: u32,
    pub(crate) salt: [u8; LUKS_SALT_SIZE],
    pub(crate) material_offset: u32,
    pub(crate) stripes: u32,
}

impl KeyslotEntry {
    pub(crate) fn is_enabled(&self) -> bool { self.active == KEY_ENABLED }

    pub(crate) fn disable(&mut self) {
        self.active = KEY_DISABLED;
        self.iterations = 0;
        self.salt = [0u8; LUKS_SALT_SIZE];
        self.material_offset = 0;
    }

    pub(crate) fn enable(&mut self, iterations: u32, salt: [u8; LUKS_SALT_SIZE], material_offset: u32) {
        self.active = KEY_ENABLED;
        self.iterations = iterations;
        self.salt = salt;
        self.material_offset = material_offset;
        self.stripes = LUKS_STRIPES;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Luks1Header {
    pub(crate) cipher_name: String,
    pub(crate) cipher_mode: String,
    pub(crate) hash_spec: String,
    pub(crate) payload_offset: u32,
    pub(crate) key_bytes: u32,
    pub(crate) mk_digest: [u8; LUKS_DIGEST_SIZE],
    pub(crate) mk_digest_salt: [u8; LUKS_SALT_SIZE],
    pub(crate) mk_digest_iter: u32,
    pub(crate) uuid: String,
    pub(crate) keyslots: [KeyslotEntry; MAX_KEYSLOTS],
}

/// Sectors of AF-split material one keyslot needs for `key_bytes`.
pub(crate) fn af_sectors(key_bytes: u32) -> u64 {
    div_round_up(key_bytes as u64 * LUKS_STRIPES as u64, SECTOR_SIZE as u64)
}

fn slot_stride(key_bytes: u32) -> u64 { round_up(af_sectors(key_bytes), ALIGN_KEYSLOTS) }

/// Fixed material offset of a slot, sectors from device start.
pub(crate) fn slot_material_offset(key_bytes: u32, slot: usize) -> u64 {
    round_up(HDR_SECTORS, ALIGN_KEYSLOTS) + slot as u64 * slot_stride(key_bytes)
}

fn get_str(buf: &[u8], what: &str) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Corrupt(format!("{} field is not terminated", what)))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| Error::Corrupt(format!("{} field is not ASCII", what)))?;
    Ok(s.to_string())
}

fn put_str(buf: &mut [u8], s: &str, what: &str) -> Result<()> {
    let bytes = s.as_bytes();
    // shorter than the field so there is room for the terminator
    if bytes.len() >= buf.len() {
        return Err(Error::invalid(format!("{} \"{}\" too long", what, s)));
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().expect("u32 slice"))
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

impl Luks1Header {
    /// Assemble a fresh header for `format`. Keyslots all start disabled
    /// but the layout (material offsets, payload offset) is fixed here,
    /// once, from the key size and alignment.
    pub(crate) fn generate(
        cipher_name: &str,
        cipher_mode: &str,
        hash_spec: &str,
        key_bytes: u32,
        uuid: Option<&str>,
        data_alignment: u64,
        vk: &VolumeKey,
        mk_digest_iter: u32,
    ) -> Result<Luks1Header> {
        if !VOLUME_KEY_SIZES.contains(&(key_bytes as usize)) {
            return Err(Error::invalid(format!("unsupported key size {}", key_bytes)));
        }
        if vk.len() != key_bytes as usize {
            return Err(Error::invalid("volume key does not match declared key size"));
        }
        backend().hash_size(hash_spec).map_err(|_| {
            Error::NotFound(format!("hash {} not available", hash_spec))
        })?;

        let alignment = if data_alignment == 0 { DEFAULT_DATA_ALIGNMENT } else { data_alignment };
        let stride = slot_stride(key_bytes);
        let first = round_up(HDR_SECTORS, ALIGN_KEYSLOTS);
        let payload_offset = round_up(first + MAX_KEYSLOTS as u64 * stride, alignment);
        if payload_offset > u32::MAX as u64 {
            return Err(Error::invalid("data alignment pushes payload out of range"));
        }

        let uuid = match uuid {
            Some(u) => {
                if u.is_empty() || u.len() >= LUKS_UUID_LEN || !u.is_ascii() {
                    return Err(Error::invalid(format!("malformed UUID \"{}\"", u)));
                }
                u.to_string()
            }
            None => uuid::Uuid::new_v4().hyphenated().to_string(),
        };

        let mut mk_digest_salt = [0u8; LUKS_SALT_SIZE];
        random_get(&mut mk_digest_salt, RngQuality::Normal, RngSource::Urandom)?;
        let mut mk_digest = [0u8; LUKS_DIGEST_SIZE];
        backend().pbkdf2(hash_spec, vk.as_bytes(), &mk_digest_salt, mk_digest_iter, &mut mk_digest)?;

        let mut keyslots = [KeyslotEntry {
            active: KEY_DISABLED,
            iterations: 0,
            salt: [0u8; LUKS_SALT_SIZE],
            material_offset: 0,
            stripes: LUKS_STRIPES,
        }; MAX_KEYSLOTS];
        for (i, ks) in keyslots.iter_mut().enumerate() {
            ks.material_offset = slot_material_offset(key_bytes, i) as u32;
        }

        let hdr = Luks1Header {
            cipher_name: cipher_name.to_string(),
            cipher_mode: cipher_mode.to_string(),
            hash_spec: hash_spec.to_string(),
            payload_offset: payload_offset as u32,
            key_bytes,
            mk_digest,
            mk_digest_salt,
            mk_digest_iter,
            uuid,
            keyslots,
        };
        // catches over-long strings before anything hits the disk
        hdr.to_bytes()?;
        Ok(hdr)
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Result<Luks1Header> {
        if buf.len() < LUKS_HDR_SIZE {
            return Err(Error::invalid("short header buffer"));
        }
        if buf[0..6] != LUKS_MAGIC {
            return Err(Error::NotLuks);
        }
        let version = u16::from_be_bytes(buf[6..8].try_into().expect("u16 slice"));
        if version != LUKS_VERSION {
            return Err(Error::Unsupported(format!("LUKS header version {}", version)));
        }

        let mut keyslots = [KeyslotEntry {
            active: KEY_DISABLED,
            iterations: 0,
            salt: [0u8; LUKS_SALT_SIZE],
            material_offset: 0,
            stripes: LUKS_STRIPES,
        }; MAX_KEYSLOTS];
        for (i, ks) in keyslots.iter_mut().enumerate() {
            let off = 208 + i * 48;
            ks.active = get_u32(buf, off);
            ks.iterations = get_u32(buf, off + 4);
            ks.salt.copy_from_slice(&buf[off + 8..off + 40]);
            ks.material_offset = get_u32(buf, off + 40);
            ks.stripes = get_u32(buf, off + 44);
            if ks.active != KEY_DISABLED && ks.active != KEY_ENABLED {
                return Err(Error::Corrupt(format!("keyslot {} has unknown state", i)));
            }
        }

        let mut mk_digest = [0u8; LUKS_DIGEST_SIZE];
        mk_digest.copy_from_slice(&buf[112..132]);
        let mut mk_digest_salt = [0u8; LUKS_SALT_SIZE];
        mk_digest_salt.copy_from_slice(&buf[132..164]);

        let hdr = Luks1Header {
            cipher_name: get_str(&buf[8..40], "cipher name")?,
            cipher_mode: get_str(&buf[40..72], "cipher mode")?,
            hash_spec: get_str(&buf[72..104], "hash spec")?,
            payload_offset: get_u32(buf, 104),
            key_bytes: get_u32(buf, 108),
            mk_digest,
            mk_digest_salt,
            mk_digest_iter: get_u32(buf, 164),
            uuid: get_str(&buf[168..208], "uuid")?,
            keyslots,
        };
        hdr.validate(None)?;
        Ok(hdr)
    }

    pub(crate) fn to_bytes(&self) -> Result<[u8; LUKS_HDR_SIZE]> {
        let mut buf = [0u8; LUKS_HDR_SIZE];
        buf[0..6].copy_from_slice(&LUKS_MAGIC);
        buf[6..8].copy_from_slice(&LUKS_VERSION.to_be_bytes());
        put_str(&mut buf[8..40], &self.cipher_name, "cipher name")?;
        put_str(&mut buf[40..72], &self.cipher_mode, "cipher mode")?;
        put_str(&mut buf[72..104], &self.hash_spec, "hash spec")?;
        put_u32(&mut buf, 104, self.payload_offset);
        put_u32(&mut buf, 108, self.key_bytes);
        buf[112..132].copy_from_slice(&self.mk_digest);
        buf[132..164].copy_from_slice(&self.mk_digest_salt);
        put_u32(&mut buf, 164, self.mk_digest_iter);
        put_str(&mut buf[168..208], &self.uuid, "uuid")?;
        for (i, ks) in self.keyslots.iter().enumerate() {
            let off = 208 + i * 48;
            put_u32(&mut buf, off, ks.active);
            put_u32(&mut buf, off + 4, ks.iterations);
            buf[off + 8..off + 40].copy_from_slice(&ks.salt);
            put_u32(&mut buf, off + 40, ks.material_offset);
            put_u32(&mut buf, off + 44, ks.stripes);
        }
        Ok(buf)
    }

    /// Structural invariants. `device_sectors`, when known, additionally
    /// bounds every enabled material region to the device.
    pub(crate) fn validate(&self, device_sectors: Option<u64>) -> Result<()> {
        if self.cipher_name.is_empty() || self.hash_spec.is_empty() {
            return Err(Error::Corrupt("empty cipher or hash spec".into()));
        }
        if !VOLUME_KEY_SIZES.contains(&(self.key_bytes as usize)) {
            return Err(Error::Corrupt(format!("key size {} not supported", self.key_bytes)));
        }
        if self.mk_digest_iter == 0 {
            return Err(Error::Corrupt("zero MK digest iteration count".into()));
        }
        let need = af_sectors(self.key_bytes);
        let mut regions: Vec<(u64, u64)> = Vec::new();
        for (i, ks) in self.keyslots.iter().enumerate() {
            if !ks.is_enabled() {
                continue;
            }
            if ks.stripes != LUKS_STRIPES {
                return Err(Error::Corrupt(format!("keyslot {} stripe count {}", i, ks.stripes)));
            }
            if ks.iterations == 0 {
                return Err(Error::Corrupt(format!("keyslot {} has zero iterations", i)));
            }
            let start = ks.material_offset as u64;
            if start < HDR_SECTORS {
                return Err(Error::Corrupt(format!("keyslot {} overlaps the header", i)));
            }
            if start + need > self.payload_offset as u64 {
                return Err(Error::Corrupt(format!("keyslot {} overlaps the payload", i)));
            }
            if let Some(dev) = device_sectors {
                if start + need > dev {
                    return Err(Error::Corrupt(format!("keyslot {} exceeds the device", i)));
                }
            }
            regions.push((start, start + need));
        }
        regions.sort_unstable();
        for pair in regions.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(Error::Corrupt("keyslot material regions overlap".into()));
            }
        }
        Ok(())
    }

    pub(crate) fn read_from(dev: &File) -> Result<Luks1Header> {
        let mut buf = [0u8; LUKS_HDR_SIZE];
        dev.read_exact_at(&mut buf, 0).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::NotLuks
            } else {
                Error::from(e)
            }
        })?;
        let hdr = Luks1Header::from_bytes(&buf)?;
        let device_sectors = crate::backend::devmapper::blkdev_size_sectors(dev)?;
        hdr.validate(Some(device_sectors))?;
        Ok(hdr)
    }

    pub(crate) fn write_to(&self, dev: &File) -> Result<()> {
        let buf = self.to_bytes()?;
        dev.write_all_at(&buf, 0)?;
        dev.sync_all()?;
        Ok(())
    }

    pub(crate) fn keyslot_info(&self, slot: usize) -> KeyslotInfo {
        if slot >= MAX_KEYSLOTS {
            return KeyslotInfo::Invalid;
        }
        if !self.keyslots[slot].is_enabled() {
            return KeyslotInfo::Inactive;
        }
        let enabled = self.keyslots.iter().filter(|k| k.is_enabled()).count();
        if enabled == 1 { KeyslotInfo::ActiveLast } else { KeyslotInfo::Active }
    }

    /// Constant-time master-key digest check.
    pub(crate) fn check_mk_digest(&self, candidate: &[u8]) -> Result<bool> {
        let mut digest = [0u8; LUKS_DIGEST_SIZE];
        backend().pbkdf2(
            &self.hash_spec,
            candidate,
            &self.mk_digest_salt,
            self.mk_digest_iter,
            &mut digest,
        )?;
        Ok(digest[..].ct_eq(&self.mk_digest[..]).into())
    }
}

//! The keyslot engine: PBKDF2 + AF + cipher pipeline over the material
//! regions.
//!
//! Write ordering is load-bearing: material first, fsync, then the header
//! with the new slot state, fsync. A crash after the material write leaves
//! an orphan region no slot references (harmless, reused by the next add);
//! a crash between header write and its fsync is caught by the digest
//! check on next open. Nothing is ever rolled back -- by the time a
//! failure can happen the previous slot content is already gone.

use std::fs::File;
use std::os::unix::fs::FileExt;

use cryptolib::cipher::{cipher_decrypt, cipher_encrypt};
use cryptolib::{backend, random_get, RngQuality, RngSource, SecureBuf};

use crate::api::{Error, KeyslotInfo, Result, MAX_KEYSLOTS};
use crate::backend::header::{af_sectors, slot_material_offset, Luks1Header, LUKS_SALT_SIZE, LUKS_STRIPES};
use crate::backend::volumekey::VolumeKey;
use crate::backend::{af, round_up, SECTOR_SIZE};

/// Derive the slot key for one keyslot entry.
fn slot_key(hdr: &Luks1Header, salt: &[u8], iterations: u32, passphrase: &[u8]) -> Result<SecureBuf> {
    let mut key = SecureBuf::new(hdr.key_bytes as usize);
    backend().pbkdf2(&hdr.hash_spec, passphrase, salt, iterations, &mut key)?;
    Ok(key)
}

/// Material region length, padded to whole sectors for the cipher.
fn material_bytes(hdr: &Luks1Header) -> usize {
    af_sectors(hdr.key_bytes) as usize * SECTOR_SIZE
}

/// Add a keyslot protecting `vk` under `passphrase`. `slot` of `None`
/// picks the lowest-numbered inactive slot.
pub(crate) fn add_keyslot(
    dev: &File,
    hdr: &mut Luks1Header,
    slot: Option<usize>,
    passphrase: &[u8],
    vk: &VolumeKey,
    iterations: u32,
) -> Result<usize> {
    let slot = match slot {
        Some(s) => match hdr.keyslot_info(s) {
            KeyslotInfo::Inactive => s,
            KeyslotInfo::Invalid => {
                return Err(Error::invalid(format!("keyslot {} out of range", s)))
            }
            _ => return Err(Error::invalid(format!("keyslot {} is in use", s))),
        },
        None => (0..MAX_KEYSLOTS)
            .find(|&s| hdr.keyslot_info(s) == KeyslotInfo::Inactive)
            .ok_or(Error::NoSlotAvailable)?,
    };
    if vk.len() != hdr.key_bytes as usize {
        return Err(Error::invalid("volume key does not match header key size"));
    }

    let mut salt = [0u8; LUKS_SALT_SIZE];
    random_get(&mut salt, RngQuality::Normal, RngSource::Urandom)?;

    let key = slot_key(hdr, &salt, iterations, passphrase)?;

    // AF-expand, then pad the tail of the last sector with zeroes so the
    // sector cipher sees whole sectors
    let split = af::split(vk.as_bytes(), LUKS_STRIPES as usize, &hdr.hash_spec)?;
    let mut material = SecureBuf::new(material_bytes(hdr));
    material[..split.len()].copy_from_slice(&split);
    drop(split);

    cipher_encrypt(&hdr.cipher_name, &hdr.cipher_mode, &key, 0, &mut material)?;

    let offset = slot_material_offset(hdr.key_bytes, slot);
    log::debug!(
        "writing key material for slot {} at sector {} ({} bytes)",
        slot,
        offset,
        material.len()
    );
    dev.write_all_at(&material, offset * SECTOR_SIZE as u64)?;
    dev.sync_all()?;

    hdr.keyslots[slot].enable(iterations, salt, offset as u32);
    hdr.write_to(dev)?;
    Ok(slot)
}

/// Try to recover the master key from one slot. `Ok(None)` means the
/// passphrase does not open this slot.
fn open_one(
    dev: &File,
    hdr: &Luks1Header,
    slot: usize,
    passphrase: &[u8],
) -> Result<Option<VolumeKey>> {
    let entry = &hdr.keyslots[slot];
    let key = slot_key(hdr, &entry.salt, entry.iterations, passphrase)?;

    let mut material = SecureBuf::new(material_bytes(hdr));
    dev.read_exact_at(&mut material, entry.material_offset as u64 * SECTOR_SIZE as u64)?;
    cipher_decrypt(&hdr.cipher_name, &hdr.cipher_mode, &key, 0, &mut material)?;

    let blocksize = hdr.key_bytes as usize;
    let merged = af::merge(
        &material[..blocksize * LUKS_STRIPES as usize],
        blocksize,
        LUKS_STRIPES as usize,
        &hdr.hash_spec,
    )?;
    if hdr.check_mk_digest(&merged)? {
        Ok(Some(VolumeKey::alloc(blocksize, Some(&merged))?))
    } else {
        Ok(None)
    }
}

/// Open a keyslot with `passphrase`. A `slot` hint restricts the search to
/// that slot; otherwise every enabled slot is tried in order. The digest
/// comparison never short-circuits (see `check_mk_digest`), so a wrong
/// passphrase costs the same whichever slot it fails against.
pub(crate) fn open_keyslot(
    dev: &File,
    hdr: &Luks1Header,
    slot: Option<usize>,
    passphrase: &[u8],
) -> Result<(usize, VolumeKey)> {
    let candidates: Vec<usize> = match slot {
        Some(s) => match hdr.keyslot_info(s) {
            KeyslotInfo::Active | KeyslotInfo::ActiveLast => vec![s],
            KeyslotInfo::Invalid => {
                return Err(Error::invalid(format!("keyslot {} out of range", s)))
            }
            KeyslotInfo::Inactive => return Err(Error::SlotInactive),
        },
        None => (0..MAX_KEYSLOTS).filter(|&s| hdr.keyslots[s].is_enabled()).collect(),
    };
    if candidates.is_empty() {
        return Err(Error::SlotInactive);
    }

    for s in candidates {
        log::debug!("trying passphrase against keyslot {}", s);
        if let Some(vk) = open_one(dev, hdr, s, passphrase)? {
            log::debug!("keyslot {} unlocked", s);
            return Ok((s, vk));
        }
    }
    Err(Error::WrongPassphrase)
}

/// Destructively wipe a keyslot: the material region is overwritten with
/// `wipe_passes` rounds of randomness and as many of zeroes (one each at
/// minimum), synced between passes, and only then is the slot entry
/// disabled and the header rewritten.
pub(crate) fn destroy_keyslot(
    dev: &File,
    hdr: &mut Luks1Header,
    slot: usize,
    wipe_passes: u32,
) -> Result<()> {
    match hdr.keyslot_info(slot) {
        KeyslotInfo::Active | KeyslotInfo::ActiveLast => {}
        KeyslotInfo::Invalid => return Err(Error::invalid(format!("keyslot {} out of range", slot))),
        KeyslotInfo::Inactive => return Err(Error::SlotInactive),
    }
    let offset = hdr.keyslots[slot].material_offset as u64 * SECTOR_SIZE as u64;
    let len = round_up(material_bytes(hdr) as u64, SECTOR_SIZE as u64) as usize;
    let passes = wipe_passes.max(1);

    let mut buf = vec![0u8; len];
    for pass in 0..passes {
        random_get(&mut buf, RngQuality::Normal, RngSource::Urandom)?;
        dev.write_all_at(&buf, offset)?;
        dev.sync_all()?;
        log::debug!("keyslot {} wipe: random pass {} done", slot, pass + 1);
    }
    for _ in 0..passes {
        buf.iter_mut().for_each(|b| *b = 0);
        dev.write_all_at(&buf, offset)?;
        dev.sync_all()?;
    }

    hdr.keyslots[slot].disable();
    hdr.write_to(dev)?;
    log::debug!("keyslot {} disabled", slot);
    Ok(())
}

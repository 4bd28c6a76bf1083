//! End-to-end scenarios against file-backed metadata devices. Everything
//! except the live kernel mapping runs here; the device-mapper plumbing
//! has its own unit coverage over the pure parts.

use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::backend::header::{af_sectors, Luks1Header};
use crate::backend::SECTOR_SIZE;
use crate::*;

const TEST_UUID: &str = "12345678-1234-1234-1234-1234567890ab";
const DEVICE_SECTORS: u64 = 4096;

fn test_device() -> NamedTempFile {
    let f = NamedTempFile::new().expect("temp device");
    f.as_file().set_len(DEVICE_SECTORS * SECTOR_SIZE as u64).expect("size temp device");
    f
}

/// Format + add + open as one formatted handle; 1 ms iteration target
/// keeps PBKDF2 at the calibration floor.
fn format_luks(dev: &NamedTempFile) -> CryptDevice {
    let mut cd = CryptDevice::init(dev.path()).unwrap();
    cd.set_iteration_time_ms(1);
    cd.format(
        "aes",
        "xts-plain64",
        Some(TEST_UUID),
        None,
        32,
        &CryptParams::Luks1(Luks1Params { hash: "sha256".into(), ..Default::default() }),
    )
    .unwrap();
    cd
}

#[test]
fn format_add_open_roundtrip() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    assert_eq!(cd.keyslot_add_by_passphrase(Some(0), None, b"hunter2").unwrap(), 0);

    // a fresh handle reads everything back from disk
    let mut cd2 = CryptDevice::init(dev.path()).unwrap();
    cd2.load(None).unwrap();
    assert_eq!(cd2.get_type(), Some(CryptType::Luks1));
    assert_eq!(cd2.uuid(), Some(TEST_UUID));
    assert_eq!(cd2.cipher(), Some("aes"));
    assert_eq!(cd2.cipher_mode(), Some("xts-plain64"));
    assert_eq!(cd2.volume_key_size(), 32);
    assert_eq!(cd2.data_offset(), 4096);

    let slot = cd2.activate_by_passphrase(None, None, b"hunter2", CryptActivate::empty()).unwrap();
    assert_eq!(slot, 0);

    // the key recovered through the keyslot is the key format generated
    let (opened, from_slot) = cd2.volume_key_get(None, Some(b"hunter2")).unwrap();
    assert_eq!(opened, Some(0));
    let (_, generated) = cd.volume_key_get(None, None).unwrap();
    assert_eq!(&from_slot[..], &generated[..]);
}

#[test]
fn open_is_idempotent_and_wrong_passphrase_fails() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    cd.keyslot_add_by_passphrase(None, None, b"hunter2").unwrap();
    cd.keyslot_add_by_passphrase(None, Some(b"hunter2"), b"swordfish").unwrap();

    let (_, k1) = cd.volume_key_get(None, Some(b"hunter2")).unwrap();
    let (_, k2) = cd.volume_key_get(None, Some(b"hunter2")).unwrap();
    assert_eq!(&k1[..], &k2[..]);
    let (s, k3) = cd.volume_key_get(None, Some(b"swordfish")).unwrap();
    assert_eq!(s, Some(1));
    assert_eq!(&k1[..], &k3[..]);

    let err = cd
        .activate_by_passphrase(None, None, b"wrong", CryptActivate::empty())
        .unwrap_err();
    assert!(matches!(err, Error::WrongPassphrase), "got {:?}", err);
}

#[test]
fn second_keyslot_from_old_passphrase() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    cd.keyslot_add_by_passphrase(Some(3), None, b"first").unwrap();

    // a handle without the cached volume key must present the old one
    let mut cd2 = CryptDevice::init(dev.path()).unwrap();
    cd2.set_iteration_time_ms(1);
    cd2.load(None).unwrap();
    assert!(matches!(
        cd2.keyslot_add_by_passphrase(None, None, b"second"),
        Err(Error::InvalidArgument(_))
    ));
    let s = cd2.keyslot_add_by_passphrase(None, Some(b"first"), b"second").unwrap();
    assert_eq!(s, 0, "lowest inactive slot");
    assert_eq!(cd2.keyslot_status(0), KeyslotInfo::Active);
    assert_eq!(cd2.keyslot_status(3), KeyslotInfo::Active);

    // and both passphrases recover the same key
    let (_, a) = cd2.volume_key_get(None, Some(b"first")).unwrap();
    let (_, b) = cd2.volume_key_get(None, Some(b"second")).unwrap();
    assert_eq!(&a[..], &b[..]);
}

#[test]
fn occupied_slot_is_rejected() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    cd.keyslot_add_by_passphrase(Some(2), None, b"pw").unwrap();
    assert!(matches!(
        cd.keyslot_add_by_passphrase(Some(2), None, b"pw2"),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        cd.keyslot_add_by_passphrase(Some(11), None, b"pw2"),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn all_slots_exhausted() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    for i in 0..MAX_KEYSLOTS {
        assert_eq!(cd.keyslot_add_by_passphrase(None, None, b"pw").unwrap(), i);
    }
    assert!(matches!(
        cd.keyslot_add_by_passphrase(None, None, b"pw"),
        Err(Error::NoSlotAvailable)
    ));
}

#[test]
fn anti_forensic_destroy() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    cd.keyslot_add_by_passphrase(Some(0), None, b"hunter2").unwrap();
    cd.keyslot_add_by_passphrase(Some(1), None, b"backup-pw").unwrap();

    // raw material region of slot 0
    let material_len = af_sectors(32) as usize * SECTOR_SIZE;
    let offset = 8 * SECTOR_SIZE as u64;
    let mut before = vec![0u8; material_len];
    dev.as_file().read_exact_at(&mut before, offset).unwrap();

    cd.keyslot_destroy(0).unwrap();
    let mut after = vec![0u8; material_len];
    dev.as_file().read_exact_at(&mut after, offset).unwrap();

    // no 512-byte window of the old ciphertext survives
    for (i, (b, a)) in before
        .chunks(SECTOR_SIZE)
        .zip(after.chunks(SECTOR_SIZE))
        .enumerate()
    {
        assert_ne!(b, a, "sector {} of the material region survived the wipe", i);
    }
    assert!(after.iter().all(|&b| b == 0), "final wipe pass is zeroes");

    assert_eq!(cd.keyslot_status(0), KeyslotInfo::Inactive);
    assert_eq!(cd.keyslot_status(1), KeyslotInfo::ActiveLast);
    // slot 1 still opens
    assert!(cd.volume_key_get(None, Some(b"backup-pw")).is_ok());
    // slot 0's passphrase is gone
    assert!(matches!(
        cd.volume_key_get(None, Some(b"hunter2")),
        Err(Error::WrongPassphrase)
    ));
}

#[test]
fn active_last_gating() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    cd.keyslot_add_by_passphrase(Some(0), None, b"hunter2").unwrap();
    assert_eq!(cd.keyslot_status(0), KeyslotInfo::ActiveLast);

    // a declining confirm callback blocks the destruction
    cd.set_confirm_callback(Some(Box::new(|_| false)));
    assert!(cd.keyslot_destroy(0).is_err());
    assert_eq!(cd.keyslot_status(0), KeyslotInfo::ActiveLast);

    // destroying the last slot needs no passphrase, only confirmation
    cd.set_confirm_callback(None);
    cd.keyslot_destroy(0).unwrap();
    assert_eq!(cd.keyslot_status(0), KeyslotInfo::Inactive);

    // header still readable, but nothing opens anymore
    let mut cd2 = CryptDevice::init(dev.path()).unwrap();
    cd2.load(None).unwrap();
    assert!(matches!(
        cd2.activate_by_passphrase(None, None, b"hunter2", CryptActivate::empty()),
        Err(Error::SlotInactive)
    ));
}

#[test]
fn destroying_inactive_slot_fails() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    cd.keyslot_add_by_passphrase(Some(0), None, b"pw").unwrap();
    assert!(matches!(cd.keyslot_destroy(5), Err(Error::SlotInactive)));
    assert!(matches!(cd.keyslot_destroy(99), Err(Error::InvalidArgument(_))));
}

#[test]
fn volume_key_verify_and_add_by_volume_key() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    let (_, vk) = cd.volume_key_get(None, None).unwrap();

    cd.volume_key_verify(&vk).unwrap();
    assert!(matches!(cd.volume_key_verify(&[0u8; 32]), Err(Error::WrongPassphrase)));

    let s = cd.keyslot_add_by_volume_key(None, Some(&vk), b"via-volume-key").unwrap();
    let (opened, recovered) = cd.volume_key_get(None, Some(b"via-volume-key")).unwrap();
    assert_eq!(opened, Some(s));
    assert_eq!(&recovered[..], &vk[..]);

    assert!(matches!(
        cd.keyslot_add_by_volume_key(None, Some(&[1u8; 32]), b"x"),
        Err(Error::WrongPassphrase)
    ));
}

#[test]
fn format_with_supplied_volume_key() {
    let dev = test_device();
    let mut cd = CryptDevice::init(dev.path()).unwrap();
    cd.set_iteration_time_ms(1);
    let mk = [0x42u8; 32];
    cd.format(
        "aes",
        "xts-plain64",
        None,
        Some(&mk),
        32,
        &CryptParams::Luks1(Luks1Params::default()),
    )
    .unwrap();
    cd.keyslot_add_by_passphrase(None, None, b"pw").unwrap();
    let (_, vk) = cd.volume_key_get(None, Some(b"pw")).unwrap();
    assert_eq!(&vk[..], &mk);
    // generated uuid is well-formed
    assert_eq!(cd.uuid().unwrap().len(), 36);
}

#[test]
fn keyfile_credentials() {
    let dev = test_device();
    let mut cd = format_luks(&dev);

    let mut kf = NamedTempFile::new().unwrap();
    kf.write_all(b"binary\x00keyfile\xffdata").unwrap();
    kf.flush().unwrap();

    let s = cd
        .keyslot_add_by_keyfile(None, None, None, kf.path(), None)
        .unwrap();
    assert_eq!(s, 0);
    let opened = cd
        .activate_by_keyfile(None, None, kf.path(), None, CryptActivate::empty())
        .unwrap();
    assert_eq!(opened, 0);
    assert!(matches!(
        cd.activate_by_keyfile(None, None, Path::new("/nonexistent/keyfile"), None, CryptActivate::empty()),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn load_rejects_garbage_and_wrong_version() {
    let dev = test_device();
    let mut cd = CryptDevice::init(dev.path()).unwrap();
    assert!(matches!(cd.load(None), Err(Error::NotLuks)));

    // write a valid header, then bump the version field
    let mut cd = format_luks(&dev);
    cd.keyslot_add_by_passphrase(None, None, b"pw").unwrap();
    let mut hdr_bytes = [0u8; 1024];
    dev.as_file().read_exact_at(&mut hdr_bytes, 0).unwrap();
    hdr_bytes[7] = 9;
    dev.as_file().write_all_at(&hdr_bytes, 0).unwrap();
    let mut cd2 = CryptDevice::init(dev.path()).unwrap();
    assert!(matches!(cd2.load(None), Err(Error::Unsupported(_))));
}

#[test]
fn header_survives_on_disk_byte_exact() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    cd.keyslot_add_by_passphrase(Some(4), None, b"pw").unwrap();

    let mut raw = [0u8; 1024];
    dev.as_file().read_exact_at(&mut raw, 0).unwrap();
    let parsed = Luks1Header::from_bytes(&raw).unwrap();
    assert_eq!(parsed.to_bytes().unwrap()[..], raw[..]);
    assert_eq!(parsed.uuid, TEST_UUID);
    assert!(parsed.keyslots[4].is_enabled());
    assert_eq!(parsed.keyslots[4].stripes, 4000);
}

#[test]
fn header_backup_and_restore() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    cd.keyslot_add_by_passphrase(Some(0), None, b"hunter2").unwrap();

    let backup_dir = tempfile::tempdir().unwrap();
    let backup = backup_dir.path().join("hdr.backup");
    cd.header_backup(&backup).unwrap();
    // never clobber an existing backup
    assert!(cd.header_backup(&backup).is_err());

    // trash the header and keyslot area
    let junk = vec![0u8; 1024];
    dev.as_file().write_all_at(&junk, 0).unwrap();
    let mut broken = CryptDevice::init(dev.path()).unwrap();
    assert!(matches!(broken.load(None), Err(Error::NotLuks)));

    broken.header_restore(&backup).unwrap();
    let s = broken
        .activate_by_passphrase(None, None, b"hunter2", CryptActivate::empty())
        .unwrap();
    assert_eq!(s, 0);
}

#[test]
fn set_uuid_rewrites_header() {
    let dev = test_device();
    let mut cd = format_luks(&dev);
    cd.set_uuid(Some("87654321-4321-4321-4321-ba0987654321")).unwrap();

    let mut cd2 = CryptDevice::init(dev.path()).unwrap();
    cd2.load(None).unwrap();
    assert_eq!(cd2.uuid(), Some("87654321-4321-4321-4321-ba0987654321"));
    assert!(cd.set_uuid(Some("not ascii \u{fffd}")).is_err());
}

#[test]
fn plain_format_derives_mapping_parameters() {
    let dev = test_device();
    let mut cd = CryptDevice::init(dev.path()).unwrap();
    cd.format(
        "aes",
        "cbc-essiv:sha256",
        None,
        None,
        32,
        &CryptParams::Plain(PlainParams {
            hash: "sha256".into(),
            offset: 0,
            skip: 0,
            size: 0,
        }),
    )
    .unwrap();
    assert_eq!(cd.get_type(), Some(CryptType::Plain));
    assert_eq!(cd.cipher(), Some("aes"));
    assert_eq!(cd.volume_key_size(), 32);
    // no metadata: load must refuse
    assert!(cd.load(Some(CryptType::Plain)).is_err());
    // a passphrase-only check without a mapping name is meaningless
    assert!(cd
        .activate_by_passphrase(None, None, b"pw", CryptActivate::empty())
        .is_err());
}

#[test]
fn format_on_too_small_device_fails() {
    let f = NamedTempFile::new().unwrap();
    f.as_file().set_len(64 * SECTOR_SIZE as u64).unwrap();
    let mut cd = CryptDevice::init(f.path()).unwrap();
    cd.set_iteration_time_ms(1);
    let r = cd.format(
        "aes",
        "xts-plain64",
        None,
        None,
        32,
        &CryptParams::Luks1(Luks1Params::default()),
    );
    assert!(matches!(r, Err(Error::InvalidArgument(_))));
}

#[test]
fn unsupported_cipher_fails_before_io() {
    let dev = test_device();
    let mut cd = CryptDevice::init(dev.path()).unwrap();
    let r = cd.format(
        "serpent",
        "xts-plain64",
        None,
        None,
        32,
        &CryptParams::Luks1(Luks1Params::default()),
    );
    assert!(matches!(r, Err(Error::Unsupported(_))));
    // nothing was written
    let mut probe = [0u8; 6];
    dev.as_file().read_exact_at(&mut probe, 0).unwrap();
    assert_eq!(probe, [0u8; 6]);
}

#[test]
fn loopaes_format_records_parameters() {
    let dev = test_device();
    let mut cd = CryptDevice::init(dev.path()).unwrap();
    cd.format(
        "aes",
        "cbc-lmk",
        None,
        None,
        32,
        &CryptParams::LoopAes(LoopaesParams { hash: None, offset: 0, skip: 0 }),
    )
    .unwrap();
    assert_eq!(cd.get_type(), Some(CryptType::LoopAes));
    assert_eq!(cd.volume_key_size(), 32);
    // loop-AES volumes unlock with keyfiles only
    assert!(matches!(
        cd.activate_by_passphrase(Some("la"), None, b"pw", CryptActivate::empty()),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn keyslot_max_per_type() {
    assert_eq!(CryptDevice::keyslot_max(CryptType::Luks1), 8);
    assert_eq!(CryptDevice::keyslot_max(CryptType::Plain), 1);
}

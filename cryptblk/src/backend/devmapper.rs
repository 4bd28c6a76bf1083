//! Device-mapper control: programs the kernel `crypt` target over the DM
//! ioctl interface on /dev/mapper/control.
//!
//! The ioctl ABI is a fixed 312-byte `dm_ioctl` header followed by
//! command-specific payload in one buffer that the kernel also writes its
//! reply into. Buffers that carry key material are `SecureBuf`s and the
//! `DM_SECURE_DATA_FLAG` additionally tells the kernel to wipe its own
//! copy, when the running dm version understands it.
//!
//! Capability handling: the `crypt` target version is enumerated once per
//! controller (LIST_VERSIONS) and mapped to feature bits; operations that
//! need a missing feature fail `Unsupported` up front instead of leaving a
//! half-configured device behind.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use bitflags::bitflags;
use cryptolib::SecureBuf;

use crate::api::{CryptStatusInfo, CryptType, Error, Result};

const DM_CONTROL: &str = "/dev/mapper/control";
const DM_DIR: &str = "/dev/mapper";

const DM_NAME_LEN: usize = 128;
const DM_UUID_LEN: usize = 129;
pub(crate) const DM_UUID_PREFIX: &str = "CRYPT-";

/// dm-ioctl interface version we speak.
const DM_VERSION: [u32; 3] = [4, 0, 0];

const DM_IOCTL_SIZE: usize = 312;
const DM_BUF_SIZE: usize = 16 * 1024;
const DM_BUF_SIZE_MAX: usize = 256 * 1024;

const REMOVE_RETRY_COUNT: u32 = 5;

// command numbers; the ioctl word is _IOWR(0xfd, nr, dm_ioctl)
const DM_VERSION_CMD: u64 = 0;
const DM_DEV_CREATE_CMD: u64 = 3;
const DM_DEV_REMOVE_CMD: u64 = 4;
const DM_DEV_SUSPEND_CMD: u64 = 6;
const DM_DEV_STATUS_CMD: u64 = 7;
const DM_TABLE_LOAD_CMD: u64 = 9;
const DM_TABLE_STATUS_CMD: u64 = 12;
const DM_LIST_VERSIONS_CMD: u64 = 13;
const DM_TARGET_MSG_CMD: u64 = 14;

const fn dm_ioctl_cmd(nr: u64) -> u64 {
    // _IOC(_IOC_READ|_IOC_WRITE, 0xfd, nr, sizeof(struct dm_ioctl))
    (3u64 << 30) | ((DM_IOCTL_SIZE as u64) << 16) | (0xfdu64 << 8) | nr
}

// dm_ioctl flags
const DM_READONLY_FLAG: u32 = 1 << 0;
const DM_SUSPEND_FLAG: u32 = 1 << 1;
const DM_STATUS_TABLE_FLAG: u32 = 1 << 4;
const DM_BUFFER_FULL_FLAG: u32 = 1 << 8;
const DM_SECURE_DATA_FLAG: u32 = 1 << 15;

bitflags! {
    /// What the running kernel's crypt target can do.
    pub(crate) struct DmCaps: u32 {
        /// "key wipe"/"key set" target messages.
        const KEY_WIPE    = 1 << 0;
        /// plain64 IV generator.
        const PLAIN64     = 1 << 1;
        /// loop-AES LMK IV generator.
        const LMK         = 1 << 2;
        /// allow_discards optional table parameter.
        const DISCARDS    = 1 << 3;
        /// DM_SECURE_DATA_FLAG honored by dm-ioctl.
        const SECURE_DATA = 1 << 4;
    }
}

/// Feature bits from the probed target and interface versions.
pub(crate) fn caps_from_versions(crypt: (u32, u32, u32), dm_ioctl: (u32, u32)) -> DmCaps {
    let mut caps = DmCaps::empty();
    let (maj, min, _) = crypt;
    if maj >= 1 {
        if min >= 2 || maj > 1 {
            caps |= DmCaps::KEY_WIPE;
        }
        if min >= 8 || maj > 1 {
            caps |= DmCaps::PLAIN64;
        }
        if min >= 10 || maj > 1 {
            caps |= DmCaps::LMK;
        }
        if min >= 11 || maj > 1 {
            caps |= DmCaps::DISCARDS;
        }
    }
    if dm_ioctl.0 > 4 || (dm_ioctl.0 == 4 && dm_ioctl.1 >= 20) {
        caps |= DmCaps::SECURE_DATA;
    }
    caps
}

/// One crypt target line: everything needed to render
/// `"<cipher> <hexkey> <iv_offset> <device> <offset>"`.
pub(crate) struct CryptTarget<'a> {
    pub(crate) cipher: &'a str,
    pub(crate) key: &'a [u8],
    pub(crate) iv_offset: u64,
    pub(crate) device: &'a str,
    pub(crate) data_offset: u64,
    /// Mapped length, sectors.
    pub(crate) size: u64,
    pub(crate) allow_discards: bool,
}

impl CryptTarget<'_> {
    /// Render the kernel table parameter string. The key is hex-expanded
    /// straight into a wiping buffer and must never travel through a
    /// formatting call or a log line.
    pub(crate) fn params(&self) -> SecureBuf {
        const HEXDIGITS: &[u8; 16] = b"0123456789abcdef";
        let iv = self.iv_offset.to_string();
        let off = self.data_offset.to_string();
        let discards = if self.allow_discards { " 1 allow_discards".len() } else { 0 };
        let len = self.cipher.len()
            + 1
            + self.key.len() * 2
            + 1
            + iv.len()
            + 1
            + self.device.len()
            + 1
            + off.len()
            + discards;
        let mut out = SecureBuf::new(len);
        let mut pos = 0;
        let mut put = |buf: &mut SecureBuf, pos: &mut usize, bytes: &[u8]| {
            buf[*pos..*pos + bytes.len()].copy_from_slice(bytes);
            *pos += bytes.len();
        };
        put(&mut out, &mut pos, self.cipher.as_bytes());
        put(&mut out, &mut pos, b" ");
        for &b in self.key {
            out[pos] = HEXDIGITS[(b >> 4) as usize];
            out[pos + 1] = HEXDIGITS[(b & 0xf) as usize];
            pos += 2;
        }
        put(&mut out, &mut pos, b" ");
        put(&mut out, &mut pos, iv.as_bytes());
        put(&mut out, &mut pos, b" ");
        put(&mut out, &mut pos, self.device.as_bytes());
        put(&mut out, &mut pos, b" ");
        put(&mut out, &mut pos, off.as_bytes());
        if self.allow_discards {
            put(&mut out, &mut pos, b" 1 allow_discards");
        }
        out
    }
}

/// What a table query returns. The key is surrendered in a wiping buffer;
/// internal callers only.
pub(crate) struct DmQuery {
    pub(crate) cipher: String,
    pub(crate) key: SecureBuf,
    pub(crate) iv_offset: u64,
    pub(crate) device: String,
    pub(crate) data_offset: u64,
    pub(crate) size: u64,
    pub(crate) read_only: bool,
    pub(crate) suspended: bool,
    pub(crate) uuid: Option<String>,
}

/// Compose the kernel DM UUID: `CRYPT-<TYPE>[-<uuid-no-dashes>]-<name>`.
/// The UUID is the handle used to rediscover LUKS1 devices, so for those a
/// result that does not fit is an error; other types keep the historical
/// truncate-and-warn behavior.
pub(crate) fn dm_prepare_uuid(name: &str, crypt_type: CryptType, uuid: Option<&str>) -> Result<String> {
    let stripped: String = uuid.unwrap_or("").chars().filter(|c| *c != '-').collect();
    let mut full = String::from(DM_UUID_PREFIX);
    full.push_str(crypt_type.as_str());
    full.push('-');
    if !stripped.is_empty() {
        full.push_str(&stripped);
        full.push('-');
    }
    full.push_str(name);

    if full.len() >= DM_UUID_LEN {
        if crypt_type == CryptType::Luks1 {
            return Err(Error::invalid(format!("DM UUID for device {} would be truncated", name)));
        }
        log::warn!("DM UUID for device {} was truncated", name);
        full.truncate(DM_UUID_LEN - 1);
    }
    log::debug!("DM UUID is {}", full);
    Ok(full)
}

/// Split a DM UUID back into (type, device uuid, name).
pub(crate) fn dm_parse_uuid(dm_uuid: &str) -> Option<(CryptType, Option<&str>, &str)> {
    let rest = dm_uuid.strip_prefix(DM_UUID_PREFIX)?;
    let (type_str, rest) = rest.split_once('-')?;
    let crypt_type = CryptType::from_str(type_str)?;
    match rest.split_once('-') {
        Some((uuid, name)) if !uuid.is_empty() => Some((crypt_type, Some(uuid), name)),
        _ => Some((crypt_type, None, rest)),
    }
}

pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= DM_NAME_LEN || name.contains('/') || name.contains('\0') {
        return Err(Error::invalid(format!("invalid device-mapper name \"{}\"", name)));
    }
    Ok(())
}

/// Sector count of an open device: BLKGETSIZE64 for block devices, file
/// size for regular files (file-backed metadata in tests and backups).
pub(crate) fn blkdev_size_sectors(dev: &File) -> Result<u64> {
    let md = dev.metadata()?;
    use std::os::unix::fs::FileTypeExt;
    if md.file_type().is_block_device() {
        const BLKGETSIZE64: u64 = 0x8008_1272;
        let mut bytes: u64 = 0;
        let rc = unsafe { libc::ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut bytes) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(bytes / 512)
    } else {
        Ok(md.len() / 512)
    }
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(buf[off..off + 4].try_into().expect("u32 slice"))
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_ne_bytes(buf[off..off + 8].try_into().expect("u64 slice"))
}

/// Kernel `new_encode_dev` packing of the `dev` field.
pub(crate) fn decode_dev(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xfff) as u32;
    let minor = ((dev & 0xff) | ((dev >> 12) & !0xffu64)) as u32;
    (major, minor)
}

fn map_dm_errno(e: std::io::Error, what: &str) -> Error {
    match e.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => {
            Error::Permission(format!("{}: {}", what, e))
        }
        Some(libc::EBUSY) => Error::Busy(what.to_string()),
        Some(libc::EEXIST) => Error::Busy(format!("{}: name already in use", what)),
        Some(libc::ENXIO) | Some(libc::ENODEV) => Error::NotFound(what.to_string()),
        Some(libc::ENOTTY) => Error::Unsupported(format!("{}: not a device-mapper control node", what)),
        _ => Error::Io(e),
    }
}

pub(crate) struct DmBackend {
    ctl: File,
    /// dm-ioctl interface version reported by the kernel.
    dm_version: (u32, u32),
    caps: Option<DmCaps>,
}

impl DmBackend {
    pub(crate) fn new() -> Result<DmBackend> {
        let ctl = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DM_CONTROL)
            .map_err(|e| map_dm_errno(e, DM_CONTROL))?;
        let mut dm = DmBackend { ctl, dm_version: (0, 0), caps: None };
        let resp = dm.run(DM_VERSION_CMD, None, None, 0, None)?;
        dm.dm_version = (get_u32(&resp, 0), get_u32(&resp, 4));
        log::debug!("dm-ioctl version {}.{}", dm.dm_version.0, dm.dm_version.1);
        Ok(dm)
    }

    /// Enumerate target versions and cache the crypt capabilities.
    pub(crate) fn caps(&mut self) -> Result<DmCaps> {
        if let Some(caps) = self.caps {
            return Ok(caps);
        }
        let resp = self.run(DM_LIST_VERSIONS_CMD, None, None, 0, None)?;
        let data_start = get_u32(&resp, 16) as usize;
        let data_size = get_u32(&resp, 12) as usize;
        let mut crypt_version = None;
        let mut off = data_start;
        while off + 16 <= data_size.min(resp.len()) {
            let version = (get_u32(&resp, off), get_u32(&resp, off + 4), get_u32(&resp, off + 8));
            let next = get_u32(&resp, off + 12) as usize;
            let name_end = resp[off + 16..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| off + 16 + p)
                .unwrap_or(resp.len());
            let name = String::from_utf8_lossy(&resp[off + 16..name_end]);
            if name == "crypt" {
                crypt_version = Some(version);
            }
            if next == 0 {
                break;
            }
            off += next;
        }
        let crypt_version = crypt_version.ok_or_else(|| {
            Error::Unsupported("kernel has no dm-crypt target; is dm_mod loaded?".into())
        })?;
        log::debug!(
            "detected dm-crypt target {}.{}.{}",
            crypt_version.0,
            crypt_version.1,
            crypt_version.2
        );
        let caps = caps_from_versions(crypt_version, self.dm_version);
        self.caps = Some(caps);
        Ok(caps)
    }

    fn secure_flag(&mut self) -> u32 {
        match self.caps() {
            Ok(caps) if caps.contains(DmCaps::SECURE_DATA) => DM_SECURE_DATA_FLAG,
            _ => 0,
        }
    }

    /// One ioctl round-trip. The reply lands in the returned buffer; a
    /// `DM_BUFFER_FULL_FLAG` reply retries with a bigger one.
    fn run(
        &self,
        cmd: u64,
        name: Option<&str>,
        uuid: Option<&str>,
        flags: u32,
        payload: Option<&[u8]>,
    ) -> Result<SecureBuf> {
        let mut buf_size = DM_BUF_SIZE;
        loop {
            if let Some(p) = payload {
                if DM_IOCTL_SIZE + p.len() > buf_size {
                    buf_size = (DM_IOCTL_SIZE + p.len()).next_power_of_two();
                }
            }
            let mut buf = SecureBuf::new(buf_size);
            put_u32(&mut buf, 0, DM_VERSION[0]);
            put_u32(&mut buf, 4, DM_VERSION[1]);
            put_u32(&mut buf, 8, DM_VERSION[2]);
            put_u32(&mut buf, 12, buf_size as u32); // data_size
            put_u32(&mut buf, 16, DM_IOCTL_SIZE as u32); // data_start
            put_u32(&mut buf, 28, flags);
            if let Some(n) = name {
                let bytes = n.as_bytes();
                buf[48..48 + bytes.len()].copy_from_slice(bytes);
            }
            if let Some(u) = uuid {
                let bytes = u.as_bytes();
                buf[176..176 + bytes.len()].copy_from_slice(bytes);
            }
            if let Some(p) = payload {
                buf[DM_IOCTL_SIZE..DM_IOCTL_SIZE + p.len()].copy_from_slice(p);
            }

            let rc = unsafe {
                libc::ioctl(self.ctl.as_raw_fd(), dm_ioctl_cmd(cmd) as _, buf.as_mut_ptr())
            };
            if rc < 0 {
                return Err(map_dm_errno(
                    std::io::Error::last_os_error(),
                    name.unwrap_or("device-mapper"),
                ));
            }
            if get_u32(&buf, 28) & DM_BUFFER_FULL_FLAG != 0 {
                if buf_size >= DM_BUF_SIZE_MAX {
                    return Err(Error::NoMemory);
                }
                buf_size *= 4;
                continue;
            }
            return Ok(buf);
        }
    }

    /// Render a single-target table payload.
    fn target_payload(target_type: &str, size: u64, params: &[u8]) -> SecureBuf {
        // dm_target_spec is 40 bytes, params are NUL-terminated and the
        // whole record padded to 8
        let record = 40 + crate::backend::round_up(params.len() as u64 + 1, 8) as usize;
        let mut p = SecureBuf::new(record);
        put_u64(&mut p, 0, 0); // sector_start
        put_u64(&mut p, 8, size); // length
        put_u32(&mut p, 16, 0); // status
        put_u32(&mut p, 20, record as u32); // next
        p[24..24 + target_type.len()].copy_from_slice(target_type.as_bytes());
        p[40..40 + params.len()].copy_from_slice(params);
        p
    }

    fn table_load(&mut self, name: &str, target_type: &str, size: u64, params: &[u8], read_only: bool) -> Result<()> {
        let mut flags = self.secure_flag();
        if read_only {
            flags |= DM_READONLY_FLAG;
        }
        let payload = Self::target_payload(target_type, size, params);
        // the reply buffer may carry the key back; it wipes itself on drop
        self.run(DM_TABLE_LOAD_CMD, Some(name), None, flags, Some(&payload))?;
        Ok(())
    }

    fn simple(&self, cmd: u64, name: &str, flags: u32) -> Result<()> {
        self.run(cmd, Some(name), None, flags, None).map(|_| ())
    }

    fn resume(&self, name: &str) -> Result<()> {
        self.simple(DM_DEV_SUSPEND_CMD, name, 0)
    }

    pub(crate) fn suspend(&self, name: &str) -> Result<()> {
        self.simple(DM_DEV_SUSPEND_CMD, name, DM_SUSPEND_FLAG)
    }

    fn message(&mut self, name: &str, msg: &[u8]) -> Result<()> {
        let flags = self.secure_flag();
        let mut payload = SecureBuf::new(8 + crate::backend::round_up(msg.len() as u64 + 1, 8) as usize);
        put_u64(&mut payload, 0, 0); // sector
        payload[8..8 + msg.len()].copy_from_slice(msg);
        self.run(DM_TARGET_MSG_CMD, Some(name), None, flags, Some(&payload))?;
        Ok(())
    }

    /// Create a mapped device: create, load the crypt table, resume. A
    /// failure after creation removes the half-made device again and
    /// reports the first error.
    pub(crate) fn create_device(
        &mut self,
        name: &str,
        dm_uuid: &str,
        target: &CryptTarget<'_>,
        read_only: bool,
    ) -> Result<()> {
        check_name(name)?;
        self.caps()?;
        self.run(DM_DEV_CREATE_CMD, Some(name), Some(dm_uuid), 0, None)?;

        let params = target.params();
        let r = self
            .table_load(name, "crypt", target.size, &params, read_only)
            .and_then(|_| self.resume(name));
        drop(params);
        if let Err(first) = r {
            log::debug!("activation of {} failed, removing partial mapping", name);
            let _ = self.remove_device(name, false, 0);
            return Err(first);
        }
        self.make_node(name);
        Ok(())
    }

    /// Atomically swap table parameters (and key) of a live mapping:
    /// kernel-side reload plus resume.
    pub(crate) fn reload_device(
        &mut self,
        name: &str,
        target: &CryptTarget<'_>,
        read_only: bool,
    ) -> Result<()> {
        check_name(name)?;
        self.caps()?;
        let params = target.params();
        let r = self.table_load(name, "crypt", target.size, &params, read_only);
        drop(params);
        r?;
        self.resume(name)
    }

    /// Replace the table with an all-error, read-only target. Used to
    /// unwedge internal temporary mappings before a forced remove.
    fn error_device(&mut self, name: &str, size: u64) -> Result<()> {
        self.table_load(name, "error", size, b"", true)?;
        self.resume(name)
    }

    pub(crate) fn remove_device(&mut self, name: &str, force: bool, size: u64) -> Result<()> {
        check_name(name)?;
        if force && size == 0 {
            return Err(Error::invalid("forced removal needs the mapping size"));
        }
        let mut retries = if force { REMOVE_RETRY_COUNT } else { 1 };
        let mut error_target = false;
        loop {
            match self.simple(DM_DEV_REMOVE_CMD, name, 0) {
                Ok(()) => {
                    self.remove_node(name);
                    return Ok(());
                }
                Err(Error::Busy(m)) => {
                    retries -= 1;
                    if retries == 0 {
                        return Err(Error::Busy(m));
                    }
                    log::debug!("device {} busy, retrying removal", name);
                    if force && !error_target {
                        // stop whoever is reading it; only ever done to
                        // mappings this process created for itself
                        if self.error_device(name, size).is_ok() {
                            error_target = true;
                        }
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn status(&self, name: &str) -> Result<CryptStatusInfo> {
        if check_name(name).is_err() {
            return Ok(CryptStatusInfo::Invalid);
        }
        match self.run(DM_DEV_STATUS_CMD, Some(name), None, 0, None) {
            Ok(resp) => {
                let open_count = get_u32(&resp, 24) as i32;
                Ok(if open_count > 0 { CryptStatusInfo::Busy } else { CryptStatusInfo::Active })
            }
            Err(Error::NotFound(_)) => Ok(CryptStatusInfo::Inactive),
            Err(e) => Err(e),
        }
    }

    /// Full table readback, key included. Internal callers only; the key
    /// comes back in a wiping buffer.
    pub(crate) fn query_table(&mut self, name: &str) -> Result<DmQuery> {
        check_name(name)?;
        let flags = DM_STATUS_TABLE_FLAG | self.secure_flag();
        let resp = self.run(DM_TABLE_STATUS_CMD, Some(name), None, flags, None)?;

        let target_count = get_u32(&resp, 20);
        if target_count != 1 {
            return Err(Error::invalid(format!(
                "device {} has {} targets, expected a single crypt target",
                name, target_count
            )));
        }
        let resp_flags = get_u32(&resp, 28);
        let data_start = get_u32(&resp, 16) as usize;

        let size = get_u64(&resp, data_start + 8);
        let ttype_end = resp[data_start + 24..data_start + 40]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(16);
        let ttype = String::from_utf8_lossy(&resp[data_start + 24..data_start + 24 + ttype_end]).to_string();
        if ttype != "crypt" {
            return Err(Error::invalid(format!("device {} is a {} mapping, not crypt", name, ttype)));
        }

        let params_start = data_start + 40;
        let params_end = resp[params_start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| params_start + p)
            .ok_or_else(|| Error::Corrupt("unterminated table parameters".into()))?;
        let params = SecureBuf::from_slice(&resp[params_start..params_end]);

        let mut fields = params.split(|&b| b == b' ');
        let cipher = String::from_utf8_lossy(fields.next().unwrap_or(b"")).to_string();
        let hexkey = fields.next().ok_or_else(|| Error::Corrupt("table has no key field".into()))?;
        let iv_offset = parse_u64_field(fields.next(), "iv offset")?;
        let device =
            String::from_utf8_lossy(fields.next().ok_or_else(|| Error::Corrupt("table has no device field".into()))?)
                .to_string();
        let data_offset = parse_u64_field(fields.next(), "data offset")?;

        let mut key = SecureBuf::new(hexkey.len() / 2);
        for (i, pair) in hexkey.chunks(2).enumerate() {
            if pair.len() != 2 {
                return Err(Error::Corrupt("odd-length key field".into()));
            }
            let hi = hex_val(pair[0])?;
            let lo = hex_val(pair[1])?;
            key[i] = (hi << 4) | lo;
        }
        drop(params);

        let uuid_raw = &resp[176..176 + DM_UUID_LEN];
        let uuid_end = uuid_raw.iter().position(|&b| b == 0).unwrap_or(0);
        let uuid = if uuid_end > 0 {
            Some(String::from_utf8_lossy(&uuid_raw[..uuid_end]).to_string())
        } else {
            None
        };

        Ok(DmQuery {
            cipher,
            key,
            iv_offset,
            device,
            data_offset,
            size,
            read_only: resp_flags & DM_READONLY_FLAG != 0,
            suspended: resp_flags & DM_SUSPEND_FLAG != 0,
            uuid,
        })
    }

    /// Freeze I/O and scrub the in-kernel key.
    pub(crate) fn suspend_and_wipe_key(&mut self, name: &str) -> Result<()> {
        if !self.caps()?.contains(DmCaps::KEY_WIPE) {
            return Err(Error::Unsupported("kernel crypt target cannot wipe keys".into()));
        }
        self.suspend(name)?;
        if let Err(e) = self.message(name, b"key wipe") {
            let _ = self.resume(name);
            return Err(e);
        }
        Ok(())
    }

    /// Reinstate the key into a suspended mapping and resume it. The
    /// message buffer is hex-of-key and lives in a wiping allocation.
    pub(crate) fn resume_and_reinstate_key(&mut self, name: &str, key: &[u8]) -> Result<()> {
        if !self.caps()?.contains(DmCaps::KEY_WIPE) {
            return Err(Error::Unsupported("kernel crypt target cannot wipe keys".into()));
        }
        const HEXDIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut msg = SecureBuf::new("key set ".len() + key.len() * 2);
        msg[..8].copy_from_slice(b"key set ");
        for (i, &b) in key.iter().enumerate() {
            msg[8 + i * 2] = HEXDIGITS[(b >> 4) as usize];
            msg[8 + i * 2 + 1] = HEXDIGITS[(b & 0xf) as usize];
        }
        let r = self.message(name, &msg);
        drop(msg);
        r?;
        self.resume(name)
    }

    /// Best-effort /dev/mapper node maintenance; udev owns this on real
    /// systems, but internal tooling should work without it.
    fn make_node(&self, name: &str) {
        let resp = match self.run(DM_DEV_STATUS_CMD, Some(name), None, 0, None) {
            Ok(r) => r,
            Err(_) => return,
        };
        let (major, minor) = decode_dev(get_u64(&resp, 40));
        let path = format!("{}/{}", DM_DIR, name);
        if Path::new(&path).exists() {
            return;
        }
        let cpath = match std::ffi::CString::new(path) {
            Ok(c) => c,
            Err(_) => return,
        };
        unsafe {
            libc::mknod(cpath.as_ptr(), libc::S_IFBLK | 0o600, libc::makedev(major, minor));
        }
    }

    fn remove_node(&self, name: &str) {
        let _ = std::fs::remove_file(format!("{}/{}", DM_DIR, name));
    }
}

fn hex_val(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::Corrupt("bad hex digit in key field".into())),
    }
}

fn parse_u64_field(field: Option<&[u8]>, what: &str) -> Result<u64> {
    let f = field.ok_or_else(|| Error::Corrupt(format!("table has no {} field", what)))?;
    std::str::from_utf8(f)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Corrupt(format!("malformed {} field", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_string_layout() {
        let target = CryptTarget {
            cipher: "aes-xts-plain64",
            key: &[0xde, 0xad, 0xbe, 0xef],
            iv_offset: 0,
            device: "/dev/sdz1",
            data_offset: 4096,
            size: 1000,
            allow_discards: false,
        };
        assert_eq!(&target.params()[..], b"aes-xts-plain64 deadbeef 0 /dev/sdz1 4096" as &[u8]);

        let target = CryptTarget { allow_discards: true, iv_offset: 7, ..target };
        assert_eq!(
            &target.params()[..],
            b"aes-xts-plain64 deadbeef 7 /dev/sdz1 4096 1 allow_discards" as &[u8]
        );
    }

    #[test]
    fn uuid_composition_and_parsing() {
        let u = dm_prepare_uuid(
            "backup",
            CryptType::Luks1,
            Some("12345678-1234-1234-1234-1234567890ab"),
        )
        .unwrap();
        assert_eq!(u, "CRYPT-LUKS1-123456781234123412341234567890ab-backup");
        let (t, uuid, name) = dm_parse_uuid(&u).unwrap();
        assert_eq!(t, CryptType::Luks1);
        assert_eq!(uuid, Some("123456781234123412341234567890ab"));
        assert_eq!(name, "backup");

        let u = dm_prepare_uuid("tmp", CryptType::Plain, None).unwrap();
        assert_eq!(u, "CRYPT-PLAIN-tmp");
        assert_eq!(dm_parse_uuid(&u), Some((CryptType::Plain, None, "tmp")));
    }

    #[test]
    fn luks_uuid_truncation_is_an_error() {
        let long_name = "n".repeat(120);
        let r = dm_prepare_uuid(
            &long_name,
            CryptType::Luks1,
            Some("12345678-1234-1234-1234-1234567890ab"),
        );
        assert!(r.is_err());
        // non-LUKS keeps the old truncate-with-warning behavior
        let r = dm_prepare_uuid(&long_name, CryptType::Plain, None).unwrap();
        assert_eq!(r.len(), DM_UUID_LEN - 1);
    }

    #[test]
    fn capability_mapping() {
        // the matrix the original probing logic established
        assert!(caps_from_versions((1, 2, 0), (4, 15)).contains(DmCaps::KEY_WIPE));
        assert!(!caps_from_versions((1, 1, 0), (4, 15)).contains(DmCaps::KEY_WIPE));
        assert!(caps_from_versions((1, 8, 0), (4, 15)).contains(DmCaps::PLAIN64));
        assert!(!caps_from_versions((1, 7, 0), (4, 15)).contains(DmCaps::PLAIN64));
        assert!(caps_from_versions((1, 10, 0), (4, 15)).contains(DmCaps::LMK));
        assert!(caps_from_versions((1, 11, 0), (4, 15)).contains(DmCaps::DISCARDS));
        assert!(caps_from_versions((1, 0, 0), (4, 20)).contains(DmCaps::SECURE_DATA));
        assert!(!caps_from_versions((1, 0, 0), (4, 19)).contains(DmCaps::SECURE_DATA));
        assert!(caps_from_versions((2, 0, 0), (5, 0)).is_all());
    }

    #[test]
    fn dev_number_decoding() {
        // 253:7 in new_encode_dev form
        let dev = (253u64 << 8) | 7;
        assert_eq!(decode_dev(dev), (253, 7));
        // large minor spills into the high bits
        let dev = (253u64 << 8) | 0x34 | ((0x1200u64) << 12);
        assert_eq!(decode_dev(dev), (253, 0x1234));
    }

    #[test]
    fn name_validation() {
        assert!(check_name("volume0").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("a/b").is_err());
        assert!(check_name(&"x".repeat(200)).is_err());
    }

    #[test]
    fn ioctl_command_encoding() {
        // _IOWR(0xfd, 0x00, struct dm_ioctl) with the 312-byte struct
        assert_eq!(dm_ioctl_cmd(DM_VERSION_CMD), 0xc138_fd00);
        assert_eq!(dm_ioctl_cmd(DM_TABLE_LOAD_CMD), 0xc138_fd09);
    }
}

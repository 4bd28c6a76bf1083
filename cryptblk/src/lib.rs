//! User-space core of a disk-encryption toolkit.
//!
//! A [`CryptDevice`] is an owning handle on one metadata device. It knows
//! three on-disk/mapping formats:
//!
//! - **LUKS1**: a 1024-byte big-endian header at offset 0 plus eight
//!   independently revocable keyslots, each holding the master key after
//!   PBKDF2 + anti-forensic expansion + encryption under a
//!   passphrase-derived key (`backend::header`, `backend::keyslot`).
//! - **plain**: no metadata at all; the mapping key is hashed straight
//!   from the passphrase (`backend::kdf`).
//! - **loop-AES**: compatibility handling for 1/64/65-record keyfiles
//!   (`backend::loopaes`).
//!
//! Activation programs the kernel crypt target through the device-mapper
//! ioctl interface (`backend::devmapper`); the key crosses into the kernel
//! inside a wiping buffer and is not retained in user space beyond what
//! the caller explicitly keeps.
//!
//! Handles are deliberately not `Sync`: operations on one device must be
//! externally serialized (and the kernel mapping table is global state
//! that other tools can race against us -- that surfaces as `Busy`).
//! Separate handles on separate devices are independent. There are no
//! background threads; everything blocks in place, and the only long
//! stalls are PBKDF2 and keyslot wipes.

pub mod api;
pub use api::*;
pub(crate) mod backend;
#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use cryptolib::{RngSource, SecureBuf};

use backend::devmapper::{
    blkdev_size_sectors, dm_parse_uuid, dm_prepare_uuid, CryptTarget, DmBackend, DmCaps, DmQuery,
};
use backend::header::{Luks1Header, DEFAULT_DATA_ALIGNMENT};
use backend::keyslot;
use backend::volumekey::VolumeKey;
use backend::{bench, kdf, loopaes, SECTOR_SIZE};

/// Parameters of a formatted plain device; nothing of this is persisted.
struct PlainState {
    cipher: String,
    cipher_mode: String,
    key_size: usize,
    hash: String,
    offset: u64,
    skip: u64,
    size: u64,
}

struct LoopaesState {
    cipher: String,
    key_size: usize,
    hash: Option<String>,
    offset: u64,
    skip: u64,
}

pub struct CryptDevice {
    device: PathBuf,
    data_device: Option<PathBuf>,
    crypt_type: Option<CryptType>,
    hdr: Option<Luks1Header>,
    plain: Option<PlainState>,
    loopaes: Option<LoopaesState>,
    volume_key: Option<VolumeKey>,

    rng_source: RngSource,
    iteration_time_ms: u64,
    password_retry: u32,
    password_verify: bool,
    timeout_sec: u64,
    data_alignment: u64,
    wipe_passes: u32,

    log_cb: Option<LogCallback>,
    confirm_cb: Option<ConfirmCallback>,
    dm: Option<DmBackend>,
}

impl CryptDevice {
    /// Open a handle on `device` (the metadata device). The device must
    /// exist; nothing is read yet.
    pub fn init(device: impl AsRef<Path>) -> Result<CryptDevice> {
        let device = device.as_ref().to_path_buf();
        File::open(&device).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("device {} does not exist", device.display()))
            }
            _ => Error::from(e),
        })?;
        log::debug!("new context for {}", device.display());
        Ok(CryptDevice {
            device,
            data_device: None,
            crypt_type: None,
            hdr: None,
            plain: None,
            loopaes: None,
            volume_key: None,
            rng_source: RngSource::Urandom,
            iteration_time_ms: 1000,
            password_retry: 3,
            password_verify: false,
            timeout_sec: 0,
            data_alignment: DEFAULT_DATA_ALIGNMENT,
            wipe_passes: 1,
            log_cb: None,
            confirm_cb: None,
            dm: None,
        })
    }

    /// Rediscover an active mapping by name: the DM UUID carries the type
    /// and device UUID, the loaded table carries the backing device.
    pub fn init_by_name(name: &str, header_device: Option<&Path>) -> Result<CryptDevice> {
        let mut dm = DmBackend::new()?;
        let query = dm.query_table(name)?;
        let parsed = query.uuid.as_deref().and_then(dm_parse_uuid);

        let device = match header_device {
            Some(h) => h.to_path_buf(),
            None => PathBuf::from(&query.device),
        };
        let mut cd = CryptDevice::init(&device)?;
        cd.dm = Some(dm);
        if let Some((crypt_type, _dev_uuid, _)) = parsed {
            cd.crypt_type = Some(crypt_type);
            if crypt_type == CryptType::Luks1 {
                cd.load(Some(CryptType::Luks1))?;
            }
        }
        Ok(cd)
    }

    // ---- configuration ----------------------------------------------

    pub fn set_log_callback(&mut self, cb: Option<LogCallback>) { self.log_cb = cb; }

    pub fn set_confirm_callback(&mut self, cb: Option<ConfirmCallback>) { self.confirm_cb = cb; }

    /// RNG tier used for long-term key generation.
    pub fn set_rng_source(&mut self, source: RngSource) { self.rng_source = source; }

    pub fn rng_source(&self) -> RngSource { self.rng_source }

    /// PBKDF2 calibration target per keyslot, milliseconds.
    pub fn set_iteration_time_ms(&mut self, ms: u64) { self.iteration_time_ms = ms.max(1); }

    /// Hint for interactive callers; the library never prompts itself.
    pub fn set_password_retry(&mut self, tries: u32) { self.password_retry = tries.max(1); }

    pub fn password_retry(&self) -> u32 { self.password_retry }

    /// Hint for interactive callers: require double entry when adding.
    pub fn set_password_verify(&mut self, verify: bool) { self.password_verify = verify; }

    pub fn password_verify(&self) -> bool { self.password_verify }

    /// Hint for interactive callers, seconds; 0 means no limit.
    pub fn set_timeout(&mut self, seconds: u64) { self.timeout_sec = seconds; }

    pub fn timeout(&self) -> u64 { self.timeout_sec }

    /// LUKS1 format-time payload alignment, sectors.
    pub fn set_data_alignment(&mut self, sectors: u64) {
        self.data_alignment = if sectors == 0 { DEFAULT_DATA_ALIGNMENT } else { sectors };
    }

    /// Extra random/zero pass count for keyslot destruction.
    pub fn set_keyslot_wipe_passes(&mut self, passes: u32) { self.wipe_passes = passes.max(1); }

    /// Detached ciphertext device (LUKS header separate from data).
    pub fn set_data_device(&mut self, device: &Path) -> Result<()> {
        if !device.exists() {
            return Err(Error::NotFound(format!("device {} does not exist", device.display())));
        }
        self.data_device = Some(device.to_path_buf());
        Ok(())
    }

    // ---- logging ----------------------------------------------------

    fn log(&self, level: LogLevel, msg: &str) {
        if level == LogLevel::Error {
            api::set_last_error(msg);
        }
        if let Some(cb) = &self.log_cb {
            cb(level, msg);
        }
        match level {
            LogLevel::Normal => log::info!("{}", msg),
            LogLevel::Error => log::error!("{}", msg),
            LogLevel::Verbose => log::info!("{}", msg),
            LogLevel::Debug => log::debug!("{}", msg),
        }
    }

    /// Funnel for public operations: failures are appended to the
    /// handle's log with the operation named, then handed back unchanged.
    fn done<T>(&self, op: &str, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            self.log(LogLevel::Error, &format!("{}: {}", op, e));
        }
        r
    }

    fn confirm(&self, msg: &str) -> bool {
        match &self.confirm_cb {
            Some(cb) => cb(msg),
            None => true,
        }
    }

    // ---- internal plumbing ------------------------------------------

    fn open_metadata(&self, write: bool) -> Result<File> {
        Ok(OpenOptions::new().read(true).write(write).open(&self.device)?)
    }

    fn require_hdr(&self) -> Result<&Luks1Header> {
        match (&self.crypt_type, &self.hdr) {
            (Some(CryptType::Luks1), Some(hdr)) => Ok(hdr),
            _ => Err(Error::invalid("operation requires a loaded LUKS1 device")),
        }
    }

    fn dm(&mut self) -> Result<&mut DmBackend> {
        if self.dm.is_none() {
            self.dm = Some(DmBackend::new()?);
        }
        Ok(self.dm.as_mut().expect("dm backend just initialized"))
    }

    fn data_device_path(&self) -> &Path {
        self.data_device.as_deref().unwrap_or(&self.device)
    }

    fn data_device_sectors(&self) -> Result<u64> {
        let f = File::open(self.data_device_path())?;
        blkdev_size_sectors(&f)
    }

    /// In-use probe: block devices open O_EXCL while another holder (a
    /// mounted filesystem, an active mapping) exists return EBUSY.
    fn exclusive_check(&self, path: &Path) -> Result<()> {
        let md = std::fs::metadata(path)?;
        use std::os::unix::fs::FileTypeExt;
        if !md.file_type().is_block_device() {
            return Ok(());
        }
        let cpath = std::ffi::CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::invalid("device path contains NUL"))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_EXCL) };
        if fd < 0 {
            let e = std::io::Error::last_os_error();
            return Err(if e.raw_os_error() == Some(libc::EBUSY) {
                Error::Busy(format!("device {} is in use", path.display()))
            } else {
                e.into()
            });
        }
        unsafe { libc::close(fd) };
        Ok(())
    }

    fn bench_iterations(&self, hash: &str, target_ms: u64) -> u32 {
        match bench::pbkdf2_iterations(hash, target_ms) {
            Ok(n) => n,
            Err(_) => bench::ITERATIONS_MIN,
        }
    }

    // ---- format / load ----------------------------------------------

    /// Create a new device of the type given by `params`. For LUKS1 this
    /// writes the on-disk header; for the header-less types it only
    /// records mapping parameters in the handle. No keyslot is enabled
    /// and nothing is activated.
    pub fn format(
        &mut self,
        cipher: &str,
        cipher_mode: &str,
        uuid: Option<&str>,
        volume_key: Option<&[u8]>,
        volume_key_size: usize,
        params: &CryptParams,
    ) -> Result<()> {
        let r = self.format_inner(cipher, cipher_mode, uuid, volume_key, volume_key_size, params);
        self.done("format", r)
    }

    fn format_inner(
        &mut self,
        cipher: &str,
        cipher_mode: &str,
        uuid: Option<&str>,
        volume_key: Option<&[u8]>,
        volume_key_size: usize,
        params: &CryptParams,
    ) -> Result<()> {
        if cipher.is_empty() || cipher.contains(' ') || cipher_mode.contains(' ') {
            return Err(Error::invalid("malformed cipher specification"));
        }
        let crypt_type = params.crypt_type();
        log::debug!(
            "formatting {} as {} with {}-{}",
            self.device.display(),
            crypt_type,
            cipher,
            cipher_mode
        );

        match params {
            CryptParams::Plain(p) => {
                if p.hash.is_empty() {
                    return Err(Error::invalid("plain mapping needs a passphrase hash"));
                }
                self.plain = Some(PlainState {
                    cipher: cipher.to_string(),
                    cipher_mode: cipher_mode.to_string(),
                    key_size: volume_key_size,
                    hash: p.hash.clone(),
                    offset: p.offset,
                    skip: p.skip,
                    size: p.size,
                });
                self.crypt_type = Some(CryptType::Plain);
                self.hdr = None;
                Ok(())
            }
            CryptParams::LoopAes(p) => {
                self.loopaes = Some(LoopaesState {
                    cipher: cipher.to_string(),
                    key_size: volume_key_size,
                    hash: p.hash.clone(),
                    offset: p.offset,
                    skip: p.skip,
                });
                self.crypt_type = Some(CryptType::LoopAes);
                self.hdr = None;
                Ok(())
            }
            CryptParams::Luks1(p) => {
                // LUKS1 keyslot material is encrypted in user space, so
                // the cipher must be one the primitives layer implements
                let sizes = cryptolib::cipher::cipher_key_sizes(cipher, cipher_mode)
                    .map_err(|_| Error::Unsupported(format!("cipher {}-{}", cipher, cipher_mode)))?;
                if !sizes.contains(&volume_key_size) {
                    return Err(Error::invalid(format!(
                        "key size {} invalid for {}-{}",
                        volume_key_size, cipher, cipher_mode
                    )));
                }
                // a format while the device is activated or mounted must
                // fail without touching anything
                self.exclusive_check(&self.device.clone())?;

                if let Some(d) = &p.data_device {
                    self.set_data_device(&d.clone())?;
                }

                let vk = match volume_key {
                    Some(k) => VolumeKey::alloc(volume_key_size, Some(k))?,
                    None => VolumeKey::generate(volume_key_size, self.rng_source)?,
                };

                // the digest check runs on every unlock attempt, so it is
                // calibrated to a fraction of the keyslot target
                let mk_iter = self.bench_iterations(&p.hash, (self.iteration_time_ms / 8).max(1));
                let alignment =
                    if p.data_alignment == 0 { self.data_alignment } else { p.data_alignment };
                let hdr = Luks1Header::generate(
                    cipher,
                    cipher_mode,
                    &p.hash,
                    volume_key_size as u32,
                    uuid,
                    alignment,
                    &vk,
                    mk_iter,
                )?;

                let dev = self.open_metadata(true)?;
                let device_sectors = blkdev_size_sectors(&dev)?;
                if (hdr.payload_offset as u64) > device_sectors {
                    return Err(Error::invalid(format!(
                        "device too small: payload starts at sector {} but device has {}",
                        hdr.payload_offset, device_sectors
                    )));
                }
                hdr.write_to(&dev)?;

                self.log(
                    LogLevel::Verbose,
                    &format!("formatted LUKS1 device, uuid {}", hdr.uuid),
                );
                self.hdr = Some(hdr);
                self.crypt_type = Some(CryptType::Luks1);
                self.volume_key = Some(vk);
                Ok(())
            }
        }
    }

    /// Load device parameters from the on-disk header.
    pub fn load(&mut self, requested_type: Option<CryptType>) -> Result<()> {
        let r = self.load_inner(requested_type);
        self.done("load", r)
    }

    fn load_inner(&mut self, requested_type: Option<CryptType>) -> Result<()> {
        match requested_type {
            None | Some(CryptType::Luks1) => {}
            Some(t) => {
                return Err(Error::invalid(format!("{} devices carry no metadata to load", t)))
            }
        }
        let dev = self.open_metadata(false)?;
        let hdr = Luks1Header::read_from(&dev)?;
        log::debug!("loaded LUKS1 header, uuid {}", hdr.uuid);
        self.hdr = Some(hdr);
        self.crypt_type = Some(CryptType::Luks1);
        Ok(())
    }

    /// Set (or generate) a new UUID on an existing LUKS1 header.
    pub fn set_uuid(&mut self, uuid: Option<&str>) -> Result<()> {
        let r = self.set_uuid_inner(uuid);
        self.done("set_uuid", r)
    }

    fn set_uuid_inner(&mut self, uuid: Option<&str>) -> Result<()> {
        self.require_hdr()?;
        let new_uuid = match uuid {
            Some(u) => {
                if u.is_empty() || u.len() >= 40 || !u.is_ascii() {
                    return Err(Error::invalid(format!("malformed UUID \"{}\"", u)));
                }
                u.to_string()
            }
            None => uuid::Uuid::new_v4().hyphenated().to_string(),
        };
        let dev = self.open_metadata(true)?;
        let hdr = self.hdr.as_mut().expect("header checked above");
        hdr.uuid = new_uuid;
        hdr.write_to(&dev)
    }

    // ---- keyslots ---------------------------------------------------

    /// Recover the master key: from the supplied credential if given,
    /// else from the key cached by `format`/`activate`.
    fn recover_vk(
        &self,
        passphrase: Option<&[u8]>,
        slot: Option<usize>,
    ) -> Result<(Option<usize>, VolumeKey)> {
        let hdr = self.require_hdr()?;
        match passphrase {
            Some(p) => {
                let dev = self.open_metadata(false)?;
                let (s, vk) = keyslot::open_keyslot(&dev, hdr, slot, p)?;
                Ok((Some(s), vk))
            }
            None => match &self.volume_key {
                Some(vk) => Ok((None, VolumeKey::alloc(vk.len(), Some(vk.as_bytes()))?)),
                None => Err(Error::invalid(
                    "no volume key available; supply the existing credential",
                )),
            },
        }
    }

    /// Add a keyslot. `passphrase` (the existing credential) may be
    /// `None` right after `format`, which cached the volume key.
    pub fn keyslot_add_by_passphrase(
        &mut self,
        slot: Option<usize>,
        passphrase: Option<&[u8]>,
        new_passphrase: &[u8],
    ) -> Result<usize> {
        let r = self.keyslot_add_inner(slot, passphrase, new_passphrase);
        self.done("keyslot add", r)
    }

    fn keyslot_add_inner(
        &mut self,
        slot: Option<usize>,
        passphrase: Option<&[u8]>,
        new_passphrase: &[u8],
    ) -> Result<usize> {
        let (_, vk) = self.recover_vk(passphrase, None)?;
        let hdr = self.hdr.as_ref().expect("recover_vk checked the header");
        let iterations = self.bench_iterations(&hdr.hash_spec, self.iteration_time_ms);
        let dev = self.open_metadata(true)?;
        let hdr = self.hdr.as_mut().expect("header checked above");
        let s = keyslot::add_keyslot(&dev, hdr, slot, new_passphrase, &vk, iterations)?;
        self.log(LogLevel::Verbose, &format!("enabled keyslot {}", s));
        Ok(s)
    }

    /// Both credentials come from files (or `-` for stdin).
    pub fn keyslot_add_by_keyfile(
        &mut self,
        slot: Option<usize>,
        keyfile: Option<&Path>,
        keyfile_size: Option<usize>,
        new_keyfile: &Path,
        new_keyfile_size: Option<usize>,
    ) -> Result<usize> {
        let r = (|| {
            let old = match keyfile {
                Some(p) => Some(read_keyfile(p, keyfile_size)?),
                None => None,
            };
            let new = read_keyfile(new_keyfile, new_keyfile_size)?;
            self.keyslot_add_inner(slot, old.as_deref(), &new)
        })();
        self.done("keyslot add by keyfile", r)
    }

    /// Add a keyslot from an explicitly supplied volume key (or the
    /// cached one).
    pub fn keyslot_add_by_volume_key(
        &mut self,
        slot: Option<usize>,
        volume_key: Option<&[u8]>,
        passphrase: &[u8],
    ) -> Result<usize> {
        let r = (|| {
            let hdr = self.require_hdr()?;
            let vk = match volume_key {
                Some(k) => {
                    let vk = VolumeKey::alloc(hdr.key_bytes as usize, Some(k))?;
                    if !hdr.check_mk_digest(vk.as_bytes())? {
                        return Err(Error::WrongPassphrase);
                    }
                    vk
                }
                None => self.recover_vk(None, None)?.1,
            };
            let iterations = self.bench_iterations(&hdr.hash_spec, self.iteration_time_ms);
            let dev = self.open_metadata(true)?;
            let hdr = self.hdr.as_mut().expect("header checked above");
            let s = keyslot::add_keyslot(&dev, hdr, slot, passphrase, &vk, iterations)?;
            Ok(s)
        })();
        self.done("keyslot add by volume key", r)
    }

    /// Destroy a keyslot: anti-forensic wipe of the material region, then
    /// the slot entry is disabled. Destroying the last active slot makes
    /// the data permanently unreachable, so it is gated on the confirm
    /// callback. No passphrase verification is involved.
    pub fn keyslot_destroy(&mut self, slot: usize) -> Result<()> {
        let r = self.keyslot_destroy_inner(slot);
        self.done("keyslot destroy", r)
    }

    fn keyslot_destroy_inner(&mut self, slot: usize) -> Result<()> {
        let hdr = self.require_hdr()?;
        if hdr.keyslot_info(slot) == KeyslotInfo::ActiveLast
            && !self.confirm(&format!(
                "keyslot {} is the last active slot; destroying it makes the volume permanently unreadable",
                slot
            ))
        {
            return Err(Error::invalid("destruction of last keyslot declined"));
        }
        let dev = self.open_metadata(true)?;
        let wipe_passes = self.wipe_passes;
        let hdr = self.hdr.as_mut().expect("header checked above");
        keyslot::destroy_keyslot(&dev, hdr, slot, wipe_passes)?;
        self.log(LogLevel::Verbose, &format!("destroyed keyslot {}", slot));
        Ok(())
    }

    pub fn keyslot_status(&self, slot: usize) -> KeyslotInfo {
        match &self.hdr {
            Some(hdr) => hdr.keyslot_info(slot),
            None => KeyslotInfo::Invalid,
        }
    }

    /// Keyslot count of a device type.
    pub fn keyslot_max(crypt_type: CryptType) -> usize {
        match crypt_type {
            CryptType::Luks1 => MAX_KEYSLOTS,
            _ => 1,
        }
    }

    // ---- activation -------------------------------------------------

    /// Table capabilities a cipher mode needs from the kernel.
    fn required_caps(cipher_spec: &str, flags: CryptActivate) -> DmCaps {
        let mut need = DmCaps::empty();
        if cipher_spec.ends_with("plain64") {
            need |= DmCaps::PLAIN64;
        }
        if cipher_spec.ends_with("-lmk") {
            need |= DmCaps::LMK;
        }
        if flags.contains(CryptActivate::ALLOW_DISCARDS) {
            need |= DmCaps::DISCARDS;
        }
        need
    }

    fn activate_mapping(
        &mut self,
        name: &str,
        crypt_type: CryptType,
        cipher_spec: &str,
        key: &[u8],
        iv_offset: u64,
        data_offset: u64,
        requested_size: u64,
        flags: CryptActivate,
    ) -> Result<()> {
        backend::devmapper::check_name(name)?;
        if !flags.contains(CryptActivate::SHARED) {
            self.exclusive_check(&self.data_device_path().to_path_buf())?;
        }

        let device_sectors = self.data_device_sectors()?;
        if data_offset >= device_sectors && requested_size == 0 {
            return Err(Error::invalid(format!(
                "data offset {} past the end of the device ({} sectors)",
                data_offset, device_sectors
            )));
        }
        let size = if requested_size == 0 { device_sectors - data_offset } else { requested_size };

        let need = Self::required_caps(cipher_spec, flags);
        let caps = self.dm()?.caps()?;
        if !caps.contains(need) {
            return Err(Error::Unsupported(format!(
                "kernel crypt target lacks support required by {}",
                cipher_spec
            )));
        }

        let uuid = match crypt_type {
            CryptType::Luks1 => {
                let hdr = self.require_hdr()?;
                dm_prepare_uuid(name, crypt_type, Some(&hdr.uuid))?
            }
            _ => dm_prepare_uuid(name, crypt_type, None)?,
        };

        let device = self.data_device_path().to_string_lossy().to_string();
        let target = CryptTarget {
            cipher: cipher_spec,
            key,
            iv_offset,
            device: &device,
            data_offset,
            size,
            allow_discards: flags.contains(CryptActivate::ALLOW_DISCARDS),
        };
        log::debug!(
            "activating {} as {}: {} sectors of {} at offset {}",
            name,
            cipher_spec,
            size,
            device,
            data_offset
        );
        self.dm()?.create_device(name, &uuid, &target, flags.contains(CryptActivate::READ_ONLY))
    }

    fn activate_luks(&mut self, name: &str, vk: &VolumeKey, flags: CryptActivate) -> Result<()> {
        let hdr = self.require_hdr()?;
        let cipher_spec = format!("{}-{}", hdr.cipher_name, hdr.cipher_mode);
        let data_offset = hdr.payload_offset as u64;
        let key = SecureBuf::from_slice(vk.as_bytes());
        let r = self.activate_mapping(
            name,
            CryptType::Luks1,
            &cipher_spec,
            &key,
            0,
            data_offset,
            0,
            flags,
        );
        drop(key);
        r
    }

    /// Unlock with a passphrase: LUKS iterates the keyslots, plain hashes
    /// the passphrase. With `name` of `None` only the credential check
    /// runs. Returns the unlocked slot index.
    pub fn activate_by_passphrase(
        &mut self,
        name: Option<&str>,
        slot: Option<usize>,
        passphrase: &[u8],
        flags: CryptActivate,
    ) -> Result<usize> {
        let r = self.activate_by_passphrase_inner(name, slot, passphrase, flags);
        self.done("activate", r)
    }

    fn activate_by_passphrase_inner(
        &mut self,
        name: Option<&str>,
        slot: Option<usize>,
        passphrase: &[u8],
        flags: CryptActivate,
    ) -> Result<usize> {
        match self.crypt_type {
            Some(CryptType::Luks1) => {
                let hdr = self.require_hdr()?;
                let dev = self.open_metadata(false)?;
                let (s, vk) = keyslot::open_keyslot(&dev, hdr, slot, passphrase)?;
                if let Some(name) = name {
                    self.activate_luks(name, &vk, flags)?;
                }
                self.volume_key = Some(vk);
                Ok(s)
            }
            Some(CryptType::Plain) => {
                let name = name.ok_or_else(|| {
                    Error::invalid("plain devices cannot check a passphrase without activating")
                })?;
                let plain = self
                    .plain
                    .as_ref()
                    .ok_or_else(|| Error::invalid("plain parameters not set; format first"))?;
                let key = kdf::plain_hash(&plain.hash, plain.key_size, passphrase)?;
                let cipher_spec = format!("{}-{}", plain.cipher, plain.cipher_mode);
                let (skip, offset, size) = (plain.skip, plain.offset, plain.size);
                self.activate_mapping(
                    name,
                    CryptType::Plain,
                    &cipher_spec,
                    &key,
                    skip,
                    offset,
                    size,
                    flags,
                )?;
                Ok(0)
            }
            Some(CryptType::LoopAes) => {
                Err(Error::invalid("loop-AES volumes unlock with a keyfile, not a passphrase"))
            }
            None => Err(Error::invalid("device type not established; format or load first")),
        }
    }

    /// Unlock with a keyfile. For LUKS and plain devices the file content
    /// is the passphrase; for loop-AES it is the multi-record key list.
    pub fn activate_by_keyfile(
        &mut self,
        name: Option<&str>,
        slot: Option<usize>,
        keyfile: &Path,
        keyfile_size: Option<usize>,
        flags: CryptActivate,
    ) -> Result<usize> {
        let r = self.activate_by_keyfile_inner(name, slot, keyfile, keyfile_size, flags);
        self.done("activate by keyfile", r)
    }

    fn activate_by_keyfile_inner(
        &mut self,
        name: Option<&str>,
        slot: Option<usize>,
        keyfile: &Path,
        keyfile_size: Option<usize>,
        flags: CryptActivate,
    ) -> Result<usize> {
        let content = read_keyfile(keyfile, keyfile_size)?;
        match self.crypt_type {
            Some(CryptType::LoopAes) => {
                let name = name
                    .ok_or_else(|| Error::invalid("loop-AES activation requires a mapping name"))?;
                let la = self
                    .loopaes
                    .as_ref()
                    .ok_or_else(|| Error::invalid("loop-AES parameters not set; format first"))?;
                let (key, keys_count) =
                    loopaes::parse_keyfile(&content, la.hash.as_deref(), la.key_size)?;
                let cipher_spec = loopaes::compose_cipher(&la.cipher, keys_count);
                let (skip, offset) = (la.skip, la.offset);
                self.log(
                    LogLevel::Verbose,
                    &format!("activating loop-AES mapping with {} keys", keys_count),
                );
                self.activate_mapping(
                    name,
                    CryptType::LoopAes,
                    &cipher_spec,
                    &key,
                    skip,
                    offset,
                    0,
                    flags,
                )?;
                Ok(0)
            }
            _ => self.activate_by_passphrase_inner(name, slot, &content, flags),
        }
    }

    /// Activate from an explicit volume key, or verify it when `name` is
    /// `None`.
    pub fn activate_by_volume_key(
        &mut self,
        name: Option<&str>,
        volume_key: Option<&[u8]>,
        flags: CryptActivate,
    ) -> Result<()> {
        let r = self.activate_by_volume_key_inner(name, volume_key, flags);
        self.done("activate by volume key", r)
    }

    fn activate_by_volume_key_inner(
        &mut self,
        name: Option<&str>,
        volume_key: Option<&[u8]>,
        flags: CryptActivate,
    ) -> Result<()> {
        match self.crypt_type {
            Some(CryptType::Luks1) => {
                let hdr = self.require_hdr()?;
                let vk = match volume_key {
                    Some(k) => VolumeKey::alloc(hdr.key_bytes as usize, Some(k))?,
                    None => self.recover_vk(None, None)?.1,
                };
                if !self.hdr.as_ref().expect("header checked").check_mk_digest(vk.as_bytes())? {
                    return Err(Error::WrongPassphrase);
                }
                if let Some(name) = name {
                    self.activate_luks(name, &vk, flags)?;
                }
                self.volume_key = Some(vk);
                Ok(())
            }
            Some(CryptType::Plain) => {
                let name =
                    name.ok_or_else(|| Error::invalid("plain devices cannot verify a volume key"))?;
                let plain = self
                    .plain
                    .as_ref()
                    .ok_or_else(|| Error::invalid("plain parameters not set; format first"))?;
                let key = volume_key
                    .ok_or_else(|| Error::invalid("plain activation by key needs the key"))?;
                if key.len() != plain.key_size {
                    return Err(Error::invalid("volume key length mismatch"));
                }
                let cipher_spec = format!("{}-{}", plain.cipher, plain.cipher_mode);
                let key = SecureBuf::from_slice(key);
                let (skip, offset, size) = (plain.skip, plain.offset, plain.size);
                self.activate_mapping(
                    name,
                    CryptType::Plain,
                    &cipher_spec,
                    &key,
                    skip,
                    offset,
                    size,
                    flags,
                )
            }
            Some(CryptType::LoopAes) => {
                Err(Error::invalid("loop-AES volumes unlock with a keyfile"))
            }
            None => Err(Error::invalid("device type not established; format or load first")),
        }
    }

    /// Tear down a mapping.
    pub fn deactivate(&mut self, name: &str) -> Result<()> {
        let r = (|| {
            match self.dm()?.status(name)? {
                CryptStatusInfo::Inactive => {
                    return Err(Error::NotFound(format!("no active mapping named {}", name)))
                }
                CryptStatusInfo::Busy => {
                    return Err(Error::Busy(format!("mapping {} is opened by another user", name)))
                }
                _ => {}
            }
            self.dm()?.remove_device(name, false, 0)
        })();
        self.done("deactivate", r)
    }

    // ---- suspend / resume / re-key ----------------------------------

    /// Freeze I/O on the mapping and scrub the key from kernel memory.
    pub fn suspend(&mut self, name: &str) -> Result<()> {
        let r = (|| {
            self.require_hdr()?;
            self.dm()?.suspend_and_wipe_key(name)
        })();
        self.done("suspend", r)
    }

    /// Recover the key from a keyslot and hand it back to the suspended
    /// mapping. The key lives only in wiping buffers for the duration of
    /// the call.
    pub fn resume_by_passphrase(
        &mut self,
        name: &str,
        slot: Option<usize>,
        passphrase: &[u8],
    ) -> Result<usize> {
        let r = (|| {
            let hdr = self.require_hdr()?;
            let dev = self.open_metadata(false)?;
            let (s, vk) = keyslot::open_keyslot(&dev, hdr, slot, passphrase)?;
            self.dm()?.resume_and_reinstate_key(name, vk.as_bytes())?;
            Ok(s)
        })();
        self.done("resume", r)
    }

    pub fn resume_by_keyfile(
        &mut self,
        name: &str,
        slot: Option<usize>,
        keyfile: &Path,
        keyfile_size: Option<usize>,
    ) -> Result<usize> {
        let r = (|| {
            let content = read_keyfile(keyfile, keyfile_size)?;
            let hdr = self.require_hdr()?;
            let dev = self.open_metadata(false)?;
            let (s, vk) = keyslot::open_keyslot(&dev, hdr, slot, &content)?;
            self.dm()?.resume_and_reinstate_key(name, vk.as_bytes())?;
            Ok(s)
        })();
        self.done("resume by keyfile", r)
    }

    /// Grow or shrink an active mapping. `new_size` of 0 re-reads the
    /// backing device size. The kernel applies the swap atomically on
    /// resume.
    pub fn resize(&mut self, name: &str, new_size: u64) -> Result<()> {
        let r = self.resize_inner(name, new_size);
        self.done("resize", r)
    }

    fn resize_inner(&mut self, name: &str, new_size: u64) -> Result<()> {
        let q: DmQuery = self.dm()?.query_table(name)?;
        let size = if new_size == 0 {
            let f = File::open(&q.device)?;
            let dev_sectors = blkdev_size_sectors(&f)?;
            dev_sectors
                .checked_sub(q.data_offset)
                .ok_or_else(|| Error::invalid("backing device shrank below the data offset"))?
        } else {
            new_size
        };
        if size == q.size {
            return Ok(());
        }
        let target = CryptTarget {
            cipher: &q.cipher,
            key: &q.key,
            iv_offset: q.iv_offset,
            device: &q.device,
            data_offset: q.data_offset,
            size,
            allow_discards: false,
        };
        self.dm()?.reload_device(name, &target, q.read_only)
    }

    // ---- introspection ----------------------------------------------

    pub fn status(&mut self, name: &str) -> CryptStatusInfo {
        match self.dm().and_then(|dm| dm.status(name)) {
            Ok(s) => s,
            Err(e) => {
                log::debug!("status of {} unavailable: {}", name, e);
                CryptStatusInfo::Invalid
            }
        }
    }

    /// Copy of the volume key for internal callers: from a credential, or
    /// the key cached by format/activate. Wiping buffer.
    pub fn volume_key_get(
        &self,
        slot: Option<usize>,
        passphrase: Option<&[u8]>,
    ) -> Result<(Option<usize>, SecureBuf)> {
        let r = (|| {
            let (s, vk) = self.recover_vk(passphrase, slot)?;
            Ok((s, SecureBuf::from_slice(vk.as_bytes())))
        })();
        self.done("volume key get", r)
    }

    /// Check a candidate volume key against the master-key digest.
    pub fn volume_key_verify(&self, volume_key: &[u8]) -> Result<()> {
        let r = (|| {
            let hdr = self.require_hdr()?;
            if hdr.check_mk_digest(volume_key)? {
                Ok(())
            } else {
                Err(Error::WrongPassphrase)
            }
        })();
        self.done("volume key verify", r)
    }

    /// Human-readable header dump, mirrored to the log at Normal level.
    /// No key material, digests and salts only.
    pub fn dump(&self) -> Result<String> {
        use std::fmt::Write;
        let hdr = self.require_hdr()?;
        let mut out = String::new();
        let _ = writeln!(out, "LUKS header information for {}", self.device.display());
        let _ = writeln!(out, "Version:        \t{}", 1);
        let _ = writeln!(out, "Cipher name:    \t{}", hdr.cipher_name);
        let _ = writeln!(out, "Cipher mode:    \t{}", hdr.cipher_mode);
        let _ = writeln!(out, "Hash spec:      \t{}", hdr.hash_spec);
        let _ = writeln!(out, "Payload offset: \t{}", hdr.payload_offset);
        let _ = writeln!(out, "MK bits:        \t{}", hdr.key_bytes * 8);
        let _ = writeln!(out, "MK digest:      \t{}", hex::encode(hdr.mk_digest));
        let _ = writeln!(out, "MK salt:        \t{}", hex::encode(hdr.mk_digest_salt));
        let _ = writeln!(out, "MK iterations:  \t{}", hdr.mk_digest_iter);
        let _ = writeln!(out, "UUID:           \t{}", hdr.uuid);
        for (i, ks) in hdr.keyslots.iter().enumerate() {
            if ks.is_enabled() {
                let _ = writeln!(out, "Key Slot {}: ENABLED", i);
                let _ = writeln!(out, "\tIterations:         \t{}", ks.iterations);
                let _ = writeln!(out, "\tSalt:               \t{}", hex::encode(ks.salt));
                let _ = writeln!(out, "\tKey material offset:\t{}", ks.material_offset);
                let _ = writeln!(out, "\tAF stripes:         \t{}", ks.stripes);
            } else {
                let _ = writeln!(out, "Key Slot {}: DISABLED", i);
            }
        }
        self.log(LogLevel::Normal, &out);
        Ok(out)
    }

    pub fn get_type(&self) -> Option<CryptType> { self.crypt_type }

    pub fn cipher(&self) -> Option<&str> {
        match self.crypt_type? {
            CryptType::Luks1 => self.hdr.as_ref().map(|h| h.cipher_name.as_str()),
            CryptType::Plain => self.plain.as_ref().map(|p| p.cipher.as_str()),
            CryptType::LoopAes => self.loopaes.as_ref().map(|l| l.cipher.as_str()),
        }
    }

    pub fn cipher_mode(&self) -> Option<&str> {
        match self.crypt_type? {
            CryptType::Luks1 => self.hdr.as_ref().map(|h| h.cipher_mode.as_str()),
            CryptType::Plain => self.plain.as_ref().map(|p| p.cipher_mode.as_str()),
            CryptType::LoopAes => Some("cbc-lmk"),
        }
    }

    pub fn uuid(&self) -> Option<&str> { self.hdr.as_ref().map(|h| h.uuid.as_str()) }

    pub fn device_name(&self) -> &Path { &self.device }

    pub fn data_offset(&self) -> u64 {
        match self.crypt_type {
            Some(CryptType::Luks1) => {
                self.hdr.as_ref().map(|h| h.payload_offset as u64).unwrap_or(0)
            }
            Some(CryptType::Plain) => self.plain.as_ref().map(|p| p.offset).unwrap_or(0),
            Some(CryptType::LoopAes) => self.loopaes.as_ref().map(|l| l.offset).unwrap_or(0),
            None => 0,
        }
    }

    pub fn iv_offset(&self) -> u64 {
        match self.crypt_type {
            Some(CryptType::Plain) => self.plain.as_ref().map(|p| p.skip).unwrap_or(0),
            Some(CryptType::LoopAes) => self.loopaes.as_ref().map(|l| l.skip).unwrap_or(0),
            _ => 0,
        }
    }

    pub fn volume_key_size(&self) -> usize {
        match self.crypt_type {
            Some(CryptType::Luks1) => self.hdr.as_ref().map(|h| h.key_bytes as usize).unwrap_or(0),
            Some(CryptType::Plain) => self.plain.as_ref().map(|p| p.key_size).unwrap_or(0),
            Some(CryptType::LoopAes) => self.loopaes.as_ref().map(|l| l.key_size).unwrap_or(0),
            None => 0,
        }
    }

    // ---- header backup / restore ------------------------------------

    /// Copy the header and all keyslot material to `backup_file`. The
    /// file is created exclusively; an existing file is never clobbered
    /// (it may be somebody's only copy of another header).
    pub fn header_backup(&self, backup_file: &Path) -> Result<()> {
        let r = self.header_backup_inner(backup_file);
        self.done("header backup", r)
    }

    fn header_backup_inner(&self, backup_file: &Path) -> Result<()> {
        let dev = self.open_metadata(false)?;
        let hdr = Luks1Header::read_from(&dev)?;
        let backup_bytes = hdr.payload_offset as u64 * SECTOR_SIZE as u64;

        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(backup_file)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::invalid(format!(
                        "backup file {} already exists, not overwriting",
                        backup_file.display()
                    ))
                } else {
                    Error::from(e)
                }
            })?;

        use std::os::unix::fs::FileExt;
        let mut buf = vec![0u8; 64 * 1024];
        let mut off = 0u64;
        use std::io::Write;
        while off < backup_bytes {
            let chunk = buf.len().min((backup_bytes - off) as usize);
            dev.read_exact_at(&mut buf[..chunk], off)?;
            out.write_all(&buf[..chunk])?;
            off += chunk as u64;
        }
        out.sync_all()?;
        self.log(
            LogLevel::Verbose,
            &format!("backed up {} bytes of header and keyslots", backup_bytes),
        );
        Ok(())
    }

    /// Write a header backup onto the device after validating it. The
    /// previous header (and all its keyslots) is gone afterwards.
    pub fn header_restore(&mut self, backup_file: &Path) -> Result<()> {
        let r = self.header_restore_inner(backup_file);
        self.done("header restore", r)
    }

    fn header_restore_inner(&mut self, backup_file: &Path) -> Result<()> {
        let backup = std::fs::read(backup_file)?;
        let hdr = Luks1Header::from_bytes(&backup)?;
        let expected = hdr.payload_offset as u64 * SECTOR_SIZE as u64;
        if (backup.len() as u64) != expected {
            return Err(Error::invalid(format!(
                "backup is {} bytes but the header describes {}",
                backup.len(),
                expected
            )));
        }
        let dev = self.open_metadata(true)?;
        let device_sectors = blkdev_size_sectors(&dev)?;
        if device_sectors < hdr.payload_offset as u64 {
            return Err(Error::invalid("device too small for this header backup"));
        }
        use std::os::unix::fs::FileExt;
        dev.write_all_at(&backup, 0)?;
        dev.sync_all()?;

        self.hdr = Some(hdr);
        self.crypt_type = Some(CryptType::Luks1);
        self.volume_key = None;
        self.log(LogLevel::Normal, "header and keyslots restored from backup");
        Ok(())
    }
}

impl std::fmt::Debug for CryptDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptDevice")
            .field("device", &self.device)
            .field("type", &self.crypt_type)
            .field("has_volume_key", &self.volume_key.is_some())
            .finish()
    }
}

/// Lock (or unlock) all process memory against paging. Affects the whole
/// process, needs CAP_IPC_LOCK; returns whether the kernel accepted it.
pub fn memory_lock(lock: bool) -> bool {
    let rc = if lock {
        unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) }
    } else {
        unsafe { libc::munlockall() }
    };
    if rc != 0 {
        log::debug!("memory {}lock failed: {}", if lock { "" } else { "un" }, std::io::Error::last_os_error());
    }
    rc == 0
}

/// Read a credential file, `-` meaning stdin. `size` bounds the read;
/// everything is capped at [`MAX_KEYFILE_SIZE`].
fn read_keyfile(path: &Path, size: Option<usize>) -> Result<SecureBuf> {
    let cap = size.unwrap_or(MAX_KEYFILE_SIZE).min(MAX_KEYFILE_SIZE);
    let mut data = Vec::new();
    if path == Path::new("-") {
        std::io::stdin().take(cap as u64).read_to_end(&mut data)?;
    } else {
        let f = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("keyfile {} does not exist", path.display()))
            }
            _ => Error::from(e),
        })?;
        f.take(cap as u64).read_to_end(&mut data)?;
    }
    if data.is_empty() {
        return Err(Error::invalid("keyfile is empty"));
    }
    let buf = SecureBuf::from_slice(&data);
    use zeroize::Zeroize;
    data.zeroize();
    Ok(buf)
}

//! Box storage engine
//!
//! Opens named boxes, replays their log files into memory, and appends
//! mutations durably. Recovery policy on a corrupt file: copy it to
//! `corruption_backups/`, delete the original, open a fresh empty box,
//! log the data loss. `open` never fails because of corruption; the app
//! must start with degraded state rather than not at all.

use crate::cipher::BoxCipher;
use crate::descriptor::{BoxRegistry, EncryptionPolicy};
use crate::error::{Result, StorageError};
use crate::format::{self, BoxEntry};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vital_core::{Counter, TelemetrySink};

/// Directory for corruption backups, relative to the data dir.
pub const CORRUPTION_BACKUP_DIR: &str = "corruption_backups";
/// Directory for migration backups, relative to the data dir.
pub const MIGRATION_BACKUP_DIR: &str = "migration_backups";

/// Filename-safe ISO timestamp for backup files.
pub(crate) fn iso_stamp() -> String {
    Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string()
}

/// One open box: an in-memory map backed by an append-only log file.
pub struct BoxHandle {
    name: String,
    path: PathBuf,
    encrypted: bool,
    map: RwLock<BTreeMap<String, Vec<u8>>>,
    file: Mutex<File>,
}

impl BoxHandle {
    /// Box name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether new records in this box are written encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Raw value bytes for a key.
    pub fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    /// Append a put durably, then make it visible.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let entry = BoxEntry::Put {
            key: key.to_string(),
            value: value.clone(),
        };
        self.append(&entry)?;
        self.map.write().insert(key.to_string(), value);
        Ok(())
    }

    /// Append a delete durably, then make it visible.
    pub fn delete_raw(&self, key: &str) -> Result<()> {
        let entry = BoxEntry::Delete {
            key: key.to_string(),
        };
        self.append(&entry)?;
        self.map.write().remove(key);
        Ok(())
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the box holds no records.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Whether a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    /// Snapshot of the full raw map.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.map.read().clone()
    }

    fn append(&self, entry: &BoxEntry) -> Result<()> {
        let bytes = format::encode_entry(entry);
        let mut file = self.file.lock();
        file.write_all(&bytes)?;
        file.sync_data()?;
        Ok(())
    }
}

/// Typed read/write access to one box through the record codec.
///
/// Records are serialized as JSON; encrypted boxes wrap the bytes in the
/// AES-GCM envelope. Reads detect the envelope per record, so a box that
/// gained encryption mid-life stays readable. The cipher is resolved
/// through the engine on every call, so a committed key rotation is
/// picked up by live views.
pub struct TypedBox<T> {
    engine: Arc<StorageEngine>,
    handle: Arc<BoxHandle>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> TypedBox<T> {
    /// Decode a record.
    pub fn get(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.handle.get_raw(key) else {
            return Ok(None);
        };
        let plain = self.decode_raw(&raw)?;
        let value = serde_json::from_slice(&plain).map_err(|e| StorageError::Codec {
            box_name: self.handle.name().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(value))
    }

    /// Encode and durably write a record.
    pub fn put(&self, key: &str, value: &T) -> Result<()> {
        let bytes = self.encode_value(value)?;
        self.handle.put_raw(key, bytes)
    }

    /// Delete a record.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.handle.delete_raw(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.handle.keys()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.handle.len()
    }

    /// Whether the box holds no records.
    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    /// The underlying handle.
    pub fn handle(&self) -> &Arc<BoxHandle> {
        &self.handle
    }

    /// Encode a record to the bytes a journal write would carry.
    pub fn encode_value(&self, value: &T) -> Result<Vec<u8>> {
        let plain = serde_json::to_vec(value).map_err(|e| StorageError::Codec {
            box_name: self.handle.name().to_string(),
            reason: e.to_string(),
        })?;
        match (self.engine.cipher(), self.handle.is_encrypted()) {
            (Some(cipher), true) => cipher.encrypt(&plain),
            _ => Ok(plain),
        }
    }

    /// Decode raw stored bytes to a record.
    pub fn decode_raw(&self, raw: &[u8]) -> Result<Vec<u8>> {
        if BoxCipher::is_encrypted(raw) {
            match self.engine.cipher() {
                Some(cipher) => cipher.decrypt(raw),
                None => Err(StorageError::Crypto(format!(
                    "box '{}' holds encrypted records but no cipher is loaded",
                    self.handle.name()
                ))),
            }
        } else {
            Ok(raw.to_vec())
        }
    }
}

/// The storage engine: registry-driven box opening with recovery.
pub struct StorageEngine {
    data_dir: PathBuf,
    registry: Arc<BoxRegistry>,
    cipher: RwLock<Option<Arc<BoxCipher>>>,
    boxes: RwLock<BTreeMap<String, Arc<BoxHandle>>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl StorageEngine {
    /// Create an engine over a data directory.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        registry: Arc<BoxRegistry>,
        cipher: Option<Arc<BoxCipher>>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(StorageEngine {
            data_dir,
            registry,
            cipher: RwLock::new(cipher),
            boxes: RwLock::new(BTreeMap::new()),
            telemetry,
        })
    }

    /// The data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The box registry.
    pub fn registry(&self) -> &Arc<BoxRegistry> {
        &self.registry
    }

    /// Path of a box file.
    pub fn box_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", name))
    }

    /// Replace the active cipher (rotation commit).
    pub fn set_cipher(&self, cipher: Option<Arc<BoxCipher>>) {
        *self.cipher.write() = cipher;
    }

    /// The active cipher, if any.
    pub fn cipher(&self) -> Option<Arc<BoxCipher>> {
        self.cipher.read().clone()
    }

    /// Open every registered box; returns name → opened-encrypted, the
    /// input to policy enforcement.
    pub fn open_registered(&self) -> Result<BTreeMap<String, bool>> {
        let mut opened = BTreeMap::new();
        for descriptor in self.registry.all() {
            let handle = self.open_box(&descriptor.name)?;
            opened.insert(descriptor.name.clone(), handle.is_encrypted());
        }
        Ok(opened)
    }

    /// Open one registered box, recovering from corruption.
    ///
    /// Missing or empty files become fresh boxes. Corrupt files are
    /// backed up to `corruption_backups/`, deleted and replaced; the
    /// loss is logged and counted but never surfaces as an error.
    pub fn open_box(&self, name: &str) -> Result<Arc<BoxHandle>> {
        if let Some(handle) = self.boxes.read().get(name) {
            return Ok(handle.clone());
        }
        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| StorageError::UnknownBox(name.to_string()))?;

        let encrypted = descriptor.encryption_policy != EncryptionPolicy::Forbidden
            && self.cipher.read().is_some();
        let path = self.box_path(name);

        let handle = match self.replay_file(name, &path, encrypted) {
            Ok(handle) => handle,
            Err(StorageError::Corrupt { reason, .. }) => {
                self.quarantine_corrupt(name, &path, &reason)?;
                self.fresh_box(name, &path, encrypted)?
            }
            Err(e) => return Err(e),
        };

        let handle = Arc::new(handle);
        self.boxes.write().insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// A previously opened box.
    pub fn get_box(&self, name: &str) -> Result<Arc<BoxHandle>> {
        self.boxes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownBox(name.to_string()))
    }

    /// Typed view over an opened box.
    pub fn typed<T: Serialize + DeserializeOwned>(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<TypedBox<T>> {
        let handle = self.get_box(name)?;
        Ok(TypedBox {
            engine: self.clone(),
            handle,
            _marker: PhantomData,
        })
    }

    /// Rewrite a box file from its current state, reclaiming space.
    pub fn compact(&self, name: &str) -> Result<()> {
        let handle = self.get_box(name)?;
        let map = handle.map.read();
        let tmp = handle.path.with_extension("compact");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&format::encode_header(handle.encrypted))?;
            for (key, value) in map.iter() {
                file.write_all(&format::encode_entry(&BoxEntry::Put {
                    key: key.clone(),
                    value: value.clone(),
                }))?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &handle.path)?;
        let file = OpenOptions::new().append(true).open(&handle.path)?;
        *handle.file.lock() = file;
        tracing::debug!(box_name = %name, records = map.len(), "compacted box");
        Ok(())
    }

    /// Copy every opened box file to `migration_backups/` with the given
    /// suffix.
    pub fn backup_all(&self, suffix: &str) -> Result<Vec<PathBuf>> {
        let backup_dir = self.data_dir.join(MIGRATION_BACKUP_DIR);
        fs::create_dir_all(&backup_dir)?;
        let stamp = iso_stamp();
        let mut backups = Vec::new();
        for handle in self.boxes.read().values() {
            if !handle.path.exists() {
                continue;
            }
            let target = backup_dir.join(format!("{}.{}.{}.bak", handle.name, suffix, stamp));
            fs::copy(&handle.path, &target)?;
            backups.push(target);
        }
        tracing::info!(suffix = %suffix, count = backups.len(), "backed up boxes");
        Ok(backups)
    }

    /// Apply a raw put on behalf of the transaction journal.
    pub fn apply_put(&self, box_name: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.get_box(box_name)?.put_raw(key, value)
    }

    /// Apply a raw delete on behalf of the transaction journal.
    pub fn apply_delete(&self, box_name: &str, key: &str) -> Result<()> {
        self.get_box(box_name)?.delete_raw(key)
    }

    /// Rewrite one box's file with new raw contents and swap it in.
    ///
    /// Used by the rotation executor: the replacement is staged at
    /// `stage_path` and renamed over the box file, so a crash leaves
    /// either the old or the new file, never a mix.
    pub fn replace_box_contents(
        &self,
        name: &str,
        stage_path: &Path,
        contents: BTreeMap<String, Vec<u8>>,
        encrypted: bool,
    ) -> Result<()> {
        let handle = self.get_box(name)?;
        {
            let mut file = File::create(stage_path)?;
            file.write_all(&format::encode_header(encrypted))?;
            for (key, value) in &contents {
                file.write_all(&format::encode_entry(&BoxEntry::Put {
                    key: key.clone(),
                    value: value.clone(),
                }))?;
            }
            file.sync_all()?;
        }
        fs::rename(stage_path, &handle.path)?;
        let file = OpenOptions::new().append(true).open(&handle.path)?;
        *handle.file.lock() = file;
        *handle.map.write() = contents;
        Ok(())
    }

    fn replay_file(&self, name: &str, path: &Path, encrypted: bool) -> Result<BoxHandle> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.fresh_box(name, path, encrypted);
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.len() == 0 {
            return self.fresh_box(name, path, encrypted);
        }

        let file = File::open(path)?;
        let replay = format::replay(name, file)?;
        if let Some(offset) = replay.truncate_to {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(BoxHandle {
            name: name.to_string(),
            path: path.to_path_buf(),
            encrypted,
            map: RwLock::new(replay.map),
            file: Mutex::new(file),
        })
    }

    fn fresh_box(&self, name: &str, path: &Path, encrypted: bool) -> Result<BoxHandle> {
        let mut file = File::create(path)?;
        file.write_all(&format::encode_header(encrypted))?;
        file.sync_all()?;
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(BoxHandle {
            name: name.to_string(),
            path: path.to_path_buf(),
            encrypted,
            map: RwLock::new(BTreeMap::new()),
            file: Mutex::new(file),
        })
    }

    fn quarantine_corrupt(&self, name: &str, path: &Path, reason: &str) -> Result<()> {
        let backup_dir = self.data_dir.join(CORRUPTION_BACKUP_DIR);
        fs::create_dir_all(&backup_dir)?;
        let target = backup_dir.join(format!("{}.{}.corrupt.bak", name, iso_stamp()));
        if let Err(e) = fs::copy(path, &target) {
            tracing::error!(box_name = %name, error = %e, "corrupt box backup failed");
        }
        fs::remove_file(path)?;
        tracing::error!(
            box_name = %name,
            reason = %reason,
            backup = %target.display(),
            "box file was corrupt; data backed up and box reset"
        );
        self.telemetry.incr(Counter::CorruptionRecovered);
        Ok(())
    }
}

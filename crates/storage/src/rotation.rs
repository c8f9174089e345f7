//! Key-rotation executor
//!
//! Re-encrypts every encryptable box under a candidate key, then
//! promotes the candidate. Progress lives in the unencrypted meta store
//! so a crash at any point resumes from the next not-yet-completed box:
//!
//! 1. `KeyStore::begin_rotation` (idempotent) yields the candidate key.
//! 2. `rotation_state` flips to in-progress.
//! 3. Per box: decrypt records with the old key, encrypt with the
//!    candidate, stage the rewritten file at `<name>.pre_rotate`, rename
//!    it over the box file, append the box to `boxes_completed`.
//! 4. `KeyStore::commit_rotation`, state back to idle, engine cipher
//!    swapped to the candidate.
//!
//! Completed boxes are already under the candidate key, so the resume
//! path never touches them again; uncompleted boxes are still under the
//! old key, which remains `enc_key_v1` until the commit in step 4.

use crate::cipher::BoxCipher;
use crate::engine::StorageEngine;
use crate::error::Result;
use crate::meta::{MetaStore, RotationState, RotationStatus};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use vital_keys::KeyStore;

/// Run (or resume) a key rotation to completion.
pub fn resume_or_rotate(
    engine: &Arc<StorageEngine>,
    meta: &MetaStore,
    keystore: &KeyStore,
) -> Result<()> {
    let candidate = keystore.begin_rotation()?;
    let new_cipher = Arc::new(BoxCipher::new(&candidate));
    let old_cipher = engine.cipher();

    let mut state = meta.rotation_state();
    if state.status == RotationStatus::Idle {
        state = RotationState {
            status: RotationStatus::InProgress,
            started_at: Some(Utc::now()),
            boxes_completed: Vec::new(),
        };
        meta.set_rotation_state(&state);
        tracing::info!("key rotation started");
    } else {
        tracing::info!(
            completed = state.boxes_completed.len(),
            "resuming interrupted key rotation"
        );
    }

    for name in engine.registry().encryptable_names() {
        if state.boxes_completed.iter().any(|b| b == &name) {
            continue;
        }
        reencrypt_box(engine, &name, old_cipher.as_deref(), &new_cipher)?;
        state.boxes_completed.push(name.clone());
        meta.set_rotation_state(&state);
        tracing::debug!(box_name = %name, "box re-encrypted under candidate key");
    }

    keystore.commit_rotation()?;
    meta.set_rotation_state(&RotationState::default());
    engine.set_cipher(Some(new_cipher));
    tracing::info!("key rotation complete");
    Ok(())
}

/// Resume a rotation left in progress by a crash, if any.
///
/// Called at startup before policy enforcement. When the meta store says
/// in-progress but no candidate key survives, the rotation never wrote
/// anything (begin is the first durable step), so the state is reset.
pub fn resume_if_in_progress(
    engine: &Arc<StorageEngine>,
    meta: &MetaStore,
    keystore: &KeyStore,
) -> Result<bool> {
    if meta.rotation_state().status != RotationStatus::InProgress {
        return Ok(false);
    }
    if keystore.candidate()?.is_none() {
        tracing::warn!("rotation marked in-progress but no candidate key; resetting state");
        meta.set_rotation_state(&RotationState::default());
        keystore.abort_rotation()?;
        return Ok(false);
    }
    resume_or_rotate(engine, meta, keystore)?;
    Ok(true)
}

fn reencrypt_box(
    engine: &Arc<StorageEngine>,
    name: &str,
    old_cipher: Option<&BoxCipher>,
    new_cipher: &BoxCipher,
) -> Result<()> {
    engine.open_box(name)?;
    let handle = engine.get_box(name)?;
    let snapshot = handle.snapshot();

    let mut rewritten = BTreeMap::new();
    for (key, value) in snapshot {
        let plain = if BoxCipher::is_encrypted(&value) {
            match old_cipher {
                Some(cipher) => cipher.decrypt(&value)?,
                None => {
                    // No old key means these envelopes are unreadable;
                    // the record is lost either way, keep it for audit.
                    tracing::error!(
                        box_name = %name,
                        key = %key,
                        "encrypted record with no old key during rotation; kept verbatim"
                    );
                    rewritten.insert(key, value);
                    continue;
                }
            }
        } else {
            value
        };
        rewritten.insert(key, new_cipher.encrypt(&plain)?);
    }

    let stage = engine.data_dir().join(format!("{}.pre_rotate", name));
    engine.replace_box_contents(name, &stage, rewritten, true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{BoxDescriptor, BoxRegistry, EncryptionPolicy};
    use crate::meta::MetaStore;
    use serde::{Deserialize, Serialize};
    use vital_core::NoopTelemetry;
    use vital_keys::{KeyStore, MemorySecretStore};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        value: String,
    }

    struct Fixture {
        engine: Arc<StorageEngine>,
        meta: MetaStore,
        keystore: KeyStore,
        secrets: Arc<MemorySecretStore>,
    }

    fn fixture(dir: &std::path::Path, secrets: Arc<MemorySecretStore>) -> Fixture {
        let keystore = KeyStore::new(secrets.clone(), Arc::new(NoopTelemetry));
        let key = keystore.load_or_generate().unwrap();
        let registry = Arc::new(BoxRegistry::new());
        registry
            .register(BoxDescriptor::new("ops", EncryptionPolicy::Required, 1, 1))
            .unwrap();
        registry
            .register(BoxDescriptor::new("meta", EncryptionPolicy::Forbidden, 2, 1))
            .unwrap();
        let engine = Arc::new(
            StorageEngine::new(
                dir,
                registry,
                Some(Arc::new(BoxCipher::new(&key))),
                Arc::new(NoopTelemetry),
            )
            .unwrap(),
        );
        engine.open_registered().unwrap();
        let meta = MetaStore::new(engine.get_box("meta").unwrap());
        Fixture {
            engine,
            meta,
            keystore,
            secrets,
        }
    }

    #[test]
    fn test_rotation_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), Arc::new(MemorySecretStore::new()));
        let ops = f.engine.typed::<Record>("ops").unwrap();
        ops.put("a", &Record { value: "hr".into() }).unwrap();

        resume_or_rotate(&f.engine, &f.meta, &f.keystore).unwrap();

        assert_eq!(
            ops.get("a").unwrap(),
            Some(Record { value: "hr".into() }),
            "record must decrypt under the rotated key"
        );
        assert_eq!(f.meta.rotation_state().status, RotationStatus::Idle);

        // A fresh engine with the rotated key also reads it.
        let f2 = fixture(dir.path(), f.secrets.clone());
        let ops2 = f2.engine.typed::<Record>("ops").unwrap();
        assert_eq!(ops2.get("a").unwrap(), Some(Record { value: "hr".into() }));
    }

    #[test]
    fn test_rotation_resumes_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(MemorySecretStore::new());
        let f = fixture(dir.path(), secrets.clone());
        let ops = f.engine.typed::<Record>("ops").unwrap();
        ops.put("a", &Record { value: "hr".into() }).unwrap();

        // Simulate a crash right after begin: candidate exists, state is
        // in-progress, no box re-encrypted yet.
        f.keystore.begin_rotation().unwrap();
        f.meta.set_rotation_state(&RotationState {
            status: RotationStatus::InProgress,
            started_at: Some(Utc::now()),
            boxes_completed: Vec::new(),
        });

        // New session resumes and completes.
        let f2 = fixture(dir.path(), secrets.clone());
        let resumed = resume_if_in_progress(&f2.engine, &f2.meta, &f2.keystore).unwrap();
        assert!(resumed);
        assert_eq!(f2.meta.rotation_state().status, RotationStatus::Idle);

        let ops2 = f2.engine.typed::<Record>("ops").unwrap();
        assert_eq!(ops2.get("a").unwrap(), Some(Record { value: "hr".into() }));
    }

    #[test]
    fn test_stale_in_progress_without_candidate_resets() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), Arc::new(MemorySecretStore::new()));
        f.meta.set_rotation_state(&RotationState {
            status: RotationStatus::InProgress,
            started_at: Some(Utc::now()),
            boxes_completed: Vec::new(),
        });
        let resumed = resume_if_in_progress(&f.engine, &f.meta, &f.keystore).unwrap();
        assert!(!resumed);
        assert_eq!(f.meta.rotation_state().status, RotationStatus::Idle);
    }

    #[test]
    fn test_rotation_rerun_after_commit_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), Arc::new(MemorySecretStore::new()));
        let ops = f.engine.typed::<Record>("ops").unwrap();
        ops.put("a", &Record { value: "hr".into() }).unwrap();

        resume_or_rotate(&f.engine, &f.meta, &f.keystore).unwrap();
        // Running a second full rotation also converges.
        resume_or_rotate(&f.engine, &f.meta, &f.keystore).unwrap();
        assert_eq!(ops.get("a").unwrap(), Some(Record { value: "hr".into() }));
    }
}

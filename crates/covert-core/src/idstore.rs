//! The encrypted ID store: local identities, peers and ratchet state.
//!
//! A single Covert archive on disk whose only payload is a map from tag
//! strings (`id:alice`, `id:alice:bob`) to records. Every update is a
//! full decrypt-modify-re-encrypt round trip under an exclusive file
//! lock, with expired records evicted on the way out.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs2::FileExt;
use rand::RngCore;
use rmpv::Value;
use serde::{Deserialize, Serialize};

use crate::archive::Archive;
use crate::container::{decrypt_archive, encrypt_archive, DecryptedArchive};
use crate::error::{CovertError, Result};
use crate::header::{Auth, AuthMethod};
use crate::key::Key;
use crate::ratchet::{b32, Ratchet};

/// Padding ratio used when re-encrypting the store.
const STORE_PADDING: f64 = 0.2;

/// Injected data directory; the only process-level configuration.
#[derive(Clone, Debug)]
pub struct DataDirs {
    pub datadir: PathBuf,
}

impl DataDirs {
    /// Default location under the platform data directory.
    pub fn from_env() -> DataDirs {
        let base = std::env::var_os("COVERT_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::data_dir().map(|d| d.join("covert")))
            .unwrap_or_else(|| PathBuf::from(".covert"));
        DataDirs { datadir: base }
    }

    pub fn idfilename(&self) -> PathBuf {
        self.datadir.join("idstore")
    }

    fn create_datadir(&self) -> Result<()> {
        if self.datadir.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.datadir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.datadir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

/// One record: a local secret key, a peer public key, or both, plus an
/// optional ratchet state and expiry.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct IdRecord {
    /// Local identity secret key.
    #[serde(rename = "I", default, skip_serializing_if = "Option::is_none", with = "b32")]
    pub idsk: Option<[u8; 32]>,
    /// Peer public key.
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none", with = "b32")]
    pub peerpk: Option<[u8; 32]>,
    /// Conversation state with this peer.
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub ratchet: Option<Ratchet>,
    /// Expiry timestamp for the whole record.
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

pub type IdMap = BTreeMap<String, IdRecord>;

pub struct IdStore {
    pub dirs: DataDirs,
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn map_to_value(map: &IdMap) -> Result<Value> {
    let mut pairs = Vec::with_capacity(map.len());
    for (tag, record) in map {
        let bytes = rmp_serde::to_vec_named(record)
            .map_err(|e| CovertError::Value(format!("id record encoding: {e}")))?;
        let value = rmpv::decode::read_value(&mut Cursor::new(&bytes))
            .map_err(|e| CovertError::Value(format!("id record encoding: {e}")))?;
        pairs.push((Value::from(tag.as_str()), value));
    }
    Ok(Value::Map(pairs))
}

fn value_to_map(value: &Value) -> Result<IdMap> {
    let Value::Map(pairs) = value else {
        return Err(CovertError::Value("id store payload is not a map".into()));
    };
    let mut map = IdMap::new();
    for (k, v) in pairs {
        let tag = k
            .as_str()
            .ok_or_else(|| CovertError::Value("id store tag is not a string".into()))?;
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, v)
            .map_err(|e| CovertError::Value(format!("id record decoding: {e}")))?;
        let record: IdRecord = rmp_serde::from_slice(&bytes)
            .map_err(|e| CovertError::Value(format!("id record decoding: {e}")))?;
        map.insert(tag.to_string(), record);
    }
    Ok(map)
}

/// Delete all records past their expiry.
fn remove_expired(map: &mut IdMap) {
    let t = now();
    map.retain(|_, record| record.expires.map(|e| e > t).unwrap_or(true));
    for record in map.values_mut() {
        let expired = record
            .ratchet
            .as_mut()
            .map(|r| r.expire(t))
            .unwrap_or(false);
        if expired {
            tracing::debug!("idstore: dropping expired ratchet");
            record.ratchet = None;
        }
    }
}

impl IdStore {
    pub fn new(dirs: DataDirs) -> IdStore {
        IdStore { dirs }
    }

    /// Write a fresh store; fails if one already exists.
    pub fn create(&self, pwhash: &[u8; 16], map: &IdMap) -> Result<()> {
        self.dirs.create_datadir()?;
        let out = self.encrypt_map(pwhash, map)?;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.dirs.idfilename())?;
        f.write_all(&out)?;
        f.sync_all()?;
        tracing::debug!("idstore: created with {} records", map.len());
        Ok(())
    }

    fn encrypt_map(&self, pwhash: &[u8; 16], map: &IdMap) -> Result<Vec<u8>> {
        let mut archive = Archive::new();
        archive.index.extra.insert("I".into(), map_to_value(map)?);
        archive.random_padding(STORE_PADDING)?;
        encrypt_archive(&mut Auth::SinglePassphrase(*pwhash), &mut archive, &[])
    }

    fn decrypt_map(&self, pwhash: &[u8; 16], data: &[u8]) -> Result<IdMap> {
        let mut methods = [AuthMethod::Password(*pwhash)];
        let result = decrypt_archive(&mut methods, data)?;
        match result.index.extra.get("I") {
            Some(v) => value_to_map(v),
            None => Ok(IdMap::new()),
        }
    }

    /// Decrypt, let the closure mutate the map, then re-encrypt (under
    /// `new_pwhash` if given). Runs under an exclusive file lock. A
    /// missing store is created when the closure leaves records behind.
    pub fn update<T>(
        &self,
        pwhash: &[u8; 16],
        new_pwhash: Option<&[u8; 16]>,
        f: impl FnOnce(&mut IdMap) -> Result<T>,
    ) -> Result<T> {
        let path = self.dirs.idfilename();
        if !path.exists() {
            let mut map = IdMap::new();
            let out = f(&mut map)?;
            if !map.is_empty() {
                self.create(new_pwhash.unwrap_or(pwhash), &map)?;
            }
            return Ok(out);
        }
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
        file.lock_exclusive()?;
        let run = || -> Result<T> {
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            let mut map = self.decrypt_map(pwhash, &data)?;
            let out = f(&mut map)?;
            remove_expired(&mut map);
            let enc = self.encrypt_map(new_pwhash.unwrap_or(pwhash), &map)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&enc)?;
            file.set_len(enc.len() as u64)?;
            file.sync_all()?;
            Ok(out)
        };
        let result = run();
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    /// Create or fetch the profile for `local:peer` (or just `local`).
    ///
    /// Returns the identity key, the peer key and the conversation state
    /// with runtime keys attached.
    pub fn profile(
        &self,
        pwhash: &[u8; 16],
        idstr: &str,
        idkey: Option<Key>,
        peerkey: Option<Key>,
    ) -> Result<(Key, Key, Ratchet)> {
        let Some((local, peer)) = idstr.split_once(':') else {
            // A bare local identity: create or fetch it, no peer record.
            let tagself = format!("id:{idstr}");
            return self.update(pwhash, None, |map| {
                let idkey = match idkey {
                    Some(k) => k,
                    None => match map.get(&tagself).and_then(|r| r.idsk) {
                        Some(sk) => Key::from_sk(sk),
                        None => Key::new(),
                    },
                };
                map.entry(tagself.clone()).or_default().idsk = Some(idkey.sk()?);
                let peer = idkey.clone();
                Ok((idkey, peer, Ratchet::new()))
            });
        };
        let (local, mut peer) = (local.to_string(), peer.to_string());
        let tagself = format!("id:{local}");
        self.update(pwhash, None, |map| {
            // Pseudonymous peer name when none was given.
            while peer.is_empty() {
                let mut raw = [0u8; 4];
                rand::rngs::OsRng.fill_bytes(&mut raw);
                let candidate = format!(".{}", hex_tag(&raw));
                if !map.contains_key(&format!("id:{local}:{candidate}")) {
                    peer = candidate;
                }
            }
            let tagpeer = format!("id:{local}:{peer}");
            // A peer that is itself a local ID needs no stored pubkey.
            let taglocalpeer = format!("id:{peer}");
            let local_peer = local == peer || map.contains_key(&taglocalpeer);
            if local_peer && peerkey.is_some() {
                return Err(CovertError::Value(format!(
                    "ID {peer} already in store as a local user, cannot have a recipient key"
                )));
            }
            if !local_peer && peerkey.is_none() && !map.contains_key(&tagpeer) {
                return Err(CovertError::Value(
                    "peer not in ID store, a recipient public key is needed on first use".into(),
                ));
            }
            let idkey = match idkey {
                Some(k) => k,
                None => match map.get(&tagself).and_then(|r| r.idsk) {
                    Some(sk) => Key::from_sk(sk),
                    None => Key::new(),
                },
            };
            let peerkey = if local_peer {
                if local == peer {
                    idkey.clone()
                } else {
                    let sk = map
                        .get(&taglocalpeer)
                        .and_then(|r| r.idsk)
                        .ok_or_else(|| CovertError::Value("local peer has no key".into()))?;
                    Key::from_sk(sk)
                }
            } else {
                match peerkey {
                    Some(k) => k,
                    None => {
                        let pk = map
                            .get(&tagpeer)
                            .and_then(|r| r.peerpk)
                            .ok_or_else(|| CovertError::Value("peer record has no key".into()))?;
                        Key::from_pk(pk)
                    }
                }
            };
            map.entry(tagself.clone()).or_default().idsk = Some(idkey.sk()?);
            let peer_record = map.entry(tagpeer.clone()).or_default();
            peer_record.peerpk = Some(peerkey.pk()?);
            let mut ratchet = match &peer_record.ratchet {
                Some(r) => r.clone(),
                None => {
                    let fresh = Ratchet::new();
                    peer_record.ratchet = Some(fresh.clone());
                    fresh
                }
            };
            ratchet.idkey = Some(idkey.clone().with_comment(&tagself));
            ratchet.peerkey = Some(peerkey.clone().with_comment(&tagpeer));
            ratchet.tagpeer = Some(tagpeer);
            Ok((idkey, peerkey, ratchet))
        })
    }

    /// Persist a ratchet after sending; initial sends seed a pre-key
    /// from the just-encrypted archive's file hash.
    pub fn update_ratchet(
        &self,
        pwhash: &[u8; 16],
        ratchet: &mut Ratchet,
        archive: &Archive,
    ) -> Result<()> {
        if archive.index.ratchet.is_some() {
            let hash = archive
                .filehash
                .ok_or_else(|| CovertError::Value("archive has no file hash yet".into()))?;
            let mut shared = [0u8; 32];
            shared.copy_from_slice(&hash[..32]);
            let idkey = ratchet
                .idkey
                .clone()
                .ok_or_else(|| CovertError::Ratchet("no identity key attached".into()))?;
            ratchet.prepare_alice(shared, &idkey)?;
        }
        let tag = ratchet
            .tagpeer
            .clone()
            .ok_or_else(|| CovertError::Ratchet("ratchet has no store tag".into()))?;
        self.update(pwhash, None, |map| {
            map.entry(tag.clone()).or_default().ratchet = Some(ratchet.clone());
            Ok(())
        })
    }

    /// Record a new contact from a received file: their signing key and,
    /// if the sender advertised one, a ratchet initialised as Bob.
    pub fn save_contact(
        &self,
        pwhash: &[u8; 16],
        idname: &str,
        received: &DecryptedArchive,
        localkey: &Key,
    ) -> Result<()> {
        let peerkey = received
            .signatures
            .first()
            .filter(|s| s.valid)
            .map(|s| s.key.clone())
            .ok_or_else(|| CovertError::Value("no valid signature to save a contact from".into()))?;
        let tag = format!("id:{idname}");
        let mut ratchet = None;
        if received.index.ratchet.is_some() {
            let mut shared = [0u8; 32];
            shared.copy_from_slice(&received.filehash[..32]);
            let mut r = Ratchet::new();
            r.init_bob(shared, localkey, &peerkey)?;
            ratchet = Some(r);
        }
        self.update(pwhash, None, |map| {
            let record = map.entry(tag.clone()).or_default();
            record.peerpk = Some(peerkey.pk()?);
            if ratchet.is_some() {
                record.ratchet = ratchet.clone();
            }
            Ok(())
        })
    }

    /// Load the store for decryption: ratchet candidates first, then
    /// plain secret keys. Commit afterwards to persist consumed ratchets.
    pub fn auth_session(&self, pwhash: &[u8; 16]) -> Result<AuthSession> {
        let path = self.dirs.idfilename();
        if !path.exists() {
            return Err(CovertError::Value("no ID store present".into()));
        }
        let data = std::fs::read(&path)?;
        let map = self.decrypt_map(pwhash, &data)?;
        Ok(AuthSession { map })
    }

    /// All known keys: local identities (with secrets) and peers.
    pub fn idkeys(&self, pwhash: &[u8; 16]) -> Result<Vec<Key>> {
        let session = self.auth_session(pwhash)?;
        let mut keys: Vec<Key> = Vec::new();
        for (tag, record) in &session.map {
            if let Some(sk) = record.idsk {
                let k = Key::from_sk(sk).with_comment(tag);
                if !keys.contains(&k) {
                    keys.push(k);
                }
            } else if let Some(pk) = record.peerpk {
                let k = Key::from_pk(pk).with_comment(tag);
                if !keys.contains(&k) {
                    keys.push(k);
                }
            }
        }
        Ok(keys)
    }

    /// Overwrite the store with zeros, fsync, unlink; remove the
    /// directory too when it is empty afterwards.
    pub fn delete_entire_idstore(&self) -> Result<()> {
        let path = self.dirs.idfilename();
        let mut f = std::fs::OpenOptions::new().write(true).open(&path)?;
        let len = f.metadata()?.len();
        f.write_all(&vec![0u8; len as usize])?;
        f.sync_all()?;
        drop(f);
        std::fs::remove_file(&path)?;
        let _ = std::fs::remove_dir(&self.dirs.datadir);
        tracing::debug!("idstore: erased");
        Ok(())
    }
}

fn hex_tag(raw: &[u8; 4]) -> String {
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

/// A decrypted store held in memory for header probing.
pub struct AuthSession {
    map: IdMap,
}

impl AuthSession {
    /// Candidates in probe order: ratchets, then identity keys.
    pub fn methods(&mut self) -> Vec<AuthMethod<'_>> {
        let mut ratchets = Vec::new();
        let mut identities = Vec::new();
        for (tag, record) in self.map.iter_mut() {
            let IdRecord { idsk, peerpk, ratchet, .. } = record;
            if let Some(r) = ratchet {
                if let Some(sk) = idsk {
                    r.idkey = Some(Key::from_sk(*sk));
                }
                if let Some(pk) = peerpk {
                    r.peerkey = Some(Key::from_pk(*pk));
                }
                r.tagpeer = Some(tag.clone());
                ratchets.push(AuthMethod::Ratchet(r));
            }
            if let Some(sk) = idsk {
                identities.push(AuthMethod::Identity(Key::from_sk(*sk).with_comment(tag)));
            }
        }
        ratchets.extend(identities);
        ratchets
    }

    /// Write mutated ratchet states back to disk.
    pub fn commit(self, store: &IdStore, pwhash: &[u8; 16]) -> Result<()> {
        let session_map = self.map;
        store.update(pwhash, None, move |map| {
            for (tag, record) in session_map {
                if let Some(r) = record.ratchet {
                    map.entry(tag).or_default().ratchet = Some(r);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveInput;

    fn test_store() -> (tempfile::TempDir, IdStore) {
        let dir = tempfile::tempdir().unwrap();
        let dirs = DataDirs { datadir: dir.path().join("covert") };
        (dir, IdStore::new(dirs))
    }

    const PWH: [u8; 16] = [0x41u8; 16];

    #[test]
    fn create_and_reload() {
        let (_tmp, store) = test_store();
        let alice = Key::new();
        store
            .update(&PWH, None, |map| {
                map.entry("id:alice".into()).or_default().idsk = alice.sk;
                Ok(())
            })
            .unwrap();
        let keys = store.idkeys(&PWH).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].pk, alice.pk);
    }

    #[test]
    fn update_reencrypts_with_new_passphrase() {
        let (_tmp, store) = test_store();
        store
            .update(&PWH, None, |map| {
                map.entry("id:a".into()).or_default().idsk = Key::new().sk;
                Ok(())
            })
            .unwrap();
        let new_pwh = [0x42u8; 16];
        store.update(&PWH, Some(&new_pwh), |_| Ok(())).unwrap();
        assert!(store.idkeys(&PWH).is_err());
        assert_eq!(store.idkeys(&new_pwh).unwrap().len(), 1);
    }

    #[test]
    fn missing_store_is_an_error_without_create() {
        let (_tmp, store) = test_store();
        assert!(store.auth_session(&PWH).is_err());
        assert!(store.idkeys(&PWH).is_err());
    }

    #[test]
    fn profile_requires_peer_key_on_first_use() {
        let (_tmp, store) = test_store();
        assert!(store.profile(&PWH, "alice:bob", None, None).is_err());
        let bob = Key::new();
        let (idkey, peerkey, ratchet) = store
            .profile(&PWH, "alice:bob", None, Some(Key::from_pk(bob.pk.unwrap())))
            .unwrap();
        assert!(idkey.sk.is_some());
        assert_eq!(peerkey.pk, bob.pk);
        assert_eq!(ratchet.tagpeer.as_deref(), Some("id:alice:bob"));
        // Second call works from the stored record.
        let (idkey2, peerkey2, _) = store.profile(&PWH, "alice:bob", None, None).unwrap();
        assert_eq!(idkey2.pk, idkey.pk);
        assert_eq!(peerkey2.pk, bob.pk);
    }

    #[test]
    fn local_peer_notation() {
        let (_tmp, store) = test_store();
        store.profile(&PWH, "bob", None, None).unwrap();
        // alice:bob where bob is local resolves bob's own key.
        let (_, peerkey, _) = store.profile(&PWH, "alice:bob", None, None).unwrap();
        let keys = store.idkeys(&PWH).unwrap();
        assert!(keys.iter().any(|k| k.pk == peerkey.pk));
        // Giving a recipient key for a local user is refused.
        assert!(store
            .profile(&PWH, "alice:bob", None, Some(Key::new()))
            .is_err());
    }

    #[test]
    fn expired_records_evicted_on_update() {
        let (_tmp, store) = test_store();
        store
            .update(&PWH, None, |map| {
                let mut rec = IdRecord { idsk: Key::new().sk, ..IdRecord::default() };
                rec.expires = Some(now() - 10);
                map.insert("id:old".into(), rec);
                let rec2 = IdRecord { idsk: Key::new().sk, ..IdRecord::default() };
                map.insert("id:fresh".into(), rec2);
                Ok(())
            })
            .unwrap();
        // The first update wrote both; the next round-trip evicts.
        store.update(&PWH, None, |_| Ok(())).unwrap();
        let keys = store.idkeys(&PWH).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].comment, "id:fresh");
    }

    #[test]
    fn wrong_passphrase_fails_auth() {
        let (_tmp, store) = test_store();
        store
            .update(&PWH, None, |map| {
                map.entry("id:x".into()).or_default().idsk = Key::new().sk;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            store.idkeys(&[0u8; 16]),
            Err(CovertError::Auth(_))
        ));
    }

    #[test]
    fn delete_erases_file_and_directory() {
        let (_tmp, store) = test_store();
        store
            .update(&PWH, None, |map| {
                map.entry("id:x".into()).or_default().idsk = Key::new().sk;
                Ok(())
            })
            .unwrap();
        assert!(store.dirs.idfilename().exists());
        store.delete_entire_idstore().unwrap();
        assert!(!store.dirs.idfilename().exists());
        assert!(!store.dirs.datadir.exists());
    }

    #[test]
    fn full_conversation_through_the_store() {
        // Alice messages Bob; Bob saves the contact and replies; Alice
        // decrypts the reply through her stored ratchet.
        let (_tmp_a, alice_store) = test_store();
        let (_tmp_b, bob_store) = test_store();
        let bob_id = Key::new();
        bob_store
            .update(&PWH, None, |map| {
                map.entry("id:bob".into()).or_default().idsk = bob_id.sk;
                Ok(())
            })
            .unwrap();

        // Alice creates a conversation profile and sends.
        let (alice_id, bob_pk, mut ratchet) = alice_store
            .profile(&PWH, "alice:bob", None, Some(Key::from_pk(bob_id.pk.unwrap())))
            .unwrap();
        let mut archive = Archive::new();
        archive
            .file_index(vec![ArchiveInput::Bytes(b"hello bob".to_vec())])
            .unwrap();
        archive.index.ratchet = Some(ratchet.s.n + 1);
        let mut auth = Auth::Multi {
            pwhashes: vec![],
            recipients: vec![bob_pk.clone()],
        };
        let ct = encrypt_archive(&mut auth, &mut archive, &[alice_id.clone()]).unwrap();
        alice_store.update_ratchet(&PWH, &mut ratchet, &archive).unwrap();

        // Bob decrypts with his identity key and saves the contact.
        let mut session = bob_store.auth_session(&PWH).unwrap();
        let received = {
            let mut methods = session.methods();
            decrypt_archive(&mut methods, ct.as_slice()).unwrap()
        };
        session.commit(&bob_store, &PWH).unwrap();
        assert_eq!(received.files[0], b"hello bob");
        assert!(received.signatures[0].valid);
        bob_store
            .save_contact(&PWH, "alice", &received, &bob_id)
            .unwrap();

        // Bob replies through the stored ratchet.
        let mut bob_ratchet = {
            let session = bob_store.auth_session(&PWH).unwrap();
            session
                .map
                .get("id:alice")
                .and_then(|r| r.ratchet.clone())
                .expect("save_contact stored a ratchet")
        };
        let mut reply_archive = Archive::new();
        reply_archive
            .file_index(vec![ArchiveInput::Bytes(b"hi alice".to_vec())])
            .unwrap();
        let reply_ct = {
            let mut auth = Auth::Ratchet(&mut bob_ratchet);
            encrypt_archive(&mut auth, &mut reply_archive, &[]).unwrap()
        };

        // Alice decrypts the reply via her stored ratchet state.
        let mut alice_session = alice_store.auth_session(&PWH).unwrap();
        let decrypted = {
            let mut methods = alice_session.methods();
            decrypt_archive(&mut methods, reply_ct.as_slice()).unwrap()
        };
        assert_eq!(decrypted.files[0], b"hi alice");
        alice_session.commit(&alice_store, &PWH).unwrap();
    }
}

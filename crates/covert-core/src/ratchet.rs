//! Forward-secret conversations: a Signal-style double ratchet with
//! encrypted headers, layered on the public-key slot mechanism.
//!
//! Deviations from textbook Signal: Alice may send several initial
//! messages before any reply, each seeding a candidate shared secret
//! (the file hash of that message) into `pre`; Bob's first reply is
//! header-encrypted directly under one of those secrets, and Alice finds
//! it by trial decryption. Message keys double as Covert file keys, so
//! recently used keys are retained briefly to let the same file be
//! decrypted again.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::aead;
use crate::error::{CovertError, Result};
use crate::key::{derive_symkey, Key};

/// Out-of-order reception window, and the cap on stored initial secrets.
pub const MAXSKIP: usize = 20;

/// Ratchet header: 32-byte DH pk + 2-byte PN + 16-byte tag.
pub const HEADER_LEN: usize = 50;

/// Whole-state lifetime (~28 days), refreshed on use.
const RATCHET_LIFETIME: u64 = 28 * 24 * 3600;

/// Lifetime of an already used message key (~10 min), kept so that a
/// just-received file can be listed and then extracted.
const USED_KEY_LIFETIME: u64 = 600;

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn nonce12(n: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&n.to_le_bytes());
    out
}

/// One chaining step: sha512(CK || addn) split into (new CK, output key).
fn chainstep(ck: &[u8; 32], addn: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut h = Sha512::new();
    h.update(ck);
    h.update(addn);
    let d = h.finalize();
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&d[..32]);
    b.copy_from_slice(&d[32..]);
    (a, b)
}

pub(crate) mod b32 {
    //! Serialize `Option<[u8; 32]>` as a MsgPack bin value.
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(b) => s.serialize_bytes(b),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        let buf: Option<serde_bytes::ByteBuf> = Option::deserialize(d)?;
        match buf {
            None => Ok(None),
            Some(b) => {
                let arr: [u8; 32] = b
                    .as_ref()
                    .try_into()
                    .map_err(|_| D::Error::custom("expected 32 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

mod b32req {
    //! Serialize `[u8; 32]` as a MsgPack bin value.
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf = serde_bytes::ByteBuf::deserialize(d)?;
        buf.as_ref()
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}

mod b32vec {
    //! Serialize `Vec<[u8; 32]>` as an array of bin values.
    use serde::de::Error;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[[u8; 32]], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(v.len()))?;
        for item in v {
            seq.serialize_element(serde_bytes::Bytes::new(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<[u8; 32]>, D::Error> {
        let bufs: Vec<serde_bytes::ByteBuf> = Vec::deserialize(d)?;
        bufs.into_iter()
            .map(|b| {
                b.as_ref()
                    .try_into()
                    .map_err(|_| D::Error::custom("expected 32 bytes"))
            })
            .collect()
    }
}

/// One direction of the symmetric ratchet.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SymChain {
    #[serde(rename = "CK", default, skip_serializing_if = "Option::is_none", with = "b32")]
    pub ck: Option<[u8; 32]>,
    #[serde(rename = "HK", default, skip_serializing_if = "Option::is_none", with = "b32")]
    pub hk: Option<[u8; 32]>,
    #[serde(rename = "NHK", default, skip_serializing_if = "Option::is_none", with = "b32")]
    pub nhk: Option<[u8; 32]>,
    /// Cumulative message count of closed chains.
    #[serde(rename = "CN", default)]
    pub cn: u64,
    /// Message count of the previous chain.
    #[serde(rename = "PN", default)]
    pub pn: u64,
    /// Message number within the current chain.
    #[serde(rename = "N", default)]
    pub n: u64,
}

/// A message key retained for out-of-order or repeated reception.
#[derive(Clone, Serialize, Deserialize)]
pub struct MsgKey {
    #[serde(rename = "hk", with = "b32req")]
    pub hk: [u8; 32],
    pub n: u64,
    #[serde(rename = "mk", with = "b32req")]
    pub mk: [u8; 32],
    /// Expiry timestamp.
    pub e: u64,
    /// Set once the key has been used to decrypt.
    #[serde(default)]
    pub r: bool,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Ratchet {
    #[serde(rename = "RK", default, skip_serializing_if = "Option::is_none", with = "b32")]
    pub rk: Option<[u8; 32]>,
    /// Current DH ratchet secret key.
    #[serde(rename = "DH", default, skip_serializing_if = "Option::is_none", with = "b32")]
    dh_sk: Option<[u8; 32]>,
    /// Send chain.
    pub s: SymChain,
    /// Receive chain.
    pub r: SymChain,
    /// Skipped and recently used message keys, at most MAXSKIP.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub msg: Vec<MsgKey>,
    /// Candidate shared secrets from initial messages (Alice only).
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "b32vec")]
    pub pre: Vec<[u8; 32]>,
    /// Whole-state expiry timestamp.
    pub e: u64,

    /// Runtime only: the local identity key, attached by the ID store.
    #[serde(skip)]
    pub idkey: Option<Key>,
    /// Runtime only: the peer's public key, attached by the ID store.
    #[serde(skip)]
    pub peerkey: Option<Key>,
    /// Runtime only: the ID store tag this state belongs to.
    #[serde(skip)]
    pub tagpeer: Option<String>,
}

/// DH ratchet step for one chain; returns the advanced root key.
fn dhstep(rk: [u8; 32], dh: &Key, peer: &Key, chain: &mut SymChain) -> Result<[u8; 32]> {
    let shared = derive_symkey(b"ratchet", dh, peer)?;
    chain.cn += chain.n;
    chain.pn = chain.n;
    chain.n = 0;
    chain.hk = chain.nhk;
    let (rk, ck) = chainstep(&rk, &shared);
    chain.ck = Some(ck);
    let (_, nhk) = chainstep(&rk, b"hkey");
    chain.nhk = Some(nhk);
    Ok(rk)
}

impl Ratchet {
    pub fn new() -> Ratchet {
        Ratchet { e: now() + RATCHET_LIFETIME, ..Ratchet::default() }
    }

    fn dh_key(&self) -> Result<Key> {
        let sk = self
            .dh_sk
            .ok_or_else(|| CovertError::Ratchet("no DH key in state".into()))?;
        Ok(Key::from_sk(sk))
    }

    /// Record an initial message sent before any reply has arrived.
    ///
    /// `shared` is the file hash of the sent message; Bob derives the
    /// same value from the file he receives.
    pub fn prepare_alice(&mut self, shared: [u8; 32], localkey: &Key) -> Result<()> {
        self.pre.push(shared);
        if self.pre.len() > MAXSKIP {
            let excess = self.pre.len() - MAXSKIP;
            self.pre.drain(..excess);
        }
        self.dh_sk = Some(localkey.sk()?);
        self.s.n += 1;
        self.e = now() + RATCHET_LIFETIME;
        Ok(())
    }

    /// Initialise Bob's side from a received initial message.
    pub fn init_bob(&mut self, shared: [u8; 32], localkey: &Key, peerkey: &Key) -> Result<()> {
        self.dh_sk = Some(localkey.sk()?);
        self.rk = Some(shared);
        self.s.nhk = Some(shared);
        self.e = now() + RATCHET_LIFETIME;
        self.dhratchet(peerkey)
    }

    /// Full DH ratchet: advance the receive chain under the current DH
    /// key, then the send chain under a fresh one.
    fn dhratchet(&mut self, peer: &Key) -> Result<()> {
        let rk = self
            .rk
            .ok_or_else(|| CovertError::Ratchet("no root key in state".into()))?;
        let rk = dhstep(rk, &self.dh_key()?, peer, &mut self.r)?;
        let fresh = Key::new();
        self.dh_sk = Some(fresh.sk()?);
        let rk = dhstep(rk, &fresh, peer, &mut self.s)?;
        self.rk = Some(rk);
        Ok(())
    }

    /// Alice's processing of the first reply: probe all initial secrets
    /// as header keys, then bring both chains up to date.
    fn init_alice(&mut self, ciphertext: &[u8]) -> Result<[u8; 32]> {
        let peer_id = self
            .peerkey
            .clone()
            .ok_or_else(|| CovertError::Ratchet("no peer key attached".into()))?;
        for pre in self.pre.clone() {
            for n in 0..MAXSKIP as u64 {
                let Ok(header) =
                    aead::decrypt(&ciphertext[..HEADER_LEN], None, &nonce12(n), &pre)
                else {
                    continue;
                };
                tracing::debug!("ratchet: first reply matched at n={n}");
                self.pre.clear();
                self.rk = Some(pre);
                // The send chain mirrors Bob's identity-keyed receive
                // chain; it is replaced again inside dhratchet.
                let rk = dhstep(pre, &self.dh_key()?, &peer_id, &mut self.s)?;
                self.rk = Some(rk);
                self.r.nhk = Some(pre);
                let mut peer_dh = [0u8; 32];
                peer_dh.copy_from_slice(&header[..32]);
                self.dhratchet(&Key::from_pk(peer_dh))?;
                self.skip_until(n)?;
                return self.next_recv(n);
            }
        }
        Err(CovertError::Auth("ratchet reply did not match any prepared secret".into()))
    }

    /// Produce the header and message key for an outgoing message.
    pub fn send(&mut self) -> Result<(Vec<u8>, [u8; 32])> {
        let hk = self
            .s
            .hk
            .ok_or_else(|| CovertError::Ratchet("send chain not established".into()))?;
        let ck = self
            .s
            .ck
            .ok_or_else(|| CovertError::Ratchet("send chain not established".into()))?;
        let dh = self.dh_key()?;
        let mut msg = dh.pk()?.to_vec();
        msg.extend_from_slice(&(self.s.pn as u16).to_le_bytes());
        let header = aead::encrypt(&msg, None, &nonce12(self.s.n), &hk)?;
        let (ck, mk) = chainstep(&ck, b"");
        self.s.ck = Some(ck);
        self.s.n += 1;
        self.e = now() + RATCHET_LIFETIME;
        Ok((header, mk))
    }

    /// Authenticate an incoming header and return the message key.
    ///
    /// Mutates the state; the caller persists it once the whole file
    /// decrypts.
    pub fn receive(&mut self, ciphertext: &[u8]) -> Result<[u8; 32]> {
        if ciphertext.len() < HEADER_LEN {
            return Err(CovertError::Decrypt("ciphertext shorter than a ratchet header".into()));
        }
        if !self.pre.is_empty() {
            return self.init_alice(ciphertext);
        }
        // Try retained keys first: out-of-order and recently used.
        for i in 0..self.msg.len() {
            let (hk, n) = (self.msg[i].hk, self.msg[i].n);
            if aead::decrypt(&ciphertext[..HEADER_LEN], None, &nonce12(n), &hk).is_ok() {
                let m = &mut self.msg[i];
                m.r = true;
                m.e = m.e.min(now() + USED_KEY_LIFETIME);
                return Ok(m.mk);
            }
        }
        // Current header key, within the skip window.
        if let Some(hk) = self.r.hk {
            for n in self.r.n..self.r.n + MAXSKIP as u64 {
                if aead::decrypt(&ciphertext[..HEADER_LEN], None, &nonce12(n), &hk).is_ok() {
                    self.skip_until(n)?;
                    return self.next_recv(n);
                }
            }
        }
        // Next header key: the peer has stepped the DH ratchet.
        if let Some(nhk) = self.r.nhk {
            for n in 0..MAXSKIP as u64 {
                let Ok(header) =
                    aead::decrypt(&ciphertext[..HEADER_LEN], None, &nonce12(n), &nhk)
                else {
                    continue;
                };
                let pn = u16::from_le_bytes(header[32..34].try_into().expect("sliced")) as u64;
                self.skip_until(pn)?;
                let mut peer_dh = [0u8; 32];
                peer_dh.copy_from_slice(&header[..32]);
                self.dhratchet(&Key::from_pk(peer_dh))?;
                self.skip_until(n)?;
                return self.next_recv(n);
            }
        }
        Err(CovertError::Auth("ratchet header did not decrypt".into()))
    }

    /// Advance the receive chain one step and retain the used key.
    fn next_recv(&mut self, n: u64) -> Result<[u8; 32]> {
        let ck = self
            .r
            .ck
            .ok_or_else(|| CovertError::Ratchet("receive chain not established".into()))?;
        let hk = self
            .r
            .hk
            .ok_or_else(|| CovertError::Ratchet("receive chain has no header key".into()))?;
        let (ck, mk) = chainstep(&ck, b"");
        self.r.ck = Some(ck);
        self.r.n += 1;
        self.remember(MsgKey { hk, n, mk, e: now() + USED_KEY_LIFETIME, r: true });
        self.e = now() + RATCHET_LIFETIME;
        Ok(mk)
    }

    /// Derive and store the message keys for skipped numbers below `n`.
    fn skip_until(&mut self, n: u64) -> Result<()> {
        if self.r.n >= n {
            return Ok(());
        }
        let hk = self
            .r
            .hk
            .ok_or_else(|| CovertError::Ratchet("receive chain has no header key".into()))?;
        while self.r.n < n {
            let ck = self
                .r
                .ck
                .ok_or_else(|| CovertError::Ratchet("receive chain not established".into()))?;
            let (ck, mk) = chainstep(&ck, b"");
            self.r.ck = Some(ck);
            self.remember(MsgKey {
                hk,
                n: self.r.n,
                mk,
                e: now() + RATCHET_LIFETIME,
                r: false,
            });
            self.r.n += 1;
        }
        Ok(())
    }

    fn remember(&mut self, key: MsgKey) {
        self.msg.push(key);
        if self.msg.len() > MAXSKIP {
            let excess = self.msg.len() - MAXSKIP;
            self.msg.drain(..excess);
        }
    }

    /// Drop expired message keys; returns whether the whole state expired.
    pub fn expire(&mut self, at: u64) -> bool {
        self.msg.retain(|m| m.e > at);
        self.e <= at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Ratchet, Ratchet, Key, Key) {
        let alice_id = Key::new();
        let bob_id = Key::new();
        let shared = [0x42u8; 32];
        let mut alice = Ratchet::new();
        alice.peerkey = Some(Key::from_pk(bob_id.pk.unwrap()));
        alice.prepare_alice(shared, &alice_id).unwrap();
        let mut bob = Ratchet::new();
        bob.init_bob(shared, &bob_id, &Key::from_pk(alice_id.pk.unwrap()))
            .unwrap();
        (alice, bob, alice_id, bob_id)
    }

    #[test]
    fn first_reply_matches() {
        let (mut alice, mut bob, _, _) = pair();
        let (header, mk_bob) = bob.send().unwrap();
        let mut ct = header.clone();
        ct.extend_from_slice(&[0u8; 32]); // trailing data irrelevant here
        let mk_alice = alice.receive(&ct).unwrap();
        assert_eq!(mk_alice, mk_bob);
    }

    #[test]
    fn conversation_roundtrips_both_ways() {
        let (mut alice, mut bob, _, _) = pair();
        // Bob replies, Alice receives.
        let (h1, k1) = bob.send().unwrap();
        assert_eq!(alice.receive(&pad(&h1)).unwrap(), k1);
        // Alice answers; Bob must step his DH ratchet via NHK.
        let (h2, k2) = alice.send().unwrap();
        assert_eq!(bob.receive(&pad(&h2)).unwrap(), k2);
        // And back again.
        let (h3, k3) = bob.send().unwrap();
        assert_eq!(alice.receive(&pad(&h3)).unwrap(), k3);
        let (h4, k4) = alice.send().unwrap();
        assert_eq!(bob.receive(&pad(&h4)).unwrap(), k4);
    }

    #[test]
    fn out_of_order_within_window() {
        let (mut alice, mut bob, _, _) = pair();
        let (h1, k1) = bob.send().unwrap();
        let (h2, k2) = bob.send().unwrap();
        let (h3, k3) = bob.send().unwrap();
        // Deliver 3 first, then 1 and 2 from the skipped store.
        assert_eq!(alice.receive(&pad(&h3)).unwrap(), k3);
        assert_eq!(alice.receive(&pad(&h1)).unwrap(), k1);
        assert_eq!(alice.receive(&pad(&h2)).unwrap(), k2);
    }

    #[test]
    fn used_keys_allow_redecryption() {
        let (mut alice, mut bob, _, _) = pair();
        let (h1, k1) = bob.send().unwrap();
        assert_eq!(alice.receive(&pad(&h1)).unwrap(), k1);
        // The same file decrypts again shortly after.
        assert_eq!(alice.receive(&pad(&h1)).unwrap(), k1);
    }

    #[test]
    fn multiple_initial_messages() {
        let alice_id = Key::new();
        let bob_id = Key::new();
        let mut alice = Ratchet::new();
        alice.peerkey = Some(Key::from_pk(bob_id.pk.unwrap()));
        for i in 0..3u8 {
            alice.prepare_alice([i; 32], &alice_id).unwrap();
        }
        // Bob saw only the second message.
        let mut bob = Ratchet::new();
        bob.init_bob([1u8; 32], &bob_id, &Key::from_pk(alice_id.pk.unwrap()))
            .unwrap();
        let (h, k) = bob.send().unwrap();
        assert_eq!(alice.receive(&pad(&h)).unwrap(), k);
        assert!(alice.pre.is_empty());
    }

    #[test]
    fn serialization_roundtrip_preserves_conversation() {
        let (mut alice, mut bob, _, _) = pair();
        let (h1, k1) = bob.send().unwrap();
        assert_eq!(alice.receive(&pad(&h1)).unwrap(), k1);
        // Persist and restore both sides mid-conversation.
        let alice_bytes = rmp_serde::to_vec_named(&alice).unwrap();
        let bob_bytes = rmp_serde::to_vec_named(&bob).unwrap();
        let mut alice2: Ratchet = rmp_serde::from_slice(&alice_bytes).unwrap();
        let mut bob2: Ratchet = rmp_serde::from_slice(&bob_bytes).unwrap();
        let (h2, k2) = alice2.send().unwrap();
        assert_eq!(bob2.receive(&pad(&h2)).unwrap(), k2);
    }

    #[test]
    fn expiry_drops_message_keys() {
        let (mut alice, mut bob, _, _) = pair();
        bob.send().unwrap();
        bob.send().unwrap();
        let (h3, k3) = bob.send().unwrap();
        assert_eq!(alice.receive(&pad(&h3)).unwrap(), k3);
        assert!(!alice.msg.is_empty());
        let far_future = now() + RATCHET_LIFETIME + 1;
        assert!(alice.expire(far_future));
        assert!(alice.msg.is_empty());
    }

    fn pad(header: &[u8]) -> Vec<u8> {
        let mut ct = header.to_vec();
        ct.extend_from_slice(&[0u8; 64]);
        ct
    }
}

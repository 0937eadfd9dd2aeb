//! The chained AEAD block stream.
//!
//! Ciphertext is a sequence of variable-length ChaCha20-Poly1305 blocks.
//! The last three plaintext bytes of each block carry the next block's
//! plaintext length, so no framing exists outside the AEAD. Block 0 is
//! found by trial decryption within the first kilobyte; everything after
//! the final block is signature data.
//!
//! Both directions run AEAD jobs on a fixed worker pool and consume
//! completions in submission order, so plaintext order always equals
//! file order. Decryption guesses upcoming block lengths from the latest
//! known value and recovers by resetting the queue when a guess fails.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::mpsc;

use sha2::{Digest, Sha512};

use crate::aead;
use crate::error::{CovertError, Result};
use crate::header::{decrypt_header, encrypt_header, Auth, AuthMethod, Header};
use crate::key::Key;
use crate::util::NonceGen;

/// Maximum plaintext bytes in one block.
pub const BS: usize = (1 << 20) - 19;

/// AEAD jobs in flight on either side.
const WORKERS: usize = 8;

/// Ciphertext overhead per block: 3-byte next length + 16-byte tag.
const OVERHEAD: usize = 19;

fn worker_pool() -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(WORKERS)
        .build()
        .map_err(|e| CovertError::Value(format!("worker pool: {e}")))
}

fn sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

fn chain_hash(blkhash: &[u8; 64], tag: &[u8]) -> [u8; 64] {
    let mut h = Sha512::new();
    h.update(blkhash);
    h.update(tag);
    let mut out = [0u8; 64];
    out.copy_from_slice(&h.finalize());
    out
}

/// A plaintext block being filled by the input callback.
pub struct Block {
    data: Vec<u8>,
    /// Fill position; zero after the callback returns signals EOF.
    pub pos: usize,
    /// Exact length demand, when the producer knows it.
    pub len: Option<usize>,
    aad: Option<Vec<u8>>,
    /// Next block's plaintext length, when the producer knows it.
    pub nextlen: Option<usize>,
}

impl Block {
    pub fn new(maxlen: usize, aad: Option<Vec<u8>>) -> Block {
        Block { data: vec![0u8; maxlen], pos: 0, len: None, aad, nextlen: None }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn space_left(&self) -> usize {
        self.len.unwrap_or(self.data.len()) - self.pos
    }

    /// The writable region; advance `pos` after filling.
    pub fn buf(&mut self) -> &mut [u8] {
        let end = self.len.unwrap_or(self.data.len());
        &mut self.data[self.pos..end]
    }

    /// The bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Copy in as much of `data` as fits, returning the number consumed.
    pub fn consume(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.space_left());
        self.data[self.pos..self.pos + n].copy_from_slice(&data[..n]);
        self.pos += n;
        n
    }

    /// Seal the block: append the next length and encrypt in place.
    fn finalize(mut self, nextlen: usize, n: [u8; 12], key: [u8; 32]) -> Result<Vec<u8>> {
        if let Some(len) = self.len {
            if self.pos < len {
                return Err(CovertError::Value(format!(
                    "block with len {len} finalized with only {}",
                    self.pos
                )));
            }
        }
        self.data.truncate(self.pos);
        self.data.extend_from_slice(&(nextlen as u32).to_le_bytes()[..3]);
        self.data.resize(self.pos + OVERHEAD, 0);
        aead::encrypt_into(&mut self.data, self.aad.as_deref(), &n, &key)?;
        Ok(self.data)
    }
}

enum EncState {
    Header,
    Data,
    Sigs,
    Done,
}

/// Pull-model encryption: iterates ciphertext chunks.
///
/// The input callback fills each block synchronously on the main thread;
/// sealed blocks are encrypted on the pool and yielded in order.
pub struct EncryptStream<'a> {
    input: Box<dyn FnMut(&mut Block) -> Result<()> + 'a>,
    pool: rayon::ThreadPool,
    key: [u8; 32],
    nonce: NonceGen,
    header: Vec<u8>,
    block: Option<Block>,
    queue: VecDeque<Block>,
    #[allow(clippy::type_complexity)]
    futures: VecDeque<mpsc::Receiver<Result<Vec<u8>>>>,
    prev_nextlen: Option<usize>,
    run: bool,
    produced: bool,
    blkhash: [u8; 64],
    signers: Vec<Key>,
    sig_idx: usize,
    state: EncState,
}

impl<'a> EncryptStream<'a> {
    pub fn new(
        auth: &mut Auth<'_>,
        input: impl FnMut(&mut Block) -> Result<()> + 'a,
        signers: &[Key],
    ) -> Result<EncryptStream<'a>> {
        let built = encrypt_header(auth)?;
        let first = Block::new(1024 - built.header.len() - OVERHEAD, Some(built.header.clone()));
        Ok(EncryptStream {
            input: Box::new(input),
            pool: worker_pool()?,
            key: built.key,
            nonce: built.nonce,
            blkhash: sha512(&built.header),
            header: built.header,
            block: Some(first),
            queue: VecDeque::new(),
            futures: VecDeque::new(),
            prev_nextlen: None,
            run: true,
            produced: false,
            signers: signers.to_vec(),
            sig_idx: 0,
            state: EncState::Header,
        })
    }

    /// The running block hash; final once the stream is exhausted.
    pub fn filehash(&self) -> [u8; 64] {
        self.blkhash
    }

    fn submit_ready(&mut self) -> Result<()> {
        loop {
            let front_ready = match self.queue.front() {
                None => false,
                Some(front) => self.queue.len() > 1 || front.nextlen.is_some() || !self.run,
            };
            if !front_ready {
                return Ok(());
            }
            let out = self.queue.pop_front().expect("checked non-empty");
            if let Some(prev) = self.prev_nextlen {
                if prev != 0 && prev != out.pos {
                    return Err(CovertError::Value(format!(
                        "previous block announced {prev} bytes but got {}",
                        out.pos
                    )));
                }
            }
            let nextlen = out
                .nextlen
                .unwrap_or_else(|| self.queue.front().map(|b| b.pos).unwrap_or(0));
            self.prev_nextlen = Some(nextlen);
            let n = self.nonce.next_nonce();
            let key = self.key;
            let (tx, rx) = mpsc::channel();
            self.pool.spawn(move || {
                let _ = tx.send(out.finalize(nextlen, n, key));
            });
            self.futures.push_back(rx);
        }
    }

    fn pop_future(&mut self) -> Result<Vec<u8>> {
        let rx = self.futures.pop_front().expect("caller checked non-empty");
        let ct = rx
            .recv()
            .map_err(|_| CovertError::Value("encryption worker vanished".into()))??;
        self.blkhash = chain_hash(&self.blkhash, &ct[ct.len() - 16..]);
        self.produced = true;
        Ok(ct)
    }

    fn signature_block(&mut self) -> Result<Vec<u8>> {
        let signer = &self.signers[self.sig_idx];
        self.sig_idx += 1;
        let signature = signer.sign(&self.blkhash)?;
        let mut nk = self.blkhash.to_vec();
        nk.extend_from_slice(&signer.pk()?);
        let digest = sha512(&nk);
        let mut nsig = [0u8; 12];
        nsig.copy_from_slice(&digest[..12]);
        let mut ksig = [0u8; 32];
        ksig.copy_from_slice(&self.blkhash[..32]);
        aead::encrypt(&signature, None, &nsig, &ksig)
    }
}

impl Iterator for EncryptStream<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                EncState::Header => {
                    self.state = EncState::Data;
                    return Some(Ok(self.header.clone()));
                }
                EncState::Data => {
                    // Yield finished jobs once enough are queued, or all
                    // of them when input has ended.
                    if !self.futures.is_empty() && (self.futures.len() > WORKERS || !self.run) {
                        return Some(self.pop_future());
                    }
                    if self.run {
                        let mut block = self.block.take().expect("block in Data state");
                        if let Err(e) = (self.input)(&mut block) {
                            return Some(Err(e));
                        }
                        if block.pos > 0 {
                            self.queue.push_back(block);
                            self.block = Some(Block::new(BS, None));
                        } else {
                            self.run = false;
                            self.block = Some(block);
                        }
                        if let Err(e) = self.submit_ready() {
                            return Some(Err(e));
                        }
                        continue;
                    }
                    // Input done and all futures drained.
                    if !self.produced {
                        // Keep even empty input decryptable: one empty
                        // terminator block carrying nextlen 0.
                        let term = Block::new(0, Some(self.header.clone()));
                        let n = self.nonce.next_nonce();
                        let res = term.finalize(0, n, self.key);
                        self.state = EncState::Sigs;
                        return Some(res.map(|ct| {
                            self.blkhash = chain_hash(&self.blkhash, &ct[ct.len() - 16..]);
                            self.produced = true;
                            ct
                        }));
                    }
                    self.state = EncState::Sigs;
                }
                EncState::Sigs => {
                    if self.sig_idx < self.signers.len() {
                        return Some(self.signature_block());
                    }
                    self.state = EncState::Done;
                }
                EncState::Done => return None,
            }
        }
    }
}

/// One verified (or failed) trailing signature.
#[derive(Debug, Clone)]
pub struct SigResult {
    pub valid: bool,
    pub key: Key,
    pub message: &'static str,
}

/// Buffered ciphertext source with push-back, so block length guesses
/// can be rewound. Wraps any reader; slices and memory maps come in as
/// `&[u8]`.
struct CipherSource<R: Read> {
    front: VecDeque<u8>,
    inner: R,
}

impl<R: Read> CipherSource<R> {
    fn new(inner: R) -> CipherSource<R> {
        CipherSource { front: VecDeque::new(), inner }
    }

    /// Read up to `len` bytes; shorter output means EOF is near.
    fn read_up_to(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let take = len.min(self.front.len());
        out.extend(self.front.drain(..take));
        while out.len() < len {
            let mut buf = vec![0u8; len - out.len()];
            let n = self.inner.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Return bytes to the front, preserving stream order.
    fn push_back(&mut self, data: Vec<u8>) {
        for b in data.into_iter().rev() {
            self.front.push_front(b);
        }
    }
}

type DecJob = (mpsc::Receiver<(Result<Vec<u8>>, Vec<u8>)>, [u8; 12], usize, bool);

/// Pull-model decryption: iterates plaintext blocks (trailing length
/// trimmed). After the last block, call [`DecryptStream::verify_signatures`].
pub struct DecryptStream<R: Read> {
    source: CipherSource<R>,
    pool: rayon::ThreadPool,
    key: [u8; 32],
    nonce: NonceGen,
    blkhash: [u8; 64],
    /// Ciphertext length of the next block (stored length + overhead).
    next_blklen: usize,
    first: Option<Vec<u8>>,
    queue: VecDeque<DecJob>,
    pub header: Header,
    done: bool,
}

impl<R: Read> DecryptStream<R> {
    /// Authenticate and open a stream; consumes up to 1 KiB for probing.
    pub fn new(methods: &mut [AuthMethod<'_>], reader: R) -> Result<DecryptStream<R>> {
        let mut source = CipherSource::new(reader);
        let head = source.read_up_to(1024)?;
        let (header, nonce) = decrypt_header(&head, methods)?;
        // Bytes past block 0 go back for the block loop.
        source.push_back(head[header.block0_end..].to_vec());
        let blkhash = sha512(&head[..header.block0_start]);
        let blkhash = chain_hash(&blkhash, &head[header.block0_end - 16..header.block0_end]);
        let nextlen = stored_nextlen(&header.block0);
        let mut first = header.block0.clone();
        first.truncate(first.len() - 3);
        Ok(DecryptStream {
            source,
            pool: worker_pool()?,
            key: header.key,
            nonce,
            blkhash,
            next_blklen: nextlen + OVERHEAD,
            first: Some(first),
            queue: VecDeque::new(),
            header,
            done: false,
        })
    }

    /// The running block hash; equals the encryptor's after the stream.
    pub fn filehash(&self) -> [u8; 64] {
        self.blkhash
    }

    fn spawn_job(&mut self, buf: Vec<u8>, exact: bool) {
        let n = self.nonce.next_nonce();
        let key = self.key;
        let blklen = buf.len();
        let (tx, rx) = mpsc::channel();
        self.pool.spawn(move || {
            let mut work = buf.clone();
            let res = aead::decrypt_into(&mut work, None, &n, &key).map(|len| {
                work.truncate(len);
                work
            });
            let _ = tx.send((res, buf));
        });
        self.queue.push_back((rx, n, blklen, exact));
    }

    fn prefetch(&mut self) -> Result<()> {
        while self.queue.len() < WORKERS {
            let buf = self.source.read_up_to(self.next_blklen)?;
            if buf.is_empty() {
                break;
            }
            self.spawn_job(buf, false);
        }
        Ok(())
    }

    /// Drain queued jobs back into the source, in submission order.
    fn rewind_queue(&mut self) -> Result<Vec<u8>> {
        let mut rewound = Vec::new();
        for (rx, _, _, _) in self.queue.drain(..) {
            let (_, buf) = rx
                .recv()
                .map_err(|_| CovertError::Value("decryption worker vanished".into()))?;
            rewound.extend_from_slice(&buf);
        }
        Ok(rewound)
    }

    /// After the final block: check each signer's trailing 80-byte block.
    pub fn verify_signatures(&mut self, keys: &[Key]) -> Vec<SigResult> {
        let mut results = Vec::new();
        for key in keys {
            results.push(self.verify_one(key));
        }
        results
    }

    fn verify_one(&mut self, key: &Key) -> SigResult {
        let corrupt = |key: &Key| SigResult {
            valid: false,
            key: key.clone(),
            message: "Signature corrupted or data manipulated",
        };
        let Ok(block) = self.source.read_up_to(80) else {
            return corrupt(key);
        };
        if block.len() != 80 {
            return corrupt(key);
        }
        let Ok(pk) = key.pk() else {
            return corrupt(key);
        };
        let mut nk = self.blkhash.to_vec();
        nk.extend_from_slice(&pk);
        let digest = sha512(&nk);
        let mut nsig = [0u8; 12];
        nsig.copy_from_slice(&digest[..12]);
        let mut ksig = [0u8; 32];
        ksig.copy_from_slice(&self.blkhash[..32]);
        match aead::decrypt(&block, None, &nsig, &ksig) {
            Err(_) => corrupt(key),
            Ok(signature) => match key.verify(&self.blkhash, &signature) {
                Ok(()) => {
                    tracing::debug!("blockstream: signature verified for {key:?}");
                    SigResult { valid: true, key: key.clone(), message: "Signature verified" }
                }
                Err(_) => SigResult {
                    valid: false,
                    key: key.clone(),
                    message: "Forged signature",
                },
            },
        }
    }
}

fn stored_nextlen(plain: &[u8]) -> usize {
    let t = &plain[plain.len() - 3..];
    u32::from_le_bytes([t[0], t[1], t[2], 0]) as usize
}

impl<R: Read> Iterator for DecryptStream<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(first) = self.first.take() {
            return Some(Ok(first));
        }
        loop {
            if self.done || self.next_blklen <= OVERHEAD {
                self.done = true;
                return None;
            }
            if self.queue.is_empty() {
                match self.prefetch() {
                    Ok(()) => {}
                    Err(e) => return Some(Err(e)),
                }
                if self.queue.is_empty() {
                    // Expected more data: the previous block announced a
                    // follow-up that is not there.
                    self.done = true;
                    return Some(Err(CovertError::Decrypt(
                        "unexpected end of ciphertext".into(),
                    )));
                }
            }
            let (rx, n, blklen, exact) = self.queue.pop_front().expect("checked non-empty");
            let (res, ctbuf) = match rx.recv() {
                Ok(r) => r,
                Err(_) => {
                    return Some(Err(CovertError::Value("decryption worker vanished".into())))
                }
            };
            match res {
                Ok(mut plain) => {
                    if plain.len() < 3 {
                        self.done = true;
                        return Some(Err(CovertError::Decrypt(
                            "block too short for framing".into(),
                        )));
                    }
                    self.blkhash = chain_hash(&self.blkhash, &ctbuf[ctbuf.len() - 16..]);
                    self.next_blklen = stored_nextlen(&plain) + OVERHEAD;
                    plain.truncate(plain.len() - 3);
                    if self.next_blklen <= OVERHEAD {
                        // Final block: rewind any prefetched signature
                        // bytes consumed as block guesses.
                        if let Err(e) = self.rewind_queue().map(|b| self.source.push_back(b)) {
                            return Some(Err(e));
                        }
                        self.done = true;
                    }
                    return Some(Ok(plain));
                }
                Err(_) if exact || blklen == self.next_blklen => {
                    self.done = true;
                    return Some(Err(CovertError::Decrypt(
                        "failed to decrypt next block".into(),
                    )));
                }
                Err(_) => {
                    // The length guess was wrong: rewind, reset the nonce
                    // to this block and retry with the now-known length.
                    tracing::debug!(
                        "blockstream: length guess {blklen} wrong, retrying with {}",
                        self.next_blklen
                    );
                    let mut rewound = ctbuf;
                    match self.rewind_queue() {
                        Ok(rest) => rewound.extend_from_slice(&rest),
                        Err(e) => return Some(Err(e)),
                    }
                    self.source.push_back(rewound);
                    self.nonce = NonceGen::new(n);
                    let want = self.next_blklen;
                    match self.source.read_up_to(want) {
                        Ok(buf) => self.spawn_job(buf, true),
                        Err(e) => return Some(Err(e.into())),
                    }
                }
            }
        }
    }
}

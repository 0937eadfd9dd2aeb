//! The MsgPack-framed file/message container inside the block stream.
//!
//! A small index value comes first: either a bare integer (one anonymous
//! file of that size) or a map with `f` (file records), `s` (signing
//! keys), `r` (ratchet advertisement) and any pass-through extras. File
//! data follows in index order; unknown-size files are chunked with
//! MsgPack length frames; nil values anywhere are padding.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use rmpv::Value;

use crate::blockstream::Block;
use crate::error::{CovertError, Result};
use crate::util;

/// Streaming chunk size for unknown-length inputs (10 MiB).
const STREAM_CHUNK: usize = 10 << 20;

/// Largest single MsgPack object tolerated in an archive.
const MAX_OBJECT: usize = 1 << 20;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Stage {
    Index,
    File,
    FileStream,
    Finalize,
    End,
}

/// One file in the archive: the `[size, name, meta]` triple.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileRecord {
    /// Byte size; None while streaming from a pipe.
    pub size: Option<u64>,
    /// None for anonymous content (a message).
    pub name: Option<String>,
    /// String-keyed metadata; `x` marks an executable.
    pub meta: BTreeMap<String, Value>,
}

impl FileRecord {
    pub fn sized(size: u64) -> FileRecord {
        FileRecord { size: Some(size), ..FileRecord::default() }
    }

    fn to_value(&self) -> Value {
        let meta: Vec<(Value, Value)> = self
            .meta
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect();
        Value::Array(vec![
            self.size.map(Value::from).unwrap_or(Value::Nil),
            self.name
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::Nil),
            Value::Map(meta),
        ])
    }

    fn from_value(val: &Value) -> Result<FileRecord> {
        let Value::Array(items) = val else {
            return Err(CovertError::Value("invalid file record in archive".into()));
        };
        let mut rec = FileRecord::default();
        if let Some(v) = items.first() {
            rec.size = match v {
                Value::Nil => None,
                _ => Some(v.as_u64().ok_or_else(|| {
                    CovertError::Value("invalid or corrupted archive, bad file size".into())
                })?),
            };
        }
        if let Some(v) = items.get(1) {
            rec.name = match v {
                Value::Nil => None,
                Value::String(s) => Some(validate_name(s.as_str())?),
                _ => return Err(CovertError::Value("invalid filename in archive".into())),
            };
        }
        if let Some(v) = items.get(2) {
            let Value::Map(pairs) = v else {
                return Err(CovertError::Value("invalid file meta in archive".into()));
            };
            for (k, val) in pairs {
                let Value::String(key) = k else {
                    return Err(CovertError::Value("invalid meta key in archive".into()));
                };
                let key = key
                    .as_str()
                    .ok_or_else(|| CovertError::Value("invalid meta key in archive".into()))?;
                rec.meta.insert(key.to_string(), val.clone());
            }
        }
        Ok(rec)
    }
}

fn validate_name(name: Option<&str>) -> Result<String> {
    let Some(name) = name else {
        return Err(CovertError::Value("invalid filename or corruption of archive".into()));
    };
    let bytes = name.as_bytes().len();
    if bytes == 0 || bytes > 255 {
        return Err(CovertError::Value("invalid filename or corruption of archive".into()));
    }
    let printable = name.chars().all(|c| !c.is_control());
    if !printable || name.contains('\\') || name.contains(':') || name.starts_with('/') {
        return Err(CovertError::Value(format!("invalid filename {name:?}")));
    }
    Ok(name.to_string())
}

/// The archive index.
#[derive(Clone, Default, Debug)]
pub struct Index {
    pub files: Vec<FileRecord>,
    /// Ed25519 public keys of the signers, in signature block order.
    pub signers: Vec<[u8; 32]>,
    /// Ratchet advertisement: 1-based number of this initial message.
    pub ratchet: Option<u64>,
    /// Pass-through keys (the ID store rides in `I`).
    pub extra: BTreeMap<String, Value>,
}

impl Index {
    /// Short form applies to a single anonymous sized file, nothing else.
    fn is_short_form(&self) -> bool {
        self.signers.is_empty()
            && self.ratchet.is_none()
            && self.extra.is_empty()
            && self.files.len() == 1
            && self.files[0].name.is_none()
            && self.files[0].meta.is_empty()
            && self.files[0].size.is_some()
    }

    fn to_value(&self) -> Value {
        if self.is_short_form() {
            return Value::from(self.files[0].size.expect("short form is sized"));
        }
        let mut map: Vec<(Value, Value)> = Vec::new();
        if !self.files.is_empty() {
            map.push((
                Value::from("f"),
                Value::Array(self.files.iter().map(FileRecord::to_value).collect()),
            ));
        }
        if let Some(r) = self.ratchet {
            map.push((Value::from("r"), Value::from(r)));
        }
        if !self.signers.is_empty() {
            map.push((
                Value::from("s"),
                Value::Array(
                    self.signers
                        .iter()
                        .map(|pk| Value::Binary(pk.to_vec()))
                        .collect(),
                ),
            ));
        }
        for (k, v) in &self.extra {
            map.push((Value::from(k.as_str()), v.clone()));
        }
        Value::Map(map)
    }

    fn from_value(val: Value) -> Result<Index> {
        if let Some(size) = val.as_u64() {
            return Ok(Index { files: vec![FileRecord::sized(size)], ..Index::default() });
        }
        let Value::Map(pairs) = val else {
            return Err(CovertError::Value("archive index not found".into()));
        };
        let mut index = Index::default();
        for (k, v) in pairs {
            let Value::String(key) = &k else {
                return Err(CovertError::Value("invalid archive index key".into()));
            };
            match key.as_str() {
                Some("f") => {
                    let Value::Array(items) = &v else {
                        return Err(CovertError::Value("invalid file list in archive".into()));
                    };
                    index.files = items
                        .iter()
                        .map(FileRecord::from_value)
                        .collect::<Result<Vec<_>>>()?;
                }
                Some("s") => {
                    let Value::Array(items) = &v else {
                        return Err(CovertError::Value("invalid signer list in archive".into()));
                    };
                    for item in items {
                        let bytes = match item {
                            Value::Binary(b) => b.as_slice(),
                            Value::String(s) => s.as_bytes(),
                            _ => {
                                return Err(CovertError::Value(
                                    "invalid signer key in archive".into(),
                                ))
                            }
                        };
                        let pk: [u8; 32] = bytes.try_into().map_err(|_| {
                            CovertError::Value("invalid signer key in archive".into())
                        })?;
                        index.signers.push(pk);
                    }
                }
                Some("r") => {
                    index.ratchet = Some(v.as_u64().ok_or_else(|| {
                        CovertError::Value("invalid ratchet advertisement".into())
                    })?);
                }
                Some(other) => {
                    index.extra.insert(other.to_string(), v);
                }
                None => return Err(CovertError::Value("invalid archive index key".into())),
            }
        }
        Ok(index)
    }
}

/// Content source for one file being encoded.
pub enum ArchiveInput {
    /// A named filesystem path; size from metadata.
    Path(PathBuf),
    /// Anonymous in-memory content (a text message).
    Bytes(Vec<u8>),
    /// Unknown length; pre-read up to 10 MiB decides sized vs streaming.
    Stream(Box<dyn Read>),
}

enum FileSource {
    Bytes(Cursor<Vec<u8>>),
    Reader(Box<dyn Read>),
}

impl FileSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            FileSource::Bytes(c) => c.read(buf),
            FileSource::Reader(r) => r.read(buf),
        }
    }
}

/// The encoder state machine. Drives `Block` filling as the
/// `block_input` callback of the block stream.
pub struct Archive {
    pub stage: Stage,
    pub index: Index,
    sources: Vec<FileSource>,
    fidx: Option<usize>,
    fpos: u64,
    /// MsgPack nil values to append after the last file.
    pub padding: u64,
    /// Pre-read bytes counted into the padding size estimate.
    extrasize: u64,
    buffer: Vec<u8>,
    bufpos: usize,
    /// The final block hash, attached after encryption or decryption.
    pub filehash: Option<[u8; 64]>,
}

impl Default for Archive {
    fn default() -> Archive {
        Archive::new()
    }
}

impl Archive {
    pub fn new() -> Archive {
        Archive {
            stage: Stage::Index,
            index: Index::default(),
            sources: Vec::new(),
            fidx: None,
            fpos: 0,
            padding: 0,
            extrasize: 0,
            buffer: Vec::new(),
            bufpos: 0,
            filehash: None,
        }
    }

    /// Build the file list and attach content sources.
    pub fn file_index(&mut self, inputs: Vec<ArchiveInput>) -> Result<()> {
        for input in inputs {
            match input {
                ArchiveInput::Path(path) => {
                    let meta = std::fs::metadata(&path)?;
                    let mut record = FileRecord::sized(meta.len());
                    record.name = Some(validate_name(basename(&path))?);
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        if meta.permissions().mode() & 0o100 != 0 {
                            record.meta.insert("x".into(), Value::Boolean(true));
                        }
                    }
                    self.index.files.push(record);
                    self.sources
                        .push(FileSource::Reader(Box::new(std::fs::File::open(&path)?)));
                }
                ArchiveInput::Bytes(data) => {
                    self.index.files.push(FileRecord::sized(data.len() as u64));
                    self.sources.push(FileSource::Bytes(Cursor::new(data)));
                }
                ArchiveInput::Stream(mut reader) => {
                    // Decide between a sized record and true streaming.
                    let mut pre = vec![0u8; STREAM_CHUNK];
                    let mut got = 0;
                    while got < pre.len() {
                        let n = reader.read(&mut pre[got..])?;
                        if n == 0 {
                            break;
                        }
                        got += n;
                    }
                    pre.truncate(got);
                    if got == STREAM_CHUNK {
                        self.extrasize += got as u64;
                        self.index.files.push(FileRecord::default());
                        self.sources.push(FileSource::Reader(Box::new(
                            Cursor::new(pre).chain(reader),
                        )));
                    } else {
                        self.index.files.push(FileRecord::sized(got as u64));
                        self.sources.push(FileSource::Bytes(Cursor::new(pre)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Total known plaintext size, for padding calculations.
    pub fn total_size(&self) -> u64 {
        self.index
            .files
            .iter()
            .map(|f| f.size.unwrap_or(0))
            .sum::<u64>()
            + self.extrasize
    }

    /// Randomize padding; call after adding files, before encoding.
    pub fn random_padding(&mut self, ratio: f64) -> Result<()> {
        self.padding = util::random_padding(self.total_size(), ratio)?;
        Ok(())
    }

    fn bytes_left(&self) -> Option<u64> {
        match (self.stage, self.fidx) {
            (Stage::File, Some(i)) => {
                Some(self.index.files[i].size.expect("sized in File stage") - self.fpos)
            }
            _ => None,
        }
    }

    /// Advance to the next file; false once all files are done.
    fn next_file(&mut self) -> Result<bool> {
        match self.stage {
            Stage::File | Stage::FileStream => {
                let i = self.fidx.expect("file stage has an index");
                if let Some(size) = self.index.files[i].size {
                    if self.stage == Stage::File && size != self.fpos {
                        return Err(CovertError::Value(format!(
                            "file {i} ended at {} of {size} bytes",
                            self.fpos
                        )));
                    }
                }
                self.fidx = Some(i + 1);
            }
            Stage::Index => self.fidx = Some(0),
            _ => return Err(CovertError::Value("archive state inconsistent".into())),
        }
        self.fpos = 0;
        let i = self.fidx.expect("set above");
        if i == self.index.files.len() {
            self.stage = Stage::Finalize;
            self.fidx = None;
            return Ok(false);
        }
        self.stage = if self.index.files[i].size.is_none() {
            Stage::FileStream
        } else {
            Stage::File
        };
        Ok(true)
    }

    fn buffered(&self) -> usize {
        self.buffer.len() - self.bufpos
    }

    fn set_buffer(&mut self, data: Vec<u8>) {
        self.buffer = data;
        self.bufpos = 0;
    }

    /// Fill a block with archive data; the block stream calls this until
    /// it returns without advancing `block.pos`.
    pub fn encode(&mut self, block: &mut Block) -> Result<()> {
        while block.space_left() > 0 && (self.stage != Stage::End || self.buffered() > 0) {
            // Flush buffered msgpack data first.
            if self.buffered() > 0 {
                let n = block.consume(&self.buffer[self.bufpos..]);
                self.bufpos += n;
                continue;
            }
            match self.stage {
                Stage::File => {
                    let left = self.bytes_left().expect("File stage is sized");
                    if left == 0 {
                        self.next_file()?;
                        continue;
                    }
                    let i = self.fidx.expect("File stage has an index");
                    let want = (left as usize).min(block.space_left());
                    let buf = block.buf();
                    let n = self.sources[i].read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(CovertError::Value(format!(
                            "unexpected end of file {} at {}",
                            i + 1,
                            self.fpos
                        )));
                    }
                    block.pos += n;
                    self.fpos += n as u64;
                }
                Stage::Index => {
                    let mut out = Vec::new();
                    rmpv::encode::write_value(&mut out, &self.index.to_value())
                        .map_err(|e| CovertError::Value(format!("index encoding: {e}")))?;
                    self.set_buffer(out);
                    self.next_file()?;
                }
                Stage::FileStream => {
                    let i = self.fidx.expect("FileStream stage has an index");
                    let mut chunk = vec![0u8; STREAM_CHUNK];
                    let mut got = 0;
                    while got < chunk.len() {
                        let n = self.sources[i].read(&mut chunk[got..])?;
                        if n == 0 {
                            break;
                        }
                        got += n;
                    }
                    chunk.truncate(got);
                    let mut out = Vec::new();
                    rmpv::encode::write_value(&mut out, &Value::from(got as u64))
                        .map_err(|e| CovertError::Value(format!("chunk encoding: {e}")))?;
                    out.extend_from_slice(&chunk);
                    if got == 0 {
                        self.next_file()?;
                    }
                    self.set_buffer(out);
                }
                Stage::Finalize => {
                    let out = vec![0xC0u8; self.padding as usize];
                    self.set_buffer(out);
                    self.stage = Stage::End;
                }
                Stage::End => unreachable!("loop condition excludes End with no buffer"),
            }
        }
        Ok(())
    }
}

fn basename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Events produced while decoding an archive.
#[derive(Debug)]
pub enum ArchiveEvent {
    Index(Index),
    /// A file's content starts; the index refers to `Index::files`.
    FileBegin(usize),
    FileData(Vec<u8>),
}

/// Pull-model archive decoder over an iterator of plaintext blocks.
pub struct ArchiveDecoder<I> {
    blocks: I,
    stage: Stage,
    files: Vec<FileRecord>,
    fidx: Option<usize>,
    fpos: u64,
    pub padding: u64,
    buffer: Vec<u8>,
    bufpos: usize,
    pending: Option<ArchiveEvent>,
}

impl<I> ArchiveDecoder<I>
where
    I: Iterator<Item = Result<Vec<u8>>>,
{
    pub fn new(blocks: I) -> ArchiveDecoder<I> {
        ArchiveDecoder {
            blocks,
            stage: Stage::Index,
            files: Vec::new(),
            fidx: None,
            fpos: 0,
            padding: 0,
            buffer: Vec::new(),
            bufpos: 0,
            pending: None,
        }
    }

    fn buffered(&self) -> usize {
        self.buffer.len() - self.bufpos
    }

    fn pull_block(&mut self) -> Result<bool> {
        match self.blocks.next() {
            None => Ok(false),
            Some(block) => {
                let block = block?;
                if self.bufpos > 0 {
                    self.buffer.drain(..self.bufpos);
                    self.bufpos = 0;
                }
                self.buffer.extend_from_slice(&block);
                Ok(true)
            }
        }
    }

    fn bytes_left(&self) -> u64 {
        match self.fidx {
            Some(i) => self.files[i].size.unwrap_or(0) - self.fpos,
            None => 0,
        }
    }

    fn next_file(&mut self) -> Result<Option<ArchiveEvent>> {
        match self.stage {
            Stage::File | Stage::FileStream => {
                let i = self.fidx.expect("file stage has an index");
                self.fidx = Some(i + 1);
            }
            Stage::Index => self.fidx = Some(0),
            _ => return Err(CovertError::Value("archive state inconsistent".into())),
        }
        self.fpos = 0;
        let i = self.fidx.expect("set above");
        if i == self.files.len() {
            self.stage = Stage::Finalize;
            self.fidx = None;
            return Ok(None);
        }
        if self.files[i].size.is_none() {
            self.stage = Stage::FileStream;
            self.files[i].size = Some(0);
        } else {
            self.stage = Stage::File;
        }
        Ok(Some(ArchiveEvent::FileBegin(i)))
    }

    /// Parse one msgpack value, pulling blocks as needed.
    fn read_value(&mut self) -> Result<Option<Value>> {
        loop {
            let slice = &self.buffer[self.bufpos..];
            let mut cursor = Cursor::new(slice);
            match rmpv::decode::read_value(&mut cursor) {
                Ok(v) => {
                    self.bufpos += cursor.position() as usize;
                    return Ok(Some(v));
                }
                Err(e) if is_eof(&e) => {
                    if self.buffered() > MAX_OBJECT {
                        return Err(CovertError::Value(
                            "extremely large msgpack object, corrupt or malformed archive".into(),
                        ));
                    }
                    if !self.pull_block()? {
                        return Ok(None);
                    }
                }
                Err(_) => {
                    return Err(CovertError::Value("corrupt msgpack data in archive".into()))
                }
            }
        }
    }
}

fn is_eof(e: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match e {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

impl<I> Iterator for ArchiveDecoder<I>
where
    I: Iterator<Item = Result<Vec<u8>>>,
{
    type Item = Result<ArchiveEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(ev) = self.pending.take() {
            return Some(Ok(ev));
        }
        loop {
            if self.stage == Stage::End {
                return None;
            }
            // Fast path: raw file data.
            let left = self.bytes_left();
            if left > 0 {
                if self.buffered() == 0 {
                    match self.pull_block() {
                        Ok(true) => {}
                        Ok(false) => {
                            return Some(Err(CovertError::Value(
                                "unexpected end of archive data".into(),
                            )))
                        }
                        Err(e) => return Some(Err(e)),
                    }
                    continue;
                }
                let take = (left as usize).min(self.buffered());
                let data = self.buffer[self.bufpos..self.bufpos + take].to_vec();
                self.bufpos += take;
                self.fpos += take as u64;
                return Some(Ok(ArchiveEvent::FileData(data)));
            }
            if self.stage == Stage::File {
                match self.next_file() {
                    Ok(Some(ev)) => return Some(Ok(ev)),
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }
            // A msgpack value comes next.
            let val = match self.read_value() {
                Ok(Some(v)) => v,
                Ok(None) => {
                    // Clean end only while consuming trailing padding.
                    if self.stage == Stage::Finalize {
                        self.stage = Stage::End;
                        return None;
                    }
                    return Some(Err(CovertError::Value(
                        "unexpected end of archive data".into(),
                    )));
                }
                Err(e) => return Some(Err(e)),
            };
            match val {
                Value::Nil => {
                    // Padding is allowed and ignored at any stage.
                    self.padding += 1;
                    while self.buffered() > 0 && self.buffer[self.bufpos] == 0xC0 {
                        self.bufpos += 1;
                        self.padding += 1;
                    }
                }
                v if self.stage == Stage::Index => {
                    let index = match Index::from_value(v) {
                        Ok(i) => i,
                        Err(e) => return Some(Err(e)),
                    };
                    self.files = index.files.clone();
                    match self.next_file() {
                        Ok(ev) => self.pending = ev,
                        Err(e) => return Some(Err(e)),
                    }
                    return Some(Ok(ArchiveEvent::Index(index)));
                }
                v if self.stage == Stage::FileStream => {
                    // Chunk length framing; zero ends the file.
                    let Some(chunk) = v.as_u64() else {
                        return Some(Err(CovertError::Value(
                            "archive corrupted: expected file chunk size".into(),
                        )));
                    };
                    if chunk > 0 {
                        let i = self.fidx.expect("FileStream stage has an index");
                        self.files[i].size =
                            Some(self.files[i].size.unwrap_or(0) + chunk);
                    } else {
                        match self.next_file() {
                            Ok(Some(ev)) => return Some(Ok(ev)),
                            Ok(None) => {}
                            Err(e) => return Some(Err(e)),
                        }
                    }
                }
                _ => {
                    return Some(Err(CovertError::Value(
                        "invalid or corrupted data structures found within archive".into(),
                    )))
                }
            }
        }
    }
}

/// Decode a whole archive into memory: index, file contents, padding.
pub fn decode_all<I>(blocks: I) -> Result<(Index, Vec<Vec<u8>>, u64)>
where
    I: Iterator<Item = Result<Vec<u8>>>,
{
    let mut decoder = ArchiveDecoder::new(blocks);
    let mut index = None;
    let mut files: Vec<Vec<u8>> = Vec::new();
    for event in &mut decoder {
        match event? {
            ArchiveEvent::Index(i) => index = Some(i),
            ArchiveEvent::FileBegin(_) => files.push(Vec::new()),
            ArchiveEvent::FileData(data) => match files.last_mut() {
                Some(f) => f.extend_from_slice(&data),
                None => return Err(CovertError::Value("file data before any file".into())),
            },
        }
    }
    let mut index =
        index.ok_or_else(|| CovertError::Value("archive index not found".into()))?;
    // Stream records learn their size during decode.
    for (record, content) in index.files.iter_mut().zip(&files) {
        if record.size.is_none() {
            record.size = Some(content.len() as u64);
        }
    }
    Ok((index, files, decoder.padding))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_to_vec(archive: &mut Archive) -> Vec<u8> {
        let mut flat = Vec::new();
        loop {
            let mut block = Block::new(4096, None);
            archive.encode(&mut block).unwrap();
            if block.pos == 0 {
                break;
            }
            flat.extend_from_slice(block.written());
        }
        flat
    }

    fn roundtrip(archive: &mut Archive) -> (Index, Vec<Vec<u8>>, u64) {
        let flat = encode_to_vec(archive);
        decode_all(std::iter::once(Ok(flat))).unwrap()
    }

    #[test]
    fn single_anonymous_file_uses_short_form() {
        let mut a = Archive::new();
        a.file_index(vec![ArchiveInput::Bytes(b"test".to_vec())]).unwrap();
        let flat = encode_to_vec(&mut a);
        // msgpack(4) is one byte, then the content.
        assert_eq!(flat, b"\x04test");
        let (index, files, padding) = decode_all(std::iter::once(Ok(flat))).unwrap();
        assert_eq!(index.files.len(), 1);
        assert_eq!(index.files[0].size, Some(4));
        assert!(index.files[0].name.is_none());
        assert_eq!(files[0], b"test");
        assert_eq!(padding, 0);
    }

    #[test]
    fn named_files_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo.txt");
        std::fs::write(&path, b"test").unwrap();
        let mut a = Archive::new();
        a.file_index(vec![
            ArchiveInput::Path(path),
            ArchiveInput::Bytes(b"second file".to_vec()),
        ])
        .unwrap();
        let (index, files, _) = roundtrip(&mut a);
        assert_eq!(index.files[0].name.as_deref(), Some("foo.txt"));
        assert_eq!(index.files[0].size, Some(4));
        assert_eq!(files[0], b"test");
        assert_eq!(files[1], b"second file");
    }

    #[test]
    fn padding_is_counted_and_ignored() {
        let mut a = Archive::new();
        a.file_index(vec![ArchiveInput::Bytes(b"data".to_vec())]).unwrap();
        a.padding = 37;
        let (index, files, padding) = roundtrip(&mut a);
        assert_eq!(index.files[0].size, Some(4));
        assert_eq!(files[0], b"data");
        assert_eq!(padding, 37);
    }

    #[test]
    fn streaming_input_chunks_and_totals() {
        // A stream shorter than the chunk limit becomes a sized file.
        let small: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut a = Archive::new();
        a.file_index(vec![ArchiveInput::Stream(Box::new(Cursor::new(small.clone())))])
            .unwrap();
        assert_eq!(a.index.files[0].size, Some(1000));
        let (index, files, _) = roundtrip(&mut a);
        assert_eq!(files[0], small);
        assert_eq!(index.files[0].size, Some(1000));
    }

    #[test]
    fn large_stream_uses_chunk_framing() {
        // Longer than the pre-read limit, so the encoder must emit
        // msgpack-framed chunks with a zero terminator.
        let big: Vec<u8> = (0..STREAM_CHUNK + 12345).map(|i| (i % 251) as u8).collect();
        let mut a = Archive::new();
        a.file_index(vec![ArchiveInput::Stream(Box::new(Cursor::new(big.clone())))])
            .unwrap();
        assert_eq!(a.index.files[0].size, None);
        let (index, files, _) = roundtrip(&mut a);
        assert_eq!(files[0].len(), big.len());
        assert_eq!(files[0], big);
        // The decoder learns the total size from the chunk stream.
        assert_eq!(index.files[0].size, Some(big.len() as u64));
    }

    #[test]
    fn empty_archive_is_one_byte_map() {
        let mut a = Archive::new();
        let flat = encode_to_vec(&mut a);
        assert_eq!(flat, b"\x80");
        let (index, files, _) = decode_all(std::iter::once(Ok(flat))).unwrap();
        assert!(index.files.is_empty());
        assert!(files.is_empty());
    }

    #[test]
    fn data_split_across_blocks() {
        let mut a = Archive::new();
        let content = vec![0xABu8; 10_000];
        a.file_index(vec![ArchiveInput::Bytes(content.clone())]).unwrap();
        let flat = encode_to_vec(&mut a);
        // Feed in small pieces to exercise the grow-on-eof value parser.
        let pieces: Vec<Result<Vec<u8>>> =
            flat.chunks(333).map(|c| Ok(c.to_vec())).collect();
        let (_, files, _) = decode_all(pieces.into_iter()).unwrap();
        assert_eq!(files[0], content);
    }

    #[test]
    fn forbidden_filenames_rejected() {
        for name in ["/abs", "a:b", "back\\slash", ""] {
            let rec = Value::Array(vec![
                Value::from(1u64),
                Value::from(name),
                Value::Map(vec![]),
            ]);
            let index = Value::Map(vec![(Value::from("f"), Value::Array(vec![rec]))]);
            let mut bytes = Vec::new();
            rmpv::encode::write_value(&mut bytes, &index).unwrap();
            bytes.push(0x01); // would-be content
            let res = decode_all(std::iter::once(Ok(bytes)));
            assert!(res.is_err(), "name {name:?} accepted");
        }
    }

    #[test]
    fn truncated_archive_errors() {
        let mut a = Archive::new();
        a.file_index(vec![ArchiveInput::Bytes(vec![1u8; 100])]).unwrap();
        let mut flat = encode_to_vec(&mut a);
        flat.truncate(50);
        assert!(decode_all(std::iter::once(Ok(flat))).is_err());
    }

    #[test]
    fn signers_and_ratchet_fields_roundtrip() {
        let mut a = Archive::new();
        a.file_index(vec![ArchiveInput::Bytes(b"msg".to_vec())]).unwrap();
        a.index.signers.push([7u8; 32]);
        a.index.ratchet = Some(3);
        let (index, files, _) = roundtrip(&mut a);
        assert_eq!(index.signers, vec![[7u8; 32]]);
        assert_eq!(index.ratchet, Some(3));
        assert_eq!(files[0], b"msg");
    }
}

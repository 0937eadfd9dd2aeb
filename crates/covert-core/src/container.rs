//! Whole-file drivers tying the header, block stream and archive
//! together for in-memory callers (the ID store, tests, embedders).

use std::io::Read;

use crate::archive::{decode_all, Archive, Index};
use crate::blockstream::{DecryptStream, EncryptStream, SigResult};
use crate::error::Result;
use crate::header::{Auth, AuthMethod};
use crate::key::Key;

/// Everything learned from decrypting one file.
pub struct DecryptedArchive {
    pub index: Index,
    /// File contents, in index order.
    pub files: Vec<Vec<u8>>,
    /// MsgPack nil padding values encountered.
    pub padding: u64,
    /// Final running block hash; equals the sender's.
    pub filehash: [u8; 64],
    /// One result per key listed in the index `s` field.
    pub signatures: Vec<SigResult>,
    /// Which auth method matched; None for wide-open files.
    pub method: Option<usize>,
}

/// Encrypt an archive in one pass, appending a signature block per
/// signer and recording the final block hash on the archive.
pub fn encrypt_archive(
    auth: &mut Auth<'_>,
    archive: &mut Archive,
    signers: &[Key],
) -> Result<Vec<u8>> {
    for s in signers {
        let edpk = s.edpk()?;
        if !archive.index.signers.contains(&edpk) {
            archive.index.signers.push(edpk);
        }
    }
    let mut out = Vec::new();
    let filehash;
    {
        let mut stream = EncryptStream::new(auth, |b| archive.encode(b), signers)?;
        for chunk in &mut stream {
            out.extend_from_slice(&chunk?);
        }
        filehash = stream.filehash();
    }
    archive.filehash = Some(filehash);
    Ok(out)
}

/// Decrypt a whole file into memory and verify its signatures.
pub fn decrypt_archive<R: Read>(
    methods: &mut [AuthMethod<'_>],
    reader: R,
) -> Result<DecryptedArchive> {
    let mut stream = DecryptStream::new(methods, reader)?;
    let method = stream.header.method;
    let (index, files, padding) = decode_all(&mut stream)?;
    let filehash = stream.filehash();
    let signer_keys: Vec<Key> = index
        .signers
        .iter()
        .map(|pk| Key::from_edpk(*pk))
        .collect::<Result<_>>()?;
    let signatures = stream.verify_signatures(&signer_keys);
    Ok(DecryptedArchive { index, files, padding, filehash, signatures, method })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveInput;
    use crate::error::CovertError;

    #[test]
    fn filehash_matches_across_sides() {
        let mut archive = Archive::new();
        archive
            .file_index(vec![ArchiveInput::Bytes(b"hash me".to_vec())])
            .unwrap();
        let ct = encrypt_archive(&mut Auth::WideOpen, &mut archive, &[]).unwrap();
        let result = decrypt_archive(&mut [], ct.as_slice()).unwrap();
        assert_eq!(archive.filehash, Some(result.filehash));
        assert_eq!(result.files[0], b"hash me");
    }

    #[test]
    fn signed_archive_lists_and_verifies() {
        let signer = Key::new();
        let mut archive = Archive::new();
        archive
            .file_index(vec![ArchiveInput::Bytes(b"payload".to_vec())])
            .unwrap();
        let ct =
            encrypt_archive(&mut Auth::WideOpen, &mut archive, &[signer.clone()]).unwrap();
        let result = decrypt_archive(&mut [], ct.as_slice()).unwrap();
        assert_eq!(result.index.signers, vec![signer.edpk.unwrap()]);
        assert_eq!(result.signatures.len(), 1);
        assert!(result.signatures[0].valid);
        assert_eq!(result.signatures[0].key.pk, signer.pk);
    }

    #[test]
    fn padding_survives_encryption() {
        let mut archive = Archive::new();
        archive
            .file_index(vec![ArchiveInput::Bytes(b"padded".to_vec())])
            .unwrap();
        archive.padding = 100;
        let ct = encrypt_archive(&mut Auth::WideOpen, &mut archive, &[]).unwrap();
        let result = decrypt_archive(&mut [], ct.as_slice()).unwrap();
        assert_eq!(result.padding, 100);
        assert_eq!(result.files[0], b"padded");
    }

    #[test]
    fn wrong_auth_is_an_auth_error() {
        let recipient = Key::new();
        let mut archive = Archive::new();
        archive
            .file_index(vec![ArchiveInput::Bytes(b"locked".to_vec())])
            .unwrap();
        let mut auth = Auth::Multi {
            pwhashes: vec![],
            recipients: vec![Key::from_pk(recipient.pk.unwrap())],
        };
        let ct = encrypt_archive(&mut auth, &mut archive, &[]).unwrap();
        let mut methods = [AuthMethod::Identity(Key::new())];
        assert!(matches!(
            decrypt_archive(&mut methods, ct.as_slice()),
            Err(CovertError::Auth(_))
        ));
    }
}

//! Streaming AES-256-GCM for cold-storage payloads.
//!
//! # Design
//! - Layout: `salt(16) || nonce(12) || ciphertext || tag(16)`.
//! - Per-file keys come from HKDF-SHA256 over the instance secret, salted per file.
//! - GCM is assembled from AES-CTR and GHASH so payloads stream in 64 KiB chunks
//!   instead of being buffered whole.
//! - Decryption writes to a sibling temp file and only renames it into place after
//!   the tag verifies; any failure removes the partial output.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ghash::GHash;
use ghash::universal_hash::UniversalHash;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::error::{FsOpsError, FsOpsResult};

/// Per-file salt length.
pub const SALT_LEN: usize = 16;
/// GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// GCM tag length.
pub const TAG_LEN: usize = 16;
/// Fixed bytes added by encryption.
pub const OVERHEAD: u64 = (SALT_LEN + NONCE_LEN + TAG_LEN) as u64;
/// Streaming chunk size.
pub const CHUNK_SIZE: usize = 64 * 1024;

const SECRET_LEN: usize = 32;
const KEY_INFO: &[u8] = b"tierkeep/cold-storage/aes-256-gcm/v1";

type Ctr = ctr::Ctr32BE<Aes256>;

/// Encrypts and decrypts single files with keys derived from an instance secret.
pub struct EncryptionService {
    secret: Vec<u8>,
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("EncryptionService")
            .finish_non_exhaustive()
    }
}

impl EncryptionService {
    /// Build a service from raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is shorter than 32 bytes.
    pub fn from_secret(secret: impl Into<Vec<u8>>) -> FsOpsResult<Self> {
        let secret = secret.into();
        if secret.len() < SECRET_LEN {
            return Err(FsOpsError::KeyMaterial {
                path: PathBuf::new(),
                reason: "secret_too_short",
            });
        }
        Ok(Self { secret })
    }

    /// Load the instance secret from `path`, creating it with fresh random bytes
    /// when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or created, or holds too few bytes.
    pub fn from_key_file(path: &Path) -> FsOpsResult<Self> {
        match fs::read(path) {
            Ok(secret) if secret.len() >= SECRET_LEN => Ok(Self { secret }),
            Ok(_) => Err(FsOpsError::KeyMaterial {
                path: path.to_path_buf(),
                reason: "secret_too_short",
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let secret = create_key_file(path)?;
                info!(path = %path.display(), "created encryption key file");
                Ok(Self { secret })
            }
            Err(err) => Err(FsOpsError::io("crypto.read_key", path, err)),
        }
    }

    /// Encrypt `source` into `destination`, returning the plaintext length.
    ///
    /// # Errors
    ///
    /// Returns an error on IO failure; `destination` is removed in that case.
    pub fn encrypt_file(
        &self,
        source: &Path,
        destination: &Path,
        progress: &mut dyn FnMut(u64),
    ) -> FsOpsResult<u64> {
        let input = File::open(source).map_err(|err| FsOpsError::io("crypto.open", source, err))?;
        let output = create_output(destination)?;
        let mut writer = BufWriter::new(output);
        let result = self
            .encrypt_stream(BufReader::new(input), &mut writer, progress)
            .and_then(|written| {
                writer
                    .flush()
                    .map_err(|err| FsOpsError::io("crypto.flush", destination, err))?;
                Ok(written)
            })
            .map_err(|err| relabel(err, source, destination));
        drop(writer);
        if result.is_err() {
            discard(destination);
        }
        result
    }

    /// Decrypt `source` into `destination`, returning the plaintext length.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::Malformed`] for undersized input and
    /// [`FsOpsError::Integrity`] when the tag does not verify; no output is left behind.
    pub fn decrypt_file(
        &self,
        source: &Path,
        destination: &Path,
        progress: &mut dyn FnMut(u64),
    ) -> FsOpsResult<u64> {
        let input = File::open(source).map_err(|err| FsOpsError::io("crypto.open", source, err))?;
        let output = create_output(destination)?;
        let mut writer = BufWriter::new(output);
        let result = self
            .decrypt_stream(input, &mut writer, progress)
            .and_then(|written| {
                writer
                    .flush()
                    .map_err(|err| FsOpsError::io("crypto.flush", destination, err))?;
                Ok(written)
            })
            .map_err(|err| relabel(err, source, destination));
        drop(writer);
        if let Err(err) = &result {
            warn!(error = %err, path = %source.display(), "decryption failed; discarding output");
            discard(destination);
        }
        result
    }

    /// Encrypt a stream. `progress` receives cumulative plaintext bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        writer: &mut W,
        progress: &mut dyn FnMut(u64),
    ) -> FsOpsResult<u64> {
        let mut salt = [0_u8; SALT_LEN];
        let mut nonce = [0_u8; NONCE_LEN];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let mut gcm = GcmState::new(&self.derive_key(&salt)?, &nonce);
        writer.write_all(&salt).map_err(stream_io("crypto.write_header"))?;
        writer.write_all(&nonce).map_err(stream_io("crypto.write_header"))?;

        let mut buffer = vec![0_u8; CHUNK_SIZE];
        let mut total = 0_u64;
        loop {
            let filled = read_full(&mut reader, &mut buffer).map_err(stream_io("crypto.read"))?;
            if filled == 0 {
                break;
            }
            let chunk = &mut buffer[..filled];
            gcm.encrypt(chunk);
            writer.write_all(chunk).map_err(stream_io("crypto.write"))?;
            total += filled as u64;
            progress(total);
            if filled < CHUNK_SIZE {
                break;
            }
        }

        writer
            .write_all(&gcm.tag())
            .map_err(stream_io("crypto.write_tag"))?;
        debug!(bytes = total, "payload encrypted");
        Ok(total)
    }

    /// Decrypt a seekable stream. `progress` receives cumulative plaintext bytes.
    ///
    /// Plaintext is written before the tag is checked; callers must discard the
    /// output when this returns an error.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::Malformed`] or [`FsOpsError::Integrity`] for bad input.
    pub fn decrypt_stream<R: Read + Seek, W: Write>(
        &self,
        mut reader: R,
        writer: &mut W,
        progress: &mut dyn FnMut(u64),
    ) -> FsOpsResult<u64> {
        let length = reader
            .seek(SeekFrom::End(0))
            .map_err(stream_io("crypto.seek"))?;
        if length < OVERHEAD {
            return Err(FsOpsError::Malformed {
                path: PathBuf::new(),
                length,
            });
        }

        let mut tag = [0_u8; TAG_LEN];
        reader
            .seek(SeekFrom::End(-(TAG_LEN as i64)))
            .map_err(stream_io("crypto.seek"))?;
        reader.read_exact(&mut tag).map_err(stream_io("crypto.read_tag"))?;

        let mut salt = [0_u8; SALT_LEN];
        let mut nonce = [0_u8; NONCE_LEN];
        reader.seek(SeekFrom::Start(0)).map_err(stream_io("crypto.seek"))?;
        reader.read_exact(&mut salt).map_err(stream_io("crypto.read_header"))?;
        reader.read_exact(&mut nonce).map_err(stream_io("crypto.read_header"))?;

        let mut gcm = GcmState::new(&self.derive_key(&salt)?, &nonce);
        let mut body = BufReader::new(reader).take(length - OVERHEAD);
        let mut buffer = vec![0_u8; CHUNK_SIZE];
        let mut total = 0_u64;
        loop {
            let filled = read_full(&mut body, &mut buffer).map_err(stream_io("crypto.read"))?;
            if filled == 0 {
                break;
            }
            let chunk = &mut buffer[..filled];
            gcm.decrypt(chunk);
            writer.write_all(chunk).map_err(stream_io("crypto.write"))?;
            total += filled as u64;
            progress(total);
        }

        if bool::from(gcm.tag().ct_eq(&tag)) {
            Ok(total)
        } else {
            Err(FsOpsError::Integrity {
                path: PathBuf::new(),
            })
        }
    }

    fn derive_key(&self, salt: &[u8; SALT_LEN]) -> FsOpsResult<[u8; 32]> {
        let mut key = [0_u8; 32];
        Hkdf::<Sha256>::new(Some(salt), &self.secret)
            .expand(KEY_INFO, &mut key)
            .map_err(|_| FsOpsError::KeyMaterial {
                path: PathBuf::new(),
                reason: "hkdf_expand",
            })?;
        Ok(key)
    }
}

/// Incremental GCM: CTR keystream starting at counter 2, GHASH over ciphertext only.
struct GcmState {
    ctr: Ctr,
    ghash: GHash,
    tag_mask: [u8; 16],
    ciphertext_len: u64,
}

impl GcmState {
    fn new(key: &[u8; 32], nonce: &[u8; NONCE_LEN]) -> Self {
        let cipher = Aes256::new(GenericArray::from_slice(key));

        let mut hash_key = GenericArray::default();
        cipher.encrypt_block(&mut hash_key);

        let mut j0 = [0_u8; 16];
        j0[..NONCE_LEN].copy_from_slice(nonce);
        j0[15] = 1;
        let mut tag_mask = GenericArray::clone_from_slice(&j0);
        cipher.encrypt_block(&mut tag_mask);

        let mut counter = j0;
        counter[15] = 2;

        Self {
            ctr: Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&counter)),
            ghash: <GHash as KeyInit>::new(&hash_key),
            tag_mask: tag_mask.into(),
            ciphertext_len: 0,
        }
    }

    // Chunks must be multiples of 16 bytes except the last one.
    fn encrypt(&mut self, chunk: &mut [u8]) {
        self.ctr.apply_keystream(chunk);
        self.absorb(chunk);
    }

    fn decrypt(&mut self, chunk: &mut [u8]) {
        self.absorb(chunk);
        self.ctr.apply_keystream(chunk);
    }

    fn absorb(&mut self, ciphertext: &[u8]) {
        self.ghash.update_padded(ciphertext);
        self.ciphertext_len += ciphertext.len() as u64;
    }

    fn tag(&self) -> [u8; TAG_LEN] {
        let mut lengths = [0_u8; 16];
        lengths[8..].copy_from_slice(&(self.ciphertext_len * 8).to_be_bytes());
        let mut ghash = self.ghash.clone();
        ghash.update_padded(&lengths);
        let mut tag: [u8; TAG_LEN] = ghash.finalize().into();
        for (byte, mask) in tag.iter_mut().zip(self.tag_mask) {
            *byte ^= mask;
        }
        tag
    }
}

fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn stream_io(operation: &'static str) -> impl Fn(io::Error) -> FsOpsError {
    move |err| FsOpsError::io(operation, PathBuf::new(), err)
}

// Stream helpers have no path; attach the file paths once the caller knows them.
fn relabel(err: FsOpsError, source: &Path, destination: &Path) -> FsOpsError {
    match err {
        FsOpsError::Malformed { length, .. } => FsOpsError::Malformed {
            path: source.to_path_buf(),
            length,
        },
        FsOpsError::Integrity { .. } => FsOpsError::Integrity {
            path: source.to_path_buf(),
        },
        FsOpsError::Io {
            operation, source: io_err, ..
        } => {
            let path = if operation.starts_with("crypto.write") || operation == "crypto.flush" {
                destination
            } else {
                source
            };
            FsOpsError::io(operation, path, io_err)
        }
        other => other,
    }
}

fn create_output(path: &Path) -> FsOpsResult<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| FsOpsError::io("crypto.create_output", path, err))
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(error = %err, path = %path.display(), "failed to remove partial output");
        }
    }
}

fn create_key_file(path: &Path) -> FsOpsResult<Vec<u8>> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|err| FsOpsError::io("crypto.create_key_dir", parent, err))?;
    }
    let mut secret = vec![0_u8; SECRET_LEN];
    rand::rng().fill_bytes(&mut secret);

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|err| FsOpsError::io("crypto.create_key", path, err))?;
    file.write_all(&secret)
        .and_then(|()| file.sync_all())
        .map_err(|err| FsOpsError::io("crypto.write_key", path, err))?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    type TestResult<T> = anyhow::Result<T>;

    fn service() -> TestResult<EncryptionService> {
        Ok(EncryptionService::from_secret(vec![7_u8; 32])?)
    }

    fn round_trip(service: &EncryptionService, data: &[u8]) -> TestResult<Vec<u8>> {
        let mut sealed = Vec::new();
        service.encrypt_stream(data, &mut sealed, &mut |_| {})?;
        assert_eq!(sealed.len() as u64, data.len() as u64 + OVERHEAD);
        let mut opened = Vec::new();
        service.decrypt_stream(Cursor::new(sealed), &mut opened, &mut |_| {})?;
        Ok(opened)
    }

    #[test]
    fn round_trips_across_chunk_boundaries() -> TestResult<()> {
        let service = service()?;
        for len in [0, 1, 15, 16, 17, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE * 2 + 5] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(round_trip(&service, &data)?, data, "length {len}");
        }
        Ok(())
    }

    #[test]
    fn flipped_bytes_fail_verification() -> TestResult<()> {
        let service = service()?;
        let mut sealed = Vec::new();
        service.encrypt_stream(&b"cold payload"[..], &mut sealed, &mut |_| {})?;
        for index in [SALT_LEN + NONCE_LEN, sealed.len() - 1] {
            let mut tampered = sealed.clone();
            tampered[index] ^= 0x01;
            let result = service.decrypt_stream(Cursor::new(tampered), &mut Vec::new(), &mut |_| {});
            assert!(matches!(result, Err(FsOpsError::Integrity { .. })));
        }
        Ok(())
    }

    #[test]
    fn undersized_input_is_malformed() -> TestResult<()> {
        let service = service()?;
        let result = service.decrypt_stream(Cursor::new(vec![0_u8; 43]), &mut Vec::new(), &mut |_| {});
        assert!(matches!(result, Err(FsOpsError::Malformed { length: 43, .. })));
        Ok(())
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(matches!(
            EncryptionService::from_secret(vec![1_u8; 8]),
            Err(FsOpsError::KeyMaterial {
                reason: "secret_too_short",
                ..
            })
        ));
    }

    #[test]
    fn key_file_is_created_once() -> TestResult<()> {
        let temp = tempfile::TempDir::new()?;
        let key_path = temp.path().join("keys/instance.key");
        let first = EncryptionService::from_key_file(&key_path)?;
        let second = EncryptionService::from_key_file(&key_path)?;
        assert_eq!(first.secret, second.secret);
        assert_eq!(fs::metadata(&key_path)?.len(), 32);
        Ok(())
    }
}

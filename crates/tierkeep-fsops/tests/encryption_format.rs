use std::fs;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Result, anyhow};
use hkdf::Hkdf;
use sha2::Sha256;
use tierkeep_fsops::crypto::{NONCE_LEN, OVERHEAD, SALT_LEN};
use tierkeep_fsops::{EncryptionService, FsOpsError};
use tierkeep_test_support::fixtures::TierFixture;

const SECRET: [u8; 32] = [0x5a; 32];

fn reference_decrypt(sealed: &[u8]) -> Result<Vec<u8>> {
    let (salt, rest) = sealed.split_at(SALT_LEN);
    let (nonce, body) = rest.split_at(NONCE_LEN);
    let mut key = [0_u8; 32];
    Hkdf::<Sha256>::new(Some(salt), &SECRET)
        .expand(b"tierkeep/cold-storage/aes-256-gcm/v1", &mut key)
        .map_err(|err| anyhow!("hkdf: {err}"))?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|err| anyhow!("key: {err}"))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|err| anyhow!("decrypt: {err}"))
}

#[test]
fn streamed_files_decrypt_with_one_shot_aes_gcm() -> Result<()> {
    let fixture = TierFixture::new(1)?;
    let service = EncryptionService::from_secret(SECRET.to_vec())?;
    let plaintext: Vec<u8> = (0..200_000_u32).map(|i| (i * 31 % 256) as u8).collect();
    let source = fixture.write_hot("large.bin", &plaintext)?;
    let sealed_path = fixture.cold(0).join("large.bin");

    let mut last = 0;
    let written = service.encrypt_file(&source, &sealed_path, &mut |bytes| last = bytes)?;
    assert_eq!(written, plaintext.len() as u64);
    assert_eq!(last, written);

    let sealed = fs::read(&sealed_path)?;
    assert_eq!(sealed.len() as u64, written + OVERHEAD);
    assert_eq!(reference_decrypt(&sealed)?, plaintext);
    Ok(())
}

#[test]
fn tampered_file_leaves_no_output() -> Result<()> {
    let fixture = TierFixture::new(1)?;
    let service = EncryptionService::from_secret(SECRET.to_vec())?;
    let source = fixture.write_hot("note.txt", b"archived note")?;
    let sealed_path = fixture.cold(0).join("note.txt");
    service.encrypt_file(&source, &sealed_path, &mut |_| {})?;

    let mut sealed = fs::read(&sealed_path)?;
    let middle = SALT_LEN + NONCE_LEN + 3;
    sealed[middle] ^= 0x80;
    fs::write(&sealed_path, &sealed)?;

    let restored = fixture.hot().join("restored.txt");
    let err = service.decrypt_file(&sealed_path, &restored, &mut |_| {});
    assert!(matches!(err, Err(FsOpsError::Integrity { .. })));
    assert!(!restored.exists());
    Ok(())
}

#[test]
fn empty_file_round_trips_and_short_file_is_malformed() -> Result<()> {
    let fixture = TierFixture::new(1)?;
    let service = EncryptionService::from_secret(SECRET.to_vec())?;
    let source = fixture.write_hot("empty.txt", b"")?;
    let sealed_path = fixture.cold(0).join("empty.txt");
    service.encrypt_file(&source, &sealed_path, &mut |_| {})?;
    assert_eq!(fs::metadata(&sealed_path)?.len(), OVERHEAD);
    assert!(reference_decrypt(&fs::read(&sealed_path)?)?.is_empty());

    let short = fixture.cold(0).join("short.bin");
    fs::write(&short, [0_u8; 10])?;
    let restored = fixture.hot().join("short.bin");
    let err = service.decrypt_file(&short, &restored, &mut |_| {});
    assert!(matches!(err, Err(FsOpsError::Malformed { length: 10, .. })));
    assert!(!restored.exists());
    Ok(())
}

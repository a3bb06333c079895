use core::fmt;
use std::sync::OnceLock;

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Length of every SHA1-sized key (SIK, K1, K2, user key, K_g).
pub(crate) const SHA1_KEY_LEN: usize = 20;
/// Length of the HMAC-SHA1-96 integrity code.
pub(crate) const INTEGRITY_CODE_LEN: usize = 12;
/// AES block (and IV) length.
pub(crate) const AES_BLOCK_LEN: usize = 16;

type HmacSha1 = Hmac<Sha1>;

/// A minimal secret container that zeroizes its contents on drop.
#[derive(Clone)]
pub(crate) struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    /// The secret as a fixed 20-byte key: truncated, then zero-padded.
    pub(crate) fn to_key_sha1(&self) -> [u8; SHA1_KEY_LEN] {
        let mut out = [0u8; SHA1_KEY_LEN];
        let n = self.0.len().min(SHA1_KEY_LEN);
        out[..n].copy_from_slice(&self.0[..n]);
        out
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<secret>")
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Keys derived for one RMCP+ session.
///
/// Storage is fixed-size and zeroed until the RAKP exchange completes; every
/// key is wiped when the session context is dropped.
pub(crate) struct SessionKeys {
    sik: [u8; SHA1_KEY_LEN],
    k1: [u8; SHA1_KEY_LEN],
    aes_key: [u8; AES_BLOCK_LEN],
    negotiated: bool,
}

impl SessionKeys {
    pub(crate) fn empty() -> Self {
        Self {
            sik: [0u8; SHA1_KEY_LEN],
            k1: [0u8; SHA1_KEY_LEN],
            aes_key: [0u8; AES_BLOCK_LEN],
            negotiated: false,
        }
    }

    /// Derive K1 (integrity) and the AES key (first 16 bytes of K2) from SIK.
    pub(crate) fn from_sik(sik: [u8; SHA1_KEY_LEN]) -> Result<Self> {
        let mut k1 = hmac_sha1(&sik, &[0x01u8; SHA1_KEY_LEN])?;
        let mut k2 = hmac_sha1(&sik, &[0x02u8; SHA1_KEY_LEN])?;
        let mut aes_key = [0u8; AES_BLOCK_LEN];
        aes_key.copy_from_slice(&k2[..AES_BLOCK_LEN]);
        k2.zeroize();

        let keys = Self {
            sik,
            k1,
            aes_key,
            negotiated: true,
        };
        k1.zeroize();
        Ok(keys)
    }

    pub(crate) fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    pub(crate) fn sik(&self) -> &[u8; SHA1_KEY_LEN] {
        &self.sik
    }

    /// HMAC-SHA1-96 over `data` keyed with K1.
    pub(crate) fn integrity_code(&self, data: &[u8]) -> Result<[u8; INTEGRITY_CODE_LEN]> {
        if !self.negotiated {
            return Err(Error::Crypto("session keys not negotiated"));
        }
        hmac_sha1_96(&self.k1, data)
    }

    pub(crate) fn encrypt(&self, iv: &[u8; AES_BLOCK_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        if !self.negotiated {
            return Err(Error::Crypto("session keys not negotiated"));
        }
        aes128_cbc_encrypt(&self.aes_key, iv, plaintext)
    }

    pub(crate) fn decrypt(&self, iv: &[u8; AES_BLOCK_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if !self.negotiated {
            return Err(Error::Crypto("session keys not negotiated"));
        }
        aes128_cbc_decrypt(&self.aes_key, iv, ciphertext)
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.sik.zeroize();
        self.k1.zeroize();
        self.aes_key.zeroize();
    }
}

pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; SHA1_KEY_LEN]> {
    let mut mac =
        <HmacSha1 as Mac>::new_from_slice(key).map_err(|_| Error::Crypto("invalid HMAC key"))?;
    mac.update(data);
    let mut out = [0u8; SHA1_KEY_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

pub(crate) fn hmac_sha1_96(key: &[u8], data: &[u8]) -> Result<[u8; INTEGRITY_CODE_LEN]> {
    let full = hmac_sha1(key, data)?;
    let mut out = [0u8; INTEGRITY_CODE_LEN];
    out.copy_from_slice(&full[..INTEGRITY_CODE_LEN]);
    Ok(out)
}

/// Process-wide crypto initialization: a one-time known-answer self-test.
///
/// Run by `Engine::setup`; the result is cached for the life of the process.
pub(crate) fn init() -> Result<()> {
    static SELF_TEST: OnceLock<bool> = OnceLock::new();

    let passed = *SELF_TEST.get_or_init(|| {
        const EXPECTED: [u8; SHA1_KEY_LEN] = [
            0xDE, 0x7C, 0x9B, 0x85, 0xB8, 0xB7, 0x8A, 0xA6, 0xBC, 0x8A, 0x7A, 0x36, 0xF7, 0x0A,
            0x90, 0x70, 0x1C, 0x9D, 0xB4, 0xD9,
        ];
        let mac = hmac_sha1(b"key", b"The quick brown fox jumps over the lazy dog");
        let ok = matches!(mac, Ok(m) if m == EXPECTED);
        if !ok {
            tracing::warn!("HMAC-SHA1 self-test failed");
        }
        ok
    });

    if passed {
        Ok(())
    } else {
        Err(Error::Crypto("self-test failed"))
    }
}

fn aes128_cbc_encrypt(
    key: &[u8; AES_BLOCK_LEN],
    iv: &[u8; AES_BLOCK_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if !plaintext.len().is_multiple_of(AES_BLOCK_LEN) {
        return Err(Error::Crypto(
            "AES-CBC plaintext length must be a multiple of 16",
        ));
    }
    let cipher = Aes128::new_from_slice(key).map_err(|_| Error::Crypto("invalid AES-128 key"))?;

    let mut out = Vec::with_capacity(plaintext.len());
    let mut chain = *iv;
    for chunk in plaintext.chunks(AES_BLOCK_LEN) {
        for (c, p) in chain.iter_mut().zip(chunk) {
            *c ^= p;
        }
        let mut block = aes::Block::clone_from_slice(&chain);
        cipher.encrypt_block(&mut block);
        chain.copy_from_slice(&block);
        out.extend_from_slice(&chain);
    }
    Ok(out)
}

fn aes128_cbc_decrypt(
    key: &[u8; AES_BLOCK_LEN],
    iv: &[u8; AES_BLOCK_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if !ciphertext.len().is_multiple_of(AES_BLOCK_LEN) {
        return Err(Error::Crypto(
            "AES-CBC ciphertext length must be a multiple of 16",
        ));
    }
    let cipher = Aes128::new_from_slice(key).map_err(|_| Error::Crypto("invalid AES-128 key"))?;

    let mut out = Vec::with_capacity(ciphertext.len());
    let mut chain: &[u8] = iv;
    for chunk in ciphertext.chunks(AES_BLOCK_LEN) {
        let mut block = aes::Block::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        out.extend(block.iter().zip(chain).map(|(b, c)| b ^ c));
        chain = chunk;
    }
    Ok(out)
}

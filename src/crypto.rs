//! # Envelope Encryption
//!
//! Every synced artifact except the manifest goes through this module. A
//! payload is encrypted once under a fresh file key, and that file key is
//! wrapped separately for each recipient, so any single recipient identity
//! can open the file on its own.
//!
//! ## Format
//!
//! Output is an ASCII-armored age file:
//!
//! ```text
//! -----BEGIN AGE ENCRYPTED FILE-----
//! YWdlLWVuY3J5cHRpb24ub3JnL3YxCi0+IFgyNTUxOSBy...
//! -----END AGE ENCRYPTED FILE-----
//! ```
//!
//! The marker lines let tooling recognise an encrypted artifact without
//! holding any key (see [`is_encrypted`]).
//!
//! ## Recipients
//!
//! - **X25519**: `age1...` keys, produced by [`crate::identity::LocalIdentity`]
//! - **SSH**: `ssh-ed25519 ...` / `ssh-rsa ...` public keys, so team members can
//!   be added with the key they already publish
//!
//! ## Security Properties
//!
//! - **Fresh output**: a new file key and ephemeral share per call, so equal
//!   plaintexts never produce equal ciphertexts
//! - **Authentication**: payload is AEAD protected; tampering fails decryption
//! - **No revocation in place**: dropping a recipient requires re-encrypting
//!   the payload, see [`crate::state::StateStore::reencrypt_all`]

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use age::armor::{ArmoredReader, ArmoredWriter, Format};
use age::{DecryptError, Decryptor, EncryptError, Encryptor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, SyncError, ValidationError};
use crate::identity::LocalIdentity;

pub const ARMOR_BEGIN: &str = "-----BEGIN AGE ENCRYPTED FILE-----";
pub const ARMOR_END: &str = "-----END AGE ENCRYPTED FILE-----";

/// A validated, shareable public key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecipientKey(String);

impl RecipientKey {
    pub fn parse(input: &str) -> Result<Self> {
        let key = normalize(input);
        if key.is_empty() {
            return Err(invalid_key(input, "key is empty"));
        }

        if key.starts_with("age1") {
            age::x25519::Recipient::from_str(&key).map_err(|e| invalid_key(&key, e))?;
        } else if key.starts_with("ssh-") {
            age::ssh::Recipient::from_str(&key)
                .map_err(|e| invalid_key(&key, &format!("{e:?}")))?;
        } else {
            return Err(invalid_key(
                &key,
                "expected an age public key (age1...) or an SSH public key (ssh-ed25519 ...)",
            ));
        }

        Ok(Self(key))
    }

    /// Wrap a key that came from a parsed age recipient.
    pub(crate) fn from_validated(key: String) -> Self {
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn to_age_recipient(&self) -> Result<Box<dyn age::Recipient>> {
        if self.0.starts_with("ssh-") {
            let recipient = age::ssh::Recipient::from_str(&self.0)
                .map_err(|e| invalid_key(&self.0, &format!("{e:?}")))?;
            Ok(Box::new(recipient))
        } else {
            let recipient =
                age::x25519::Recipient::from_str(&self.0).map_err(|e| invalid_key(&self.0, e))?;
            Ok(Box::new(recipient))
        }
    }
}

impl FromStr for RecipientKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RecipientKey {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RecipientKey> for String {
    fn from(key: RecipientKey) -> Self {
        key.0
    }
}

impl fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// SSH keys keep their type and base64 body; the trailing comment is dropped so
// the same key always compares equal.
fn normalize(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("ssh-") {
        trimmed
            .split_whitespace()
            .take(2)
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        trimmed.to_string()
    }
}

fn invalid_key(key: &str, reason: &str) -> SyncError {
    ValidationError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Encrypt `plaintext` so that every key in `recipients` can decrypt it.
pub fn encrypt_for(recipients: &[RecipientKey], plaintext: &[u8]) -> Result<Vec<u8>> {
    if recipients.is_empty() {
        return Err(ValidationError::InvalidInput(
            "at least one recipient is required to encrypt".into(),
        )
        .into());
    }

    let recipients = recipients
        .iter()
        .map(RecipientKey::to_age_recipient)
        .collect::<Result<Vec<_>>>()?;
    let encryptor =
        Encryptor::with_recipients(recipients.iter().map(|r| r.as_ref() as &dyn age::Recipient))
            .map_err(map_encrypt_err)?;

    let mut ciphertext = Vec::new();
    let armor = ArmoredWriter::wrap_output(&mut ciphertext, Format::AsciiArmor)?;
    let mut writer = encryptor.wrap_output(armor)?;
    writer.write_all(plaintext)?;
    writer.finish()?.finish()?;

    Ok(ciphertext)
}

/// Decrypt an armored envelope with the local identity.
pub fn decrypt(identity: &LocalIdentity, ciphertext: &[u8]) -> Result<Vec<u8>> {
    decrypt_with_any(&[identity], ciphertext, "ciphertext")
}

/// Decrypt with whichever of `identities` is a recipient. `target` names the
/// artifact in errors.
pub(crate) fn decrypt_with_any(
    identities: &[&LocalIdentity],
    ciphertext: &[u8],
    target: &str,
) -> Result<Vec<u8>> {
    let decryptor = Decryptor::new(ArmoredReader::new(ciphertext))
        .map_err(|e| map_decrypt_err(target, e))?;
    let mut reader = decryptor
        .decrypt(identities.iter().map(|identity| identity.as_age_identity()))
        .map_err(|e| map_decrypt_err(target, e))?;

    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| SyncError::Decryption {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

    Ok(plaintext)
}

/// Serialize `value` as JSON and encrypt it for `recipients`.
pub fn encrypt_json<T: Serialize>(recipients: &[RecipientKey], value: &T) -> Result<Vec<u8>> {
    let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
    encrypt_for(recipients, &plaintext)
}

/// Decrypt and parse a JSON payload produced by [`encrypt_json`].
pub fn decrypt_json<T: DeserializeOwned>(identity: &LocalIdentity, ciphertext: &[u8]) -> Result<T> {
    let plaintext = Zeroizing::new(decrypt(identity, ciphertext)?);
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Check for the armor marker lines without decrypting.
pub fn is_encrypted(data: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(data) else {
        return false;
    };
    let text = text.trim();
    text.starts_with(ARMOR_BEGIN) && text.ends_with(ARMOR_END)
}

fn map_encrypt_err(err: EncryptError) -> SyncError {
    SyncError::Encryption(format!("age encryption failed: {err}"))
}

fn map_decrypt_err(target: &str, err: DecryptError) -> SyncError {
    let reason = match err {
        DecryptError::NoMatchingKeys => {
            "no matching identity; this machine's key is not a recipient".to_string()
        }
        other => other.to_string(),
    };
    SyncError::Decryption {
        target: target.to_string(),
        reason,
    }
}

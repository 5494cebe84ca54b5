//! Message sessions and the symmetric key exchange.
//!
//! ```text
//!   create session ──► { sessionId, encryptionKey { encrypted, value } }
//!                                         │
//!                      base64 ─► RSA-OAEP (sha1 | sha256) ─► AES key
//!                                         │
//!   message { iv, body } ──► AES-CBC ─► strip padding ─► skip BOM ─► JSON
//! ```

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rsa::{Oaep, RsaPrivateKey};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, SessionError};
use crate::protocol::agent::TaskAgent;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskAgentSessionKey {
    pub encrypted: bool,
    pub value: String,
}

/// A message session as created by the service and persisted in
/// `sessions.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskAgentSession {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    pub encryption_key: TaskAgentSessionKey,
    pub owner_name: String,
    pub agent: TaskAgent,
    pub use_fips_encryption: bool,
}

impl TaskAgentSession {
    /// Session descriptor sent when asking the service for a new session.
    pub fn request(agent: TaskAgent) -> Self {
        Self {
            owner_name: "RUNNER".to_string(),
            agent,
            use_fips_encryption: false,
            ..Default::default()
        }
    }

    /// Whether this persisted session belongs to `agent`.
    pub fn belongs_to(&self, agent: &TaskAgent) -> bool {
        self.agent.name == agent.name
            && self.agent.authorization.public_key == agent.authorization.public_key
    }
}

/// A queued message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskAgentMessage {
    pub message_id: i64,
    pub message_type: String,
    #[serde(rename = "iv", alias = "IV")]
    pub iv: String,
    pub body: String,
}

impl TaskAgentMessage {
    pub fn is_type(&self, kind: &str) -> bool {
        self.message_type.eq_ignore_ascii_case(kind)
    }
}

pub mod message_types {
    pub const JOB_REQUEST: &str = "PipelineAgentJobRequest";
    pub const JOB_CANCELLATION: &str = "JobCancellation";
}

/// AES key derived from a session. Never serialized.
#[derive(Clone)]
pub struct SessionCipher {
    key: Vec<u8>,
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("key_len", &self.key.len())
            .finish()
    }
}

impl SessionCipher {
    /// Derive the cipher from a session's key material. Used both for
    /// freshly created sessions and for sessions restored from disk.
    pub fn derive(session: &TaskAgentSession, key: &RsaPrivateKey) -> Result<Self, SessionError> {
        let material = STANDARD.decode(session.encryption_key.value.trim())?;
        let raw = if session.encryption_key.encrypted {
            if session.use_fips_encryption {
                key.decrypt(Oaep::new::<sha2::Sha256>(), &material)?
            } else {
                key.decrypt(Oaep::new::<sha1::Sha1>(), &material)?
            }
        } else {
            material
        };
        Self::from_key(raw)
    }

    pub fn from_key(key: Vec<u8>) -> Result<Self, SessionError> {
        match key.len() {
            16 | 24 | 32 => Ok(Self { key }),
            other => Err(SessionError::KeyLength(other)),
        }
    }

    /// Decrypt a message body. Returns the JSON payload with padding and a
    /// leading BOM removed.
    pub fn decrypt_message(&self, message: &TaskAgentMessage) -> Result<Vec<u8>, DispatchError> {
        let encoding = |reason: String| DispatchError::Encoding {
            message_id: message.message_id,
            reason,
        };
        let iv = STANDARD
            .decode(message.iv.trim())
            .map_err(|e| encoding(format!("iv: {}", e)))?;
        let body = STANDARD
            .decode(message.body.trim())
            .map_err(|e| encoding(format!("body: {}", e)))?;

        let plain = self.decrypt(&iv, &body).map_err(|reason| DispatchError::Decrypt {
            message_id: message.message_id,
            reason,
        })?;

        let payload = strip_padding(&plain, BLOCK_SIZE);
        Ok(skip_bom(payload).to_vec())
    }

    fn decrypt(&self, iv: &[u8], body: &[u8]) -> Result<Vec<u8>, String> {
        if body.is_empty() {
            return Err("empty body".to_string());
        }
        macro_rules! run {
            ($aes:ty) => {
                cbc::Decryptor::<$aes>::new_from_slices(&self.key, iv)
                    .map_err(|e| e.to_string())?
                    .decrypt_padded_vec_mut::<NoPadding>(body)
                    .map_err(|e| e.to_string())
            };
        }
        match self.key.len() {
            16 => run!(aes::Aes128),
            24 => run!(aes::Aes192),
            _ => run!(aes::Aes256),
        }
    }

    #[cfg(test)]
    pub(crate) fn encrypt(&self, iv: &[u8], plain: &[u8]) -> Vec<u8> {
        use aes::cipher::BlockEncryptMut;
        use aes::cipher::block_padding::Pkcs7;

        macro_rules! run {
            ($aes:ty) => {
                cbc::Encryptor::<$aes>::new_from_slices(&self.key, iv)
                    .unwrap()
                    .encrypt_padded_vec_mut::<Pkcs7>(plain)
            };
        }
        match self.key.len() {
            16 => run!(aes::Aes128),
            24 => run!(aes::Aes192),
            _ => run!(aes::Aes256),
        }
    }
}

/// Remove trailing pad bytes. They are only treated as padding when the last
/// byte is in `1..=block_size` and that many trailing bytes all carry the
/// same value; otherwise the buffer is returned whole. Some senders omit
/// padding, so a genuine payload ending in repeated small bytes is
/// indistinguishable from a padded one.
pub fn strip_padding(buf: &[u8], block_size: usize) -> &[u8] {
    let Some(&last) = buf.last() else {
        return buf;
    };
    let pad = last as usize;
    if pad == 0 || pad > block_size || pad > buf.len() {
        return buf;
    }
    if buf[buf.len() - pad..].iter().all(|&b| b == last) {
        &buf[..buf.len() - pad]
    } else {
        buf
    }
}

fn skip_bom(buf: &[u8]) -> &[u8] {
    buf.strip_prefix(&UTF8_BOM).unwrap_or(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::agent::tests::test_key;
    use pretty_assertions::assert_eq;
    use rsa::RsaPublicKey;

    fn message(cipher: &SessionCipher, iv: [u8; 16], plain: &[u8]) -> TaskAgentMessage {
        TaskAgentMessage {
            message_id: 7,
            message_type: message_types::JOB_REQUEST.to_string(),
            iv: STANDARD.encode(iv),
            body: STANDARD.encode(cipher.encrypt(&iv, plain)),
        }
    }

    #[test]
    fn test_round_trip_with_bom() {
        let cipher = SessionCipher::from_key(vec![3u8; 32]).unwrap();
        let payload = br#"{"jobId":"abc","requestId":42}"#;
        let mut plain = UTF8_BOM.to_vec();
        plain.extend_from_slice(payload);

        let decoded = cipher.decrypt_message(&message(&cipher, [9u8; 16], &plain)).unwrap();
        assert_eq!(decoded, payload.to_vec());
    }

    #[test]
    fn test_round_trip_full_block_padding() {
        // 16 byte payload gets a whole block of padding.
        let cipher = SessionCipher::from_key(vec![1u8; 16]).unwrap();
        let payload = b"0123456789abcdef";
        let decoded = cipher.decrypt_message(&message(&cipher, [0u8; 16], payload)).unwrap();
        assert_eq!(decoded, payload.to_vec());
    }

    #[test]
    fn test_padding_larger_than_block_is_kept() {
        let mut buf = b"payload".to_vec();
        buf.extend_from_slice(&[17u8; 17]);
        assert_eq!(strip_padding(&buf, 16), buf.as_slice());
    }

    #[test]
    fn test_padding_requires_equal_trailing_bytes() {
        assert_eq!(strip_padding(b"abc\x01\x03", 16), b"abc\x01\x03");
        assert_eq!(strip_padding(b"abc\x02\x02", 16), b"abc");
        assert_eq!(strip_padding(b"abc\x00", 16), b"abc\x00");
        assert_eq!(strip_padding(b"", 16), b"");
    }

    #[test]
    fn test_derive_unencrypted_key() {
        let session = TaskAgentSession {
            encryption_key: TaskAgentSessionKey {
                encrypted: false,
                value: STANDARD.encode([5u8; 16]),
            },
            ..Default::default()
        };
        let cipher = SessionCipher::derive(&session, &test_key()).unwrap();
        assert_eq!(cipher.key, vec![5u8; 16]);
    }

    #[test]
    fn test_derive_rsa_wrapped_key() {
        let key = test_key();
        let public = RsaPublicKey::from(&key);
        let mut rng = rand::thread_rng();
        let aes_key = [11u8; 32];

        for fips in [false, true] {
            let wrapped = if fips {
                public.encrypt(&mut rng, Oaep::new::<sha2::Sha256>(), &aes_key).unwrap()
            } else {
                public.encrypt(&mut rng, Oaep::new::<sha1::Sha1>(), &aes_key).unwrap()
            };
            let session = TaskAgentSession {
                session_id: "s".to_string(),
                encryption_key: TaskAgentSessionKey {
                    encrypted: true,
                    value: STANDARD.encode(wrapped),
                },
                use_fips_encryption: fips,
                ..Default::default()
            };
            let cipher = SessionCipher::derive(&session, &key).unwrap();
            assert_eq!(cipher.key, aes_key.to_vec());
        }
    }

    #[test]
    fn test_derive_rejects_garbage() {
        let session = TaskAgentSession {
            encryption_key: TaskAgentSessionKey {
                encrypted: true,
                value: "not base64!".to_string(),
            },
            ..Default::default()
        };
        assert!(matches!(
            SessionCipher::derive(&session, &test_key()),
            Err(SessionError::KeyEncoding(_))
        ));

        let session = TaskAgentSession {
            encryption_key: TaskAgentSessionKey {
                encrypted: true,
                value: STANDARD.encode([1u8; 128]),
            },
            ..Default::default()
        };
        assert!(matches!(
            SessionCipher::derive(&session, &test_key()),
            Err(SessionError::KeyDecryption(_))
        ));
    }

    #[test]
    fn test_message_type_is_case_insensitive() {
        let msg = TaskAgentMessage {
            message_type: "jobcancellation".to_string(),
            ..Default::default()
        };
        assert!(msg.is_type(message_types::JOB_CANCELLATION));
    }
}

use anyhow::{anyhow, bail, Context as _};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead as _, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit as _, Nonce};
use chrono::Utc;
use rand::RngCore as _;

use crate::config::AuthConfig;

const NONCE_LEN: usize = 12;

// The nonce (which is included in the token) is 12 bytes and the AEAD tag
// 16, so a valid token is at least 28 bytes, i.e. 40 characters of base64.
const MIN_TOKEN_LEN: usize = 40;

/// Seals and opens the tokens the authentication collaborator hands out.
///
/// Tokens are AEAD-encrypted so they are both confidential and signed by
/// the server key.  The `kind` of a token is bound into the associated data
/// which stops an attacker from replaying a token of one kind where a
/// different kind is expected.
pub struct TokenSealer {
    cipher: ChaCha20Poly1305,
}

impl TokenSealer {
    pub fn new(key: &[u8]) -> anyhow::Result<Self> {
        if key.len() != 32 {
            bail!("token key must be 32 bytes, got {}", key.len());
        }
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }

    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        let key = URL_SAFE
            .decode(&config.key)
            .context("auth key is not valid base64")?;
        Self::new(&key)
    }

    /// Encrypts plaintext into an URL-safe token.
    ///
    /// Associated data, when given, must itself be URL-safe; it rides along
    /// unencrypted (prefixed to the token as `assoc:…`) but is
    /// authenticated, so it cannot be swapped out either.
    pub fn seal(
        &self,
        kind: &[u8],
        plaintext: &[u8],
        assoc_data: Option<&str>,
    ) -> anyhow::Result<String> {
        let aad = bind_kind(kind, assoc_data);
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        let token = URL_SAFE.encode(sealed);
        Ok(match assoc_data {
            Some(assoc) => format!("{assoc}:{token}"),
            None => token,
        })
    }

    /// Verifies and decrypts a token.  Safe to call on attacker-controlled
    /// input: any tampering, truncation or kind mismatch is an error.
    pub fn unseal(
        &self,
        kind: &[u8],
        token: &str,
    ) -> anyhow::Result<(Option<String>, Vec<u8>)> {
        let (assoc_data, token) = match token.rfind(':') {
            Some(pos) => (Some(&token[..pos]), &token[pos + 1..]),
            None => (None, token),
        };
        if token.len() < MIN_TOKEN_LEN {
            bail!("invalid token (too short)");
        }
        let sealed = URL_SAFE.decode(token).context("invalid token encoding")?;
        if sealed.len() < NONCE_LEN {
            bail!("invalid token (too short)");
        }
        let aad = bind_kind(kind, assoc_data);
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| anyhow!("invalid token"))?;
        Ok((assoc_data.map(str::to_owned), plaintext))
    }
}

fn bind_kind(kind: &[u8], assoc_data: Option<&str>) -> Vec<u8> {
    match assoc_data {
        Some(assoc) => {
            let mut bound = assoc.as_bytes().to_vec();
            bound.push(b':');
            bound.extend_from_slice(kind);
            bound
        }
        None => kind.to_vec(),
    }
}

/// Mints a fresh single-use authentication cookie: the current timestamp
/// plus 64 random bits.  The pair goes to the auth_cookies table and comes
/// back as the OAuth state parameter.
pub fn generate_cookie() -> (i64, i64) {
    (Utc::now().timestamp(), rand::thread_rng().next_u64() as i64)
}

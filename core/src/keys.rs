//! 公開鍵エンコーディング (hex <-> npub) と共有鍵の生成

use nostr::nips::nip19::{FromBech32, ToBech32};
use nostr::{Keys, PublicKey, SecretKey};

use crate::error::{CoreError, Result};

const NPUB_PREFIX: &str = "npub";

/// デコード結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    /// "npub" または "hex"
    pub kind: String,
    /// hex公開鍵
    pub data: String,
}

/// npub形式か（プレフィックスのみ判定）
pub fn is_npub(key: &str) -> bool {
    key.starts_with(NPUB_PREFIX)
}

/// hex -> npub（npubはそのまま返す）
pub fn hex_to_npub(key: &str) -> Result<String> {
    if is_npub(key) {
        return Ok(key.to_string());
    }
    let public_key = parse_hex(key)?;
    public_key
        .to_bech32()
        .map_err(|e| CoreError::InvalidKeyEncoding(e.to_string()))
}

/// npub -> hex（hexはそのまま返す）
pub fn npub_to_hex(key: &str) -> Result<String> {
    decode(key).map(|decoded| decoded.data)
}

/// npubまたはhexをデコード
pub fn decode(key: &str) -> Result<DecodedKey> {
    if is_npub(key) {
        let public_key = PublicKey::from_bech32(key)
            .map_err(|e| CoreError::InvalidKeyEncoding(e.to_string()))?;
        return Ok(DecodedKey {
            kind: NPUB_PREFIX.to_string(),
            data: public_key.to_hex(),
        });
    }
    let public_key = parse_hex(key)?;
    Ok(DecodedKey {
        kind: "hex".to_string(),
        data: public_key.to_hex(),
    })
}

/// npub/hexのどちらでも受け付けてhexに正規化
pub fn normalize_public_key(key: &str) -> Result<String> {
    npub_to_hex(key.trim())
}

/// hex公開鍵をパース
pub fn parse_hex(key: &str) -> Result<PublicKey> {
    if key.len() != 64 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CoreError::InvalidKeyEncoding(format!(
            "expected 64 hex characters, got {} characters",
            key.len()
        )));
    }
    PublicKey::from_hex(key).map_err(|e| CoreError::InvalidKeyEncoding(e.to_string()))
}

/// ポリシー毎の使い捨て共有鍵
pub struct SharedKey {
    keys: Keys,
}

impl SharedKey {
    /// 新規生成
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| CoreError::KeyGenerationFailure(e.to_string()))?;
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| CoreError::KeyGenerationFailure(e.to_string()))?;
        Ok(Self {
            keys: Keys::new(secret_key),
        })
    }

    /// 配布された秘密鍵(hex)から復元
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let keys = Keys::parse(secret.trim()).map_err(|e| CoreError::InvalidKeyEncoding(e.to_string()))?;
        Ok(Self { keys })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn public_hex(&self) -> String {
        self.keys.public_key().to_hex()
    }

    pub fn secret_hex(&self) -> String {
        self.keys.secret_key().to_secret_hex()
    }

    /// 共有鍵自身に対してNIP-04暗号化
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        nostr::nips::nip04::encrypt(self.keys.secret_key(), &self.keys.public_key(), plaintext)
            .map_err(|e| CoreError::Other(format!("Shared key encryption failed: {}", e)))
    }

    /// 共有鍵で暗号化された内容を復号
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        nostr::nips::nip04::decrypt(self.keys.secret_key(), &self.keys.public_key(), ciphertext)
            .map_err(|e| CoreError::Other(format!("Shared key decryption failed: {}", e)))
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("public_key", &self.public_hex())
            .finish_non_exhaustive()
    }
}

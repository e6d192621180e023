use async_trait::async_trait;
use nostr::Keys;

use super::Signer;
use crate::error::{CoreError, Result};
use crate::event::{self, Event};

/// 内蔵Signer（ローカル秘密鍵）
pub struct InternalSigner {
    keys: Keys,
    available: bool,
}

impl InternalSigner {
    /// 新規生成
    pub fn generate() -> Self {
        Self::from_keys(Keys::generate())
    }

    pub fn from_keys(keys: Keys) -> Self {
        Self { keys, available: true }
    }

    /// 秘密鍵(hex/nsec)から復元
    pub fn from_secret_key(secret_key: &str) -> Result<Self> {
        let keys = Keys::parse(secret_key)
            .map_err(|e| CoreError::SignerError(format!("Invalid secret key: {}", e)))?;
        Ok(Self::from_keys(keys))
    }

    /// 利用不可として振る舞う（拡張機能未検出の再現用）
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_key().to_hex()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(CoreError::ProviderUnavailable)
        }
    }

    fn parse_pubkey(pubkey: &str) -> Result<nostr::PublicKey> {
        nostr::PublicKey::from_hex(pubkey)
            .map_err(|e| CoreError::SignerError(format!("Invalid pubkey: {}", e)))
    }
}

#[async_trait(?Send)]
impl Signer for InternalSigner {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn get_public_key(&self) -> Result<String> {
        self.ensure_available()?;
        Ok(self.public_key_hex())
    }

    async fn sign_event(&self, unsigned: &Event) -> Result<String> {
        self.ensure_available()?;
        event::sign_locally(&self.keys, unsigned)
    }

    async fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> Result<String> {
        self.ensure_available()?;
        let public_key = Self::parse_pubkey(pubkey)?;

        nostr::nips::nip04::encrypt(self.keys.secret_key(), &public_key, plaintext)
            .map_err(|e| CoreError::SignerError(format!("NIP-04 encryption failed: {}", e)))
    }

    async fn nip04_decrypt(&self, pubkey: &str, ciphertext: &str) -> Result<String> {
        self.ensure_available()?;
        let public_key = Self::parse_pubkey(pubkey)?;

        nostr::nips::nip04::decrypt(self.keys.secret_key(), &public_key, ciphertext)
            .map_err(|e| CoreError::SignerError(format!("NIP-04 decryption failed: {}", e)))
    }
}

pub mod internal;
#[cfg(target_arch = "wasm32")]
pub mod nip07;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::Event;

/// 署名者の抽象trait
/// WASM環境ではシングルスレッドのため、Send + Sync要件なし
#[async_trait(?Send)]
pub trait Signer {
    /// 利用可能か（拡張機能が検出できない場合はfalse）
    fn is_available(&self) -> bool {
        true
    }

    /// 公開鍵を取得
    async fn get_public_key(&self) -> Result<String>;

    /// id計算済みの未署名イベントに署名し、署名(hex)を返す
    async fn sign_event(&self, unsigned_event: &Event) -> Result<String>;

    /// NIP-04暗号化
    async fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> Result<String>;

    /// NIP-04復号化
    async fn nip04_decrypt(&self, pubkey: &str, ciphertext: &str) -> Result<String>;
}

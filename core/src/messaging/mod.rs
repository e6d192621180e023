//! 暗号化ダイレクトメッセージ (NIP-04, kind 4)

pub mod envelope;

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::event::{Event, EventBuilder};
use crate::keys;
use crate::relay::{publish_reported, PublishHandle, RelayPool, RelaySet, RelayStatus, SubscriptionHandle};
use crate::signer::Signer;
use crate::types::{EventKind, Filter, TagType};

pub use envelope::MessageEnvelope;

/// 復号したメッセージ
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Envelope(MessageEnvelope),
    Plain(String),
}

impl DecodedMessage {
    pub fn from_plaintext(plaintext: String) -> Self {
        match MessageEnvelope::decode(&plaintext) {
            Some(envelope) => DecodedMessage::Envelope(envelope),
            None => DecodedMessage::Plain(plaintext),
        }
    }
}

pub struct MessagingChannel {
    pool: Arc<dyn RelayPool>,
    signer: Arc<dyn Signer>,
    relays: RelaySet,
    app: String,
    message_type: String,
}

impl MessagingChannel {
    pub fn new(pool: Arc<dyn RelayPool>, signer: Arc<dyn Signer>, relays: RelaySet) -> Self {
        Self {
            pool,
            signer,
            relays,
            app: "coinstr".to_string(),
            message_type: "policy".to_string(),
        }
    }

    /// `send_envelope` で付与する app / type
    pub fn with_envelope(mut self, app: impl Into<String>, message_type: impl Into<String>) -> Self {
        self.app = app.into();
        self.message_type = message_type.into();
        self
    }

    /// 暗号化して送信
    ///
    /// `on_ack` はRelayが受理する度に呼ばれる（重複あり）。送信結果を待たずにハンドルを返す。
    /// コールバックはハンドルを `next` / `finish()` で進めている間にだけ呼ばれるため、
    /// ハンドルを破棄すると以降の通知は届かない。
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        plaintext: &str,
        on_ack: impl FnMut(&RelayStatus) + 'static,
    ) -> Result<PublishHandle> {
        if !self.signer.is_available() {
            return Err(CoreError::ProviderUnavailable);
        }
        let from = keys::normalize_public_key(from)?;
        let to = keys::normalize_public_key(to)?;
        let relays = self.relays.require()?;

        let ciphertext = self.signer.nip04_encrypt(&to, plaintext).await?;
        let event = EventBuilder::new(EventKind::DirectMessage, ciphertext)
            .tag(TagType::PubKey, to.as_str())
            .sign_with_signer(&from, self.signer.as_ref())
            .await?;

        log::debug!("Sending message {} to {} relays", event.id(), relays.len());
        let handle = publish_reported(self.pool.as_ref(), &relays, &event).await;
        Ok(handle.on_ok(on_ack))
    }

    /// データをメタデータ形式に包んで送信
    pub async fn send_envelope(
        &self,
        from: &str,
        to: &str,
        data: serde_json::Value,
        on_ack: impl FnMut(&RelayStatus) + 'static,
    ) -> Result<PublishHandle> {
        let envelope = MessageEnvelope::new(self.app.as_str(), self.message_type.as_str(), data);
        self.send(from, to, &envelope.encode(), on_ack).await
    }

    /// 指定公開鍵が作成したメッセージを購読（キャンセルまで継続）
    pub async fn receive(&self, author: &str) -> Result<SubscriptionHandle> {
        let author = keys::normalize_public_key(author)?;
        let relays = self.relays.require()?;
        self.pool.subscribe(&relays, vec![messages_filter(&author)]).await
    }

    /// 指定公開鍵が作成したメッセージを一括取得
    pub async fn fetch_messages(&self, author: &str) -> Result<Vec<Event>> {
        let author = keys::normalize_public_key(author)?;
        let relays = self.relays.require()?;
        self.pool.list(&relays, vec![messages_filter(&author)]).await
    }

    /// 相手の公開鍵で復号し、メタデータ形式なら展開する
    pub async fn decrypt_message(&self, counterparty: &str, ciphertext: &str) -> Result<DecodedMessage> {
        if ciphertext.is_empty() {
            return Err(CoreError::Other("Missing message".to_string()));
        }
        let counterparty = keys::normalize_public_key(counterparty)?;
        let plaintext = self.signer.nip04_decrypt(&counterparty, ciphertext).await?;
        Ok(DecodedMessage::from_plaintext(plaintext))
    }
}

fn messages_filter(author: &str) -> Filter {
    Filter::new().kind(EventKind::DirectMessage).author(author)
}

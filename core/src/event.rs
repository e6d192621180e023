//! Relayとやり取りするイベントの型と構築
//!
//! 署名済みイベントは不変。内容を変える場合は新しいイベントを構築する。

use std::convert::TryFrom;

use nostr::JsonUtil;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::signer::Signer;
use crate::types::{EventKind, TagType};

/// ワイヤー形式そのままのイベント（検証前）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEvent {
    id: String,
    pubkey: String,
    created_at: u64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    #[serde(default)]
    sig: String,
}

/// 検証済みイベント
///
/// `sig` が空の場合は未署名（idのみ計算済み）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent", into = "RawEvent")]
pub struct Event {
    id: String,
    pubkey: String,
    created_at: u64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    sig: String,
}

impl Event {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn kind(&self) -> u16 {
        self.kind
    }

    pub fn tags(&self) -> &[Vec<String>] {
        &self.tags
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sig(&self) -> &str {
        &self.sig
    }

    pub fn is_signed(&self) -> bool {
        !self.sig.is_empty()
    }

    pub fn is_kind(&self, kind: EventKind) -> bool {
        self.kind == kind.as_u16()
    }

    /// 指定種別のタグの値を列挙
    pub fn tag_values(&self, tag_type: TagType) -> impl Iterator<Item = &str> {
        self.tags.iter().filter_map(move |tag| match tag.as_slice() {
            [t, value, ..] if t == tag_type.as_str() => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn first_tag(&self, tag_type: TagType) -> Option<&str> {
        self.tag_values(tag_type).next()
    }

    /// 指定種別・値のタグを持つか
    pub fn has_tag(&self, tag_type: TagType, value: &str) -> bool {
        self.tag_values(tag_type).any(|v| v == value)
    }

    /// JSONからパース（検証付き）
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::InvalidEvent(e.to_string()))
    }

    /// JSONに変換
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "id": self.id,
            "pubkey": self.pubkey,
            "created_at": self.created_at,
            "kind": self.kind,
            "tags": self.tags,
            "content": self.content,
            "sig": self.sig,
        })
        .to_string()
    }

    /// 署名を付与した新しいイベントを返す
    fn with_sig(self, sig: String) -> Result<Self> {
        let event = Event { sig, ..self };
        event.verify_signature()?;
        Ok(event)
    }

    fn verify_signature(&self) -> Result<()> {
        let event = nostr::Event::from_json(self.to_json())
            .map_err(|e| CoreError::InvalidEvent(e.to_string()))?;
        event
            .verify()
            .map_err(|e| CoreError::InvalidEvent(format!("bad signature on {}: {}", self.id, e)))
    }
}

impl TryFrom<RawEvent> for Event {
    type Error = CoreError;

    fn try_from(raw: RawEvent) -> Result<Self> {
        if !is_lower_hex(&raw.pubkey, 64) {
            return Err(CoreError::InvalidEvent("pubkey is not 64 lowercase hex".to_string()));
        }
        if !is_lower_hex(&raw.id, 64) {
            return Err(CoreError::InvalidEvent("id is not 64 lowercase hex".to_string()));
        }
        let expected = compute_id(&raw.pubkey, raw.created_at, raw.kind, &raw.tags, &raw.content);
        if expected != raw.id {
            return Err(CoreError::InvalidEvent(format!("id mismatch for {}", raw.id)));
        }

        let event = Event {
            id: raw.id,
            pubkey: raw.pubkey,
            created_at: raw.created_at,
            kind: raw.kind,
            tags: raw.tags,
            content: raw.content,
            sig: raw.sig,
        };
        if event.is_signed() {
            event.verify_signature()?;
        }
        Ok(event)
    }
}

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        RawEvent {
            id: event.id,
            pubkey: event.pubkey,
            created_at: event.created_at,
            kind: event.kind,
            tags: event.tags,
            content: event.content,
            sig: event.sig,
        }
    }
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// NIP-01 のイベントID: sha256([0,pubkey,created_at,kind,tags,content])
pub fn compute_id(pubkey: &str, created_at: u64, kind: u16, tags: &[Vec<String>], content: &str) -> String {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// 署名方法
pub enum SigningMode<'a> {
    /// idのみ計算し、署名しない
    Unsigned,
    /// ローカルの秘密鍵で署名
    LocalKey(&'a nostr::Keys),
    /// 外部プロバイダ（NIP-07等）で署名
    External(&'a dyn Signer),
}

/// イベントビルダー
#[derive(Debug, Clone)]
pub struct EventBuilder {
    kind: u16,
    content: String,
    tags: Vec<Vec<String>>,
    created_at: Option<u64>,
}

impl EventBuilder {
    pub fn new(kind: impl Into<u16>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn tag(mut self, tag_type: TagType, value: impl Into<String>) -> Self {
        self.tags.push(tag_type.tag(value));
        self
    }

    pub fn tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        self.tags.extend(tags);
        self
    }

    /// created_atを固定（テスト・再構築用）
    pub fn custom_created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// イベントを構築する
    ///
    /// `LocalKey` の場合、作成者は鍵の公開鍵になる。
    pub async fn build(self, author: &str, mode: SigningMode<'_>) -> Result<Event> {
        match mode {
            SigningMode::Unsigned => self.to_unsigned(author),
            SigningMode::LocalKey(keys) => self.sign_with_keys(keys),
            SigningMode::External(signer) => self.sign_with_signer(author, signer).await,
        }
    }

    /// idのみ計算した未署名イベント（作成者はhex公開鍵）
    pub fn to_unsigned(self, author: &str) -> Result<Event> {
        let pubkey = author.to_lowercase();
        crate::keys::parse_hex(&pubkey)?;
        let created_at = self.created_at.unwrap_or_else(crate::time::now);
        let id = compute_id(&pubkey, created_at, self.kind, &self.tags, &self.content);
        Ok(Event {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: String::new(),
        })
    }

    /// ローカル鍵で署名
    pub fn sign_with_keys(self, keys: &nostr::Keys) -> Result<Event> {
        let unsigned = self.to_unsigned(&keys.public_key().to_hex())?;
        let sig = sign_locally(keys, &unsigned)?;
        unsigned.with_sig(sig)
    }

    /// 外部Signerで署名
    pub async fn sign_with_signer(self, author: &str, signer: &dyn Signer) -> Result<Event> {
        if !signer.is_available() {
            return Err(CoreError::ProviderUnavailable);
        }
        let unsigned = self.to_unsigned(author)?;
        let sig = signer.sign_event(&unsigned).await?;
        unsigned.with_sig(sig)
    }
}

/// nostrクレートで同じ内容のイベントを署名し、署名のみ取り出す
pub(crate) fn sign_locally(keys: &nostr::Keys, unsigned: &Event) -> Result<String> {
    if keys.public_key().to_hex() != unsigned.pubkey {
        return Err(CoreError::SignerError("Event author does not match signing key".to_string()));
    }

    let tags = unsigned
        .tags
        .iter()
        .map(|tag| nostr::Tag::parse(tag))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CoreError::SignerError(format!("Invalid tag: {}", e)))?;

    let signed = nostr::EventBuilder::new(nostr::Kind::from(unsigned.kind), unsigned.content.clone())
        .tags(tags)
        .custom_created_at(nostr::Timestamp::from(unsigned.created_at))
        .sign_with_keys(keys)
        .map_err(|e| CoreError::SignerError(format!("Failed to sign event: {}", e)))?;

    if signed.id.to_hex() != unsigned.id {
        return Err(CoreError::SignerError("Signed event id mismatch".to_string()));
    }
    Ok(signed.sig.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::internal::InternalSigner;
    use crate::types::Filter;

    #[tokio::test]
    async fn test_unsigned_computes_id_only() {
        let keys = nostr::Keys::generate();
        let author = keys.public_key().to_hex();
        let event = EventBuilder::new(EventKind::Note, "hello")
            .tag(TagType::PubKey, author.clone())
            .build(&author, SigningMode::Unsigned)
            .await
            .unwrap();

        assert!(!event.is_signed());
        assert_eq!(event.id().len(), 64);
        assert_eq!(
            event.id(),
            compute_id(&author, event.created_at(), 1, event.tags(), "hello")
        );
    }

    #[tokio::test]
    async fn test_local_key_signature_verifies() {
        let keys = nostr::Keys::generate();
        let event = EventBuilder::new(EventKind::Policy, "ciphertext")
            .tag(TagType::PubKey, keys.public_key().to_hex())
            .build("ignored", SigningMode::LocalKey(&keys))
            .await
            .unwrap();

        assert!(event.is_signed());
        assert_eq!(event.pubkey(), keys.public_key().to_hex());

        let parsed = Event::from_json(&event.to_json()).unwrap();
        assert_eq!(parsed, event);
    }

    #[tokio::test]
    async fn test_external_provider_signs() {
        let signer = InternalSigner::generate();
        let author = signer.get_public_key().await.unwrap();
        let event = EventBuilder::new(EventKind::DirectMessage, "x")
            .build(&author, SigningMode::External(&signer))
            .await
            .unwrap();

        assert!(event.is_signed());
        assert_eq!(event.pubkey(), author);
    }

    #[tokio::test]
    async fn test_external_provider_unavailable() {
        let signer = InternalSigner::generate().unavailable();
        let author = nostr::Keys::generate().public_key().to_hex();
        let result = EventBuilder::new(EventKind::DirectMessage, "x")
            .build(&author, SigningMode::External(&signer))
            .await;

        assert!(matches!(result, Err(CoreError::ProviderUnavailable)));
    }

    #[test]
    fn test_created_at_is_stamped() {
        let before = crate::time::now();
        let author = nostr::Keys::generate().public_key().to_hex();
        let event = EventBuilder::new(EventKind::Note, "").to_unsigned(&author).unwrap();
        assert!(event.created_at() >= before);
    }

    #[tokio::test]
    async fn test_author_must_be_hex_public_key() {
        let keys = nostr::Keys::generate();
        let npub = crate::keys::hex_to_npub(&keys.public_key().to_hex()).unwrap();

        for author in ["ignored", npub.as_str()] {
            let result = EventBuilder::new(EventKind::Note, "x")
                .build(author, SigningMode::Unsigned)
                .await;
            assert!(matches!(result, Err(CoreError::InvalidKeyEncoding(_))));
        }

        let signer = InternalSigner::generate();
        let result = EventBuilder::new(EventKind::Note, "x")
            .build("ignored", SigningMode::External(&signer))
            .await;
        assert!(matches!(result, Err(CoreError::InvalidKeyEncoding(_))));

        // 大文字hexは正規化され、そのまま往復できる
        let upper = keys.public_key().to_hex().to_uppercase();
        let event = EventBuilder::new(EventKind::Note, "x")
            .build(&upper, SigningMode::Unsigned)
            .await
            .unwrap();
        assert_eq!(event.pubkey(), keys.public_key().to_hex());
    }

    #[test]
    fn test_tampered_event_rejected() {
        let keys = nostr::Keys::generate();
        let event = EventBuilder::new(EventKind::Note, "original")
            .sign_with_keys(&keys)
            .unwrap();

        let tampered = event.to_json().replace("original", "changed");
        assert!(matches!(Event::from_json(&tampered), Err(CoreError::InvalidEvent(_))));
    }

    #[test]
    fn test_tag_helpers_and_filter_match() {
        let author = nostr::Keys::generate().public_key().to_hex();
        let event = EventBuilder::new(EventKind::SharedKey, "c")
            .tag(TagType::Event, "e".repeat(64))
            .tag(TagType::PubKey, "b".repeat(64))
            .to_unsigned(&author)
            .unwrap();

        assert!(event.has_tag(TagType::Event, &"e".repeat(64)));
        assert!(!event.has_tag(TagType::PubKey, &author));

        let matching = Filter::new().kind(EventKind::SharedKey).pubkey("b".repeat(64));
        let other_kind = Filter::new().kind(EventKind::Policy);
        let other_author = Filter::new().author("c".repeat(64));
        assert!(matching.matches(&event));
        assert!(!other_kind.matches(&event));
        assert!(!other_author.matches(&event));
    }
}

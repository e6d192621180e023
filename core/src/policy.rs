//! マルチシグポリシーの共有
//!
//! ポリシー毎に使い捨ての共有鍵を生成し、ポリシー本体をその鍵で暗号化する。
//! 共有鍵の秘密鍵は参加者毎にNIP-04で暗号化して配布する。
//!
//! - Policyイベント (kind 9289): 作成者 = 共有鍵、`p`タグ = 参加者
//! - SharedKeyイベント (kind 9288): 作成者 = ポリシー作成者、`e`タグ = Policyイベント、`p`タグ = 受取人

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::event::{Event, EventBuilder};
use crate::keys::{self, SharedKey};
use crate::relay::{publish_reported, PublishHandle, PublishReport, RelayPool, RelaySet};
use crate::signer::Signer;
use crate::types::{EventKind, Filter, TagType};

/// 一覧取得時の失敗の扱い
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingMode {
    /// 最初の失敗で一覧全体を失敗させる
    #[default]
    Strict,
    /// 失敗したポリシーのみ読み飛ばす
    Lenient,
}

/// miniscriptポリシー -> ディスクリプタ の変換（外部実装）
pub trait DescriptorCompiler {
    fn compile(&self, policy: &str) -> Result<String>;
}

impl<F> DescriptorCompiler for F
where
    F: Fn(&str) -> Result<String>,
{
    fn compile(&self, policy: &str) -> Result<String> {
        self(policy)
    }
}

/// ポリシーの定義元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    Descriptor(String),
    Miniscript(String),
}

/// 作成前のポリシー
#[derive(Debug, Clone)]
pub struct PolicyDraft {
    pub name: String,
    pub description: String,
    pub source: PolicySource,
    pub ui_metadata: serde_json::Value,
    /// 明示的な参加者（npub/hex）。空ならminiscriptの `pk(...)` から抽出
    pub keys: Vec<String>,
}

impl PolicyDraft {
    pub fn new(name: impl Into<String>, description: impl Into<String>, source: PolicySource) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            source,
            ui_metadata: serde_json::Value::Null,
            keys: Vec::new(),
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ui_metadata(mut self, ui_metadata: serde_json::Value) -> Self {
        self.ui_metadata = ui_metadata;
        self
    }
}

/// 暗号化されるポリシー本体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBody {
    pub name: String,
    pub description: String,
    pub descriptor: String,
    #[serde(rename = "uiMetadata", default)]
    pub ui_metadata: serde_json::Value,
}

/// 構築済みのPolicyイベントとSharedKeyイベント
#[derive(Debug, Clone)]
pub struct PolicyEvents {
    pub policy_event: Event,
    pub shared_key_events: Vec<Event>,
}

/// 送信中のポリシー。応答はハンドル毎に届く
pub struct PolicyPublication {
    pub shared_keys: Vec<PublishHandle>,
    pub policy: PublishHandle,
}

impl PolicyPublication {
    /// 全応答を待って集計（SharedKey、Policyの順）
    pub async fn finish(self) -> Vec<PublishReport> {
        let mut reports = Vec::with_capacity(self.shared_keys.len() + 1);
        for handle in self.shared_keys {
            reports.push(handle.finish().await);
        }
        reports.push(self.policy.finish().await);
        reports
    }
}

/// createAndPublish の結果
pub struct CreatedPolicy {
    pub events: PolicyEvents,
    pub publication: PolicyPublication,
}

/// 復号済みのポリシー
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedPolicy {
    pub event: Event,
    pub body: PolicyBody,
}

/// ポリシーの作成・配布・取得
pub struct PolicyStore {
    pool: Arc<dyn RelayPool>,
    signer: Arc<dyn Signer>,
    relays: RelaySet,
    compiler: Option<Arc<dyn DescriptorCompiler>>,
    mode: ListingMode,
}

impl PolicyStore {
    pub fn new(pool: Arc<dyn RelayPool>, signer: Arc<dyn Signer>, relays: RelaySet) -> Self {
        Self {
            pool,
            signer,
            relays,
            compiler: None,
            mode: ListingMode::default(),
        }
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn DescriptorCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn with_listing_mode(mut self, mode: ListingMode) -> Self {
        self.mode = mode;
        self
    }

    /// ポリシーを作成して全Relayへ送信
    ///
    /// 送信前の失敗は何も公開せずにエラーを返す。送信結果は `publication` から通知される。
    pub async fn create_and_publish(&self, draft: PolicyDraft, creator: &str) -> Result<CreatedPolicy> {
        if !self.signer.is_available() {
            return Err(CoreError::ProviderUnavailable);
        }
        let relays = self.relays.require()?;
        let creator = keys::normalize_public_key(creator)?;

        let descriptor = self.resolve_descriptor(&draft.source)?;
        let participants = extract_participants(&draft, &creator)?;
        let events = self.build_events(draft, descriptor, &participants, &creator).await?;

        log::info!(
            "Policy {} built with {} participants",
            events.policy_event.id(),
            participants.len()
        );

        let publication = self.publish_to(&relays, &events).await;
        Ok(CreatedPolicy { events, publication })
    }

    /// 構築済みイベントを再送信（部分的な公開のリトライ用）
    pub async fn publish(&self, events: &PolicyEvents) -> PolicyPublication {
        let relays = self.relays.snapshot();
        self.publish_to(&relays, events).await
    }

    async fn publish_to(&self, relays: &[String], events: &PolicyEvents) -> PolicyPublication {
        let mut shared_keys = Vec::with_capacity(events.shared_key_events.len());
        for event in &events.shared_key_events {
            shared_keys.push(publish_reported(self.pool.as_ref(), relays, event).await);
        }
        let policy = publish_reported(self.pool.as_ref(), relays, &events.policy_event).await;

        log::debug!(
            "Submitted policy {} and {} shared keys to {} relays",
            events.policy_event.id(),
            shared_keys.len(),
            relays.len()
        );
        PolicyPublication { shared_keys, policy }
    }

    fn resolve_descriptor(&self, source: &PolicySource) -> Result<String> {
        match source {
            PolicySource::Descriptor(descriptor) => {
                let descriptor = descriptor.trim();
                if descriptor.is_empty() {
                    return Err(CoreError::InvalidPolicyExpression("empty descriptor".to_string()));
                }
                Ok(descriptor.to_string())
            }
            PolicySource::Miniscript(policy) => {
                let compiler = self.compiler.as_ref().ok_or_else(|| {
                    CoreError::InvalidPolicyExpression("no descriptor compiler configured".to_string())
                })?;
                compiler.compile(policy).map_err(|e| match e {
                    CoreError::InvalidPolicyExpression(_) => e,
                    other => CoreError::InvalidPolicyExpression(other.to_string()),
                })
            }
        }
    }

    async fn build_events(
        &self,
        draft: PolicyDraft,
        descriptor: String,
        participants: &[String],
        creator: &str,
    ) -> Result<PolicyEvents> {
        let shared_key = SharedKey::generate()?;

        let body = PolicyBody {
            name: draft.name,
            description: draft.description,
            descriptor,
            ui_metadata: draft.ui_metadata,
        };
        let content = shared_key.encrypt(&serde_json::to_string(&body)?)?;

        let policy_event = EventBuilder::new(EventKind::Policy, content)
            .tags(participants.iter().map(|p| TagType::PubKey.tag(p.as_str())))
            .sign_with_keys(shared_key.keys())?;

        let secret = shared_key.secret_hex();
        let mut shared_key_events = Vec::with_capacity(participants.len());
        for participant in participants {
            let encrypted = self.signer.nip04_encrypt(participant, &secret).await?;
            let event = EventBuilder::new(EventKind::SharedKey, encrypted)
                .tag(TagType::Event, policy_event.id())
                .tag(TagType::PubKey, participant.as_str())
                .sign_with_signer(creator, self.signer.as_ref())
                .await?;
            shared_key_events.push(event);
        }

        Ok(PolicyEvents {
            policy_event,
            shared_key_events,
        })
    }

    /// 指定アカウントが参加しているポリシーを取得して復号
    ///
    /// 返す順序はRelayの返却順で、安定しない。
    pub async fn list_for_account(&self, pubkey: &str) -> Result<Vec<DecryptedPolicy>> {
        let pubkey = keys::normalize_public_key(pubkey)?;
        let relays = self.relays.require()?;

        let policies = self
            .pool
            .list(&relays, vec![Filter::new().kind(EventKind::Policy).pubkey(pubkey.as_str())])
            .await?;
        let shared_keys = self
            .pool
            .list(&relays, vec![Filter::new().kind(EventKind::SharedKey).pubkey(pubkey.as_str())])
            .await?;

        let candidates: Vec<Event> = policies
            .into_iter()
            .filter(|p| p.is_kind(EventKind::Policy) && p.has_tag(TagType::PubKey, &pubkey))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut result = Vec::with_capacity(candidates.len());
        for policy in candidates {
            match self.decrypt_policy(&policy, &shared_keys, &pubkey).await {
                Ok(body) => result.push(DecryptedPolicy { event: policy, body }),
                Err(e) if self.mode == ListingMode::Lenient => {
                    log::warn!("Skipping policy {}: {}", policy.id(), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    async fn decrypt_policy(&self, policy: &Event, shared_keys: &[Event], pubkey: &str) -> Result<PolicyBody> {
        let policy_id = policy.id().to_string();
        let shared = find_shared_key_event(shared_keys, &policy_id, pubkey).ok_or_else(|| {
            CoreError::SharedKeyNotFound {
                policy_id: policy_id.clone(),
            }
        })?;

        let secret = self
            .signer
            .nip04_decrypt(shared.pubkey(), shared.content())
            .await
            .map_err(|e| CoreError::SharedKeyDecryptionFailure {
                policy_id: policy_id.clone(),
                reason: e.to_string(),
            })?;
        let shared_key =
            SharedKey::from_secret_hex(&secret).map_err(|_| CoreError::SharedKeyDecryptionFailure {
                policy_id: policy_id.clone(),
                reason: "decrypted content is not a secret key".to_string(),
            })?;
        if shared_key.public_hex() != policy.pubkey() {
            return Err(CoreError::SharedKeyDecryptionFailure {
                policy_id,
                reason: "shared key does not belong to this policy".to_string(),
            });
        }

        let plaintext = shared_key.decrypt(policy.content()).map_err(|e| CoreError::PolicyCorrupt {
            policy_id: policy_id.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&plaintext).map_err(|e| CoreError::PolicyCorrupt {
            policy_id,
            reason: format!("invalid policy structure at line {} column {}", e.line(), e.column()),
        })
    }
}

/// 指定ポリシー・受取人宛てのSharedKeyイベントを探す（複数あれば最新）
pub fn find_shared_key_event<'a>(shared_keys: &'a [Event], policy_id: &str, pubkey: &str) -> Option<&'a Event> {
    shared_keys
        .iter()
        .filter(|e| e.is_kind(EventKind::SharedKey))
        .filter(|e| e.has_tag(TagType::Event, policy_id) && e.has_tag(TagType::PubKey, pubkey))
        .max_by_key(|e| e.created_at())
}

/// 参加者の公開鍵(hex)を抽出。作成者が含まれていなければ末尾に追加
/// 優先順: 明示された鍵、`uiMetadata.keys`、miniscriptの `pk(...)`
pub fn extract_participants(draft: &PolicyDraft, creator: &str) -> Result<Vec<String>> {
    let mut participants: Vec<String> = Vec::new();
    let ui_keys: Vec<&str> = draft
        .ui_metadata
        .get("keys")
        .and_then(|keys| keys.as_array())
        .map(|keys| keys.iter().filter_map(|k| k.as_str()).collect())
        .unwrap_or_default();

    if !draft.keys.is_empty() || !ui_keys.is_empty() {
        let explicit = if draft.keys.is_empty() {
            ui_keys
        } else {
            draft.keys.iter().map(String::as_str).collect()
        };
        for key in explicit {
            let hex = keys::normalize_public_key(key)?;
            if !participants.contains(&hex) {
                participants.push(hex);
            }
        }
    } else if let PolicySource::Miniscript(policy) = &draft.source {
        for term in pk_terms(policy) {
            match keys::normalize_public_key(term) {
                Ok(hex) if !participants.contains(&hex) => participants.push(hex),
                Ok(_) => {}
                Err(_) => log::debug!("Ignoring non-nostr key in pk() term"),
            }
        }
    }

    if participants.is_empty() {
        return Err(CoreError::EmptyParticipantSet);
    }
    if !participants.iter().any(|p| p == creator) {
        participants.push(creator.to_string());
    }
    Ok(participants)
}

/// `pk(...)` の中身を列挙（`[fingerprint/path]` の起点情報は除去）
fn pk_terms(policy: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut rest = policy;
    let mut consumed = 0;

    while let Some(pos) = rest.find("pk(") {
        let absolute = consumed + pos;
        let boundary = policy[..absolute]
            .chars()
            .last()
            .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'));

        let after = &rest[pos + 3..];
        let Some(end) = after.find(')') else {
            break;
        };
        if boundary {
            let mut term = after[..end].trim();
            if term.starts_with('[') {
                if let Some(close) = term.find(']') {
                    term = &term[close + 1..];
                }
            }
            terms.push(term);
        }
        consumed = absolute + 3 + end + 1;
        rest = &policy[consumed..];
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::mock::MockRelayPool;
    use crate::signer::internal::InternalSigner;

    const RELAYS: [&str; 3] = ["wss://r1", "wss://r2", "wss://r3"];

    struct Party {
        signer: Arc<InternalSigner>,
        hex: String,
    }

    fn party() -> Party {
        let signer = Arc::new(InternalSigner::generate());
        let hex = signer.public_key_hex();
        Party { signer, hex }
    }

    fn store(pool: &MockRelayPool, party: &Party) -> PolicyStore {
        PolicyStore::new(
            Arc::new(pool.clone()),
            party.signer.clone(),
            RelaySet::new(RELAYS.iter().map(|r| r.to_string()).collect()),
        )
    }

    fn draft(keys: &[&String]) -> PolicyDraft {
        PolicyDraft::new(
            "Family vault",
            "2 of 2",
            PolicySource::Descriptor("wsh(multi(2,A,B))".to_string()),
        )
        .with_keys(keys.iter().map(|k| k.as_str()))
        .with_ui_metadata(serde_json::json!({ "color": "blue" }))
    }

    #[test]
    fn test_pk_terms() {
        let terms = pk_terms("or(pk(aaa),and(pk([d34db33f/48'/0'/0']bbb),older(144)),pkh(ccc),xpk(ddd))");
        assert_eq!(terms, vec!["aaa", "bbb"]);
        assert!(pk_terms("thresh(2,pk(x").is_empty());
    }

    #[test]
    fn test_extract_participants_adds_creator_once() {
        let a = party();
        let b = party();
        let npub_b = keys::hex_to_npub(&b.hex).unwrap();

        let participants = extract_participants(&draft(&[&npub_b, &b.hex]), &a.hex).unwrap();
        assert_eq!(participants, vec![b.hex.clone(), a.hex.clone()]);

        let participants = extract_participants(&draft(&[&a.hex, &b.hex]), &a.hex).unwrap();
        assert_eq!(participants, vec![a.hex, b.hex]);
    }

    #[test]
    fn test_extract_participants_from_miniscript() {
        let a = party();
        let b = party();
        let policy = format!("thresh(2,pk({}),pk({}),pk(xpub_not_nostr))", a.hex, keys::hex_to_npub(&b.hex).unwrap());
        let draft = PolicyDraft::new("n", "d", PolicySource::Miniscript(policy));

        let participants = extract_participants(&draft, &a.hex).unwrap();
        assert_eq!(participants, vec![a.hex, b.hex]);
    }

    #[test]
    fn test_extract_participants_from_ui_metadata() {
        let a = party();
        let b = party();
        let npub_b = keys::hex_to_npub(&b.hex).unwrap();
        let draft = PolicyDraft::new("n", "d", PolicySource::Descriptor("wsh(multi(2,A,B))".into()))
            .with_ui_metadata(serde_json::json!({ "keys": [npub_b, 42, b.hex] }));

        let participants = extract_participants(&draft, &a.hex).unwrap();
        assert_eq!(participants, vec![b.hex.clone(), a.hex.clone()]);

        // 明示された鍵が優先される
        let draft = draft.with_keys([a.hex.as_str()]);
        assert_eq!(extract_participants(&draft, &a.hex).unwrap(), vec![a.hex.clone()]);

        let bad = PolicyDraft::new("n", "d", PolicySource::Descriptor("wsh(x)".into()))
            .with_ui_metadata(serde_json::json!({ "keys": ["npub1broken"] }));
        assert!(matches!(
            extract_participants(&bad, &a.hex),
            Err(CoreError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn test_extract_participants_empty() {
        let a = party();
        assert!(matches!(
            extract_participants(&draft(&[]), &a.hex),
            Err(CoreError::EmptyParticipantSet)
        ));
    }

    #[tokio::test]
    async fn test_create_produces_one_shared_key_per_participant() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let (a, b) = (party(), party());

        let created = store(&pool, &a)
            .create_and_publish(draft(&[&a.hex, &b.hex]), &a.hex)
            .await
            .unwrap();
        let events = &created.events;

        let p_tags: Vec<&str> = events.policy_event.tag_values(TagType::PubKey).collect();
        assert_eq!(p_tags, vec![a.hex.as_str(), b.hex.as_str()]);
        assert_eq!(events.shared_key_events.len(), 2);
        assert_ne!(events.policy_event.pubkey(), a.hex);

        for (event, participant) in events.shared_key_events.iter().zip([&a.hex, &b.hex]) {
            assert_eq!(event.pubkey(), a.hex);
            assert!(event.has_tag(TagType::Event, events.policy_event.id()));
            assert!(event.has_tag(TagType::PubKey, participant));
        }

        let reports = created.publication.finish().await;
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.ok.len() == 3));
    }

    #[tokio::test]
    async fn test_round_trip_for_every_participant() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let (a, b) = (party(), party());

        let created = store(&pool, &a)
            .create_and_publish(draft(&[&a.hex, &b.hex]), &a.hex)
            .await
            .unwrap();
        created.publication.finish().await;

        for participant in [&a, &b] {
            let policies = store(&pool, participant).list_for_account(&participant.hex).await.unwrap();
            assert_eq!(policies.len(), 1);
            let body = &policies[0].body;
            assert_eq!(body.name, "Family vault");
            assert_eq!(body.description, "2 of 2");
            assert_eq!(body.descriptor, "wsh(multi(2,A,B))");
            assert_eq!(body.ui_metadata, serde_json::json!({ "color": "blue" }));
        }
    }

    #[tokio::test]
    async fn test_partial_publish_is_reported_not_thrown() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let (a, b) = (party(), party());
        let b_hex = b.hex.clone();
        pool.reject_when("wss://r2", move |event| {
            (event.is_kind(EventKind::SharedKey) && event.has_tag(TagType::PubKey, &b_hex))
                .then(|| "blocked: policy".to_string())
        });

        let created = store(&pool, &a)
            .create_and_publish(draft(&[&a.hex, &b.hex]), &a.hex)
            .await
            .unwrap();
        let reports = created.publication.finish().await;

        let for_b = &reports[1];
        assert_eq!(for_b.event_id, created.events.shared_key_events[1].id());
        assert_eq!(for_b.ok, vec!["wss://r1".to_string(), "wss://r3".to_string()]);
        assert_eq!(for_b.failed, vec![("wss://r2".to_string(), "blocked: policy".to_string())]);
        assert!(reports[0].failed.is_empty());
        assert!(reports[2].failed.is_empty());
    }

    #[tokio::test]
    async fn test_republish_after_outage() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let (a, b) = (party(), party());
        pool.set_offline("wss://r3", true);

        let policy_store = store(&pool, &a);
        let created = policy_store
            .create_and_publish(draft(&[&a.hex, &b.hex]), &a.hex)
            .await
            .unwrap();
        created.publication.finish().await;
        assert!(pool.events("wss://r3").is_empty());

        pool.set_offline("wss://r3", false);
        let reports = policy_store.publish(&created.events).await.finish().await;
        assert!(reports.iter().all(|r| r.failed.is_empty()));
        assert_eq!(pool.events("wss://r3").len(), 3);
    }

    #[tokio::test]
    async fn test_list_empty_when_not_participant() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let (a, b, c) = (party(), party(), party());

        store(&pool, &a)
            .create_and_publish(draft(&[&a.hex, &b.hex]), &a.hex)
            .await
            .unwrap();

        let policies = store(&pool, &c).list_for_account(&c.hex).await.unwrap();
        assert!(policies.is_empty());
    }

    #[tokio::test]
    async fn test_shared_key_of_other_participant_never_used() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let (a, b) = (party(), party());
        let b_hex = b.hex.clone();
        // Bの共有鍵だけがどのRelayにも届かない
        for relay in RELAYS {
            let b_hex = b_hex.clone();
            pool.reject_when(relay, move |event| {
                (event.is_kind(EventKind::SharedKey) && event.has_tag(TagType::PubKey, &b_hex))
                    .then(|| "blocked".to_string())
            });
        }

        store(&pool, &a)
            .create_and_publish(draft(&[&a.hex, &b.hex]), &a.hex)
            .await
            .unwrap();

        let result = store(&pool, &b).list_for_account(&b.hex).await;
        assert!(matches!(result, Err(CoreError::SharedKeyNotFound { .. })));
    }

    #[tokio::test]
    async fn test_lenient_mode_skips_failing_policy() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let (a, b) = (party(), party());
        let a_store = store(&pool, &a);

        let kept = a_store
            .create_and_publish(draft(&[&a.hex, &b.hex]), &a.hex)
            .await
            .unwrap();
        kept.publication.finish().await;

        let orphan = PolicyDraft::new("orphan", "", PolicySource::Descriptor("tr(x)".into())).with_keys([a.hex.as_str()]);
        let created = a_store.create_and_publish(orphan, &a.hex).await.unwrap();
        // Policyイベントのみ残し、共有鍵を失わせる
        let orphan_pool = MockRelayPool::with_relays(&RELAYS);
        for relay in RELAYS {
            for event in pool.events(relay) {
                if created.events.shared_key_events.iter().all(|s| s.id() != event.id()) {
                    orphan_pool.insert_event(relay, event);
                }
            }
        }

        let strict = store(&orphan_pool, &a).list_for_account(&a.hex).await;
        assert!(matches!(strict, Err(CoreError::SharedKeyNotFound { .. })));

        let lenient = store(&orphan_pool, &a)
            .with_listing_mode(ListingMode::Lenient)
            .list_for_account(&a.hex)
            .await
            .unwrap();
        assert_eq!(lenient.len(), 1);
        assert_eq!(lenient[0].event.id(), kept.events.policy_event.id());
    }

    #[tokio::test]
    async fn test_corrupt_policy_content() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let a = party();

        let shared = SharedKey::generate().unwrap();
        let content = shared.encrypt("not json").unwrap();
        let policy_event = EventBuilder::new(EventKind::Policy, content)
            .tag(TagType::PubKey, a.hex.as_str())
            .sign_with_keys(shared.keys())
            .unwrap();
        let encrypted = a.signer.nip04_encrypt(&a.hex, &shared.secret_hex()).await.unwrap();
        let shared_event = EventBuilder::new(EventKind::SharedKey, encrypted)
            .tag(TagType::Event, policy_event.id())
            .tag(TagType::PubKey, a.hex.as_str())
            .sign_with_signer(&a.hex, a.signer.as_ref())
            .await
            .unwrap();
        pool.insert_event("wss://r1", policy_event);
        pool.insert_event("wss://r1", shared_event);

        let result = store(&pool, &a).list_for_account(&a.hex).await;
        assert!(matches!(result, Err(CoreError::PolicyCorrupt { .. })));
    }

    #[tokio::test]
    async fn test_miniscript_requires_compiler() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let (a, b) = (party(), party());
        let policy = format!("and(pk({}),pk({}))", a.hex, b.hex);
        let miniscript = PolicyDraft::new("n", "d", PolicySource::Miniscript(policy));

        let without = store(&pool, &a).create_and_publish(miniscript.clone(), &a.hex).await;
        assert!(matches!(without, Err(CoreError::InvalidPolicyExpression(_))));
        assert_eq!(pool.publish_count(), 0);

        let compiler = |policy: &str| -> Result<String> { Ok(format!("wsh({})", policy)) };
        let created = store(&pool, &a)
            .with_compiler(Arc::new(compiler))
            .create_and_publish(miniscript, &a.hex)
            .await
            .unwrap();
        assert_eq!(created.events.shared_key_events.len(), 2);

        let failing = |_: &str| -> Result<String> { Err(CoreError::Other("bad".into())) };
        let result = store(&pool, &a)
            .with_compiler(Arc::new(failing))
            .create_and_publish(PolicyDraft::new("n", "d", PolicySource::Miniscript("x".into())), &a.hex)
            .await;
        assert!(matches!(result, Err(CoreError::InvalidPolicyExpression(_))));
    }

    #[tokio::test]
    async fn test_unavailable_provider_publishes_nothing() {
        let pool = MockRelayPool::with_relays(&RELAYS);
        let a = party();
        let unavailable = PolicyStore::new(
            Arc::new(pool.clone()),
            Arc::new(InternalSigner::generate().unavailable()),
            RelaySet::new(RELAYS.iter().map(|r| r.to_string()).collect()),
        );

        let result = unavailable.create_and_publish(draft(&[&a.hex]), &a.hex).await;
        assert!(matches!(result, Err(CoreError::ProviderUnavailable)));
        assert_eq!(pool.publish_count(), 0);
    }
}

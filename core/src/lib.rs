pub mod config;
pub mod error;
pub mod event;
pub mod keys;
pub mod messaging;
pub mod policy;
pub mod profile;
pub mod relay;
pub mod signer;
pub mod subscription;
pub mod time;
pub mod types;

use std::sync::Arc;

pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use event::{Event, EventBuilder, SigningMode};
pub use messaging::{DecodedMessage, MessageEnvelope, MessagingChannel};
pub use policy::{
    CreatedPolicy, DecryptedPolicy, DescriptorCompiler, ListingMode, PolicyBody, PolicyDraft,
    PolicyEvents, PolicySource, PolicyStore,
};
pub use profile::ProfileService;
pub use relay::{PublishHandle, PublishReport, RelayPool, RelaySet, RelayStatus, SubscriptionHandle};
pub use signer::Signer;
pub use types::{Account, AccountUpdate, Contact, EventKind, Filter, OwnMessage, ProfileMetadata, TagType};

/// WASM初期化とパニックフック設定
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen::prelude::wasm_bindgen(start)]
pub fn start() {
    console_error_panic_hook::set_once();

    if console_log::init_with_level(log::Level::Debug).is_err() {
        log::warn!("Logger already initialized");
    }

    log::info!("Coinstr core initialized");
}

/// CoreHandle: UIから使用されるメインAPI
pub struct CoreHandle {
    config: CoreConfig,
    pool: Arc<dyn RelayPool>,
    relays: RelaySet,
    signer: Option<Arc<dyn Signer>>,
    compiler: Option<Arc<dyn DescriptorCompiler>>,
    account: Option<Account>,
}

impl CoreHandle {
    /// 初期化
    pub fn init(config: CoreConfig, pool: Arc<dyn RelayPool>) -> Self {
        let relays = RelaySet::new(config.relays.clone());
        Self {
            config,
            pool,
            relays,
            signer: None,
            compiler: None,
            account: None,
        }
    }

    /// ブラウザ用（WebSocket + NIP-07）
    #[cfg(target_arch = "wasm32")]
    pub fn browser(config: CoreConfig) -> Self {
        let mut handle = Self::init(config, Arc::new(relay::websocket::WebSocketPool::new()));
        handle.set_signer(Arc::new(signer::nip07::Nip07Signer));
        handle
    }

    /// Signerを設定
    pub fn set_signer(&mut self, signer: Arc<dyn Signer>) {
        self.signer = Some(signer);
    }

    pub fn set_descriptor_compiler(&mut self, compiler: Arc<dyn DescriptorCompiler>) {
        self.compiler = Some(compiler);
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn signer(&self) -> Result<Arc<dyn Signer>> {
        match &self.signer {
            Some(signer) if signer.is_available() => Ok(signer.clone()),
            _ => Err(CoreError::ProviderUnavailable),
        }
    }

    /// 公開鍵を取得
    pub async fn get_public_key(&self) -> Result<Option<String>> {
        if let Some(signer) = &self.signer {
            Ok(Some(signer.get_public_key().await?))
        } else {
            Ok(None)
        }
    }

    /// アカウントに接続（省略時はSignerの公開鍵）
    pub async fn connect(&mut self, public_key: Option<&str>) -> Result<&Account> {
        let hex = match public_key {
            Some(key) => keys::normalize_public_key(key)?,
            None => {
                let key = self.signer()?.get_public_key().await?;
                keys::normalize_public_key(&key)?
            }
        };
        let npub = keys::hex_to_npub(&hex)?;

        log::info!("Connected as {}", npub);
        Ok(self
            .account
            .insert(Account::new(hex, npub, self.relays.snapshot())))
    }

    /// アカウントとRelay設定をクリア
    pub fn disconnect(&mut self) {
        if let Some(account) = self.account.take() {
            log::info!("Disconnected {}", account.npub);
        }
        self.relays.clear();
    }

    pub fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    fn active_account(&self) -> Result<&Account> {
        self.account.as_ref().ok_or(CoreError::NoActiveAccount)
    }

    pub fn update_account(&mut self, update: AccountUpdate) -> Result<()> {
        let account = self.account.as_mut().ok_or(CoreError::NoActiveAccount)?;
        account.apply(update);
        Ok(())
    }

    pub fn add_own_message(&mut self, message: OwnMessage) -> Result<()> {
        let account = self.account.as_mut().ok_or(CoreError::NoActiveAccount)?;
        account.own_messages.push(message);
        Ok(())
    }

    /// Relayを追加（重複は無視）
    pub fn add_relay(&self, url: impl Into<String>) -> bool {
        self.relays.add(url)
    }

    pub fn clear_relays(&self) {
        self.relays.clear();
    }

    pub fn set_relays(&self, relays: Vec<String>) {
        self.relays.replace(relays);
    }

    pub fn relays(&self) -> Vec<String> {
        self.relays.snapshot()
    }

    pub fn policy_store(&self) -> Result<PolicyStore> {
        let mut store = PolicyStore::new(self.pool.clone(), self.signer()?, self.relays.clone())
            .with_listing_mode(self.config.listing_mode);
        if let Some(compiler) = &self.compiler {
            store = store.with_compiler(compiler.clone());
        }
        Ok(store)
    }

    pub fn messaging(&self) -> Result<MessagingChannel> {
        Ok(
            MessagingChannel::new(self.pool.clone(), self.signer()?, self.relays.clone())
                .with_envelope(self.config.app_name.as_str(), self.config.message_type.as_str()),
        )
    }

    pub fn profiles(&self) -> ProfileService {
        ProfileService::new(self.pool.clone(), self.relays.clone(), self.config.metadata_timeout())
    }

    /// 自分のメタデータを購読
    pub async fn connect_pool(&self) -> Result<SubscriptionHandle> {
        let account = self.active_account()?;
        self.profiles().subscribe_metadata(&account.hex).await
    }

    pub async fn fetch_profile_metadata(&self, public_key: &str) -> Result<ProfileMetadata> {
        self.profiles().fetch_metadata(public_key).await
    }

    pub async fn contacts(&self, public_key: &str) -> Result<Vec<Contact>> {
        self.profiles().contacts(public_key).await
    }

    /// 接続中のアカウントを作成者としてポリシーを作成
    pub async fn create_policy(&self, draft: PolicyDraft) -> Result<CreatedPolicy> {
        let creator = self.active_account()?.hex.clone();
        self.policy_store()?.create_and_publish(draft, &creator).await
    }

    pub async fn list_policies(&self) -> Result<Vec<DecryptedPolicy>> {
        let account = self.active_account()?.hex.clone();
        self.policy_store()?.list_for_account(&account).await
    }

    /// メッセージを送信し、送信済みとして記録
    pub async fn send_message(
        &mut self,
        to: &str,
        plaintext: &str,
        on_ack: impl FnMut(&RelayStatus) + 'static,
    ) -> Result<PublishHandle> {
        let from = self.active_account()?.hex.clone();
        let to = keys::normalize_public_key(to)?;
        let handle = self.messaging()?.send(&from, &to, plaintext, on_ack).await?;

        self.add_own_message(OwnMessage {
            event_id: handle.event_id().to_string(),
            to,
            content: plaintext.to_string(),
            created_at: time::now(),
        })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::mock::MockRelayPool;
    use crate::signer::internal::InternalSigner;

    fn handle_with(signer: Option<Arc<InternalSigner>>) -> (CoreHandle, MockRelayPool) {
        let pool = MockRelayPool::with_relays(&["wss://a", "wss://b"]);
        let config = CoreConfig::default().with_relays(vec!["wss://a".into(), "wss://b".into()]);
        let mut handle = CoreHandle::init(config, Arc::new(pool.clone()));
        if let Some(signer) = signer {
            handle.set_signer(signer);
        }
        (handle, pool)
    }

    #[tokio::test]
    async fn test_connect_from_signer_and_argument() {
        let signer = Arc::new(InternalSigner::generate());
        let (mut handle, _) = handle_with(Some(signer.clone()));

        let account = handle.connect(None).await.unwrap();
        assert_eq!(account.hex, signer.public_key_hex());
        assert!(account.npub.starts_with("npub1"));
        assert_eq!(account.relays.len(), 2);

        let other = InternalSigner::generate().public_key_hex();
        let npub = keys::hex_to_npub(&other).unwrap();
        assert_eq!(handle.connect(Some(&npub)).await.unwrap().hex, other);
    }

    #[tokio::test]
    async fn test_connect_without_signer() {
        let (mut handle, _) = handle_with(None);
        assert!(matches!(handle.connect(None).await, Err(CoreError::ProviderUnavailable)));
        assert!(matches!(handle.policy_store(), Err(CoreError::ProviderUnavailable)));
        assert!(matches!(handle.messaging(), Err(CoreError::ProviderUnavailable)));
    }

    #[tokio::test]
    async fn test_account_updates_and_disconnect() {
        let (mut handle, _) = handle_with(Some(Arc::new(InternalSigner::generate())));
        assert!(matches!(
            handle.update_account(AccountUpdate::default()),
            Err(CoreError::NoActiveAccount)
        ));

        handle.connect(None).await.unwrap();
        handle
            .update_account(AccountUpdate {
                metadata: Some(serde_json::json!({ "name": "alice" })),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(handle.account().unwrap().metadata.as_ref().unwrap()["name"], "alice");

        handle.disconnect();
        assert!(handle.account().is_none());
        assert!(handle.relays().is_empty());
    }

    #[test]
    fn test_relay_management() {
        let (handle, _) = handle_with(None);
        assert!(handle.add_relay("wss://c"));
        assert!(!handle.add_relay("wss://a"));
        assert_eq!(handle.relays().len(), 3);

        handle.set_relays(vec!["wss://x".into()]);
        assert_eq!(handle.relays(), vec!["wss://x".to_string()]);

        handle.clear_relays();
        assert!(handle.relays().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_records_own_message() {
        let signer = Arc::new(InternalSigner::generate());
        let (mut handle, pool) = handle_with(Some(signer));
        handle.connect(None).await.unwrap();

        let to = InternalSigner::generate().public_key_hex();
        let report = handle.send_message(&to, "hi", |_| {}).await.unwrap().finish().await;
        assert_eq!(report.ok.len(), 2);

        let own = &handle.account().unwrap().own_messages;
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].to, to);
        assert_eq!(own[0].event_id, report.event_id);
        assert_eq!(pool.events("wss://a").len(), 1);
    }

    #[tokio::test]
    async fn test_connect_pool_receives_own_metadata() {
        let signer = Arc::new(InternalSigner::generate());
        let (mut handle, pool) = handle_with(Some(signer.clone()));
        handle.connect(None).await.unwrap();

        let mut sub = handle.connect_pool().await.unwrap();
        let metadata = EventBuilder::new(EventKind::Metadata, r#"{"name":"me"}"#)
            .sign_with_signer(&signer.public_key_hex(), signer.as_ref())
            .await
            .unwrap();
        pool.publish(&handle.relays(), &metadata).await.unwrap();

        assert_eq!(sub.next_event().await, Some(metadata));
    }
}

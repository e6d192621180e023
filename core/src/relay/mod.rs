//! Relayプール（publish / subscribe / list）の抽象と共通ハンドル

pub mod backoff;
pub mod message;
pub mod mock;
#[cfg(target_arch = "wasm32")]
pub mod connection;
#[cfg(target_arch = "wasm32")]
pub mod websocket;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CoreError, Result};
use crate::event::Event;
use crate::types::Filter;

/// Relayプールの抽象trait
/// WASM環境ではシングルスレッドのため、Send + Sync要件なし
#[async_trait(?Send)]
pub trait RelayPool {
    /// 全Relayへ送信。Relay毎の結果はハンドルから通知される
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishHandle>;

    /// 購読開始（キャンセルされるまで継続）
    async fn subscribe(&self, relays: &[String], filters: Vec<Filter>) -> Result<SubscriptionHandle>;

    /// 一括取得（全RelayのEOSEまで）
    async fn list(&self, relays: &[String], filters: Vec<Filter>) -> Result<Vec<Event>>;
}

/// publishを呼び出し、失敗は全Relay失敗として報告する（例外にしない）
pub async fn publish_reported(pool: &dyn RelayPool, relays: &[String], event: &Event) -> PublishHandle {
    match pool.publish(relays, event).await {
        Ok(handle) => handle,
        Err(e) => {
            log::warn!("Publish of {} failed before reaching relays: {}", event.id(), e);
            PublishHandle::rejected(event.id(), relays, &e.to_string())
        }
    }
}

/// Relay毎の送信結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    Ok { relay: String },
    Failed { relay: String, reason: String },
}

impl RelayStatus {
    pub fn relay(&self) -> &str {
        match self {
            RelayStatus::Ok { relay } | RelayStatus::Failed { relay, .. } => relay,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RelayStatus::Ok { .. })
    }
}

/// 送信結果の集計
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,
    pub ok: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    /// 失敗したRelayを PublishRejected として列挙
    pub fn errors(&self) -> Vec<CoreError> {
        self.failed
            .iter()
            .map(|(relay, reason)| CoreError::PublishRejected {
                event_id: self.event_id.clone(),
                relay: relay.clone(),
                reason: reason.clone(),
            })
            .collect()
    }

    pub fn all_failed(&self) -> bool {
        self.ok.is_empty()
    }
}

type StatusCallback = Box<dyn FnMut(&RelayStatus)>;

/// 送信ハンドル
///
/// Relayからの応答は届いた順に `next` で取り出す。コールバックは取り出した時点で呼ばれる。
/// 同じRelayから複数回応答が届くことがあるため、コールバックは冪等であること。
pub struct PublishHandle {
    rx: mpsc::UnboundedReceiver<RelayStatus>,
    on_ok: Option<StatusCallback>,
    on_failed: Option<StatusCallback>,
    report: PublishReport,
}

impl PublishHandle {
    pub fn new(event_id: impl Into<String>, rx: mpsc::UnboundedReceiver<RelayStatus>) -> Self {
        Self {
            rx,
            on_ok: None,
            on_failed: None,
            report: PublishReport {
                event_id: event_id.into(),
                ..Default::default()
            },
        }
    }

    /// 送信側とハンドルを作成
    pub fn channel(event_id: impl Into<String>) -> (mpsc::UnboundedSender<RelayStatus>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(event_id, rx))
    }

    /// 全Relay失敗として完了済みのハンドル
    pub fn rejected(event_id: &str, relays: &[String], reason: &str) -> Self {
        let (tx, handle) = Self::channel(event_id);
        for relay in relays {
            let _ = tx.send(RelayStatus::Failed {
                relay: relay.clone(),
                reason: reason.to_string(),
            });
        }
        handle
    }

    pub fn on_ok(mut self, callback: impl FnMut(&RelayStatus) + 'static) -> Self {
        self.on_ok = Some(Box::new(callback));
        self
    }

    pub fn on_failed(mut self, callback: impl FnMut(&RelayStatus) + 'static) -> Self {
        self.on_failed = Some(Box::new(callback));
        self
    }

    pub fn event_id(&self) -> &str {
        &self.report.event_id
    }

    /// 次の応答を待つ（全Relayの応答が揃うとNone）
    pub async fn next(&mut self) -> Option<RelayStatus> {
        let status = self.rx.recv().await?;
        self.observe(&status);
        Some(status)
    }

    /// 既に届いている応答のみ取り出す
    pub fn try_next(&mut self) -> Option<RelayStatus> {
        let status = self.rx.try_recv().ok()?;
        self.observe(&status);
        Some(status)
    }

    /// 全応答を待って集計
    pub async fn finish(mut self) -> PublishReport {
        while self.next().await.is_some() {}
        self.report
    }

    fn observe(&mut self, status: &RelayStatus) {
        match status {
            RelayStatus::Ok { relay } => {
                self.report.ok.push(relay.clone());
                if let Some(callback) = self.on_ok.as_mut() {
                    callback(status);
                }
            }
            RelayStatus::Failed { relay, reason } => {
                self.report.failed.push((relay.clone(), reason.clone()));
                if let Some(callback) = self.on_failed.as_mut() {
                    callback(status);
                }
            }
        }
    }
}

/// 購読で受け取るアイテム
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionItem {
    Event { relay: String, event: Event },
    Eose { relay: String },
}

struct CancelState {
    cancelled: Cell<bool>,
    on_cancel: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// 購読のキャンセル用ハンドル（複製可能）
#[derive(Clone)]
pub struct SubscriptionCanceller {
    inner: Rc<CancelState>,
}

impl SubscriptionCanceller {
    pub fn new(on_cancel: impl FnOnce() + 'static) -> Self {
        Self {
            inner: Rc::new(CancelState {
                cancelled: Cell::new(false),
                on_cancel: RefCell::new(Some(Box::new(on_cancel))),
            }),
        }
    }

    /// キャンセルしてRelay側の購読を解放する（2回目以降は何もしない）
    pub fn cancel(&self) {
        if self.inner.cancelled.replace(true) {
            return;
        }
        let on_cancel = self.inner.on_cancel.borrow_mut().take();
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }
}

/// 購読ハンドル。drop時にキャンセルされる
pub struct SubscriptionHandle {
    id: String,
    rx: mpsc::UnboundedReceiver<SubscriptionItem>,
    canceller: SubscriptionCanceller,
}

impl SubscriptionHandle {
    pub fn new(
        id: impl Into<String>,
        rx: mpsc::UnboundedReceiver<SubscriptionItem>,
        canceller: SubscriptionCanceller,
    ) -> Self {
        Self {
            id: id.into(),
            rx,
            canceller,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 次のアイテム。キャンセル後はNone
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        if self.canceller.is_cancelled() {
            return None;
        }
        let item = self.rx.recv().await?;
        if self.canceller.is_cancelled() {
            return None;
        }
        Some(item)
    }

    /// 次のイベント（EOSEは読み飛ばす）
    pub async fn next_event(&mut self) -> Option<Event> {
        while let Some(item) = self.next().await {
            if let SubscriptionItem::Event { event, .. } = item {
                return Some(event);
            }
        }
        None
    }

    /// キャンセルされるまでイベント毎にコールバックを呼ぶ
    pub async fn for_each_event(&mut self, mut callback: impl FnMut(Event)) {
        while let Some(event) = self.next_event().await {
            callback(event);
        }
    }

    pub fn canceller(&self) -> SubscriptionCanceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.canceller.cancel();
    }
}

/// 設定済みRelayの一覧（共有・可変）
///
/// 各操作の開始時に `snapshot` を取り、操作中の変更の影響を受けない。
#[derive(Debug, Clone, Default)]
pub struct RelaySet {
    inner: Arc<RwLock<Vec<String>>>,
}

impl RelaySet {
    pub fn new(relays: Vec<String>) -> Self {
        let set = Self::default();
        set.replace(relays);
        set
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Relayを追加（重複は無視）
    pub fn add(&self, url: impl Into<String>) -> bool {
        let url = url.into();
        let mut relays = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if relays.contains(&url) {
            return false;
        }
        relays.push(url);
        true
    }

    pub fn clear(&self) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn replace(&self, relays: Vec<String>) {
        let mut deduped: Vec<String> = Vec::with_capacity(relays.len());
        for relay in relays {
            if !deduped.contains(&relay) {
                deduped.push(relay);
            }
        }
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = deduped;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// 空でないスナップショットを取得
    pub fn require(&self) -> Result<Vec<String>> {
        let relays = self.snapshot();
        if relays.is_empty() {
            return Err(CoreError::NoRelays);
        }
        Ok(relays)
    }
}

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::relay::message::ClientMessage;
use crate::types::Filter;

/// 購読の状態
#[derive(Debug, Clone)]
pub struct ActiveSub {
    pub sub_id: String,
    pub filters: Vec<Filter>,
    pub relays: Vec<String>,
    pub eose_from: HashSet<String>,
}

impl ActiveSub {
    /// 全RelayからEOSEを受信したか
    pub fn is_complete(&self) -> bool {
        self.relays.iter().all(|relay| self.eose_from.contains(relay))
    }
}

/// 購読マネージャー
pub struct SubscriptionManager {
    active_subs: HashMap<String, ActiveSub>,
    prefix: String,
    next_id: u64,
}

impl SubscriptionManager {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            active_subs: HashMap::new(),
            prefix: prefix.into(),
            next_id: 0,
        }
    }

    /// 購読を開き、REQフレームを返す
    pub fn open(&mut self, relays: &[String], filters: Vec<Filter>) -> Result<(String, String)> {
        self.next_id += 1;
        let sub_id = format!("{}:{}", self.prefix, self.next_id);

        let req = ClientMessage::Req {
            sub_id: sub_id.clone(),
            filters: filters.clone(),
        }
        .to_json()?;

        self.active_subs.insert(
            sub_id.clone(),
            ActiveSub {
                sub_id: sub_id.clone(),
                filters,
                relays: relays.to_vec(),
                eose_from: HashSet::new(),
            },
        );

        Ok((sub_id, req))
    }

    /// EOSE受信を記録。全Relayから揃ったらtrue
    pub fn mark_eose(&mut self, sub_id: &str, relay: &str) -> bool {
        match self.active_subs.get_mut(sub_id) {
            Some(sub) => {
                sub.eose_from.insert(relay.to_string());
                sub.is_complete()
            }
            None => false,
        }
    }

    /// Relayが落ちた場合はEOSE扱いにする
    pub fn mark_relay_gone(&mut self, relay: &str) -> Vec<String> {
        let mut completed = Vec::new();
        for sub in self.active_subs.values_mut() {
            if sub.relays.iter().any(|r| r == relay) && sub.eose_from.insert(relay.to_string()) && sub.is_complete() {
                completed.push(sub.sub_id.clone());
            }
        }
        completed
    }

    pub fn get(&self, sub_id: &str) -> Option<&ActiveSub> {
        self.active_subs.get(sub_id)
    }

    /// アクティブな購読を取得
    pub fn get_active_subs(&self) -> Vec<&ActiveSub> {
        self.active_subs.values().collect()
    }

    /// 購読をクローズし、CLOSEフレームを返す
    pub fn close(&mut self, sub_id: &str) -> Option<(ActiveSub, String)> {
        let sub = self.active_subs.remove(sub_id)?;
        let close = ClientMessage::Close {
            sub_id: sub_id.to_string(),
        }
        .to_json()
        .ok()?;
        Some((sub, close))
    }
}

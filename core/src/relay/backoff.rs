/// 切断中の接続の扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// 接続済み、または接続中
    Usable,
    /// 再接続を試みてよい
    Reconnect,
    /// バックオフ中（残り秒数）
    Backoff { retry_in: u64 },
}

/// 指数バックオフ管理（秒）
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current_delay: u64,
    max_delay: u64,
    min_delay: u64,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self {
            current_delay: 1,
            max_delay: 60,
            min_delay: 1,
        }
    }

    pub fn current_delay(&self) -> u64 {
        self.current_delay
    }

    pub fn next_delay(&mut self) -> u64 {
        let delay = self.current_delay;
        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.min_delay;
    }

    /// 前回の試行から十分に経過したか
    pub fn is_due(&self, last_attempt: u64, now: u64) -> bool {
        now.saturating_sub(last_attempt) >= self.current_delay
    }

    /// 接続状態と前回の試行時刻から、今その接続を使えるか判定
    pub fn availability(&self, disconnected: bool, last_attempt: u64, now: u64) -> Availability {
        if !disconnected {
            return Availability::Usable;
        }
        if self.is_due(last_attempt, now) {
            Availability::Reconnect
        } else {
            let elapsed = now.saturating_sub(last_attempt);
            Availability::Backoff {
                retry_in: self.current_delay - elapsed,
            }
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

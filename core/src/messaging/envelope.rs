//! メッセージのメタデータ形式 `#app:..#type:..#message:..`
//!
//! キーと値はそれぞれパーセントエンコードされ、`message` の値はJSON文書。

use std::collections::BTreeMap;

use serde_json::Value;

const APP_KEY: &str = "app";
const TYPE_KEY: &str = "type";
const MESSAGE_KEY: &str = "message";

/// デコード済みのメッセージ
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub app: String,
    pub message_type: String,
    pub message: Value,
    /// 上記以外のキー
    pub extra: BTreeMap<String, String>,
}

impl MessageEnvelope {
    pub fn new(app: impl Into<String>, message_type: impl Into<String>, message: Value) -> Self {
        Self {
            app: app.into(),
            message_type: message_type.into(),
            message,
            extra: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> String {
        let message = self.message.to_string();
        let mut out = String::new();
        push_segment(&mut out, APP_KEY, &self.app);
        push_segment(&mut out, TYPE_KEY, &self.message_type);
        push_segment(&mut out, MESSAGE_KEY, &message);
        for (key, value) in &self.extra {
            push_segment(&mut out, key, value);
        }
        out
    }

    /// メタデータ形式でなければNone（呼び出し側は平文として扱う）
    pub fn decode(input: &str) -> Option<Self> {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();

        for segment in input.split('#').filter(|s| !s.is_empty()) {
            let Some((key, value)) = segment.split_once(':') else {
                continue;
            };
            let key = urlencoding::decode(key).ok()?;
            let value = urlencoding::decode(value).ok()?;
            fields.insert(key.into_owned(), value.into_owned());
        }
        if fields.is_empty() {
            return None;
        }

        let message = serde_json::from_str(&fields.remove(MESSAGE_KEY)?).ok()?;
        Some(Self {
            app: fields.remove(APP_KEY).unwrap_or_default(),
            message_type: fields.remove(TYPE_KEY).unwrap_or_default(),
            message,
            extra: fields,
        })
    }
}

fn push_segment(out: &mut String, key: &str, value: &str) {
    out.push('#');
    out.push_str(&urlencoding::encode(key));
    out.push(':');
    out.push_str(&urlencoding::encode(value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_keeps_message() {
        let data = json!({
            "name": "vault #1",
            "descriptor": "wsh(multi(2,a:b,c))",
            "note": "50% off & more"
        });
        let envelope = MessageEnvelope::new("coinstr", "policy", data.clone());
        let encoded = envelope.encode();

        assert!(encoded.starts_with("#app:coinstr#type:policy#message:"));
        assert_eq!(encoded.matches('#').count(), 3);

        let decoded = MessageEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded.message, data);
        assert_eq!(decoded.app, "coinstr");
        assert_eq!(decoded.message_type, "policy");
    }

    #[test]
    fn test_decodes_browser_encoding() {
        // encodeURIComponent は `(` `)` をエンコードしない
        let decoded = MessageEnvelope::decode("#app:coinstr#type:policy#message:%22wsh(x)%22").unwrap();
        assert_eq!(decoded.message, json!("wsh(x)"));
    }

    #[test]
    fn test_not_metadata() {
        assert_eq!(MessageEnvelope::decode(""), None);
        assert_eq!(MessageEnvelope::decode("###"), None);
        assert_eq!(MessageEnvelope::decode("hello there"), None);
        assert_eq!(MessageEnvelope::decode("#app:coinstr#message:not%20json"), None);
        assert_eq!(MessageEnvelope::decode("#app:coinstr#type:policy"), None);
    }

    #[test]
    fn test_extra_keys_preserved() {
        let decoded = MessageEnvelope::decode("#message:1#room:abc").unwrap();
        assert_eq!(decoded.message, json!(1));
        assert_eq!(decoded.app, "");
        assert_eq!(decoded.extra.get("room").map(String::as_str), Some("abc"));
    }
}

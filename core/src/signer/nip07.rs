use async_trait::async_trait;
use js_sys::{Object, Reflect};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use super::Signer;
use crate::error::{CoreError, Result};
use crate::event::Event;

/// NIP-07 Signer (window.nostr)
pub struct Nip07Signer;

impl Nip07Signer {
    /// window.nostrオブジェクトを取得
    fn get_nostr() -> Result<Object> {
        let window = web_sys::window().ok_or_else(|| CoreError::Other("No window object".to_string()))?;
        let nostr = Reflect::get(&window, &JsValue::from_str("nostr"))?;

        if nostr.is_undefined() {
            return Err(CoreError::ProviderUnavailable);
        }

        Ok(nostr.into())
    }

    /// window.nostr.nip04オブジェクトを取得
    fn get_nip04() -> Result<Object> {
        let nostr = Self::get_nostr()?;
        let nip04 = Reflect::get(&nostr, &JsValue::from_str("nip04"))?;

        if nip04.is_undefined() {
            return Err(CoreError::SignerError("window.nostr.nip04 is undefined".to_string()));
        }

        Ok(nip04.into())
    }

    /// メソッド呼び出し
    async fn call_method(target: &Object, method: &str, args: &[JsValue]) -> Result<JsValue> {
        let func = Reflect::get(target, &JsValue::from_str(method))?;
        if !func.is_function() {
            return Err(CoreError::SignerError(format!("{} is not supported by the extension", method)));
        }
        let func = func.unchecked_ref::<js_sys::Function>();

        let promise = match args.len() {
            0 => func.call0(target)?,
            1 => func.call1(target, &args[0])?,
            2 => func.call2(target, &args[0], &args[1])?,
            _ => return Err(CoreError::Other("Too many arguments".to_string())),
        };

        let result = JsFuture::from(js_sys::Promise::resolve(&promise)).await?;
        Ok(result)
    }

    fn expect_string(value: JsValue, what: &str) -> Result<String> {
        value
            .as_string()
            .ok_or_else(|| CoreError::SignerError(format!("{} is not a string", what)))
    }
}

#[async_trait(?Send)]
impl Signer for Nip07Signer {
    fn is_available(&self) -> bool {
        if let Some(window) = web_sys::window() {
            if let Ok(nostr) = Reflect::get(&window, &JsValue::from_str("nostr")) {
                return !nostr.is_undefined();
            }
        }
        false
    }

    async fn get_public_key(&self) -> Result<String> {
        let nostr = Self::get_nostr()?;
        let result = Self::call_method(&nostr, "getPublicKey", &[]).await?;
        Self::expect_string(result, "Public key")
    }

    async fn sign_event(&self, unsigned: &Event) -> Result<String> {
        let nostr = Self::get_nostr()?;
        let event_obj = js_sys::JSON::parse(&unsigned.to_json())?;

        let result = Self::call_method(&nostr, "signEvent", &[event_obj]).await?;

        let sig = Reflect::get(&result, &JsValue::from_str("sig"))?;
        Self::expect_string(sig, "Signature")
    }

    async fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> Result<String> {
        let nip04 = Self::get_nip04()?;
        let args = [JsValue::from_str(pubkey), JsValue::from_str(plaintext)];
        let result = Self::call_method(&nip04, "encrypt", &args).await?;
        Self::expect_string(result, "Ciphertext")
    }

    async fn nip04_decrypt(&self, pubkey: &str, ciphertext: &str) -> Result<String> {
        let nip04 = Self::get_nip04()?;
        let args = [JsValue::from_str(pubkey), JsValue::from_str(ciphertext)];
        let result = Self::call_method(&nip04, "decrypt", &args).await?;
        Self::expect_string(result, "Plaintext")
    }
}

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Bybit v5 request signer.
#[derive(Clone)]
pub struct BybitAuth {
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for BybitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitAuth")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl BybitAuth {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self { api_key, api_secret }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Sign a REST request: `timestamp + api_key + recv_window + payload`,
    /// where payload is the JSON body (POST) or the query string (GET).
    pub fn sign_request(&self, timestamp_ms: i64, recv_window: u64, payload: &str) -> String {
        self.hmac_hex(&format!("{}{}{}{}", timestamp_ms, self.api_key, recv_window, payload))
    }

    /// Arguments for the private websocket `auth` op: `[api_key, expires, signature]`.
    pub fn ws_auth_args(&self, expires_ms: i64) -> [String; 3] {
        let signature = self.hmac_hex(&format!("GET/realtime{}", expires_ms));
        [self.api_key.clone(), expires_ms.to_string(), signature]
    }

    fn hmac_hex(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

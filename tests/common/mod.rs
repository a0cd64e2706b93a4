use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

pub const KEY_ID: &str = "integration-key";
const SECRET: &[u8] = b"abcdefghijklmnopqrstuvwx";
// base64url of SECRET, no padding
const SECRET_B64: &str = "YWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4";

pub fn jwks() -> JwkSet {
    serde_json::from_value(json!({
        "keys": [{ "kty": "oct", "kid": KEY_ID, "k": SECRET_B64 }]
    }))
    .unwrap()
}

pub fn sign(claims: Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(KEY_ID.to_string());
    encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

pub fn expires_in_an_hour() -> i64 {
    chrono::Utc::now().timestamp() + 3600
}

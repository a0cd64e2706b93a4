/*!
 * 身份认证模块
 *
 * - `AuthConfigAssembler`：把配置快照映射为 `AuthConfig`，纯函数、不做任何校验
 * - `JwtValidator`：请求期的 OIDC JWT 校验中间件，是受众/签发者/JWKS 是否充分的唯一校验方
 *
 * 启动阶段只负责组装参数：例如 `enabled=true` 而 `issuer` 为空也会原样通过，
 * 由请求期的校验决定是否拒绝。
 */

use crate::config::{keys, Configuration};
use crate::error::{AppError, AppResult};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

/// JWT 校验参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthConfig {
    pub enabled: bool,
    pub audience: String,
    pub issuer: String,
    pub jwks_uri: String,
    /// 需要输出到请求日志中的声明
    pub log_fields: BTreeSet<String>,
    /// 角色所在的声明路径（点分）
    pub roles_claim: String,
    /// 用户名所在的声明路径，为空表示不提取
    pub username_claim: String,
}

pub struct AuthConfigAssembler;

impl AuthConfigAssembler {
    /// 每个字段只来自一个固定配置键
    pub fn build(cfg: &Configuration) -> AuthConfig {
        AuthConfig {
            enabled: cfg.get_bool(keys::OIDC_ENABLED),
            audience: cfg.get_string(keys::OIDC_AUDIENCE),
            issuer: cfg.get_string(keys::OIDC_ISSUER),
            jwks_uri: cfg.get_string(keys::OIDC_JWKS_URI),
            log_fields: cfg
                .get_string_slice(keys::OIDC_LOG_FIELDS)
                .into_iter()
                .collect(),
            roles_claim: cfg.get_string(keys::OIDC_ROLES_CLAIM),
            username_claim: cfg.get_string(keys::OIDC_USERNAME_CLAIM),
        }
    }
}

/// 通过认证的调用方
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedSubject {
    pub subject: Option<String>,
    pub username: Option<String>,
    pub roles: Vec<String>,
}

/// 按点分路径读取声明，空路径返回 `None`
pub fn claim_at<'a>(claims: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(claims, |value, segment| value.get(segment))
}

/// 角色声明可以是字符串数组，也可以是空格分隔的字符串（OAuth scope 风格）
pub fn roles_from_claims(claims: &Value, path: &str) -> Vec<String> {
    match claim_at(claims, path) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// 拉取 JWKS 的整体超时（连接 + 读取响应体）
pub const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// 两次 JWKS 拉取之间的最小间隔，未知 kid 的请求在间隔内不会再次触发拉取
pub const JWKS_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// 请求期 JWT 校验器
pub struct JwtValidator {
    config: AuthConfig,
    http: reqwest::Client,
    fetch_timeout: Duration,
    min_refresh_interval: Duration,
    jwks: RwLock<Option<JwkSet>>,
    /// 上一次拉取的开始时间；持有该锁期间只有一个请求在拉取
    last_refresh: Mutex<Option<Instant>>,
}

impl JwtValidator {
    pub fn new(config: AuthConfig) -> Self {
        Self::with_cache(config, None)
    }

    /// 使用预先加载的 JWKS，未知 kid 时仍会尝试从 `jwks_uri` 刷新
    pub fn with_jwks(config: AuthConfig, jwks: JwkSet) -> Self {
        Self::with_cache(config, Some(jwks))
    }

    fn with_cache(config: AuthConfig, jwks: Option<JwkSet>) -> Self {
        Self {
            config,
            http: http_client(JWKS_FETCH_TIMEOUT),
            fetch_timeout: JWKS_FETCH_TIMEOUT,
            min_refresh_interval: JWKS_MIN_REFRESH_INTERVAL,
            jwks: RwLock::new(jwks),
            last_refresh: Mutex::new(None),
        }
    }

    /// 调整 JWKS 拉取超时与最小刷新间隔
    pub fn with_fetch_limits(mut self, timeout: Duration, min_refresh_interval: Duration) -> Self {
        self.http = http_client(timeout);
        self.fetch_timeout = timeout;
        self.min_refresh_interval = min_refresh_interval;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub async fn authenticate(&self, token: &str) -> AppResult<AuthenticatedSubject> {
        let header = decode_header(token)?;
        let jwk = self.find_key(header.kid.as_deref()).await?;
        let key = DecodingKey::from_jwk(&jwk)?;

        // 允许的算法只由密钥决定，令牌头里的 alg 必须落在其中
        let algorithms = allowed_algorithms(&jwk);
        let Some(first) = algorithms.first().copied() else {
            return Err(AppError::Auth("JWKS key cannot verify signatures".to_string()));
        };
        let mut validation = Validation::new(first);
        validation.algorithms = algorithms;
        if self.config.audience.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&[self.config.audience.as_str()]);
        }
        if !self.config.issuer.is_empty() {
            validation.set_issuer(&[self.config.issuer.as_str()]);
        }

        let claims = decode::<Value>(token, &key, &validation)?.claims;

        let subject = AuthenticatedSubject {
            subject: claims.get("sub").and_then(Value::as_str).map(str::to_string),
            username: claim_at(&claims, &self.config.username_claim)
                .and_then(Value::as_str)
                .map(str::to_string),
            roles: roles_from_claims(&claims, &self.config.roles_claim),
        };

        if !self.config.log_fields.is_empty() {
            let fields: serde_json::Map<String, Value> = self
                .config
                .log_fields
                .iter()
                .filter_map(|name| claim_at(&claims, name).map(|v| (name.clone(), v.clone())))
                .collect();
            let claims = serde_json::Value::Object(fields);
            debug!(
                subject = ?subject.subject,
                claims = %claims,
                "authenticated request"
            );
        }

        Ok(subject)
    }

    async fn find_key(&self, kid: Option<&str>) -> AppResult<Jwk> {
        if let Some(jwk) = self.cached_key(kid).await {
            return Ok(jwk);
        }
        self.refresh_jwks().await?;
        self.cached_key(kid)
            .await
            .ok_or_else(|| AppError::Auth("no JWKS key matches token".to_string()))
    }

    async fn cached_key(&self, kid: Option<&str>) -> Option<Jwk> {
        let guard = self.jwks.read().await;
        let set = guard.as_ref()?;
        match kid {
            Some(kid) => set.find(kid).cloned(),
            None if set.keys.len() == 1 => set.keys.first().cloned(),
            None => None,
        }
    }

    /// 并发的刷新在 `last_refresh` 上排队，排在后面的看到刚完成的拉取后直接返回
    async fn refresh_jwks(&self) -> AppResult<()> {
        if self.config.jwks_uri.is_empty() {
            return Err(AppError::Auth("JWKS URI is not configured".to_string()));
        }

        let mut last_refresh = self.last_refresh.lock().await;
        if let Some(at) = *last_refresh {
            if at.elapsed() < self.min_refresh_interval {
                debug!(uri = %self.config.jwks_uri, "JWKS refreshed recently, skipping fetch");
                return Ok(());
            }
        }
        // 失败的拉取同样计入间隔
        *last_refresh = Some(Instant::now());

        let set: JwkSet = self
            .http
            .get(&self.config.jwks_uri)
            .timeout(self.fetch_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(uri = %self.config.jwks_uri, keys = set.keys.len(), "JWKS refreshed");
        *self.jwks.write().await = Some(set);
        Ok(())
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            // 每个请求仍单独设置超时
            warn!(error = %e, "failed to build JWKS client, using defaults");
            reqwest::Client::new()
        })
}

/// 密钥声明了 `alg` 时只接受该算法，否则按密钥类型给出同族算法
fn allowed_algorithms(jwk: &Jwk) -> Vec<Algorithm> {
    if let Some(alg) = &jwk.common.key_algorithm {
        return signing_algorithm(alg).into_iter().collect();
    }
    match &jwk.algorithm {
        AlgorithmParameters::OctetKey(_) => {
            vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512]
        }
        AlgorithmParameters::RSA(_) => vec![
            Algorithm::RS256,
            Algorithm::RS384,
            Algorithm::RS512,
            Algorithm::PS256,
            Algorithm::PS384,
            Algorithm::PS512,
        ],
        AlgorithmParameters::EllipticCurve(params) => match params.curve {
            EllipticCurve::P256 => vec![Algorithm::ES256],
            EllipticCurve::P384 => vec![Algorithm::ES384],
            _ => Vec::new(),
        },
        AlgorithmParameters::OctetKeyPair(_) => vec![Algorithm::EdDSA],
    }
}

fn signing_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        // 加密用算法
        _ => None,
    }
}

/// 认证方案名不区分大小写
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .filter(|t| !t.is_empty())
}

/// 认证中间件，认证关闭时直接放行
pub async fn require_jwt(
    State(validator): State<Arc<JwtValidator>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !validator.config().enabled {
        return Ok(next.run(request).await);
    }

    let token = bearer_token(request.headers())
        .ok_or_else(|| AppError::Auth("missing bearer token".to_string()))?
        .to_string();

    let subject = validator.authenticate(&token).await.map_err(|e| {
        warn!(error = %e, path = %request.uri().path(), "rejected unauthenticated request");
        e
    })?;

    request.extensions_mut().insert(subject);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, FileValues, FlagValues};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;
    use std::collections::HashMap;

    const SECRET: &[u8] = b"abcdefghijklmnopqrstuvwx";
    const SECRET_B64: &str = "YWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4";

    fn base_config() -> Configuration {
        ConfigResolver::with_service_defaults().resolve(
            &FlagValues::new(),
            &HashMap::new(),
            &FileValues::default(),
        )
    }

    fn jwks() -> JwkSet {
        serde_json::from_value(json!({
            "keys": [{ "kty": "oct", "kid": "test-key", "k": SECRET_B64 }]
        }))
        .unwrap()
    }

    fn token(claims: Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("test-key".to_string());
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn build_reads_defaults() {
        let auth = AuthConfigAssembler::build(&base_config());
        assert!(auth.enabled);
        assert_eq!(auth.audience, "");
        assert_eq!(auth.issuer, "");
        assert_eq!(auth.jwks_uri, "");
        assert!(auth.log_fields.is_empty());
        assert_eq!(auth.roles_claim, "claim");
        assert_eq!(auth.username_claim, "");
    }

    #[test]
    fn build_is_deterministic() {
        let cfg = base_config().with_override(keys::OIDC_AUDIENCE, "serverservice");
        assert_eq!(AuthConfigAssembler::build(&cfg), AuthConfigAssembler::build(&cfg.clone()));
    }

    #[test]
    fn changing_one_key_changes_one_field() {
        let cfg = base_config();
        let before = AuthConfigAssembler::build(&cfg);

        let cases: Vec<(&str, crate::config::Value)> = vec![
            (keys::OIDC_ENABLED, false.into()),
            (keys::OIDC_AUDIENCE, "aud".into()),
            (keys::OIDC_ISSUER, "iss".into()),
            (keys::OIDC_JWKS_URI, "https://jwks".into()),
            (keys::OIDC_LOG_FIELDS, vec!["email".to_string()].into()),
            (keys::OIDC_ROLES_CLAIM, "scope".into()),
            (keys::OIDC_USERNAME_CLAIM, "email".into()),
        ];

        for (key, value) in cases {
            let after = AuthConfigAssembler::build(&cfg.with_override(key, value));
            let mut expected = before.clone();
            match key {
                keys::OIDC_ENABLED => expected.enabled = false,
                keys::OIDC_AUDIENCE => expected.audience = "aud".to_string(),
                keys::OIDC_ISSUER => expected.issuer = "iss".to_string(),
                keys::OIDC_JWKS_URI => expected.jwks_uri = "https://jwks".to_string(),
                keys::OIDC_LOG_FIELDS => {
                    expected.log_fields = ["email".to_string()].into_iter().collect()
                }
                keys::OIDC_ROLES_CLAIM => expected.roles_claim = "scope".to_string(),
                keys::OIDC_USERNAME_CLAIM => expected.username_claim = "email".to_string(),
                _ => unreachable!(),
            }
            assert_eq!(after, expected, "key {key}");
        }
    }

    #[test]
    fn enabled_without_issuer_is_not_rejected() {
        let cfg = base_config().with_override(keys::OIDC_ISSUER, "");
        let auth = AuthConfigAssembler::build(&cfg);
        assert!(auth.enabled);
        assert!(auth.issuer.is_empty());
    }

    #[test]
    fn claim_paths() {
        let claims = json!({
            "sub": "u1",
            "realm": { "roles": ["admin", "reader"] },
            "scope": "read write",
        });
        assert_eq!(claim_at(&claims, "sub"), Some(&json!("u1")));
        assert_eq!(claim_at(&claims, "realm.missing"), None);
        assert_eq!(claim_at(&claims, ""), None);
        assert_eq!(roles_from_claims(&claims, "realm.roles"), vec!["admin", "reader"]);
        assert_eq!(roles_from_claims(&claims, "scope"), vec!["read", "write"]);
        assert!(roles_from_claims(&claims, "sub.nested").is_empty());
    }

    #[tokio::test]
    async fn authenticate_extracts_roles_and_username() {
        let mut auth = AuthConfigAssembler::build(&base_config());
        auth.audience = "serverservice".to_string();
        auth.issuer = "https://issuer.example".to_string();
        auth.roles_claim = "realm.roles".to_string();
        auth.username_claim = "email".to_string();
        let validator = JwtValidator::with_jwks(auth, jwks());

        let subject = validator
            .authenticate(&token(json!({
                "sub": "user-1",
                "aud": "serverservice",
                "iss": "https://issuer.example",
                "exp": exp(),
                "email": "user@example.com",
                "realm": { "roles": ["admin"] },
            })))
            .await
            .unwrap();

        assert_eq!(subject.subject.as_deref(), Some("user-1"));
        assert_eq!(subject.username.as_deref(), Some("user@example.com"));
        assert_eq!(subject.roles, vec!["admin"]);
    }

    #[tokio::test]
    async fn empty_username_claim_omits_username() {
        let validator = JwtValidator::with_jwks(AuthConfigAssembler::build(&base_config()), jwks());
        let subject = validator
            .authenticate(&token(json!({ "sub": "user-1", "exp": exp(), "email": "x@y" })))
            .await
            .unwrap();
        assert_eq!(subject.username, None);
    }

    #[tokio::test]
    async fn wrong_audience_is_rejected() {
        let mut auth = AuthConfigAssembler::build(&base_config());
        auth.audience = "serverservice".to_string();
        let validator = JwtValidator::with_jwks(auth, jwks());

        let err = validator
            .authenticate(&token(json!({ "sub": "u", "aud": "other", "exp": exp() })))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Jwt(_)));
    }

    #[tokio::test]
    async fn unknown_key_without_jwks_uri_is_rejected() {
        let validator = JwtValidator::new(AuthConfigAssembler::build(&base_config()));
        let err = validator
            .authenticate(&token(json!({ "sub": "u", "exp": exp() })))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        use axum::http::HeaderValue;

        let cases = [
            ("Bearer abc", Some("abc")),
            ("bearer abc", Some("abc")),
            ("BEARER  abc ", Some("abc")),
            ("Basic abc", None),
            ("Bearer ", None),
            ("Bearerabc", None),
        ];
        for (raw, expected) in cases {
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, HeaderValue::from_static(raw));
            assert_eq!(bearer_token(&headers), expected, "header {raw:?}");
        }
    }

    #[tokio::test]
    async fn key_algorithm_overrides_token_header() {
        let pinned: JwkSet = serde_json::from_value(json!({
            "keys": [{ "kty": "oct", "kid": "test-key", "alg": "HS256", "k": SECRET_B64 }]
        }))
        .unwrap();
        let validator = JwtValidator::with_jwks(AuthConfigAssembler::build(&base_config()), pinned);

        let mut header = Header::new(Algorithm::HS384);
        header.kid = Some("test-key".to_string());
        let hs384 = encode(
            &header,
            &json!({ "sub": "u", "exp": exp() }),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let err = validator.authenticate(&hs384).await.unwrap_err();
        assert!(matches!(err, AppError::Jwt(_)));

        // same secret, algorithm the key allows
        validator
            .authenticate(&token(json!({ "sub": "u", "exp": exp() })))
            .await
            .unwrap();
    }

    fn remote_config(uri: String) -> AuthConfig {
        let mut auth = AuthConfigAssembler::build(&base_config());
        auth.jwks_uri = uri;
        auth
    }

    /// JWKS 端点返回空密钥集，并统计被请求的次数
    async fn counting_jwks_endpoint() -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        use axum::{routing::get, Json, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/jwks",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "keys": [] }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/jwks"), hits)
    }

    #[tokio::test]
    async fn stalled_jwks_endpoint_times_out() {
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let validator = JwtValidator::new(remote_config(format!("http://{addr}/jwks")))
            .with_fetch_limits(Duration::from_millis(200), JWKS_MIN_REFRESH_INTERVAL);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            validator.authenticate(&token(json!({ "sub": "u", "exp": exp() }))),
        )
        .await
        .expect("JWKS fetch should give up on its own");
        assert!(matches!(result, Err(AppError::HttpClient(_))));
    }

    #[tokio::test]
    async fn unknown_kids_share_one_jwks_fetch() {
        use std::sync::atomic::Ordering;

        let (uri, hits) = counting_jwks_endpoint().await;
        let validator = Arc::new(JwtValidator::new(remote_config(uri)));
        let token = token(json!({ "sub": "u", "exp": exp() }));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let validator = validator.clone();
            let token = token.clone();
            tasks.spawn(async move { validator.authenticate(&token).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(matches!(result.unwrap(), Err(AppError::Auth(_))));
        }
        for _ in 0..5 {
            assert!(validator.authenticate(&token).await.is_err());
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn jwks_is_refetched_once_the_interval_passes() {
        use std::sync::atomic::Ordering;

        let (uri, hits) = counting_jwks_endpoint().await;
        let validator = JwtValidator::new(remote_config(uri))
            .with_fetch_limits(JWKS_FETCH_TIMEOUT, Duration::ZERO);
        let token = token(json!({ "sub": "u", "exp": exp() }));

        assert!(validator.authenticate(&token).await.is_err());
        assert!(validator.authenticate(&token).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

/*!
 * 配置解析模块
 *
 * 将命令行参数、环境变量、配置文件与编译期默认值合并为一份不可变的 `Configuration` 快照。
 * 优先级：显式参数 > 环境变量 > 配置文件 > 默认值。
 *
 * 快照在进程启动时生成一次，之后通过引用显式传递给各组件，不存在全局可变配置。
 */

use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// 环境变量前缀，`db.uri` 对应 `SERVERSERVICE_DB_URI`
pub const ENV_PREFIX: &str = "SERVERSERVICE";

/// 已知的配置键
pub mod keys {
    pub const LISTEN: &str = "listen";
    pub const DB_URI: &str = "db.uri";
    pub const DB_PROBE_TIMEOUT: &str = "db.probe_timeout";
    pub const LOGGING_DEBUG: &str = "logging.debug";
    pub const LOGGING_FILE: &str = "logging.file";
    pub const OIDC_ENABLED: &str = "oidc.enabled";
    pub const OIDC_AUDIENCE: &str = "oidc.audience";
    pub const OIDC_ISSUER: &str = "oidc.issuer";
    pub const OIDC_JWKS_URI: &str = "oidc.jwksuri";
    pub const OIDC_LOG_FIELDS: &str = "oidc.log";
    pub const OIDC_ROLES_CLAIM: &str = "oidc.claims.roles";
    pub const OIDC_USERNAME_CLAIM: &str = "oidc.claims.username";
}

/// 配置值：标量或字符串列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Str(String),
    List(Vec<String>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::List(value)
    }
}

impl Value {
    fn as_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s.clone(),
            Value::List(items) => items.join(","),
        }
    }

    fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => parse_bool(s),
            Value::List(_) => false,
        }
    }

    fn as_list(&self) -> Vec<String> {
        match self {
            Value::List(items) => items.clone(),
            Value::Str(s) => s
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect(),
            Value::Bool(b) => vec![b.to_string()],
        }
    }
}

/// 接受 1/t/T/TRUE/true/True，其余写法一律视为 false
fn parse_bool(raw: &str) -> bool {
    matches!(raw, "1" | "t" | "T" | "TRUE" | "true" | "True")
}

/// 环境变量来源
pub trait EnvSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// 读取当前进程的环境变量
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// 命令行上显式给出的参数，键为参数名（不含 `--`）
pub type FlagValues = BTreeMap<String, Value>;

/// 从 TOML 配置文件展开得到的点分键值
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileValues(BTreeMap<String, Value>);

impl FileValues {
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> AppResult<Self> {
        let table: toml::Table =
            toml::from_str(content).map_err(|e| AppError::Config(e.to_string()))?;
        let mut values = BTreeMap::new();
        flatten_table("", &table, &mut values);
        Ok(FileValues(values))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

fn flatten_table(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, Value>) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            toml::Value::Table(inner) => flatten_table(&key, inner, out),
            toml::Value::Boolean(b) => {
                out.insert(key, Value::Bool(*b));
            }
            toml::Value::String(s) => {
                out.insert(key, Value::Str(s.clone()));
            }
            toml::Value::Array(items) => {
                let list = items
                    .iter()
                    .map(|item| match item {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                out.insert(key, Value::List(list));
            }
            other => {
                out.insert(key, Value::Str(other.to_string()));
            }
        }
    }
}

/// 解析完成的配置快照，创建后不可修改
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Configuration {
    values: BTreeMap<String, Value>,
}

impl Configuration {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// 缺失的键读为空字符串
    pub fn get_string(&self, key: &str) -> String {
        self.get(key).map(Value::as_string).unwrap_or_default()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).map(Value::as_bool).unwrap_or(false)
    }

    pub fn get_string_slice(&self, key: &str) -> Vec<String> {
        self.get(key).map(Value::as_list).unwrap_or_default()
    }

    /// 数值键无法解析时返回 `None`，由调用方决定回退值
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_string().trim().parse().ok())
    }

    /// 返回替换了单个键的新快照，原快照不变
    pub fn with_override(&self, key: &str, value: impl Into<Value>) -> Configuration {
        let mut values = self.values.clone();
        values.insert(key.to_string(), value.into());
        Configuration { values }
    }
}

/// 配置解析器
///
/// 在解析前通过 `bind` 声明参数与配置键的对应关系，
/// 再由 `resolve` 按优先级合并所有来源。
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    env_prefix: String,
    defaults: BTreeMap<String, Value>,
    bindings: BTreeMap<String, String>,
}

impl ConfigResolver {
    pub fn new(env_prefix: impl Into<String>) -> Self {
        Self {
            env_prefix: env_prefix.into(),
            defaults: BTreeMap::new(),
            bindings: BTreeMap::new(),
        }
    }

    /// 带有服务全部默认值与参数绑定的解析器
    pub fn with_service_defaults() -> Self {
        let mut resolver = Self::new(ENV_PREFIX);
        resolver
            .set_default(keys::LISTEN, "0.0.0.0:8000")
            .set_default(keys::DB_URI, "")
            .set_default(keys::DB_PROBE_TIMEOUT, "5")
            .set_default(keys::LOGGING_DEBUG, false)
            .set_default(keys::LOGGING_FILE, "")
            .set_default(keys::OIDC_ENABLED, true)
            .set_default(keys::OIDC_AUDIENCE, "")
            .set_default(keys::OIDC_ISSUER, "")
            .set_default(keys::OIDC_JWKS_URI, "")
            .set_default(keys::OIDC_LOG_FIELDS, Vec::<String>::new())
            .set_default(keys::OIDC_ROLES_CLAIM, "claim")
            .set_default(keys::OIDC_USERNAME_CLAIM, "");

        resolver
            .bind("listen", keys::LISTEN)
            .bind("debug", keys::LOGGING_DEBUG)
            .bind("oidc", keys::OIDC_ENABLED)
            .bind("oidc-aud", keys::OIDC_AUDIENCE)
            .bind("oidc-issuer", keys::OIDC_ISSUER)
            .bind("oidc-jwksuri", keys::OIDC_JWKS_URI)
            .bind("oidc-roles-claim", keys::OIDC_ROLES_CLAIM)
            .bind("oidc-username-claim", keys::OIDC_USERNAME_CLAIM);
        resolver
    }

    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.defaults.insert(key.to_string(), value.into());
        self
    }

    /// 声明参数 `flag` 存在时填充配置键 `key`
    pub fn bind(&mut self, flag: &str, key: &str) -> &mut Self {
        self.bindings.insert(flag.to_string(), key.to_string());
        self
    }

    pub fn env_name(&self, key: &str) -> String {
        let suffix = key.to_uppercase().replace(['.', '-'], "_");
        if self.env_prefix.is_empty() {
            suffix
        } else {
            format!("{}_{}", self.env_prefix, suffix)
        }
    }

    /// 合并所有来源，生成配置快照
    ///
    /// 不会失败：所有来源都缺失的键取默认值（绑定但无默认值的键取空字符串）。
    /// 空的环境变量视为未设置。
    pub fn resolve(
        &self,
        flags: &FlagValues,
        env: &impl EnvSource,
        file: &FileValues,
    ) -> Configuration {
        let mut all_keys: BTreeSet<&str> = self.defaults.keys().map(String::as_str).collect();
        all_keys.extend(self.bindings.values().map(String::as_str));
        all_keys.extend(file.0.keys().map(String::as_str));

        let values = all_keys
            .into_iter()
            .map(|key| {
                let value = self
                    .flag_value(key, flags)
                    .or_else(|| {
                        env.var(&self.env_name(key))
                            .filter(|v| !v.is_empty())
                            .map(Value::Str)
                    })
                    .or_else(|| file.get(key).cloned())
                    .or_else(|| self.defaults.get(key).cloned())
                    .unwrap_or_else(|| Value::Str(String::new()));
                (key.to_string(), value)
            })
            .collect();

        Configuration { values }
    }

    fn flag_value(&self, key: &str, flags: &FlagValues) -> Option<Value> {
        self.bindings
            .iter()
            .filter(|(_, bound_key)| bound_key.as_str() == key)
            .find_map(|(flag, _)| flags.get(flag).cloned())
    }
}

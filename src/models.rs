use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub authenticated: bool,
    pub subject: Option<String>,
    pub username: Option<String>,
    pub roles: Vec<String>,
}

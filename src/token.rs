use std::{collections::HashMap, fs, path::Path};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DbError, Result};

/// Issued tokens live for one hour.
pub const TOKEN_LIFETIME_SECS: i64 = 3_600;
/// Tokens preloaded from a file are trusted for a day.
pub const PRELOADED_LIFETIME_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
struct TokenRecord {
    username: String,
    expires_at: DateTime<Utc>,
}

/// In-memory bearer-token registry: issue on login, validate per request,
/// revoke on logout. Expired entries fail validation and revocation.
#[derive(Debug, Default)]
pub struct TokenManager {
    records: RwLock<HashMap<String, TokenRecord>>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON object mapping usernames to fixed tokens, as produced for
    /// test harnesses and bootstrap credentials.
    pub fn preload(&self, path: &Path) -> Result<usize> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DbError::Config(format!("cannot read tokens file {}: {err}", path.display()))
        })?;
        let pairs: HashMap<String, String> = serde_json::from_str(&contents)
            .map_err(|err| DbError::Config(format!("cannot parse tokens file: {err}")))?;

        let expires_at = Utc::now() + Duration::seconds(PRELOADED_LIFETIME_SECS);
        let mut records = self.records.write();
        let count = pairs.len();
        for (username, token) in pairs {
            records.insert(
                token,
                TokenRecord {
                    username,
                    expires_at,
                },
            );
        }
        info!("preloaded {count} tokens");
        Ok(count)
    }

    /// Issue a fresh token for `username`, valid for one hour.
    pub fn issue(&self, username: &str) -> String {
        let mut records = self.records.write();
        loop {
            let token = format!("DBX-{}", Uuid::new_v4().simple());
            if records.contains_key(&token) {
                // Collision is essentially impossible, but keep drawing.
                warn!("token collision, drawing again");
                continue;
            }
            records.insert(
                token.clone(),
                TokenRecord {
                    username: username.to_string(),
                    expires_at: Utc::now() + Duration::seconds(TOKEN_LIFETIME_SECS),
                },
            );
            return token;
        }
    }

    /// Resolve a token to its principal name; `None` for unknown or expired
    /// tokens.
    pub fn validate(&self, token: &str) -> Option<String> {
        let records = self.records.read();
        let record = records.get(token)?;
        if Utc::now() > record.expires_at {
            return None;
        }
        Some(record.username.clone())
    }

    /// Drop a token. Returns whether a live token was actually revoked.
    pub fn revoke(&self, token: &str) -> bool {
        let mut records = self.records.write();
        match records.remove(token) {
            Some(record) => Utc::now() <= record.expires_at,
            None => false,
        }
    }
}

use crate::errors::{OutpostError, OutpostResult};
use crate::stream::StreamHandle;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Account restriction levels, in increasing order of privilege. The
/// derived `Ord` is the total order commands are gated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    User,
    Creator,
    Implementor,
    Admin,
}

impl AccountType {
    pub const ALL: [AccountType; 4] = [
        AccountType::User,
        AccountType::Creator,
        AccountType::Implementor,
        AccountType::Admin,
    ];

    /// Look up a restriction name as it appears in command files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "user" => Some(AccountType::User),
            "creator" => Some(AccountType::Creator),
            "implementor" => Some(AccountType::Implementor),
            "admin" => Some(AccountType::Admin),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AccountType::User => "user",
            AccountType::Creator => "creator",
            AccountType::Implementor => "implementor",
            AccountType::Admin => "admin",
        }
    }
}

/// The serialized form of a user account, as stored in users.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub account_type: AccountType,
    pub created_at: Timestamp,
    pub last_login: Timestamp,
    pub login_count: u32,
    #[serde(default)]
    pub preferences: HashMap<String, String>,
}

/// A live user account. Shared as `Arc<User>` between the session's
/// stream, its filters, and the session registry, so the mutable pieces
/// sit behind their own locks.
#[derive(Debug)]
pub struct User {
    pub username: String,
    pub account_type: AccountType,
    password_hash: String,
    pub created_at: Timestamp,
    last_login: Mutex<Timestamp>,
    login_count: Mutex<u32>,
    preferences: Mutex<HashMap<String, String>>,
    stream: Mutex<Option<StreamHandle>>,
}

impl User {
    /// Create a brand-new account with the given credentials.
    pub fn new(username: String, password: &str, account_type: AccountType) -> OutpostResult<Self> {
        let now = Timestamp::now();
        Ok(Self {
            username,
            account_type,
            password_hash: hash_password(password)?,
            created_at: now,
            last_login: Mutex::new(now),
            login_count: Mutex::new(0),
            preferences: Mutex::new(HashMap::new()),
            stream: Mutex::new(None),
        })
    }

    pub fn from_record(record: UserRecord) -> Self {
        Self {
            username: record.username,
            account_type: record.account_type,
            password_hash: record.password_hash,
            created_at: record.created_at,
            last_login: Mutex::new(record.last_login),
            login_count: Mutex::new(record.login_count),
            preferences: Mutex::new(record.preferences),
            stream: Mutex::new(None),
        }
    }

    pub fn to_record(&self) -> UserRecord {
        UserRecord {
            username: self.username.clone(),
            password_hash: self.password_hash.clone(),
            account_type: self.account_type,
            created_at: self.created_at,
            last_login: *self.last_login.lock().unwrap(),
            login_count: *self.login_count.lock().unwrap(),
            preferences: self.preferences.lock().unwrap().clone(),
        }
    }

    pub fn verify_password(&self, password: &str) -> OutpostResult<bool> {
        verify_password(password, &self.password_hash)
    }

    /// Update the last login time and increment the login count.
    pub fn record_login(&self) {
        *self.last_login.lock().unwrap() = Timestamp::now();
        *self.login_count.lock().unwrap() += 1;
    }

    pub fn last_login(&self) -> Timestamp {
        *self.last_login.lock().unwrap()
    }

    pub fn preference(&self, key: &str) -> Option<String> {
        self.preferences.lock().unwrap().get(key).cloned()
    }

    pub fn set_preference(&self, key: impl Into<String>, value: impl Into<String>) {
        self.preferences
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    pub fn remove_preference(&self, key: &str) {
        self.preferences.lock().unwrap().remove(key);
    }

    /// The event stream this user is currently attached to, if any.
    pub fn io_event_stream(&self) -> Option<StreamHandle> {
        self.stream.lock().unwrap().clone()
    }

    pub fn attach_stream(&self, handle: StreamHandle) {
        *self.stream.lock().unwrap() = Some(handle);
    }

    pub fn detach_stream(&self) {
        *self.stream.lock().unwrap() = None;
    }
}

// Salted hash, stored as "hash:salt". Not a cryptographic hash; the
// storage backend is expected to be swapped out before anything
// internet-facing runs this.
fn hash_password(password: &str) -> OutpostResult<String> {
    let salt = Timestamp::now().as_second();
    let mut hasher = DefaultHasher::new();
    format!("{}{}", password, salt).hash(&mut hasher);
    Ok(format!("{}:{}", hasher.finish(), salt))
}

fn verify_password(password: &str, stored: &str) -> OutpostResult<bool> {
    let parts: Vec<&str> = stored.split(':').collect();
    if parts.len() != 2 {
        return Err(OutpostError::Internal("invalid hash format".to_string()));
    }
    let mut hasher = DefaultHasher::new();
    format!("{}{}", password, parts[1]).hash(&mut hasher);
    Ok(hasher.finish().to_string() == parts[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_type_ordering() {
        assert!(AccountType::User < AccountType::Creator);
        assert!(AccountType::Creator < AccountType::Implementor);
        assert!(AccountType::Implementor < AccountType::Admin);
    }

    #[test]
    fn account_type_names_round_trip() {
        for at in AccountType::ALL {
            assert_eq!(AccountType::from_name(at.name()), Some(at));
        }
        assert_eq!(AccountType::from_name("IMPLEMENTOR"), Some(AccountType::Implementor));
        assert_eq!(AccountType::from_name("wizard"), None);
    }

    #[test]
    fn password_verification() {
        let user = User::new("alice".to_string(), "sekrit", AccountType::User).unwrap();
        assert!(user.verify_password("sekrit").unwrap());
        assert!(!user.verify_password("guess").unwrap());
    }

    #[test]
    fn record_round_trip() {
        let user = User::new("bob".to_string(), "pw", AccountType::Creator).unwrap();
        user.set_preference("prompt", "bob> ");
        user.record_login();

        let restored = User::from_record(user.to_record());
        assert_eq!(restored.username, "bob");
        assert_eq!(restored.account_type, AccountType::Creator);
        assert_eq!(restored.preference("prompt").as_deref(), Some("bob> "));
        assert!(restored.verify_password("pw").unwrap());
    }

    #[test]
    fn preferences_update() {
        let user = User::new("carol".to_string(), "pw", AccountType::User).unwrap();
        assert_eq!(user.preference("prompt"), None);
        user.set_preference("prompt", "c> ");
        assert_eq!(user.preference("prompt").as_deref(), Some("c> "));
        user.remove_preference("prompt");
        assert_eq!(user.preference("prompt"), None);
    }
}

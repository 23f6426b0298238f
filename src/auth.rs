use crate::errors::{OutpostError, OutpostResult};
use crate::users::{AccountType, User, UserRecord};

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

/// One authentication attempt, carried to the authenticator as the
/// payload of a `LoginAuth` control event. Whoever consumes the request
/// must invoke exactly one of the callbacks, exactly once.
#[derive(Clone)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    pub on_success: Arc<dyn Fn(Arc<User>) + Send + Sync>,
    pub on_failure: Arc<dyn Fn(String) + Send + Sync>,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Credential checker. Implementations answer through the request's
/// callbacks; they may do so synchronously or from another thread.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: AuthRequest);

    /// Persist any mutated account state (preferences, login counters).
    fn save_user(&self, user: &User) -> OutpostResult<()>;
}

/// JSON file-backed user accounts under a data directory.
pub struct FileAuthenticator {
    users_file: PathBuf,
    cache: Mutex<HashMap<String, Arc<User>>>,
}

impl FileAuthenticator {
    /// Open (or create) the account store. A fresh store is seeded with
    /// an `admin`/`admin` account so a new install can be entered.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> OutpostResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let users_file = data_dir.join("users.json");

        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).map_err(|e| {
                OutpostError::Configuration(format!("Failed to create data directory: {}", e))
            })?;
        }

        let auth = Self {
            users_file,
            cache: Mutex::new(HashMap::new()),
        };
        auth.load_all()?;

        if auth.cache.lock().unwrap().is_empty() {
            info!("user store is empty, seeding default admin account");
            let admin = User::new("admin".to_string(), "admin", AccountType::Admin)?;
            auth.store(Arc::new(admin))?;
        }

        Ok(auth)
    }

    pub fn lookup(&self, username: &str) -> Option<Arc<User>> {
        self.cache.lock().unwrap().get(username).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Add a new account and persist the store.
    pub fn store(&self, user: Arc<User>) -> OutpostResult<()> {
        self.cache
            .lock()
            .unwrap()
            .insert(user.username.clone(), user);
        self.save_all()
    }

    fn load_all(&self) -> OutpostResult<()> {
        if !self.users_file.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&self.users_file).map_err(|e| {
            OutpostError::Configuration(format!("Failed to read users file: {}", e))
        })?;
        if content.trim().is_empty() {
            return Ok(());
        }

        let records: HashMap<String, UserRecord> = serde_json::from_str(&content)
            .map_err(|e| OutpostError::Configuration(format!("Failed to parse users file: {}", e)))?;

        let mut cache = self.cache.lock().unwrap();
        *cache = records
            .into_values()
            .map(|r| (r.username.clone(), Arc::new(User::from_record(r))))
            .collect();
        Ok(())
    }

    fn save_all(&self) -> OutpostResult<()> {
        let records: HashMap<String, UserRecord> = self
            .cache
            .lock()
            .unwrap()
            .iter()
            .map(|(name, user)| (name.clone(), user.to_record()))
            .collect();

        let content = serde_json::to_string_pretty(&records)
            .map_err(|e| OutpostError::Internal(format!("Failed to serialize users: {}", e)))?;
        fs::write(&self.users_file, content).map_err(|e| {
            OutpostError::Configuration(format!("Failed to write users file: {}", e))
        })?;
        Ok(())
    }
}

impl Authenticator for FileAuthenticator {
    fn authenticate(&self, request: AuthRequest) {
        let Some(user) = self.lookup(&request.username) else {
            warn!(username = %request.username, "login attempt for unknown user");
            (request.on_failure)("Unknown user or bad password.".to_string());
            return;
        };

        match user.verify_password(&request.password) {
            Ok(true) => {
                user.record_login();
                (request.on_success)(user);
            }
            Ok(false) => {
                warn!(username = %request.username, "bad password");
                (request.on_failure)("Unknown user or bad password.".to_string());
            }
            Err(e) => {
                warn!(username = %request.username, error = %e, "credential check failed");
                (request.on_failure)("Authentication is unavailable.".to_string());
            }
        }
    }

    fn save_user(&self, user: &User) -> OutpostResult<()> {
        // The cache holds the same Arc, so only the file needs rewriting.
        if !self.cache.lock().unwrap().contains_key(&user.username) {
            return Err(OutpostError::Internal(format!(
                "save for unknown user '{}'",
                user.username
            )));
        }
        self.save_all()
    }
}

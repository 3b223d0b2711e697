mod password;

pub use password::{ verify_password, ParsePasswordSchemeError, PasswordScheme };

use log::{ info, warn };
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::models::user::{ normalize_email, CredentialRecord, User };
use crate::storage::{ get_json, put_json, KeyValueStore, ACCOUNTS_KEY, SESSION_KEY };

pub const MIN_PASSWORD_LEN: usize = 6;

type AccountTable = HashMap<String, CredentialRecord>;

const DUMMY_PASSWORD: &str = "derma-detect-unknown-account";

static DUMMY_ARGON2_HASH: Lazy<Option<String>> = Lazy::new(|| {
    PasswordScheme::Argon2.hash(DUMMY_PASSWORD).ok()
});

static DUMMY_LEGACY_HASH: Lazy<Option<String>> = Lazy::new(|| {
    PasswordScheme::Legacy.hash(DUMMY_PASSWORD).ok()
});

/// Verified against when the email is unknown, in the configured scheme, so both
/// login failures cost the same as checking a real account.
fn dummy_hash(scheme: PasswordScheme) -> Option<&'static str> {
    match scheme {
        PasswordScheme::Argon2 => DUMMY_ARGON2_HASH.as_deref(),
        PasswordScheme::Legacy => DUMMY_LEGACY_HASH.as_deref(),
    }
}

/// Form-level checks done before [`CredentialService::register`] is called.
pub fn validate_registration(name: &str, email: &str, password: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::InvalidInput("Please enter your name.".to_string()));
    }
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::InvalidInput("Please enter a valid email address.".to_string()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(
            AppError::InvalidInput(
                format!("Password must be at least {} characters long.", MIN_PASSWORD_LEN)
            )
        );
    }
    Ok(())
}

/// Registration, login and the single process-wide session.
pub struct CredentialService {
    store: Arc<dyn KeyValueStore>,
    scheme: PasswordScheme,
    accounts_lock: Mutex<()>,
}

impl CredentialService {
    pub fn new(store: Arc<dyn KeyValueStore>, scheme: PasswordScheme) -> Self {
        Self {
            store,
            scheme,
            accounts_lock: Mutex::new(()),
        }
    }

    async fn load_accounts(&self) -> Result<AccountTable, AppError> {
        Ok(get_json::<AccountTable>(self.store.as_ref(), ACCOUNTS_KEY).await?.unwrap_or_default())
    }

    /// Makes `user` the signed-in user.
    pub async fn establish_session(&self, user: &User) -> Result<(), AppError> {
        put_json(self.store.as_ref(), SESSION_KEY, user).await?;
        Ok(())
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<User, AppError> {
        let user = self.create_account(name, email, password).await?;
        self.establish_session(&user).await?;
        info!("Registered and signed in {}", user.email);
        Ok(user)
    }

    /// Adds the account without touching the session.
    pub async fn create_account(&self, name: &str, email: &str, password: &str) -> Result<User, AppError> {
        let normalized_email = normalize_email(email);
        let _guard = self.accounts_lock.lock().await;

        let mut accounts = self.load_accounts().await?;
        if accounts.contains_key(&normalized_email) {
            warn!("Registration rejected, account exists: {}", normalized_email);
            return Err(AppError::DuplicateAccount);
        }

        let password_hash = self.scheme
            .hash(password)
            .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))?;
        accounts.insert(normalized_email.clone(), CredentialRecord {
            name: name.to_string(),
            password_hash,
        });
        put_json(self.store.as_ref(), ACCOUNTS_KEY, &accounts).await?;

        info!("Created account {}", normalized_email);
        Ok(User { name: name.to_string(), email: normalized_email })
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, AppError> {
        let user = self.authenticate(email, password).await?;
        self.establish_session(&user).await?;
        info!("Signed in {}", user.email);
        Ok(user)
    }

    /// Checks the credentials without touching the session.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User, AppError> {
        let normalized_email = normalize_email(email);
        let accounts = self.load_accounts().await?;

        let record = match accounts.get(&normalized_email) {
            Some(record) if verify_password(password, &record.password_hash) => record,
            Some(_) => {
                warn!("Login failed for {}", normalized_email);
                return Err(AppError::InvalidCredentials);
            }
            None => {
                if let Some(dummy) = dummy_hash(self.scheme) {
                    let _ = verify_password(password, dummy);
                }
                warn!("Login failed for {}", normalized_email);
                return Err(AppError::InvalidCredentials);
            }
        };

        Ok(User { name: record.name.clone(), email: normalized_email })
    }

    pub async fn logout(&self) -> Result<(), AppError> {
        self.store.remove(SESSION_KEY).await?;
        Ok(())
    }

    pub async fn current_user(&self) -> Result<Option<User>, AppError> {
        Ok(get_json::<User>(self.store.as_ref(), SESSION_KEY).await?)
    }
}

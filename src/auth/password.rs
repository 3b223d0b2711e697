use argon2::{
    password_hash::{ rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString },
    Argon2,
};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

/// How a password is turned into the stored `passwordHash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordScheme {
    /// Salted Argon2id, stored as a PHC string.
    Argon2,
    /// The `hashed_<password>_salted` transform older account tables were written
    /// with. Reversible; only for reading such tables.
    Legacy,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePasswordSchemeError {
    message: String,
}

impl fmt::Display for ParsePasswordSchemeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParsePasswordSchemeError {}

impl FromStr for PasswordScheme {
    type Err = ParsePasswordSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "argon2" => Ok(PasswordScheme::Argon2),
            "legacy" => Ok(PasswordScheme::Legacy),
            _ =>
                Err(ParsePasswordSchemeError {
                    message: format!("Invalid password scheme: '{}'", s),
                }),
        }
    }
}

impl PasswordScheme {
    pub fn hash(&self, password: &str) -> Result<String, argon2::password_hash::Error> {
        match self {
            PasswordScheme::Argon2 => {
                let salt = SaltString::generate(&mut OsRng);
                let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
                Ok(hash.to_string())
            }
            PasswordScheme::Legacy => Ok(legacy_hash(password)),
        }
    }
}

fn legacy_hash(password: &str) -> String {
    format!("hashed_{}_salted", password)
}

/// Checks `password` against a stored hash of either scheme. PHC strings always
/// start with `$`, legacy values never do.
pub fn verify_password(password: &str, stored: &str) -> bool {
    if stored.starts_with('$') {
        let parsed_hash = match PasswordHash::new(stored) {
            Ok(h) => h,
            Err(_) => return false,
        };
        return Argon2::default().verify_password(password.as_bytes(), &parsed_hash).is_ok();
    }
    legacy_hash(password).as_bytes().ct_eq(stored.as_bytes()).into()
}

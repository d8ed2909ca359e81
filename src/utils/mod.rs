pub mod error;

use argon2::{Config, Variant};
use rand::prelude::*;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

pub fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_secs()
}

pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// URL-safe identifier for rooms and recordings. Lowercase so the ids survive
/// case-insensitive storage backends.
pub fn random_id(length: usize) -> String {
    random_string(length).to_lowercase()
}

/// Calculate a new hash for the given password
pub fn calculate_password_hash(password: &str) -> Result<String, argon2::Error> {
    let hashing_config = Config {
        variant: Variant::Argon2id,
        ..Default::default()
    };

    let salt = random_string(32);
    argon2::hash_encoded(password.as_bytes(), salt.as_bytes(), &hashing_config)
}

pub fn verify_password_hash(hash: &str, password: &str) -> bool {
    argon2::verify_encoded(hash, password.as_bytes()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_strings_are_distinct_and_sized() {
        let a = random_string(24);
        let b = random_string(24);
        assert_eq!(a.len(), 24);
        assert_ne!(a, b);
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = calculate_password_hash("hunter2").unwrap();
        assert!(verify_password_hash(&hash, "hunter2"));
        assert!(!verify_password_hash(&hash, "hunter3"));
    }
}

//! API tokens, token hashing and signed cookie values
//!
//! Tokens are random uuid-hex strings. Only a salted, iterated hash is ever
//! stored, in the form `algorithm:rounds:salt:digest`, where `digest` is the
//! hex hash of the salt followed by the token repeated `rounds` times.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Rounds used for newly hashed tokens
pub const DEFAULT_ROUNDS: u32 = 16384;

/// Bytes of random salt for newly hashed tokens
const SALT_BYTES: usize = 8;

/// Number of leading token characters stored in clear for candidate lookup
pub const TOKEN_PREFIX_LEN: usize = 4;

/// Allowed clock skew for cookie timestamps from the future
const MAX_CLOCK_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(format!("Unsupported hash algorithm: {}", other)),
        }
    }
}

/// Generate a new random API token
pub fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a random 32-byte secret, hex encoded
pub fn new_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

/// The clear-text lookup prefix of a token
pub fn token_prefix(token: &str) -> &str {
    token.get(..TOKEN_PREFIX_LEN).unwrap_or(token)
}

/// Hash a token with a fresh salt and the default parameters
pub fn hash_token(token: &str) -> String {
    let mut rng = rand::thread_rng();
    let salt: [u8; SALT_BYTES] = rng.gen();
    hash_token_with(token, &hex::encode(salt), DEFAULT_ROUNDS, HashAlgorithm::Sha512)
}

pub fn hash_token_with(token: &str, salt: &str, rounds: u32, algorithm: HashAlgorithm) -> String {
    let digest = match algorithm {
        HashAlgorithm::Sha256 => iterated_digest::<Sha256>(token, salt, rounds),
        HashAlgorithm::Sha512 => iterated_digest::<Sha512>(token, salt, rounds),
    };
    format!("{}:{}:{}:{}", algorithm, rounds, salt, digest)
}

fn iterated_digest<D: Digest>(token: &str, salt: &str, rounds: u32) -> String {
    let mut hasher = D::new();
    hasher.update(salt.as_bytes());
    for _ in 0..rounds {
        hasher.update(token.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Check `token` against a stored hash by re-deriving it with the same
/// parameters and comparing in constant time.
pub fn compare_token(hashed: &str, token: &str) -> bool {
    let mut parts = hashed.splitn(4, ':');
    let (Some(algorithm), Some(rounds), Some(salt), Some(_digest)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    let (Ok(algorithm), Ok(rounds)) = (algorithm.parse::<HashAlgorithm>(), rounds.parse::<u32>())
    else {
        return false;
    };

    let candidate = hash_token_with(token, salt, rounds, algorithm);
    constant_time_compare(candidate.as_bytes(), hashed.as_bytes())
}

/// Constant-time byte comparison to prevent timing attacks
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Signs and verifies cookie values with HMAC-SHA256.
///
/// A signed value is `base64(value)|timestamp|hex(mac)`, where the MAC covers
/// the cookie name, the encoded value and the timestamp, so a value signed
/// for one cookie cannot be replayed under another name.
#[derive(Clone)]
pub struct CookieSigner {
    secret: Vec<u8>,
}

impl fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieSigner").finish_non_exhaustive()
    }
}

impl CookieSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn sign(&self, name: &str, value: &str) -> String {
        self.sign_at(name, value, Utc::now().timestamp())
    }

    pub(crate) fn sign_at(&self, name: &str, value: &str, timestamp: i64) -> String {
        let encoded = URL_SAFE_NO_PAD.encode(value.as_bytes());
        let signature = hex::encode(self.mac(name, &encoded, timestamp).finalize().into_bytes());
        format!("{}|{}|{}", encoded, timestamp, signature)
    }

    /// Return the original value if `signed` carries a valid signature for
    /// `name` and is no older than `max_age`.
    pub fn verify(&self, name: &str, signed: &str, max_age: Duration) -> Option<String> {
        self.verify_timestamped(name, signed, max_age).map(|(value, _)| value)
    }

    /// Like [`verify`](Self::verify), also returning the signing timestamp
    pub fn verify_timestamped(&self, name: &str, signed: &str, max_age: Duration) -> Option<(String, i64)> {
        let mut parts = signed.split('|');
        let (Some(encoded), Some(timestamp), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };

        let timestamp: i64 = timestamp.parse().ok()?;
        let now = Utc::now().timestamp();
        let age = now - timestamp;
        if age < -MAX_CLOCK_SKEW_SECS || age > max_age.as_secs() as i64 {
            return None;
        }

        let signature = hex::decode(signature).ok()?;
        self.mac(name, encoded, timestamp)
            .verify_slice(&signature)
            .ok()?;

        let value = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        Some((String::from_utf8(value).ok()?, timestamp))
    }

    fn mac(&self, name: &str, encoded: &str, timestamp: i64) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(name.as_bytes());
        mac.update(b"|");
        mac.update(encoded.as_bytes());
        mac.update(b"|");
        mac.update(timestamp.to_string().as_bytes());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86400);

    #[test]
    fn test_new_token_is_random_hex() {
        let a = new_token();
        let b = new_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_secret() {
        let secret = new_secret();
        assert_eq!(secret.len(), 64);
        assert_ne!(secret, new_secret());
    }

    #[test]
    fn test_token_prefix() {
        assert_eq!(token_prefix("abcdef"), "abcd");
        assert_eq!(token_prefix("ab"), "ab");
    }

    #[test]
    fn test_hash_format() {
        let hashed = hash_token("secret-token");
        let parts: Vec<&str> = hashed.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "sha512");
        assert_eq!(parts[1], "16384");
        assert_eq!(parts[2].len(), SALT_BYTES * 2);
        assert_eq!(parts[3].len(), 128);
        assert!(!hashed.contains("secret-token"));
    }

    #[test]
    fn test_hash_round_trip() {
        for token in [new_token(), "x".to_string(), String::new()] {
            let hashed = hash_token(&token);
            assert!(compare_token(&hashed, &token));
        }
    }

    #[test]
    fn test_hash_rejects_other_token() {
        let token = new_token();
        let hashed = hash_token(&token);
        assert!(!compare_token(&hashed, &new_token()));
        assert!(!compare_token(&hashed, &token[1..]));
    }

    #[test]
    fn test_salts_differ() {
        let token = new_token();
        assert_ne!(hash_token(&token), hash_token(&token));
    }

    #[test]
    fn test_hash_with_parameters() {
        let hashed = hash_token_with("tok", "abcd", 3, HashAlgorithm::Sha256);
        assert!(hashed.starts_with("sha256:3:abcd:"));
        assert_eq!(hashed.rsplit(':').next().unwrap().len(), 64);
        assert!(compare_token(&hashed, "tok"));
        assert_eq!(hashed, hash_token_with("tok", "abcd", 3, HashAlgorithm::Sha256));
    }

    #[test]
    fn test_compare_malformed_hash() {
        assert!(!compare_token("", "tok"));
        assert!(!compare_token("sha512:16384:salt", "tok"));
        assert!(!compare_token("md5:1:salt:digest", "tok"));
        assert!(!compare_token("sha512:many:salt:digest", "tok"));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"abc", b"abc"));
        assert!(!constant_time_compare(b"abc", b"abd"));
        assert!(!constant_time_compare(b"abc", b"abcd"));
        assert!(constant_time_compare(b"", b""));
    }

    #[test]
    fn test_cookie_round_trip() {
        let signer = CookieSigner::new("hub-secret");
        let signed = signer.sign("spawnhub-hub-login", "cookie-id-1");
        assert_eq!(
            signer.verify("spawnhub-hub-login", &signed, DAY).as_deref(),
            Some("cookie-id-1")
        );
    }

    #[test]
    fn test_cookie_rejects_wrong_name_or_secret() {
        let signer = CookieSigner::new("hub-secret");
        let signed = signer.sign("spawnhub-hub-login", "cookie-id-1");

        assert!(signer.verify("spawnhub-user-river", &signed, DAY).is_none());
        assert!(CookieSigner::new("other").verify("spawnhub-hub-login", &signed, DAY).is_none());
    }

    #[test]
    fn test_cookie_rejects_tampering() {
        let signer = CookieSigner::new("hub-secret");
        let signed = signer.sign("c", "alice");
        let forged = signed.replacen(&URL_SAFE_NO_PAD.encode("alice"), &URL_SAFE_NO_PAD.encode("admin"), 1);

        assert!(signer.verify("c", &forged, DAY).is_none());
        assert!(signer.verify("c", "garbage", DAY).is_none());
        assert!(signer.verify("c", &format!("{}|extra", signed), DAY).is_none());
    }

    #[test]
    fn test_cookie_expiry() {
        let signer = CookieSigner::new("hub-secret");
        let old = signer.sign_at("c", "alice", Utc::now().timestamp() - 7200);

        assert!(signer.verify("c", &old, Duration::from_secs(3600)).is_none());
        assert_eq!(signer.verify("c", &old, DAY).as_deref(), Some("alice"));

        let future = signer.sign_at("c", "alice", Utc::now().timestamp() + 3600);
        assert!(signer.verify("c", &future, DAY).is_none());
    }

    #[test]
    fn test_cookie_verify_returns_timestamp() {
        let signer = CookieSigner::new("hub-secret");
        let ts = Utc::now().timestamp() - 60;
        let signed = signer.sign_at("c", "alice", ts);
        assert_eq!(
            signer.verify_timestamped("c", &signed, DAY),
            Some(("alice".to_string(), ts))
        );
    }
}

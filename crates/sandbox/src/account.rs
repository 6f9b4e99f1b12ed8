use ed25519_dalek::SigningKey;
use num_bigint::BigUint;
use rand::Rng;
use rand::rngs::OsRng;

pub const DEFAULT_ACCOUNT_ID: &str = "sandbox";
pub const DEFAULT_PUBLIC_KEY: &str = "ed25519:5BGSaf6YjVm7565VzWQHNxoyEjwr3jUpRJSGjREvU9dB";
pub const DEFAULT_PRIVATE_KEY: &str = "ed25519:3tgdk2wPraJzT4nsTuf86UX41xgPNk3MHnq8epARMdBNs29AFEztAuaQ7iHddDfXG9F2RzV1XNQYgJyAyoW51UBB";

/// Balance given to accounts created without an explicit one, in NEAR.
const DEFAULT_BALANCE_NEAR: u128 = 10_000;

/// yoctoNEAR per NEAR.
const YOCTO_EXPONENT: u32 = 24;

/// Convert whole NEAR to yoctoNEAR.
pub fn near_to_yocto(near: u128) -> BigUint {
    BigUint::from(near) * BigUint::from(10u32).pow(YOCTO_EXPONENT)
}

/// An account preloaded into genesis together with its full-access key.
///
/// `balance` is in yoctoNEAR. Keys are in NEAR's `ed25519:<base58>` form and
/// are passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisAccount {
    pub account_id: String,
    pub public_key: String,
    pub private_key: String,
    pub balance: BigUint,
}

impl GenesisAccount {
    pub fn new(
        account_id: impl Into<String>,
        public_key: impl Into<String>,
        private_key: impl Into<String>,
        balance: BigUint,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            public_key: public_key.into(),
            private_key: private_key.into(),
            balance,
        }
    }

    /// The well-known `sandbox` account every node gets.
    pub fn default_account() -> Self {
        Self::with_default_keys(DEFAULT_ACCOUNT_ID)
    }

    /// An account using the default key pair and balance under another id.
    pub fn with_default_keys(account_id: impl Into<String>) -> Self {
        Self::new(
            account_id,
            DEFAULT_PUBLIC_KEY,
            DEFAULT_PRIVATE_KEY,
            near_to_yocto(DEFAULT_BALANCE_NEAR),
        )
    }

    /// An account with a freshly generated ed25519 key pair.
    ///
    /// Without `account_id`, picks `dev-acc-<hhmmss>-<n>.sandbox`. `balance_near`
    /// is whole NEAR and defaults to 10 000.
    pub fn random(account_id: Option<String>, balance_near: Option<u128>) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = format!(
            "ed25519:{}",
            bs58::encode(signing_key.verifying_key().as_bytes()).into_string()
        );
        let private_key = format!(
            "ed25519:{}",
            bs58::encode(signing_key.to_keypair_bytes()).into_string()
        );
        Self::new(
            account_id.unwrap_or_else(random_account_id),
            public_key,
            private_key,
            near_to_yocto(balance_near.unwrap_or(DEFAULT_BALANCE_NEAR)),
        )
    }
}

fn random_account_id() -> String {
    let time = chrono::Utc::now().format("%H%M%S");
    let n: u32 = rand::thread_rng().r#gen();
    format!("dev-acc-{time}-{n}.sandbox")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_account_holds_ten_thousand_near() {
        let account = GenesisAccount::default_account();
        assert_eq!(account.account_id, DEFAULT_ACCOUNT_ID);
        assert_eq!(
            account.balance.to_string(),
            "10000000000000000000000000000"
        );
    }

    #[test]
    fn random_account_keys_decode_to_ed25519_bytes() {
        let account = GenesisAccount::random(Some("alice.sandbox".into()), Some(5));
        assert_eq!(account.account_id, "alice.sandbox");
        assert_eq!(account.balance, near_to_yocto(5));

        let public = account.public_key.strip_prefix("ed25519:").unwrap();
        let private = account.private_key.strip_prefix("ed25519:").unwrap();
        assert_eq!(bs58::decode(public).into_vec().unwrap().len(), 32);
        assert_eq!(bs58::decode(private).into_vec().unwrap().len(), 64);
    }

    #[test]
    fn random_account_id_shape() {
        let a = GenesisAccount::random(None, None);
        let b = GenesisAccount::random(None, None);
        assert!(a.account_id.starts_with("dev-acc-"), "{}", a.account_id);
        assert!(a.account_id.ends_with(".sandbox"), "{}", a.account_id);
        assert_ne!(a.public_key, b.public_key);
    }
}

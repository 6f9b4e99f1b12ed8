//! Rewrites a freshly initialized home before the node's first `run`.
//!
//! Genesis edits append records and add to `total_supply`, so applying them
//! twice to the same home double-counts. The stage types in `sandbox` make
//! sure it happens once.

use std::path::Path;

use num_bigint::BigUint;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::account::GenesisAccount;
use crate::config::{ConfigError, SandboxConfig, Settings};
use crate::paths::HomePaths;

pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_OPEN_FILES: u64 = 3000;

/// Hash of empty contract code.
const EMPTY_CODE_HASH: &str = "11111111111111111111111111111111";
const ACCOUNT_STORAGE_USAGE: u64 = 182;

/// Apply `config` to the node home at `home`.
pub async fn apply_overrides(
    home: &HomePaths,
    config: &SandboxConfig,
    settings: &Settings,
) -> Result<(), ConfigError> {
    let accounts: Vec<GenesisAccount> = std::iter::once(GenesisAccount::default_account())
        .chain(config.additional_accounts.iter().cloned())
        .collect();

    let mut genesis = read_json(&home.genesis()).await?;
    extend_genesis(&mut genesis, &accounts, config.additional_genesis.as_ref())?;
    write_json(&home.genesis(), &genesis).await?;

    for account in &accounts {
        write_json(&home.account_key(&account.account_id), &key_file(account)).await?;
    }

    let mut node_config = read_json(&home.config()).await?;
    json_patch::merge(&mut node_config, &node_config_patch(config, settings));
    write_json(&home.config(), &node_config).await?;

    if let Some(key) = &config.node_key {
        write_json(&home.node_key(), key).await?;
    }
    if let Some(key) = &config.validator_key {
        write_json(&home.validator_key(), key).await?;
    }

    debug!(
        home = %home.home().display(),
        accounts = accounts.len(),
        "node home configured"
    );
    Ok(())
}

/// Add `accounts` to genesis, then merge `patch` over the result.
pub(crate) fn extend_genesis(
    genesis: &mut Value,
    accounts: &[GenesisAccount],
    patch: Option<&Value>,
) -> Result<(), ConfigError> {
    let obj = genesis
        .as_object_mut()
        .ok_or_else(|| ConfigError::Invalid("genesis is not a JSON object".into()))?;

    let mut supply = total_supply(obj)?;
    let records = obj
        .get_mut("records")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| ConfigError::Invalid("genesis records is not an array".into()))?;

    for account in accounts {
        supply += &account.balance;
        records.push(json!({
            "Account": {
                "account_id": account.account_id,
                "account": {
                    "amount": account.balance.to_string(),
                    "locked": "0",
                    "code_hash": EMPTY_CODE_HASH,
                    "storage_usage": ACCOUNT_STORAGE_USAGE,
                },
            },
        }));
        records.push(json!({
            "AccessKey": {
                "account_id": account.account_id,
                "public_key": account.public_key,
                "access_key": {
                    "nonce": 0,
                    "permission": "FullAccess",
                },
            },
        }));
    }
    obj.insert("total_supply".into(), Value::String(supply.to_string()));

    if let Some(patch) = patch {
        json_patch::merge(genesis, patch);
    }
    Ok(())
}

fn total_supply(genesis: &Map<String, Value>) -> Result<BigUint, ConfigError> {
    let invalid = |detail: &str| ConfigError::Invalid(format!("genesis total_supply {detail}"));
    match genesis.get("total_supply") {
        Some(Value::String(s)) => s.parse().map_err(|_| invalid("is not an integer")),
        Some(Value::Number(n)) => n
            .to_string()
            .parse()
            .map_err(|_| invalid("is not an integer")),
        Some(_) => Err(invalid("has the wrong type")),
        None => Err(invalid("is missing")),
    }
}

fn key_file(account: &GenesisAccount) -> Value {
    json!({
        "account_id": account.account_id,
        "public_key": account.public_key,
        "private_key": account.private_key,
    })
}

/// Limits every sandbox gets, with `additional_config` merged on top.
pub(crate) fn node_config_patch(config: &SandboxConfig, settings: &Settings) -> Value {
    let max_payload_size = config
        .max_payload_size
        .or(settings.max_payload_size)
        .unwrap_or(DEFAULT_MAX_PAYLOAD_SIZE);
    let max_open_files = config
        .max_open_files
        .or(settings.max_open_files)
        .unwrap_or(DEFAULT_MAX_OPEN_FILES);

    let mut patch = json!({
        "rpc": { "limits_config": { "json_payload_max_size": max_payload_size } },
        "store": { "max_open_files": max_open_files },
    });
    if let Some(extra) = &config.additional_config {
        json_patch::merge(&mut patch, extra);
    }
    patch
}

pub(crate) async fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) async fn write_json(path: &Path, value: &Value) -> Result<(), ConfigError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
}

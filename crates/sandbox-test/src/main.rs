//! Minimal stand-in for `near-sandbox`.
//!
//! Implements the subcommands the library drives:
//!
//! ```text
//! fake-node --version
//! fake-node --home <dir> init --fast
//! fake-node --home <dir> run --rpc-addr <h:p> --network-addr <h:p>
//! fake-node --home <dir> view-state dump-state --stream
//! ```
//!
//! `run` answers `GET /status` with 200 and can be steered from `config.json`:
//! `fake_node.exit_code` exits right away, `fake_node.startup_delay_ms` waits
//! before binding the RPC port.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match dispatch(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fake-node: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(args: &[String]) -> io::Result<ExitCode> {
    match args {
        [flag] if flag == "--version" => {
            println!("near-sandbox (fake) 0.0.0");
            Ok(ExitCode::SUCCESS)
        }
        [flag, home, rest @ ..] if flag == "--home" => {
            let home = PathBuf::from(home);
            match rest {
                [cmd, ..] if cmd == "init" => init(&home).map(|()| ExitCode::SUCCESS),
                [cmd, tail @ ..] if cmd == "run" => run(&home, tail).await,
                [a, b, c] if a == "view-state" && b == "dump-state" && c == "--stream" => {
                    dump_state(&home).map(|()| ExitCode::SUCCESS)
                }
                _ => Err(usage(args)),
            }
        }
        _ => Err(usage(args)),
    }
}

fn usage(args: &[String]) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported arguments: {args:?}"),
    )
}

fn init(home: &Path) -> io::Result<()> {
    std::fs::create_dir_all(home)?;
    write_json(
        &home.join("config.json"),
        &json!({
            "rpc": {
                "addr": "0.0.0.0:3030",
                "limits_config": { "json_payload_max_size": 10_485_760 },
            },
            "network": { "addr": "0.0.0.0:24567" },
            "store": { "path": "data", "max_open_files": 512 },
        }),
    )?;
    write_json(
        &home.join("genesis.json"),
        &json!({
            "chain_id": "sandbox",
            "protocol_version": 73,
            "total_supply": "1000000000000000000000000000000000",
            "records": [
                { "Account": { "account_id": "test.near", "account": {
                    "amount": "1000000000000000000000000000000000",
                    "locked": "0",
                    "code_hash": "11111111111111111111111111111111",
                    "storage_usage": 182,
                } } },
            ],
        }),
    )?;
    write_json(
        &home.join("node_key.json"),
        &json!({ "account_id": "node", "public_key": "ed25519:node", "secret_key": "ed25519:node" }),
    )?;
    write_json(
        &home.join("validator_key.json"),
        &json!({ "account_id": "test.near", "public_key": "ed25519:val", "secret_key": "ed25519:val" }),
    )
}

async fn run(home: &Path, args: &[String]) -> io::Result<ExitCode> {
    let rpc_addr = flag_value(args, "--rpc-addr")?;
    let net_addr = flag_value(args, "--network-addr")?;

    let genesis = read_json(&home.join("genesis.json"))?;
    if !genesis.get("records").is_some_and(Value::is_array) {
        return Err(io::Error::other("genesis records is not an array"));
    }
    let config = read_json(&home.join("config.json"))?;
    let knobs = config.get("fake_node").cloned().unwrap_or(Value::Null);

    if let Some(code) = knobs.get("exit_code").and_then(Value::as_u64) {
        eprintln!("exiting with {code} as configured");
        return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)));
    }
    if let Some(ms) = knobs.get("startup_delay_ms").and_then(Value::as_u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let _network = TcpListener::bind(net_addr).await?;
    let rpc = TcpListener::bind(rpc_addr).await?;
    eprintln!("listening on {rpc_addr}");

    loop {
        let (mut stream, _) = rpc.accept().await?;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(buf.get(..n).unwrap_or_default());
            let (status, body) = if request.starts_with("GET /status") {
                ("200 OK", r#"{"chain_id":"sandbox","sync_info":{"syncing":false}}"#)
            } else {
                ("404 Not Found", "{}")
            };
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

/// Mirrors the real export: records are streamed to their own file and
/// genesis is written without them.
fn dump_state(home: &Path) -> io::Result<()> {
    let output = home.join("output");
    std::fs::create_dir_all(&output)?;

    let mut genesis = read_json(&home.join("genesis.json"))?;
    let records = genesis
        .get_mut("records")
        .map(Value::take)
        .unwrap_or_else(|| json!([]));
    if let Some(obj) = genesis.as_object_mut() {
        obj.remove("records");
    }
    write_json(&output.join("genesis.json"), &genesis)?;
    write_json(&output.join("records.json"), &records)?;
    for name in ["config.json", "node_key.json", "validator_key.json"] {
        std::fs::copy(home.join(name), output.join(name))?;
    }
    Ok(())
}

fn flag_value<'a>(args: &'a [String], name: &str) -> io::Result<&'a str> {
    args.windows(2)
        .find(|pair| pair.first().is_some_and(|flag| flag == name))
        .and_then(|pair| pair.get(1))
        .map(String::as_str)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("missing {name}")))
}

fn read_json(path: &Path) -> io::Result<Value> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(io::Error::other)
}

fn write_json(path: &Path, value: &Value) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, bytes)
}

//! Quay demo CLI
//!
//! Wires a store with N local devices under a base directory, saves the
//! given files and prints their content ids. With `--get` it streams an
//! item back out instead.
//!
//! Usage:
//!   quay --base <DIR> [--devices N] [--p2p] file...
//!   quay --base <DIR> --get <ID> [--namespace NS] --out <PATH>

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::info;

use quay::{Store, StoreConfig};

fn print_usage() {
    println!("Quay v0.1.0 - content-addressed replicating store");
    println!();
    println!("Usage:");
    println!("  quay --base <DIR> [options] file...         Save files, print their ids");
    println!("  quay --base <DIR> --get <ID> --out <PATH>   Stream an item to a file");
    println!();
    println!("Options:");
    println!("  --base <DIR>           Base directory (required)");
    println!("  --devices <N>          Number of local devices (default: 1)");
    println!("  --namespace <NS>       Namespace suffix for saved/fetched ids");
    println!("  --p2p                  Enable the peer overlay");
    println!("  --gateway              Map ports through the local uPnP gateway");
    println!("  --sync-interval <S>    Background re-replication interval in seconds");
    println!("  --help, -h             Show this help");
    println!();
    println!("Environment:");
    println!("  RUST_LOG               Log level (e.g., info, debug)");
}

fn arg_value(args: &[String], name: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].clone())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let base_dir = match arg_value(&args, "--base") {
        Some(dir) => PathBuf::from(dir),
        None => {
            print_usage();
            eprintln!();
            eprintln!("error: --base <DIR> is required");
            return ExitCode::FAILURE;
        }
    };

    let device_count: usize = arg_value(&args, "--devices")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let namespace = arg_value(&args, "--namespace");
    let sync_interval: u64 = arg_value(&args, "--sync-interval")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut config = StoreConfig::new(&base_dir).with_sync_interval(sync_interval);
    if device_count > 1 {
        let dirs = (0..device_count)
            .map(|i| base_dir.join(format!("device-{}", i)))
            .collect();
        config = config.with_device_dirs(dirs);
    }
    if args.iter().any(|a| a == "--p2p") {
        config = config.with_p2p();
    }
    if args.iter().any(|a| a == "--gateway") {
        config = config.with_gateway();
    }

    let store = match Store::start(config).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("failed to start store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(peer) = store.local_peer() {
        info!(peer = %peer.id, address = %peer.address, port = peer.port, "overlay identity");
    }

    let outcome = if let Some(id) = arg_value(&args, "--get") {
        run_get(&store, &id, namespace.as_deref(), arg_value(&args, "--out")).await
    } else {
        run_save(&store, &args, namespace.as_deref()).await
    };

    if let Err(e) = store.close().await {
        eprintln!("close failed: {}", e);
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}

/// Save each file argument and print its id.
async fn run_save(store: &Store, args: &[String], namespace: Option<&str>) -> Result<(), String> {
    let flags_with_value = ["--base", "--devices", "--namespace", "--sync-interval", "--get", "--out"];
    let mut files = Vec::new();
    let mut skip = true; // argv[0]
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if flags_with_value.contains(&arg.as_str()) {
            skip = true;
            continue;
        }
        if arg.starts_with("--") {
            continue;
        }
        files.push(PathBuf::from(arg));
    }

    if files.is_empty() {
        return Err("no files to save (see --help)".to_string());
    }

    for path in files {
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let metadata = serde_json::json!({ "name": name });

        match store.save(file, namespace, metadata).await {
            Ok(item) => println!("{}  {}", item.id, path.display()),
            Err(quay::StoreError::Replication { item }) => {
                println!("{}  {} (partially replicated)", item.id, path.display());
            }
            Err(e) => return Err(format!("save of {} failed: {}", path.display(), e)),
        }
    }
    Ok(())
}

/// Fetch one item and write its bytes to --out.
async fn run_get(
    store: &Store,
    id: &str,
    namespace: Option<&str>,
    out: Option<String>,
) -> Result<(), String> {
    let out = out.ok_or_else(|| "--get requires --out <PATH>".to_string())?;
    let item = store
        .get(id, namespace)
        .await
        .map_err(|e| format!("get failed: {}", e))?;

    let mut reader = item
        .reader()
        .await
        .map_err(|e| format!("cannot open content: {}", e))?;
    let mut file = tokio::fs::File::create(&out)
        .await
        .map_err(|e| format!("cannot create {}: {}", out, e))?;
    let bytes = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(|e| format!("copy failed: {}", e))?;

    println!("{}  {} bytes -> {}", item.id, bytes, out);
    Ok(())
}

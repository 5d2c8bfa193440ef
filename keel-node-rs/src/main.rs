//! Keel Node
//!
//! Runs one server of a keel cluster with a JSON key-value state machine,
//! plus an interactive stdin loop driving an embedded client.

use clap::Parser;
use keel_client::{ClientConfig, KeelClient};
use keel_core::machine::{Commit, StateMachine};
use keel_core::message::Consistency;
use keel_core::server::{RaftServer, ServerConfig};
use keel_core::types::{Member, MemberType};
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Keel replicated key-value node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node name/identifier
    #[arg(short, long)]
    name: String,

    /// UDP address to bind
    #[arg(short, long, default_value = "127.0.0.1:9990")]
    bind: SocketAddr,

    /// Storage directory
    #[arg(short, long, default_value = "./keel-data")]
    data_dir: PathBuf,

    /// Cluster members as name=addr or name=addr/passive (repeatable);
    /// defaults to a single-node cluster
    #[arg(short, long = "member", value_parser = parse_member)]
    members: Vec<Member>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_member(value: &str) -> Result<Member, String> {
    let (name, rest) = value
        .split_once('=')
        .ok_or_else(|| format!("expected name=addr, got {value}"))?;
    let (addr, member_type) = match rest.split_once('/') {
        Some((addr, "passive")) => (addr, MemberType::Passive),
        Some((addr, "reserve")) => (addr, MemberType::Reserve),
        Some((addr, "active")) => (addr, MemberType::Active),
        Some((_, other)) => return Err(format!("unknown member type {other}")),
        None => (rest, MemberType::Active),
    };
    let addr: SocketAddr = addr.parse().map_err(|e| format!("bad address: {e}"))?;
    Ok(Member::new(name, addr, member_type))
}

/// JSON key-value state machine. Commands:
/// `{"op":"put","key":K,"value":V}`, `{"op":"delete","key":K}`,
/// `{"op":"incr","key":K}`, `{"op":"listen"}` (session receives change
/// events). Queries: `{"op":"get","key":K}`, `{"op":"keys"}`.
struct KvStateMachine {
    data: HashMap<String, serde_json::Value>,
    listeners: Vec<u64>,
}

impl KvStateMachine {
    fn new() -> Self {
        Self {
            data: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    fn notify(&self, commit: &mut Commit<'_>, key: &str, value: &serde_json::Value) {
        let event = serde_json::json!({ "key": key, "value": value });
        for listener in &self.listeners {
            commit.publish(*listener, event.to_string().into_bytes());
        }
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, commit: &mut Commit<'_>) -> Result<Vec<u8>, String> {
        let op: serde_json::Value =
            serde_json::from_slice(commit.operation).map_err(|e| format!("bad command: {e}"))?;
        let name = op["op"].as_str().unwrap_or_default().to_string();

        match name.as_str() {
            "put" => {
                let key = op["key"].as_str().ok_or("put requires a key")?.to_string();
                let value = op["value"].clone();
                self.data.insert(key.clone(), value.clone());
                self.notify(commit, &key, &value);
                Ok(b"ok".to_vec())
            }
            "delete" => {
                let key = op["key"].as_str().ok_or("delete requires a key")?;
                self.data.remove(key);
                self.notify(commit, key, &serde_json::Value::Null);
                Ok(b"ok".to_vec())
            }
            "incr" => {
                let key = op["key"].as_str().ok_or("incr requires a key")?.to_string();
                let next = self.data.get(&key).and_then(|v| v.as_i64()).unwrap_or(0) + 1;
                let value = serde_json::json!(next);
                self.data.insert(key.clone(), value.clone());
                self.notify(commit, &key, &value);
                Ok(next.to_string().into_bytes())
            }
            "listen" => {
                self.listeners.push(commit.session);
                Ok(b"ok".to_vec())
            }
            other => Err(format!("unknown command {other}")),
        }
    }

    fn query(&self, operation: &[u8]) -> Result<Vec<u8>, String> {
        let op: serde_json::Value =
            serde_json::from_slice(operation).map_err(|e| format!("bad query: {e}"))?;
        match op["op"].as_str().unwrap_or_default() {
            "get" => {
                let key = op["key"].as_str().ok_or("get requires a key")?;
                let value = self.data.get(key).cloned().unwrap_or(serde_json::Value::Null);
                Ok(value.to_string().into_bytes())
            }
            "keys" => {
                let mut keys: Vec<&String> = self.data.keys().collect();
                keys.sort();
                Ok(serde_json::to_string(&keys).map_err(|e| e.to_string())?.into_bytes())
            }
            other => Err(format!("unknown query {other}")),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        let image = serde_json::json!({
            "data": self.data,
            "listeners": self.listeners,
        });
        Ok(image.to_string().into_bytes())
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let image: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| e.to_string())?;
        self.data = serde_json::from_value(image["data"].clone()).map_err(|e| e.to_string())?;
        self.listeners =
            serde_json::from_value(image["listeners"].clone()).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let members = if args.members.is_empty() {
        vec![Member::new(&args.name, args.bind, MemberType::Active)]
    } else {
        args.members.clone()
    };

    info!(
        "Keel node \"{}\" starting at {} ({} members)",
        args.name,
        args.bind,
        members.len()
    );

    let config = ServerConfig::new(&args.name, args.bind, &args.data_dir, members);
    let server = RaftServer::new(config, Box::new(KvStateMachine::new())).await?;
    let server_task = tokio::spawn(server.run());

    // Blocking stdin reader feeding the async loop
    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        println!("\nCommands:");
        println!("  put <key> <value>   - Replicate a key-value pair");
        println!("  get <key>           - Read a key (eventual consistency)");
        println!("  incr <key>          - Increment a counter");
        println!("  meta                - Show leader and membership");
        println!("  quit                - Exit\n");

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut client: Option<KeelClient> = None;
    let bind = args.bind;

    loop {
        tokio::select! {
            Some(line) = line_rx.recv() => {
                let parts: Vec<&str> = line.trim().split_whitespace().collect();
                if parts.is_empty() {
                    continue;
                }
                if parts[0] == "quit" || parts[0] == "exit" {
                    break;
                }

                if client.is_none() {
                    match KeelClient::connect(ClientConfig::new(vec![bind])).await {
                        Ok(c) => client = Some(c),
                        Err(e) => {
                            println!("cannot reach cluster: {e}");
                            continue;
                        }
                    }
                }
                let c = client.as_ref().expect("client connected above");

                match parts[0] {
                    "put" if parts.len() >= 3 => {
                        let op = serde_json::json!({
                            "op": "put",
                            "key": parts[1],
                            "value": parts[2..].join(" "),
                        });
                        match c.submit(op.to_string().into_bytes()).await {
                            Ok(_) => println!("ok"),
                            Err(e) => println!("error: {e}"),
                        }
                    }
                    "incr" if parts.len() == 2 => {
                        let op = serde_json::json!({ "op": "incr", "key": parts[1] });
                        match c.submit(op.to_string().into_bytes()).await {
                            Ok(v) => println!("{}", String::from_utf8_lossy(&v)),
                            Err(e) => println!("error: {e}"),
                        }
                    }
                    "get" if parts.len() == 2 => {
                        let op = serde_json::json!({ "op": "get", "key": parts[1] });
                        match c.query(op.to_string().into_bytes(), Consistency::Eventual).await {
                            Ok(v) => println!("{}", String::from_utf8_lossy(&v)),
                            Err(e) => println!("error: {e}"),
                        }
                    }
                    "meta" => match c.metadata().await {
                        Ok(info) => {
                            println!(
                                "leader={:?} term={} commit={} applied={}",
                                info.leader, info.term, info.commit_index, info.applied_index
                            );
                            for m in info.members {
                                println!("  {} {} ({})", m.id, m.address, m.member_type);
                            }
                        }
                        Err(e) => println!("error: {e}"),
                    },
                    _ => println!("unknown command; try: put <k> <v>, get <k>, incr <k>, meta"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server_task.abort();
    Ok(())
}

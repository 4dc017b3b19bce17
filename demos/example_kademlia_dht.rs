#[macro_use]
extern crate log;
extern crate kad_core;
extern crate simplelog;

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode};

use kad_core::crypto::hash_to_key;
use kad_core::Node;
use kad_core::NodeConfig;

/// Spins up a fresh node bound to an ephemeral local port, bootstrapping
/// against `bootstrap` if given, and blocks until `join` completes.
fn spawn_node(index: u32, bootstrap: Option<&Node>) -> Node {
    let path = std::env::temp_dir().join(format!("kad-demo-node-{}.kadconfig", index));
    let _ = std::fs::remove_file(&path);

    if let Some(b) = bootstrap {
        let contacts = vec![kad_core::persist::BootstrapContact::from(&b.contact_info())];
        kad_core::persist::BootstrapFile::new(&path).save(&contacts, None).expect("failed to seed bootstrap file");
    }

    let node = Node::new("127.0.0.1:0", NodeConfig::default(), path).expect("failed to bind node transport");
    if let Err(e) = node.join() {
        warn!("node {}: join failed: {}", index, e);
    }
    node
}

fn main() {
    CombinedLogger::init(vec![TermLogger::new(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .unwrap();

    let mut node_map: HashMap<u32, Node> = HashMap::new();
    let mut next_id = 0u32;

    let first = spawn_node(next_id, None);
    node_map.insert(next_id, first);
    next_id += 1;

    for _ in 1..10 {
        let bootstrap = node_map[&0].clone();
        let node = spawn_node(next_id, Some(&bootstrap));
        node_map.insert(next_id, node);
        next_id += 1;
    }

    info!("{} nodes joined, ready for input", node_map.len());

    let input = io::stdin();
    loop {
        let mut buffer = String::new();
        println!("Ready for input! (new <bootstrap-index> | insert <index> <key> <value> | get <index> <key> | leave <index>)");
        if input.read_line(&mut buffer).is_err() {
            break;
        }
        let args: Vec<&str> = buffer.trim_end().split(' ').collect();
        match args.as_slice() {
            ["new", bootstrap_index] => {
                let bootstrap_index: u32 = match bootstrap_index.parse() {
                    Ok(i) => i,
                    Err(_) => continue,
                };
                let bootstrap = match node_map.get(&bootstrap_index) {
                    Some(n) => n.clone(),
                    None => continue,
                };
                let node = spawn_node(next_id, Some(&bootstrap));
                node_map.insert(next_id, node);
                next_id += 1;
            },
            ["insert", index, key, value] => {
                let index: u32 = match index.parse() {
                    Ok(i) => i,
                    Err(_) => continue,
                };
                let node = match node_map.get(&index) {
                    Some(n) => n,
                    None => continue,
                };
                let key = hash_to_key(key.as_bytes());
                match node.store_value(key, value.as_bytes().to_vec(), Duration::from_secs(3600)) {
                    Ok(outcome) => info!("stored at {}/{} peers", outcome.succeeded, outcome.attempted),
                    Err(e) => warn!("store failed: {}", e),
                }
            },
            ["get", index, key] => {
                let index: u32 = match index.parse() {
                    Ok(i) => i,
                    Err(_) => continue,
                };
                let node = match node_map.get(&index) {
                    Some(n) => n,
                    None => continue,
                };
                let key = hash_to_key(key.as_bytes());
                let values = node.find_value(key);
                info!("{:?}", values.into_iter().map(|v| String::from_utf8_lossy(&v).into_owned()).collect::<Vec<_>>());
            },
            ["leave", index] => {
                let index: u32 = match index.parse() {
                    Ok(i) => i,
                    Err(_) => continue,
                };
                if let Some(node) = node_map.get(&index) {
                    node.leave();
                }
            },
            _ => {},
        }
    }
}

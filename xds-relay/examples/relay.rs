//! Example demonstrating xds-relay usage.
//!
//! This example shows:
//! - How to build an `Orchestrator` from a `RelayConfig`
//! - How two downstream sessions with the same node cluster share one upstream subscription
//! - How to read cache and upstream counters
//!
//! # Configuration (environment variables)
//!
//! - `XDS_RELAY_CONFIG`: Path to a JSON relay configuration (optional)
//! - `XDS_SERVER`: URI of the origin when no config file is given (default: `http://localhost:18000`)
//! - `XDS_CLUSTERS`: Comma-separated cluster names to request (empty means wildcard)
//!
//! # Usage
//!
//! ```sh
//! XDS_CLUSTERS=cluster-a,cluster-b cargo run -p xds-relay --example relay
//! ```

use std::time::Duration;

use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::service::discovery::v3::DiscoveryRequest;

use xds_relay::{DownstreamSession, LogLevel, Orchestrator, RelayConfig, VersionedRequest};

const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

fn load_config() -> xds_relay::Result<RelayConfig> {
    if let Ok(path) = std::env::var("XDS_RELAY_CONFIG") {
        return RelayConfig::from_path(path);
    }
    let server =
        std::env::var("XDS_SERVER").unwrap_or_else(|_| "http://localhost:18000".to_string());
    RelayConfig::from_json(&format!(
        r#"{{
            "origin": {{ "address": "{server}" }},
            "aggregation": {{
                "rules": [{{
                    "match": "any",
                    "key": [ {{ "node_cluster": {{}} }}, "type_url", {{ "resource_names": {{}} }} ]
                }}]
            }}
        }}"#
    ))
}

fn cluster_request(node_id: &str, names: &[String]) -> VersionedRequest {
    VersionedRequest::from_v3(DiscoveryRequest {
        node: Some(Node {
            id: node_id.to_string(),
            cluster: "example".to_string(),
            ..Default::default()
        }),
        type_url: CLUSTER_TYPE.to_string(),
        resource_names: names.to_vec(),
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let level = LogLevel::new(config.log_level()?);
    xds_relay::logging::init(&level)?;

    let names: Vec<String> = std::env::var("XDS_CLUSTERS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    println!("xds-relay Example\n");
    println!("Relaying from origin: {}", config.origin.address);

    let orchestrator = Orchestrator::from_config(&config)?;

    let mut sessions = Vec::new();
    for node_id in ["envoy-1", "envoy-2"] {
        let mut session = DownstreamSession::new(node_id, orchestrator.clone());
        session.handle_request(cluster_request(node_id, &names))?;
        sessions.push(session);
    }

    for session in &mut sessions {
        let Some(watch) = session.watch_mut(CLUSTER_TYPE) else {
            continue;
        };
        println!("Waiting on key: {}", watch.key());
        match tokio::time::timeout(Duration::from_secs(10), watch.recv()).await {
            Ok(Some(response)) => {
                println!("Clusters received:");
                println!("  version:   {}", response.version_info());
                for name in response.resource_names().into_iter().flatten() {
                    println!("  cluster:   {name}");
                }
                println!();
            }
            Ok(None) => println!("Watch closed\n"),
            Err(_) => println!("No response within 10s\n"),
        }
    }

    println!("Cache entries: {}", orchestrator.cache().len());
    println!("Cache stats:    {:?}", orchestrator.cache().stats().snapshot());
    println!("Upstream stats: {:?}", orchestrator.upstream().stats().snapshot());

    drop(sessions);
    orchestrator.shutdown().await;
    println!("Exiting");
    Ok(())
}

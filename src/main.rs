use distributed_deploy::config::DeploymentConfig;
use distributed_deploy::deployment::{DeploymentManager, ModuleDefinition};
use distributed_deploy::membership::service::MembershipService;
use distributed_deploy::transport::http::HttpTransport;

use anyhow::{Context, anyhow};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--config <file.json>] [--module <name>=<file>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000 --module app.WordCount=wc.bin", args[0]);
        eprintln!("Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000", args[0]);

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut config_path: Option<PathBuf> = None;
    let mut modules: Vec<(String, PathBuf)> = vec![];

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(v)) => bind_addr = Some(v.parse()?),
            ("--seed", Some(v)) => seed_nodes.push(v.parse()?),
            ("--config", Some(v)) => config_path = Some(PathBuf::from(v)),
            ("--module", Some(v)) => {
                let (name, file) = v
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--module expects <name>=<file>, got {}", v))?;
                modules.push((name.to_string(), PathBuf::from(file)));
            }
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    let bind_addr = bind_addr.ok_or_else(|| anyhow!("--bind is required"))?;
    let config = match &config_path {
        Some(path) => DeploymentConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => DeploymentConfig::default(),
    };

    tracing::info!("Starting node on {} (mode: {:?})", bind_addr, config.mode);
    if !seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip); messages go to the HTTP port:
    let http_addr = SocketAddr::new(bind_addr.ip(), bind_addr.port() + 1000);
    let membership = MembershipService::new(bind_addr, http_addr, seed_nodes).await?;
    tracing::info!("Node ID: {}", membership.local_node.id);

    // 2. Transport and deployment:
    let transport = HttpTransport::new(membership.clone());
    let manager = DeploymentManager::new(config, membership.clone(), transport.clone())?;
    manager.start();

    for (name, file) in modules {
        let code = std::fs::read(&file).with_context(|| format!("reading module {}", file.display()))?;
        let module = manager.deploy_local(ModuleDefinition::new(name, code))?;
        let meta = manager.metadata_for(&module);
        tracing::info!("Deployed {} -> {}", module.alias, serde_json::to_string(&meta)?);
    }

    // 3. Spawn membership service:
    let service_clone = membership.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });

    // 4. Spawn stats reporter:
    let stats_manager = manager.clone();
    let stats_service = membership.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_service.get_alive_members();
            let stats = stats_manager.stats();
            tracing::info!(
                "Cluster stats: {} alive nodes, contexts local={} per-loader={} per-version={}, {} pending fetches",
                alive.len(),
                stats.local_contexts,
                stats.per_loader_contexts,
                stats.per_version_contexts,
                stats.pending_fetches
            );
        }
    });

    // 5. Start HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, transport.router())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down");
    manager.stop();
    membership.leave().await;

    Ok(())
}

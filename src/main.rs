use axum::Json;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use replicated_map::api::handlers::*;
use replicated_map::api::protocol::*;
use replicated_map::map::config::{ReplicatedMapConfig, ReplicationStrategy};
use replicated_map::map::replicated::ReplicatedMap;
use replicated_map::membership::types::NodeId;
use replicated_map::transport::http::HttpTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

type NodeMap = ReplicatedMap<String, String>;

/// Filled once the map has joined; client routes answer 503 until then.
type SharedMap = Arc<OnceCell<Arc<NodeMap>>>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const REPLICATE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--id <name>] [--peer <id@addr:port>]... [--name <map>] [--strategy lazy|full]",
            args[0]
        );
        eprintln!("Example: {} --id a --bind 127.0.0.1:6000", args[0]);
        eprintln!(
            "Example: {} --id b --bind 127.0.0.1:6001 --peer a@127.0.0.1:6000",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut local = NodeId::new();
    let mut peers: Vec<(NodeId, SocketAddr)> = vec![];
    let mut config = ReplicatedMapConfig::default().with_terminate(false);

    let mut i = 1;
    while i + 1 < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--id" => {
                local = NodeId::from(args[i + 1].as_str());
                i += 2;
            }
            "--peer" => {
                let Some((id, addr)) = args[i + 1].split_once('@') else {
                    anyhow::bail!("--peer expects <id@addr:port>, got {}", args[i + 1]);
                };
                peers.push((NodeId::from(id), addr.parse()?));
                i += 2;
            }
            "--name" => {
                config.name = args[i + 1].clone();
                i += 2;
            }
            "--strategy" => {
                config.strategy = match args[i + 1].as_str() {
                    "full" => ReplicationStrategy::Full,
                    _ => ReplicationStrategy::Lazy,
                };
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let Some(bind_addr) = bind_addr else {
        anyhow::bail!("--bind is required");
    };

    tracing::info!("Starting node {} on {}", local, bind_addr);
    if !peers.is_empty() {
        tracing::info!("Peers: {:?}", peers);
    } else {
        tracing::info!("Starting without peers");
    }

    // 1. Transport:
    let transport = HttpTransport::new(local, peers);

    // 2. HTTP server, listening before the map joins so that peers can
    //    reach this node as soon as they learn about it:
    let slot: SharedMap = Arc::new(OnceCell::new());
    let app = Router::new()
        .route(ENDPOINT_PUT, post(handle_put_string))
        .route(&format!("{}/:key", ENDPOINT_GET), get(handle_get_string))
        .route(&format!("{}/:key", ENDPOINT_REMOVE), post(handle_remove_string))
        .route(ENDPOINT_STATS, get(handle_stats_string))
        .layer(Extension(slot.clone()))
        .merge(transport.router());

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
            })
            .await
    });

    // 3. Replicated map (joins whichever peers are already up):
    let map: Arc<NodeMap> = ReplicatedMap::new(transport.clone(), config).await?;
    if slot.set(map.clone()).is_err() {
        anyhow::bail!("map was already initialized");
    }

    // 4. Spawn heartbeat (ping + expiry of silent members):
    let heartbeat_transport = transport.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            heartbeat_transport.heartbeat().await;
        }
    });

    // 5. Spawn replicator:
    let replicator = map.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPLICATE_INTERVAL);
        loop {
            interval.tick().await;
            replicator.replicate_all(false).await;
            tracing::info!(
                "Map stats: {} active / {} known entries, members {:?}",
                replicator.size(),
                replicator.size_full(),
                replicator.map_members().await
            );
        }
    });

    // 6. Serve until Ctrl+C:
    tracing::info!("Press Ctrl+C to shutdown");
    server.await??;

    map.shutdown().await;

    Ok(())
}

fn put_unavailable() -> (StatusCode, Json<PutResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(PutResponse {
            success: false,
            previous_json: None,
        }),
    )
}

async fn handle_put_string(
    Extension(slot): Extension<SharedMap>,
    json: Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>) {
    let Some(map) = slot.get() else {
        return put_unavailable();
    };
    handle_put::<String, String>(Extension(map.clone()), json).await
}

async fn handle_get_string(
    Extension(slot): Extension<SharedMap>,
    key: Path<String>,
) -> (StatusCode, Json<GetResponse>) {
    let Some(map) = slot.get() else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(GetResponse { value_json: None }));
    };
    handle_get::<String, String>(Extension(map.clone()), key).await
}

async fn handle_remove_string(
    Extension(slot): Extension<SharedMap>,
    key: Path<String>,
) -> (StatusCode, Json<PutResponse>) {
    let Some(map) = slot.get() else {
        return put_unavailable();
    };
    handle_remove::<String, String>(Extension(map.clone()), key).await
}

async fn handle_stats_string(Extension(slot): Extension<SharedMap>) -> Result<Json<StatsResponse>, StatusCode> {
    let Some(map) = slot.get() else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    Ok(handle_stats::<String, String>(Extension(map.clone())).await)
}

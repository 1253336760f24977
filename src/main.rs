use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use video_coordinator::config::ServerConfig;
use video_coordinator::coordinator::Coordinator;
use video_coordinator::gateway::{LogCertification, LogNotifier, MemoryGateway};
use video_coordinator::server::{routes, Server};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let gateway = Arc::new(MemoryGateway::new());
    if let Some(path) = &config.sessions_file {
        match gateway.load_sessions_file(path).await {
            Ok(count) => info!("Loaded {} sessions from {}", count, path.display()),
            Err(e) => {
                error!("Failed to load sessions: {}", e);
                std::process::exit(1);
            }
        }
    }

    let coordinator = Arc::new(Coordinator::new(
        &config,
        gateway,
        Arc::new(LogNotifier),
        Arc::new(LogCertification),
    ));
    let server = Arc::new(Server::new(coordinator, config.clone()));
    server.spawn_reaper();

    let addr = SocketAddr::new(config.bind, config.port);
    let routes = routes(server);

    if config.use_tls() {
        info!("Starting secure server (HTTPS/WSS) on {}...", addr);
        warp::serve(routes)
            .tls()
            .cert_path(&config.tls_cert_path)
            .key_path(&config.tls_key_path)
            .run(addr)
            .await;
    } else {
        warn!("TLS certificate not found, falling back to HTTP/WS on {}...", addr);
        warp::serve(routes).run(addr).await;
    }
}

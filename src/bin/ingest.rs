// src/bin/ingest.rs
//
// Ingest service entrypoint. Configuration failures exit non-zero before
// the listener binds; a graceful shutdown exits zero.

use sunlink::config::ServerConfig;

#[tokio::main]
async fn main() {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sunlink-ingest: configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = sunlink::server::run(config).await {
        eprintln!("sunlink-ingest: {}", e);
        std::process::exit(1);
    }
}

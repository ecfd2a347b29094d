// src/bin/edge.rs
//
// Edge agent entrypoint. Configuration failures exit non-zero before any
// loop starts; a graceful shutdown exits zero.

use sunlink::config::EdgeConfig;

#[tokio::main]
async fn main() {
    let config = match EdgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sunlink-edge: configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = sunlink::edge::run(config).await {
        eprintln!("sunlink-edge: {}", e);
        std::process::exit(1);
    }
}

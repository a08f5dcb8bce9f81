use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use credgate::cli::{
    Args, IpExtractor, build_settings, init_logging, load_key_material, open_database,
    validate_public_url,
};
use credgate::clock::system_clock;
use credgate::mailer::LogMailer;
use credgate::rate_limit::RateLimitConfig;
use credgate::{ServerConfig, create_app, init_cleanup};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args.log_format);

    let Some(keys) = load_key_material(&args) else {
        std::process::exit(1);
    };

    let Some(db) = open_database(&args.database).await else {
        std::process::exit(1);
    };

    let Some(public_url) = validate_public_url(&args.public_url) else {
        std::process::exit(1);
    };

    let clock = system_clock();
    init_cleanup(&db, &clock).await;

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!(address = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        });

    let local_addr = listener.local_addr().unwrap_or_else(|e| {
        error!(error = %e, "Failed to read listener address");
        std::process::exit(1);
    });

    let config = ServerConfig {
        db,
        jwt: keys.jwt,
        public_key: keys.public_key,
        settings: build_settings(&args, &public_url),
        mailer: Arc::new(LogMailer),
        clock,
        ip_extractor: args.ip_header.map(IpExtractor::from),
        rate_limits: RateLimitConfig::default(),
    };
    let app = create_app(&config);

    info!(address = %local_addr, "Listening");

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(e) = axum::serve(listener, make_service).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

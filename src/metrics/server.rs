// Scrape endpoint - serves the registry in the Prometheus text format
//
// The server runs on its own actix workers, so scrapes are answered while a
// polling pass is in progress. The registry handles concurrent access.

use actix_web::dev::Server;
use actix_web::http::header::ContentType;
use actix_web::web::Data;
use actix_web::{App, HttpResponse, HttpServer};
use prometheus::Registry;
use tracing::{error, info};

use super::encode_registry;

/// Content type of the Prometheus text exposition format
const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Returns all registered metrics.
#[actix_web::get("/metrics")]
pub async fn scrape(registry: Data<Registry>) -> HttpResponse {
    match encode_registry(&registry) {
        Ok(body) => HttpResponse::Ok()
            .insert_header(("Content-Type", TEXT_FORMAT))
            .body(body),
        Err(e) => {
            error!("Failed to encode metrics for scrape: {}", e);
            HttpResponse::InternalServerError()
                .content_type(ContentType::plaintext())
                .body(e.to_string())
        }
    }
}

/// Binds the scrape endpoint on all interfaces and returns the server future.
///
/// The caller decides where the future runs (typically `tokio::spawn`).
/// Signal handling is left to the caller as well.
pub fn start(registry: Registry, port: u16) -> std::io::Result<Server> {
    let registry = Data::new(registry);
    let server = HttpServer::new(move || App::new().app_data(registry.clone()).service(scrape))
        .workers(1)
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();

    info!("Serving metrics on http://0.0.0.0:{}/metrics", port);
    Ok(server)
}

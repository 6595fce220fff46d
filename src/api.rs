//! Ambient HTTP surface (§4.9 of SPEC_FULL.md): a single `GET` route that
//! renders the config snapshot (C8) on demand. Out of scope for spec.md's
//! core design but kept so the crate is runnable end-to-end, the way
//! `examples/original_source/wb-to-ha-yaml.py` wires
//! `handlers.HTTPService.wb_to_ha_yaml` onto `aiohttp`. Grounded on
//! `examples/Hessdev-de-energy2mqtt/src/api/mod.rs`'s `actix-web` usage,
//! without its `utoipa` schema generation since SPEC_FULL doesn't call for
//! a documented API surface.

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use log::{error, info};

use crate::router::CapturedMessages;
use crate::snapshot;

/// Serves the rendered config snapshot from whatever the HA egress router
/// has captured so far (spec.md §4.8).
async fn wb_to_ha_yaml(captured: web::Data<CapturedMessages>) -> impl Responder {
    let snapshot = captured.lock().expect("captured messages mutex poisoned").clone();
    match snapshot::render(&snapshot) {
        Ok(yaml) => HttpResponse::Ok().content_type("text/yaml").body(yaml),
        Err(err) => {
            error!("failed to render config snapshot: {err:#}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

/// Starts the API server. Runs until the process exits; the supervisor's
/// own shutdown does not need to wait on it since it serves no mutating
/// state.
pub async fn serve(bind_addr: &str, captured: CapturedMessages) -> std::io::Result<()> {
    info!("starting HTTP API on {bind_addr}");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(captured.clone()))
            .route("/api/wb_to_ha.yaml", web::get().to(wb_to_ha_yaml))
    })
    .bind(bind_addr)?
    .run()
    .await
}

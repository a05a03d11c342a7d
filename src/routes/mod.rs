//! HTTP route handlers and the router that mounts them.
//!
//! | Method | Path                             | Handler                   |
//! |--------|----------------------------------|---------------------------|
//! | GET    | `/`                              | [`health::root`]          |
//! | GET    | `/health`                        | [`health::health`]        |
//! | GET    | `/ws`, `/ws/{idx}`               | [`crate::ws`]             |
//! | GET    | `/admin/build`                   | [`admin::build`]          |
//! | GET    | `/admin/pool`                    | [`admin::pool`]           |
//! | POST   | `/admin/broadcast`               | [`admin::broadcast`]      |
//! | POST   | `/admin/direct`                  | [`admin::direct`]         |
//! | GET/POST/DELETE | `/admin/rules`          | [`admin`] rule handlers   |
//! | GET    | `/docker/nodes`                  | [`workers::nodes`]        |
//! | GET    | `/docker/{idx}/containers`       | [`workers::containers`]   |
//! | GET/PUT | `/container/store/{id}/history` | [`store`]                 |

pub mod admin;
pub mod health;
pub mod store;
pub mod workers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ws;
use crate::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin/build", get(admin::build))
        .route("/admin/pool", get(admin::pool))
        .route("/admin/broadcast", post(admin::broadcast))
        .route("/admin/direct", post(admin::direct))
        .route(
            "/admin/rules",
            get(admin::get_rules)
                .post(admin::merge_rules)
                .delete(admin::remove_rules),
        )
        .route("/docker/nodes", get(workers::nodes))
        .route("/docker/{idx}/containers", get(workers::containers))
        .route(
            "/container/store/{id}/history",
            get(store::get_history).put(store::append_history),
        );

    let ws_routes = Router::new()
        .route("/ws", get(ws::ws_upgrade_default))
        .route("/ws/{idx}", get(ws::ws_upgrade));

    let mut app = Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .merge(ws_routes)
        .merge(admin_routes);
    if state.config.server.cors {
        app = app.layer(CorsLayer::permissive());
    }
    app.layer(TraceLayer::new_for_http()).with_state(state)
}

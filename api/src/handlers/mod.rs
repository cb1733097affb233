pub mod health;
pub mod move_handler;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn add_routes(router: Router<AppState>) -> Router<AppState> {
    router
        .route(
            "/move",
            post(move_handler::handle_move)
                .options(move_handler::preflight)
                .fallback(move_handler::method_not_allowed),
        )
        .route("/healthz", get(health::healthz))
}

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::sys_numbering::{self, NumberingState};

/// Конфигурация системных роутов приложения
pub fn configure_system_routes(numbering: NumberingState) -> Router {
    Router::new()
        // ========================================
        // HEALTH CHECK
        // ========================================
        .route("/health", get(|| async { "ok" }))
        // ========================================
        // DOCUMENT NUMBERING
        // ========================================
        .route("/api/sys/numbering/sequences", get(sys_numbering::list))
        .route(
            "/api/sys/numbering/snapshot",
            post(sys_numbering::import_snapshot),
        )
        .route(
            "/api/sys/numbering/:domain/:key",
            get(sys_numbering::get_config).put(sys_numbering::update_config),
        )
        .route(
            "/api/sys/numbering/:domain/:key/generate",
            post(sys_numbering::generate),
        )
        .route(
            "/api/sys/numbering/:domain/:key/preview",
            get(sys_numbering::preview),
        )
        .route(
            "/api/sys/numbering/:domain/:key/reserve",
            post(sys_numbering::reserve),
        )
        .route(
            "/api/sys/numbering/:domain/:key/release",
            post(sys_numbering::release),
        )
        .route(
            "/api/sys/numbering/:domain/:key/validate",
            post(sys_numbering::validate),
        )
        .route(
            "/api/sys/numbering/:domain/:key/reset",
            post(sys_numbering::reset),
        )
        .route(
            "/api/sys/numbering/:domain/:key/snapshot",
            get(sys_numbering::export_snapshot),
        )
        .with_state(numbering)
}

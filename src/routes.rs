use crate::handlers;
use crate::state::AppState;
use axum::http::Method;
use axum::routing::{get, post, put};
use axum::Router;
use http::{header, HeaderName, HeaderValue};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("ignoring invalid cors origin {:?}", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-forwarded-for"),
        ])
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.cors_origins);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/content", post(handlers::create_content).get(handlers::list_content))
        .route(
            "/api/v1/content/:id",
            get(handlers::get_content).delete(handlers::delete_content),
        )
        .route("/api/v1/content/:id/share", get(handlers::share_content))
        .route("/api/v1/content/:id/quiz-attempts", post(handlers::submit_quiz_attempt))
        .route("/api/v1/content/:id/course-sessions", post(handlers::start_course_session))
        .route("/api/v1/content/:id/submissions", get(handlers::list_submissions))
        .route("/api/v1/ai/generate-quiz", post(handlers::ai_generate_quiz))
        .route("/api/v1/ai/generate-course", post(handlers::ai_generate_course))
        .route(
            "/api/v1/course-sessions/:id",
            get(handlers::get_course_session).delete(handlers::end_course_session),
        )
        .route("/api/v1/course-sessions/:id/submit", post(handlers::submit_course_module))
        .route("/api/v1/course-sessions/:id/retry", post(handlers::retry_course_module))
        .route("/api/v1/course-sessions/:id/advance", post(handlers::advance_course))
        .route("/api/v1/course-sessions/:id/restart", post(handlers::restart_course))
        .route(
            "/api/v1/communities",
            post(handlers::create_community).get(handlers::list_communities),
        )
        .route("/api/v1/communities/:id", put(handlers::update_community))
        .route("/api/v1/communities/:id/join", post(handlers::join_community))
        .route(
            "/api/v1/communities/:id/posts",
            post(handlers::publish_post).get(handlers::list_posts),
        )
        .route("/api/v1/posts/:id/comments", post(handlers::add_comment))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

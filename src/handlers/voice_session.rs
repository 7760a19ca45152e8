//! REST surface of the voice session lock.
//!
//! Contention is reported in the body (`acquired: false`, `released: false`)
//! with a 200, since losing the race is a normal outcome for callers.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub owner: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub session_id: String,
}

pub async fn get_voice_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let holder = state.voice_lock.holder();

    Ok(HttpResponse::Ok().json(json!({
        "locked": holder.is_some(),
        "holder": holder
    })))
}

pub async fn acquire_voice_session(
    state: web::Data<AppState>,
    body: web::Json<AcquireRequest>,
) -> Result<HttpResponse, AppError> {
    let AcquireRequest { owner, session_id } = body.into_inner();
    let owner = owner.trim();
    if owner.is_empty() {
        return Err(AppError::BadRequest("owner must not be empty".to_string()));
    }
    if matches!(session_id.as_deref(), Some(id) if id.trim().is_empty()) {
        return Err(AppError::BadRequest("session_id must not be empty".to_string()));
    }

    match state.voice_lock.acquire(owner, session_id) {
        Some(session_id) => Ok(HttpResponse::Ok().json(json!({
            "acquired": true,
            "session_id": session_id
        }))),
        None => Ok(HttpResponse::Ok().json(json!({
            "acquired": false,
            "holder": state.voice_lock.holder()
        }))),
    }
}

pub async fn release_voice_session(
    state: web::Data<AppState>,
    body: web::Json<ReleaseRequest>,
) -> Result<HttpResponse, AppError> {
    let released = state.voice_lock.release(&body.session_id);

    Ok(HttpResponse::Ok().json(json!({
        "released": released
    })))
}

pub async fn force_release_voice_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let previous = state.voice_lock.force_release();

    Ok(HttpResponse::Ok().json(json!({
        "released": true,
        "previous": previous
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};

    fn app_state() -> AppState {
        AppState::new(AppConfig::default())
    }

    macro_rules! lock_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .route("/voice-session", web::get().to(get_voice_session))
                    .route("/voice-session/acquire", web::post().to(acquire_voice_session))
                    .route("/voice-session/release", web::post().to(release_voice_session))
                    .route("/voice-session/force-release", web::post().to(force_release_voice_session)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_acquire_contention_and_release() {
        let state = app_state();
        let app = lock_app!(state);

        let req = test::TestRequest::post()
            .uri("/voice-session/acquire")
            .set_json(json!({"owner": "relay"}))
            .to_request();
        let first: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(first["acquired"], true);
        let session_id = first["session_id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri("/voice-session/acquire")
            .set_json(json!({"owner": "recorder"}))
            .to_request();
        let second: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(second["acquired"], false);
        assert_eq!(second["holder"]["owner"], "relay");

        let req = test::TestRequest::post()
            .uri("/voice-session/release")
            .set_json(json!({"session_id": "voice_wrong"}))
            .to_request();
        let wrong: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(wrong["released"], false);
        assert!(state.voice_lock.is_locked());

        let req = test::TestRequest::post()
            .uri("/voice-session/release")
            .set_json(json!({"session_id": session_id}))
            .to_request();
        let released: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(released["released"], true);

        let req = test::TestRequest::get().uri("/voice-session").to_request();
        let status: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["locked"], false);
        assert!(status["holder"].is_null());
    }

    #[actix_web::test]
    async fn test_acquire_with_caller_supplied_id() {
        let state = app_state();
        let app = lock_app!(state);

        let req = test::TestRequest::post()
            .uri("/voice-session/acquire")
            .set_json(json!({"owner": "relay", "session_id": "voice_mine"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session_id"], "voice_mine");
        assert_eq!(state.voice_lock.holder().unwrap().session_id, "voice_mine");
    }

    #[actix_web::test]
    async fn test_empty_owner_is_rejected() {
        let state = app_state();
        let app = lock_app!(state);

        let req = test::TestRequest::post()
            .uri("/voice-session/acquire")
            .set_json(json!({"owner": "  "}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!state.voice_lock.is_locked());
    }

    #[actix_web::test]
    async fn test_force_release_is_idempotent() {
        let state = app_state();
        let app = lock_app!(state);
        state.voice_lock.acquire("stuck", None).unwrap();

        let req = test::TestRequest::post().uri("/voice-session/force-release").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["released"], true);
        assert_eq!(body["previous"]["owner"], "stuck");

        let req = test::TestRequest::post().uri("/voice-session/force-release").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["released"], true);
        assert!(body["previous"].is_null());
        assert!(!state.voice_lock.is_locked());
    }
}

//! Read-only views of sessions and their evaluations.

use crate::{
    error::{AppError, EvaluationError},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Live sessions currently held by the registry.
pub async fn list_live_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let registry = state.lifecycle.registry();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "summary": registry.summary(),
        "sessions": registry.list()
    })))
}

/// The stored session record, plus live progress while the session is running.
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let record = state
        .lifecycle
        .services()
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| EvaluationError::SessionNotFound(session_id.clone()))?;

    let live = state
        .lifecycle
        .registry()
        .get_by_session_id(&session_id)
        .map(|session| session.snapshot());

    Ok(HttpResponse::Ok().json(json!({
        "session": record,
        "live": live
    })))
}

pub async fn get_evaluation(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let evaluation = state
        .lifecycle
        .services()
        .store
        .get_evaluation(&session_id)
        .await?
        .ok_or_else(|| EvaluationError::SessionNotFound(session_id.clone()))?;

    Ok(HttpResponse::Ok().json(evaluation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::record_store::SessionRecord;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};
    use tokio::sync::mpsc::unbounded_channel;

    #[actix_web::test]
    async fn test_session_lookup() {
        let state = web::Data::new(test_state());
        let (tx, _rx) = unbounded_channel();
        let session = state
            .lifecycle
            .start("conn-1", "pres-1", tx, &state.get_config())
            .await
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/sessions/{id}", web::get().to(get_session))
                .route("/evaluations/{id}", web::get().to(get_evaluation))
                .route("/live-sessions", web::get().to(list_live_sessions)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri(&format!("/sessions/{}", session.session_id))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["status"], "active");
        assert_eq!(body["live"]["presentation_id"], "pres-1");

        let req = test::TestRequest::get().uri("/live-sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["summary"]["total_sessions"], 1);

        let req = test::TestRequest::get()
            .uri(&format!("/evaluations/{}", session.session_id))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["presentation_id"], "pres-1");
        assert!(body["report"].is_null());
    }

    #[actix_web::test]
    async fn test_unknown_ids_are_404() {
        let state = web::Data::new(test_state());
        state
            .lifecycle
            .services()
            .store
            .create_session(SessionRecord::new("stored-only", "pres-9"))
            .await
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/sessions/{id}", web::get().to(get_session))
                .route("/evaluations/{id}", web::get().to(get_evaluation)),
        )
        .await;

        let req = test::TestRequest::get().uri("/sessions/missing").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/evaluations/stored-only").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/sessions/stored-only").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert!(body["live"].is_null());
    }
}

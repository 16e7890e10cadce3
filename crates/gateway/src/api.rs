//! HTTP API over the canvas and duel services.
//!
//! Identity is passed explicitly as `user_id`; verifying it is the job of an
//! upstream auth layer.
//!
//! Routes:
//! - POST /api/pixels - Place a canvas pixel
//! - GET /api/pixels/{x}/{y} - Read one pixel
//! - GET /api/canvas - Full canvas (cached) or a region via `x_min..y_max`
//! - GET /api/canvas/size - Canvas dimensions
//! - POST /api/games/create - New solo or PvP game
//! - POST /api/games/join - Join a PvP game by code
//! - GET /api/games/code/{code} - Look up a game by code (participants only)
//! - POST /api/games/{id}/answer - Submit a solo sequence
//! - POST /api/games/{id}/finish - Report a result
//! - POST /api/games/{id}/cancel - Cancel a waiting game
//! - POST /api/games/{id}/pixels - Place a PvP pixel
//! - POST /api/games/queue/join - Enter matchmaking
//! - POST /api/games/queue/leave - Leave matchmaking
//! - GET /api/games/leaderboard - Best level per user (`?limit=N`)

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use canvas::Region;
use game::{Cell, FinishReport, GameMode, DEFAULT_LEADERBOARD_LIMIT};
use realtime::{SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        // Canvas
        .route("/api/pixels", post(place_pixel_handler))
        .route("/api/pixels/{x}/{y}", get(get_pixel_handler))
        .route("/api/canvas", get(get_canvas_handler))
        .route("/api/canvas/size", get(canvas_size_handler))
        // Games
        .route("/api/games/create", post(create_game_handler))
        .route("/api/games/join", post(join_game_handler))
        .route("/api/games/code/{code}", get(game_by_code_handler))
        .route("/api/games/leaderboard", get(leaderboard_handler))
        .route("/api/games/{id}/answer", post(answer_handler))
        .route("/api/games/{id}/finish", post(finish_handler))
        .route("/api/games/{id}/cancel", post(cancel_handler))
        .route("/api/games/{id}/pixels", post(game_pixel_handler))
        // Matchmaking
        .route("/api/games/queue/join", post(queue_join_handler))
        .route("/api/games/queue/leave", post(queue_leave_handler))
}

// ============================================================================
// Canvas
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PlacePixelRequest {
    pub user_id: UserId,
    pub x: u32,
    pub y: u32,
    pub color: String,
}

/// POST /api/pixels
async fn place_pixel_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlacePixelRequest>,
) -> ApiResult<impl IntoResponse> {
    let pixel = state
        .canvas
        .place_pixel(req.user_id, req.x, req.y, &req.color)
        .await?;
    Ok((StatusCode::CREATED, Json(pixel)))
}

/// GET /api/pixels/{x}/{y}
async fn get_pixel_handler(
    State(state): State<Arc<AppState>>,
    Path((x, y)): Path<(u32, u32)>,
) -> ApiResult<impl IntoResponse> {
    match state.canvas.pixel(x, y).await? {
        Some(pixel) => Ok(Json(pixel)),
        None => Err(ApiError::NotFound(format!("No pixel at ({}, {})", x, y))),
    }
}

/// Optional region bounds; all absent means the whole canvas.
#[derive(Debug, Default, Deserialize)]
pub struct CanvasQuery {
    pub x_min: Option<u32>,
    pub y_min: Option<u32>,
    pub x_max: Option<u32>,
    pub y_max: Option<u32>,
}

impl CanvasQuery {
    fn is_full(&self) -> bool {
        matches!(self.x_min, None | Some(0))
            && matches!(self.y_min, None | Some(0))
            && self.x_max.is_none()
            && self.y_max.is_none()
    }
}

/// GET /api/canvas
async fn get_canvas_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CanvasQuery>,
) -> ApiResult<impl IntoResponse> {
    if query.is_full() {
        return Ok(Json(state.canvas.full_canvas().await?));
    }
    let size = state.canvas.size();
    let region = Region {
        x_min: query.x_min.unwrap_or(0),
        y_min: query.y_min.unwrap_or(0),
        x_max: query.x_max.unwrap_or(size.width),
        y_max: query.y_max.unwrap_or(size.height),
    };
    Ok(Json(state.canvas.region(region).await?))
}

/// GET /api/canvas/size
async fn canvas_size_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.canvas.size())
}

// ============================================================================
// Games
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateGameRequest {
    pub user_id: UserId,
    pub mode: GameMode,
}

/// POST /api/games/create
async fn create_game_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGameRequest>,
) -> ApiResult<impl IntoResponse> {
    let game = match req.mode {
        GameMode::Solo => state.engine.create_solo(req.user_id).await?,
        GameMode::Pvp => state.engine.create_pvp(req.user_id).await?,
    };
    Ok(Json(game))
}

#[derive(Debug, Deserialize)]
pub struct JoinGameRequest {
    pub user_id: UserId,
    pub code: String,
}

/// POST /api/games/join
async fn join_game_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinGameRequest>,
) -> ApiResult<impl IntoResponse> {
    let game = state.engine.join_by_code(&req.code, req.user_id).await?;
    Ok(Json(game))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: UserId,
}

/// GET /api/games/code/{code}
async fn game_by_code_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<impl IntoResponse> {
    let game = state.engine.get_by_code(&code, query.user_id).await?;
    Ok(Json(game))
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub user_id: UserId,
    pub sequence: Vec<Cell>,
}

/// POST /api/games/{id}/answer
async fn answer_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .engine
        .submit_answer(id, req.user_id, &req.sequence)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct FinishRequest {
    pub user_id: UserId,
    #[serde(flatten)]
    pub report: FinishReport,
}

/// POST /api/games/{id}/finish
async fn finish_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(req): Json<FinishRequest>,
) -> ApiResult<impl IntoResponse> {
    let result = state.engine.finish(id, req.user_id, req.report).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    pub user_id: UserId,
}

/// POST /api/games/{id}/cancel
async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(req): Json<UserRequest>,
) -> ApiResult<impl IntoResponse> {
    let game = state.engine.cancel(id, req.user_id).await?;
    Ok(Json(game))
}

/// POST /api/games/{id}/pixels
async fn game_pixel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(req): Json<PlacePixelRequest>,
) -> ApiResult<impl IntoResponse> {
    if !canvas::model::is_valid_color(&req.color) {
        return Err(ApiError::bad_request(
            format!("Invalid color '{}', expected #RRGGBB", req.color),
            "INVALID_COLOR",
        ));
    }
    let outcome = state
        .engine
        .place_pixel(id, req.user_id, req.x, req.y, &req.color)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
}

/// GET /api/games/leaderboard
async fn leaderboard_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LEADERBOARD_LIMIT);
    let entries = state.engine.leaderboard(limit).await?;
    Ok(Json(entries))
}

// ============================================================================
// Matchmaking
// ============================================================================

/// POST /api/games/queue/join
async fn queue_join_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.matchmaking.join(req.user_id).await?;
    Ok(Json(outcome))
}

#[derive(Serialize)]
struct LeaveResponse {
    status: &'static str,
}

/// POST /api/games/queue/leave
async fn queue_leave_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserRequest>,
) -> ApiResult<impl IntoResponse> {
    let removed = state.matchmaking.leave(req.user_id).await?;
    Ok(Json(LeaveResponse {
        status: if removed { "left" } else { "not_queued" },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canvas_query_full_detection() {
        assert!(CanvasQuery::default().is_full());
        assert!(CanvasQuery {
            x_min: Some(0),
            ..Default::default()
        }
        .is_full());
        assert!(!CanvasQuery {
            x_max: Some(10),
            ..Default::default()
        }
        .is_full());
        assert!(!CanvasQuery {
            y_min: Some(3),
            ..Default::default()
        }
        .is_full());
    }

    #[test]
    fn test_finish_request_flattens_report() {
        let req: FinishRequest = serde_json::from_str(
            r#"{"user_id":5,"level_reached":7,"correct_answers":6,"errors":1}"#,
        )
        .unwrap();
        assert_eq!(req.user_id, 5);
        assert_eq!(req.report.level_reached, 7);
        assert_eq!(req.report.play_time_seconds, None);
    }
}

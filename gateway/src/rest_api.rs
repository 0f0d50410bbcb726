use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use peerview_ws_proto::{LoginRequest, LoginResponse};
use serde::Serialize;

use crate::AppState;

#[tracing::instrument("login", skip_all)]
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let verdict = state.auth.authenticate(&req.username, &req.password).await?;
    tracing::debug!(?verdict, "login attempt");
    if verdict.is_success() {
        Ok(Json(LoginResponse { success: true }))
    } else {
        Err(ApiError::incorrect_password())
    }
}

#[derive(Serialize)]
struct Detail {
    detail: &'static str,
}

/// Failure of a REST call. Rejections carry a `{"detail": ...}` body,
/// internal failures only the status.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
    #[error("{status}: {detail}")]
    Rejected {
        status: StatusCode,
        detail: &'static str,
    },
}

impl ApiError {
    pub fn incorrect_password() -> Self {
        ApiError::Rejected {
            status: StatusCode::UNAUTHORIZED,
            detail: "Incorrect password",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Rejected { status, .. } => *status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Internal(e) => {
                tracing::error!("request failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            ApiError::Rejected { status, detail } => {
                tracing::info!(%status, detail, "request rejected");
                (status, Json(Detail { detail })).into_response()
            }
        }
    }
}

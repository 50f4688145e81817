//! Error handling subsystem for the rate limiter crate.

use axum::{http::StatusCode, response::IntoResponse, Json};

pub type ClResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	NotFound,
	Internal(String),
	DbError(String),
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
	fn into_response(self) -> axum::response::Response {
		let (status, code, message) = match self {
			Error::NotFound => (
				StatusCode::NOT_FOUND,
				"E-RATE-NOTFOUND",
				"resource not found".to_string(),
			),
			Error::Internal(msg) => {
				tracing::warn!("internal error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-RATE-INTERNAL", "internal error".to_string())
			}
			Error::DbError(msg) => {
				tracing::warn!("db error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-RATE-DBERR", "internal error".to_string())
			}
		};

		let body = serde_json::json!({ "error": { "code": code, "message": message } });
		(status, Json(body)).into_response()
	}
}

impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		tracing::warn!("sqlx error: {}", err);
		Error::DbError(err.to_string())
	}
}

// vim: ts=4

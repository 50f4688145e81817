//! Error handling subsystem. Implements a custom Error type covering the
//! taxonomy of configuration, input validation, upstream-node, ACME, auth
//! and rate-limiting failures.

use axum::{
	http::{header, HeaderValue, StatusCode},
	response::IntoResponse,
	Json,
};
use serde::Serialize;

pub type ClResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	// Core / not found
	NotFound,
	UnknownDomain(String),

	// Auth
	Unauthorized,
	PermissionDenied,
	Banned,

	// Input validation
	ValidationError(String),
	Conflict(String),

	// Upstream node
	NodeError(String),

	// ACME
	AcmeInvalid(String),
	AcmeTimeout,

	// Configuration / system
	ConfigError(String),
	ServiceUnavailable(String),
	Internal(String),

	// Network
	NetworkError(String),
	Timeout,

	// Crypto / TLS
	CryptoError(String),

	// externals
	Io(std::io::Error),
}

#[derive(Serialize)]
struct ErrorBody {
	error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
	code: &'static str,
	message: String,
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
	fn into_response(self) -> axum::response::Response {
		let (status, code, message) = match self {
			Error::NotFound => (StatusCode::NOT_FOUND, "E-CORE-NOTFOUND", "resource not found".to_string()),
			Error::UnknownDomain(d) => {
				(StatusCode::NOT_FOUND, "E-CORE-UNKNOWNDOMAIN", format!("unknown domain: {d}"))
			}
			Error::Unauthorized => {
				(StatusCode::UNAUTHORIZED, "E-AUTH-UNAUTH", "missing or invalid API key".to_string())
			}
			Error::PermissionDenied => {
				(StatusCode::FORBIDDEN, "E-AUTH-NOPERM", "permission denied".to_string())
			}
			Error::Banned => (StatusCode::FORBIDDEN, "E-RATE-BANNED", "address is banned".to_string()),
			Error::ValidationError(msg) => {
				(StatusCode::BAD_REQUEST, "E-VAL-INVALID", msg)
			}
			Error::Conflict(msg) => (StatusCode::CONFLICT, "E-CORE-CONFLICT", msg),
			Error::NodeError(msg) => {
				warn!("upstream node error: {}", msg);
				(StatusCode::BAD_GATEWAY, "E-NODE-ERROR", "upstream node error".to_string())
			}
			Error::AcmeInvalid(msg) => {
				warn!("acme challenge invalid: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-ACME-INVALID", "certificate issuance failed".to_string())
			}
			Error::AcmeTimeout => {
				(StatusCode::INTERNAL_SERVER_ERROR, "E-ACME-TIMEOUT", "certificate issuance timed out".to_string())
			}
			Error::ConfigError(msg) => {
				warn!("config error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-CONF-CFGERR", "internal server error".to_string())
			}
			Error::ServiceUnavailable(msg) => {
				(StatusCode::SERVICE_UNAVAILABLE, "E-SYS-UNAVAIL", msg)
			}
			Error::Internal(msg) => {
				warn!("internal error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-CORE-INTERNAL", "internal server error".to_string())
			}
			Error::NetworkError(msg) => {
				warn!("network error: {}", msg);
				(StatusCode::BAD_GATEWAY, "E-NET-ERROR", "network error".to_string())
			}
			Error::Timeout => (StatusCode::GATEWAY_TIMEOUT, "E-NET-TIMEOUT", "request timeout".to_string()),
			Error::CryptoError(msg) => {
				warn!("crypto error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-CRYPT-FAIL", "internal server error".to_string())
			}
			Error::Io(err) => {
				warn!("io error: {}", err);
				(StatusCode::INTERNAL_SERVER_ERROR, "E-SYS-IO", "internal server error".to_string())
			}
		};

		(status, Json(ErrorBody { error: ErrorDetail { code, message } })).into_response()
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		warn!("json error: {}", err);
		Error::Internal(format!("json error: {err}"))
	}
}

impl From<tokio::task::JoinError> for Error {
	fn from(err: tokio::task::JoinError) -> Self {
		warn!("join error: {}", err);
		Error::ServiceUnavailable("background task failed".into())
	}
}

impl From<instant_acme::Error> for Error {
	fn from(err: instant_acme::Error) -> Self {
		warn!("acme error: {}", err);
		Error::ConfigError(format!("ACME error: {err}"))
	}
}

impl From<pem::PemError> for Error {
	fn from(err: pem::PemError) -> Self {
		warn!("pem error: {}", err);
		Error::CryptoError("PEM parsing error".into())
	}
}

impl From<rustls::Error> for Error {
	fn from(err: rustls::Error) -> Self {
		warn!("rustls error: {}", err);
		Error::CryptoError("TLS error".into())
	}
}

impl From<rustls_pki_types::pem::Error> for Error {
	fn from(err: rustls_pki_types::pem::Error) -> Self {
		warn!("pem error: {}", err);
		Error::CryptoError("PEM parsing error".into())
	}
}

impl From<x509_parser::asn1_rs::Err<x509_parser::error::X509Error>> for Error {
	fn from(err: x509_parser::asn1_rs::Err<x509_parser::error::X509Error>) -> Self {
		warn!("x509 error: {}", err);
		Error::CryptoError("X.509 certificate error".into())
	}
}

impl From<hyper::Error> for Error {
	fn from(err: hyper::Error) -> Self {
		warn!("hyper error: {}", err);
		Error::NetworkError("HTTP client error".into())
	}
}

impl From<hyper_util::client::legacy::Error> for Error {
	fn from(err: hyper_util::client::legacy::Error) -> Self {
		warn!("hyper error: {}", err);
		Error::NetworkError("HTTP client error".into())
	}
}

impl From<axum::http::Error> for Error {
	fn from(err: axum::http::Error) -> Self {
		warn!("http error: {}", err);
		Error::Internal(format!("http error: {err}"))
	}
}

impl From<axum::Error> for Error {
	fn from(err: axum::Error) -> Self {
		warn!("axum error: {}", err);
		Error::NetworkError("axum error".into())
	}
}

impl From<url::ParseError> for Error {
	fn from(err: url::ParseError) -> Self {
		Error::ValidationError(format!("invalid URL: {err}"))
	}
}

impl From<truthgate_ratelimit::Error> for Error {
	fn from(err: truthgate_ratelimit::Error) -> Self {
		warn!("rate-limit error: {}", err);
		Error::ServiceUnavailable("rate limiter error".into())
	}
}

/// Lock a `std::sync::Mutex`/`RwLock`, recovering from poisoning into an
/// `Error::Internal` rather than panicking.
#[macro_export]
macro_rules! lock {
	($mutex:expr) => {
		$mutex.lock().map_err(|_| $crate::error::Error::Internal("mutex poisoned".into()))
	};
	($mutex:expr, $context:expr) => {
		$mutex
			.lock()
			.map_err(|_| $crate::error::Error::Internal(format!("mutex poisoned: {}", $context)))
	};
}

// vim: ts=4

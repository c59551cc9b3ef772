use crate::config::ConfigError;
use crate::delivery::TransportError;
use crate::population::PopulationImportError;
use crate::scoring::{ScoringError, TablesError};
use crate::telemetry::TelemetryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

/// Startup and process-level failures. Request-level errors live with their modules.
#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    ScoringTables(TablesError),
    PopulationImport(PopulationImportError),
    Subscriptions(serde_json::Error),
    Scoring(ScoringError),
    Transport(TransportError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::ScoringTables(err) => write!(f, "scoring tables error: {}", err),
            AppError::PopulationImport(err) => write!(f, "population import error: {}", err),
            AppError::Subscriptions(err) => write!(f, "subscription file error: {}", err),
            AppError::Scoring(err) => write!(f, "scoring error: {}", err),
            AppError::Transport(err) => write!(f, "webhook transport error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::ScoringTables(err) => Some(err),
            AppError::PopulationImport(err) => Some(err),
            AppError::Subscriptions(err) => Some(err),
            AppError::Scoring(err) => Some(err),
            AppError::Transport(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Scoring(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::PopulationImport(_) | AppError::ScoringTables(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_)
            | AppError::Telemetry(_)
            | AppError::Io(_)
            | AppError::Server(_)
            | AppError::Subscriptions(_)
            | AppError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<TablesError> for AppError {
    fn from(value: TablesError) -> Self {
        Self::ScoringTables(value)
    }
}

impl From<PopulationImportError> for AppError {
    fn from(value: PopulationImportError) -> Self {
        Self::PopulationImport(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Subscriptions(value)
    }
}

impl From<ScoringError> for AppError {
    fn from(value: ScoringError) -> Self {
        Self::Scoring(value)
    }
}

impl From<TransportError> for AppError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

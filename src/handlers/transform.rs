use axum::Json;
use chrono::Utc;
use ethers::utils::keccak256;
use uuid::Uuid;

use crate::{
    error::PayGateError,
    models::{ApiResponse, TransformOutput, TransformRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Echo,
    Reverse,
    Uppercase,
    Hash,
}

impl Transform {
    pub const ALL: [Transform; 4] = [Self::Echo, Self::Reverse, Self::Uppercase, Self::Hash];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Reverse => "reverse",
            Self::Uppercase => "uppercase",
            Self::Hash => "hash",
        }
    }

    pub fn path(&self) -> String {
        format!("/api/{}", self.name())
    }

    pub fn apply(&self, text: &str) -> String {
        match self {
            Self::Echo => text.to_string(),
            Self::Reverse => text.chars().rev().collect(),
            Self::Uppercase => text.to_uppercase(),
            Self::Hash => format!("0x{}", hex::encode(keccak256(text.as_bytes()))),
        }
    }
}

fn run(
    transform: Transform,
    request: TransformRequest,
) -> Result<Json<ApiResponse<TransformOutput>>, PayGateError> {
    if request.text.is_empty() {
        return Err(PayGateError::BadRequest("text must not be empty".to_string()));
    }

    Ok(Json(ApiResponse {
        success: true,
        data: TransformOutput {
            operation: transform.name().to_string(),
            result: transform.apply(&request.text),
            input: request.text,
        },
        timestamp: Utc::now(),
        request_id: Uuid::new_v4().to_string(),
    }))
}

pub async fn echo(
    Json(request): Json<TransformRequest>,
) -> Result<Json<ApiResponse<TransformOutput>>, PayGateError> {
    run(Transform::Echo, request)
}

pub async fn reverse(
    Json(request): Json<TransformRequest>,
) -> Result<Json<ApiResponse<TransformOutput>>, PayGateError> {
    run(Transform::Reverse, request)
}

pub async fn uppercase(
    Json(request): Json<TransformRequest>,
) -> Result<Json<ApiResponse<TransformOutput>>, PayGateError> {
    run(Transform::Uppercase, request)
}

pub async fn hash(
    Json(request): Json<TransformRequest>,
) -> Result<Json<ApiResponse<TransformOutput>>, PayGateError> {
    run(Transform::Hash, request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transforms() {
        assert_eq!(Transform::Echo.apply("abc"), "abc");
        assert_eq!(Transform::Reverse.apply("héllo"), "olléh");
        assert_eq!(Transform::Uppercase.apply("abc"), "ABC");
        assert_eq!(
            Transform::Hash.apply(""),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(Transform::Hash.path(), "/api/hash");
    }

    #[test]
    fn test_empty_text_is_rejected() {
        let result = run(
            Transform::Echo,
            TransformRequest {
                text: String::new(),
            },
        );
        assert!(matches!(result, Err(PayGateError::BadRequest(_))));
    }
}

//! Demo API
//!
//! A small order service for debug sessions to record. Handlers return
//! `AppError` on failure so captured records carry the exception facet.

use axum::{extract::Path, http::StatusCode, Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

use debugtap_common::{
    errors::{AppError, Result},
    AuthenticatedUser,
};

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,

    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 64))]
    pub sku: String,

    #[validate(range(min = 1, max = 1000))]
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: i64,
    pub sku: String,
    pub quantity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placed_by: Option<i64>,
}

fn catalogue() -> Vec<Order> {
    [(1, "KB-001", 2), (2, "MS-104", 1), (3, "HD-220", 5)]
        .into_iter()
        .map(|(id, sku, quantity)| Order {
            id,
            sku: sku.to_string(),
            quantity,
            placed_by: None,
        })
        .collect()
}

/// Issues an opaque token; the password never reaches the response
pub async fn login(Json(request): Json<LoginRequest>) -> Result<Json<Value>> {
    request.validate()?;

    Ok(Json(json!({
        "email": request.email,
        "token": issue_token(&request.email),
    })))
}

fn issue_token(email: &str) -> String {
    let hash = email
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    format!("tok_{:x}", hash)
}

pub async fn list_orders() -> Json<Vec<Order>> {
    Json(catalogue())
}

pub async fn get_order(Path(id): Path<i64>) -> Result<Json<Order>> {
    catalogue()
        .into_iter()
        .find(|o| o.id == id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound {
            resource_type: "order".to_string(),
            id: id.to_string(),
        })
}

pub async fn create_order(
    user: Option<Extension<AuthenticatedUser>>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>)> {
    request.validate()?;

    let order = Order {
        id: catalogue().len() as i64 + 1,
        sku: request.sku,
        quantity: request.quantity,
        placed_by: user.map(|Extension(AuthenticatedUser(id))| id),
    };

    Ok((StatusCode::CREATED, Json(order)))
}

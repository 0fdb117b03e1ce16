use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{LedgerError, Result};
use crate::models::{
    AccountSummary, CreateAccountData, HistoryQuery, HistoryRecord, LedgerEntry, Reconciliation,
};
use crate::services::loyalty::Registration;
use crate::services::verification::Activated;

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub account_id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub verification_expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct EmailQuery {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PhoneQuery {
    pub phone: String,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub available: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    pub email: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct IssueTokenRequest {
    pub ttl_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TokenIssuedResponse {
    pub account_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ActivationResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct EarnRequest {
    pub points: Decimal,
    pub reason: Option<String>,
    pub order_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub points: Decimal,
    pub order_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderRequest {
    pub order_total: Decimal,
    pub order_reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PurchasePointsResponse {
    pub awarded: bool,
    pub entry: Option<LedgerEntry>,
}

#[derive(Debug, Serialize)]
pub struct DiscountResponse {
    pub applied: bool,
    pub discount: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct ExpireResponse {
    pub expired: bool,
    pub entry: Option<LedgerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: Uuid,
    pub at: DateTime<Utc>,
    pub balance: Decimal,
}

#[derive(Debug, Serialize)]
pub struct ReconciliationResponse {
    #[serde(flatten)]
    pub reconciliation: Reconciliation,
    pub consistent: bool,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    #[serde(flatten)]
    pub summary: AccountSummary,
    pub checked_on: NaiveDate,
}

/// Renders an activation attempt as `{success, message}`.
///
/// Token and account problems are reported in the body; contention and
/// storage failures keep the regular error response.
fn activation_response(result: Result<Activated>) -> Result<Response> {
    match result {
        Ok(activated) => {
            tracing::info!(account_id = %activated.account.id, "Loyalty account verified");
            Ok(Json(ActivationResponse {
                success: true,
                message: "Account activated".to_string(),
            })
            .into_response())
        }
        Err(e) if e.is_retryable() || matches!(e, LedgerError::Storage(_)) => Err(e),
        Err(e) => Ok((
            e.status(),
            Json(ActivationResponse {
                success: false,
                message: e.to_string(),
            }),
        )
            .into_response()),
    }
}

async fn register(
    State(state): State<AppState>,
    Json(data): Json<CreateAccountData>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let Registration { account, token } = state.service.register(data).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            account_id: account.id,
            is_active: account.is_active(),
            email: account.email,
            verification_expires_at: token.expires_at,
        }),
    ))
}

async fn email_availability(
    State(state): State<AppState>,
    Query(query): Query<EmailQuery>,
) -> Result<Json<AvailabilityResponse>> {
    let available = state.service.is_email_available(&query.email).await?;
    Ok(Json(AvailabilityResponse { available }))
}

async fn phone_availability(
    State(state): State<AppState>,
    Query(query): Query<PhoneQuery>,
) -> Result<Json<AvailabilityResponse>> {
    let available = state.service.is_phone_available(&query.phone).await?;
    Ok(Json(AvailabilityResponse { available }))
}

async fn resend_verification(
    State(state): State<AppState>,
    Json(request): Json<ResendRequest>,
) -> Result<(StatusCode, Json<TokenIssuedResponse>)> {
    let token = state.service.resend_verification(&request.email).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TokenIssuedResponse {
            account_id: token.account_id,
            expires_at: token.expires_at,
        }),
    ))
}

async fn verify_link(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response> {
    activation_response(state.service.activate_by_token(&token).await)
}

async fn issue_token(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    request: Option<Json<IssueTokenRequest>>,
) -> Result<(StatusCode, Json<TokenIssuedResponse>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let ttl = request
        .ttl_hours
        .map(|hours| {
            Duration::try_hours(hours)
                .ok_or_else(|| LedgerError::InvalidInput("ttl_hours is out of range".to_string()))
        })
        .transpose()?;

    let token = state.service.issue_token(account_id, ttl).await?;

    Ok((
        StatusCode::CREATED,
        Json(TokenIssuedResponse {
            account_id,
            expires_at: token.expires_at,
        }),
    ))
}

async fn activate(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<ActivateRequest>,
) -> Result<Response> {
    activation_response(state.service.activate(account_id, &request.token).await)
}

async fn earn(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<EarnRequest>,
) -> Result<(StatusCode, Json<LedgerEntry>)> {
    let entry = state
        .service
        .earn(
            account_id,
            request.points,
            request.reason,
            request.order_reference,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(entry)))
}

async fn redeem(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<RedeemRequest>,
) -> Result<(StatusCode, Json<LedgerEntry>)> {
    let entry = state
        .service
        .redeem(account_id, request.points, request.order_reference)
        .await?;

    Ok((StatusCode::CREATED, Json(entry)))
}

async fn purchase_points(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<OrderRequest>,
) -> Result<Json<PurchasePointsResponse>> {
    let entry = state
        .service
        .award_purchase_points(account_id, request.order_total, request.order_reference)
        .await?;

    Ok(Json(PurchasePointsResponse {
        awarded: entry.is_some(),
        entry,
    }))
}

async fn first_purchase_discount(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<OrderRequest>,
) -> Result<Json<DiscountResponse>> {
    let discount = state
        .service
        .apply_first_purchase_discount(account_id, request.order_total, request.order_reference)
        .await?;

    Ok(Json(DiscountResponse {
        applied: discount.is_some(),
        discount,
    }))
}

async fn expire(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<ExpireResponse>> {
    let entry = state.service.expire_points(account_id).await?;

    Ok(Json(ExpireResponse {
        expired: entry.is_some(),
        entry,
    }))
}

async fn summary(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<SummaryResponse>> {
    let summary = state.service.summary(account_id).await?;

    Ok(Json(SummaryResponse {
        summary,
        checked_on: state.service.today(),
    }))
}

async fn history(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryRecord>>> {
    let records = state.service.export_history(account_id, &query).await?;
    Ok(Json(records))
}

async fn balance(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<BalanceResponse>> {
    let at = query.at.unwrap_or_else(Utc::now);
    let balance = state.service.balance_at(account_id, at).await?;

    Ok(Json(BalanceResponse {
        account_id,
        at,
        balance,
    }))
}

async fn reconciliation(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<ReconciliationResponse>> {
    let reconciliation = state.service.reconcile(account_id).await?;

    Ok(Json(ReconciliationResponse {
        consistent: reconciliation.is_consistent(),
        reconciliation,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/loyalty/accounts", post(register))
        .route("/loyalty/availability/email", get(email_availability))
        .route("/loyalty/availability/phone", get(phone_availability))
        .route("/loyalty/verification/resend", post(resend_verification))
        .route("/loyalty/verify/:token", get(verify_link))
        .route("/loyalty/accounts/:id/tokens", post(issue_token))
        .route("/loyalty/accounts/:id/activate", post(activate))
        .route("/loyalty/accounts/:id/earn", post(earn))
        .route("/loyalty/accounts/:id/redeem", post(redeem))
        .route("/loyalty/accounts/:id/purchase-points", post(purchase_points))
        .route(
            "/loyalty/accounts/:id/first-purchase-discount",
            post(first_purchase_discount),
        )
        .route("/loyalty/accounts/:id/expire", post(expire))
        .route("/loyalty/accounts/:id/summary", get(summary))
        .route("/loyalty/accounts/:id/history", get(history))
        .route("/loyalty/accounts/:id/balance", get(balance))
        .route("/loyalty/accounts/:id/reconciliation", get(reconciliation))
}

use axum::{
    Json,
    extract::{Path, Query, State},
};
use axum_valid::Valid;
use serde::{Deserialize, Serialize};

use super::{acting_user, error::ApiError, get_services};
use crate::{
    AppState,
    middleware::RequireAuth,
    models::{CreateProviderCredential, ProviderCredentialResponse, RevealedCredential},
};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_inactive: bool,
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TargetQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CredentialListResponse {
    pub data: Vec<ProviderCredentialResponse>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    pub provider: String,
}

#[tracing::instrument(name = "api_keys.list", skip_all)]
pub async fn list(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Query(query): Query<ListQuery>,
) -> Result<Json<CredentialListResponse>, ApiError> {
    let services = get_services(&state)?;
    let user_id = acting_user(&identity, query.user_id.as_deref())?;
    let credentials = services
        .provider_credentials
        .list(&user_id, query.include_inactive)
        .await?;

    Ok(Json(CredentialListResponse {
        data: credentials.into_iter().map(Into::into).collect(),
    }))
}

/// Create or replace the key for a provider. A soft-deleted key is reactivated.
#[tracing::instrument(name = "api_keys.upsert", skip_all)]
pub async fn upsert(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Valid(Json(input)): Valid<Json<CreateProviderCredential>>,
) -> Result<Json<ProviderCredentialResponse>, ApiError> {
    let services = get_services(&state)?;
    let user_id = acting_user(&identity, input.user_id.as_deref())?;
    let credential = services
        .provider_credentials
        .store(&user_id, &input)
        .await?;
    Ok(Json(credential.into()))
}

#[tracing::instrument(name = "api_keys.delete", skip_all, fields(provider = %provider))]
pub async fn delete(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Path(provider): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let services = get_services(&state)?;
    services
        .provider_credentials
        .delete(&identity.user_id, &provider)
        .await?;
    Ok(Json(MessageResponse {
        message: "API key deleted".to_string(),
        provider,
    }))
}

#[tracing::instrument(name = "api_keys.hard_delete", skip_all, fields(provider = %provider))]
pub async fn hard_delete(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Path(provider): Path<String>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let services = get_services(&state)?;
    let user_id = acting_user(&identity, query.user_id.as_deref())?;
    services
        .provider_credentials
        .hard_delete(&user_id, &provider)
        .await?;
    Ok(Json(MessageResponse {
        message: "API key permanently deleted".to_string(),
        provider,
    }))
}

#[tracing::instrument(name = "api_keys.restore", skip_all, fields(provider = %provider))]
pub async fn restore(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Path(provider): Path<String>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<ProviderCredentialResponse>, ApiError> {
    let services = get_services(&state)?;
    let user_id = acting_user(&identity, query.user_id.as_deref())?;
    let credential = services
        .provider_credentials
        .restore(&user_id, &provider)
        .await?;
    Ok(Json(credential.into()))
}

/// Decrypted key for internal callers. Mounted behind the `internal` role guard.
#[tracing::instrument(name = "api_keys.secret", skip_all, fields(provider = %provider))]
pub async fn secret(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Path(provider): Path<String>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<RevealedCredential>, ApiError> {
    let services = get_services(&state)?;
    // Internal callers fetch keys on behalf of any user
    let user_id = query.user_id.unwrap_or(identity.user_id);
    let revealed = services
        .provider_credentials
        .reveal(&user_id, &provider)
        .await?;
    Ok(Json(revealed))
}

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use std::str::FromStr;
use std::sync::Arc;

use super::protocol::{GetResponse, PutRequest, PutResponse, StatsResponse};
use crate::map::replicated::ReplicatedMap;
use crate::map::value::{MapKey, MapValue};

fn to_json<V: MapValue>(value: Option<V>) -> Option<String> {
    value.and_then(|value| match serde_json::to_string(&value) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("Failed to serialize value: {}", e);
            None
        }
    })
}

fn parse_key<K>(raw: &str) -> Option<K>
where
    K: FromStr,
    <K as FromStr>::Err: std::fmt::Display,
{
    match raw.parse() {
        Ok(key) => Some(key),
        Err(e) => {
            tracing::error!("Failed to parse key: {}", e);
            None
        }
    }
}

pub async fn handle_put<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>)
where
    K: MapKey + FromStr,
    <K as FromStr>::Err: std::fmt::Display,
    V: MapValue,
{
    let failed = |status| {
        (
            status,
            Json(PutResponse {
                success: false,
                previous_json: None,
            }),
        )
    };

    let Some(key) = parse_key::<K>(&req.key) else {
        return failed(StatusCode::BAD_REQUEST);
    };
    let value: V = match serde_json::from_str(&req.value_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Failed to deserialize value: {}", e);
            return failed(StatusCode::BAD_REQUEST);
        }
    };

    match map.put(key, value, req.notify).await {
        Ok(previous) => (
            StatusCode::OK,
            Json(PutResponse {
                success: true,
                previous_json: to_json(previous),
            }),
        ),
        Err(e) => {
            tracing::error!("Failed to put: {}", e);
            failed(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

pub async fn handle_get<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Path(key_str): Path<String>,
) -> (StatusCode, Json<GetResponse>)
where
    K: MapKey + FromStr,
    <K as FromStr>::Err: std::fmt::Display,
    V: MapValue,
{
    let Some(key) = parse_key::<K>(&key_str) else {
        return (StatusCode::BAD_REQUEST, Json(GetResponse { value_json: None }));
    };

    match map.get(&key).await {
        Some(value) => match to_json(Some(value)) {
            Some(value_json) => (
                StatusCode::OK,
                Json(GetResponse {
                    value_json: Some(value_json),
                }),
            ),
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GetResponse { value_json: None }),
            ),
        },
        None => (StatusCode::NOT_FOUND, Json(GetResponse { value_json: None })),
    }
}

pub async fn handle_remove<K, V>(
    Extension(map): Extension<Arc<ReplicatedMap<K, V>>>,
    Path(key_str): Path<String>,
) -> (StatusCode, Json<PutResponse>)
where
    K: MapKey + FromStr,
    <K as FromStr>::Err: std::fmt::Display,
    V: MapValue,
{
    let Some(key) = parse_key::<K>(&key_str) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(PutResponse {
                success: false,
                previous_json: None,
            }),
        );
    };

    match map.remove(&key, true).await {
        Ok(previous) => (
            StatusCode::OK,
            Json(PutResponse {
                success: true,
                previous_json: to_json(previous),
            }),
        ),
        Err(e) => {
            tracing::error!("Failed to remove: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(PutResponse {
                    success: false,
                    previous_json: None,
                }),
            )
        }
    }
}

pub async fn handle_stats<K, V>(Extension(map): Extension<Arc<ReplicatedMap<K, V>>>) -> Json<StatsResponse>
where
    K: MapKey,
    V: MapValue,
{
    Json(StatsResponse {
        map_name: map.map_name().to_string(),
        local_member: map.local_member().to_string(),
        state: format!("{:?}", map.state()),
        members: map
            .map_members()
            .await
            .into_iter()
            .map(|member| member.to_string())
            .collect(),
        size: map.size(),
        size_full: map.size_full(),
    })
}

// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use clanbot_common::{
    ALL_CLANS, CLAN_CAPACITY, COMPLETE_MARKER, Clan, ClanGroup, CompletionSet, DistributeRequest,
    DistributionResult, DistributionSummary, HOLD_ACTION, Identifier, MESSAGE_CHAR_BUDGET,
    OverrideEntry, OverrideKind, PersistedState, PlayerRecord, UNKNOWN_LABEL, canonical_identifier,
    expand_env_vars, mention_platform_id, parse_metric, split_blocks,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    session: Arc<RwLock<SessionState>>,
    roster_store: Arc<dyn RosterStore>,
    sink: Option<Arc<dyn NotificationSink>>,
    capacity: usize,
}

/// The one mutable session owned by this process: the latest distribution,
/// the completion set, and the pinned membership of the last posted
/// "still to move" list.
#[derive(Default)]
struct SessionState {
    current: Option<DistributionResult>,
    completed: CompletionSet,
    remaining_pin: Option<Vec<Identifier>>,
}

#[async_trait]
trait RosterStore: Send + Sync {
    async fn fetch_roster(&self, metric_name: &str) -> anyhow::Result<Vec<PlayerRecord>>;
    async fn write_manual_action(&self, external_id: &str, action: &str) -> anyhow::Result<()>;
    async fn clear_manual_actions(&self) -> anyhow::Result<u64>;
    async fn copy_source_to_working(&self) -> anyhow::Result<()>;
    async fn save_state(&self, state: &PersistedState) -> anyhow::Result<()>;
    async fn load_state(&self) -> anyhow::Result<Option<PersistedState>>;
}

#[async_trait]
trait NotificationSink: Send + Sync {
    async fn post_blocks(&self, blocks: &[String]) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct SheetsRosterStore {
    client: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    api_token: String,
    roster_range: String,
    source_range: String,
    state_range: String,
    columns: ColumnAliases,
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl SheetsRosterStore {
    fn from_env(client: reqwest::Client, columns: ColumnAliases) -> Self {
        Self {
            client,
            base_url: std::env::var("SHEETS_API_BASE_URL")
                .ok()
                .unwrap_or_else(|| "https://sheets.googleapis.com/v4/spreadsheets".to_string()),
            spreadsheet_id: std::env::var("SHEETS_SPREADSHEET_ID")
                .ok()
                .unwrap_or_default(),
            api_token: std::env::var("SHEETS_API_TOKEN").ok().unwrap_or_default(),
            roster_range: std::env::var("SHEETS_ROSTER_RANGE")
                .ok()
                .unwrap_or_else(|| "Roster!A1:Z".to_string()),
            source_range: std::env::var("SHEETS_SOURCE_RANGE")
                .ok()
                .unwrap_or_else(|| "Stats!A1:Z".to_string()),
            state_range: std::env::var("SHEETS_STATE_RANGE")
                .ok()
                .unwrap_or_else(|| "BotState!A1".to_string()),
            columns,
        }
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/{}/values/{}",
            self.base_url.trim_end_matches('/'),
            self.spreadsheet_id,
            range
        )
    }

    async fn get_values(&self, range: &str) -> anyhow::Result<Vec<Vec<String>>> {
        let response = self
            .client
            .get(self.values_url(range))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .with_context(|| format!("failed to fetch sheet range {range}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read sheet response body")?;
        if !status.is_success() {
            anyhow::bail!("sheet read for {range} returned {status}: {body}");
        }

        let parsed = serde_json::from_str::<ValueRange>(&body)
            .with_context(|| format!("invalid sheet values payload for {range}"))?;
        Ok(parsed
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }

    async fn put_values(&self, range: &str, values: Vec<Vec<String>>) -> anyhow::Result<()> {
        let url = format!("{}?valueInputOption=RAW", self.values_url(range));
        let payload = serde_json::json!({ "range": range, "values": values });
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("failed to write sheet range {range}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("sheet write for {range} returned {status}: {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl RosterStore for SheetsRosterStore {
    async fn fetch_roster(&self, metric_name: &str) -> anyhow::Result<Vec<PlayerRecord>> {
        let rows = self.get_values(&self.roster_range).await?;
        let Some(headers) = rows.first() else {
            return Ok(Vec::new());
        };

        let map = resolve_columns(headers, &self.columns, metric_name);
        if map.metric.is_none() && !metric_name.trim().is_empty() {
            warn!(
                metric = %metric_name,
                range = %self.roster_range,
                "metric column not found in roster headers; all metrics default to 0"
            );
        }

        Ok(rows[1..]
            .iter()
            .filter_map(|row| record_from_row(row, &map, headers))
            .collect())
    }

    async fn write_manual_action(&self, external_id: &str, action: &str) -> anyhow::Result<()> {
        let rows = self.get_values(&self.roster_range).await?;
        let Some(headers) = rows.first() else {
            anyhow::bail!("roster range {} is empty", self.roster_range);
        };

        let map = resolve_columns(headers, &self.columns, "");
        let id_column = map
            .external_id
            .ok_or_else(|| anyhow::anyhow!("roster has no platform id column"))?;
        let action_column = map
            .action
            .ok_or_else(|| anyhow::anyhow!("roster has no manual action column"))?;

        let data_offset = rows[1..]
            .iter()
            .position(|row| {
                row.get(id_column).map(|cell| cell.trim()) == Some(external_id.trim())
            })
            .ok_or_else(|| {
                anyhow::anyhow!("player id {external_id} not present in roster range")
            })?;

        let (sheet, start_col, start_row) = parse_range_origin(&self.roster_range)?;
        let cell = format!(
            "{}!{}{}",
            sheet,
            column_letter(start_col + action_column),
            start_row + 1 + data_offset
        );
        self.put_values(&cell, vec![vec![action.to_string()]]).await
    }

    async fn clear_manual_actions(&self) -> anyhow::Result<u64> {
        let rows = self.get_values(&self.roster_range).await?;
        let Some(headers) = rows.first() else {
            return Ok(0);
        };

        let map = resolve_columns(headers, &self.columns, "");
        let Some(action_column) = map.action else {
            return Ok(0);
        };

        let cleared = rows[1..]
            .iter()
            .filter(|row| {
                row.get(action_column)
                    .map(|cell| !cell.trim().is_empty())
                    .unwrap_or(false)
            })
            .count() as u64;
        if cleared == 0 {
            return Ok(0);
        }

        let (sheet, start_col, start_row) = parse_range_origin(&self.roster_range)?;
        let letter = column_letter(start_col + action_column);
        let range = format!(
            "{}!{}{}:{}{}",
            sheet,
            letter,
            start_row + 1,
            letter,
            start_row + rows.len() - 1
        );
        let blanks = vec![vec![String::new()]; rows.len() - 1];
        self.put_values(&range, blanks).await?;
        Ok(cleared)
    }

    async fn copy_source_to_working(&self) -> anyhow::Result<()> {
        let rows = self.get_values(&self.source_range).await?;
        if rows.is_empty() {
            anyhow::bail!("source range {} is empty", self.source_range);
        }
        self.put_values(&self.roster_range, rows).await
    }

    async fn save_state(&self, state: &PersistedState) -> anyhow::Result<()> {
        let encoded = serde_json::to_string(state).context("failed to encode bot state blob")?;
        self.put_values(&self.state_range, vec![vec![encoded]]).await
    }

    async fn load_state(&self) -> anyhow::Result<Option<PersistedState>> {
        let rows = self.get_values(&self.state_range).await?;
        let Some(cell) = rows
            .first()
            .and_then(|row| row.first())
            .map(|cell| cell.trim().to_string())
            .filter(|cell| !cell.is_empty())
        else {
            return Ok(None);
        };

        match serde_json::from_str::<PersistedState>(&cell) {
            Ok(blob) => Ok(Some(blob)),
            Err(error) => {
                warn!(
                    range = %self.state_range,
                    error = %error,
                    "persisted bot state cell is not parseable; ignoring it"
                );
                Ok(None)
            }
        }
    }
}

fn cell_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ColumnMap {
    name: Option<usize>,
    mention: Option<usize>,
    external_id: Option<usize>,
    clan: Option<usize>,
    action: Option<usize>,
    metric: Option<usize>,
}

fn resolve_columns(headers: &[String], aliases: &ColumnAliases, metric_name: &str) -> ColumnMap {
    let find = |candidates: &[String]| {
        headers.iter().position(|header| {
            candidates
                .iter()
                .any(|alias| header.trim().eq_ignore_ascii_case(alias))
        })
    };

    let metric_name = metric_name.trim();
    ColumnMap {
        name: find(&aliases.name),
        mention: find(&aliases.mention),
        external_id: find(&aliases.external_id),
        clan: find(&aliases.clan),
        action: find(&aliases.action),
        metric: if metric_name.is_empty() {
            None
        } else {
            headers
                .iter()
                .position(|header| header.trim().eq_ignore_ascii_case(metric_name))
        },
    }
}

fn record_from_row(row: &[String], map: &ColumnMap, headers: &[String]) -> Option<PlayerRecord> {
    if row.iter().all(|cell| cell.trim().is_empty()) {
        return None;
    }

    let cell = |index: Option<usize>| {
        index
            .and_then(|i| row.get(i))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let mapped: HashSet<usize> = [
        map.name,
        map.mention,
        map.external_id,
        map.clan,
        map.action,
        map.metric,
    ]
    .into_iter()
    .flatten()
    .collect();

    let extras = headers
        .iter()
        .enumerate()
        .filter(|(index, _)| !mapped.contains(index))
        .map(|(index, header)| {
            (
                header.trim().to_string(),
                row.get(index).map(|value| value.trim().to_string()).unwrap_or_default(),
            )
        })
        .collect();

    Some(PlayerRecord {
        display_name: None,
        name: cell(map.name),
        mention: cell(map.mention),
        external_id: cell(map.external_id),
        current_clan: cell(map.clan),
        metric: cell(map.metric).map(|value| parse_metric(&value)).unwrap_or(0),
        manual_action: cell(map.action),
        extras,
    })
}

/// Split an A1-style range into its sheet name, 0-based start column and
/// 1-based start row.
fn parse_range_origin(range: &str) -> anyhow::Result<(String, usize, usize)> {
    let (sheet, cells) = range
        .split_once('!')
        .ok_or_else(|| anyhow::anyhow!("range {range} is missing a sheet prefix"))?;
    let start = cells.split(':').next().unwrap_or_default();

    let letters: String = start
        .chars()
        .take_while(|ch| ch.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        anyhow::bail!("range {range} has no starting column");
    }
    let mut column = 0usize;
    for ch in letters.chars() {
        column = column * 26 + (ch.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }

    let digits: String = start
        .chars()
        .skip_while(|ch| ch.is_ascii_alphabetic())
        .collect();
    let row = if digits.is_empty() {
        1
    } else {
        digits
            .parse::<usize>()
            .with_context(|| format!("invalid start row in range {range}"))?
    };

    Ok((sheet.to_string(), column - 1, row))
}

fn column_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap()
}

#[derive(Clone)]
struct DiscordWebhookSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl DiscordWebhookSink {
    fn from_env(client: reqwest::Client) -> Option<Self> {
        let webhook_url = std::env::var("DISCORD_WEBHOOK_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())?;
        Some(Self {
            client,
            webhook_url,
        })
    }
}

#[async_trait]
impl NotificationSink for DiscordWebhookSink {
    async fn post_blocks(&self, blocks: &[String]) -> anyhow::Result<()> {
        for block in blocks {
            let lines: Vec<String> = block.lines().map(ToOwned::to_owned).collect();
            for chunk in split_blocks(&lines, MESSAGE_CHAR_BUDGET) {
                let response = self
                    .client
                    .post(&self.webhook_url)
                    .json(&serde_json::json!({ "content": chunk }))
                    .send()
                    .await
                    .context("failed to call announcement webhook")?;

                let status = response.status();
                if !status.is_success() {
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<response body unavailable>".to_string());
                    anyhow::bail!("announcement webhook returned {status}: {body}");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ColumnAliases {
    name: Vec<String>,
    mention: Vec<String>,
    external_id: Vec<String>,
    clan: Vec<String>,
    action: Vec<String>,
}

impl Default for ColumnAliases {
    fn default() -> Self {
        let list = |values: &[&str]| values.iter().map(|v| v.to_string()).collect();
        Self {
            name: list(&["name", "player", "nickname", "ign"]),
            mention: list(&["mention", "discord", "discord mention"]),
            external_id: list(&["id", "discord id", "user id", "member id"]),
            clan: list(&["clan", "current clan", "club"]),
            action: list(&["action", "manual action", "override", "wildcard"]),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ColumnAliasesFile {
    #[serde(default)]
    name: Option<Vec<String>>,
    #[serde(default)]
    mention: Option<Vec<String>>,
    #[serde(default)]
    external_id: Option<Vec<String>>,
    #[serde(default)]
    clan: Option<Vec<String>>,
    #[serde(default)]
    action: Option<Vec<String>>,
}

fn load_column_aliases() -> ColumnAliases {
    let Some(path) = std::env::var("ROSTER_COLUMNS_CONFIG_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    else {
        return ColumnAliases::default();
    };

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read roster columns config path");
            return ColumnAliases::default();
        }
    };

    let expanded = expand_env_vars(&raw);
    let parsed = match serde_yaml::from_str::<ColumnAliasesFile>(&expanded) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse roster columns config yaml");
            return ColumnAliases::default();
        }
    };

    let mut aliases = ColumnAliases::default();
    if let Some(name) = normalize_alias_list(parsed.name) {
        aliases.name = name;
    }
    if let Some(mention) = normalize_alias_list(parsed.mention) {
        aliases.mention = mention;
    }
    if let Some(external_id) = normalize_alias_list(parsed.external_id) {
        aliases.external_id = external_id;
    }
    if let Some(clan) = normalize_alias_list(parsed.clan) {
        aliases.clan = clan;
    }
    if let Some(action) = normalize_alias_list(parsed.action) {
        aliases.action = action;
    }

    info!(path = %path, "loaded roster columns config");
    aliases
}

fn normalize_alias_list(values: Option<Vec<String>>) -> Option<Vec<String>> {
    let values: Vec<String> = values?
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect();
    if values.is_empty() { None } else { Some(values) }
}

#[derive(Debug, Serialize)]
struct DistributeResponse {
    run_id: String,
    announced: bool,
    summary: DistributionSummary,
}

#[derive(Debug, Deserialize)]
struct PlayerActionRequest {
    query: String,
}

#[derive(Debug, Deserialize)]
struct MovePlayerRequest {
    query: String,
    clan: Clan,
}

#[derive(Debug, Serialize)]
struct ManualActionResponse {
    identifier: String,
    action: String,
    recomputed: bool,
}

#[derive(Debug, Serialize)]
struct ToggleCompleteResponse {
    identifier: String,
    now_complete: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ResetScope {
    DistributionOnly,
    All,
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    scope: ResetScope,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    scope: ResetScope,
    cleared_completions: usize,
    cleared_manual_actions: u64,
}

#[derive(Debug, Clone, Serialize)]
struct PlayerView {
    identifier: String,
    mention: Option<String>,
    metric: i64,
    complete: bool,
}

#[derive(Debug, Clone, Serialize)]
struct GroupView {
    clan: Clan,
    assigned: usize,
    movers: Vec<PlayerView>,
}

#[derive(Debug, Clone, Serialize)]
struct OverrideView {
    identifier: String,
    kind: OverrideKind,
    target: String,
    complete: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DistributionView {
    sort_metric: String,
    season_label: Option<String>,
    capacity: usize,
    groups: Vec<GroupView>,
    overrides: Vec<OverrideView>,
    unplaced: Vec<PlayerView>,
}

#[derive(Debug, Clone, Serialize)]
struct RemainingPlayer {
    identifier: Identifier,
    complete: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RemainingView {
    text: String,
    players: Vec<RemainingPlayer>,
    all_done: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "distribution_service=debug,tower_http=info".to_string()),
        )
        .init();

    let columns = load_column_aliases();
    let client = reqwest::Client::new();
    let roster_store: Arc<dyn RosterStore> =
        Arc::new(SheetsRosterStore::from_env(client.clone(), columns));
    let sink: Option<Arc<dyn NotificationSink>> = DiscordWebhookSink::from_env(client)
        .map(|sink| Arc::new(sink) as Arc<dyn NotificationSink>);
    if sink.is_none() {
        info!("DISCORD_WEBHOOK_URL is not set; announcements are disabled");
    }

    let state = AppState {
        session: Arc::new(RwLock::new(SessionState::default())),
        roster_store,
        sink,
        capacity: parse_clan_capacity(),
    };

    if let Err(error) = restore_session(&state).await {
        warn!(error = %format!("{error:#}"), "failed to restore persisted bot state; starting empty");
    }

    let app = build_router(state);
    let bind_addr = parse_bind_addr("DISTRIBUTION_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "distribution-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/distribution",
            post(distribute_handler).get(get_distribution_handler),
        )
        .route("/v1/distribution/refresh", post(refresh_handler))
        .route("/v1/distribution/reset", post(reset_handler))
        .route("/v1/players/move", post(move_player_handler))
        .route("/v1/players/hold", post(hold_player_handler))
        .route("/v1/players/include", post(include_player_handler))
        .route("/v1/players/complete", post(toggle_complete_handler))
        .route("/v1/remaining", get(remaining_handler))
        .route("/v1/remaining/refresh", post(refresh_remaining_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

fn parse_clan_capacity() -> usize {
    std::env::var("CLAN_CAPACITY")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(CLAN_CAPACITY)
}

/// Rebuild the session from the persisted blob plus a fresh roster fetch.
async fn restore_session(state: &AppState) -> anyhow::Result<()> {
    let Some(blob) = state
        .roster_store
        .load_state()
        .await
        .context("failed to load persisted bot state")?
    else {
        info!("no persisted bot state found; starting empty");
        return Ok(());
    };

    let completed = CompletionSet::restore(blob.completed_identifiers.clone());
    let current = if blob.has_distribution() {
        let records = state
            .roster_store
            .fetch_roster(&blob.sort_metric)
            .await
            .context("failed to fetch roster while restoring state")?;
        let result = distribute(
            &records,
            &blob.sort_metric,
            blob.season_label.clone(),
            state.capacity,
        );
        log_distribution_conditions(&result);
        Some(result)
    } else {
        None
    };

    let mut session = state.session.write().await;
    session.completed = completed;
    session.current = current;
    info!(
        restored_completions = session.completed.len(),
        restored_distribution = session.current.is_some(),
        "restored persisted bot state"
    );
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "distribution-service"}))
}

async fn distribute_handler(
    State(state): State<AppState>,
    Json(request): Json<DistributeRequest>,
) -> Result<Json<DistributeResponse>, ApiError> {
    let metric = request.metric_name.trim().to_string();
    if metric.is_empty() {
        return Err(ApiError::bad_request("metric_name is required"));
    }

    state
        .roster_store
        .copy_source_to_working()
        .await
        .map_err(|error| {
            ApiError::bad_gateway(format!("failed to refresh working roster: {error:#}"))
        })?;
    let records = state
        .roster_store
        .fetch_roster(&metric)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to fetch roster: {error:#}")))?;

    let result = distribute(&records, &metric, request.season_label.clone(), state.capacity);
    log_distribution_conditions(&result);

    let blob = {
        let session = state.session.read().await;
        PersistedState::new(
            metric.as_str(),
            result.season_label.clone(),
            session.completed.identifiers(),
            Utc::now(),
        )
    };
    state.roster_store.save_state(&blob).await.map_err(|error| {
        ApiError::bad_gateway(format!("failed to persist distribution state: {error:#}"))
    })?;

    let blocks = {
        let session = state.session.read().await;
        format_distribution(&result, &session.completed)
    };
    {
        let mut session = state.session.write().await;
        session.current = Some(result.clone());
        session.remaining_pin = None;
    }

    let announced = announce(&state, &blocks).await;
    let run_id = Uuid::new_v4().to_string();
    info!(
        run_id = %run_id,
        metric = %metric,
        roster_size = records.len(),
        announced,
        "distribution computed"
    );

    Ok(Json(DistributeResponse {
        run_id,
        announced,
        summary: DistributionSummary::from_result(&result),
    }))
}

async fn refresh_handler(
    State(state): State<AppState>,
) -> Result<Json<DistributeResponse>, ApiError> {
    let (metric, season) = {
        let session = state.session.read().await;
        session
            .current
            .as_ref()
            .map(|result| (result.sort_metric.clone(), result.season_label.clone()))
            .ok_or_else(|| ApiError::conflict("no distribution to refresh"))?
    };

    let records = state
        .roster_store
        .fetch_roster(&metric)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to fetch roster: {error:#}")))?;

    let result = distribute(&records, &metric, season, state.capacity);
    log_distribution_conditions(&result);

    let blocks = {
        let session = state.session.read().await;
        format_distribution(&result, &session.completed)
    };
    {
        // Completions and the pinned remaining list survive a refresh.
        let mut session = state.session.write().await;
        session.current = Some(result.clone());
    }

    let announced = announce(&state, &blocks).await;
    let run_id = Uuid::new_v4().to_string();
    info!(run_id = %run_id, metric = %metric, announced, "distribution refreshed");

    Ok(Json(DistributeResponse {
        run_id,
        announced,
        summary: DistributionSummary::from_result(&result),
    }))
}

async fn get_distribution_handler(
    State(state): State<AppState>,
) -> Result<Json<DistributionView>, ApiError> {
    let session = state.session.read().await;
    let result = session
        .current
        .as_ref()
        .ok_or_else(|| ApiError::not_found("no distribution has been computed"))?;
    Ok(Json(distribution_view(result, &session.completed)))
}

async fn move_player_handler(
    State(state): State<AppState>,
    Json(request): Json<MovePlayerRequest>,
) -> Result<Json<ManualActionResponse>, ApiError> {
    apply_manual_action(&state, &request.query, request.clan.as_str()).await
}

async fn hold_player_handler(
    State(state): State<AppState>,
    Json(request): Json<PlayerActionRequest>,
) -> Result<Json<ManualActionResponse>, ApiError> {
    apply_manual_action(&state, &request.query, HOLD_ACTION).await
}

async fn include_player_handler(
    State(state): State<AppState>,
    Json(request): Json<PlayerActionRequest>,
) -> Result<Json<ManualActionResponse>, ApiError> {
    apply_manual_action(&state, &request.query, "").await
}

async fn toggle_complete_handler(
    State(state): State<AppState>,
    Json(request): Json<PlayerActionRequest>,
) -> Result<Json<ToggleCompleteResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::bad_request("query is required"));
    }

    let metric = {
        let session = state.session.read().await;
        session
            .current
            .as_ref()
            .map(|result| result.sort_metric.clone())
            .unwrap_or_default()
    };
    let records = match state.roster_store.fetch_roster(&metric).await {
        Ok(records) => records,
        Err(error) => {
            warn!(
                error = %format!("{error:#}"),
                "roster fetch failed during completion toggle; resolving against session only"
            );
            Vec::new()
        }
    };

    let (identifier, blob, now_complete) = {
        let session = state.session.read().await;
        let index = RosterIndex::build(&records, session.current.as_ref());
        // Unresolvable queries fall back to the raw string so legacy
        // mention entries can still be toggled.
        let identifier = match index.resolve(&request.query) {
            Some(player) => canonical_identifier(player),
            None => request.query.trim().to_string(),
        };

        let mut next = session.completed.clone();
        let now_complete = next.toggle(&identifier);
        let (metric, season) = session
            .current
            .as_ref()
            .map(|result| (result.sort_metric.clone(), result.season_label.clone()))
            .unwrap_or_default();
        (
            identifier.clone(),
            PersistedState::new(metric, season, next.identifiers(), Utc::now()),
            now_complete,
        )
    };

    state.roster_store.save_state(&blob).await.map_err(|error| {
        ApiError::bad_gateway(format!("failed to persist completion state: {error:#}"))
    })?;

    // Commit only after the persisted write has been acknowledged.
    {
        let mut session = state.session.write().await;
        session.completed.toggle(&identifier);
    }

    info!(player = %identifier, now_complete, "completion toggled");
    Ok(Json(ToggleCompleteResponse {
        identifier,
        now_complete,
    }))
}

async fn remaining_handler(
    State(state): State<AppState>,
) -> Result<Json<RemainingView>, ApiError> {
    let view = {
        let session = state.session.read().await;
        let result = session
            .current
            .as_ref()
            .ok_or_else(|| ApiError::not_found("no distribution has been computed"))?;
        compute_remaining(result, &session.completed, None)
    };

    {
        let mut session = state.session.write().await;
        session.remaining_pin = Some(
            view.players
                .iter()
                .map(|player| player.identifier.clone())
                .collect(),
        );
    }

    Ok(Json(view))
}

async fn refresh_remaining_handler(
    State(state): State<AppState>,
) -> Result<Json<RemainingView>, ApiError> {
    let session = state.session.read().await;
    let result = session
        .current
        .as_ref()
        .ok_or_else(|| ApiError::conflict("no distribution has been computed"))?;
    let pin = session
        .remaining_pin
        .as_ref()
        .ok_or_else(|| ApiError::conflict("no remaining list to refresh"))?;
    Ok(Json(compute_remaining(
        result,
        &session.completed,
        Some(pin),
    )))
}

async fn reset_handler(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<ResetResponse>, ApiError> {
    match request.scope {
        ResetScope::DistributionOnly => {
            let blob = {
                let session = state.session.read().await;
                PersistedState::new("", None, session.completed.identifiers(), Utc::now())
            };
            state.roster_store.save_state(&blob).await.map_err(|error| {
                ApiError::bad_gateway(format!("failed to persist reset state: {error:#}"))
            })?;

            let mut session = state.session.write().await;
            session.current = None;
            session.remaining_pin = None;
            info!(scope = "distribution_only", "session reset");
            Ok(Json(ResetResponse {
                scope: request.scope,
                cleared_completions: 0,
                cleared_manual_actions: 0,
            }))
        }
        ResetScope::All => {
            let cleared_manual_actions =
                state.roster_store.clear_manual_actions().await.map_err(|error| {
                    ApiError::bad_gateway(format!("failed to clear manual actions: {error:#}"))
                })?;

            let blob = PersistedState::new("", None, Vec::new(), Utc::now());
            state.roster_store.save_state(&blob).await.map_err(|error| {
                ApiError::bad_gateway(format!("failed to persist reset state: {error:#}"))
            })?;

            let cleared_completions = {
                let mut session = state.session.write().await;
                let cleared = session.completed.len();
                session.completed.reset();
                session.current = None;
                session.remaining_pin = None;
                cleared
            };
            info!(
                scope = "all",
                cleared_completions, cleared_manual_actions, "session reset"
            );
            Ok(Json(ResetResponse {
                scope: request.scope,
                cleared_completions,
                cleared_manual_actions,
            }))
        }
    }
}

async fn announce(state: &AppState, blocks: &[String]) -> bool {
    let Some(sink) = state.sink.as_ref() else {
        info!("no notification sink configured; skipping announcement");
        return false;
    };

    match sink.post_blocks(blocks).await {
        Ok(()) => true,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "failed to post announcement");
            false
        }
    }
}

/// Resolve a free-text query, write the manual action for that player,
/// then recompute the distribution against the updated roster. The sheet
/// write must be acknowledged before anything is recomputed.
async fn apply_manual_action(
    state: &AppState,
    query: &str,
    action: &str,
) -> Result<Json<ManualActionResponse>, ApiError> {
    if query.trim().is_empty() {
        return Err(ApiError::bad_request("query is required"));
    }

    let stored_params = {
        let session = state.session.read().await;
        session
            .current
            .as_ref()
            .map(|result| (result.sort_metric.clone(), result.season_label.clone()))
    };
    let lookup_metric = stored_params
        .as_ref()
        .map(|(metric, _)| metric.clone())
        .unwrap_or_default();

    let records = state
        .roster_store
        .fetch_roster(&lookup_metric)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to fetch roster: {error:#}")))?;

    let (identifier, external_id) = {
        let session = state.session.read().await;
        let index = RosterIndex::build(&records, session.current.as_ref());
        let Some(player) = index.resolve(query) else {
            return Err(ApiError::not_found(format!(
                "no player matched \"{}\"",
                query.trim()
            )));
        };
        let identifier = canonical_identifier(player);
        let external_id = player.external_id.clone().ok_or_else(|| {
            ApiError::conflict(format!(
                "player {identifier} has no linked platform id; edit the sheet directly"
            ))
        })?;
        (identifier, external_id)
    };

    state
        .roster_store
        .write_manual_action(&external_id, action)
        .await
        .map_err(|error| {
            ApiError::bad_gateway(format!("failed to write manual action: {error:#}"))
        })?;
    info!(player = %identifier, action = %action, "manual action written");

    let recomputed = if let Some((metric, season)) = stored_params {
        let records = state
            .roster_store
            .fetch_roster(&metric)
            .await
            .map_err(|error| {
                ApiError::bad_gateway(format!("failed to re-fetch roster: {error:#}"))
            })?;
        let result = distribute(&records, &metric, season, state.capacity);
        log_distribution_conditions(&result);
        state.session.write().await.current = Some(result);
        true
    } else {
        false
    };

    Ok(Json(ManualActionResponse {
        identifier,
        action: action.to_string(),
        recomputed,
    }))
}

fn log_distribution_conditions(result: &DistributionResult) {
    for entry in &result.overrides {
        if entry.kind == OverrideKind::Other {
            warn!(
                player = %canonical_identifier(&entry.record),
                action = %entry.target,
                "unrecognized manual action; player excluded from placement and capacity"
            );
        }
    }
    if !result.unplaced.is_empty() {
        warn!(
            count = result.unplaced.len(),
            "players left unplaced; every clan is at capacity"
        );
    }
}

/// Partition a roster into capacity-bounded clans plus the override list.
/// Pure: the same roster, metric, season and capacity always produce the
/// same result.
fn distribute(
    records: &[PlayerRecord],
    metric_name: &str,
    season_label: Option<String>,
    capacity: usize,
) -> DistributionResult {
    let mut available: Vec<PlayerRecord> = Vec::new();
    let mut overrides: Vec<OverrideEntry> = Vec::new();
    for record in records {
        match manual_action(record) {
            Some(action) => overrides.push(classify_override(record.clone(), &action)),
            None => available.push(record.clone()),
        }
    }

    let mut counts = [0usize; 3];
    for entry in &overrides {
        if let Some(clan) = capacity_clan(entry) {
            counts[clan.index()] += 1;
        }
    }

    // Stable sort: equal metrics keep their roster order.
    available.sort_by(|a, b| b.metric.cmp(&a.metric));

    let mut movers: [Vec<PlayerRecord>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    let mut unplaced = Vec::new();
    let mut cursor = 0usize;
    for record in available {
        while cursor < ALL_CLANS.len() && counts[cursor] >= capacity {
            cursor += 1;
        }
        let Some(&clan) = ALL_CLANS.get(cursor) else {
            unplaced.push(record);
            continue;
        };
        counts[cursor] += 1;
        if !is_resident(&record, clan) {
            movers[cursor].push(record);
        }
    }

    let groups = ALL_CLANS
        .into_iter()
        .zip(movers)
        .map(|(clan, movers)| ClanGroup {
            clan,
            assigned: counts[clan.index()],
            movers,
        })
        .collect();

    DistributionResult {
        groups,
        overrides,
        unplaced,
        sort_metric: metric_name.to_string(),
        season_label,
        capacity,
    }
}

fn manual_action(record: &PlayerRecord) -> Option<String> {
    record
        .manual_action
        .as_deref()
        .map(str::trim)
        .filter(|action| !action.is_empty())
        .map(ToOwned::to_owned)
}

fn classify_override(record: PlayerRecord, action: &str) -> OverrideEntry {
    if action.eq_ignore_ascii_case(HOLD_ACTION) {
        let target = record
            .current_clan
            .as_deref()
            .map(str::trim)
            .filter(|clan| !clan.is_empty())
            .unwrap_or(UNKNOWN_LABEL)
            .to_string();
        return OverrideEntry {
            record,
            kind: OverrideKind::Hold,
            target,
        };
    }

    if let Some(clan) = Clan::parse(action) {
        let kind = if is_resident(&record, clan) {
            OverrideKind::Stay
        } else {
            OverrideKind::Move
        };
        return OverrideEntry {
            record,
            kind,
            target: clan.as_str().to_string(),
        };
    }

    OverrideEntry {
        record,
        kind: OverrideKind::Other,
        target: action.to_string(),
    }
}

/// The clan an override occupies a slot in. Hold, Stay and Move all
/// consume capacity at their resolved target; unrecognized actions
/// consume none, which can let a later correction push a clan past its
/// cap.
fn capacity_clan(entry: &OverrideEntry) -> Option<Clan> {
    match entry.kind {
        OverrideKind::Hold | OverrideKind::Stay | OverrideKind::Move => {
            Clan::parse(&entry.target)
        }
        OverrideKind::Other => None,
    }
}

fn is_resident(record: &PlayerRecord, clan: Clan) -> bool {
    record
        .current_clan
        .as_deref()
        .map(|label| label.trim().eq_ignore_ascii_case(clan.as_str()))
        .unwrap_or(false)
}

/// Free-text player lookup over the raw roster plus every listed group,
/// backed by precomputed indexes. Raw roster entries win over group
/// entries.
struct RosterIndex {
    players: Vec<PlayerRecord>,
    by_mention: HashMap<String, usize>,
    by_external_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl RosterIndex {
    fn build(roster: &[PlayerRecord], result: Option<&DistributionResult>) -> Self {
        let mut index = Self {
            players: Vec::new(),
            by_mention: HashMap::new(),
            by_external_id: HashMap::new(),
            by_name: HashMap::new(),
        };
        for record in roster {
            index.insert(record);
        }
        if let Some(result) = result {
            for record in result.listed_players() {
                index.insert(record);
            }
        }
        index
    }

    fn insert(&mut self, record: &PlayerRecord) {
        let position = self.players.len();
        if let Some(mention) = record
            .mention
            .as_deref()
            .map(str::trim)
            .filter(|mention| !mention.is_empty())
        {
            self.by_mention.entry(mention.to_string()).or_insert(position);
        }
        if let Some(external_id) = record
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            self.by_external_id
                .entry(external_id.to_string())
                .or_insert(position);
        }
        self.by_name
            .entry(canonical_identifier(record).to_lowercase())
            .or_insert(position);
        self.players.push(record.clone());
    }

    fn resolve(&self, query: &str) -> Option<&PlayerRecord> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(&position) = self.by_mention.get(trimmed) {
            return self.players.get(position);
        }

        let needle = trimmed.to_lowercase();
        if let Some(&position) = self.by_name.get(&needle) {
            return self.players.get(position);
        }
        if let Some(player) = self
            .players
            .iter()
            .find(|player| canonical_identifier(player).to_lowercase().contains(&needle))
        {
            return Some(player);
        }

        if let Some(platform_id) = mention_platform_id(trimmed)
            && let Some(&position) = self.by_external_id.get(platform_id.as_str())
        {
            return self.players.get(position);
        }

        None
    }
}

fn format_distribution(result: &DistributionResult, completed: &CompletionSet) -> Vec<String> {
    let mut header = format!("Clan distribution by {}", result.sort_metric);
    if let Some(season) = result.season_label.as_deref() {
        header = format!("{header} ({season})");
    }

    let mut blocks = vec![format!("**{header}**")];

    for group in &result.groups {
        let mut lines = vec![format!(
            "**{}**: {} to move ({}/{} assigned)",
            group.clan,
            group.movers.len(),
            group.assigned,
            result.capacity
        )];
        for record in &group.movers {
            lines.push(player_line(record, completed));
        }
        blocks.push(lines.join("\n"));
    }

    if !result.overrides.is_empty() {
        let mut lines = vec![format!("**Wildcards**: {}", result.overrides.len())];
        for entry in &result.overrides {
            lines.push(override_line(entry, completed));
        }
        blocks.push(lines.join("\n"));
    }

    if !result.unplaced.is_empty() {
        let mut lines = vec![format!(
            "**Unplaced**: {} (every clan is full)",
            result.unplaced.len()
        )];
        for record in &result.unplaced {
            lines.push(player_line(record, completed));
        }
        blocks.push(lines.join("\n"));
    }

    blocks
}

fn player_line(record: &PlayerRecord, completed: &CompletionSet) -> String {
    let identifier = canonical_identifier(record);
    let mut line = String::from("- ");
    if let Some(mention) = record
        .mention
        .as_deref()
        .map(str::trim)
        .filter(|mention| !mention.is_empty() && *mention != identifier)
    {
        line.push_str(mention);
        line.push(' ');
    }
    line.push_str(&identifier);
    line.push_str(&format!(" ({})", record.metric));
    if completed.is_complete(record) {
        line.push(' ');
        line.push_str(COMPLETE_MARKER);
    }
    line
}

fn override_line(entry: &OverrideEntry, completed: &CompletionSet) -> String {
    let identifier = canonical_identifier(&entry.record);
    let disposition = match entry.kind {
        OverrideKind::Hold | OverrideKind::Stay => format!("stays in {}", entry.target),
        OverrideKind::Move => format!("moves to {}", entry.target),
        OverrideKind::Other => format!("flagged \"{}\"", entry.target),
    };

    let mut line = String::from("- ");
    if let Some(mention) = entry
        .record
        .mention
        .as_deref()
        .map(str::trim)
        .filter(|mention| !mention.is_empty() && *mention != identifier)
    {
        line.push_str(mention);
        line.push(' ');
    }
    line.push_str(&identifier);
    line.push(' ');
    line.push_str(&disposition);
    if completed.is_complete(&entry.record) {
        line.push(' ');
        line.push_str(COMPLETE_MARKER);
    }
    line
}

/// Build the "still to move" view. With a pinned list the membership is
/// exactly the supplied identifiers; only their completion flags are
/// re-evaluated. Hold and Stay overrides never appear: they require no
/// move.
fn compute_remaining(
    result: &DistributionResult,
    completed: &CompletionSet,
    pinned: Option<&[Identifier]>,
) -> RemainingView {
    let players: Vec<RemainingPlayer> = match pinned {
        Some(identifiers) => identifiers
            .iter()
            .map(|identifier| {
                let complete = result
                    .listed_players()
                    .find(|record| canonical_identifier(record) == *identifier)
                    .map(|record| completed.is_complete(record))
                    .unwrap_or_else(|| completed.contains(identifier));
                RemainingPlayer {
                    identifier: identifier.clone(),
                    complete,
                }
            })
            .collect(),
        None => {
            let mut seen = HashSet::new();
            let mut players = Vec::new();
            let movers = result
                .groups
                .iter()
                .flat_map(|group| group.movers.iter())
                .chain(
                    result
                        .overrides
                        .iter()
                        .filter(|entry| entry.kind == OverrideKind::Move)
                        .map(|entry| &entry.record),
                );
            for record in movers {
                let identifier = canonical_identifier(record);
                if seen.insert(identifier.clone()) {
                    players.push(RemainingPlayer {
                        complete: completed.is_complete(record),
                        identifier,
                    });
                }
            }
            players
        }
    };

    let done = players.iter().filter(|player| player.complete).count();
    let all_done = done == players.len();

    let mut lines = vec![format!("**Still to move**: {done}/{} done", players.len())];
    for player in &players {
        if player.complete {
            lines.push(format!("- {} {}", player.identifier, COMPLETE_MARKER));
        } else {
            lines.push(format!("- {}", player.identifier));
        }
    }
    if all_done && !players.is_empty() {
        lines.push("All moves are complete.".to_string());
    }

    RemainingView {
        text: lines.join("\n"),
        players,
        all_done,
    }
}

fn distribution_view(result: &DistributionResult, completed: &CompletionSet) -> DistributionView {
    DistributionView {
        sort_metric: result.sort_metric.clone(),
        season_label: result.season_label.clone(),
        capacity: result.capacity,
        groups: result
            .groups
            .iter()
            .map(|group| GroupView {
                clan: group.clan,
                assigned: group.assigned,
                movers: group
                    .movers
                    .iter()
                    .map(|record| player_view(record, completed))
                    .collect(),
            })
            .collect(),
        overrides: result
            .overrides
            .iter()
            .map(|entry| OverrideView {
                identifier: canonical_identifier(&entry.record),
                kind: entry.kind,
                target: entry.target.clone(),
                complete: completed.is_complete(&entry.record),
            })
            .collect(),
        unplaced: result
            .unplaced
            .iter()
            .map(|record| player_view(record, completed))
            .collect(),
    }
}

fn player_view(record: &PlayerRecord, completed: &CompletionSet) -> PlayerView {
    PlayerView {
        identifier: canonical_identifier(record),
        mention: record.mention.clone(),
        metric: record.metric,
        complete: completed.is_complete(record),
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    };

    struct StaticRosterStore {
        rows: Mutex<Vec<PlayerRecord>>,
        writes: Mutex<Vec<(String, String)>>,
        saved: Mutex<Option<PersistedState>>,
        copies: Mutex<usize>,
        fail_writes: AtomicBool,
    }

    impl StaticRosterStore {
        fn new(rows: Vec<PlayerRecord>) -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(rows),
                writes: Mutex::new(Vec::new()),
                saved: Mutex::new(None),
                copies: Mutex::new(0),
                fail_writes: AtomicBool::new(false),
            })
        }

        fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        fn check_writable(&self) -> anyhow::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("sheet write rejected");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RosterStore for StaticRosterStore {
        async fn fetch_roster(&self, _metric_name: &str) -> anyhow::Result<Vec<PlayerRecord>> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn write_manual_action(&self, external_id: &str, action: &str) -> anyhow::Result<()> {
            self.check_writable()?;
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .iter_mut()
                .find(|row| row.external_id.as_deref() == Some(external_id))
                .ok_or_else(|| anyhow::anyhow!("player id {external_id} not present"))?;
            row.manual_action = Some(action.to_string()).filter(|value| !value.is_empty());
            self.writes
                .lock()
                .unwrap()
                .push((external_id.to_string(), action.to_string()));
            Ok(())
        }

        async fn clear_manual_actions(&self) -> anyhow::Result<u64> {
            self.check_writable()?;
            let mut cleared = 0;
            for row in self.rows.lock().unwrap().iter_mut() {
                if row.manual_action.take().is_some() {
                    cleared += 1;
                }
            }
            Ok(cleared)
        }

        async fn copy_source_to_working(&self) -> anyhow::Result<()> {
            self.check_writable()?;
            *self.copies.lock().unwrap() += 1;
            Ok(())
        }

        async fn save_state(&self, state: &PersistedState) -> anyhow::Result<()> {
            self.check_writable()?;
            *self.saved.lock().unwrap() = Some(state.clone());
            Ok(())
        }

        async fn load_state(&self) -> anyhow::Result<Option<PersistedState>> {
            Ok(self.saved.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        posted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn post_blocks(&self, blocks: &[String]) -> anyhow::Result<()> {
            self.posted.lock().unwrap().extend(blocks.iter().cloned());
            Ok(())
        }
    }

    fn player(
        name: &str,
        id: &str,
        clan: Option<&str>,
        metric: i64,
        action: Option<&str>,
    ) -> PlayerRecord {
        PlayerRecord {
            display_name: Some(name.to_string()),
            name: Some(name.to_string()),
            mention: Some(format!("<@{id}>")),
            external_id: Some(id.to_string()),
            current_clan: clan.map(ToOwned::to_owned),
            metric,
            manual_action: action.map(ToOwned::to_owned),
            extras: Vec::new(),
        }
    }

    fn app_state(
        rows: Vec<PlayerRecord>,
        capacity: usize,
    ) -> (AppState, Arc<StaticRosterStore>, Arc<RecordingSink>) {
        let store = StaticRosterStore::new(rows);
        let sink = Arc::new(RecordingSink::default());
        let state = AppState {
            session: Arc::new(RwLock::new(SessionState::default())),
            roster_store: store.clone(),
            sink: Some(sink.clone()),
            capacity,
        };
        (state, store, sink)
    }

    fn names(records: &[PlayerRecord]) -> Vec<String> {
        records.iter().map(canonical_identifier).collect()
    }

    #[test]
    fn distribution_fills_clans_in_order_by_metric() {
        let roster = vec![
            player("Low", "4", None, 100, None),
            player("Top", "1", None, 900, None),
            player("Mid", "2", None, 500, None),
            player("Tail", "3", None, 50, None),
        ];
        let result = distribute(&roster, "Trophies", None, 2);

        assert_eq!(names(&result.group(Clan::Rgr).movers), vec!["Top", "Mid"]);
        assert_eq!(names(&result.group(Clan::Otl).movers), vec!["Low", "Tail"]);
        assert!(result.group(Clan::Rnd).movers.is_empty());
        assert!(result.unplaced.is_empty());
        assert_eq!(result.group(Clan::Rgr).assigned, 2);
        assert_eq!(result.group(Clan::Otl).assigned, 2);
        assert_eq!(result.group(Clan::Rnd).assigned, 0);
    }

    #[test]
    fn resident_player_is_counted_but_not_listed() {
        let roster = vec![
            player("Keeper", "1", Some("RGR"), 900, None),
            player("Joiner", "2", Some("OTL"), 800, None),
        ];
        let result = distribute(&roster, "Trophies", None, 50);

        let rgr = result.group(Clan::Rgr);
        assert_eq!(rgr.assigned, 2);
        assert_eq!(names(&rgr.movers), vec!["Joiner"]);
    }

    #[test]
    fn equal_metrics_keep_roster_order() {
        let roster = vec![
            player("First", "1", None, 500, None),
            player("Second", "2", None, 500, None),
            player("Third", "3", None, 500, None),
        ];
        let result = distribute(&roster, "Trophies", None, 50);
        assert_eq!(
            names(&result.group(Clan::Rgr).movers),
            vec!["First", "Second", "Third"]
        );
    }

    #[test]
    fn distribution_is_deterministic() {
        let roster = vec![
            player("A", "1", Some("RND"), 700, None),
            player("B", "2", None, 700, Some("Hold")),
            player("C", "3", Some("RGR"), 300, Some("OTL")),
            player("D", "4", None, 300, None),
        ];
        let first = distribute(&roster, "Trophies", Some("S1".to_string()), 2);
        let second = distribute(&roster, "Trophies", Some("S1".to_string()), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn capacity_invariant_holds_for_large_roster() {
        let roster: Vec<PlayerRecord> = (0..200)
            .map(|i| {
                let action = match i % 40 {
                    0 => Some("Hold"),
                    7 => Some("RND"),
                    13 => Some("??"),
                    _ => None,
                };
                player(
                    &format!("P{i}"),
                    &i.to_string(),
                    Some(ALL_CLANS[i % 3].as_str()),
                    (i as i64 * 37) % 1000,
                    action,
                )
            })
            .collect();
        let result = distribute(&roster, "Trophies", None, 50);

        for group in &result.groups {
            assert!(group.assigned <= 50, "{} over capacity", group.clan);
            assert!(group.movers.len() <= group.assigned);
        }
        let listed = result.groups.iter().map(|g| g.movers.len()).sum::<usize>()
            + result.overrides.len()
            + result.unplaced.len();
        assert!(listed <= roster.len());
    }

    #[test]
    fn hold_anchors_capacity_in_current_clan() {
        let roster = vec![
            player("P1", "1", None, 7480, None),
            player("P2", "2", Some("RGR"), 7410, Some("Hold")),
            player("P3", "3", Some("RND"), 100, Some("OTL")),
            player("P4", "4", None, 50, None),
        ];
        let result = distribute(&roster, "Trophies", None, 1);

        let hold = &result.overrides[0];
        assert_eq!(hold.kind, OverrideKind::Hold);
        assert_eq!(hold.target, "RGR");
        assert_eq!(result.group(Clan::Rgr).assigned, 1);
        assert!(result.group(Clan::Rgr).movers.is_empty());

        // The forced move occupies OTL's only slot, so the best available
        // player falls through to RND and the rest go unplaced.
        let moved = &result.overrides[1];
        assert_eq!(moved.kind, OverrideKind::Move);
        assert_eq!(moved.target, "OTL");
        assert_eq!(result.group(Clan::Otl).assigned, 1);
        assert!(result.group(Clan::Otl).movers.is_empty());
        assert_eq!(names(&result.group(Clan::Rnd).movers), vec!["P1"]);
        assert_eq!(names(&result.unplaced), vec!["P4"]);
    }

    #[test]
    fn move_override_consumes_target_capacity() {
        let roster = vec![
            player("Forced", "1", Some("RGR"), 10, Some("OTL")),
            player("Best", "2", None, 900, None),
            player("Next", "3", None, 800, None),
        ];
        let result = distribute(&roster, "Trophies", None, 1);

        assert_eq!(result.overrides[0].kind, OverrideKind::Move);
        assert_eq!(names(&result.group(Clan::Rgr).movers), vec!["Best"]);
        assert!(result.group(Clan::Otl).movers.is_empty());
        assert_eq!(result.group(Clan::Otl).assigned, 1);
        assert_eq!(names(&result.group(Clan::Rnd).movers), vec!["Next"]);
    }

    #[test]
    fn stay_override_counts_against_own_clan() {
        let roster = vec![
            player("Anchor", "1", Some("RGR"), 100, Some("rgr")),
            player("Best", "2", None, 900, None),
        ];
        let result = distribute(&roster, "Trophies", None, 1);

        assert_eq!(result.overrides[0].kind, OverrideKind::Stay);
        assert_eq!(result.overrides[0].target, "RGR");
        assert_eq!(result.group(Clan::Rgr).assigned, 1);
        assert_eq!(names(&result.group(Clan::Otl).movers), vec!["Best"]);
    }

    #[test]
    fn unrecognized_action_is_excluded_and_uncounted() {
        let roster = vec![
            player("Odd", "1", Some("RGR"), 999, Some("maybe later")),
            player("Best", "2", None, 900, None),
        ];
        let result = distribute(&roster, "Trophies", None, 1);

        assert_eq!(result.overrides.len(), 1);
        assert_eq!(result.overrides[0].kind, OverrideKind::Other);
        assert_eq!(result.overrides[0].target, "maybe later");
        // The odd action holds no slot anywhere.
        assert_eq!(names(&result.group(Clan::Rgr).movers), vec!["Best"]);
        assert_eq!(result.group(Clan::Rgr).assigned, 1);
    }

    #[test]
    fn hold_without_known_clan_targets_unknown() {
        let roster = vec![player("Lost", "1", None, 100, Some("Hold"))];
        let result = distribute(&roster, "Trophies", None, 50);

        assert_eq!(result.overrides[0].kind, OverrideKind::Hold);
        assert_eq!(result.overrides[0].target, UNKNOWN_LABEL);
        for group in &result.groups {
            assert_eq!(group.assigned, 0);
        }
    }

    #[test]
    fn overrides_preserve_roster_order() {
        let roster = vec![
            player("Zed", "1", None, 10, Some("Hold")),
            player("Mid", "2", None, 999, Some("RND")),
            player("Ann", "3", None, 500, Some("junk")),
        ];
        let result = distribute(&roster, "Trophies", None, 50);
        assert_eq!(
            result
                .overrides
                .iter()
                .map(|entry| canonical_identifier(&entry.record))
                .collect::<Vec<_>>(),
            vec!["Zed", "Mid", "Ann"]
        );
    }

    #[test]
    fn all_clans_full_drops_remainder() {
        let roster: Vec<PlayerRecord> = (0..5)
            .map(|i| player(&format!("P{i}"), &i.to_string(), None, 100 - i as i64, None))
            .collect();
        let result = distribute(&roster, "Trophies", None, 1);

        assert_eq!(names(&result.group(Clan::Rgr).movers), vec!["P0"]);
        assert_eq!(names(&result.group(Clan::Otl).movers), vec!["P1"]);
        assert_eq!(names(&result.group(Clan::Rnd).movers), vec!["P2"]);
        assert_eq!(names(&result.unplaced), vec!["P3", "P4"]);
    }

    #[test]
    fn empty_roster_produces_empty_result() {
        let result = distribute(&[], "Trophies", None, 50);
        assert!(result.overrides.is_empty());
        assert!(result.unplaced.is_empty());
        for group in &result.groups {
            assert!(group.movers.is_empty());
            assert_eq!(group.assigned, 0);
        }
    }

    #[test]
    fn roster_index_resolves_by_mention_name_and_platform_id() {
        let roster = vec![
            player("Ace", "42", None, 100, None),
            player("Bravo Six", "77", None, 200, None),
        ];
        let index = RosterIndex::build(&roster, None);

        assert_eq!(
            index.resolve("<@42>").map(canonical_identifier),
            Some("Ace".to_string())
        );
        assert_eq!(
            index.resolve("bravo").map(canonical_identifier),
            Some("Bravo Six".to_string())
        );
        assert_eq!(
            index.resolve("<@!77>").map(canonical_identifier),
            Some("Bravo Six".to_string())
        );
        assert!(index.resolve("charlie").is_none());
        assert!(index.resolve("").is_none());
    }

    #[test]
    fn roster_index_searches_groups_after_raw_roster() {
        let grouped = player("Grouped", "9", None, 500, None);
        let result = distribute(&[grouped.clone()], "Trophies", None, 50);
        let index = RosterIndex::build(&[], Some(&result));

        assert_eq!(
            index.resolve("grouped").map(canonical_identifier),
            Some("Grouped".to_string())
        );
    }

    #[test]
    fn format_distribution_emits_sections_in_fixed_order() {
        let roster = vec![
            player("Top", "1", None, 900, None),
            player("Held", "2", Some("OTL"), 800, Some("Hold")),
            player("Forced", "3", Some("RGR"), 700, Some("RND")),
        ];
        let result = distribute(&roster, "Trophies", None, 50);
        let mut completed = CompletionSet::default();
        completed.toggle("Top");

        let blocks = format_distribution(&result, &completed);
        assert!(blocks[0].contains("Trophies"));
        assert!(blocks[1].starts_with("**RGR**"));
        assert!(blocks[2].starts_with("**OTL**"));
        assert!(blocks[3].starts_with("**RND**"));
        assert!(blocks[1].contains(&format!("Top (900) {COMPLETE_MARKER}")));

        let wildcards = &blocks[4];
        assert!(wildcards.starts_with("**Wildcards**: 2"));
        assert!(wildcards.contains("Held stays in OTL"));
        assert!(wildcards.contains("Forced moves to RND"));
    }

    #[test]
    fn remaining_excludes_hold_and_stay_overrides() {
        let roster = vec![
            player("Mover", "1", None, 900, None),
            player("Held", "2", Some("OTL"), 800, Some("Hold")),
            player("Stayer", "3", Some("RGR"), 700, Some("RGR")),
            player("Forced", "4", Some("RGR"), 600, Some("RND")),
        ];
        let result = distribute(&roster, "Trophies", None, 50);
        let view = compute_remaining(&result, &CompletionSet::default(), None);

        let members: Vec<&str> = view
            .players
            .iter()
            .map(|player| player.identifier.as_str())
            .collect();
        assert!(members.contains(&"Mover"));
        assert!(members.contains(&"Forced"));
        assert!(!members.contains(&"Held"));
        assert!(!members.contains(&"Stayer"));
        assert!(!view.all_done);
    }

    #[test]
    fn pinned_remaining_keeps_membership_stable() {
        let roster = vec![
            player("One", "1", None, 900, None),
            player("Two", "2", None, 800, None),
            player("Three", "3", None, 700, None),
        ];
        let result = distribute(&roster, "Trophies", None, 50);
        let mut completed = CompletionSet::default();

        let fresh = compute_remaining(&result, &completed, None);
        let pin: Vec<Identifier> = fresh
            .players
            .iter()
            .map(|player| player.identifier.clone())
            .collect();

        completed.toggle("Two");
        let refreshed = compute_remaining(&result, &completed, Some(&pin));

        assert_eq!(refreshed.players.len(), fresh.players.len());
        let refreshed_ids: Vec<Identifier> = refreshed
            .players
            .iter()
            .map(|player| player.identifier.clone())
            .collect();
        assert_eq!(refreshed_ids, pin);
        assert!(refreshed.players.iter().any(|p| p.identifier == "Two" && p.complete));
        assert!(!refreshed.all_done);
    }

    #[test]
    fn remaining_reports_all_done() {
        let roster = vec![player("Solo", "1", None, 900, None)];
        let result = distribute(&roster, "Trophies", None, 50);
        let mut completed = CompletionSet::default();
        completed.toggle("Solo");

        let view = compute_remaining(&result, &completed, None);
        assert!(view.all_done);
        assert!(view.text.contains("All moves are complete."));
    }

    #[test]
    fn resolve_columns_matches_aliases_and_metric() {
        let headers: Vec<String> = ["Player", "Discord ID", "Current Clan", "Trophies", "Action", "Notes"]
            .iter()
            .map(|h| h.to_string())
            .collect();
        let map = resolve_columns(&headers, &ColumnAliases::default(), "trophies");

        assert_eq!(map.name, Some(0));
        assert_eq!(map.external_id, Some(1));
        assert_eq!(map.clan, Some(2));
        assert_eq!(map.metric, Some(3));
        assert_eq!(map.action, Some(4));
        assert_eq!(map.mention, None);
    }

    #[test]
    fn record_from_row_parses_permissively() {
        let headers: Vec<String> = ["Player", "Id", "Clan", "Trophies", "Action", "Notes"]
            .iter()
            .map(|h| h.to_string())
            .collect();
        let map = resolve_columns(&headers, &ColumnAliases::default(), "Trophies");

        let row: Vec<String> = ["  Ace ", "42", "", "7,480", "  ", "left-handed"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let record = record_from_row(&row, &map, &headers).unwrap();
        assert_eq!(record.name.as_deref(), Some("Ace"));
        assert_eq!(record.external_id.as_deref(), Some("42"));
        assert_eq!(record.current_clan, None);
        assert_eq!(record.metric, 7480);
        assert_eq!(record.manual_action, None);
        assert_eq!(record.extras, vec![("Notes".to_string(), "left-handed".to_string())]);

        let blank: Vec<String> = vec![String::new(); 6];
        assert!(record_from_row(&blank, &map, &headers).is_none());
    }

    #[test]
    fn range_origin_and_column_letters_round_trip() {
        assert_eq!(
            parse_range_origin("Roster!A1:Z").unwrap(),
            ("Roster".to_string(), 0, 1)
        );
        assert_eq!(
            parse_range_origin("Working!C3:H40").unwrap(),
            ("Working".to_string(), 2, 3)
        );
        assert!(parse_range_origin("NoSheetPrefix").is_err());

        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
    }

    #[tokio::test]
    async fn distribute_announces_and_persists() {
        let roster = vec![
            player("Top", "1", None, 900, None),
            player("Held", "2", Some("OTL"), 800, Some("Hold")),
        ];
        let (state, store, sink) = app_state(roster, 50);

        let response = distribute_handler(
            State(state.clone()),
            Json(DistributeRequest {
                metric_name: "Trophies".to_string(),
                season_label: Some("Season 12".to_string()),
            }),
        )
        .await
        .unwrap()
        .0;

        assert!(response.announced);
        assert_eq!(response.summary.sort_metric, "Trophies");
        assert_eq!(response.summary.override_count, 1);
        assert_eq!(response.summary.groups[0].to_move, 1);

        assert_eq!(*store.copies.lock().unwrap(), 1);
        let saved = store.saved.lock().unwrap().clone().unwrap();
        assert_eq!(saved.sort_metric, "Trophies");
        assert_eq!(saved.season_label.as_deref(), Some("Season 12"));

        let posted = sink.posted.lock().unwrap();
        assert!(posted.iter().any(|block| block.contains("**RGR**")));
        assert!(posted.iter().any(|block| block.contains("Held stays in OTL")));

        let session = state.session.read().await;
        assert!(session.current.is_some());
    }

    #[tokio::test]
    async fn distribute_requires_metric_name() {
        let (state, _, _) = app_state(Vec::new(), 50);
        let error = distribute_handler(
            State(state),
            Json(DistributeRequest {
                metric_name: "  ".to_string(),
                season_label: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn completion_survives_redistribution() {
        let roster = vec![
            player("Top", "1", None, 900, None),
            player("Mid", "2", None, 500, None),
        ];
        let (state, _, _) = app_state(roster, 50);

        let request = DistributeRequest {
            metric_name: "Trophies".to_string(),
            season_label: None,
        };
        distribute_handler(State(state.clone()), Json(request.clone()))
            .await
            .unwrap();

        let toggled = toggle_complete_handler(
            State(state.clone()),
            Json(PlayerActionRequest {
                query: "Top".to_string(),
            }),
        )
        .await
        .unwrap()
        .0;
        assert!(toggled.now_complete);
        assert_eq!(toggled.identifier, "Top");

        distribute_handler(State(state.clone()), Json(request))
            .await
            .unwrap();

        let view = get_distribution_handler(State(state)).await.unwrap().0;
        let top = view.groups[0]
            .movers
            .iter()
            .find(|player| player.identifier == "Top")
            .expect("Top must still be listed");
        assert!(top.complete);
    }

    #[tokio::test]
    async fn manual_move_writes_action_then_recomputes() {
        let roster = vec![
            player("Top", "1", None, 900, None),
            player("Mid", "2", None, 500, None),
        ];
        let (state, store, _) = app_state(roster, 50);

        distribute_handler(
            State(state.clone()),
            Json(DistributeRequest {
                metric_name: "Trophies".to_string(),
                season_label: None,
            }),
        )
        .await
        .unwrap();

        let response = move_player_handler(
            State(state.clone()),
            Json(MovePlayerRequest {
                query: "mid".to_string(),
                clan: Clan::Rnd,
            }),
        )
        .await
        .unwrap()
        .0;

        assert_eq!(response.identifier, "Mid");
        assert_eq!(response.action, "RND");
        assert!(response.recomputed);
        assert_eq!(
            store.writes.lock().unwrap().as_slice(),
            &[("2".to_string(), "RND".to_string())]
        );

        let session = state.session.read().await;
        let result = session.current.as_ref().unwrap();
        assert_eq!(result.overrides.len(), 1);
        assert_eq!(result.overrides[0].kind, OverrideKind::Move);
        assert_eq!(result.overrides[0].target, "RND");
    }

    #[tokio::test]
    async fn hold_then_include_round_trip() {
        let roster = vec![player("Top", "1", Some("RGR"), 900, None)];
        let (state, store, _) = app_state(roster, 50);

        distribute_handler(
            State(state.clone()),
            Json(DistributeRequest {
                metric_name: "Trophies".to_string(),
                season_label: None,
            }),
        )
        .await
        .unwrap();

        hold_player_handler(
            State(state.clone()),
            Json(PlayerActionRequest {
                query: "Top".to_string(),
            }),
        )
        .await
        .unwrap();
        {
            let session = state.session.read().await;
            let result = session.current.as_ref().unwrap();
            assert_eq!(result.overrides[0].kind, OverrideKind::Hold);
        }

        include_player_handler(
            State(state.clone()),
            Json(PlayerActionRequest {
                query: "Top".to_string(),
            }),
        )
        .await
        .unwrap();
        {
            let session = state.session.read().await;
            let result = session.current.as_ref().unwrap();
            assert!(result.overrides.is_empty());
        }

        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, HOLD_ACTION);
        assert_eq!(writes[1].1, "");
    }

    #[tokio::test]
    async fn manual_move_miss_is_not_found() {
        let (state, _, _) = app_state(vec![player("Top", "1", None, 900, None)], 50);
        let error = move_player_handler(
            State(state),
            Json(MovePlayerRequest {
                query: "nobody".to_string(),
                clan: Clan::Otl,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_move_without_platform_id_is_conflict() {
        let mut unlinked = player("Ghost", "1", None, 100, None);
        unlinked.external_id = None;
        unlinked.mention = None;
        let (state, _, _) = app_state(vec![unlinked], 50);

        let error = move_player_handler(
            State(state),
            Json(MovePlayerRequest {
                query: "Ghost".to_string(),
                clan: Clan::Otl,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn failed_completion_save_leaves_session_unchanged() {
        let roster = vec![player("Top", "1", None, 900, None)];
        let (state, store, _) = app_state(roster, 50);

        distribute_handler(
            State(state.clone()),
            Json(DistributeRequest {
                metric_name: "Trophies".to_string(),
                season_label: None,
            }),
        )
        .await
        .unwrap();

        store.set_fail_writes(true);
        let error = toggle_complete_handler(
            State(state.clone()),
            Json(PlayerActionRequest {
                query: "Top".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_GATEWAY);

        let session = state.session.read().await;
        assert!(session.completed.is_empty());
    }

    #[tokio::test]
    async fn remaining_endpoints_pin_and_refresh() {
        let roster = vec![
            player("One", "1", None, 900, None),
            player("Two", "2", None, 800, None),
        ];
        let (state, _, _) = app_state(roster, 50);

        distribute_handler(
            State(state.clone()),
            Json(DistributeRequest {
                metric_name: "Trophies".to_string(),
                season_label: None,
            }),
        )
        .await
        .unwrap();

        let fresh = remaining_handler(State(state.clone())).await.unwrap().0;
        assert_eq!(fresh.players.len(), 2);
        assert!(!fresh.all_done);

        toggle_complete_handler(
            State(state.clone()),
            Json(PlayerActionRequest {
                query: "One".to_string(),
            }),
        )
        .await
        .unwrap();

        let refreshed = refresh_remaining_handler(State(state.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(refreshed.players.len(), 2);
        assert!(refreshed.players.iter().any(|p| p.identifier == "One" && p.complete));
        assert!(refreshed.players.iter().any(|p| p.identifier == "Two" && !p.complete));
    }

    #[tokio::test]
    async fn refresh_keeps_completions_and_pin() {
        let roster = vec![
            player("One", "1", None, 900, None),
            player("Two", "2", None, 800, None),
        ];
        let (state, store, _) = app_state(roster, 50);

        distribute_handler(
            State(state.clone()),
            Json(DistributeRequest {
                metric_name: "Trophies".to_string(),
                season_label: Some("S3".to_string()),
            }),
        )
        .await
        .unwrap();
        remaining_handler(State(state.clone())).await.unwrap();
        toggle_complete_handler(
            State(state.clone()),
            Json(PlayerActionRequest {
                query: "Two".to_string(),
            }),
        )
        .await
        .unwrap();

        // A new joiner appears before the refresh.
        store
            .rows
            .lock()
            .unwrap()
            .push(player("Three", "3", None, 700, None));

        let refreshed = refresh_handler(State(state.clone())).await.unwrap().0;
        assert_eq!(refreshed.summary.sort_metric, "Trophies");
        assert_eq!(refreshed.summary.season_label.as_deref(), Some("S3"));
        assert_eq!(refreshed.summary.groups[0].to_move, 3);

        let session = state.session.read().await;
        assert!(session.completed.contains("Two"));
        let pin = session.remaining_pin.as_ref().unwrap();
        assert_eq!(pin.len(), 2);
    }

    #[tokio::test]
    async fn refresh_without_distribution_is_conflict() {
        let (state, _, _) = app_state(Vec::new(), 50);
        let error = refresh_handler(State(state)).await.unwrap_err();
        assert_eq!(error.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn get_distribution_without_run_is_not_found() {
        let (state, _, _) = app_state(Vec::new(), 50);
        let error = get_distribution_handler(State(state)).await.unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reset_all_clears_session_and_store() {
        let roster = vec![
            player("Top", "1", None, 900, Some("Hold")),
            player("Mid", "2", None, 500, None),
        ];
        let (state, store, _) = app_state(roster, 50);

        distribute_handler(
            State(state.clone()),
            Json(DistributeRequest {
                metric_name: "Trophies".to_string(),
                season_label: None,
            }),
        )
        .await
        .unwrap();
        toggle_complete_handler(
            State(state.clone()),
            Json(PlayerActionRequest {
                query: "Mid".to_string(),
            }),
        )
        .await
        .unwrap();

        let response = reset_handler(
            State(state.clone()),
            Json(ResetRequest {
                scope: ResetScope::All,
            }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(response.cleared_completions, 1);
        assert_eq!(response.cleared_manual_actions, 1);

        let session = state.session.read().await;
        assert!(session.current.is_none());
        assert!(session.completed.is_empty());
        assert!(session.remaining_pin.is_none());

        let saved = store.saved.lock().unwrap().clone().unwrap();
        assert!(!saved.has_distribution());
        assert!(saved.completed_identifiers.is_empty());
        assert!(
            store
                .rows
                .lock()
                .unwrap()
                .iter()
                .all(|row| row.manual_action.is_none())
        );
    }

    #[tokio::test]
    async fn reset_distribution_only_keeps_completions() {
        let roster = vec![player("Top", "1", None, 900, None)];
        let (state, store, _) = app_state(roster, 50);

        distribute_handler(
            State(state.clone()),
            Json(DistributeRequest {
                metric_name: "Trophies".to_string(),
                season_label: None,
            }),
        )
        .await
        .unwrap();
        toggle_complete_handler(
            State(state.clone()),
            Json(PlayerActionRequest {
                query: "Top".to_string(),
            }),
        )
        .await
        .unwrap();

        reset_handler(
            State(state.clone()),
            Json(ResetRequest {
                scope: ResetScope::DistributionOnly,
            }),
        )
        .await
        .unwrap();

        let session = state.session.read().await;
        assert!(session.current.is_none());
        assert!(session.completed.contains("Top"));

        let saved = store.saved.lock().unwrap().clone().unwrap();
        assert!(!saved.has_distribution());
        assert_eq!(saved.completed_identifiers, vec!["Top".to_string()]);
    }

    #[tokio::test]
    async fn restore_session_rebuilds_from_blob() {
        let roster = vec![
            player("Top", "1", None, 900, None),
            player("Mid", "2", None, 500, None),
        ];
        let (state, store, _) = app_state(roster, 50);
        *store.saved.lock().unwrap() = Some(PersistedState::new(
            "Trophies",
            Some("Season 9".to_string()),
            vec!["Mid".to_string()],
            Utc::now(),
        ));

        restore_session(&state).await.unwrap();

        let session = state.session.read().await;
        let result = session.current.as_ref().expect("distribution restored");
        assert_eq!(result.sort_metric, "Trophies");
        assert_eq!(result.season_label.as_deref(), Some("Season 9"));
        assert_eq!(result.group(Clan::Rgr).movers.len(), 2);
        assert!(session.completed.contains("Mid"));
    }

    #[tokio::test]
    async fn restore_session_without_blob_starts_empty() {
        let (state, _, _) = app_state(vec![player("Top", "1", None, 900, None)], 50);
        restore_session(&state).await.unwrap();

        let session = state.session.read().await;
        assert!(session.current.is_none());
        assert!(session.completed.is_empty());
    }
}

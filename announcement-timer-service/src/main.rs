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

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Datelike, Utc, Weekday};
use clanbot_common::DistributeRequest;
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    client: reqwest::Client,
    distribution_base_url: String,
    weekday: Weekday,
    hour_utc: u32,
    metric: String,
    season_prefix: String,
}

impl AppState {
    fn from_env() -> Self {
        let weekday = std::env::var("ANNOUNCE_WEEKDAY")
            .ok()
            .and_then(|value| match value.trim().parse::<Weekday>() {
                Ok(weekday) => Some(weekday),
                Err(_) => {
                    warn!(value = %value, "invalid ANNOUNCE_WEEKDAY; falling back to Monday");
                    None
                }
            })
            .unwrap_or(Weekday::Mon);

        Self {
            client: reqwest::Client::new(),
            distribution_base_url: std::env::var("DISTRIBUTION_BASE_URL")
                .ok()
                .unwrap_or_else(|| "http://distribution-service:8080".to_string()),
            weekday,
            hour_utc: std::env::var("ANNOUNCE_HOUR_UTC")
                .ok()
                .and_then(|value| value.parse::<u32>().ok())
                .filter(|hour| *hour < 24)
                .unwrap_or(18),
            metric: std::env::var("ANNOUNCE_METRIC")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "Trophies".to_string()),
            season_prefix: std::env::var("ANNOUNCE_SEASON_PREFIX")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "Season".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "announcement_timer_service=debug".to_string()),
        )
        .init();

    let state = AppState::from_env();
    let runner_state = state.clone();
    tokio::spawn(async move {
        run_announcement_loop(runner_state).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("announcement-timer-service shutting down");
    Ok(())
}

async fn run_announcement_loop(state: AppState) {
    loop {
        let now = Utc::now();
        let due = next_slot(now, state.weekday, state.hour_utc);
        let wait = (due - now)
            .to_std()
            .unwrap_or_else(|_| Duration::from_secs(0));
        info!(
            due = %due,
            weekday = ?state.weekday,
            hour_utc = state.hour_utc,
            "next announcement scheduled"
        );
        tokio::time::sleep(wait).await;

        // The slot may have been recomputed across a long sleep; only
        // fire once it has actually arrived.
        if Utc::now() < due {
            continue;
        }

        trigger_announcement(&state).await;
    }
}

/// The next occurrence of `weekday` at `hour` UTC strictly after `now`.
fn next_slot(now: DateTime<Utc>, weekday: Weekday, hour: u32) -> DateTime<Utc> {
    let hour = hour.min(23);
    let today_slot = now.date_naive().and_hms_opt(hour, 0, 0).unwrap().and_utc();
    let days_ahead = (weekday.num_days_from_monday() + 7
        - now.weekday().num_days_from_monday())
        % 7;
    let mut slot = today_slot + chrono::Duration::days(days_ahead as i64);
    if slot <= now {
        slot += chrono::Duration::days(7);
    }
    slot
}

fn season_label(now: DateTime<Utc>, prefix: &str) -> String {
    let week = now.iso_week();
    format!("{} {}-W{:02}", prefix, week.year(), week.week())
}

async fn trigger_announcement(state: &AppState) {
    const MAX_ATTEMPTS: u32 = 3;
    for attempt in 1..=MAX_ATTEMPTS {
        match post_distribution(state).await {
            Ok(()) => {
                info!(attempt, metric = %state.metric, "scheduled announcement triggered");
                return;
            }
            Err(error) => {
                warn!(
                    attempt,
                    error = %format!("{error:#}"),
                    "scheduled announcement failed"
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        }
    }
}

async fn post_distribution(state: &AppState) -> anyhow::Result<()> {
    let url = format!(
        "{}/v1/distribution",
        state.distribution_base_url.trim_end_matches('/')
    );
    let request = DistributeRequest {
        metric_name: state.metric.clone(),
        season_label: Some(season_label(Utc::now(), &state.season_prefix)),
    };
    let response = state
        .client
        .post(&url)
        .json(&request)
        .send()
        .await
        .context("failed to call distribution service")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_else(|_| String::new());
        anyhow::bail!("distribution service returned {status}: {body}");
    }
    Ok(())
}

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

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CLAN_CAPACITY: usize = 50;
pub const HOLD_ACTION: &str = "Hold";
pub const UNKNOWN_LABEL: &str = "Unknown";
pub const COMPLETE_MARKER: &str = "✅";
/// Character budget for a single chat message; sections longer than this
/// are split between lines, never inside one.
pub const MESSAGE_CHAR_BUDGET: usize = 1900;

/// All destination clans in placement order.
pub const ALL_CLANS: [Clan; 3] = [Clan::Rgr, Clan::Otl, Clan::Rnd];

pub type Identifier = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Clan {
    Rgr,
    Otl,
    Rnd,
}

impl Clan {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rgr => "RGR",
            Self::Otl => "OTL",
            Self::Rnd => "RND",
        }
    }

    /// Parse a free-text clan label. Whitespace and casing are ignored.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim();
        ALL_CLANS
            .into_iter()
            .find(|clan| normalized.eq_ignore_ascii_case(clan.as_str()))
    }

    pub fn index(self) -> usize {
        match self {
            Self::Rgr => 0,
            Self::Otl => 1,
            Self::Rnd => 2,
        }
    }
}

impl std::fmt::Display for Clan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverrideKind {
    Hold,
    Stay,
    Move,
    Other,
}

impl OverrideKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hold => "HOLD",
            Self::Stay => "STAY",
            Self::Move => "MOVE",
            Self::Other => "OTHER",
        }
    }
}

/// One roster row. Every field besides the ranking metric is optional;
/// rows are parsed permissively and missing data degrades to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerRecord {
    /// Display name attached by upstream enrichment (e.g. resolved from
    /// the chat platform). Takes priority over every sheet column.
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mention: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub current_clan: Option<String>,
    #[serde(default)]
    pub metric: i64,
    #[serde(default)]
    pub manual_action: Option<String>,
    /// Unmapped columns in sheet order, kept for identity fallback.
    #[serde(default)]
    pub extras: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverrideEntry {
    pub record: PlayerRecord,
    pub kind: OverrideKind,
    /// Clan label the override resolves to, or the raw action value for
    /// unrecognized actions.
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClanGroup {
    pub clan: Clan,
    /// Players that must physically move into this clan.
    pub movers: Vec<PlayerRecord>,
    /// Total headcount counted against this clan's capacity, including
    /// players already resident and anchored overrides.
    pub assigned: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionResult {
    pub groups: Vec<ClanGroup>,
    pub overrides: Vec<OverrideEntry>,
    /// Players left without an assignment because every clan was full.
    pub unplaced: Vec<PlayerRecord>,
    pub sort_metric: String,
    pub season_label: Option<String>,
    pub capacity: usize,
}

impl DistributionResult {
    pub fn group(&self, clan: Clan) -> &ClanGroup {
        &self.groups[clan.index()]
    }

    /// Every player shown anywhere in the result, in presentation order.
    pub fn listed_players(&self) -> impl Iterator<Item = &PlayerRecord> {
        self.groups
            .iter()
            .flat_map(|group| group.movers.iter())
            .chain(self.overrides.iter().map(|entry| &entry.record))
            .chain(self.unplaced.iter())
    }
}

/// Opaque state blob persisted through the roster store across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub sort_metric: String,
    pub season_label: Option<String>,
    pub completed_identifiers: Vec<Identifier>,
    pub timestamp: i64,
}

impl PersistedState {
    pub fn new(
        sort_metric: impl Into<String>,
        season_label: Option<String>,
        completed_identifiers: Vec<Identifier>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            sort_metric: sort_metric.into(),
            season_label,
            completed_identifiers,
            timestamp: now.timestamp(),
        }
    }

    /// Whether the blob carries distribution parameters worth restoring.
    pub fn has_distribution(&self) -> bool {
        !self.sort_metric.trim().is_empty()
    }
}

/// Parse a ranking value out of free text. Non-numeric characters are
/// stripped; anything unparseable is 0.
pub fn parse_metric(raw: &str) -> i64 {
    let trimmed = raw.trim();
    let negative = trimmed.starts_with('-');
    let digits: String = trimmed.chars().filter(|ch| ch.is_ascii_digit()).collect();
    if digits.is_empty() {
        return 0;
    }
    let magnitude = digits.parse::<i64>().unwrap_or(0);
    if negative { -magnitude } else { magnitude }
}

/// The single canonical handle for a player. Equality of this string is
/// the notion of "same player" everywhere.
pub fn canonical_identifier(record: &PlayerRecord) -> String {
    let candidates = [
        record.display_name.as_deref(),
        record.mention.as_deref(),
        record.name.as_deref(),
    ];
    for candidate in candidates.into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    for (_, value) in &record.extras {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    UNKNOWN_LABEL.to_string()
}

/// Extract the numeric platform id from a mention-shaped token such as
/// `<@123>` or `<@!123>`.
pub fn mention_platform_id(token: &str) -> Option<String> {
    let re = Regex::new(r"<@!?(\d+)>").unwrap();
    re.captures(token.trim())
        .map(|caps| caps[1].to_string())
}

/// Persistent set of players that have completed their assigned move.
/// Survives redistribution; cleared only by an explicit reset.
#[derive(Debug, Clone, Default)]
pub struct CompletionSet {
    entries: HashSet<Identifier>,
}

impl CompletionSet {
    /// Flip membership for an identifier. Returns the new state.
    pub fn toggle(&mut self, identifier: &str) -> bool {
        let identifier = identifier.trim();
        if self.entries.remove(identifier) {
            false
        } else {
            self.entries.insert(identifier.to_string());
            true
        }
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains(identifier.trim())
    }

    /// Completion check with legacy fallbacks: canonical identifier
    /// first, then the stored mention string, then any entry that
    /// textually contains the player's platform id. Identifiers can
    /// drift between runs (display names change); the platform id
    /// cannot.
    pub fn is_complete(&self, record: &PlayerRecord) -> bool {
        if self.contains(&canonical_identifier(record)) {
            return true;
        }
        if let Some(mention) = record.mention.as_deref()
            && self.contains(mention)
        {
            return true;
        }
        if let Some(external_id) = record
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            return self.entries.iter().any(|entry| entry.contains(external_id));
        }
        false
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted snapshot for persistence.
    pub fn identifiers(&self) -> Vec<Identifier> {
        let mut ids: Vec<Identifier> = self.entries.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn restore(identifiers: impl IntoIterator<Item = Identifier>) -> Self {
        Self {
            entries: identifiers
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }
}

/// Join lines into blocks that never exceed `budget` characters. Splits
/// happen only between lines; a single oversized line becomes its own
/// block rather than being cut.
pub fn split_blocks(lines: &[String], budget: usize) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in lines {
        let needed = if current.is_empty() {
            line.chars().count()
        } else {
            current.chars().count() + 1 + line.chars().count()
        };
        if !current.is_empty() && needed > budget {
            blocks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment
/// variables. Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

/// Wire request shared by the distribution service and the announcement
/// timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributeRequest {
    pub metric_name: String,
    #[serde(default)]
    pub season_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub clan: Clan,
    pub to_move: usize,
    pub assigned: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub sort_metric: String,
    pub season_label: Option<String>,
    pub groups: Vec<GroupSummary>,
    pub override_count: usize,
    pub unplaced_count: usize,
}

impl DistributionSummary {
    pub fn from_result(result: &DistributionResult) -> Self {
        Self {
            sort_metric: result.sort_metric.clone(),
            season_label: result.season_label.clone(),
            groups: result
                .groups
                .iter()
                .map(|group| GroupSummary {
                    clan: group.clan,
                    to_move: group.movers.len(),
                    assigned: group.assigned,
                })
                .collect(),
            override_count: result.overrides.len(),
            unplaced_count: result.unplaced.len(),
        }
    }
}

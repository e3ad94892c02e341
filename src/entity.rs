use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::merge::{fill, fill_copy, normalize_person_name, normalize_team_name};

/// Source tag for records entered through the CRUD surface.
pub const MANUAL_SOURCE: &str = "manual";

/// A record every source can produce, merged field by field.
pub trait Canonical: Clone + Send + 'static {
    const KIND: &'static str;

    /// Two records with equal identity describe the same real-world entity.
    fn identity(&self) -> String;

    /// Fill-forward merge: empty fields take the value from `other`.
    fn fill_from(&mut self, other: &Self);

    /// Deterministic ordering applied after merging.
    fn order(&self, other: &Self) -> Ordering;

    fn external_ids(&self) -> &BTreeMap<String, String>;

    fn external_ids_mut(&mut self) -> &mut BTreeMap<String, String>;
}

/// `scope|name`, or empty when the name normalizes to nothing.
fn scoped(scope: Option<&str>, name: String) -> String {
    if name.is_empty() {
        return name;
    }
    format!("{}|{name}", scope.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Team {
    pub id: String,
    pub source: String,
    pub name: String,
    pub short_name: Option<String>,
    pub league: Option<String>,
    pub country: Option<String>,
    pub stadium: Option<String>,
    pub founded: Option<u16>,
    pub coach: Option<String>,
    pub crest_url: Option<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl Team {
    pub fn new(source: &str, id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        let mut external_ids = BTreeMap::new();
        external_ids.insert(source.to_string(), id.clone());
        Self {
            id,
            source: source.to_string(),
            name: name.into(),
            external_ids,
            ..Self::default()
        }
    }

    /// Matches a canonical id, any provider id, or the team name.
    pub fn matches_ref(&self, name_or_id: &str) -> bool {
        let needle = name_or_id.trim();
        if needle.is_empty() {
            return false;
        }
        if self.id == needle || self.external_ids.values().any(|v| v == needle) {
            return true;
        }
        let wanted = normalize_team_name(needle);
        !wanted.is_empty()
            && (normalize_team_name(&self.name) == wanted
                || self
                    .short_name
                    .as_deref()
                    .is_some_and(|s| normalize_team_name(s) == wanted))
    }
}

impl Canonical for Team {
    const KIND: &'static str = "team";

    /// Normalized name within the team's league.
    fn identity(&self) -> String {
        let league = self.league.as_deref().map(|l| l.trim().to_ascii_uppercase());
        scoped(league.as_deref(), normalize_team_name(&self.name))
    }

    fn fill_from(&mut self, other: &Self) {
        fill(&mut self.short_name, &other.short_name);
        fill(&mut self.league, &other.league);
        fill(&mut self.country, &other.country);
        fill(&mut self.stadium, &other.stadium);
        fill_copy(&mut self.founded, other.founded);
        fill(&mut self.coach, &other.coach);
        fill(&mut self.crest_url, &other.crest_url);
    }

    fn order(&self, other: &Self) -> Ordering {
        normalize_team_name(&self.name)
            .cmp(&normalize_team_name(&other.name))
            .then_with(|| self.league.cmp(&other.league))
            .then_with(|| self.id.cmp(&other.id))
    }

    fn external_ids(&self) -> &BTreeMap<String, String> {
        &self.external_ids
    }

    fn external_ids_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.external_ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Player {
    pub id: String,
    pub source: String,
    pub name: String,
    pub team_id: Option<String>,
    pub team_name: Option<String>,
    pub position: Option<String>,
    pub nationality: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub shirt_number: Option<u8>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl Player {
    pub fn new(source: &str, id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        let mut external_ids = BTreeMap::new();
        external_ids.insert(source.to_string(), id.clone());
        Self {
            id,
            source: source.to_string(),
            name: name.into(),
            external_ids,
            ..Self::default()
        }
    }
}

impl Canonical for Player {
    const KIND: &'static str = "player";

    /// Normalized name within the player's team.
    fn identity(&self) -> String {
        let team = self
            .team_name
            .as_deref()
            .map(normalize_team_name)
            .filter(|t| !t.is_empty())
            .or_else(|| self.team_id.clone());
        scoped(team.as_deref(), normalize_person_name(&self.name))
    }

    fn fill_from(&mut self, other: &Self) {
        fill(&mut self.team_id, &other.team_id);
        fill(&mut self.team_name, &other.team_name);
        fill(&mut self.position, &other.position);
        fill(&mut self.nationality, &other.nationality);
        fill_copy(&mut self.birth_date, other.birth_date);
        fill_copy(&mut self.shirt_number, other.shirt_number);
    }

    fn order(&self, other: &Self) -> Ordering {
        normalize_person_name(&self.name)
            .cmp(&normalize_person_name(&other.name))
            .then_with(|| self.team_name.cmp(&other.team_name))
            .then_with(|| self.shirt_number.cmp(&other.shirt_number))
            .then_with(|| self.id.cmp(&other.id))
    }

    fn external_ids(&self) -> &BTreeMap<String, String> {
        &self.external_ids
    }

    fn external_ids_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.external_ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Scheduled,
    Live,
    Finished,
    Postponed,
    Cancelled,
    #[default]
    Unknown,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Scheduled => "scheduled",
            MatchStatus::Live => "live",
            MatchStatus::Finished => "finished",
            MatchStatus::Postponed => "postponed",
            MatchStatus::Cancelled => "cancelled",
            MatchStatus::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> MatchStatus {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scheduled" | "timed" | "ns" | "tbd" | "programado" => MatchStatus::Scheduled,
            "live" | "in_play" | "paused" | "1h" | "2h" | "ht" | "et" | "en_juego" => {
                MatchStatus::Live
            }
            "finished" | "ft" | "aet" | "pen" | "awarded" | "finalizado" => MatchStatus::Finished,
            "postponed" | "pst" | "pp" | "susp" | "suspended" | "aplazado" => {
                MatchStatus::Postponed
            }
            "cancelled" | "canc" | "abd" | "cancelado" => MatchStatus::Cancelled,
            _ => MatchStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub source: String,
    pub league: Option<String>,
    pub kickoff: DateTime<Utc>,
    pub home: String,
    pub away: String,
    pub home_id: Option<String>,
    pub away_id: Option<String>,
    pub home_goals: Option<u8>,
    pub away_goals: Option<u8>,
    pub status: MatchStatus,
    pub referee: Option<String>,
    pub venue: Option<String>,
    pub round: Option<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl Match {
    pub fn new(
        source: &str,
        id: impl Into<String>,
        kickoff: DateTime<Utc>,
        home: impl Into<String>,
        away: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let mut external_ids = BTreeMap::new();
        external_ids.insert(source.to_string(), id.clone());
        Self {
            id,
            source: source.to_string(),
            league: None,
            kickoff,
            home: home.into(),
            away: away.into(),
            home_id: None,
            away_id: None,
            home_goals: None,
            away_goals: None,
            status: MatchStatus::Unknown,
            referee: None,
            venue: None,
            round: None,
            external_ids,
        }
    }

    pub fn involves_team(&self, name: &str) -> bool {
        let wanted = normalize_team_name(name);
        !wanted.is_empty()
            && (normalize_team_name(&self.home) == wanted
                || normalize_team_name(&self.away) == wanted
                || self.home_id.as_deref() == Some(name.trim())
                || self.away_id.as_deref() == Some(name.trim()))
    }

    pub fn refereed_by(&self, name: &str) -> bool {
        let wanted = normalize_person_name(name);
        !wanted.is_empty()
            && self
                .referee
                .as_deref()
                .is_some_and(|r| normalize_person_name(r).contains(&wanted))
    }
}

impl Canonical for Match {
    const KIND: &'static str = "match";

    fn identity(&self) -> String {
        format!(
            "{}|{}|{}",
            normalize_team_name(&self.home),
            normalize_team_name(&self.away),
            self.kickoff.date_naive()
        )
    }

    fn fill_from(&mut self, other: &Self) {
        fill(&mut self.league, &other.league);
        fill(&mut self.home_id, &other.home_id);
        fill(&mut self.away_id, &other.away_id);
        fill_copy(&mut self.home_goals, other.home_goals);
        fill_copy(&mut self.away_goals, other.away_goals);
        if self.status == MatchStatus::Unknown {
            self.status = other.status;
        }
        fill(&mut self.referee, &other.referee);
        fill(&mut self.venue, &other.venue);
        fill(&mut self.round, &other.round);
    }

    fn order(&self, other: &Self) -> Ordering {
        self.kickoff
            .cmp(&other.kickoff)
            .then_with(|| self.identity().cmp(&other.identity()))
    }

    fn external_ids(&self) -> &BTreeMap<String, String> {
        &self.external_ids
    }

    fn external_ids_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.external_ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Standing {
    pub id: String,
    pub source: String,
    pub league: String,
    pub season: Option<u16>,
    pub position: Option<u16>,
    pub team: String,
    pub team_id: Option<String>,
    pub played: Option<u16>,
    pub won: Option<u16>,
    pub drawn: Option<u16>,
    pub lost: Option<u16>,
    pub goals_for: Option<u16>,
    pub goals_against: Option<u16>,
    pub points: Option<u16>,
    pub form: Option<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl Standing {
    pub fn new(source: &str, league: &str, team: impl Into<String>) -> Self {
        let team = team.into();
        let id = format!("{source}:{league}:{}", normalize_team_name(&team));
        let mut external_ids = BTreeMap::new();
        external_ids.insert(source.to_string(), id.clone());
        Self {
            id,
            source: source.to_string(),
            league: league.to_string(),
            team,
            external_ids,
            ..Self::default()
        }
    }
}

impl Canonical for Standing {
    const KIND: &'static str = "standing";

    fn identity(&self) -> String {
        format!("{}|{}", self.league, normalize_team_name(&self.team))
    }

    fn fill_from(&mut self, other: &Self) {
        fill_copy(&mut self.season, other.season);
        fill_copy(&mut self.position, other.position);
        fill(&mut self.team_id, &other.team_id);
        fill_copy(&mut self.played, other.played);
        fill_copy(&mut self.won, other.won);
        fill_copy(&mut self.drawn, other.drawn);
        fill_copy(&mut self.lost, other.lost);
        fill_copy(&mut self.goals_for, other.goals_for);
        fill_copy(&mut self.goals_against, other.goals_against);
        fill_copy(&mut self.points, other.points);
        fill(&mut self.form, &other.form);
    }

    fn order(&self, other: &Self) -> Ordering {
        // Unranked rows sink to the bottom.
        let rank = |s: &Standing| s.position.unwrap_or(u16::MAX);
        self.league
            .cmp(&other.league)
            .then_with(|| rank(self).cmp(&rank(other)))
            .then_with(|| other.points.cmp(&self.points))
            .then_with(|| self.identity().cmp(&other.identity()))
    }

    fn external_ids(&self) -> &BTreeMap<String, String> {
        &self.external_ids
    }

    fn external_ids_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.external_ids
    }
}

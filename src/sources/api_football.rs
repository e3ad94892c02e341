use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    MatchQuery, PlayerQuery, SourceAdapter, StandingsQuery, TeamQuery, fetch_body, malformed,
    non_empty, parse_kickoff,
};
use crate::cancel::CancelToken;
use crate::config::ProviderConfig;
use crate::entity::{Match, MatchStatus, Player, Standing, Team};
use crate::error::{HubError, Result};
use crate::http_client::{HttpRequest, RateLimitedClient};
use crate::leagues::League;

pub const SOURCE_ID: &str = "api_football";
const ID_PREFIX: &str = "af:";

/// API-Football v3 (api-sports.io). Auth via the `x-apisports-key` header.
pub struct ApiFootballSource {
    base_url: String,
    api_key: Option<String>,
    client: Arc<RateLimitedClient>,
}

impl ApiFootballSource {
    pub fn new(config: &ProviderConfig, client: Arc<RateLimitedClient>) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            client,
        }
    }

    fn request(&self, path: &str) -> HttpRequest {
        let req = HttpRequest::get(format!("{}{path}", self.base_url));
        match self.api_key.as_deref() {
            Some(key) => req.header("x-apisports-key", key),
            None => req,
        }
    }
}

impl SourceAdapter for ApiFootballSource {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn fetch_teams(&self, query: &TeamQuery, cancel: &CancelToken) -> Result<Vec<Team>> {
        let req = self
            .request("/teams")
            .query("league", query.league.api_football_id())
            .query("season", query.season);
        let Some(body) = fetch_body(&self.client, SOURCE_ID, &req, cancel)? else {
            return Ok(Vec::new());
        };
        let mut teams = parse_teams_json(&body)?;
        for team in &mut teams {
            team.league = Some(query.league.code().to_string());
        }
        Ok(teams)
    }

    fn fetch_players(&self, query: &PlayerQuery, cancel: &CancelToken) -> Result<Vec<Player>> {
        let Some(team_id) = query.team.native_id(SOURCE_ID, ID_PREFIX) else {
            debug!(team = %query.team.name, "no api-football id for team");
            return Ok(Vec::new());
        };
        let req = self.request("/players/squads").query("team", team_id);
        match fetch_body(&self.client, SOURCE_ID, &req, cancel)? {
            Some(body) => parse_squad_json(&body),
            None => Ok(Vec::new()),
        }
    }

    fn fetch_matches(&self, query: &MatchQuery, cancel: &CancelToken) -> Result<Vec<Match>> {
        let bodies: Vec<Option<String>> = match query.league {
            Some(league) => {
                let req = self
                    .request("/fixtures")
                    .query("league", league.api_football_id())
                    .query("season", query.season)
                    .query("from", query.from.format("%Y-%m-%d"))
                    .query("to", query.to.format("%Y-%m-%d"));
                vec![fetch_body(&self.client, SOURCE_ID, &req, cancel)?]
            }
            None => {
                // Date-only fixture queries take one request per day.
                let requests: Vec<HttpRequest> = query
                    .days()
                    .into_iter()
                    .map(|day| self.request("/fixtures").query("date", day.format("%Y-%m-%d")))
                    .collect();
                let mut bodies = Vec::with_capacity(requests.len());
                let mut failures = Vec::new();
                for (req, resp) in requests
                    .iter()
                    .zip(self.client.parallel_requests(&requests, cancel))
                {
                    let body = resp
                        .map_err(|err| err.into_source_unavailable(SOURCE_ID))
                        .and_then(|resp| {
                            super::classify_body(SOURCE_ID, &req.url, resp.status, resp.body)
                        });
                    match body {
                        Ok(body) => bodies.push(body),
                        Err(err) => failures.push(err),
                    }
                }
                // A single failed day is tolerated; a wholly failed batch is not.
                if bodies.is_empty() {
                    if let Some(err) = failures.into_iter().next() {
                        return Err(err);
                    }
                } else if !failures.is_empty() {
                    warn!(failed_days = failures.len(), "api-football day requests failed");
                }
                bodies
            }
        };

        let mut out = Vec::new();
        for body in bodies.into_iter().flatten() {
            out.extend(parse_fixtures_json(&body)?);
        }
        out.retain(|m| {
            query.contains(&m.kickoff)
                && query
                    .league
                    .is_none_or(|league| m.league.as_deref() == Some(league.code()))
        });
        Ok(out)
    }

    fn fetch_standings(
        &self,
        query: &StandingsQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<Standing>> {
        let req = self
            .request("/standings")
            .query("league", query.league.api_football_id())
            .query("season", query.season);
        let Some(body) = fetch_body(&self.client, SOURCE_ID, &req, cancel)? else {
            return Ok(Vec::new());
        };
        let mut rows = parse_standings_json(&body, query.league.code())?;
        for row in &mut rows {
            row.season = Some(query.season);
        }
        Ok(rows)
    }
}

/// Every API-Football payload wraps its data in `response` and reports
/// account problems (bad key, exhausted quota) in `errors` with HTTP 200.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    errors: Value,
    #[serde(default = "Vec::new")]
    response: Vec<T>,
}

fn parse_envelope<T: for<'de> Deserialize<'de>>(raw: &str, what: &str) -> Result<Vec<T>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let parsed: Envelope<T> =
        serde_json::from_str(trimmed).map_err(|err| malformed(SOURCE_ID, what, err))?;
    if let Some(reason) = account_error(&parsed.errors) {
        return Err(HubError::source_unavailable(SOURCE_ID, reason));
    }
    Ok(parsed.response)
}

fn account_error(errors: &Value) -> Option<String> {
    match errors {
        Value::Object(map) if !map.is_empty() => Some(
            map.iter()
                .map(|(k, v)| format!("{k}: {}", v.as_str().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Value::Array(items) if !items.is_empty() => Some(
            items
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct AfTeamEntry {
    team: AfTeam,
    venue: Option<AfVenue>,
}

#[derive(Debug, Deserialize)]
struct AfTeam {
    id: u64,
    name: String,
    code: Option<String>,
    country: Option<String>,
    founded: Option<u16>,
    logo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AfVenue {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AfSquadEntry {
    team: AfTeam,
    #[serde(default)]
    players: Vec<AfSquadPlayer>,
}

#[derive(Debug, Deserialize)]
struct AfSquadPlayer {
    id: u64,
    name: String,
    number: Option<u8>,
    position: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AfFixtureEntry {
    fixture: AfFixture,
    league: Option<AfLeague>,
    teams: AfTeams,
    goals: Option<AfGoals>,
}

#[derive(Debug, Deserialize)]
struct AfFixture {
    id: u64,
    referee: Option<String>,
    date: String,
    venue: Option<AfVenue>,
    status: Option<AfStatus>,
}

#[derive(Debug, Deserialize)]
struct AfStatus {
    short: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AfLeague {
    id: Option<u32>,
    round: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AfTeams {
    home: AfSide,
    away: AfSide,
}

#[derive(Debug, Deserialize)]
struct AfSide {
    id: Option<u64>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AfGoals {
    home: Option<u8>,
    away: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct AfStandingsEntry {
    league: AfStandingsLeague,
}

#[derive(Debug, Deserialize)]
struct AfStandingsLeague {
    #[serde(default)]
    standings: Vec<Vec<AfStandingRow>>,
}

#[derive(Debug, Deserialize)]
struct AfStandingRow {
    rank: Option<u16>,
    team: AfSide,
    points: Option<u16>,
    form: Option<String>,
    all: Option<AfRecord>,
}

#[derive(Debug, Deserialize)]
struct AfRecord {
    played: Option<u16>,
    win: Option<u16>,
    draw: Option<u16>,
    lose: Option<u16>,
    goals: Option<AfGoalTotals>,
}

#[derive(Debug, Deserialize)]
struct AfGoalTotals {
    #[serde(rename = "for")]
    scored: Option<u16>,
    against: Option<u16>,
}

pub fn parse_teams_json(raw: &str) -> Result<Vec<Team>> {
    let entries: Vec<AfTeamEntry> = parse_envelope(raw, "teams")?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let t = entry.team;
            let mut team = Team::new(SOURCE_ID, format!("{ID_PREFIX}{}", t.id), t.name);
            team.short_name = non_empty(t.code);
            team.country = non_empty(t.country);
            team.founded = t.founded;
            team.crest_url = non_empty(t.logo);
            team.stadium = entry.venue.and_then(|v| non_empty(v.name));
            team
        })
        .collect())
}

pub fn parse_squad_json(raw: &str) -> Result<Vec<Player>> {
    let entries: Vec<AfSquadEntry> = parse_envelope(raw, "squad")?;
    let mut out = Vec::new();
    for entry in entries {
        let team_id = format!("{ID_PREFIX}{}", entry.team.id);
        for p in entry.players {
            let mut player = Player::new(SOURCE_ID, format!("{ID_PREFIX}p{}", p.id), p.name);
            player.team_id = Some(team_id.clone());
            player.team_name = Some(entry.team.name.clone());
            player.shirt_number = p.number;
            player.position = non_empty(p.position);
            out.push(player);
        }
    }
    Ok(out)
}

pub fn parse_fixtures_json(raw: &str) -> Result<Vec<Match>> {
    let entries: Vec<AfFixtureEntry> = parse_envelope(raw, "fixtures")?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(kickoff) = parse_kickoff(&entry.fixture.date) else {
            continue;
        };
        let (Some(home), Some(away)) = (
            non_empty(entry.teams.home.name.clone()),
            non_empty(entry.teams.away.name.clone()),
        ) else {
            continue;
        };
        let mut row = Match::new(
            SOURCE_ID,
            format!("{ID_PREFIX}m{}", entry.fixture.id),
            kickoff,
            home,
            away,
        );
        row.home_id = entry.teams.home.id.map(|id| format!("{ID_PREFIX}{id}"));
        row.away_id = entry.teams.away.id.map(|id| format!("{ID_PREFIX}{id}"));
        if let Some(goals) = entry.goals {
            row.home_goals = goals.home;
            row.away_goals = goals.away;
        }
        row.status = entry
            .fixture
            .status
            .and_then(|s| s.short)
            .map(|s| MatchStatus::parse(&s))
            .unwrap_or_default();
        row.referee = non_empty(entry.fixture.referee).map(|r| strip_referee_country(&r));
        row.venue = entry.fixture.venue.and_then(|v| non_empty(v.name));
        if let Some(league) = entry.league {
            row.league = league
                .id
                .and_then(League::from_api_football_id)
                .map(|l| l.code().to_string());
            row.round = non_empty(league.round);
        }
        out.push(row);
    }
    Ok(out)
}

/// "Jesús Gil, Spain" -> "Jesús Gil".
fn strip_referee_country(raw: &str) -> String {
    raw.split(',').next().unwrap_or(raw).trim().to_string()
}

pub fn parse_standings_json(raw: &str, league_code: &str) -> Result<Vec<Standing>> {
    let entries: Vec<AfStandingsEntry> = parse_envelope(raw, "standings")?;
    let mut out = Vec::new();
    for entry in entries {
        // Group-stage competitions return several tables; keep them all.
        for row in entry.league.standings.into_iter().flatten() {
            let Some(name) = non_empty(row.team.name.clone()) else {
                continue;
            };
            let mut standing = Standing::new(SOURCE_ID, league_code, name);
            standing.position = row.rank;
            standing.team_id = row.team.id.map(|id| format!("{ID_PREFIX}{id}"));
            standing.points = row.points;
            standing.form = non_empty(row.form);
            if let Some(all) = row.all {
                standing.played = all.played;
                standing.won = all.win;
                standing.drawn = all.draw;
                standing.lost = all.lose;
                if let Some(goals) = all.goals {
                    standing.goals_for = goals.scored;
                    standing.goals_against = goals.against;
                }
            }
            out.push(standing);
        }
    }
    Ok(out)
}

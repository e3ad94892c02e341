use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use super::{
    MatchQuery, PlayerQuery, SourceAdapter, StandingsQuery, TeamQuery, fetch_body, malformed,
    non_empty, parse_date, parse_kickoff,
};
use crate::cancel::CancelToken;
use crate::config::ProviderConfig;
use crate::entity::{Match, MatchStatus, Player, Standing, Team};
use crate::error::Result;
use crate::http_client::{HttpRequest, RateLimitedClient};

pub const SOURCE_ID: &str = "football_data";
const ID_PREFIX: &str = "fd:";

/// football-data.org v4. Auth via the `X-Auth-Token` header.
pub struct FootballDataSource {
    base_url: String,
    api_key: Option<String>,
    client: Arc<RateLimitedClient>,
}

impl FootballDataSource {
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
            Some(key) => req.header("X-Auth-Token", key),
            None => req,
        }
    }
}

impl SourceAdapter for FootballDataSource {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn fetch_teams(&self, query: &TeamQuery, cancel: &CancelToken) -> Result<Vec<Team>> {
        let req = self
            .request(&format!("/competitions/{}/teams", query.league.code()))
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
            debug!(team = %query.team.name, "no football-data id for team");
            return Ok(Vec::new());
        };
        let req = self.request(&format!("/teams/{team_id}"));
        match fetch_body(&self.client, SOURCE_ID, &req, cancel)? {
            Some(body) => parse_squad_json(&body),
            None => Ok(Vec::new()),
        }
    }

    fn fetch_matches(&self, query: &MatchQuery, cancel: &CancelToken) -> Result<Vec<Match>> {
        let path = match query.league {
            Some(league) => format!("/competitions/{}/matches", league.code()),
            None => "/matches".to_string(),
        };
        let req = self
            .request(&path)
            .query("dateFrom", query.from.format("%Y-%m-%d"))
            .query("dateTo", query.to.format("%Y-%m-%d"));
        let Some(body) = fetch_body(&self.client, SOURCE_ID, &req, cancel)? else {
            return Ok(Vec::new());
        };
        let mut matches = parse_matches_json(&body)?;
        matches.retain(|m| query.contains(&m.kickoff));
        Ok(matches)
    }

    fn fetch_standings(
        &self,
        query: &StandingsQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<Standing>> {
        let req = self
            .request(&format!("/competitions/{}/standings", query.league.code()))
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

#[derive(Debug, Deserialize)]
struct TeamsResponse {
    #[serde(default)]
    teams: Vec<FdTeam>,
}

#[derive(Debug, Deserialize)]
struct FdTeam {
    id: u64,
    name: String,
    #[serde(rename = "shortName")]
    short_name: Option<String>,
    crest: Option<String>,
    founded: Option<u16>,
    venue: Option<String>,
    area: Option<FdArea>,
    coach: Option<FdPerson>,
    #[serde(default)]
    squad: Vec<FdSquadMember>,
}

#[derive(Debug, Deserialize)]
struct FdArea {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FdPerson {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FdSquadMember {
    id: u64,
    name: String,
    position: Option<String>,
    #[serde(rename = "dateOfBirth")]
    date_of_birth: Option<String>,
    nationality: Option<String>,
    #[serde(rename = "shirtNumber")]
    shirt_number: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct MatchesResponse {
    #[serde(default)]
    matches: Vec<FdMatch>,
}

#[derive(Debug, Deserialize)]
struct FdMatch {
    id: u64,
    #[serde(rename = "utcDate")]
    utc_date: String,
    status: Option<String>,
    matchday: Option<u32>,
    venue: Option<String>,
    competition: Option<FdCompetition>,
    #[serde(rename = "homeTeam")]
    home_team: FdMatchTeam,
    #[serde(rename = "awayTeam")]
    away_team: FdMatchTeam,
    score: Option<FdScore>,
    #[serde(default)]
    referees: Vec<FdReferee>,
}

#[derive(Debug, Deserialize)]
struct FdCompetition {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FdMatchTeam {
    id: Option<u64>,
    name: Option<String>,
    #[serde(rename = "shortName")]
    short_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FdScore {
    #[serde(rename = "fullTime")]
    full_time: Option<FdGoals>,
}

#[derive(Debug, Deserialize)]
struct FdGoals {
    home: Option<u8>,
    away: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct FdReferee {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StandingsResponse {
    #[serde(default)]
    standings: Vec<FdStandingGroup>,
}

#[derive(Debug, Deserialize)]
struct FdStandingGroup {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    table: Vec<FdTableRow>,
}

#[derive(Debug, Deserialize)]
struct FdTableRow {
    position: Option<u16>,
    team: FdMatchTeam,
    #[serde(rename = "playedGames")]
    played_games: Option<u16>,
    form: Option<String>,
    won: Option<u16>,
    draw: Option<u16>,
    lost: Option<u16>,
    points: Option<u16>,
    #[serde(rename = "goalsFor")]
    goals_for: Option<u16>,
    #[serde(rename = "goalsAgainst")]
    goals_against: Option<u16>,
}

pub fn parse_teams_json(raw: &str) -> Result<Vec<Team>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let parsed: TeamsResponse =
        serde_json::from_str(trimmed).map_err(|err| malformed(SOURCE_ID, "teams", err))?;
    Ok(parsed.teams.into_iter().map(team_from_wire).collect())
}

fn team_from_wire(t: FdTeam) -> Team {
    let mut team = Team::new(SOURCE_ID, format!("{ID_PREFIX}{}", t.id), t.name);
    team.short_name = non_empty(t.short_name);
    team.crest_url = non_empty(t.crest);
    team.founded = t.founded;
    team.stadium = non_empty(t.venue);
    team.country = t.area.and_then(|a| non_empty(a.name));
    team.coach = t.coach.and_then(|c| non_empty(c.name));
    team
}

/// `/teams/{id}` body: the team plus its squad.
pub fn parse_squad_json(raw: &str) -> Result<Vec<Player>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let parsed: FdTeam =
        serde_json::from_str(trimmed).map_err(|err| malformed(SOURCE_ID, "squad", err))?;
    let team_id = format!("{ID_PREFIX}{}", parsed.id);
    let team_name = parsed.name.clone();
    Ok(parsed
        .squad
        .into_iter()
        .map(|m| {
            let mut player = Player::new(SOURCE_ID, format!("{ID_PREFIX}p{}", m.id), m.name);
            player.team_id = Some(team_id.clone());
            player.team_name = Some(team_name.clone());
            player.position = non_empty(m.position);
            player.nationality = non_empty(m.nationality);
            player.birth_date = m.date_of_birth.as_deref().and_then(parse_date);
            player.shirt_number = m.shirt_number;
            player
        })
        .collect())
}

pub fn parse_matches_json(raw: &str) -> Result<Vec<Match>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let parsed: MatchesResponse =
        serde_json::from_str(trimmed).map_err(|err| malformed(SOURCE_ID, "matches", err))?;

    let mut out = Vec::with_capacity(parsed.matches.len());
    for m in parsed.matches {
        let Some(kickoff) = parse_kickoff(&m.utc_date) else {
            continue;
        };
        let (Some(home), Some(away)) = (team_name(&m.home_team), team_name(&m.away_team)) else {
            // TBD knockout slots have no teams yet.
            continue;
        };
        let mut row = Match::new(SOURCE_ID, format!("{ID_PREFIX}m{}", m.id), kickoff, home, away);
        row.league = m.competition.and_then(|c| non_empty(c.code));
        row.home_id = m.home_team.id.map(|id| format!("{ID_PREFIX}{id}"));
        row.away_id = m.away_team.id.map(|id| format!("{ID_PREFIX}{id}"));
        if let Some(goals) = m.score.and_then(|s| s.full_time) {
            row.home_goals = goals.home;
            row.away_goals = goals.away;
        }
        row.status = m
            .status
            .as_deref()
            .map(MatchStatus::parse)
            .unwrap_or_default();
        row.referee = m
            .referees
            .into_iter()
            .find(|r| r.kind.as_deref().is_none_or(|k| k.eq_ignore_ascii_case("REFEREE")))
            .and_then(|r| non_empty(r.name));
        row.venue = non_empty(m.venue);
        row.round = m.matchday.map(|d| d.to_string());
        out.push(row);
    }
    Ok(out)
}

fn team_name(team: &FdMatchTeam) -> Option<String> {
    non_empty(team.short_name.clone()).or_else(|| non_empty(team.name.clone()))
}

pub fn parse_standings_json(raw: &str, league_code: &str) -> Result<Vec<Standing>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let parsed: StandingsResponse =
        serde_json::from_str(trimmed).map_err(|err| malformed(SOURCE_ID, "standings", err))?;

    let Some(group) = parsed
        .standings
        .into_iter()
        .find(|g| g.kind.as_deref().is_none_or(|k| k.eq_ignore_ascii_case("TOTAL")))
    else {
        return Ok(Vec::new());
    };

    Ok(group
        .table
        .into_iter()
        .filter_map(|row| {
            let name = team_name(&row.team)?;
            let mut standing = Standing::new(SOURCE_ID, league_code, name);
            standing.position = row.position;
            standing.team_id = row.team.id.map(|id| format!("{ID_PREFIX}{id}"));
            standing.played = row.played_games;
            standing.won = row.won;
            standing.drawn = row.draw;
            standing.lost = row.lost;
            standing.points = row.points;
            standing.goals_for = row.goals_for;
            standing.goals_against = row.goals_against;
            standing.form = non_empty(row.form).map(|f| f.replace(',', ""));
            Some(standing)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tbd_fixtures_are_skipped() {
        let raw = r#"{"matches":[{"id":1,"utcDate":"2026-05-30T19:00:00Z","status":"SCHEDULED",
            "homeTeam":{"id":null,"name":null},"awayTeam":{"id":null,"name":null}}]}"#;
        assert!(parse_matches_json(raw).expect("parses").is_empty());
    }

    #[test]
    fn assistant_referees_are_ignored() {
        let raw = r#"{"matches":[{"id":7,"utcDate":"2026-03-01T20:00:00Z","status":"FINISHED",
            "homeTeam":{"id":86,"name":"Real Madrid CF","shortName":"Real Madrid"},
            "awayTeam":{"id":81,"name":"FC Barcelona","shortName":"Barça"},
            "score":{"fullTime":{"home":2,"away":1}},
            "referees":[{"name":"Line Person","type":"ASSISTANT_REFEREE_N1"},
                        {"name":"Main Ref","type":"REFEREE"}]}]}"#;
        let matches = parse_matches_json(raw).expect("parses");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].referee.as_deref(), Some("Main Ref"));
        assert_eq!(matches[0].home_goals, Some(2));
        assert_eq!(matches[0].status, MatchStatus::Finished);
    }
}

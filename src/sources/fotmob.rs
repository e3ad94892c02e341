use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    MatchQuery, PlayerQuery, SourceAdapter, StandingsQuery, TeamQuery, classify_body, fetch_body,
    malformed, non_empty, parse_date, parse_kickoff,
};
use crate::cancel::CancelToken;
use crate::config::ProviderConfig;
use crate::entity::{Match, MatchStatus, Player, Standing, Team};
use crate::error::Result;
use crate::http_client::{HttpRequest, RateLimitedClient};
use crate::leagues::League;

pub const SOURCE_ID: &str = "fotmob";
const ID_PREFIX: &str = "fm:";

/// FotMob's public JSON endpoints. No key; league pages carry the table
/// and the whole fixture list in one payload.
pub struct FotmobSource {
    base_url: String,
    client: Arc<RateLimitedClient>,
}

impl FotmobSource {
    pub fn new(config: &ProviderConfig, client: Arc<RateLimitedClient>) -> Self {
        Self {
            base_url: config.base_url.clone(),
            client,
        }
    }

    fn league_page(&self, league: League, cancel: &CancelToken) -> Result<Option<String>> {
        let req = HttpRequest::get(format!("{}/leagues", self.base_url))
            .query("id", league.fotmob_id())
            .query("tab", "overview")
            .query("type", "league");
        fetch_body(&self.client, SOURCE_ID, &req, cancel)
    }

    fn matches_by_day(&self, query: &MatchQuery, cancel: &CancelToken) -> Result<Vec<Match>> {
        let requests: Vec<HttpRequest> = query
            .days()
            .into_iter()
            .map(|day| {
                HttpRequest::get(format!("{}/matches", self.base_url))
                    .query("date", day.format("%Y%m%d"))
            })
            .collect();

        let mut out = Vec::new();
        let mut first_failure = None;
        let mut failed = 0usize;
        let mut succeeded = 0usize;
        for (req, resp) in requests
            .iter()
            .zip(self.client.parallel_requests(&requests, cancel))
        {
            let body = resp
                .map_err(|err| err.into_source_unavailable(SOURCE_ID))
                .and_then(|resp| classify_body(SOURCE_ID, &req.url, resp.status, resp.body));
            match body {
                Ok(Some(body)) => {
                    succeeded += 1;
                    out.extend(parse_day_json(&body)?);
                }
                Ok(None) => succeeded += 1,
                Err(err) => {
                    failed += 1;
                    first_failure.get_or_insert(err);
                }
            }
        }
        if succeeded == 0 {
            if let Some(err) = first_failure {
                return Err(err);
            }
        } else if failed > 0 {
            warn!(failed_days = failed, "fotmob day requests failed");
        }
        Ok(out)
    }
}

impl SourceAdapter for FotmobSource {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn fetch_teams(&self, query: &TeamQuery, cancel: &CancelToken) -> Result<Vec<Team>> {
        let Some(body) = self.league_page(query.league, cancel)? else {
            return Ok(Vec::new());
        };
        let mut teams = parse_league_teams_json(&body)?;
        for team in &mut teams {
            team.league = Some(query.league.code().to_string());
        }
        Ok(teams)
    }

    fn fetch_players(&self, query: &PlayerQuery, cancel: &CancelToken) -> Result<Vec<Player>> {
        let Some(team_id) = query.team.native_id(SOURCE_ID, ID_PREFIX) else {
            debug!(team = %query.team.name, "no fotmob id for team");
            return Ok(Vec::new());
        };
        let req = HttpRequest::get(format!("{}/teams", self.base_url))
            .query("id", &team_id)
            .query("tab", "squad");
        match fetch_body(&self.client, SOURCE_ID, &req, cancel)? {
            Some(body) => parse_squad_json(&body, &team_id),
            None => Ok(Vec::new()),
        }
    }

    fn fetch_matches(&self, query: &MatchQuery, cancel: &CancelToken) -> Result<Vec<Match>> {
        let mut matches = match query.league {
            Some(league) => match self.league_page(league, cancel)? {
                Some(body) => {
                    let mut rows = parse_league_matches_json(&body)?;
                    for row in &mut rows {
                        row.league = Some(league.code().to_string());
                    }
                    rows
                }
                None => Vec::new(),
            },
            None => self.matches_by_day(query, cancel)?,
        };
        matches.retain(|m| query.contains(&m.kickoff));
        Ok(matches)
    }

    fn fetch_standings(
        &self,
        query: &StandingsQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<Standing>> {
        let Some(body) = self.league_page(query.league, cancel)? else {
            return Ok(Vec::new());
        };
        let mut rows = parse_league_table_json(&body, query.league.code())?;
        for row in &mut rows {
            row.season = Some(query.season);
        }
        Ok(rows)
    }
}

/// FotMob ids show up as both numbers and strings.
fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn prefixed(value: &Value) -> Option<String> {
    id_text(value).map(|id| format!("{ID_PREFIX}{id}"))
}

#[derive(Debug, Deserialize)]
struct FmLeaguePage {
    #[serde(default)]
    table: Vec<FmTableWrap>,
    fixtures: Option<FmFixtures>,
}

#[derive(Debug, Deserialize)]
struct FmTableWrap {
    data: Option<FmTableData>,
}

#[derive(Debug, Deserialize)]
struct FmTableData {
    table: Option<FmTable>,
    /// Group-stage competitions.
    tables: Option<Vec<FmGroup>>,
}

#[derive(Debug, Deserialize)]
struct FmGroup {
    table: FmTable,
}

#[derive(Debug, Deserialize)]
struct FmTable {
    #[serde(default)]
    all: Vec<FmTableRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FmTableRow {
    name: Option<String>,
    short_name: Option<String>,
    #[serde(default)]
    id: Value,
    idx: Option<u16>,
    played: Option<u16>,
    wins: Option<u16>,
    draws: Option<u16>,
    losses: Option<u16>,
    scores_str: Option<String>,
    pts: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FmFixtures {
    #[serde(default)]
    all_matches: Vec<FmMatch>,
}

#[derive(Debug, Deserialize)]
struct FmMatch {
    #[serde(default)]
    id: Value,
    home: FmSide,
    away: FmSide,
    status: Option<FmStatus>,
    #[serde(default)]
    round: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FmSide {
    name: Option<String>,
    #[serde(default)]
    id: Value,
    score: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FmStatus {
    utc_time: Option<String>,
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    started: bool,
    #[serde(default)]
    cancelled: bool,
    score_str: Option<String>,
    reason: Option<FmReason>,
}

#[derive(Debug, Deserialize)]
struct FmReason {
    short: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FmDay {
    #[serde(default)]
    leagues: Vec<FmDayLeague>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FmDayLeague {
    primary_id: Option<u32>,
    id: Option<u32>,
    #[serde(default)]
    matches: Vec<FmMatch>,
}

#[derive(Debug, Deserialize)]
struct FmTeamPage {
    squad: Option<FmSquad>,
    details: Option<FmTeamDetails>,
}

#[derive(Debug, Deserialize)]
struct FmTeamDetails {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FmSquad {
    #[serde(default)]
    squad: Vec<FmSquadGroup>,
}

#[derive(Debug, Deserialize)]
struct FmSquadGroup {
    title: Option<String>,
    #[serde(default)]
    members: Vec<FmMember>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FmMember {
    #[serde(default)]
    id: Value,
    name: String,
    shirt_number: Option<u8>,
    cname: Option<String>,
    role: Option<FmRole>,
    date_of_birth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FmRole {
    key: Option<String>,
    fallback: Option<String>,
}

fn parse_page<T: for<'de> Deserialize<'de>>(raw: &str, what: &str) -> Result<Option<T>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|err| malformed(SOURCE_ID, what, err))
}

fn table_rows(page: FmLeaguePage) -> Vec<FmTableRow> {
    let mut rows = Vec::new();
    for wrap in page.table {
        let Some(data) = wrap.data else { continue };
        if let Some(table) = data.table {
            rows.extend(table.all);
        }
        for group in data.tables.unwrap_or_default() {
            rows.extend(group.table.all);
        }
    }
    rows
}

pub fn parse_league_teams_json(raw: &str) -> Result<Vec<Team>> {
    let Some(page) = parse_page::<FmLeaguePage>(raw, "league")? else {
        return Ok(Vec::new());
    };
    Ok(table_rows(page)
        .into_iter()
        .filter_map(|row| {
            let name = non_empty(row.name)?;
            let id = prefixed(&row.id)?;
            let mut team = Team::new(SOURCE_ID, id, name);
            team.short_name = non_empty(row.short_name);
            Some(team)
        })
        .collect())
}

pub fn parse_league_table_json(raw: &str, league_code: &str) -> Result<Vec<Standing>> {
    let Some(page) = parse_page::<FmLeaguePage>(raw, "league")? else {
        return Ok(Vec::new());
    };
    Ok(table_rows(page)
        .into_iter()
        .filter_map(|row| {
            let name = non_empty(row.name)?;
            let mut standing = Standing::new(SOURCE_ID, league_code, name);
            standing.team_id = prefixed(&row.id);
            standing.position = row.idx;
            standing.played = row.played;
            standing.won = row.wins;
            standing.drawn = row.draws;
            standing.lost = row.losses;
            standing.points = row.pts;
            if let Some((scored, against)) = row.scores_str.as_deref().and_then(split_score::<u16>)
            {
                standing.goals_for = Some(scored);
                standing.goals_against = Some(against);
            }
            Some(standing)
        })
        .collect())
}

pub fn parse_league_matches_json(raw: &str) -> Result<Vec<Match>> {
    let Some(page) = parse_page::<FmLeaguePage>(raw, "league")? else {
        return Ok(Vec::new());
    };
    Ok(page
        .fixtures
        .map(|f| f.all_matches)
        .unwrap_or_default()
        .into_iter()
        .filter_map(to_match)
        .collect())
}

/// The per-day feed spans every competition; only known leagues are kept.
pub fn parse_day_json(raw: &str) -> Result<Vec<Match>> {
    let Some(day) = parse_page::<FmDay>(raw, "matches")? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for group in day.leagues {
        let Some(league) = group
            .primary_id
            .or(group.id)
            .and_then(League::from_fotmob_id)
        else {
            continue;
        };
        for mut row in group.matches.into_iter().filter_map(to_match) {
            row.league = Some(league.code().to_string());
            out.push(row);
        }
    }
    Ok(out)
}

fn to_match(m: FmMatch) -> Option<Match> {
    let status = m.status?;
    let kickoff = status.utc_time.as_deref().and_then(parse_kickoff)?;
    let home = non_empty(m.home.name)?;
    let away = non_empty(m.away.name)?;
    let id = id_text(&m.id)?;
    let mut row = Match::new(SOURCE_ID, format!("{ID_PREFIX}m{id}"), kickoff, home, away);
    row.home_id = prefixed(&m.home.id);
    row.away_id = prefixed(&m.away.id);
    row.status = if status.cancelled {
        match status.reason.and_then(|r| r.short) {
            Some(short) => match MatchStatus::parse(&short) {
                MatchStatus::Unknown => MatchStatus::Cancelled,
                parsed => parsed,
            },
            None => MatchStatus::Cancelled,
        }
    } else if status.finished {
        MatchStatus::Finished
    } else if status.started {
        MatchStatus::Live
    } else {
        MatchStatus::Scheduled
    };
    if status.started || status.finished {
        match status.score_str.as_deref().and_then(split_score::<u8>) {
            Some((h, a)) => {
                row.home_goals = Some(h);
                row.away_goals = Some(a);
            }
            None => {
                row.home_goals = m.home.score;
                row.away_goals = m.away.score;
            }
        }
    }
    row.round = id_text(&m.round);
    Some(row)
}

/// "2 - 1" / "45-20".
fn split_score<T: std::str::FromStr>(raw: &str) -> Option<(T, T)> {
    let (a, b) = raw.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

pub fn parse_squad_json(raw: &str, team_id: &str) -> Result<Vec<Player>> {
    let Some(page) = parse_page::<FmTeamPage>(raw, "squad")? else {
        return Ok(Vec::new());
    };
    let team_name = page.details.and_then(|d| non_empty(d.name));
    let mut out = Vec::new();
    for group in page.squad.map(|s| s.squad).unwrap_or_default() {
        // Coaching staff is listed alongside players.
        if group.title.as_deref() == Some("coach") {
            continue;
        }
        for member in group.members {
            let Some(id) = id_text(&member.id) else {
                continue;
            };
            if member
                .role
                .as_ref()
                .and_then(|r| r.key.as_deref())
                .is_some_and(|key| key.eq_ignore_ascii_case("coach"))
            {
                continue;
            }
            let mut player = Player::new(SOURCE_ID, format!("{ID_PREFIX}p{id}"), member.name);
            player.team_id = Some(format!("{ID_PREFIX}{team_id}"));
            player.team_name = team_name.clone();
            player.shirt_number = member.shirt_number;
            player.nationality = non_empty(member.cname);
            player.position = member.role.and_then(|r| non_empty(r.fallback));
            player.birth_date = member.date_of_birth.as_deref().and_then(parse_date);
            out.push(player);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_may_be_numbers_or_strings() {
        assert_eq!(id_text(&serde_json::json!(8633)), Some("8633".to_string()));
        assert_eq!(id_text(&serde_json::json!("4506263")), Some("4506263".to_string()));
        assert_eq!(id_text(&serde_json::json!(null)), None);
    }

    #[test]
    fn score_strings() {
        assert_eq!(split_score::<u8>("2 - 1"), Some((2, 1)));
        assert_eq!(split_score::<u16>("45-20"), Some((45, 20)));
        assert_eq!(split_score::<u8>("vs"), None);
    }

    #[test]
    fn day_feed_skips_unknown_competitions() {
        let raw = r#"{"leagues":[
            {"primaryId":9999,"matches":[{"id":1,"home":{"name":"A","id":1},"away":{"name":"B","id":2},
             "status":{"utcTime":"2026-03-01T20:00:00Z"}}]},
            {"primaryId":87,"matches":[{"id":"2","home":{"name":"Real Madrid","id":8633},"away":{"name":"Getafe","id":8305},
             "status":{"utcTime":"2026-03-01T20:00:00Z","started":false}}]}
        ]}"#;
        let rows = parse_day_json(raw).expect("parses");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].league.as_deref(), Some("PD"));
        assert_eq!(rows[0].id, "fm:m2");
        assert_eq!(rows[0].status, MatchStatus::Scheduled);
    }
}

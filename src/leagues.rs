use serde::{Deserialize, Serialize};

/// Competitions every provider knows about, keyed by the football-data.org code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum League {
    PremierLeague,
    LaLiga,
    Bundesliga,
    SerieA,
    Ligue1,
    ChampionsLeague,
}

pub const ALL_LEAGUES: &[League] = &[
    League::PremierLeague,
    League::LaLiga,
    League::Bundesliga,
    League::SerieA,
    League::Ligue1,
    League::ChampionsLeague,
];

impl League {
    pub fn code(self) -> &'static str {
        match self {
            League::PremierLeague => "PL",
            League::LaLiga => "PD",
            League::Bundesliga => "BL1",
            League::SerieA => "SA",
            League::Ligue1 => "FL1",
            League::ChampionsLeague => "CL",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            League::PremierLeague => "Premier League",
            League::LaLiga => "La Liga",
            League::Bundesliga => "Bundesliga",
            League::SerieA => "Serie A",
            League::Ligue1 => "Ligue 1",
            League::ChampionsLeague => "Champions League",
        }
    }

    pub fn api_football_id(self) -> u32 {
        match self {
            League::PremierLeague => 39,
            League::LaLiga => 140,
            League::Bundesliga => 78,
            League::SerieA => 135,
            League::Ligue1 => 61,
            League::ChampionsLeague => 2,
        }
    }

    pub fn fotmob_id(self) -> u32 {
        match self {
            League::PremierLeague => 47,
            League::LaLiga => 87,
            League::Bundesliga => 54,
            League::SerieA => 55,
            League::Ligue1 => 53,
            League::ChampionsLeague => 42,
        }
    }

    /// Accepts a code (`PD`), a label (`La Liga`) or a provider id.
    pub fn from_code(raw: &str) -> Option<League> {
        let t = raw.trim();
        if t.is_empty() {
            return None;
        }
        let lower = t.to_ascii_lowercase().replace(['-', '_'], " ");
        ALL_LEAGUES.iter().copied().find(|league| {
            league.code().eq_ignore_ascii_case(t)
                || league.label().to_ascii_lowercase() == lower
                || t.parse::<u32>()
                    .is_ok_and(|id| id == league.api_football_id() || id == league.fotmob_id())
        })
    }

    pub fn from_fotmob_id(id: u32) -> Option<League> {
        ALL_LEAGUES.iter().copied().find(|l| l.fotmob_id() == id)
    }

    pub fn from_api_football_id(id: u32) -> Option<League> {
        ALL_LEAGUES.iter().copied().find(|l| l.api_football_id() == id)
    }
}

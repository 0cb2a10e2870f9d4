//! Round table and scoring rules.
//!
//! Twelve regular rounds and four bonus rounds. Primary teams alternate,
//! starting with Team A. A wrong primary answer opens a passover for the other
//! team, worth two points.

use serde::{Deserialize, Serialize};

use crate::protocol::{Cells, Passover, Primary, RoundId};

/// Rounds shown per scoreboard page.
pub const PAGE_SIZE: usize = 4;

/// Number of scoreboard pages.
pub const TOTAL_PAGES: u32 = 4;

/// One of the two competing teams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    A,
    B,
}

impl Team {
    /// The opposing team.
    pub fn other(&self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Static description of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    pub id: RoundId,
    pub label: &'static str,
    pub primary: Team,
    pub bonus: bool,
}

/// Every round in scoresheet order.
pub const ROUNDS: [Round; 16] = [
    round(RoundId::R1, "Round 1", Team::A, false),
    round(RoundId::R2, "Round 2", Team::B, false),
    round(RoundId::R3, "Round 3", Team::A, false),
    round(RoundId::R4, "Round 4", Team::B, false),
    round(RoundId::R5, "Round 5", Team::A, false),
    round(RoundId::R6, "Round 6", Team::B, false),
    round(RoundId::R7, "Round 7", Team::A, false),
    round(RoundId::R8, "Round 8", Team::B, false),
    round(RoundId::R9, "Round 9", Team::A, false),
    round(RoundId::R10, "Round 10", Team::B, false),
    round(RoundId::R11, "Round 11", Team::A, false),
    round(RoundId::R12, "Round 12", Team::B, false),
    round(RoundId::B1, "Bonus 1", Team::A, true),
    round(RoundId::B2, "Bonus 2", Team::B, true),
    round(RoundId::B3, "Bonus 3", Team::A, true),
    round(RoundId::B4, "Bonus 4", Team::B, true),
];

const fn round(id: RoundId, label: &'static str, primary: Team, bonus: bool) -> Round {
    Round {
        id,
        label,
        primary,
        bonus,
    }
}

impl RoundId {
    /// The team that answers this round first.
    pub fn primary_team(&self) -> Team {
        ROUNDS
            .iter()
            .find(|round| round.id == *self)
            .map_or(Team::A, |round| round.primary)
    }
}

/// Running totals for both teams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub team_a: u32,
    pub team_b: u32,
}

impl Totals {
    fn credit(&mut self, team: Team, points: u32) {
        match team {
            Team::A => self.team_a += points,
            Team::B => self.team_b += points,
        }
    }
}

/// Compute both teams' scores. Missing rounds count as unanswered.
pub fn totals(cells: &Cells) -> Totals {
    let mut totals = Totals::default();
    for round in &ROUNDS {
        let Some(cell) = cells.get(&round.id) else {
            continue;
        };
        totals.credit(round.primary, cell.primary.points());
        if cell.primary == Primary::Wrong {
            totals.credit(round.primary.other(), cell.passover.points());
        }
    }
    totals
}

/// Returns `true` once the round needs no further answers.
pub fn is_complete(cells: &Cells, round: RoundId) -> bool {
    let cell = cells.get(&round).copied().unwrap_or_default();
    match cell.primary {
        Primary::AwardedThree | Primary::AwardedTwo => true,
        Primary::Wrong => cell.passover != Passover::Unanswered,
        Primary::Unanswered => false,
    }
}

/// The first round still waiting for an answer, if any.
pub fn active_round(cells: &Cells) -> Option<RoundId> {
    RoundId::ALL
        .iter()
        .copied()
        .find(|round| !is_complete(cells, *round))
}

/// The scoreboard page that shows `round`.
pub fn page_for(round: RoundId) -> u32 {
    u32::try_from(round.index() / PAGE_SIZE).unwrap_or(TOTAL_PAGES - 1)
}

/// A finished game as stored in score history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub team_a: String,
    pub team_b: String,
    pub score_a: u32,
    pub score_b: u32,
    #[serde(default)]
    pub cells: Option<Cells>,
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{blank_cells, Cell};

    fn set(cells: &mut Cells, round: RoundId, primary: Primary, passover: Passover) {
        cells.insert(round, Cell { primary, passover });
    }

    #[test]
    fn primary_teams_alternate() {
        assert_eq!(RoundId::R1.primary_team(), Team::A);
        assert_eq!(RoundId::R2.primary_team(), Team::B);
        assert_eq!(RoundId::B1.primary_team(), Team::A);
        assert_eq!(RoundId::B4.primary_team(), Team::B);
    }

    #[test]
    fn blank_board_scores_zero() {
        assert_eq!(totals(&blank_cells()), Totals::default());
    }

    #[test]
    fn primary_points_go_to_primary_team() {
        let mut cells = blank_cells();
        set(&mut cells, RoundId::R1, Primary::AwardedThree, Passover::Unanswered);
        set(&mut cells, RoundId::R2, Primary::AwardedTwo, Passover::Unanswered);
        let t = totals(&cells);
        assert_eq!(t.team_a, 3);
        assert_eq!(t.team_b, 2);
    }

    #[test]
    fn passover_points_go_to_other_team() {
        let mut cells = blank_cells();
        set(&mut cells, RoundId::R2, Primary::Wrong, Passover::AwardedTwo);
        let t = totals(&cells);
        assert_eq!(t.team_a, 2);
        assert_eq!(t.team_b, 0);
    }

    #[test]
    fn stray_passover_without_wrong_primary_scores_nothing() {
        let mut cells = blank_cells();
        set(&mut cells, RoundId::R1, Primary::Unanswered, Passover::AwardedTwo);
        assert_eq!(totals(&cells), Totals::default());
    }

    #[test]
    fn active_round_skips_completed_rounds() {
        let mut cells = blank_cells();
        assert_eq!(active_round(&cells), Some(RoundId::R1));

        set(&mut cells, RoundId::R1, Primary::AwardedTwo, Passover::Unanswered);
        set(&mut cells, RoundId::R2, Primary::Wrong, Passover::Unanswered);
        assert_eq!(active_round(&cells), Some(RoundId::R2));

        set(&mut cells, RoundId::R2, Primary::Wrong, Passover::Wrong);
        assert_eq!(active_round(&cells), Some(RoundId::R3));
    }

    #[test]
    fn completed_board_has_no_active_round() {
        let mut cells = blank_cells();
        for round in RoundId::ALL {
            set(&mut cells, round, Primary::AwardedThree, Passover::Unanswered);
        }
        assert_eq!(active_round(&cells), None);
    }

    #[test]
    fn pages_hold_four_rounds() {
        assert_eq!(page_for(RoundId::R1), 0);
        assert_eq!(page_for(RoundId::R4), 0);
        assert_eq!(page_for(RoundId::R5), 1);
        assert_eq!(page_for(RoundId::B1), 3);
        assert_eq!(page_for(RoundId::B4), TOTAL_PAGES - 1);
    }
}

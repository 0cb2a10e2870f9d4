//! Last-write-wins mirror of team names, scoring cells and the page cursor.
//!
//! Every local mutation updates the mirror immediately and returns the partial
//! write that carries it; every inbound snapshot overwrites the mirrored fields
//! it contains. Two scorers editing at the same time are not reconciled: the
//! later write simply replaces the earlier one. Sessions are expected to have a
//! single active scorer.

use tracing::debug;

use crate::protocol::{
    blank_cells, normalize_cells, Cell, Cells, Passover, Primary, RoundId, SessionDocument,
    SessionPatch,
};
use crate::scores::{self, page_for, GameRecord, Team, Totals, TOTAL_PAGES};

/// Default display name of Team A.
pub const DEFAULT_TEAM_A: &str = "Team A";
/// Default display name of Team B.
pub const DEFAULT_TEAM_B: &str = "Team B";

/// Local shadow of the shared scoreboard fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scoreboard {
    cells: Cells,
    team_a: String,
    team_b: String,
    page: u32,
}

impl Default for Scoreboard {
    fn default() -> Self {
        Self::new(DEFAULT_TEAM_A, DEFAULT_TEAM_B)
    }
}

impl Scoreboard {
    pub fn new(team_a: impl Into<String>, team_b: impl Into<String>) -> Self {
        Self {
            cells: blank_cells(),
            team_a: team_a.into(),
            team_b: team_b.into(),
            page: 0,
        }
    }

    pub fn cells(&self) -> &Cells {
        &self.cells
    }

    pub fn cell(&self, round: RoundId) -> Cell {
        self.cells.get(&round).copied().unwrap_or_default()
    }

    pub fn team_name(&self, team: Team) -> &str {
        match team {
            Team::A => &self.team_a,
            Team::B => &self.team_b,
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn totals(&self) -> Totals {
        scores::totals(&self.cells)
    }

    pub fn active_round(&self) -> Option<RoundId> {
        scores::active_round(&self.cells)
    }

    /// Record the primary team's answer. Anything but [`Primary::Wrong`]
    /// clears the round's passover in the same write.
    pub fn set_primary(&mut self, round: RoundId, primary: Primary) -> SessionPatch {
        let cell = self.cells.entry(round).or_default();
        *cell = Cell {
            primary,
            passover: cell.passover,
        }
        .normalized();
        self.cells_patch()
    }

    /// Record the passover team's answer.
    ///
    /// Returns `None` without writing unless the primary answer was wrong.
    pub fn set_passover(&mut self, round: RoundId, passover: Passover) -> Option<SessionPatch> {
        let cell = self.cells.entry(round).or_default();
        if cell.primary != Primary::Wrong {
            debug!(round = %round, "passover ignored: primary answer was not wrong");
            return None;
        }
        cell.passover = passover;
        Some(self.cells_patch())
    }

    pub fn set_team_name(&mut self, team: Team, name: impl Into<String>) -> SessionPatch {
        let name = name.into();
        match team {
            Team::A => {
                self.team_a.clone_from(&name);
                SessionPatch {
                    team_a: Some(name),
                    ..Default::default()
                }
            }
            Team::B => {
                self.team_b.clone_from(&name);
                SessionPatch {
                    team_b: Some(name),
                    ..Default::default()
                }
            }
        }
    }

    /// Move the page cursor, clamped to the last page.
    ///
    /// Returns `None` if the page does not change.
    pub fn set_page(&mut self, page: u32) -> Option<SessionPatch> {
        let page = page.min(TOTAL_PAGES - 1);
        if page == self.page {
            return None;
        }
        self.page = page;
        Some(SessionPatch {
            page: Some(page),
            ..Default::default()
        })
    }

    /// Move the page cursor to the page of the active round.
    pub fn follow_active_round(&mut self) -> Option<SessionPatch> {
        let round = self.active_round()?;
        self.set_page(page_for(round))
    }

    /// Blank every round and return to the first page.
    pub fn reset_cells(&mut self) -> SessionPatch {
        self.replace_cells(blank_cells())
    }

    /// Replace the cells wholesale (e.g. from score history).
    pub fn restore_cells(&mut self, cells: &Cells) -> SessionPatch {
        self.replace_cells(normalize_cells(cells))
    }

    /// Restore a saved game: cells and both team names.
    pub fn restore_record(&mut self, record: &GameRecord) -> SessionPatch {
        let cells = record
            .cells
            .as_ref()
            .map_or_else(blank_cells, normalize_cells);
        let mut patch = self.replace_cells(cells);
        self.team_a.clone_from(&record.team_a);
        self.team_b.clone_from(&record.team_b);
        patch.team_a = Some(record.team_a.clone());
        patch.team_b = Some(record.team_b.clone());
        patch
    }

    /// Snapshot the board as a history entry.
    pub fn to_record(&self) -> GameRecord {
        let totals = self.totals();
        GameRecord {
            team_a: self.team_a.clone(),
            team_b: self.team_b.clone(),
            score_a: totals.team_a,
            score_b: totals.team_b,
            cells: Some(self.cells.clone()),
        }
    }

    /// Overwrite the mirrored fields present in an inbound document.
    pub fn apply_remote(&mut self, document: &SessionDocument) {
        if let Some(cells) = &document.cells {
            self.cells = normalize_cells(cells);
        }
        if let Some(name) = &document.team_a {
            self.team_a.clone_from(name);
        }
        if let Some(name) = &document.team_b {
            self.team_b.clone_from(name);
        }
        if let Some(page) = document.page {
            self.page = page.min(TOTAL_PAGES - 1);
        }
    }

    fn replace_cells(&mut self, cells: Cells) -> SessionPatch {
        self.cells = cells;
        self.page = 0;
        SessionPatch {
            cells: Some(self.cells.clone()),
            page: Some(0),
            ..Default::default()
        }
    }

    fn cells_patch(&self) -> SessionPatch {
        SessionPatch {
            cells: Some(self.cells.clone()),
            ..Default::default()
        }
    }
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

    #[test]
    fn non_wrong_primary_clears_passover() {
        let mut board = Scoreboard::default();
        board.set_primary(RoundId::R1, Primary::Wrong);
        board.set_passover(RoundId::R1, Passover::AwardedTwo).unwrap();

        for primary in [Primary::AwardedTwo, Primary::AwardedThree, Primary::Unanswered] {
            board.set_primary(RoundId::R1, Primary::Wrong);
            board.set_passover(RoundId::R1, Passover::AwardedTwo).unwrap();
            let patch = board.set_primary(RoundId::R1, primary);
            let written = patch.cells.unwrap()[&RoundId::R1];
            assert_eq!(written.primary, primary);
            assert_eq!(written.passover, Passover::Unanswered);
        }
    }

    #[test]
    fn wrong_primary_keeps_passover() {
        let mut board = Scoreboard::default();
        board.set_primary(RoundId::R3, Primary::Wrong);
        board.set_passover(RoundId::R3, Passover::Wrong).unwrap();
        board.set_primary(RoundId::R3, Primary::Wrong);
        assert_eq!(board.cell(RoundId::R3).passover, Passover::Wrong);
    }

    #[test]
    fn passover_requires_wrong_primary() {
        let mut board = Scoreboard::default();
        assert!(board.set_passover(RoundId::R2, Passover::AwardedTwo).is_none());
        assert_eq!(board.cell(RoundId::R2), Cell::default());
    }

    #[test]
    fn passover_points_credit_other_team() {
        let mut board = Scoreboard::default();
        board.set_primary(RoundId::R1, Primary::Wrong);
        board.set_passover(RoundId::R1, Passover::AwardedTwo).unwrap();
        let totals = board.totals();
        assert_eq!(totals.team_a, 0);
        assert_eq!(totals.team_b, 2);
    }

    #[test]
    fn team_name_writes_only_that_team() {
        let mut board = Scoreboard::default();
        let patch = board.set_team_name(Team::B, "Bookworms");
        assert_eq!(patch.team_b.as_deref(), Some("Bookworms"));
        assert!(patch.team_a.is_none());
        assert_eq!(board.team_name(Team::B), "Bookworms");
    }

    #[test]
    fn page_is_clamped_and_written_on_change_only() {
        let mut board = Scoreboard::default();
        assert!(board.set_page(0).is_none());
        assert_eq!(board.set_page(9).unwrap().page, Some(TOTAL_PAGES - 1));
        assert!(board.set_page(7).is_none());
    }

    #[test]
    fn follow_active_round_turns_the_page() {
        let mut board = Scoreboard::default();
        for round in [RoundId::R1, RoundId::R2, RoundId::R3, RoundId::R4] {
            board.set_primary(round, Primary::AwardedThree);
        }
        assert_eq!(board.follow_active_round().unwrap().page, Some(1));
        assert!(board.follow_active_round().is_none());
    }

    #[test]
    fn reset_blanks_board_and_page() {
        let mut board = Scoreboard::default();
        board.set_primary(RoundId::R5, Primary::AwardedTwo);
        board.set_page(2);
        let patch = board.reset_cells();
        assert_eq!(patch.page, Some(0));
        assert_eq!(board.totals(), Totals::default());
        assert_eq!(board.page(), 0);
    }

    #[test]
    fn record_round_trips_through_restore() {
        let mut board = Scoreboard::new("Owls", "Foxes");
        board.set_primary(RoundId::R1, Primary::AwardedThree);
        board.set_primary(RoundId::R2, Primary::Wrong);
        board.set_passover(RoundId::R2, Passover::AwardedTwo).unwrap();
        let record = board.to_record();
        assert_eq!((record.score_a, record.score_b), (5, 0));

        let mut other = Scoreboard::default();
        let patch = other.restore_record(&record);
        assert_eq!(patch.team_a.as_deref(), Some("Owls"));
        assert_eq!(other, board);
    }

    #[test]
    fn restore_cells_normalizes_input() {
        let mut cells = Cells::new();
        cells.insert(
            RoundId::R4,
            Cell {
                primary: Primary::AwardedTwo,
                passover: Passover::AwardedTwo,
            },
        );
        let mut board = Scoreboard::default();
        board.restore_cells(&cells);
        assert_eq!(board.cells().len(), 16);
        assert_eq!(board.cell(RoundId::R4).passover, Passover::Unanswered);
    }

    #[test]
    fn remote_snapshot_overwrites_present_fields_only() {
        let mut board = Scoreboard::new("Owls", "Foxes");
        board.set_primary(RoundId::R1, Primary::AwardedTwo);
        let doc = SessionDocument {
            team_b: Some("Hedgehogs".into()),
            page: Some(42),
            ..Default::default()
        };
        board.apply_remote(&doc);
        assert_eq!(board.team_name(Team::A), "Owls");
        assert_eq!(board.team_name(Team::B), "Hedgehogs");
        assert_eq!(board.page(), TOTAL_PAGES - 1);
        assert_eq!(board.cell(RoundId::R1).primary, Primary::AwardedTwo);

        let before = board.clone();
        board.apply_remote(&doc);
        assert_eq!(board, before);
    }
}

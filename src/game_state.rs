//! Legal-move authority and occupancy reconciler.
//! Wraps a `shakmaty::Chess` position as the single source of truth and maps
//! vision occupancy snapshots onto legal moves. Resolution follows a strict
//! sequential priority: normal move, castling, en passant, capture; anything
//! else is reported as an error and leaves the position untouched. Every
//! check runs against a freshly generated legal-move list, never a cached one.

use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Move, MoveList, Position, Role, Square};
use std::collections::HashSet;
use thiserror::Error;

/// How a resolved move was inferred from the occupancy diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveKind {
    Normal,
    Capture,
    Castle,
    EnPassant,
}

/// A move resolved from vision, validated against the current position.
#[derive(Clone, Debug)]
pub struct ResolvedMove {
    pub mv: Move,
    pub uci: String,
    pub kind: MoveKind,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// A 1-vanished/1-appeared diff matches no legal move, even with the
    /// automatic queen-promotion retry.
    #[error("no legal move from {from} to {to}")]
    IllegalMove { from: Square, to: Square },
    /// More than one legal capture from the vanished square lands on a
    /// visually occupied destination. Reported, never guessed.
    #[error("{count} capture candidates from {from}")]
    AmbiguousCapture { from: Square, count: usize },
    /// The diff cardinality matches none of the resolution patterns.
    #[error("occupancy diff ({vanished} vanished, {appeared} appeared) matches no move pattern")]
    NoValidChange { vanished: usize, appeared: usize },
    /// The resolved move stopped being legal before it could be applied.
    #[error("move {0} is no longer legal")]
    StaleMove(String),
}

fn kind_of(m: &Move) -> MoveKind {
    if m.castling_side().is_some() {
        MoveKind::Castle
    } else if m.is_en_passant() {
        MoveKind::EnPassant
    } else if m.is_capture() {
        MoveKind::Capture
    } else {
        MoveKind::Normal
    }
}

fn resolved(m: &Move) -> ResolvedMove {
    ResolvedMove {
        mv: m.clone(),
        uci: UciMove::from_standard(*m).to_string(),
        kind: kind_of(m),
    }
}

/// Canonical board position. Single writer; speculative moves never touch it.
#[derive(Clone, Debug, Default)]
pub struct GameState {
    pos: Chess,
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn(&self) -> Color {
        self.pos.turn()
    }

    pub fn fen(&self) -> String {
        Fen::from_position(&self.pos, EnPassantMode::Legal).to_string()
    }

    pub fn set_fen(&mut self, fen: &str) -> anyhow::Result<()> {
        let parsed = Fen::from_ascii(fen.as_bytes())?;
        self.pos = parsed.into_position(CastlingMode::Standard)?;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.pos = Chess::default();
    }

    /// Recomputed from the canonical position on every call.
    pub fn legal_moves(&self) -> MoveList {
        self.pos.legal_moves()
    }

    /// The squares the authority expects to be occupied.
    pub fn occupancy(&self) -> HashSet<Square> {
        self.pos.board().occupied().into_iter().collect()
    }

    /// Destination squares of every legal move, for the sensor focus set.
    /// Castling contributes both the king's and the rook's landing squares.
    pub fn legal_destinations(&self) -> HashSet<Square> {
        let turn = self.turn();
        let mut dests = HashSet::new();
        for m in self.legal_moves().iter() {
            match m.castling_side() {
                Some(side) => {
                    dests.insert(side.king_to(turn));
                    dests.insert(side.rook_to(turn));
                }
                None => {
                    dests.insert(m.to());
                }
            }
        }
        dests
    }

    pub fn piece_at(&self, sq: Square) -> Option<shakmaty::Piece> {
        self.pos.board().piece_at(sq)
    }

    /// Replays a UCI move from the remote feed onto the canonical position.
    pub fn play_uci(&mut self, uci: &str) -> anyhow::Result<()> {
        let parsed: UciMove = uci.parse()?;
        let m = parsed.to_move(&self.pos)?;
        self.pos.play_unchecked(m);
        Ok(())
    }

    /// Resolves a vision occupancy snapshot to at most one legal move.
    /// Pure: the position is not mutated; call [`apply`](Self::apply) (or
    /// [`process_occupancy_change`](Self::process_occupancy_change)) to commit.
    pub fn resolve(&self, observed: &HashSet<Square>) -> Result<ResolvedMove, ResolveError> {
        let expected = self.occupancy();
        let vanished: Vec<Square> = expected.difference(observed).copied().collect();
        let appeared: Vec<Square> = observed.difference(&expected).copied().collect();
        let legals = self.legal_moves();

        match (vanished.len(), appeared.len()) {
            (1, 1) => self.resolve_normal(vanished[0], appeared[0], &legals),
            (2, 2) => self.resolve_castle(&vanished, &appeared, &legals),
            (2, 1) => self.resolve_en_passant(&vanished, appeared[0], &legals),
            (1, 0) => self.resolve_capture(vanished[0], observed, &legals),
            (v, a) => Err(ResolveError::NoValidChange {
                vanished: v,
                appeared: a,
            }),
        }
    }

    /// One square emptied, one filled: a plain move. If the direct move is
    /// illegal, retry as a queen promotion (vision cannot see which piece the
    /// player chose; queen is assumed).
    fn resolve_normal(
        &self,
        from: Square,
        to: Square,
        legals: &MoveList,
    ) -> Result<ResolvedMove, ResolveError> {
        let direct = legals
            .iter()
            .find(|m| m.from() == Some(from) && m.to() == to && m.promotion().is_none());
        if let Some(m) = direct {
            return Ok(resolved(m));
        }

        let promo = legals.iter().find(|m| {
            m.from() == Some(from) && m.to() == to && m.promotion() == Some(Role::Queen)
        });
        match promo {
            Some(m) => Ok(resolved(m)),
            None => Err(ResolveError::IllegalMove { from, to }),
        }
    }

    /// Two squares emptied and two filled: castling. The king's vanished
    /// square must correspond to an appeared square two files away on the same
    /// rank; the rook movement is implied by the legality check.
    fn resolve_castle(
        &self,
        vanished: &[Square],
        appeared: &[Square],
        legals: &MoveList,
    ) -> Result<ResolvedMove, ResolveError> {
        let turn = self.turn();
        for &v in vanished {
            let is_king = self
                .piece_at(v)
                .is_some_and(|p| p.role == Role::King && p.color == turn);
            if !is_king {
                continue;
            }
            for &a in appeared {
                let two_files = u32::from(a.file()).abs_diff(u32::from(v.file())) == 2;
                if !two_files || a.rank() != v.rank() {
                    continue;
                }
                let castle = legals.iter().find(|m| {
                    m.castling_side()
                        .is_some_and(|side| m.from() == Some(v) && side.king_to(turn) == a)
                });
                if let Some(m) = castle {
                    return Ok(resolved(m));
                }
            }
        }
        Err(ResolveError::NoValidChange {
            vanished: 2,
            appeared: 2,
        })
    }

    /// Two squares emptied, one filled: en passant. The attacker and the
    /// captured pawn both vanish; only the attacker reappears.
    fn resolve_en_passant(
        &self,
        vanished: &[Square],
        to: Square,
        legals: &MoveList,
    ) -> Result<ResolvedMove, ResolveError> {
        let turn = self.turn();
        for &v in vanished {
            let is_pawn = self
                .piece_at(v)
                .is_some_and(|p| p.role == Role::Pawn && p.color == turn);
            if !is_pawn {
                continue;
            }
            let ep = legals
                .iter()
                .find(|m| m.from() == Some(v) && m.to() == to && m.is_en_passant());
            if let Some(m) = ep {
                return Ok(resolved(m));
            }
        }
        Err(ResolveError::NoValidChange {
            vanished: 2,
            appeared: 1,
        })
    }

    /// One square emptied, nothing new filled: a capture onto a square that
    /// vision already saw as occupied. Accepted only when exactly one legal
    /// capture from the vanished square matches; capture-promotions are
    /// narrowed to the queen per the auto-promotion policy.
    fn resolve_capture(
        &self,
        from: Square,
        observed: &HashSet<Square>,
        legals: &MoveList,
    ) -> Result<ResolvedMove, ResolveError> {
        let candidates: Vec<&Move> = legals
            .iter()
            .filter(|m| {
                m.from() == Some(from)
                    && m.is_capture()
                    && !m.is_en_passant()
                    && observed.contains(&m.to())
                    && (m.promotion().is_none() || m.promotion() == Some(Role::Queen))
            })
            .collect();

        match candidates.as_slice() {
            [m] => Ok(resolved(m)),
            [] => Err(ResolveError::NoValidChange {
                vanished: 1,
                appeared: 0,
            }),
            many => Err(ResolveError::AmbiguousCapture {
                from,
                count: many.len(),
            }),
        }
    }

    /// Commits a resolved move after a final present-tense legality check.
    pub fn apply(&mut self, rm: &ResolvedMove) -> Result<(), ResolveError> {
        if !self.legal_moves().contains(&rm.mv) {
            return Err(ResolveError::StaleMove(rm.uci.clone()));
        }
        self.pos.play_unchecked(rm.mv);
        Ok(())
    }

    /// Resolve-and-commit in one step. On any error the position is untouched.
    pub fn process_occupancy_change(
        &mut self,
        observed: &HashSet<Square>,
    ) -> Result<ResolvedMove, ResolveError> {
        let rm = self.resolve(observed)?;
        self.apply(&rm)?;
        Ok(rm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(gs: &mut GameState, moves: &str) {
        for uci in moves.split_whitespace() {
            gs.play_uci(uci).unwrap_or_else(|e| panic!("bad test move {uci}: {e}"));
        }
    }

    fn observed(gs: &GameState, remove: &[Square], add: &[Square]) -> HashSet<Square> {
        let mut occ = gs.occupancy();
        for sq in remove {
            assert!(occ.remove(sq), "{sq} was not occupied");
        }
        for sq in add {
            assert!(occ.insert(*sq), "{sq} was already occupied");
        }
        occ
    }

    #[test]
    fn test_initial_occupancy() {
        let gs = GameState::new();
        let occ = gs.occupancy();
        assert_eq!(occ.len(), 32);
        assert!(occ.contains(&Square::A1));
        assert!(occ.contains(&Square::E2));
        assert!(!occ.contains(&Square::E5));
    }

    #[test]
    fn test_normal_move_e2e4() {
        let mut gs = GameState::new();
        let obs = observed(&gs, &[Square::E2], &[Square::E4]);

        let rm = gs.process_occupancy_change(&obs).unwrap();
        assert_eq!(rm.uci, "e2e4");
        assert_eq!(rm.kind, MoveKind::Normal);
        assert_eq!(gs.turn(), Color::Black);
        // round-trip: committed position matches the triggering snapshot
        assert_eq!(gs.occupancy(), obs);
    }

    #[test]
    fn test_illegal_diff_is_rejected_and_position_untouched() {
        let mut gs = GameState::new();
        let before = gs.fen();
        let obs = observed(&gs, &[Square::E2], &[Square::E5]);

        let err = gs.process_occupancy_change(&obs).unwrap_err();
        assert_eq!(
            err,
            ResolveError::IllegalMove {
                from: Square::E2,
                to: Square::E5
            }
        );
        assert_eq!(gs.fen(), before);
    }

    #[test]
    fn test_capture_e4xd5() {
        let mut gs = GameState::new();
        play(&mut gs, "e2e4 d7d5");

        // attacker vanishes, destination stays visually occupied
        let obs = observed(&gs, &[Square::E4], &[]);
        let rm = gs.process_occupancy_change(&obs).unwrap();
        assert_eq!(rm.uci, "e4d5");
        assert_eq!(rm.kind, MoveKind::Capture);

        let d5 = gs.piece_at(Square::D5).unwrap();
        assert_eq!(d5.color, Color::White);
        assert_eq!(d5.role, Role::Pawn);
    }

    #[test]
    fn test_kingside_castle() {
        let mut gs = GameState::new();
        play(&mut gs, "e2e4 e7e5 g1f3 b8c6 f1c4 g8f6");

        let obs = observed(&gs, &[Square::E1, Square::H1], &[Square::G1, Square::F1]);
        let rm = gs.process_occupancy_change(&obs).unwrap();
        assert_eq!(rm.uci, "e1g1");
        assert_eq!(rm.kind, MoveKind::Castle);
        assert_eq!(gs.occupancy(), obs);
    }

    #[test]
    fn test_en_passant() {
        let mut gs = GameState::new();
        play(&mut gs, "e2e4 a7a6 e4e5 d7d5");

        // attacker e5 and victim d5 vanish, attacker reappears on d6
        let obs = observed(&gs, &[Square::E5, Square::D5], &[Square::D6]);
        let rm = gs.process_occupancy_change(&obs).unwrap();
        assert_eq!(rm.uci, "e5d6");
        assert_eq!(rm.kind, MoveKind::EnPassant);
        assert_eq!(gs.occupancy(), obs);
    }

    #[test]
    fn test_two_unrelated_vanishes_is_no_valid_change() {
        let mut gs = GameState::new();
        let before = gs.fen();
        let obs = observed(&gs, &[Square::A2, Square::H2], &[]);

        let err = gs.process_occupancy_change(&obs).unwrap_err();
        assert_eq!(
            err,
            ResolveError::NoValidChange {
                vanished: 2,
                appeared: 0
            }
        );
        assert_eq!(gs.fen(), before);
    }

    #[test]
    fn test_auto_queen_promotion() {
        let mut gs = GameState::new();
        gs.set_fen("8/P6k/8/8/8/8/8/K7 w - - 0 1").unwrap();

        let obs = observed(&gs, &[Square::A7], &[Square::A8]);
        let rm = gs.process_occupancy_change(&obs).unwrap();
        assert_eq!(rm.uci, "a7a8q");
        let a8 = gs.piece_at(Square::A8).unwrap();
        assert_eq!(a8.role, Role::Queen);
    }

    #[test]
    fn test_ambiguous_capture_is_reported_not_guessed() {
        let mut gs = GameState::new();
        // knight on e4 can capture pawns on both d6 and f6
        gs.set_fen("4k3/8/3p1p2/8/4N3/8/8/4K3 w - - 0 1").unwrap();
        let before = gs.fen();

        let obs = observed(&gs, &[Square::E4], &[]);
        let err = gs.process_occupancy_change(&obs).unwrap_err();
        assert_eq!(
            err,
            ResolveError::AmbiguousCapture {
                from: Square::E4,
                count: 2
            }
        );
        assert_eq!(gs.fen(), before);
    }

    #[test]
    fn test_empty_diff_is_no_valid_change() {
        let mut gs = GameState::new();
        let obs = gs.occupancy();
        let err = gs.process_occupancy_change(&obs).unwrap_err();
        assert!(matches!(err, ResolveError::NoValidChange { .. }));
    }

    #[test]
    fn test_remote_replay_and_fen_round_trip() {
        let mut gs = GameState::new();
        play(&mut gs, "e2e4 c7c5 g1f3");
        let fen = gs.fen();

        let mut restored = GameState::new();
        restored.set_fen(&fen).unwrap();
        assert_eq!(restored.occupancy(), gs.occupancy());
        assert_eq!(restored.turn(), Color::Black);
    }

    /// The occupancy diff implied by a legal move, as vision would see it.
    fn implied_observed(gs: &GameState, m: &Move) -> HashSet<Square> {
        let mut obs = gs.occupancy();
        match kind_of(m) {
            MoveKind::Castle => {
                let side = m.castling_side().unwrap();
                let turn = gs.turn();
                obs.remove(&m.from().unwrap());
                obs.remove(&m.to()); // rook's origin square
                obs.insert(side.king_to(turn));
                obs.insert(side.rook_to(turn));
            }
            MoveKind::EnPassant => {
                let from = m.from().unwrap();
                let to = m.to();
                obs.remove(&from);
                obs.remove(&Square::from_coords(to.file(), from.rank()));
                obs.insert(to);
            }
            MoveKind::Capture => {
                obs.remove(&m.from().unwrap());
            }
            MoveKind::Normal => {
                obs.remove(&m.from().unwrap());
                obs.insert(m.to());
            }
        }
        obs
    }

    #[test]
    fn test_every_legal_move_round_trips_through_resolution() {
        let mut positions = vec![GameState::new()];
        let mut after_capture_setup = GameState::new();
        play(&mut after_capture_setup, "e2e4 d7d5");
        positions.push(after_capture_setup);
        let mut castle_ready = GameState::new();
        play(&mut castle_ready, "e2e4 e7e5 g1f3 b8c6 f1c4 g8f6");
        positions.push(castle_ready);
        let mut ep_ready = GameState::new();
        play(&mut ep_ready, "e2e4 a7a6 e4e5 d7d5");
        positions.push(ep_ready);

        for gs in &positions {
            for m in gs.legal_moves().iter() {
                let obs = implied_observed(gs, m);
                let rm = gs
                    .resolve(&obs)
                    .unwrap_or_else(|e| panic!("move {m:?} failed to resolve: {e}"));
                assert_eq!(rm.mv, *m, "resolved wrong move for {m:?}");
                assert_eq!(rm.kind, kind_of(m));
            }
        }
    }
}

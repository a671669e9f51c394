//! Session orchestrator.
//! Drives one iteration per captured frame: sensor, noise state machine,
//! reconciler, authority. The canonical position lives behind a single
//! mutex shared with the relay listener, so the vision loop never diffs
//! against a position that is concurrently being rewritten by a remote move
//! (and vice versa). Relay submission happens while that lock is held; at
//! human-move cadence the serialization is acceptable by design contract.

use crate::change_detector::ChangeDetector;
use crate::config::Settings;
use crate::game_state::{GameState, ResolveError, ResolvedMove};
use crate::grid::SquareImages;
use crate::noise_handler::{NoiseHandler, NoiseState};
use crate::piece_detector::PieceDetector;
use crate::relay::{RelayClient, RelayError};
use shakmaty::Square;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

/// Board position plus relay bookkeeping, shared between the vision loop and
/// the background relay listener. All reads of expected occupancy and all
/// writes (local commit, remote replay) go through this one lock.
pub struct SharedPosition {
    pub game: GameState,
    /// Space-separated UCI moves acknowledged by the remote server.
    pub relay_moves: String,
    /// True while the remote opponent is to move.
    pub waiting_for_opponent: bool,
}

pub type PositionHandle = Arc<Mutex<SharedPosition>>;

pub fn new_position_handle() -> PositionHandle {
    Arc::new(Mutex::new(SharedPosition {
        game: GameState::new(),
        relay_moves: String::new(),
        waiting_for_opponent: false,
    }))
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// A local move was detected while the opponent is to move; withheld.
    #[error("not your turn; move withheld")]
    NotYourTurn,
    /// The relay refused the move; the local position stays at its pre-move
    /// state so vision and remote remain consistent.
    #[error("relay rejected {uci}: {source}")]
    RelayRejected {
        uci: String,
        #[source]
        source: RelayError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Nothing changing on the board.
    Idle,
    /// Occlusion in progress; move processing blocked.
    Waiting,
    /// Changes observed, waiting for stability.
    Processing,
}

/// Everything one frame produced, for UI feedback.
#[derive(Debug)]
pub struct FrameReport {
    pub status: SessionStatus,
    pub noise_state: NoiseState,
    pub changed_count: usize,
    /// The expected-occupied square currently seen empty, when exactly one.
    pub lifted: Option<Square>,
    /// Legal destinations of the lifted piece.
    pub radar: Vec<Square>,
    pub committed: Option<ResolvedMove>,
    pub error: Option<SessionError>,
}

pub struct Session {
    settings: Settings,
    change: ChangeDetector,
    pieces: PieceDetector,
    noise: NoiseHandler,
    position: PositionHandle,
    relay: Option<Arc<RelayClient>>,
    frame_count: u64,
    last_move_at: Option<Instant>,
}

impl Session {
    pub fn new(settings: Settings, position: PositionHandle) -> Self {
        Session {
            change: ChangeDetector::new(&settings),
            pieces: PieceDetector::new(&settings),
            noise: NoiseHandler::new(&settings),
            settings,
            position,
            relay: None,
            frame_count: 0,
            last_move_at: None,
        }
    }

    /// Attaches a relay sink; detected moves are sent out and committed
    /// locally only on acceptance. The same client is shared with the
    /// background event listener.
    pub fn with_relay(mut self, relay: Arc<RelayClient>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn position(&self) -> PositionHandle {
        Arc::clone(&self.position)
    }

    /// Seeds both detectors from the current frame. Until this runs, every
    /// frame is a no-op.
    pub fn calibrate(&mut self, squares: &SquareImages) {
        self.change.calibrate(squares);
        self.pieces.update_references(squares);
        self.noise.reset();
    }

    fn cooldown_elapsed(&self) -> bool {
        self.last_move_at
            .is_none_or(|t| t.elapsed().as_secs_f32() > self.settings.move_cooldown_secs)
    }

    /// Occupied squares plus every legal destination; the only squares worth
    /// scanning between full scans.
    async fn focus_set(&self) -> HashSet<Square> {
        let pos = self.position.lock().await;
        let mut focus = pos.game.occupancy();
        focus.extend(pos.game.legal_destinations());
        focus
    }

    /// Processes one captured frame through the whole pipeline.
    pub async fn process_frame(&mut self, squares: &SquareImages) -> FrameReport {
        self.frame_count += 1;

        // Focus-set optimization with a periodic unrestricted safety scan.
        let focus = if self.frame_count % self.settings.full_scan_interval == 0 {
            None
        } else {
            Some(self.focus_set().await)
        };
        self.change.set_focus(focus.clone());

        let changed = self.change.detect_changes(squares);
        let changed_set: HashSet<Square> = changed.keys().copied().collect();
        let (presence, _visual) = self.pieces.detect_all(squares, focus.as_ref());
        let observed = PieceDetector::occupied_squares(&presence);

        let noise_report = self.noise.process(&changed_set);
        let status = if self.noise.is_blocked() {
            SessionStatus::Waiting
        } else if changed_set.is_empty() {
            SessionStatus::Idle
        } else {
            SessionStatus::Processing
        };

        let mut committed = None;
        let mut error = None;
        let lifted;
        let radar;
        {
            let mut pos = self.position.lock().await;
            (lifted, radar) = radar_hint(&pos.game, &observed);

            let ready = noise_report.stable && !self.noise.is_blocked() && self.cooldown_elapsed();
            if ready {
                match self.commit_move(&mut pos, &observed).await {
                    Ok(rm) => committed = Some(rm),
                    Err(e) => error = Some(e),
                }
            }
        }

        if let Some(rm) = &committed {
            println!(">>> move confirmed: {} ({:?})", rm.uci, rm.kind);
            // the just-completed move becomes the new visual baseline
            self.change.update_all_references(squares);
            self.pieces.update_references(squares);
            self.noise.reset();
            self.last_move_at = Some(Instant::now());
        }

        FrameReport {
            status,
            noise_state: noise_report.state,
            changed_count: changed_set.len(),
            lifted,
            radar,
            committed,
            error,
        }
    }

    /// Resolves the snapshot and commits it, consulting the relay first when
    /// one is attached. Caller holds the position lock.
    async fn commit_move(
        &self,
        pos: &mut SharedPosition,
        observed: &HashSet<Square>,
    ) -> Result<ResolvedMove, SessionError> {
        let rm = pos.game.resolve(observed)?;

        if let Some(relay) = &self.relay {
            if pos.waiting_for_opponent {
                return Err(SessionError::NotYourTurn);
            }
            if let Err(e) = relay.make_move(&rm.uci).await {
                return Err(SessionError::RelayRejected {
                    uci: rm.uci.clone(),
                    source: e,
                });
            }
        }

        pos.game.apply(&rm)?;
        if self.relay.is_some() {
            if !pos.relay_moves.is_empty() {
                pos.relay_moves.push(' ');
            }
            pos.relay_moves.push_str(&rm.uci);
            pos.waiting_for_opponent = true;
        }
        Ok(rm)
    }
}

/// Lifted-piece hint: when exactly one expected-occupied square is visually
/// empty and it holds a piece of the side to move, surface it together with
/// its legal destinations.
fn radar_hint(game: &GameState, observed: &HashSet<Square>) -> (Option<Square>, Vec<Square>) {
    let expected = game.occupancy();
    let missing: Vec<Square> = expected.difference(observed).copied().collect();
    let [sq] = missing.as_slice() else {
        return (None, Vec::new());
    };

    let ours = game
        .piece_at(*sq)
        .is_some_and(|p| p.color == game.turn());
    if !ours {
        return (None, Vec::new());
    }

    let dests = game
        .legal_moves()
        .iter()
        .filter(|m| m.from() == Some(*sq))
        .map(|m| m.to())
        .collect();
    (Some(*sq), dests)
}

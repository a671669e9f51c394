//! Boardwatch: infers chess moves from overhead webcam frames of a physical
//! board. Per-square Gaussian background models flag changed squares, shape
//! cues vote on piece presence, a noise state machine filters out the hand
//! making the move, and the surviving occupancy diff is reconciled against
//! the legal moves of the tracked position. Confirmed moves can optionally
//! be relayed to an online game.

pub mod change_detector;
pub mod config;
pub mod coord;
pub mod game_state;
pub mod grid;
pub mod noise_handler;
pub mod piece_detector;
pub mod relay;
pub mod session;

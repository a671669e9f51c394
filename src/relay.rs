//! Remote relay sink (Lichess-style Board API).
//! Confirmed local moves are submitted as UCI; a background listener streams
//! NDJSON game events and replays the server's move list onto the shared
//! position, so remote (opponent) moves and local (vision) moves always go
//! through the same lock. A rejected submission is surfaced as an error and
//! the local position is never committed, keeping vision and remote in sync.
//! Requires the LICHESS_TOKEN environment variable.

use crate::session::PositionHandle;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use shakmaty::Color;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

const DEFAULT_BASE_URL: &str = "https://lichess.org";
const TOKEN_ENV: &str = "LICHESS_TOKEN";
const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay returned {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("no active game joined")]
    NoActiveGame,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// One entry from the account's ongoing-games list.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OngoingGame {
    pub game_id: String,
    #[serde(default)]
    pub opponent: Opponent,
    pub color: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Opponent {
    #[serde(default)]
    pub username: String,
}

#[derive(Deserialize)]
struct Account {
    username: String,
}

#[derive(Deserialize)]
struct NowPlaying {
    #[serde(rename = "nowPlaying", default)]
    now_playing: Vec<OngoingGame>,
}

pub struct RelayClient {
    http: Client,
    base_url: String,
    token: String,
    pub username: String,
    game_id: Option<String>,
}

impl RelayClient {
    /// Connects using the token from the environment and verifies it against
    /// the account endpoint.
    pub async fn connect() -> Result<Self> {
        Self::connect_to(DEFAULT_BASE_URL).await
    }

    pub async fn connect_to(base_url: &str) -> Result<Self> {
        let token = std::env::var(TOKEN_ENV)
            .with_context(|| format!("{TOKEN_ENV} environment variable not set"))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        let response = http
            .get(format!("{base_url}/api/account"))
            .bearer_auth(&token)
            .send()
            .await
            .context("Failed to reach relay account endpoint")?;
        if !response.status().is_success() {
            anyhow::bail!("Relay auth failed: {}", response.status());
        }
        let account: Account = response
            .json()
            .await
            .context("Failed to parse account response")?;

        println!("[relay] connected as {}", account.username);
        Ok(RelayClient {
            http,
            base_url: base_url.to_string(),
            token,
            username: account.username,
            game_id: None,
        })
    }

    pub async fn ongoing_games(&self) -> Result<Vec<OngoingGame>> {
        let response = self
            .http
            .get(format!("{}/api/account/playing", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Failed to list ongoing games")?;
        let playing: NowPlaying = response
            .json()
            .await
            .context("Failed to parse ongoing games")?;
        Ok(playing.now_playing)
    }

    pub fn join_game(&mut self, game_id: String) {
        self.game_id = Some(game_id);
    }

    pub fn game_id(&self) -> Option<&str> {
        self.game_id.as_deref()
    }

    /// Submits a confirmed move. The caller commits locally only on `Ok`;
    /// a rejection therefore leaves vision and remote consistent.
    pub async fn make_move(&self, uci: &str) -> Result<(), RelayError> {
        let game_id = self.game_id.as_deref().ok_or(RelayError::NoActiveGame)?;
        let response = self
            .http
            .post(format!(
                "{}/api/board/game/{game_id}/move/{uci}",
                self.base_url
            ))
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            println!("[relay] move sent: {uci}");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RelayError::Rejected { status, body })
        }
    }

    /// Background listener: streams game events and replays the server's
    /// move list onto the shared position until the game ends or the stop
    /// signal fires. Runs without the position lock except inside
    /// [`apply_remote_moves`].
    pub async fn stream_game(
        &self,
        position: PositionHandle,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let game_id = self.game_id.as_deref().ok_or(RelayError::NoActiveGame)?;
        let mut response = self
            .http
            .get(format!(
                "{}/api/board/game/stream/{game_id}",
                self.base_url
            ))
            .bearer_auth(&self.token)
            .header("Accept", "application/x-ndjson")
            .timeout(Duration::from_secs(60 * 60 * 12)) // long-lived stream
            .send()
            .await
            .context("Failed to open game event stream")?;
        if !response.status().is_success() {
            anyhow::bail!("Game stream error: {}", response.status());
        }

        let mut my_color = None;
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = stop.changed() => break,
                chunk = response.chunk() => chunk.context("Game stream read failed")?,
            };
            let Some(chunk) = chunk else { break };
            buf.extend_from_slice(&chunk);

            while let Some(i) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=i).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue; // keep-alive
                }
                let Ok(event) = serde_json::from_slice::<Value>(line) else {
                    continue;
                };

                match event.get("type").and_then(Value::as_str) {
                    Some("gameFull") => {
                        my_color = color_from_game_full(&event, &self.username);
                        if let (Some(color), Some(moves)) = (my_color, moves_of(&event)) {
                            apply_remote_moves(&position, moves, color).await;
                        }
                    }
                    Some("gameState") => {
                        let status = event.get("status").and_then(Value::as_str);
                        if status.is_some_and(|s| s != "started") {
                            println!("[relay] game over: {}", status.unwrap_or("?"));
                            return Ok(());
                        }
                        if let (Some(color), Some(moves)) = (my_color, moves_of(&event)) {
                            apply_remote_moves(&position, moves, color).await;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Whose turn it is after `moves`: white moves on even counts.
pub fn is_my_turn(moves: &str, my_color: Color) -> bool {
    let count = moves.split_whitespace().count();
    match my_color {
        Color::White => count % 2 == 0,
        Color::Black => count % 2 == 1,
    }
}

/// Extracts the UCI move list from either event shape: `gameFull` nests it
/// under `state`, `gameState` carries it directly.
fn moves_of(event: &Value) -> Option<&str> {
    event
        .get("moves")
        .or_else(|| event.get("state").and_then(|s| s.get("moves")))
        .and_then(Value::as_str)
}

/// Determines our color from the `gameFull` player blocks.
fn color_from_game_full(event: &Value, username: &str) -> Option<Color> {
    let id_of = |side: &str| {
        event
            .get(side)
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .map(str::to_lowercase)
    };
    let me = username.to_lowercase();
    if id_of("white").as_deref() == Some(me.as_str()) {
        Some(Color::White)
    } else if id_of("black").as_deref() == Some(me.as_str()) {
        Some(Color::Black)
    } else {
        None
    }
}

/// Replays the server's full move list onto the shared position. Skipped when
/// the list matches what we already have (our own echoed move included).
pub async fn apply_remote_moves(position: &PositionHandle, moves: &str, my_color: Color) {
    let mut pos = position.lock().await;
    if pos.relay_moves == moves {
        return;
    }

    pos.game.reset();
    for uci in moves.split_whitespace() {
        if let Err(e) = pos.game.play_uci(uci) {
            eprintln!("[relay] skipping unplayable remote move {uci}: {e}");
        }
    }
    pos.relay_moves = moves.to_string();
    pos.waiting_for_opponent = !is_my_turn(moves, my_color);

    if pos.waiting_for_opponent {
        if let Some(last) = moves.split_whitespace().last() {
            println!("[relay] waiting for opponent (last move {last})");
        }
    } else if let Some(last) = moves.split_whitespace().last() {
        println!("[relay] opponent played {last}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::new_position_handle;
    use shakmaty::Square;

    #[test]
    fn test_is_my_turn_alternates() {
        assert!(is_my_turn("", Color::White));
        assert!(!is_my_turn("", Color::Black));
        assert!(!is_my_turn("e2e4", Color::White));
        assert!(is_my_turn("e2e4", Color::Black));
        assert!(is_my_turn("e2e4 e7e5", Color::White));
    }

    #[test]
    fn test_moves_of_both_event_shapes() {
        let full: Value = serde_json::from_str(
            r#"{"type":"gameFull","white":{"id":"me"},"black":{"id":"them"},
                "state":{"type":"gameState","moves":"e2e4 e7e5","status":"started"}}"#,
        )
        .unwrap();
        assert_eq!(moves_of(&full), Some("e2e4 e7e5"));

        let state: Value =
            serde_json::from_str(r#"{"type":"gameState","moves":"e2e4","status":"started"}"#)
                .unwrap();
        assert_eq!(moves_of(&state), Some("e2e4"));
    }

    #[test]
    fn test_color_from_game_full_is_case_insensitive() {
        let event: Value = serde_json::from_str(
            r#"{"type":"gameFull","white":{"id":"alice"},"black":{"id":"bob"}}"#,
        )
        .unwrap();
        assert_eq!(color_from_game_full(&event, "Alice"), Some(Color::White));
        assert_eq!(color_from_game_full(&event, "BOB"), Some(Color::Black));
        assert_eq!(color_from_game_full(&event, "carol"), None);
    }

    #[test]
    fn test_ongoing_games_deserialization() {
        let games: NowPlaying = serde_json::from_str(
            r#"{"nowPlaying":[{"gameId":"abcd1234","color":"white",
                "opponent":{"username":"rival"}}]}"#,
        )
        .unwrap();
        assert_eq!(games.now_playing.len(), 1);
        assert_eq!(games.now_playing[0].game_id, "abcd1234");
        assert_eq!(games.now_playing[0].opponent.username, "rival");
    }

    #[tokio::test]
    async fn test_apply_remote_moves_replays_and_sets_turn_flag() {
        let position = new_position_handle();
        apply_remote_moves(&position, "e2e4", Color::Black).await;

        let pos = position.lock().await;
        assert_eq!(pos.relay_moves, "e2e4");
        assert!(!pos.waiting_for_opponent, "it is black's turn now");
        assert!(pos.game.occupancy().contains(&Square::E4));
        assert!(!pos.game.occupancy().contains(&Square::E2));
    }

    #[tokio::test]
    async fn test_apply_remote_moves_is_idempotent_on_same_string() {
        let position = new_position_handle();
        apply_remote_moves(&position, "e2e4 e7e5", Color::White).await;
        let fen_before = position.lock().await.game.fen();

        apply_remote_moves(&position, "e2e4 e7e5", Color::White).await;
        assert_eq!(position.lock().await.game.fen(), fen_before);
        assert!(!position.lock().await.waiting_for_opponent);
    }

    #[tokio::test]
    async fn test_own_echoed_move_is_not_replayed() {
        let position = new_position_handle();
        {
            // vision committed e2e4 and recorded it
            let mut pos = position.lock().await;
            pos.game.play_uci("e2e4").unwrap();
            pos.relay_moves = "e2e4".to_string();
            pos.waiting_for_opponent = true;
        }

        // the server echoes the same list back; nothing should change
        apply_remote_moves(&position, "e2e4", Color::White).await;
        let pos = position.lock().await;
        assert!(pos.waiting_for_opponent);
        assert_eq!(pos.relay_moves, "e2e4");
    }

    #[tokio::test]
    #[ignore = "requires LICHESS_TOKEN and network access"]
    async fn test_real_connect() {
        // Run with: LICHESS_TOKEN=... cargo test test_real_connect -- --ignored
        let client = RelayClient::connect().await.unwrap();
        let games = client.ongoing_games().await.unwrap();
        println!("ongoing games: {}", games.len());
    }
}

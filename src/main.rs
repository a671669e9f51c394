use anyhow::{bail, Context, Result};
use boardwatch::config::{Settings, DEFAULT_SETTINGS_FILE};
use boardwatch::grid;
use boardwatch::relay::RelayClient;
use boardwatch::session::{new_position_handle, Session, SessionStatus};
use clap::{Arg, ArgAction, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let matches = Command::new("boardwatch")
        .version("0.1.0")
        .about("Infers chess moves from webcam frames of a physical board")
        .arg(
            Arg::new("frames")
                .long("frames")
                .value_name("DIR")
                .required(true)
                .help("Directory of captured board frames, processed in name order"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .default_value(DEFAULT_SETTINGS_FILE)
                .help("Settings file (JSON); missing file means defaults"),
        )
        .arg(
            Arg::new("fen")
                .long("fen")
                .value_name("FEN")
                .help("Starting position when resuming a game mid-way"),
        )
        .arg(
            Arg::new("relay")
                .long("relay")
                .action(ArgAction::SetTrue)
                .help("Relay confirmed moves to an online game (needs LICHESS_TOKEN)"),
        )
        .arg(
            Arg::new("game")
                .long("game")
                .value_name("ID")
                .help("Relay game id; without it, pick from the ongoing-games list"),
        )
        .get_matches();

    let frames_dir = PathBuf::from(matches.get_one::<String>("frames").unwrap());
    let config_path = PathBuf::from(matches.get_one::<String>("config").unwrap());
    let settings = Settings::load(&config_path)
        .with_context(|| format!("Failed to load settings from {}", config_path.display()))?;

    let position = new_position_handle();
    if let Some(fen) = matches.get_one::<String>("fen") {
        position
            .lock()
            .await
            .game
            .set_fen(fen)
            .context("Invalid --fen position")?;
    }

    let mut stop_tx = None;
    let mut listener = None;
    let mut session = Session::new(settings, position.clone());

    if matches.get_flag("relay") {
        let mut relay = RelayClient::connect().await?;
        let game_id = match matches.get_one::<String>("game") {
            Some(id) => id.clone(),
            None => pick_game(&relay).await?,
        };
        relay.join_game(game_id);
        let relay = Arc::new(relay);

        let (tx, rx) = watch::channel(false);
        listener = Some(tokio::spawn({
            let relay = Arc::clone(&relay);
            let position = position.clone();
            async move { relay.stream_game(position, rx).await }
        }));
        stop_tx = Some(tx);
        session = session.with_relay(relay);
    }

    let frames = frame_paths(&frames_dir)?;
    if frames.is_empty() {
        bail!("No image frames found in {}", frames_dir.display());
    }
    println!(
        "Processing {} frames from {}",
        frames.len(),
        frames_dir.display()
    );

    let first = load_frame(&frames[0])?;
    session.calibrate(&grid::split_board(&first));
    println!("Calibrated on {}", frames[0].display());

    for path in &frames[1..] {
        let board = load_frame(path)?;
        let report = session.process_frame(&grid::split_board(&board)).await;

        match report.status {
            SessionStatus::Waiting => println!("  [{}] occlusion", path.display()),
            SessionStatus::Processing => println!(
                "  [{}] {} squares changing",
                path.display(),
                report.changed_count
            ),
            SessionStatus::Idle => {}
        }
        if let Some(sq) = report.lifted {
            let dests: Vec<String> = report.radar.iter().map(|s| s.to_string()).collect();
            println!("  lifted {sq}, can reach: {}", dests.join(" "));
        }
        if let Some(e) = report.error {
            eprintln!("  move rejected: {e}");
        }
    }

    let pos = position.lock().await;
    println!("Final position: {}", pos.game.fen());
    drop(pos);

    if let Some(tx) = stop_tx {
        let _ = tx.send(true);
    }
    if let Some(handle) = listener {
        let _ = handle.await;
    }
    Ok(())
}

/// Image files in the frames directory, sorted by file name so capture order
/// is playback order.
fn frame_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read frames directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e.to_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp"))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

fn load_frame(path: &Path) -> Result<image::GrayImage> {
    let img =
        image::open(path).with_context(|| format!("Failed to open frame {}", path.display()))?;
    Ok(img.to_luma8())
}

/// Interactive pick from the account's ongoing games.
async fn pick_game(relay: &RelayClient) -> Result<String> {
    let games = relay.ongoing_games().await?;
    if games.is_empty() {
        bail!("No ongoing games on the relay account");
    }
    let labels: Vec<String> = games
        .iter()
        .map(|g| format!("{} vs {} ({})", g.game_id, g.opponent.username, g.color))
        .collect();
    let choice = dialoguer::Select::new()
        .with_prompt("Relay which game?")
        .items(&labels)
        .default(0)
        .interact()
        .context("Game selection cancelled")?;
    Ok(games[choice].game_id.clone())
}

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use common::{Command, LibraryEntry, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "lwctl")]
#[command(about = "loopwall video wallpaper control", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a video into the library (waits for the download to finish)
    Add {
        /// URL or video id
        reference: String,
    },

    /// Play a library entry as the wallpaper on every display
    Set {
        /// Library id (see `lwctl list`)
        id: String,
    },

    /// Fade out and stop the current wallpaper
    Stop,

    /// Turn wallpaper audio on or off
    Audio {
        #[arg(value_enum)]
        state: Switch,
    },

    /// Set the wallpaper volume
    Volume {
        /// 0.0-1.0, or a percentage like 40%
        #[arg(value_parser = parse_volume)]
        volume: f32,
    },

    /// Remove an entry and its cached file
    Delete {
        id: String,
    },

    /// Reorder the library; listed ids come first, the rest keep their order
    Reorder {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Play the last wallpaper again
    Restore,

    /// Abort a running download
    Cancel {
        id: String,
    },

    /// List the library
    List,

    /// Query daemon status
    Query,

    /// List connected displays
    Displays,

    /// Ping the daemon to check if it's running
    Ping,

    /// Kill the running daemon
    Kill,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

fn parse_volume(value: &str) -> Result<f32, String> {
    let (number, scale) = match value.strip_suffix('%') {
        Some(percent) => (percent, 100.0),
        None => (value, 1.0),
    };
    let volume = number
        .trim()
        .parse::<f32>()
        .map_err(|e| format!("invalid volume '{}': {}", value, e))?
        / scale;

    if (0.0..=1.0).contains(&volume) {
        Ok(volume)
    } else {
        Err(format!("volume must be between 0.0 and 1.0, got {}", value))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Add { reference } => Command::AddToLibrary { reference },
        Commands::Set { id } => Command::SetWallpaper { id },
        Commands::Stop => Command::StopWallpaper,
        Commands::Audio { state } => Command::SetAudioEnabled {
            enabled: matches!(state, Switch::On),
        },
        Commands::Volume { volume } => Command::SetVolume { volume },
        Commands::Delete { id } => Command::DeleteFromLibrary { id },
        Commands::Reorder { ids } => Command::ReorderLibrary { order: ids },
        Commands::Restore => Command::RestoreLastOnLaunch,
        Commands::Cancel { id } => Command::CancelDownload { id },
        Commands::List => Command::ListLibrary,
        Commands::Query => Command::Query,
        Commands::Displays => Command::ListDisplays,
        Commands::Ping => Command::Ping,
        Commands::Kill => Command::Kill,
    };

    match send_command(command).await {
        Ok(response) => {
            handle_response(response);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("\nIs the daemon running? Try starting it with: loopwall");
            std::process::exit(1);
        }
    }
}

async fn send_command(command: Command) -> Result<Response> {
    let socket_path = common::get_socket_path();

    let stream = UnixStream::connect(&socket_path).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Send command
    let command_json = serde_json::to_string(&command)?;
    writer.write_all(command_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    // Read response
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;

    let response: Response = serde_json::from_str(&response_line)?;
    Ok(response)
}

fn handle_response(response: Response) {
    match response {
        Response::Ok => {
            println!("✓ Success");
        }
        Response::Error(e) => {
            eprintln!("✗ Error: {}", e);
            std::process::exit(1);
        }
        Response::Added(entry) => {
            println!("✓ Added {} ({})", entry.id, entry.title);
            if let Some(path) = &entry.cached_file_path {
                println!("  Cached at {}", path);
            }
        }
        Response::Playing(report) => {
            println!("✓ Playing {}", report.id);
            if report.readiness_timed_out {
                println!("  (started before the video reported ready)");
            }
        }
        Response::NothingToRestore => {
            println!("Nothing to restore");
        }
        Response::Library(entries) => {
            if entries.is_empty() {
                println!("Library is empty");
            }
            for entry in &entries {
                println!("{}", format_entry(entry));
            }
        }
        Response::Status(status) => {
            println!("Daemon Status:");
            println!("  Version: {}", status.version);
            println!("  Uptime: {}s", status.uptime_secs);
            println!("  Playback: {}", status.playback.state);
            if let Some(id) = &status.playback.active_id {
                println!("  Wallpaper: {}", id);
            }
            println!(
                "  Audio: {} (volume {:.0}%)",
                if status.playback.audio_enabled { "on" } else { "off" },
                status.playback.audio_volume * 100.0
            );
            println!("  Surfaces: {}", status.surfaces);
            if !status.downloads.is_empty() {
                println!("  Downloads:");
                for download in status.downloads {
                    println!(
                        "    {} {:>5.1}% {}",
                        download.id,
                        download.progress * 100.0,
                        download.reference
                    );
                }
            }
        }
        Response::Displays(displays) => {
            println!("Connected Displays:");
            for display in displays {
                println!(
                    "  {} - {}x{} at {},{}{}",
                    display.id,
                    display.width,
                    display.height,
                    display.x,
                    display.y,
                    if display.attached { " (playing)" } else { "" }
                );
            }
        }
        Response::Pong => {
            println!("✓ Daemon is running");
        }
    }
}

fn format_entry(entry: &LibraryEntry) -> String {
    let size = entry
        .size_bytes
        .map(|bytes| format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0)))
        .unwrap_or_default();
    format!(
        "{:>3}. {:<16} {} {}  {}",
        entry.sort_index + 1,
        entry.id,
        if entry.is_cached { "●" } else { "○" },
        entry.title,
        size
    )
    .trim_end()
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volume() {
        assert_eq!(parse_volume("0.5"), Ok(0.5));
        assert_eq!(parse_volume("40%"), Ok(0.4));
        assert_eq!(parse_volume("100%"), Ok(1.0));
        assert!(parse_volume("1.5").is_err());
        assert!(parse_volume("-1").is_err());
        assert!(parse_volume("loud").is_err());
    }

    #[test]
    fn test_cli_maps_to_commands() {
        let cli = Cli::try_parse_from(["lwctl", "reorder", "b", "a"]).unwrap();
        assert!(matches!(cli.command, Commands::Reorder { ref ids } if ids == &["b", "a"]));

        let cli = Cli::try_parse_from(["lwctl", "audio", "on"]).unwrap();
        assert!(matches!(cli.command, Commands::Audio { state: Switch::On }));

        assert!(Cli::try_parse_from(["lwctl", "reorder"]).is_err());
    }
}

/// Integration tests for the IPC wire format
/// These pin down the JSON shapes exchanged between `lwctl` and the daemon
use common::{
    Command, DaemonStatus, DisplayInfo, DownloadStatus, LibraryEntry, PlayReport, PlaybackState,
    PlaybackStatus, Response, WallpaperError,
};
use serde_json::json;

#[test]
fn test_command_wire_shapes() {
    let cmd = Command::SetWallpaper {
        id: "dQw4w9WgXcQ".to_string(),
    };
    assert_eq!(
        serde_json::to_value(&cmd).unwrap(),
        json!({ "SetWallpaper": { "id": "dQw4w9WgXcQ" } })
    );

    // Unit commands travel as bare strings
    assert_eq!(serde_json::to_string(&Command::Ping).unwrap(), "\"Ping\"");
    assert_eq!(
        serde_json::to_string(&Command::RestoreLastOnLaunch).unwrap(),
        "\"RestoreLastOnLaunch\""
    );

    let parsed: Command =
        serde_json::from_str(r#"{"ReorderLibrary":{"order":["b","a","c"]}}"#).unwrap();
    match parsed {
        Command::ReorderLibrary { order } => assert_eq!(order, vec!["b", "a", "c"]),
        other => panic!("Wrong command type: {:?}", other),
    }

    let parsed: Command = serde_json::from_str(r#"{"SetVolume":{"volume":0.25}}"#).unwrap();
    assert!(matches!(parsed, Command::SetVolume { volume } if volume == 0.25));
}

#[test]
fn test_unknown_command_is_rejected() {
    assert!(serde_json::from_str::<Command>(r#""SetShader""#).is_err());
    assert!(serde_json::from_str::<Command>(r#"{"SetWallpaper":{}}"#).is_err());
}

#[test]
fn test_error_responses_keep_their_kind() {
    let resp = Response::Error(WallpaperError::Busy("abc is already downloading".to_string()));
    let json = serde_json::to_string(&resp).unwrap();
    let deserialized: Response = serde_json::from_str(&json).unwrap();

    match deserialized {
        Response::Error(e) => {
            assert_eq!(
                e,
                WallpaperError::Busy("abc is already downloading".to_string())
            );
            assert_eq!(e.to_string(), "Busy: abc is already downloading");
        }
        other => panic!("Wrong response type: {:?}", other),
    }
}

#[test]
fn test_play_and_library_responses() {
    let resp = Response::Playing(PlayReport {
        id: "abc".to_string(),
        readiness_timed_out: true,
    });
    assert_eq!(
        serde_json::to_value(&resp).unwrap(),
        json!({ "Playing": { "id": "abc", "readiness_timed_out": true } })
    );

    let entry = LibraryEntry {
        id: "abc".to_string(),
        title: "Rain on a window".to_string(),
        thumbnail_path: None,
        cached_file_path: Some("/home/user/.cache/loopwall/videos/abc.mp4".to_string()),
        is_cached: true,
        size_bytes: Some(48_000_000),
        sort_index: 0,
    };
    let json = serde_json::to_string(&Response::Library(vec![entry.clone()])).unwrap();
    match serde_json::from_str::<Response>(&json).unwrap() {
        Response::Library(entries) => assert_eq!(entries, vec![entry]),
        other => panic!("Wrong response type: {:?}", other),
    }
}

#[test]
fn test_status_response() {
    let status = DaemonStatus {
        version: "0.1.0".to_string(),
        uptime_secs: 3600,
        playback: PlaybackStatus {
            state: PlaybackState::Switching,
            active_id: Some("abc".to_string()),
            audio_enabled: false,
            audio_volume: 0.8,
        },
        downloads: vec![DownloadStatus {
            id: "xyz".to_string(),
            reference: "https://example.com/xyz".to_string(),
            progress: 0.5,
        }],
        surfaces: 2,
    };

    let value = serde_json::to_value(Response::Status(status)).unwrap();
    assert_eq!(value["Status"]["playback"]["state"], json!("Switching"));
    assert_eq!(value["Status"]["downloads"][0]["progress"], json!(0.5));

    match serde_json::from_value::<Response>(value).unwrap() {
        Response::Status(status) => {
            assert_eq!(status.playback.state, PlaybackState::Switching);
            assert_eq!(status.surfaces, 2);
        }
        other => panic!("Wrong response type: {:?}", other),
    }
}

#[test]
fn test_displays_response() {
    let displays = vec![
        DisplayInfo {
            id: "DP-1".to_string(),
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
            attached: true,
        },
        DisplayInfo {
            id: "DP-2".to_string(),
            x: -1080,
            y: 0,
            width: 1080,
            height: 1920,
            attached: false,
        },
    ];

    let json = serde_json::to_string(&Response::Displays(displays.clone())).unwrap();
    match serde_json::from_str::<Response>(&json).unwrap() {
        Response::Displays(parsed) => assert_eq!(parsed, displays),
        other => panic!("Wrong response type: {:?}", other),
    }
}

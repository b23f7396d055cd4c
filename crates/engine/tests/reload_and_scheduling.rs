//! Engine-level scenarios that run without a PBX
//!
//! Hot reload of context prompts and transfer targets, barge-in timing
//! with the 600 ms suppression window, and the playback scheduler
//! riding out a bursty 4-second response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arivox_engine::config::{Config, ConfigStore};
use arivox_engine::playback::{PlaybackConfig, PlaybackQueue, Tick};
use arivox_engine::tools::ToolRegistry;
use arivox_engine::vad::barge::BargeVerdict;
use arivox_engine::vad::{BargeGate, SuppressionWindow};

fn full_config_toml(target: &str) -> String {
    format!(
        r#"
        audio_transport = "audiosocket"
        default_provider = "agent"

        [asterisk]
        base_url = "http://127.0.0.1:8088"
        username = "arivox"
        password = "secret"

        [providers.agent]
        kind = "monolithic"
        url = "wss://realtime.example/v1"
        api_key = "k"

        [contexts.support]
        greeting = "Support, how can I help?"
        prompt = "You answer support calls."
        tools = ["transfer", "hangup_call"]

        [tools.transfer.destinations.support_agent]
        kind = "extension"
        target = "{target}"
        description = "Support desk"
        "#
    )
}

#[test]
fn hot_reload_applies_prompt_and_destination_changes() {
    let dir = std::env::temp_dir().join(format!("arivox-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.toml");
    std::fs::write(&path, full_config_toml("6000")).unwrap();

    let (initial, warnings) = Config::load(&path).unwrap();
    assert!(warnings.is_empty());
    let store = ConfigStore::new(path.clone(), initial);

    // in-flight calls pin the snapshot they started with
    let pinned = store.snapshot();

    let updated = full_config_toml("6001")
        .replace("You answer support calls.", "You answer support calls tersely.");
    std::fs::write(&path, updated).unwrap();

    let report = store.reload().unwrap();
    assert!(report.applied);
    assert!(report.restart_required.is_empty(), "{:?}", report.restart_required);

    let fresh = store.snapshot();
    assert_eq!(
        fresh.tools.transfer.destinations["support_agent"].target,
        "6001"
    );
    assert!(fresh.contexts["support"].prompt.contains("tersely"));

    // the pinned snapshot is untouched
    assert_eq!(
        pinned.tools.transfer.destinations["support_agent"].target,
        "6000"
    );

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn tool_registry_follows_context_allowlist() {
    let config = Config::from_str(&full_config_toml("6000")).unwrap().0;
    let registry = Arc::new(ToolRegistry::from_config(&config));
    let schemas = registry.schemas_for(&config.contexts["support"].tools);
    let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["transfer", "hangup_call"]);
}

#[test]
fn barge_in_at_1800ms_cancels_and_suppresses_600ms() {
    let config = Config::from_str(&full_config_toml("6000")).unwrap().0;
    let base = Instant::now();
    let at = |ms: u64| base + Duration::from_millis(ms);

    let mut gate = BargeGate::new(config.barge_in.clone());
    let mut suppression = SuppressionWindow::new(config.barge_in.clone());
    let mut playback = PlaybackQueue::new(PlaybackConfig {
        sample_rate: 8_000,
        min_start_ms: 80,
        greeting_min_start_ms: 40,
        low_watermark_ms: 40,
        empty_backoff_ticks_max: 5,
    });

    // agent starts a 4 s response; caller confirms speech 1.8 s in
    gate.response_started(base, false);
    playback.begin_response(false);
    let old_gen = playback.generation();
    playback.enqueue(old_gen, vec![500i16; 8 * 4_000], base);

    assert_eq!(gate.judge(at(1_800)), BargeVerdict::Allowed);
    gate.barged(at(1_800));
    suppression.open(at(1_800));
    let new_gen = playback.cancel();
    assert_eq!(playback.buffered_ms(), 0);

    // provider chunks inside the 600 ms window are discarded at egress
    assert!(suppression.active(at(2_000)));
    assert!(suppression.active(at(2_399)));
    assert!(!suppression.active(at(2_400)));

    // late chunks from the cancelled generation never play
    playback.begin_response(false);
    playback.enqueue(old_gen, vec![500i16; 800], at(2_500));
    assert_eq!(playback.tick(), Tick::Idle);
    assert!(playback.stale_dropped() >= 1);

    // fresh audio with the new generation does
    playback.enqueue(new_gen, vec![500i16; 800], at(2_600));
    assert!(matches!(playback.tick(), Tick::Frame(_)));
}

#[test]
fn scheduler_survives_a_bursty_response() {
    let mut playback = PlaybackQueue::new(PlaybackConfig {
        sample_rate: 8_000,
        min_start_ms: 100,
        greeting_min_start_ms: 40,
        low_watermark_ms: 60,
        empty_backoff_ticks_max: 3,
    });
    playback.begin_response(false);
    let generation = playback.generation();
    let now = Instant::now();

    let mut frames = 0usize;
    let mut pads = 0usize;
    // bursts arrive every 10 ticks, 200 ms at a time, for 4 s of audio
    for tick in 0..260 {
        if tick % 10 == 0 && tick < 200 {
            playback.enqueue(generation, vec![100i16; 1_600], now);
        }
        if tick == 220 {
            playback.mark_end_of_response();
        }
        match playback.tick() {
            Tick::Frame(frame) => {
                assert_eq!(frame.len(), 160);
                frames += 1;
            }
            Tick::SilencePad => pads += 1,
            Tick::Completed => break,
            Tick::Idle => {}
        }
    }
    // all 4 s of audio made it to the wire in 20 ms slots
    assert_eq!(frames, 200, "pads = {pads}");
}

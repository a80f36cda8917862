//! Full-runtime tests over a scripted transport and a manually driven device.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chorus_audio::testing::{ManualDevice, StaticResolver};
use chorus_audio::{AlwaysAllowed, AudioBackend, AudioHandle};
use chorus_connection::ConnectionState;
use chorus_connection::testing::{ScriptedTransport, ServerEnd};
use chorus_core::{MessageId, PersonaId};
use chorus_runtime::{RuntimeConfig, RuntimeDeps, RuntimeEvent, SessionRuntime, SessionSeed};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    runtime: SessionRuntime,
    events: broadcast::Receiver<RuntimeEvent>,
    server: ServerEnd,
    device: Arc<ManualDevice>,
    transport: Arc<ScriptedTransport>,
}

async fn harness(voice: bool, auto_start: bool) -> Harness {
    let transport = ScriptedTransport::new();
    let server = transport.accept();
    let (device, device_events) = ManualDevice::new();
    device.set_auto_start(auto_start);
    let resolver = Arc::new(StaticResolver::new());
    for id in ["m1", "m2", "m3"] {
        let url = format!("/audio/{id}.mp3");
        resolver.insert(url.clone(), AudioHandle::new(url, vec![1_u8; 8]));
    }

    let deps = RuntimeDeps {
        config: RuntimeConfig::default(),
        transport: transport.clone(),
        audio: AudioBackend {
            device: device.clone(),
            device_events,
            resolver,
            capability: Arc::new(AlwaysAllowed),
        },
    };
    let seed = SessionSeed::new("sess".into(), vec!["a".into(), "b".into()]).with_voice(voice);
    let runtime = SessionRuntime::new(seed, deps);
    let events = runtime.subscribe();
    runtime.connect().await.unwrap();
    Harness {
        runtime,
        events,
        server,
        device,
        transport,
    }
}

fn frame(kind: &str, data: Value) -> String {
    json!({
        "type": kind,
        "sessionId": "sess",
        "timestamp": 1_736_935_200_000_i64,
        "data": data,
    })
    .to_string()
}

fn typing(persona: &str, is_typing: bool) -> String {
    frame("persona-typing", json!({"personaId": persona, "isTyping": is_typing}))
}

fn response(id: &str, persona: &str, content: &str) -> String {
    frame(
        "persona-response",
        json!({"messageId": id, "personaId": persona, "content": content}),
    )
}

fn audio(id: &str, persona: &str, url: &str) -> String {
    frame(
        "persona-audio",
        json!({"messageId": id, "personaId": persona, "audioUrl": url, "voiceId": "v", "duration": 1.5}),
    )
}

/// Skip events until one matches.
async fn wait_for(
    rx: &mut broadcast::Receiver<RuntimeEvent>,
    pred: impl Fn(&RuntimeEvent) -> bool,
) -> RuntimeEvent {
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

/// Every event up to and including the first match.
async fn collect_until(
    rx: &mut broadcast::Receiver<RuntimeEvent>,
    pred: impl Fn(&RuntimeEvent) -> bool,
) -> Vec<RuntimeEvent> {
    timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
    .unwrap()
}

async fn wait_dispatched(runtime: &SessionRuntime, count: u64) {
    timeout(WAIT, async {
        while runtime.frame_counts().0 < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn displayed(event: &RuntimeEvent, id: &str) -> bool {
    matches!(event, RuntimeEvent::MessageDisplayed(m) if m.id == MessageId::from(id))
}

fn history_ids(runtime: &SessionRuntime) -> Vec<String> {
    runtime.history().iter().map(|m| m.id.to_string()).collect()
}

#[tokio::test]
async fn text_waits_for_audio_start() {
    let mut h = harness(true, false).await;
    for text in [
        typing("a", true),
        response("m1", "a", "hi"),
        audio("m1", "a", "/audio/m1.mp3"),
        typing("a", false),
    ] {
        assert!(h.server.push(&text));
    }
    wait_dispatched(&h.runtime, 4).await;

    // Typing cleared on the response; the text is still held.
    assert!(h.runtime.typing_personas().is_empty());
    assert!(h.runtime.history().is_empty());
    assert_eq!(h.runtime.pending_for(&"a".into()).len(), 1);

    // Wait until the autoplay start reached the device, then confirm it.
    timeout(WAIT, async {
        while h.device.starts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(h.runtime.history().is_empty());
    h.device.confirm_started();

    let seen = collect_until(&mut h.events, |e| displayed(e, "m1")).await;
    let seen: Vec<RuntimeEvent> = seen
        .into_iter()
        .filter(|e| !matches!(e, RuntimeEvent::ConnectionStateChanged { .. }))
        .collect();
    let kinds: Vec<&str> = seen.iter().map(RuntimeEvent::event_type).collect();
    assert_eq!(
        kinds,
        [
            "typing_changed",
            "message_held",
            "typing_changed",
            "audio_queued",
            "speaking_changed",
            "message_displayed"
        ]
    );
    assert_matches!(&seen[2], RuntimeEvent::TypingChanged { is_typing: false, .. });
    assert_eq!(h.runtime.speaking_persona(), Some(PersonaId::from("a")));
    assert_eq!(history_ids(&h.runtime), ["m1"]);
    assert_eq!(h.runtime.history()[0].content, "hi");
}

#[tokio::test]
async fn voice_disabled_displays_in_the_same_cycle() {
    let mut h = harness(false, true).await;
    assert!(h.server.push(&response("m1", "a", "hello")));
    assert!(h.server.push(&audio("m1", "a", "/audio/m1.mp3")));
    wait_dispatched(&h.runtime, 2).await;

    assert_matches!(
        wait_for(&mut h.events, |e| matches!(e, RuntimeEvent::MessageDisplayed(_))).await,
        RuntimeEvent::MessageDisplayed(m) if m.content == "hello"
    );
    assert_eq!(history_ids(&h.runtime), ["m1"]);
    assert!(h.runtime.queued_audio().is_empty());
    assert!(h.device.starts().is_empty());
}

#[tokio::test]
async fn unresolvable_audio_fails_once_and_releases_text() {
    let mut h = harness(true, true).await;
    assert!(h.server.push(&response("m9", "a", "lost")));
    assert!(h.server.push(&audio("m9", "a", "/audio/missing.mp3")));

    let seen = collect_until(&mut h.events, |e| matches!(e, RuntimeEvent::AudioFailed { .. })).await;
    assert!(seen.iter().any(|e| displayed(e, "m9")));
    assert!(!seen.iter().any(|e| matches!(e, RuntimeEvent::SpeakingChanged(Some(_)))));
    assert_matches!(seen.last(), Some(RuntimeEvent::AudioFailed { message_id, .. }) if *message_id == MessageId::from("m9"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut failures = 0;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, RuntimeEvent::AudioFailed { .. }) {
            failures += 1;
        }
    }
    assert_eq!(failures, 0);
    assert!(h.runtime.queued_audio().is_empty());
    assert_eq!(h.runtime.speaking_persona(), None);
    assert!(h.device.starts().is_empty());
    assert_eq!(history_ids(&h.runtime), ["m9"]);
}

#[tokio::test]
async fn two_clips_for_one_persona_play_in_order() {
    let mut h = harness(true, true).await;
    for text in [
        response("m1", "a", "first"),
        response("m2", "a", "second"),
        audio("m1", "a", "/audio/m1.mp3"),
        audio("m2", "a", "/audio/m2.mp3"),
    ] {
        assert!(h.server.push(&text));
    }

    let _ = wait_for(&mut h.events, |e| displayed(e, "m1")).await;
    assert_eq!(history_ids(&h.runtime), ["m1"]);
    assert_eq!(h.runtime.queued_audio(), vec![MessageId::from("m1"), MessageId::from("m2")]);

    h.device.finish_current();
    let _ = wait_for(&mut h.events, |e| displayed(e, "m2")).await;
    assert_eq!(history_ids(&h.runtime), ["m1", "m2"]);
    assert_eq!(h.device.max_concurrent(), 1);

    let ack: Value = serde_json::from_str(&h.server.next_sent().await.unwrap()).unwrap();
    assert_eq!(ack["type"], "audio-acknowledgment");
    assert_eq!(ack["data"]["messageId"], "m1");
    assert_eq!(ack["data"]["personaId"], "a");
    assert_eq!(ack["data"]["finished"], true);
}

#[tokio::test]
async fn server_audio_error_releases_text() {
    let mut h = harness(true, false).await;
    assert!(h.server.push(&response("m1", "b", "no voice")));
    assert!(h.server.push(&frame(
        "audio-error",
        json!({"messageId": "m1", "personaId": "b", "error": "tts down", "timestamp": 1}),
    )));

    let seen = collect_until(&mut h.events, |e| matches!(e, RuntimeEvent::AudioFailed { .. })).await;
    assert!(seen.iter().any(|e| displayed(e, "m1")));
    assert_matches!(seen.last(), Some(RuntimeEvent::AudioFailed { error, .. }) if error == "tts down");
    assert!(h.runtime.pending_for(&"b".into()).is_empty());
}

#[tokio::test]
async fn audio_error_releases_the_failed_message_text() {
    let mut h = harness(true, false).await;
    assert!(h.server.push(&response("m1", "a", "first")));
    assert!(h.server.push(&response("m2", "a", "second")));
    assert!(h.server.push(&frame(
        "audio-error",
        json!({"messageId": "m2", "personaId": "a", "error": "tts down"}),
    )));

    let seen = collect_until(&mut h.events, |e| matches!(e, RuntimeEvent::AudioFailed { .. })).await;
    assert!(seen.iter().any(|e| displayed(e, "m2")));
    assert!(!seen.iter().any(|e| displayed(e, "m1")));
    assert_eq!(history_ids(&h.runtime), ["m2"]);
    let held: Vec<String> = h
        .runtime
        .pending_for(&"a".into())
        .iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(held, ["m1"]);
}

#[tokio::test]
async fn text_arriving_after_its_audio_started_is_displayed() {
    let mut h = harness(true, true).await;
    assert!(h.server.push(&audio("m1", "a", "/audio/m1.mp3")));
    let _ = wait_for(&mut h.events, |e| matches!(e, RuntimeEvent::SpeakingChanged(Some(_)))).await;
    assert!(h.runtime.history().is_empty());

    assert!(h.server.push(&response("m1", "a", "late words")));
    let _ = wait_for(&mut h.events, |e| displayed(e, "m1")).await;
    h.device.finish_current();
    let _ = wait_for(&mut h.events, |e| matches!(e, RuntimeEvent::SpeakingChanged(None))).await;

    assert_eq!(history_ids(&h.runtime), ["m1"]);
    assert!(h.runtime.pending_for(&"a".into()).is_empty());

    // The next exchange waits for its own audio again.
    assert!(h.server.push(&response("m2", "a", "next")));
    wait_dispatched(&h.runtime, 3).await;
    assert_eq!(history_ids(&h.runtime), ["m1"]);
    assert!(h.server.push(&audio("m2", "a", "/audio/m2.mp3")));
    let _ = wait_for(&mut h.events, |e| displayed(e, "m2")).await;
    assert_eq!(history_ids(&h.runtime), ["m1", "m2"]);
}

#[tokio::test]
async fn fractional_timestamps_are_accepted() {
    let mut h = harness(false, true).await;
    let first = json!({
        "type": "persona-response",
        "sessionId": "sess",
        "timestamp": 1_736_935_200_000.5_f64,
        "data": {"messageId": "m1", "personaId": "a", "content": "one", "timestamp": 1_736_935_200_001.25_f64},
    })
    .to_string();
    assert!(h.server.push(&first));
    assert!(h.server.push(&response("m2", "a", "two")));

    let _ = wait_for(&mut h.events, |e| displayed(e, "m2")).await;
    assert_eq!(history_ids(&h.runtime), ["m1", "m2"]);
    assert_eq!(h.runtime.history()[0].timestamp.timestamp_millis(), 1_736_935_200_001);
    assert_eq!(h.runtime.frame_counts(), (2, 0));
}

#[tokio::test]
async fn turning_voice_off_flushes_held_text() {
    let mut h = harness(true, false).await;
    assert!(h.server.push(&response("m1", "a", "one")));
    assert!(h.server.push(&response("m2", "b", "two")));
    assert!(h.server.push(&audio("m1", "a", "/audio/m1.mp3")));
    wait_dispatched(&h.runtime, 3).await;
    assert!(h.runtime.history().is_empty());

    h.runtime.set_voice_enabled(false);
    assert_eq!(history_ids(&h.runtime), ["m1", "m2"]);
    assert!(h.runtime.queued_audio().is_empty());
    assert!(!h.runtime.voice_enabled());
    let _ = wait_for(&mut h.events, |e| displayed(e, "m2")).await;
}

#[tokio::test]
async fn user_messages_are_sent_and_recorded() {
    let mut h = harness(true, true).await;
    assert!(h.runtime.send_user_message("hello all", Some("b".into()), None));

    let sent: Value = serde_json::from_str(&h.server.next_sent().await.unwrap()).unwrap();
    assert_eq!(sent["type"], "user-message");
    assert_eq!(sent["data"]["content"], "hello all");
    assert_eq!(sent["data"]["directQuestionPersonaId"], "b");
    assert_matches!(
        wait_for(&mut h.events, |e| matches!(e, RuntimeEvent::MessageDisplayed(_))).await,
        RuntimeEvent::MessageDisplayed(m) if m.content == "hello all"
    );
    assert_eq!(h.runtime.history().len(), 1);

    h.runtime.shutdown().await;
    h.runtime.shutdown().await;
    assert_eq!(h.runtime.connection_state(), ConnectionState::Closed);
    assert!(!h.runtime.send_user_message("late", None, None));
    assert_eq!(h.runtime.history().len(), 1);
    assert!(h.runtime.connect().await.is_err());
}

#[tokio::test]
async fn stop_all_clears_speaking_persona() {
    let mut h = harness(true, true).await;
    assert!(h.server.push(&response("m1", "a", "x")));
    assert!(h.server.push(&audio("m1", "a", "/audio/m1.mp3")));
    let _ = wait_for(&mut h.events, |e| matches!(e, RuntimeEvent::SpeakingChanged(Some(_)))).await;

    h.runtime.stop_all();
    assert_eq!(h.runtime.speaking_persona(), None);
    assert_eq!(h.device.active(), 0);
    assert_eq!(h.runtime.queued_audio(), vec![MessageId::from("m1")]);

    let settings = h.runtime.update_audio_settings(0.25, 9.0);
    assert!((settings.volume - 0.25).abs() < f64::EPSILON);
    assert!((settings.speed - 2.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_stopping_the_session() {
    let mut h = harness(true, true).await;
    assert!(h.server.push("not json"));
    assert!(h.server.push(&frame("persona-dancing", json!({}))));
    assert!(h.server.push(&frame("error", json!({"message": "overloaded"}))));

    assert_matches!(
        wait_for(&mut h.events, |e| matches!(e, RuntimeEvent::ServerError { .. })).await,
        RuntimeEvent::ServerError { message } if message == "overloaded"
    );
    assert_eq!(h.runtime.frame_counts(), (1, 2));
    assert_eq!(h.runtime.connection_state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn lost_connection_retries_with_backoff_then_gives_up() {
    let Harness {
        runtime,
        mut events,
        server,
        transport,
        ..
    } = harness(true, true).await;
    server.close("server restart");

    let mut delays = Vec::new();
    let attempts = timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await.unwrap() {
                RuntimeEvent::ReconnectScheduled { delay, .. } => delays.push(delay.as_secs()),
                RuntimeEvent::ReconnectExhausted { attempts } => break attempts,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(delays, [1, 2, 4, 8, 16]);
    assert_eq!(attempts, 5);
    assert_eq!(transport.open_count(), 6);
    assert_eq!(runtime.connection_state(), ConnectionState::Closed);
    assert!(runtime.connect().await.is_err());
}

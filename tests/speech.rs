//! Speech coordinator integration tests
//!
//! Synthesizers and speakers are fakes that take virtual time to "speak".

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lookout::speech::{
    Priority, SpeechCoordinator, SpeechOutcome, SpeechOutput, SpeechRequest, SynthesisBackend, VoiceSettings,
};
use lookout::Error;

mod common;

use common::{Audible, FakeDevice, FakeRemote, FakeSink, RemoteBehavior, settle};

const UTTERANCE: Duration = Duration::from_secs(2);

struct Rig {
    speech: Arc<SpeechCoordinator>,
    audible: Arc<Audible>,
    remote: Arc<FakeRemote>,
    device: Arc<FakeDevice>,
}

fn rig(behavior: RemoteBehavior) -> Rig {
    let audible = Arc::new(Audible::default());
    let remote = FakeRemote::new(behavior);
    let device = FakeDevice::new(audible.clone(), UTTERANCE);
    let sink = FakeSink::new(audible.clone(), UTTERANCE);

    let speech = Arc::new(SpeechCoordinator::new(Some(remote.clone()), sink, device.clone()));
    Rig {
        speech,
        audible,
        remote,
        device,
    }
}

fn request(text: &str, priority: Priority) -> SpeechRequest {
    SpeechRequest::new(text, &VoiceSettings::default(), priority)
}

fn spawn_speak(
    speech: &Arc<SpeechCoordinator>,
    text: &str,
    priority: Priority,
) -> tokio::task::JoinHandle<lookout::Result<SpeechOutcome>> {
    let speech = speech.clone();
    let request = request(text, priority);
    tokio::spawn(async move { speech.speak(request).await })
}

#[tokio::test(start_paused = true)]
async fn test_remote_audio_is_played() {
    let rig = rig(RemoteBehavior::Audio);

    let outcome = rig.speech.speak(request("The door is open.", Priority::Normal)).await.unwrap();

    assert_eq!(outcome, SpeechOutcome::Completed);
    assert_eq!(rig.remote.calls(), 1);
    assert_eq!(rig.device.calls(), 0);
    assert_eq!(rig.audible.finished(), vec!["The door is open.".to_string()]);
    assert!(!rig.speech.is_speaking());
}

#[tokio::test(start_paused = true)]
async fn test_normal_requests_never_overlap() {
    let rig = rig(RemoteBehavior::Audio);

    let first = spawn_speak(&rig.speech, "First description.", Priority::Normal);
    let second = spawn_speak(&rig.speech, "Second description.", Priority::Normal);

    assert_eq!(first.await.unwrap().unwrap(), SpeechOutcome::Completed);
    assert_eq!(second.await.unwrap().unwrap(), SpeechOutcome::Completed);

    assert_eq!(rig.audible.peak(), 1);
    assert_eq!(rig.audible.finished().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_preempts_active_speech() {
    let rig = rig(RemoteBehavior::Audio);

    let description = spawn_speak(&rig.speech, "A long description of the room.", Priority::Normal);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rig.speech.is_speaking());

    let warning = rig
        .speech
        .speak(request("Rate limited, retrying soon.", Priority::High))
        .await
        .unwrap();

    assert_eq!(warning, SpeechOutcome::Completed);
    assert_eq!(description.await.unwrap().unwrap(), SpeechOutcome::Cancelled);
    assert_eq!(rig.audible.peak(), 1);
    assert_eq!(rig.audible.finished(), vec!["Rate limited, retrying soon.".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_speech_end_listener_fires_once() {
    let rig = rig(RemoteBehavior::Audio);
    let fired = Arc::new(AtomicUsize::new(0));

    let active = spawn_speak(&rig.speech, "Describing the scene.", Priority::Normal);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let counter = fired.clone();
    rig.speech.on_speech_end(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    active.await.unwrap().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    rig.speech.speak(request("Another description.", Priority::Normal)).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_all_stops_everything_and_drops_listeners() {
    let rig = rig(RemoteBehavior::Audio);
    let fired = Arc::new(AtomicUsize::new(0));

    let active = spawn_speak(&rig.speech, "Active description.", Priority::Normal);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let queued = spawn_speak(&rig.speech, "Queued description.", Priority::Normal);
    settle().await;

    let counter = fired.clone();
    rig.speech.on_speech_end(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    rig.speech.cancel_all();

    assert_eq!(active.await.unwrap().unwrap(), SpeechOutcome::Cancelled);
    assert_eq!(queued.await.unwrap().unwrap(), SpeechOutcome::Cancelled);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!rig.speech.is_speaking());
    assert!(rig.audible.finished().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_falls_back_to_device() {
    let rig = rig(RemoteBehavior::Fail);

    let outcome = rig.speech.speak(request("The light is green.", Priority::Normal)).await.unwrap();

    assert_eq!(outcome, SpeechOutcome::Completed);
    assert_eq!(rig.remote.calls(), 1);
    assert_eq!(rig.device.calls(), 1);
    assert_eq!(rig.audible.finished(), vec!["The light is green.".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_service_fallback_indicator_uses_device() {
    let rig = rig(RemoteBehavior::UseFallback);

    rig.speech.speak(request("The light is green.", Priority::Normal)).await.unwrap();

    assert_eq!(rig.remote.calls(), 1);
    assert_eq!(rig.device.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_device_preference_skips_remote() {
    let rig = rig(RemoteBehavior::Audio);
    let settings = VoiceSettings {
        backend: SynthesisBackend::Device,
        ..VoiceSettings::default()
    };

    rig.speech
        .speak(SpeechRequest::new("A staircase to your right.", &settings, Priority::Normal))
        .await
        .unwrap();

    assert_eq!(rig.remote.calls(), 0);
    assert_eq!(rig.device.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_short_text_goes_to_device() {
    let rig = rig(RemoteBehavior::Audio);

    rig.speech.speak(request("Stop.", Priority::High)).await.unwrap();

    assert_eq!(rig.remote.calls(), 0);
    assert_eq!(rig.device.calls(), 1);
}

#[tokio::test]
async fn test_empty_text_is_rejected() {
    let rig = rig(RemoteBehavior::Audio);

    let err = rig.speech.speak(request("   ", Priority::Normal)).await.unwrap_err();
    assert!(matches!(err, Error::Speech(_)));
    assert!(!rig.speech.is_speaking());
}

#[tokio::test]
async fn test_unavailable_device_is_an_error() {
    let audible = Arc::new(Audible::default());
    let speech = SpeechCoordinator::new(
        None,
        FakeSink::new(audible.clone(), UTTERANCE),
        FakeDevice::unavailable(audible),
    );

    let err = speech
        .speak(request("Nothing can say this.", Priority::Normal))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SynthesisUnavailable(_)));
    assert!(!speech.is_speaking());
}

//! Whole calls run in-process: the real coordinator, simulated peer
//! transports and tone generators standing in for microphones.

use std::f32::consts::PI;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use parley_media::sim::{SimNetwork, ToneDevice};
use parley_media::{
    DeviceError, RecordingConfig, RecordingSink, RecordingStatus, RetryPolicy, SinkError,
    TrackKind,
};
use parley_server::{Coordinator, CoordinatorConfig, RecordingStore};
use parley_shared::{
    CallError, CallId, EndReason, LeaveReason, NegotiationState, Role, RoomId, UserId,
};

use crate::controller::{CallController, CallHandle, CallServices, ControllerConfig};
use crate::error::ClientError;
use crate::events::CallEvent;
use crate::state::CallState;

const RATE: u32 = 8_000;

#[derive(Default)]
struct MemorySink {
    uploads: Mutex<Vec<(CallId, Duration, Bytes)>>,
    unreachable: AtomicBool,
}

#[async_trait]
impl RecordingSink for MemorySink {
    async fn upload(
        &self,
        call_id: &CallId,
        offset: Duration,
        artifact: Bytes,
    ) -> Result<String, SinkError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SinkError::Unreachable("storage offline".to_string()));
        }
        self.uploads.lock().unwrap().push((*call_id, offset, artifact));
        Ok(format!("mem://{call_id}"))
    }
}

struct World {
    coordinator: Coordinator,
    network: SimNetwork,
    sink: Arc<MemorySink>,
    room: RoomId,
}

struct Member {
    id: UserId,
    call: CallHandle,
    events: broadcast::Receiver<CallEvent>,
    device: Arc<ToneDevice>,
    task: JoinHandle<()>,
}

impl World {
    async fn new() -> Self {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let room = RoomId::new("standup");
        coordinator.open_room(room.clone()).await;
        Self {
            coordinator,
            network: SimNetwork::new(),
            sink: Arc::new(MemorySink::default()),
            room,
        }
    }

    fn spawn(&self, name: &str, device: Arc<ToneDevice>, room: RoomId, with_video: bool) -> Member {
        let id = UserId::new(name);
        let mut config = ControllerConfig::new(id.clone(), room);
        config.with_video = with_video;
        config.recording_config = RecordingConfig {
            sample_rate: RATE,
            chunk_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        };

        let services = CallServices {
            signaling: Arc::new(self.coordinator.clone()),
            media: Arc::new(self.network.clone()),
            device: device.clone(),
            sink: self.sink.clone(),
        };
        let (call, task) = CallController::spawn(config, services);
        let events = call.subscribe();
        Member {
            id,
            call,
            events,
            device,
            task,
        }
    }

    async fn join(&self, name: &str, frequency: f32, with_video: bool) -> Member {
        let device = Arc::new(ToneDevice::with_sample_rate(frequency, RATE));
        let member = self.spawn(name, device, self.room.clone(), with_video);
        member.call.join().await.unwrap();
        settle().await;
        member
    }

    fn uploads(&self) -> Vec<(CallId, Duration, Bytes)> {
        self.sink.uploads.lock().unwrap().clone()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    within: Duration,
    matches: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    let found = tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("controller stopped"),
            }
        }
    })
    .await;
    found.expect("expected event not seen")
}

fn removals(events: Vec<CallEvent>) -> Vec<CallEvent> {
    events
        .into_iter()
        .filter(|e| matches!(e, CallEvent::PeerRemoved { .. }))
        .collect()
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    let reader = hound::WavReader::new(Cursor::new(bytes.to_vec())).unwrap();
    assert_eq!(reader.spec().sample_rate, RATE);
    reader
        .into_samples::<i16>()
        .map(|s| s.unwrap() as f32 / i16::MAX as f32)
        .collect()
}

/// Normalised energy of `freq` in `samples` (Goertzel).
fn goertzel(samples: &[f32], freq: f32) -> f32 {
    let k = 2.0 * (2.0 * PI * freq / RATE as f32).cos();
    let (mut s1, mut s2) = (0.0f32, 0.0f32);
    for &x in samples {
        let s0 = x + k * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    (s1 * s1 + s2 * s2 - k * s1 * s2).sqrt() / samples.len() as f32
}

fn sample_at(offset: Duration) -> usize {
    (offset.as_secs_f64() * RATE as f64) as usize
}

#[tokio::test(start_paused = true)]
async fn test_four_participants_form_full_mesh() {
    let world = World::new().await;
    let mut members = Vec::new();
    for (i, freq) in [440.0, 550.0, 660.0, 770.0].into_iter().enumerate() {
        members.push(world.join(&format!("u{}", i + 1), freq, false).await);
    }
    settle().await;

    for member in &members {
        let snapshot = member.call.snapshot().await.unwrap();
        assert_eq!(snapshot.state, CallState::Active);
        assert_eq!(snapshot.linked_peers(), 3, "{} is not fully linked", member.id);
        assert!(
            snapshot
                .peers
                .iter()
                .all(|p| p.link == Some(NegotiationState::Connected)),
            "{} has an unconnected link",
            member.id
        );
        assert_eq!(snapshot.host, Some(UserId::new("u1")));
    }
    for a in &members {
        for b in &members {
            if a.id != b.id {
                assert!(world.network.is_linked(&a.id, &b.id));
            }
        }
    }

    let first = members[0].call.snapshot().await.unwrap();
    assert_eq!(first.role, Some(Role::Host));
    assert!(first.recording);
    let last = members[3].call.snapshot().await.unwrap();
    assert_eq!(last.role, Some(Role::Participant));
    assert!(!last.recording);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_leave_and_silent_drop_each_remove_once() {
    let world = World::new().await;
    let mut u1 = world.join("u1", 440.0, false).await;
    let u2 = world.join("u2", 550.0, false).await;
    let mut u3 = world.join("u3", 660.0, false).await;
    drain(&mut u1.events);
    drain(&mut u3.events);

    assert_eq!(u2.call.leave().await.unwrap(), None);
    settle().await;

    let expected = CallEvent::PeerRemoved {
        user_id: u2.id.clone(),
        reason: LeaveReason::Left,
    };
    assert_eq!(removals(drain(&mut u1.events)), vec![expected.clone()]);
    assert_eq!(removals(drain(&mut u3.events)), vec![expected]);
    assert_eq!(world.network.closed_count(&u1.id, &u2.id), 1);
    assert_eq!(world.network.closed_count(&u2.id, &u1.id), 1);
    assert_eq!(u2.device.open_tracks(), 0);

    // u3 vanishes without a word.
    u3.task.abort();
    world.network.sever(&u1.id, &u3.id);

    let removed = wait_for(&mut u1.events, Duration::from_secs(30), |e| {
        matches!(e, CallEvent::PeerRemoved { .. })
    })
    .await;
    assert_eq!(
        removed,
        CallEvent::PeerRemoved {
            user_id: u3.id.clone(),
            reason: LeaveReason::TimedOut,
        }
    );

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(removals(drain(&mut u1.events)).is_empty());
    assert_eq!(world.network.closed_count(&u1.id, &u3.id), 1);

    let snapshot = u1.call.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Active);
    assert!(snapshot.peers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_screen_share_swaps_video_and_keeps_audio_track() {
    let world = World::new().await;
    let u1 = world.join("u1", 440.0, true).await;
    let u2 = world.join("u2", 880.0, false).await;
    settle().await;

    let before = u1.call.snapshot().await.unwrap();
    let audio = before.peer(&u2.id).unwrap().audio_track;
    assert!(audio.is_some());
    let camera = world.network.video_track(&u1.id, &u2.id);
    assert!(camera.is_some());
    let offers = world.network.offer_count(&u1.id, &u2.id);

    let media = u1.call.start_screen_share().await.unwrap();
    assert!(media.screen_sharing);
    settle().await;

    let screen = world.network.video_track(&u1.id, &u2.id);
    assert!(screen.is_some());
    assert_ne!(screen, camera);
    let during = u1.call.snapshot().await.unwrap();
    let peer = during.peer(&u2.id).unwrap();
    assert_eq!(peer.audio_track, audio);
    assert_eq!(peer.link, Some(NegotiationState::Connected));

    let media = u1.call.stop_screen_share().await.unwrap();
    assert!(!media.screen_sharing);
    assert!(media.video_enabled);
    settle().await;

    assert_eq!(world.network.video_track(&u1.id, &u2.id), camera);
    let after = u1.call.snapshot().await.unwrap();
    assert_eq!(after.peer(&u2.id).unwrap().audio_track, audio);
    assert_eq!(world.network.offer_count(&u1.id, &u2.id), offers);
}

#[tokio::test(start_paused = true)]
async fn test_mute_reaches_peers_promptly() {
    let world = World::new().await;
    let u1 = world.join("u1", 440.0, false).await;
    let mut u2 = world.join("u2", 880.0, false).await;
    drain(&mut u2.events);
    let offers = world.network.offer_count(&u1.id, &u2.id);

    let sent = Instant::now();
    let media = u1.call.toggle_audio().await.unwrap();
    assert!(!media.audio_enabled);

    let seen = wait_for(&mut u2.events, Duration::from_secs(1), |e| {
        matches!(e, CallEvent::RemoteMediaChanged { .. })
    })
    .await;
    assert!(sent.elapsed() < Duration::from_millis(100));
    assert_eq!(
        seen,
        CallEvent::RemoteMediaChanged {
            user_id: u1.id.clone(),
            media,
        }
    );

    let view = u2.call.snapshot().await.unwrap();
    assert!(!view.peer(&u1.id).unwrap().media.audio_enabled);
    assert_eq!(world.network.offer_count(&u1.id, &u2.id), offers);

    let media = u1.call.toggle_audio().await.unwrap();
    assert!(media.audio_enabled);
}

#[tokio::test(start_paused = true)]
async fn test_end_is_host_only_and_idempotent() {
    let world = World::new().await;
    let u1 = world.join("u1", 440.0, false).await;
    let mut u2 = world.join("u2", 880.0, false).await;

    let err = u2.call.end().await.unwrap_err();
    assert!(matches!(err, ClientError::Call(CallError::Forbidden(_))));
    assert_eq!(u1.call.snapshot().await.unwrap().state, CallState::Active);
    assert_eq!(u2.call.snapshot().await.unwrap().state, CallState::Active);

    let status = u1.call.end().await.unwrap();
    assert!(matches!(status, Some(RecordingStatus::Uploaded { .. })));
    assert_eq!(u1.call.end().await.unwrap(), None);
    assert_eq!(u1.call.leave().await.unwrap(), None);

    let ended = wait_for(&mut u2.events, Duration::from_secs(1), |e| {
        matches!(e, CallEvent::CallEnded(_))
    })
    .await;
    assert_eq!(ended, CallEvent::CallEnded(EndReason::EndedByHost));
    assert_eq!(u2.call.snapshot().await.unwrap().state, CallState::Ended);
    assert_eq!(u2.call.leave().await.unwrap(), None);

    assert_eq!(u1.device.open_tracks(), 0);
    assert_eq!(u2.device.open_tracks(), 0);
    assert_eq!(world.uploads().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_failure_rolls_back() {
    let world = World::new().await;
    let device = Arc::new(ToneDevice::with_sample_rate(440.0, RATE));
    let member = world.spawn("u1", device, RoomId::new("nowhere"), true);

    let err = member.call.join().await.unwrap_err();
    assert_eq!(
        err,
        ClientError::Call(CallError::RoomNotFound(RoomId::new("nowhere")))
    );
    assert_eq!(member.call.snapshot().await.unwrap().state, CallState::Idle);
    assert_eq!(member.device.open_tracks(), 0);
    assert_eq!(
        member.call.toggle_audio().await.unwrap_err(),
        ClientError::InvalidState(CallState::Idle)
    );
}

#[tokio::test(start_paused = true)]
async fn test_lost_devices_degrade_instead_of_failing() {
    let world = World::new().await;
    let device = Arc::new(ToneDevice::with_sample_rate(440.0, RATE));
    device.deny(TrackKind::Camera);
    let mut u1 = world.spawn("u1", device, world.room.clone(), true);
    u1.call.join().await.unwrap();

    let lost: Vec<_> = drain(&mut u1.events)
        .into_iter()
        .filter(|e| matches!(e, CallEvent::CapabilityLost { .. }))
        .collect();
    assert_eq!(
        lost,
        vec![CallEvent::CapabilityLost {
            kind: TrackKind::Camera,
            error: DeviceError::PermissionDenied(TrackKind::Camera).to_string(),
        }]
    );
    let snapshot = u1.call.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Active);
    assert!(snapshot.media.audio_enabled);
    assert!(!snapshot.media.video_enabled);

    let mut u2 = world.join("u2", 880.0, false).await;
    drain(&mut u2.events);

    u1.device.unplug(TrackKind::Audio);
    wait_for(&mut u1.events, Duration::from_secs(1), |e| {
        matches!(e, CallEvent::CapabilityLost { kind: TrackKind::Audio, .. })
    })
    .await;
    let seen = wait_for(&mut u2.events, Duration::from_secs(1), |e| {
        matches!(e, CallEvent::RemoteMediaChanged { .. })
    })
    .await;
    let CallEvent::RemoteMediaChanged { media, .. } = seen else {
        unreachable!()
    };
    assert!(!media.audio_enabled);

    let snapshot = u1.call.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Active);
    assert_eq!(
        snapshot.peer(&u2.id).unwrap().link,
        Some(NegotiationState::Connected)
    );
    assert_eq!(
        u1.call.toggle_audio().await.unwrap_err(),
        ClientError::Device(DeviceError::NoDevice(TrackKind::Audio))
    );
}

#[tokio::test(start_paused = true)]
async fn test_host_departure_promotes_longest_present() {
    let world = World::new().await;
    let u1 = world.join("u1", 440.0, false).await;
    let mut u2 = world.join("u2", 550.0, false).await;
    let u3 = world.join("u3", 660.0, false).await;

    let status = u1.call.leave().await.unwrap();
    assert!(matches!(status, Some(RecordingStatus::Uploaded { .. })));

    let promoted = wait_for(&mut u2.events, Duration::from_secs(1), |e| {
        matches!(e, CallEvent::HostChanged(_))
    })
    .await;
    assert_eq!(promoted, CallEvent::HostChanged(u2.id.clone()));

    let view = u2.call.snapshot().await.unwrap();
    assert_eq!(view.role, Some(Role::Host));
    assert!(view.recording, "the new host takes over the recording");
    assert_eq!(u3.call.snapshot().await.unwrap().host, Some(u2.id.clone()));
}

#[tokio::test(start_paused = true)]
async fn test_call_survives_toggles_drop_and_records_until_end() {
    let world = World::new().await;
    let start = Instant::now();
    let mut u1 = world.join("u1", 440.0, true).await;
    let mut u2 = world.join("u2", 880.0, false).await;
    settle().await;
    drain(&mut u2.events);

    // Camera off and on again: one media-state update each, no renegotiation.
    let offers = world.network.offer_count(&u1.id, &u2.id);
    let off = u1.call.toggle_video().await.unwrap();
    assert!(!off.video_enabled);
    let on = u1.call.toggle_video().await.unwrap();
    assert!(on.video_enabled);
    settle().await;

    let changes: Vec<_> = drain(&mut u2.events)
        .into_iter()
        .filter(|e| matches!(e, CallEvent::RemoteMediaChanged { .. }))
        .collect();
    assert_eq!(
        changes,
        vec![
            CallEvent::RemoteMediaChanged {
                user_id: u1.id.clone(),
                media: off,
            },
            CallEvent::RemoteMediaChanged {
                user_id: u1.id.clone(),
                media: on,
            },
        ]
    );
    assert_eq!(world.network.offer_count(&u1.id, &u2.id), offers);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let dropped_at = start.elapsed();
    u2.task.abort();
    world.network.sever(&u1.id, &u2.id);

    let removed = wait_for(&mut u1.events, Duration::from_secs(30), |e| {
        matches!(e, CallEvent::PeerRemoved { .. })
    })
    .await;
    assert_eq!(
        removed,
        CallEvent::PeerRemoved {
            user_id: u2.id.clone(),
            reason: LeaveReason::TimedOut,
        }
    );
    assert!(start.elapsed() - dropped_at >= Duration::from_secs(10));
    assert_eq!(u1.call.snapshot().await.unwrap().state, CallState::Active);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let status = u1.call.end().await.unwrap();
    assert!(matches!(status, Some(RecordingStatus::Uploaded { .. })));

    let uploads = world.uploads();
    assert_eq!(uploads.len(), 1);
    let samples = decode(&uploads[0].2);

    let both = &samples[sample_at(Duration::from_millis(1500))
        ..sample_at(dropped_at - Duration::from_millis(500))];
    assert!(goertzel(both, 440.0) > 0.02, "local audio missing");
    assert!(goertzel(both, 880.0) > 0.02, "remote audio missing");

    let alone = &samples[sample_at(dropped_at + Duration::from_secs(1))
        ..sample_at(dropped_at + Duration::from_secs(9))];
    assert!(goertzel(alone, 440.0) > 0.02);
    assert!(goertzel(alone, 880.0) < 0.005);
}

#[tokio::test(start_paused = true)]
async fn test_recording_spans_the_call_across_host_changes() {
    let world = World::new().await;
    let start = Instant::now();
    let u1 = world.join("u1", 440.0, false).await;
    let mut u2 = world.join("u2", 550.0, false).await;
    let mut u3 = world.join("u3", 660.0, false).await;
    settle().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let first_left = start.elapsed();
    assert!(matches!(
        u1.call.leave().await.unwrap(),
        Some(RecordingStatus::Uploaded { .. })
    ));
    wait_for(&mut u2.events, Duration::from_secs(1), |e| {
        matches!(e, CallEvent::HostChanged(_))
    })
    .await;
    assert!(u2.call.snapshot().await.unwrap().recording);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let second_left = start.elapsed();
    assert!(matches!(
        u2.call.leave().await.unwrap(),
        Some(RecordingStatus::Uploaded { .. })
    ));
    let u3_id = u3.id.clone();
    wait_for(&mut u3.events, Duration::from_secs(1), |e| {
        *e == CallEvent::HostChanged(u3_id.clone())
    })
    .await;
    assert!(u3.call.snapshot().await.unwrap().recording);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let ended = start.elapsed();
    assert!(matches!(
        u3.call.leave().await.unwrap(),
        Some(RecordingStatus::Uploaded { .. })
    ));

    let uploads = world.uploads();
    assert_eq!(uploads.len(), 3);
    assert!(uploads.iter().all(|(call, _, _)| *call == uploads[0].0));
    let offsets: Vec<_> = uploads.iter().map(|(_, offset, _)| *offset).collect();
    assert!(offsets[0] < Duration::from_millis(100));
    assert!(offsets[1].abs_diff(first_left) < Duration::from_millis(200));
    assert!(offsets[2].abs_diff(second_left) < Duration::from_millis(200));

    let dir = tempfile::tempdir().unwrap();
    let store = RecordingStore::new(dir.path().to_path_buf(), 16 * 1024 * 1024)
        .await
        .unwrap();
    for (call, offset, artifact) in &uploads {
        store.put(call, *offset, artifact).await.unwrap();
    }
    let samples = decode(&store.get(&uploads[0].0).await.unwrap());

    let length = Duration::from_secs_f64(samples.len() as f64 / RATE as f64);
    assert!(
        length.abs_diff(ended) < Duration::from_millis(600),
        "recording covers {length:?} of a {ended:?} call"
    );

    let everyone = &samples[sample_at(first_left - Duration::from_millis(1800))
        ..sample_at(first_left - Duration::from_millis(300))];
    for freq in [440.0, 550.0, 660.0] {
        assert!(goertzel(everyone, freq) > 0.02, "{freq} Hz missing early on");
    }

    let after_first = &samples[sample_at(first_left + Duration::from_secs(1))
        ..sample_at(second_left - Duration::from_millis(500))];
    assert!(goertzel(after_first, 550.0) > 0.02);
    assert!(goertzel(after_first, 660.0) > 0.02);
    assert!(goertzel(after_first, 440.0) < 0.005);

    let last_alone = &samples[sample_at(second_left + Duration::from_millis(500))
        ..sample_at(ended - Duration::from_millis(500))];
    assert!(goertzel(last_alone, 660.0) > 0.02);
    assert!(goertzel(last_alone, 550.0) < 0.005);
}

#[tokio::test(start_paused = true)]
async fn test_failed_pair_is_isolated() {
    let world = World::new().await;
    let mut u1 = world.join("u1", 440.0, false).await;
    let mut u2 = world.join("u2", 550.0, false).await;
    let u3 = world.join("u3", 660.0, false).await;
    settle().await;
    drain(&mut u1.events);
    drain(&mut u2.events);

    world.network.sever(&u1.id, &u3.id);

    let failed = wait_for(&mut u1.events, Duration::from_secs(30), |e| {
        matches!(e, CallEvent::PeerFailed(_))
    })
    .await;
    assert_eq!(failed, CallEvent::PeerFailed(u3.id.clone()));

    let view = u1.call.snapshot().await.unwrap();
    assert_eq!(view.state, CallState::Active);
    assert_eq!(
        view.peer(&u2.id).unwrap().link,
        Some(NegotiationState::Connected)
    );
    let unreachable = view.peer(&u3.id).expect("u3 stays on the roster");
    assert_eq!(unreachable.link, None);

    let other = u2.call.snapshot().await.unwrap();
    assert!(other
        .peers
        .iter()
        .all(|p| p.link == Some(NegotiationState::Connected)));
    assert!(!drain(&mut u2.events)
        .iter()
        .any(|e| matches!(e, CallEvent::PeerFailed(_) | CallEvent::PeerRemoved { .. })));
    assert_eq!(u3.call.snapshot().await.unwrap().state, CallState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_severed_link_recovers_after_heal() {
    let world = World::new().await;
    let mut u1 = world.join("u1", 440.0, false).await;
    let u2 = world.join("u2", 550.0, false).await;
    settle().await;
    drain(&mut u1.events);
    let offers = world.network.offer_count(&u1.id, &u2.id);

    world.network.sever(&u1.id, &u2.id);
    world.network.heal(&u1.id, &u2.id);

    let reconnected = wait_for(&mut u1.events, Duration::from_secs(5), |e| {
        matches!(e, CallEvent::PeerConnected(_) | CallEvent::PeerFailed(_))
    })
    .await;
    assert_eq!(reconnected, CallEvent::PeerConnected(u2.id.clone()));
    settle().await;

    assert_eq!(world.network.offer_count(&u1.id, &u2.id), offers + 1);
    assert_eq!(world.network.closed_count(&u1.id, &u2.id), 0);
    for (member, remote) in [(&u1, &u2.id), (&u2, &u1.id)] {
        let view = member.call.snapshot().await.unwrap();
        assert_eq!(
            view.peer(remote).unwrap().link,
            Some(NegotiationState::Connected)
        );
    }
    assert!(!drain(&mut u1.events)
        .iter()
        .any(|e| matches!(e, CallEvent::PeerFailed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_departure_is_announced_before_the_upload_settles() {
    let world = World::new().await;
    let u1 = world.join("u1", 440.0, false).await;
    let mut u2 = world.join("u2", 550.0, false).await;
    drain(&mut u2.events);
    world.sink.unreachable.store(true, Ordering::SeqCst);

    let leaving = tokio::spawn({
        let call = u1.call.clone();
        async move { call.leave().await }
    });

    let promoted = wait_for(&mut u2.events, Duration::from_millis(200), |e| {
        matches!(e, CallEvent::HostChanged(_))
    })
    .await;
    assert_eq!(promoted, CallEvent::HostChanged(u2.id.clone()));
    assert!(!leaving.is_finished(), "upload retries should still be running");

    let status = leaving.await.unwrap().unwrap();
    assert!(matches!(
        status,
        Some(RecordingStatus::Unavailable { attempts: 5, .. })
    ));
    assert!(world.uploads().is_empty());
}

//! Session behaviour against an in-memory connection.
//!
//! Every test runs on a paused clock and plays the relay side of the
//! socket through a [`ChannelConnector`], so frame timing is exact.

use futures_util::future::BoxFuture;
use roomplan_collab::{
    ChannelConnector, CollabConfig, CollabOptions, Collaboration, Connection, ConnectionState,
    Connector, Frame, Point, RemoteEnd, RoomSnapshot, TransportError, User,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

const ROOM: &str = "living-room";

/// Host-side state the callbacks read and write.
#[derive(Clone, Default)]
struct Host {
    room: Arc<Mutex<RoomSnapshot>>,
    updates: Arc<Mutex<Vec<RoomSnapshot>>>,
    redraws: Arc<AtomicUsize>,
}

impl Host {
    fn options(&self, user: User, connector: Arc<dyn Connector>) -> CollabOptions {
        let room = self.room.clone();
        let updates = self.updates.clone();
        let redraws = self.redraws.clone();
        let current = self.room.clone();
        CollabOptions::new(user)
            .connector(connector)
            .on_room_update(move |merged| {
                *room.lock().unwrap() = merged.clone();
                updates.lock().unwrap().push(merged);
            })
            .on_redraw(move || {
                redraws.fetch_add(1, Ordering::SeqCst);
            })
            .get_room_obj(move || current.lock().unwrap().clone())
    }

    fn last_update(&self) -> Option<RoomSnapshot> {
        self.updates.lock().unwrap().last().cloned()
    }
}

async fn accept(accepted: &mut mpsc::UnboundedReceiver<RemoteEnd>) -> RemoteEnd {
    timeout(Duration::from_secs(10), accepted.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

async fn next_frame(remote: &mut RemoteEnd) -> Frame {
    let bytes = timeout(Duration::from_secs(1), remote.from_client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed");
    Frame::decode(&bytes).unwrap()
}

/// Consume the frames every session sends right after opening.
async fn handshake(remote: &mut RemoteEnd) {
    assert_eq!(next_frame(remote).await, Frame::SyncRequest);
    assert!(matches!(next_frame(remote).await, Frame::AwarenessUpdate(_)));
    assert_eq!(next_frame(remote).await, Frame::AwarenessRequest);
}

fn drain(remote: &mut RemoteEnd) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(bytes) = remote.from_client.try_recv() {
        frames.push(Frame::decode(&bytes).unwrap());
    }
    frames
}

fn updates(frames: &[Frame]) -> Vec<Value> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Update(payload) => Some(serde_json::from_slice(payload).unwrap()),
            _ => None,
        })
        .collect()
}

fn send(remote: &RemoteEnd, frame: Frame) {
    remote.to_client.send(frame.encode()).unwrap();
}

fn snapshot(room: Value, items: Value) -> Vec<u8> {
    let doc = json!({
        "roomData": room,
        "items": items,
        "meta": { "lastUpdated": 1, "lastUpdatedBy": "remote" },
    });
    serde_json::to_vec(&doc).unwrap()
}

fn presence(id: &str, name: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({ "user": { "id": id, "name": name } })).unwrap()
}

async fn connected_session(host: &Host, user: User) -> (Collaboration, RemoteEnd) {
    let (connector, mut accepted) = ChannelConnector::new();
    let mut collab = Collaboration::new();
    collab.enable(ROOM, host.options(user, Arc::new(connector))).unwrap();
    let mut remote = accept(&mut accepted).await;
    assert_eq!(remote.url, format!("ws://localhost:8080/ws/{ROOM}"));
    handshake(&mut remote).await;
    assert_eq!(collab.status(), ConnectionState::Connected);
    (collab, remote)
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_syncs_sends_one_update_with_last_state() {
    let host = Host::default();
    let (collab, mut remote) = connected_session(&host, User::new("u1", "Ada")).await;

    for version in 0..10 {
        collab.sync(RoomSnapshot::new().with_field("version", json!(version)));
        sleep(Duration::from_millis(20)).await;
    }
    sleep(Duration::from_millis(300)).await;

    let sent = updates(&drain(&mut remote));
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["roomData"]["version"], json!(9));
    assert_eq!(sent[0]["meta"]["lastUpdatedBy"], json!("u1"));
}

#[tokio::test(start_paused = true)]
async fn test_identical_syncs_push_once() {
    let host = Host::default();
    let (collab, mut remote) = connected_session(&host, User::new("u1", "Ada")).await;
    let room = RoomSnapshot::new()
        .with_field("width", json!(400))
        .with_category("chairs", vec![json!({ "id": "c1" })]);

    collab.sync(room.clone());
    sleep(Duration::from_millis(300)).await;
    collab.sync(room);
    sleep(Duration::from_millis(300)).await;

    assert_eq!(updates(&drain(&mut remote)).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_fields_do_not_trigger_push() {
    let host = Host::default();
    let (collab, mut remote) = connected_session(&host, User::new("u1", "Ada")).await;
    let room = RoomSnapshot::new().with_field("width", json!(400));

    collab.sync(room.clone());
    sleep(Duration::from_millis(300)).await;
    collab.sync(room.with_field("_hover", json!("c1")));
    sleep(Duration::from_millis(300)).await;

    let sent = updates(&drain(&mut remote));
    assert_eq!(sent.len(), 1);
    assert!(sent[0]["roomData"].get("_hover").is_none());
}

struct CountingConnector {
    inner: ChannelConnector,
    calls: Arc<Mutex<Vec<Instant>>>,
}

impl Connector for CountingConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, TransportError>> {
        self.calls.lock().unwrap().push(Instant::now());
        self.inner.connect(url)
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_and_budget() {
    let (inner, _accepted) = ChannelConnector::new();
    inner.set_refusing(true);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let connector = CountingConnector {
        inner,
        calls: calls.clone(),
    };

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = statuses.clone();
    let options = CollabOptions::new(User::new("u1", "Ada"))
        .connector(Arc::new(connector))
        .on_status_change(move |s| seen.lock().unwrap().push(s));

    let mut collab = Collaboration::new();
    collab.enable(ROOM, options).unwrap();
    sleep(Duration::from_secs(200)).await;

    let calls = calls.lock().unwrap().clone();
    // Initial attempt plus ten retries.
    assert_eq!(calls.len(), 11);
    let expected_secs = [3, 6, 9, 12, 15, 15, 15, 15, 15, 15];
    for (i, pair) in calls.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        let expected = Duration::from_secs(expected_secs[i]);
        assert!(
            gap >= expected && gap < expected + Duration::from_millis(50),
            "retry {}: waited {gap:?}, expected {expected:?}",
            i + 1
        );
    }

    assert_eq!(collab.status(), ConnectionState::Disconnected);
    let statuses = statuses.lock().unwrap().clone();
    assert_eq!(statuses.first(), Some(&ConnectionState::Connecting));
    assert_eq!(statuses.last(), Some(&ConnectionState::Disconnected));
    assert!(!statuses.contains(&ConnectionState::Connected));

    // Budget spent: nothing else is scheduled.
    sleep(Duration::from_secs(600)).await;
    assert_eq!(collab.status(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_drop_and_clears_peers() {
    let host = Host::default();
    let (connector, mut accepted) = ChannelConnector::new();
    let mut collab = Collaboration::new();
    collab
        .enable(ROOM, host.options(User::new("u1", "Ada"), Arc::new(connector)))
        .unwrap();
    let mut remote = accept(&mut accepted).await;
    handshake(&mut remote).await;

    send(&remote, Frame::AwarenessUpdate(presence("u2", "Grace")));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(collab.users().len(), 2);

    let dropped_at = Instant::now();
    drop(remote);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(collab.status(), ConnectionState::Connecting);
    assert_eq!(collab.users().len(), 1);

    let mut remote = accept(&mut accepted).await;
    assert!(dropped_at.elapsed() >= Duration::from_secs(3));
    handshake(&mut remote).await;
    assert_eq!(collab.status(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_remote_update_is_not_echoed() {
    let host = Host::default();
    let collab = Arc::new(Mutex::new(Collaboration::new()));
    let (connector, mut accepted) = ChannelConnector::new();

    // Host that answers every room update by syncing it straight back.
    let echo = collab.clone();
    let options = host
        .options(User::new("u1", "Ada"), Arc::new(connector))
        .on_room_update(move |merged| echo.lock().unwrap().sync(merged));
    collab.lock().unwrap().enable(ROOM, options).unwrap();

    let mut remote = accept(&mut accepted).await;
    handshake(&mut remote).await;

    let payload = snapshot(json!({ "name": "Studio" }), json!({ "tables": [{ "id": "t1" }] }));
    send(&remote, Frame::Update(payload));
    sleep(Duration::from_millis(500)).await;
    assert!(updates(&drain(&mut remote)).is_empty());

    // Syncing the merged room later is also a no-op.
    let merged = RoomSnapshot::new()
        .with_field("name", json!("Studio"))
        .with_category("tables", vec![json!({ "id": "t1" })]);
    collab.lock().unwrap().sync(merged);
    sleep(Duration::from_millis(500)).await;
    assert!(updates(&drain(&mut remote)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remote_category_replaces_local_list() {
    let host = Host::default();
    let local = RoomSnapshot::new()
        .with_field("width", json!(400))
        .with_category("chairs", vec![json!({ "id": "y" }), json!({ "id": "z" })])
        .with_category("lamps", vec![json!({ "id": "l1" })]);
    *host.room.lock().unwrap() = local.clone();

    let (collab, mut remote) = connected_session(&host, User::new("u1", "Ada")).await;
    collab.sync(local);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(updates(&drain(&mut remote)).len(), 1);

    let payload = snapshot(
        json!({ "width": 400 }),
        json!({ "chairs": [{ "id": "x" }] }),
    );
    send(&remote, Frame::Update(payload));
    sleep(Duration::from_millis(10)).await;

    let merged = host.last_update().expect("host was not updated");
    assert_eq!(merged.items["chairs"], vec![json!({ "id": "x" })]);
    // Categories missing from the remote snapshot keep the host's value.
    assert_eq!(merged.items["lamps"], vec![json!({ "id": "l1" })]);
    assert_eq!(host.redraws.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_meta_only_change_skips_host() {
    let host = Host::default();
    let (_collab, remote) = connected_session(&host, User::new("u1", "Ada")).await;

    let payload = serde_json::to_vec(&json!({ "meta": { "lastUpdated": 5 } })).unwrap();
    send(&remote, Frame::Update(payload));
    sleep(Duration::from_millis(10)).await;

    assert!(host.last_update().is_none());
    assert_eq!(host.redraws.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped() {
    let host = Host::default();
    let (collab, mut remote) = connected_session(&host, User::new("u1", "Ada")).await;

    remote.to_client.send(Vec::new()).unwrap();
    remote.to_client.send(vec![42, 1, 2]).unwrap();
    send(&remote, Frame::Update(b"not json".to_vec()));
    send(&remote, Frame::AwarenessUpdate(b"{".to_vec()));
    sleep(Duration::from_millis(10)).await;

    assert_eq!(collab.status(), ConnectionState::Connected);
    assert!(host.last_update().is_none());
    assert_eq!(collab.users().len(), 1);

    // Still serving requests afterwards.
    send(&remote, Frame::AwarenessRequest);
    assert!(matches!(next_frame(&mut remote).await, Frame::AwarenessUpdate(_)));
}

#[tokio::test(start_paused = true)]
async fn test_sync_request_answered_with_full_state() {
    let host = Host::default();
    let (collab, mut remote) = connected_session(&host, User::new("u1", "Ada")).await;

    // Nothing to offer yet.
    send(&remote, Frame::SyncRequest);
    sleep(Duration::from_millis(10)).await;
    assert!(drain(&mut remote).is_empty());

    collab.sync(RoomSnapshot::new().with_field("width", json!(400)));
    sleep(Duration::from_millis(300)).await;
    drain(&mut remote);

    send(&remote, Frame::SyncRequest);
    let Frame::SyncState(payload) = next_frame(&mut remote).await else {
        panic!("expected SyncState");
    };
    let state: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(state["roomData"]["width"], json!(400));
    assert_eq!(state["meta"]["lastUpdatedBy"], json!("u1"));
}

#[tokio::test(start_paused = true)]
async fn test_silent_peers_are_pruned() {
    let host = Host::default();
    let config = CollabConfig::default();
    assert_eq!(config.awareness_refresh_interval_ms, 15_000);
    let (collab, remote) = connected_session(&host, User::new("local", "Me")).await;

    send(&remote, Frame::AwarenessUpdate(presence("a", "Ann")));
    send(&remote, Frame::AwarenessUpdate(presence("b", "Bob")));
    sleep(Duration::from_secs(16)).await;

    let ids: Vec<String> = collab.users().iter().map(|u| u.state.user.id.clone()).collect();
    assert_eq!(ids, ["local", "a", "b"]);

    send(&remote, Frame::AwarenessUpdate(presence("a", "Ann")));
    sleep(Duration::from_secs(15)).await;

    let users = collab.users();
    let ids: Vec<&str> = users.iter().map(|u| u.state.user.id.as_str()).collect();
    assert_eq!(ids, ["local", "a"]);
    assert!(users[0].is_local);
}

#[tokio::test(start_paused = true)]
async fn test_own_presence_is_ignored() {
    let host = Host::default();
    let (collab, remote) = connected_session(&host, User::new("u1", "Ada")).await;

    send(&remote, Frame::AwarenessUpdate(presence("u1", "Impostor")));
    sleep(Duration::from_millis(10)).await;

    let users = collab.users();
    assert_eq!(users.len(), 1);
    assert!(users[0].is_local);
    assert_eq!(users[0].state.user.name, "Ada");
}

#[tokio::test(start_paused = true)]
async fn test_cursor_updates_are_broadcast() {
    let host = Host::default();
    let (collab, mut remote) = connected_session(&host, User::new("u1", "Ada")).await;

    collab.update_cursor(Some(Point::new(12.5, 40.0)));
    collab.update_selection(vec!["c1".into()]);

    let Frame::AwarenessUpdate(first) = next_frame(&mut remote).await else {
        panic!("expected AwarenessUpdate");
    };
    let first: Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(first["cursor"], json!({ "x": 12.5, "y": 40.0 }));

    let Frame::AwarenessUpdate(second) = next_frame(&mut remote).await else {
        panic!("expected AwarenessUpdate");
    };
    let second: Value = serde_json::from_slice(&second).unwrap();
    assert_eq!(second["selection"], json!(["c1"]));
    // Earlier fields are kept.
    assert_eq!(second["cursor"], json!({ "x": 12.5, "y": 40.0 }));

    assert_eq!(collab.users()[0].state.selection, ["c1"]);
}

#[tokio::test(start_paused = true)]
async fn test_disable_closes_socket_and_stops_timers() {
    let host = Host::default();
    let (connector, mut accepted) = ChannelConnector::new();
    let mut collab = Collaboration::new();
    collab
        .enable(ROOM, host.options(User::new("u1", "Ada"), Arc::new(connector)))
        .unwrap();
    let mut remote = accept(&mut accepted).await;
    handshake(&mut remote).await;

    collab.sync(RoomSnapshot::new().with_field("width", json!(1)));
    collab.disable_and_wait().await;

    assert_eq!(remote.from_client.recv().await, None);
    assert!(!collab.is_enabled());
    assert_eq!(collab.status(), ConnectionState::Disconnected);

    sleep(Duration::from_secs(60)).await;
    assert!(accepted.try_recv().is_err(), "no reconnect after disable");
}

#[tokio::test(start_paused = true)]
async fn test_sessions_are_independent() {
    let host = Host::default();
    let (first, mut first_remote) = connected_session(&host, User::new("u1", "Ada")).await;
    let (second, mut second_remote) = connected_session(&host, User::new("u2", "Grace")).await;

    first.sync(RoomSnapshot::new().with_field("owner", json!("u1")));
    sleep(Duration::from_millis(300)).await;

    assert_eq!(updates(&drain(&mut first_remote)).len(), 1);
    assert!(updates(&drain(&mut second_remote)).is_empty());
    drop(second);
}

#[tokio::test(start_paused = true)]
async fn test_removed_keys_are_replicated_as_deletions() {
    let host = Host::default();
    let (collab, mut remote) = connected_session(&host, User::new("u1", "Ada")).await;

    collab.sync(
        RoomSnapshot::new()
            .with_field("width", json!(1))
            .with_field("note", json!("x"))
            .with_category("lamps", vec![json!({ "id": "l1" })]),
    );
    sleep(Duration::from_millis(300)).await;
    let first = updates(&drain(&mut remote));
    assert_eq!(first.len(), 1);
    assert_eq!(first[0]["roomData"]["note"], json!("x"));

    collab.sync(RoomSnapshot::new().with_field("width", json!(2)));
    sleep(Duration::from_millis(300)).await;
    let second = updates(&drain(&mut remote));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0]["roomData"], json!({ "width": 2 }));
    assert_eq!(second[0]["items"], json!({}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_from_other_thread_during_remote_apply_is_kept() {
    let host = Host::default();
    let entered = Arc::new(AtomicBool::new(false));
    let (connector, mut accepted) = ChannelConnector::new();

    // Host whose room getter is slow, holding the session task inside the
    // remote apply while the editor keeps working elsewhere.
    let flag = entered.clone();
    let current = host.room.clone();
    let options = host
        .options(User::new("u1", "Ada"), Arc::new(connector))
        .get_room_obj(move || {
            flag.store(true, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(300));
            current.lock().unwrap().clone()
        });
    let mut collab = Collaboration::new();
    collab.enable(ROOM, options).unwrap();
    let mut remote = accept(&mut accepted).await;
    handshake(&mut remote).await;

    send(&remote, Frame::Update(snapshot(json!({ "name": "Studio" }), json!({}))));
    timeout(Duration::from_secs(5), async {
        while !entered.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("remote change never reached the host");

    collab.sync(
        RoomSnapshot::new()
            .with_field("name", json!("Studio"))
            .with_field("width", json!(640)),
    );
    sleep(Duration::from_millis(800)).await;

    let sent = updates(&drain(&mut remote));
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["roomData"]["width"], json!(640));
    collab.disable();
}

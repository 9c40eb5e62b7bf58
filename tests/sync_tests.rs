//! End-to-end tests: a real server on a loopback port, driven by WebSocket
//! clients the way browser tabs would drive it.

use chrono::{Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use position_sync::auth::{Claims, JwtAuthenticator};
use position_sync::game::UserId;
use position_sync::hub::{Hub, WorldSettings};
use position_sync::records::{AttributeChange, MemoryRecordStore};
use position_sync::tasks::{self, Timing};
use position_sync::{build_router, propagator};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "test-secret";
const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    hub: Arc<Hub>,
    records: Arc<MemoryRecordStore>,
}

fn timing(heartbeat: Duration) -> Timing {
    Timing {
        tick: Duration::from_millis(16),
        heartbeat,
        reconcile: Duration::from_millis(50),
    }
}

async fn start_server(timing: Timing) -> TestServer {
    let records = Arc::new(MemoryRecordStore::new());
    for (name, coins) in [("ann", 5), ("bob", 0), ("cid", 12)] {
        records
            .insert(
                UserId::from(format!("id-{}", name)),
                name.to_string(),
                coins,
                "green".into(),
            )
            .await
            .unwrap();
    }
    let settings = WorldSettings {
        spawn: (0.0, 0.0),
        ..WorldSettings::default()
    };
    let hub = Arc::new(Hub::new(
        settings,
        Arc::new(JwtAuthenticator::new(SECRET)),
        records.clone(),
    ));
    tasks::spawn_all(hub.clone(), timing);
    propagator::spawn_propagator(hub.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(hub.clone(), None);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer { addr, hub, records }
}

fn token_for(name: &str) -> String {
    let claims = Claims {
        id: format!("id-{}", name),
        username: name.to_string(),
        exp: (Utc::now() + ChronoDuration::hours(1)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn connect_raw(addr: SocketAddr, query: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/{}", addr, query))
        .await
        .expect("handshake failed");
    ws
}

/// Connect as `name` and consume the `init` message.
async fn connect(addr: SocketAddr, name: &str) -> (Ws, Value) {
    let mut ws = connect_raw(addr, &format!("?token={}", token_for(name))).await;
    let init = next_matching(&mut ws, |m| m["type"] == "init").await;
    (ws, init)
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_matching(ws: &mut Ws, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let msg = next_json(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
}

fn is_remove_of(msg: &Value, id: &str) -> bool {
    msg["type"] == "remove" && msg["playerId"] == id
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

mod connection_tests {
    use super::*;

    #[tokio::test]
    async fn invalid_credentials_are_closed_without_state() {
        let server = start_server(timing(Duration::from_secs(60))).await;

        let unknown_user = format!("?token={}", token_for("nobody"));
        for query in ["", "?token=garbage", unknown_user.as_str()] {
            let mut ws = connect_raw(server.addr, query).await;
            match timeout(WAIT, ws.next()).await.unwrap() {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
                Some(Ok(other)) => panic!("unexpected frame {:?}", other),
            }
        }

        assert!(server.hub.store().read().await.is_empty());
        assert!(server.hub.sessions().read().await.is_empty());
    }

    #[tokio::test]
    async fn init_lists_every_live_player_and_own_id() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (_ann, _) = connect(server.addr, "ann").await;
        let (_bob, init) = connect(server.addr, "bob").await;

        assert_eq!(init["id"], "id-bob");
        let players = init["players"].as_object().unwrap();
        assert_eq!(players.len(), 2);
        assert_eq!(players["id-ann"]["coins"], 5);
        assert_eq!(players["id-bob"]["x"], 0.0);
        assert_eq!(players["id-bob"]["color"], "green");
    }

    #[tokio::test]
    async fn join_is_announced_to_others_only() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (mut ann, _) = connect(server.addr, "ann").await;
        let (mut bob, _) = connect(server.addr, "bob").await;

        let announce = next_matching(&mut ann, |m| {
            m["type"] == "update" && m["players"]["id-bob"]["username"] == "bob"
        })
        .await;
        assert_eq!(announce["players"]["id-bob"]["coins"], 0);

        // Bob only ever sees himself in reconciliation snapshots, which always
        // carry a target field; his join delta has none.
        send_json(&mut bob, json!({"type": "chat", "text": "marker"})).await;
        loop {
            let msg = next_json(&mut bob).await;
            if msg["type"] == "chat" {
                break;
            }
            if let Some(me) = msg["players"].get("id-bob") {
                assert!(me.as_object().unwrap().contains_key("targetX"));
            }
        }
    }

    #[tokio::test]
    async fn tabs_collapse_and_last_close_removes_once() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (mut watcher, _) = connect(server.addr, "bob").await;
        let (mut tab1, _) = connect(server.addr, "ann").await;
        let (mut tab2, _) = connect(server.addr, "ann").await;

        {
            let store = server.hub.store().read().await;
            assert_eq!(store.len(), 2);
            assert_eq!(
                store.get(&UserId::from("id-ann")).unwrap().connection_count,
                2
            );
        }

        tab1.close(None).await.unwrap();
        let hub = server.hub.clone();
        wait_until(|| {
            let hub = hub.clone();
            async move { hub.sessions().read().await.connection_count(&UserId::from("id-ann")) == 1 }
        })
        .await;
        assert!(server.hub.store().read().await.contains(&UserId::from("id-ann")));

        // The surviving tab still drives the player.
        send_json(&mut tab2, json!({"type": "setTarget", "targetX": 10.0, "targetY": 0.0})).await;
        next_matching(&mut watcher, |m| m["players"]["id-ann"]["targetX"] == 10.0).await;

        tab2.close(None).await.unwrap();
        next_matching(&mut watcher, |m| is_remove_of(m, "id-ann")).await;
        assert!(!server.hub.store().read().await.contains(&UserId::from("id-ann")));

        // A chat marker proves no second removal was queued ahead of it.
        send_json(&mut watcher, json!({"type": "chat", "text": "done"})).await;
        loop {
            let msg = next_json(&mut watcher).await;
            assert!(!is_remove_of(&msg, "id-ann"), "duplicate remove");
            if msg["type"] == "chat" {
                break;
            }
        }
    }

    #[tokio::test]
    async fn explicit_disconnect_removes_player_and_closes_socket() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (mut ann, _) = connect(server.addr, "ann").await;
        let (mut bob, _) = connect(server.addr, "bob").await;

        send_json(&mut ann, json!({"type": "disconnect"})).await;
        next_matching(&mut bob, |m| is_remove_of(m, "id-ann")).await;

        // Ann sees her own removal, then the server closes the socket.
        loop {
            match timeout(WAIT, ann.next()).await.unwrap() {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
        assert!(!server.hub.store().read().await.contains(&UserId::from("id-ann")));
    }
}

mod protocol_tests {
    use super::*;

    #[tokio::test]
    async fn set_target_is_not_echoed_to_sender() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (mut ann, _) = connect(server.addr, "ann").await;
        let (mut bob, _) = connect(server.addr, "bob").await;

        send_json(&mut ann, json!({"type": "setTarget", "targetX": 300.0, "targetY": 40.0})).await;
        let delta = next_matching(&mut bob, |m| {
            m["type"] == "update" && m["players"]["id-ann"]["targetX"] == 300.0
        })
        .await;
        assert_eq!(delta["players"]["id-ann"]["targetY"], 40.0);

        send_json(&mut ann, json!({"type": "chat", "text": "marker"})).await;
        loop {
            let msg = next_json(&mut ann).await;
            if msg["type"] == "chat" {
                break;
            }
            // Reconciliation lists both players; a single-player update
            // mentioning ann on her own stream would be her delta echoed back.
            if msg["type"] == "update" && msg["players"].get("id-ann").is_some() {
                assert!(
                    msg["players"].as_object().unwrap().len() > 1,
                    "sender received its own delta"
                );
            }
        }
    }

    #[tokio::test]
    async fn chat_is_relayed_to_everyone() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (mut ann, _) = connect(server.addr, "ann").await;
        let (mut bob, _) = connect(server.addr, "bob").await;

        send_json(&mut bob, json!({"type": "chat", "text": "hi all"})).await;
        for ws in [&mut ann, &mut bob] {
            let chat = next_matching(ws, |m| m["type"] == "chat").await;
            assert_eq!(chat, json!({"type": "chat", "username": "bob", "text": "hi all"}));
        }
    }

    #[tokio::test]
    async fn bad_frames_keep_connection_open() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (mut ann, _) = connect(server.addr, "ann").await;

        ann.send(Message::Text("{oops".into())).await.unwrap();
        send_json(&mut ann, json!({"type": "fly", "to": "moon"})).await;
        ann.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        send_json(&mut ann, json!({"type": "chat", "text": "still here"})).await;

        let chat = next_matching(&mut ann, |m| m["type"] == "chat").await;
        assert_eq!(chat["text"], "still here");
    }
}

mod sync_tests {
    use super::*;

    #[tokio::test]
    async fn movement_converges_monotonically_to_target() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (mut ann, _) = connect(server.addr, "ann").await;
        let (mut bob, _) = connect(server.addr, "bob").await;

        send_json(&mut ann, json!({"type": "setTarget", "targetX": 100.0, "targetY": 0.0})).await;

        let mut last_x = 0.0;
        let mut saw_intermediate = false;
        loop {
            let msg = next_json(&mut bob).await;
            let Some(p) = msg["players"].get("id-ann") else {
                continue;
            };
            let Some(x) = p["x"].as_f64() else {
                continue;
            };
            assert!(x >= last_x, "moved backwards: {} after {}", x, last_x);
            assert_eq!(p["y"], 0.0);
            if x > 0.0 && x < 100.0 {
                saw_intermediate = true;
            }
            last_x = x;
            if x == 100.0 && p.get("targetX").is_some_and(Value::is_null) {
                break;
            }
        }
        assert!(saw_intermediate);

        let store = server.hub.store().read().await;
        let p = store.get(&UserId::from("id-ann")).unwrap();
        assert_eq!((p.x, p.y), (100.0, 0.0));
        assert!(p.target.is_none());
    }

    #[tokio::test]
    async fn reconciliation_repeats_full_state() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (mut ann, _) = connect(server.addr, "ann").await;

        let is_snapshot = |m: &Value| {
            m["type"] == "update" && m["players"]["id-ann"].get("color").is_some()
        };
        let first = next_matching(&mut ann, is_snapshot).await;
        let second = next_matching(&mut ann, is_snapshot).await;
        // Idle world: two snapshots are identical, so applying either twice is a no-op.
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn external_coin_change_reaches_clients() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (_ann, _) = connect(server.addr, "ann").await;
        let (mut bob, _) = connect(server.addr, "bob").await;

        server
            .records
            .update(&UserId::from("id-ann"), AttributeChange::Coins(250))
            .await
            .unwrap();

        let update = next_matching(&mut bob, |m| m["players"]["id-ann"]["coins"] == 250).await;
        assert_eq!(update["players"]["id-ann"]["username"], "ann");
        let hub = server.hub.clone();
        wait_until(|| {
            let hub = hub.clone();
            async move {
                hub.store()
                    .read()
                    .await
                    .get(&UserId::from("id-ann"))
                    .is_some_and(|p| p.coins == 250)
            }
        })
        .await;
    }

    #[tokio::test]
    async fn coin_change_for_offline_user_is_kept_for_next_join() {
        let server = start_server(timing(Duration::from_secs(60))).await;
        let (mut bob, _) = connect(server.addr, "bob").await;

        server
            .records
            .update(&UserId::from("id-cid"), AttributeChange::Coins(99))
            .await
            .unwrap();

        send_json(&mut bob, json!({"type": "chat", "text": "marker"})).await;
        loop {
            let msg = next_json(&mut bob).await;
            assert!(msg["players"].get("id-cid").is_none());
            if msg["type"] == "chat" {
                break;
            }
        }

        let (_cid, init) = connect(server.addr, "cid").await;
        assert_eq!(init["players"]["id-cid"]["coins"], 99);
    }
}

mod liveness_tests {
    use super::*;

    #[tokio::test]
    async fn silent_socket_is_reclaimed_within_two_cycles() {
        let server = start_server(timing(Duration::from_millis(100))).await;
        let (mut bob, _) = connect(server.addr, "bob").await;
        // Ann never reads again, so she never answers a ping.
        let (_ann, _) = connect(server.addr, "ann").await;

        next_matching(&mut bob, |m| is_remove_of(m, "id-ann")).await;
        assert!(!server.hub.store().read().await.contains(&UserId::from("id-ann")));
        assert_eq!(
            server
                .hub
                .sessions()
                .read()
                .await
                .connection_count(&UserId::from("id-ann")),
            0
        );
        // Bob kept answering pings and is still attached.
        assert!(server.hub.store().read().await.contains(&UserId::from("id-bob")));
    }
}

use futures::StreamExt;
use mathduel::config::DuelConfig;
use mathduel::duel::{AnswerOutcome, DuelEvent, DuelHandle, DuelView};
use mathduel::error::DuelError;
use mathduel::store::{MemoryStore, RemoteStore, SessionStore};
use mathduel::types::{session_key, Operation, Role, SessionStatus};
use mathduel::ws::{self, RelayState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_event(
    events: &mut UnboundedReceiver<DuelEvent>,
    pred: impl Fn(&DuelEvent) -> bool,
) -> DuelEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_view(handle: &DuelHandle, pred: impl Fn(&DuelView) -> bool) -> DuelView {
    let mut view = handle.watch();
    let matched = tokio::time::timeout(WAIT, view.wait_for(|v| pred(v)))
        .await
        .expect("timed out waiting for view")
        .expect("duel task ended")
        .clone();
    matched
}

/// Wait until `handle` can answer round `issued_at`, then answer it correctly
async fn answer_round(handle: &DuelHandle, issued_at: u64) {
    let view = wait_for_view(handle, |v| {
        !v.input_locked && v.question.as_ref().is_some_and(|q| q.issued_at == issued_at)
    })
    .await;
    let answer = view.question.unwrap().answer().to_string();
    let outcome = handle.submit_answer(&answer).await.unwrap();
    assert!(matches!(outcome, AnswerOutcome::Correct { .. }));
}

async fn start_duel(
    host_store: Arc<dyn SessionStore>,
    guest_store: Arc<dyn SessionStore>,
    config: DuelConfig,
) -> (
    DuelHandle,
    UnboundedReceiver<DuelEvent>,
    DuelHandle,
    UnboundedReceiver<DuelEvent>,
) {
    let (host, host_events) = DuelHandle::create(
        host_store,
        config.clone(),
        "Alice",
        &[Operation::Multiply],
        false,
    )
    .await
    .unwrap();
    let (guest, guest_events) = DuelHandle::join(guest_store, config, host.code().as_str(), "Bob")
        .await
        .unwrap();
    (host, host_events, guest, guest_events)
}

/// End-to-end integration test for a multiplication duel
#[tokio::test]
async fn test_full_round_flow() {
    let store = MemoryStore::new();
    let (host, mut host_events, guest, mut guest_events) = start_duel(
        Arc::new(store.connect()),
        Arc::new(store.connect()),
        DuelConfig::immediate(),
    )
    .await;
    let key = session_key(host.code());

    // 1. Host sees the guest arrive
    let joined = wait_for_event(&mut host_events, |e| {
        matches!(e, DuelEvent::OpponentJoined { .. })
    })
    .await;
    assert_eq!(
        joined,
        DuelEvent::OpponentJoined {
            name: "Bob".to_string()
        }
    );

    // 2. First question reaches the guest
    let first = wait_for_event(&mut guest_events, |e| matches!(e, DuelEvent::NewRound(_))).await;
    let DuelEvent::NewRound(question) = first else {
        unreachable!()
    };
    assert_eq!(question.issued_at, 1);
    assert_eq!(question.op, Operation::Multiply);
    assert!((1..=10).contains(&question.a) && (1..=10).contains(&question.b));
    assert_eq!(
        store.get(&key).await.unwrap().status,
        SessionStatus::Playing
    );

    // 3. Host answers; score and answer land in the record
    answer_round(&host, 1).await;
    let record = store.get(&key).await.unwrap();
    assert_eq!(record.host_score, 1);
    let answer = record.host_answer.unwrap();
    assert!(answer.correct);
    assert_eq!(answer.answered_at, 1);

    let scored = wait_for_event(&mut guest_events, |e| {
        matches!(e, DuelEvent::OpponentScored { .. })
    })
    .await;
    assert_eq!(scored, DuelEvent::OpponentScored { score: 1 });

    // 4. The next round follows with a new id
    let second = wait_for_event(&mut guest_events, |e| matches!(e, DuelEvent::NewRound(_))).await;
    assert!(matches!(second, DuelEvent::NewRound(q) if q.issued_at == 2));

    let view = wait_for_view(&guest, |v| v.host_score == 1).await;
    assert_eq!(view.guest_score, 0);
    assert_eq!(view.opponent_name.as_deref(), Some("Alice"));
}

#[tokio::test]
async fn test_fourteen_to_four_ends_for_both() {
    let store = MemoryStore::new();
    let (host, mut host_events, guest, mut guest_events) = start_duel(
        Arc::new(store.connect()),
        Arc::new(store.connect()),
        DuelConfig::immediate(),
    )
    .await;

    let mut round = 1;
    for _ in 0..4 {
        answer_round(&guest, round).await;
        round += 1;
    }
    for _ in 0..14 {
        answer_round(&host, round).await;
        round += 1;
    }

    let host_over = wait_for_event(&mut host_events, |e| matches!(e, DuelEvent::GameOver { .. })).await;
    let guest_over =
        wait_for_event(&mut guest_events, |e| matches!(e, DuelEvent::GameOver { .. })).await;
    assert_eq!(host_over, DuelEvent::GameOver { winner: Role::Host });
    assert_eq!(guest_over, DuelEvent::GameOver { winner: Role::Host });

    let record = store.get(&session_key(host.code())).await.unwrap();
    assert!(record.game_over);
    assert_eq!(record.winner, Some(Role::Host));
    assert_eq!(record.status, SessionStatus::Ended);
    assert_eq!((record.host_score, record.guest_score), (14, 4));

    let view = wait_for_view(&guest, |v| v.game_over).await;
    assert_eq!((view.host_score, view.guest_score), (14, 4));
    assert!(view.input_locked);
}

#[tokio::test]
async fn test_rematch_needs_both_players() {
    let store = MemoryStore::new();
    let config = DuelConfig {
        win_margin: 1,
        ..DuelConfig::immediate()
    };
    let (host, mut host_events, guest, mut guest_events) = start_duel(
        Arc::new(store.connect()),
        Arc::new(store.connect()),
        config,
    )
    .await;
    let key = session_key(host.code());

    answer_round(&guest, 1).await;
    wait_for_view(&host, |v| v.game_over).await;
    wait_for_view(&guest, |v| v.game_over).await;

    host.request_rematch().await.unwrap();
    wait_for_event(&mut guest_events, |e| *e == DuelEvent::RematchRequested).await;
    let record = store.get(&key).await.unwrap();
    assert!(record.rematch_host && !record.rematch_guest);
    assert_eq!(record.status, SessionStatus::Ended);

    guest.request_rematch().await.unwrap();
    wait_for_event(&mut host_events, |e| *e == DuelEvent::RematchStarted).await;
    wait_for_event(&mut guest_events, |e| *e == DuelEvent::RematchStarted).await;

    // Play resumes with fresh scores and the next round id
    let view = wait_for_view(&guest, |v| {
        v.question.as_ref().is_some_and(|q| q.issued_at == 2)
    })
    .await;
    assert_eq!((view.host_score, view.guest_score), (0, 0));
    assert!(!view.game_over);

    let record = store.get(&key).await.unwrap();
    assert_eq!(record.status, SessionStatus::Playing);
    assert!(!record.rematch_host && !record.rematch_guest);
}

#[tokio::test]
async fn test_dropped_guest_ends_session_once() {
    let store = MemoryStore::new();
    let guest_conn = store.connect();
    let (host, mut host_events, _guest, _guest_events) = start_duel(
        Arc::new(store.connect()),
        Arc::new(guest_conn.clone()),
        DuelConfig::immediate(),
    )
    .await;
    let key = session_key(host.code());

    wait_for_view(&host, |v| v.status == Some(SessionStatus::Playing)).await;
    guest_conn.drop_connection().await;

    wait_for_event(&mut host_events, |e| *e == DuelEvent::OpponentDisconnected).await;
    wait_for_view(&host, |v| v.closed).await;
    assert!(store.get(&key).await.is_none());

    // The task is done; no second disconnect follows
    let mut rest = Vec::new();
    while let Some(event) = host_events.recv().await {
        rest.push(event);
    }
    assert!(!rest.contains(&DuelEvent::OpponentDisconnected));
}

#[tokio::test]
async fn test_store_outage_is_reported() {
    let store = MemoryStore::new();
    store.set_available(false);

    let result = DuelHandle::create(
        Arc::new(store.connect()),
        DuelConfig::immediate(),
        "Alice",
        &[Operation::Add],
        false,
    )
    .await;
    assert!(matches!(result, Err(DuelError::StoreUnavailable(_))));

    store.set_available(true);
    let joined = DuelHandle::join(Arc::new(store.connect()), DuelConfig::immediate(), "00", "Bob").await;
    assert!(matches!(joined, Err(DuelError::SessionNotFound(_))));
}

async fn spawn_relay() -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = ws::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{}/ws", addr), state)
}

#[tokio::test]
async fn test_duel_over_relay() {
    let (url, relay) = spawn_relay().await;
    let host_store = Arc::new(RemoteStore::connect(&url).await.unwrap());
    let guest_store = Arc::new(RemoteStore::connect(&url).await.unwrap());

    let lobby = RemoteStore::connect(&url).await.unwrap();
    let mut open = mathduel::directory::list_open_sessions(&lobby).await.unwrap();
    assert!(open.next().await.unwrap().is_empty());

    let (host, mut host_events, guest, _guest_events) = start_duel(
        host_store.clone(),
        guest_store.clone(),
        DuelConfig::immediate(),
    )
    .await;
    let key = session_key(host.code());

    answer_round(&guest, 1).await;
    wait_for_event(&mut host_events, |e| {
        *e == DuelEvent::OpponentScored { score: 1 }
    })
    .await;
    assert_eq!(relay.store.get(&key).await.unwrap().guest_score, 1);

    // Closing the guest socket fires its presence cleanup at the relay
    guest_store.close();
    wait_for_event(&mut host_events, |e| *e == DuelEvent::OpponentDisconnected).await;
    wait_for_view(&host, |v| v.closed).await;
    assert!(relay.store.get(&key).await.is_none());
    wait_for_view(&guest, |v| v.closed).await;
    assert!(guest_store.is_closed());
    assert!(matches!(
        guest.submit_answer("1").await,
        Err(DuelError::SessionClosed)
    ));
}

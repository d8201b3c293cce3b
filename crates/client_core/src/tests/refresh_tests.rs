use super::*;
use crate::test_support::{credential_valid_for, ScriptedRefresh};
use anyhow::Result;
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use shared::protocol::RefreshResponse;
use tokio::net::TcpListener;

fn coordinator(transport: Arc<ScriptedRefresh>) -> Arc<TokenRefreshCoordinator> {
    TokenRefreshCoordinator::new(
        Arc::new(CredentialStore::new()),
        transport,
        Duration::from_secs(10),
        Duration::from_secs(10),
    )
}

fn record_events(coordinator: &TokenRefreshCoordinator) -> (Arc<Mutex<Vec<SessionEvent>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = coordinator.subscribe(move |event| sink.lock().expect("events").push(event.clone()));
    (seen, subscription)
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_refresh() {
    let transport = Arc::new(ScriptedRefresh::issuing(60).with_delay(Duration::from_millis(200)));
    let coordinator = coordinator(Arc::clone(&transport));
    coordinator.store().set(credential_valid_for(-5));

    let waiters = (0..8).map(|_| {
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.ensure_valid().await }
    });
    let results = futures::future::join_all(waiters).await;

    assert_eq!(transport.calls(), 1);
    let tokens: Vec<String> = results
        .into_iter()
        .map(|result| result.expect("refreshed").access_token)
        .collect();
    assert!(tokens.iter().all(|token| token == "issued-1"));
    assert!(!coordinator.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn valid_credential_is_returned_without_refreshing() {
    let transport = Arc::new(ScriptedRefresh::issuing(60));
    let coordinator = coordinator(Arc::clone(&transport));
    coordinator.store().set(credential_valid_for(3600));

    let credential = coordinator.ensure_valid().await.expect("credential");

    assert_eq!(credential.access_token, "token-3600");
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn credential_inside_margin_is_refreshed() {
    let transport = Arc::new(ScriptedRefresh::issuing(60));
    let coordinator = coordinator(Arc::clone(&transport));
    coordinator.store().set(credential_valid_for(5));

    let credential = coordinator.ensure_valid().await.expect("credential");

    assert_eq!(credential.access_token, "issued-1");
    assert_eq!(coordinator.store().get(), Some(credential));
}

#[tokio::test(start_paused = true)]
async fn proactive_refresh_fires_margin_before_expiry() {
    let transport = Arc::new(ScriptedRefresh::issuing(60));
    let coordinator = coordinator(Arc::clone(&transport));

    coordinator.ensure_valid().await.expect("initial refresh");
    assert!(coordinator.has_scheduled_refresh());

    tokio::time::sleep(Duration::from_secs(49)).await;
    assert_eq!(transport.calls(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    crate::test_support::settle().await;
    assert_eq!(transport.calls(), 2);
    assert!(coordinator.has_scheduled_refresh());
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_reschedules_proactive_timer() {
    let transport = Arc::new(ScriptedRefresh::issuing(60));
    let coordinator = coordinator(Arc::clone(&transport));

    coordinator.ensure_valid().await.expect("initial refresh");
    tokio::time::sleep(Duration::from_secs(30)).await;
    coordinator.force_refresh().await.expect("manual refresh");
    assert_eq!(transport.calls(), 2);

    // The timer armed by the first refresh would have fired at t=50s.
    tokio::time::sleep(Duration::from_secs(25)).await;
    crate::test_support::settle().await;
    assert_eq!(transport.calls(), 2);

    // Rescheduled relative to the second expiry: t=30s + 50s.
    tokio::time::sleep(Duration::from_secs(26)).await;
    crate::test_support::settle().await;
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_clears_store_and_terminates_session() {
    let transport = Arc::new(
        ScriptedRefresh::issuing(60)
            .with_delay(Duration::from_millis(50))
            .then(Err(RefreshError::Unauthorized)),
    );
    let coordinator = coordinator(Arc::clone(&transport));
    coordinator.store().set(credential_valid_for(-1));
    let (events, _subscription) = record_events(&coordinator);

    let (first, second) = tokio::join!(coordinator.ensure_valid(), coordinator.ensure_valid());

    assert_eq!(first, Err(RefreshError::Unauthorized));
    assert_eq!(second, Err(RefreshError::Unauthorized));
    assert_eq!(transport.calls(), 1);
    assert_eq!(coordinator.store().get(), None);
    assert!(!coordinator.has_scheduled_refresh());
    assert!(matches!(
        events.lock().expect("events").as_slice(),
        [SessionEvent::Terminated {
            reason: RefreshError::Unauthorized
        }]
    ));

    // The slot is released, so the next caller retries.
    let retried = coordinator.ensure_valid().await.expect("retry succeeds");
    assert_eq!(retried.access_token, "issued-2");
}

#[tokio::test(start_paused = true)]
async fn network_failure_keeps_session() {
    let transport = Arc::new(
        ScriptedRefresh::issuing(60).then(Err(RefreshError::Network("timed out".into()))),
    );
    let coordinator = coordinator(Arc::clone(&transport));
    let stale = credential_valid_for(5);
    coordinator.store().set(stale.clone());
    let (events, _subscription) = record_events(&coordinator);

    let result = coordinator.ensure_valid().await;

    assert!(matches!(result, Err(RefreshError::Network(_))));
    assert_eq!(coordinator.store().get(), Some(stale));
    assert!(events.lock().expect("events").is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_proactive_timer() {
    let transport = Arc::new(ScriptedRefresh::issuing(60));
    let coordinator = coordinator(Arc::clone(&transport));
    coordinator.ensure_valid().await.expect("initial refresh");

    coordinator.shutdown();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(!coordinator.has_scheduled_refresh());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_finishing_after_shutdown_is_discarded() {
    let transport = Arc::new(ScriptedRefresh::issuing(60).with_delay(Duration::from_secs(5)));
    let coordinator = coordinator(Arc::clone(&transport));
    let (events, _subscription) = record_events(&coordinator);

    let pending = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.force_refresh().await }
    });
    crate::test_support::settle().await;
    assert!(coordinator.is_refreshing());

    coordinator.shutdown();
    coordinator.store().clear();
    assert!(!coordinator.is_refreshing());
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(pending.await.expect("join"), Err(RefreshError::Cancelled));
    assert_eq!(coordinator.store().get(), None);
    assert!(!coordinator.has_scheduled_refresh());
    assert!(events.lock().expect("events").is_empty());
}

#[tokio::test(start_paused = true)]
async fn refresh_after_shutdown_does_not_join_detached_one() {
    let transport = Arc::new(ScriptedRefresh::issuing(60).with_delay(Duration::from_secs(5)));
    let coordinator = coordinator(Arc::clone(&transport));

    let detached = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.force_refresh().await }
    });
    crate::test_support::settle().await;
    coordinator.shutdown();

    let fresh = coordinator.ensure_valid().await.expect("new session refresh");

    assert_eq!(fresh.access_token, "issued-2");
    assert_eq!(detached.await.expect("join"), Err(RefreshError::Cancelled));
    assert_eq!(coordinator.store().get(), Some(fresh));
    assert!(coordinator.has_scheduled_refresh());
}

#[tokio::test(start_paused = true)]
async fn hung_refresh_times_out_as_network_failure() {
    let transport = Arc::new(ScriptedRefresh::issuing(60).with_delay(Duration::from_secs(600)));
    let coordinator = coordinator(Arc::clone(&transport));
    let stale = credential_valid_for(5);
    coordinator.store().set(stale.clone());
    let (events, _subscription) = record_events(&coordinator);

    let started = tokio::time::Instant::now();
    let result = coordinator.ensure_valid().await;

    assert!(matches!(result, Err(RefreshError::Network(_))));
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(600));
    assert!(!coordinator.is_refreshing());
    assert_eq!(coordinator.store().get(), Some(stale));
    assert!(events.lock().expect("events").is_empty());
}

#[derive(Clone)]
struct RefreshServer {
    status: StatusCode,
    seen_auth: Arc<Mutex<Vec<String>>>,
}

async fn handle_refresh(State(state): State<RefreshServer>, headers: HeaderMap) -> Response {
    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()) {
        state.seen_auth.lock().expect("auth").push(auth.to_string());
    }
    if state.status != StatusCode::OK {
        return state.status.into_response();
    }
    Json(RefreshResponse {
        access_token: "fresh".into(),
        expires_at: Utc::now() + chrono::Duration::seconds(300),
    })
    .into_response()
}

async fn spawn_refresh_server(status: StatusCode) -> Result<(String, Arc<Mutex<Vec<String>>>)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let seen_auth = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/auth/refresh", post(handle_refresh))
        .with_state(RefreshServer {
            status,
            seen_auth: Arc::clone(&seen_auth),
        });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), seen_auth))
}

#[tokio::test]
async fn http_transport_posts_bearer_and_parses_body() {
    let (server_url, seen_auth) = spawn_refresh_server(StatusCode::OK).await.expect("spawn server");
    let transport = HttpRefreshTransport::new(format!("{server_url}/"));

    let credential = transport
        .refresh(Some(Credential::new("old", Utc::now())))
        .await
        .expect("refresh");

    assert_eq!(credential.access_token, "fresh");
    assert!(credential.expires_at > Utc::now());
    assert_eq!(*seen_auth.lock().expect("auth"), vec!["Bearer old".to_string()]);
}

#[tokio::test]
async fn http_transport_maps_statuses() {
    let (unauthorized, _) = spawn_refresh_server(StatusCode::UNAUTHORIZED).await.expect("spawn server");
    let (unavailable, _) = spawn_refresh_server(StatusCode::SERVICE_UNAVAILABLE).await.expect("spawn server");
    let (teapot, _) = spawn_refresh_server(StatusCode::IM_A_TEAPOT).await.expect("spawn server");

    assert_eq!(
        HttpRefreshTransport::new(unauthorized).refresh(None).await,
        Err(RefreshError::Unauthorized)
    );
    assert!(matches!(
        HttpRefreshTransport::new(unavailable).refresh(None).await,
        Err(RefreshError::Network(_))
    ));
    assert!(matches!(
        HttpRefreshTransport::new(teapot).refresh(None).await,
        Err(RefreshError::Unknown(_))
    ));
}

#[tokio::test]
async fn http_transport_reports_unreachable_server_as_network() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let result = HttpRefreshTransport::new(format!("http://{addr}")).refresh(None).await;

    assert!(matches!(result, Err(RefreshError::Network(_))));
}

#[tokio::test]
async fn http_transport_gives_up_on_slow_server() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route(
        "/auth/refresh",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let result = HttpRefreshTransport::new(format!("http://{addr}"))
        .with_timeout(Duration::from_millis(200))
        .refresh(None)
        .await;

    assert!(matches!(result, Err(RefreshError::Network(_))));
}

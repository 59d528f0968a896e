mod common;

use common::{eventually, fast_config, registry, Answer, Ask, Note};
use std::time::Duration;
use tokio::time::timeout;
use weft_bridge::{tcp, ConnectionState, Result, ServerOptions};
use weft_core::Lifetime;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_delivers_to_other_clients_only() -> Result<()> {
    let lifetime = Lifetime::new();
    let config = fast_config();
    let server = tcp::server(&lifetime, registry(), "127.0.0.1:0", &config, ServerOptions::relay()).await?;
    let addr = server.local_addr().to_string();

    let a = tcp::client(&lifetime, registry(), &addr, &config).await?;
    let b = tcp::client(&lifetime, registry(), &addr, &config).await?;
    assert!(a.wait_connected(WAIT).await);
    assert!(b.wait_connected(WAIT).await);
    assert!(eventually(WAIT, || async { server.peer_count() == 2 }).await);

    let mut at_a = a.bus().subscribe::<Note>(false);
    let mut at_b = b.bus().subscribe::<Note>(false);

    a.bus().publish(Note("hello".into()));

    let received = timeout(WAIT, at_b.recv()).await.expect("timeout");
    assert_eq!(received, Some(Note("hello".into())));

    // A sees its own publish once, locally, never echoed back by the server.
    assert_eq!(at_a.recv().await, Some(Note("hello".into())));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(at_a.try_recv().is_none());
    assert!(at_b.try_recv().is_none());

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_response_across_the_server() -> Result<()> {
    let lifetime = Lifetime::new();
    let config = fast_config();
    let server = tcp::server(&lifetime, registry(), "127.0.0.1:0", &config, ServerOptions::relay()).await?;
    let addr = server.local_addr().to_string();

    let responder = tcp::client(&lifetime, registry(), &addr, &config).await?;
    let requester = tcp::client(&lifetime, registry(), &addr, &config).await?;
    assert!(responder.wait_connected(WAIT).await);
    assert!(requester.wait_connected(WAIT).await);
    assert!(eventually(WAIT, || async { server.peer_count() == 2 }).await);

    let _handler = responder
        .bus()
        .register_handler_sync(|ask: Ask| Answer(ask.0 + 1))?;

    let answer: Answer = requester
        .bus()
        .request_or_timeout(Ask(41), Duration::from_secs(3))
        .await?;
    assert_eq!(answer, Answer(42));

    // Nobody answers a type the responder does not serve.
    let missing: Answer = requester
        .bus()
        .request_or_default(Note("unanswered".into()), Duration::from_millis(200))
        .await?;
    assert_eq!(missing, Answer::default());

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_with_local_client_takes_part() -> Result<()> {
    let lifetime = Lifetime::new();
    let config = fast_config();
    let server = tcp::server(
        &lifetime,
        registry(),
        "127.0.0.1:0",
        &config,
        ServerOptions::with_local_client(),
    )
    .await?;
    let local = server.bus().expect("local bus").clone();
    let addr = server.local_addr().to_string();

    let client = tcp::client(&lifetime, registry(), &addr, &config).await?;
    assert!(client.wait_connected(WAIT).await);
    assert!(eventually(WAIT, || async { server.peer_count() == 1 }).await);

    let mut at_server = local.subscribe::<Note>(false);
    let mut at_client = client.bus().subscribe::<Note>(false);

    client.bus().publish(Note("to server".into()));
    let got = timeout(WAIT, at_server.recv()).await.expect("timeout");
    assert_eq!(got, Some(Note("to server".into())));

    local.publish(Note("to client".into()));
    // The client's own publish arrives first on its local subscription.
    assert_eq!(at_client.recv().await, Some(Note("to server".into())));
    let got = timeout(WAIT, at_client.recv()).await.expect("timeout");
    assert_eq!(got, Some(Note("to client".into())));

    let _handler = local.register_handler_sync(|ask: Ask| Answer(ask.0 * 2))?;
    let answer: Answer = client
        .bus()
        .request_or_timeout(Ask(21), Duration::from_secs(3))
        .await?;
    assert_eq!(answer, Answer(42));

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_before_server_starts_is_delivered_later() -> Result<()> {
    // Reserve a free port, then release it for the server started below.
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0")?;
        probe.local_addr()?.to_string()
    };

    let lifetime = Lifetime::new();
    let config = fast_config();
    let early = tcp::client(&lifetime, registry(), &addr, &config).await?;
    assert_eq!(early.state(), ConnectionState::Disconnected);
    assert!(!early.bus().is_connected());

    early.bus().publish(Note("queued".into()));

    let server = tcp::server(
        &lifetime,
        registry(),
        &addr,
        &config,
        ServerOptions::with_local_client(),
    )
    .await?;
    // Last-value replay covers a frame that lands before this subscription.
    let mut at_server = server.bus().expect("local bus").subscribe::<Note>(true);

    let got = timeout(WAIT, at_server.recv()).await.expect("timeout");
    assert_eq!(got, Some(Note("queued".into())));
    assert!(early.wait_connected(WAIT).await);

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnects_after_server_restart() -> Result<()> {
    let lifetime = Lifetime::new();
    let config = fast_config();
    let server = tcp::server(&lifetime, registry(), "127.0.0.1:0", &config, ServerOptions::relay()).await?;
    let addr = server.local_addr().to_string();

    let client = tcp::client(&lifetime, registry(), &addr, &config).await?;
    assert!(client.wait_connected(WAIT).await);

    server.close().await;
    assert!(eventually(WAIT, || async { client.state() != ConnectionState::Connected }).await);

    // The old listener is released by its accept task, shortly after close.
    let mut restarted = None;
    for _ in 0..50 {
        match tcp::server(&lifetime, registry(), &addr, &config, ServerOptions::relay()).await {
            Ok(server) => {
                restarted = Some(server);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let restarted = restarted.expect("port released");
    assert!(client.wait_connected(WAIT).await);
    assert!(eventually(WAIT, || async { restarted.peer_count() == 1 }).await);

    lifetime.end().await;
    Ok(())
}

#[tokio::test]
async fn closing_a_client_drops_its_peer() -> Result<()> {
    let lifetime = Lifetime::new();
    let config = fast_config();
    let server = tcp::server(&lifetime, registry(), "127.0.0.1:0", &config, ServerOptions::relay()).await?;
    let addr = server.local_addr().to_string();

    let client = tcp::client(&lifetime, registry(), &addr, &config).await?;
    assert!(client.wait_connected(WAIT).await);
    assert!(eventually(WAIT, || async { server.peer_count() == 1 }).await);

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(eventually(WAIT, || async { server.peer_count() == 0 }).await);
    assert!(!lifetime.is_ending());

    lifetime.end().await;
    Ok(())
}

#[tokio::test]
async fn bind_failure_is_reported() -> Result<()> {
    let lifetime = Lifetime::new();
    let config = fast_config();
    let first = tcp::server(&lifetime, registry(), "127.0.0.1:0", &config, ServerOptions::relay()).await?;

    let second = tcp::server(&lifetime, registry(), first.local_addr(), &config, ServerOptions::relay()).await;
    assert!(matches!(second, Err(weft_bridge::BridgeError::Bind { .. })));

    lifetime.end().await;
    Ok(())
}

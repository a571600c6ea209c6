//! End-to-end protocol scenarios against a real TCP listener.
//!
//! Each test spawns the accept loop on an ephemeral port and speaks raw
//! frame bytes so the on-wire layout is asserted literally. Timing-sensitive
//! assertions are wrapped in timeouts; where the protocol allows a Recv
//! message and a signal to arrive in either order, the test collects both
//! frames instead of pinning one ordering.
use anyhow::{Context, Result, bail, ensure};
use bytes::Bytes;
use hubd::config::HubdConfig;
use hubd::server;
use portico_hub::Hub;
use portico_wire as wire;
use portico_wire::{Delivery, Event, Signal};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const SILENCE_WINDOW: Duration = Duration::from_millis(100);

struct TestHub {
    addr: SocketAddr,
    server: JoinHandle<()>,
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn spawn_hub() -> Result<TestHub> {
    let config = HubdConfig {
        bind: "127.0.0.1:0".parse()?,
        metrics_bind: "127.0.0.1:0".parse()?,
        shard_count: 4,
        outgoing_queue_depth: 8,
        signal_queue_depth: 8,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hub = Arc::new(Hub::new(config.shard_count));
    let server = tokio::spawn(async move {
        let _ = server::serve(listener, hub, config).await;
    });
    Ok(TestHub { addr, server })
}

// Raw-byte client: every frame this suite sends or expects is spelled out.
struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect")?;
        Ok(Self { stream })
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.context("write")
    }

    async fn expect_bytes(&mut self, expected: &[u8]) -> Result<()> {
        let mut actual = vec![0u8; expected.len()];
        timeout(READ_TIMEOUT, self.stream.read_exact(&mut actual))
            .await
            .context("read timed out")?
            .context("read")?;
        ensure!(
            actual == expected,
            "wire mismatch: got {actual:02x?}, want {expected:02x?}"
        );
        Ok(())
    }

    async fn read_event(&mut self) -> Result<Event> {
        timeout(READ_TIMEOUT, wire::read_event(&mut self.stream))
            .await
            .context("read timed out")?
            .context("decode")?
            .context("connection closed")
    }

    async fn expect_silence(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        match timeout(SILENCE_WINDOW, self.stream.read(&mut byte)).await {
            Err(_) => Ok(()),
            Ok(Ok(0)) => bail!("connection closed while expecting silence"),
            Ok(Ok(_)) => bail!("expected silence, got byte 0x{:02x}", byte[0]),
            Ok(Err(err)) => Err(err).context("read"),
        }
    }

    async fn expect_eof(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        let read = timeout(READ_TIMEOUT, self.stream.read(&mut byte))
            .await
            .context("eof timed out")?
            .context("read")?;
        ensure!(read == 0, "expected eof, got byte 0x{:02x}", byte[0]);
        Ok(())
    }
}

fn enter_frame(port: u32) -> Vec<u8> {
    let mut frame = vec![0x01];
    frame.extend_from_slice(&port.to_le_bytes());
    frame
}

fn exit_frame(port: u32) -> Vec<u8> {
    let mut frame = vec![0x00];
    frame.extend_from_slice(&port.to_le_bytes());
    frame
}

fn send_frame(port: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x03];
    frame.extend_from_slice(&port.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

fn message(port: u32, body: &'static [u8]) -> Event {
    Event::Message(Delivery {
        port,
        body: Bytes::from_static(body),
    })
}

#[tokio::test]
async fn enter_send_recv_single_client() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut a = RawClient::connect(hub.addr).await?;

    a.write(&[0x01, 0x2A, 0x00, 0x00, 0x00]).await?;
    a.expect_bytes(&[0xFF, 0x01]).await?;

    a.write(&[0x03, 0x2A, 0x00, 0x00, 0x00, 0x05, 0x00, b'h', b'e', b'l', b'l', b'o'])
        .await?;
    // Own Recv and OkSend may arrive in either order.
    let events = [a.read_event().await?, a.read_event().await?];
    assert!(events.contains(&message(42, b"hello")), "{events:?}");
    assert!(events.contains(&Event::Signal(Signal::OkSend)), "{events:?}");
    a.expect_silence().await?;
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_both_subscribers_and_nobody_else() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut a = RawClient::connect(hub.addr).await?;
    let mut b = RawClient::connect(hub.addr).await?;
    let mut c = RawClient::connect(hub.addr).await?;

    a.write(&enter_frame(7)).await?;
    a.expect_bytes(&[0xFF, 0x01]).await?;
    b.write(&enter_frame(7)).await?;
    b.expect_bytes(&[0xFF, 0x01]).await?;
    c.write(&enter_frame(8)).await?;
    c.expect_bytes(&[0xFF, 0x01]).await?;

    a.write(&send_frame(7, b"ab")).await?;
    let events = [a.read_event().await?, a.read_event().await?];
    assert!(events.contains(&message(7, b"ab")), "{events:?}");
    assert!(events.contains(&Event::Signal(Signal::OkSend)), "{events:?}");
    b.expect_bytes(&[0x02, 0x07, 0x00, 0x00, 0x00, 0x02, 0x00, b'a', b'b'])
        .await?;
    c.expect_silence().await?;
    Ok(())
}

#[tokio::test]
async fn send_to_an_empty_port_is_an_error() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut a = RawClient::connect(hub.addr).await?;

    a.write(&enter_frame(1)).await?;
    a.expect_bytes(&[0xFF, 0x01]).await?;
    a.write(&exit_frame(1)).await?;
    a.expect_bytes(&[0xFF, 0x02]).await?;

    a.write(&send_frame(1, b"void")).await?;
    a.expect_bytes(&[0xFF, 0x83]).await?;
    a.expect_silence().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_verb_signals_err_type_and_closes() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut a = RawClient::connect(hub.addr).await?;

    a.write(&[0x77]).await?;
    a.expect_bytes(&[0xFF, 0x80]).await?;
    // No resynchronization: the connection goes down.
    a.expect_eof().await?;
    Ok(())
}

#[tokio::test]
async fn broadcast_survives_a_subscriber_disconnect() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut a = RawClient::connect(hub.addr).await?;
    let mut b = RawClient::connect(hub.addr).await?;

    a.write(&enter_frame(5)).await?;
    a.expect_bytes(&[0xFF, 0x01]).await?;
    b.write(&enter_frame(5)).await?;
    b.expect_bytes(&[0xFF, 0x01]).await?;

    drop(b);
    // The send must complete whether or not B's teardown has run yet.
    a.write(&send_frame(5, b"still here")).await?;
    let events = [a.read_event().await?, a.read_event().await?];
    assert!(events.contains(&message(5, b"still here")), "{events:?}");
    assert!(events.contains(&Event::Signal(Signal::OkSend)), "{events:?}");
    Ok(())
}

#[tokio::test]
async fn re_enter_is_idempotent() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut a = RawClient::connect(hub.addr).await?;

    for _ in 0..3 {
        a.write(&enter_frame(9)).await?;
        a.expect_bytes(&[0xFF, 0x01]).await?;
    }

    // Three enters collapse to one membership: exactly one Recv.
    a.write(&send_frame(9, b"once")).await?;
    let events = [a.read_event().await?, a.read_event().await?];
    assert!(events.contains(&message(9, b"once")), "{events:?}");
    assert!(events.contains(&Event::Signal(Signal::OkSend)), "{events:?}");
    a.expect_silence().await?;

    // One exit fully removes the membership.
    a.write(&exit_frame(9)).await?;
    a.expect_bytes(&[0xFF, 0x02]).await?;
    a.write(&send_frame(9, b"gone")).await?;
    a.expect_bytes(&[0xFF, 0x83]).await?;
    a.expect_silence().await?;
    Ok(())
}

#[tokio::test]
async fn teardown_removes_memberships_eagerly() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut a = RawClient::connect(hub.addr).await?;
    a.write(&enter_frame(5)).await?;
    a.expect_bytes(&[0xFF, 0x01]).await?;
    drop(a);

    // Once A's teardown has run, the port is empty again.
    sleep(Duration::from_millis(100)).await;
    let mut b = RawClient::connect(hub.addr).await?;
    b.write(&send_frame(5, b"anyone?")).await?;
    b.expect_bytes(&[0xFF, 0x83]).await?;
    Ok(())
}

#[tokio::test]
async fn pipelined_requests_parse_from_one_segment() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut a = RawClient::connect(hub.addr).await?;

    // Enter + empty-body send + exit coalesced into a single write.
    let mut burst = enter_frame(3);
    burst.extend_from_slice(&send_frame(3, b""));
    burst.extend_from_slice(&exit_frame(3));
    a.write(&burst).await?;

    // Signals come back in request order; the Recv may land anywhere
    // between them.
    let mut signals = Vec::new();
    let mut messages = Vec::new();
    for _ in 0..4 {
        match a.read_event().await? {
            Event::Signal(signal) => signals.push(signal),
            Event::Message(delivery) => messages.push(delivery),
        }
    }
    assert_eq!(signals, vec![Signal::OkEnter, Signal::OkSend, Signal::OkExit]);
    assert_eq!(
        messages,
        vec![Delivery {
            port: 3,
            body: Bytes::new(),
        }]
    );
    Ok(())
}

#[tokio::test]
async fn single_publisher_is_fifo_per_subscriber() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut subscriber = RawClient::connect(hub.addr).await?;
    let mut publisher = RawClient::connect(hub.addr).await?;

    subscriber.write(&enter_frame(11)).await?;
    subscriber.expect_bytes(&[0xFF, 0x01]).await?;

    let mut burst = Vec::new();
    for index in 0u8..5 {
        burst.extend_from_slice(&send_frame(11, &[index]));
    }
    publisher.write(&burst).await?;
    for _ in 0..5 {
        publisher.expect_bytes(&[0xFF, 0x03]).await?;
    }
    for index in 0u8..5 {
        subscriber
            .expect_bytes(&[0x02, 0x0B, 0x00, 0x00, 0x00, 0x01, 0x00, index])
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn client_library_round_trip() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut client = portico_client::Client::connect(hub.addr).await?;

    client.enter(3).await?;
    assert_eq!(
        timeout(READ_TIMEOUT, client.next_event()).await?,
        Some(Event::Signal(Signal::OkEnter))
    );

    client.send(3, Bytes::from_static(b"ping")).await?;
    let events = [
        timeout(READ_TIMEOUT, client.next_event())
            .await?
            .context("event")?,
        timeout(READ_TIMEOUT, client.next_event())
            .await?
            .context("event")?,
    ];
    assert!(events.contains(&message(3, b"ping")), "{events:?}");
    assert!(events.contains(&Event::Signal(Signal::OkSend)), "{events:?}");
    Ok(())
}

#[tokio::test]
async fn midframe_disconnect_tears_down_cleanly() -> Result<()> {
    let hub = spawn_hub().await?;
    let mut a = RawClient::connect(hub.addr).await?;
    a.write(&enter_frame(4)).await?;
    a.expect_bytes(&[0xFF, 0x01]).await?;

    // A Send frame cut off inside the size field.
    a.write(&[0x03, 0x04, 0x00, 0x00, 0x00, 0x05]).await?;
    drop(a);

    sleep(Duration::from_millis(100)).await;
    let mut b = RawClient::connect(hub.addr).await?;
    b.write(&send_frame(4, b"hello?")).await?;
    b.expect_bytes(&[0xFF, 0x83]).await?;
    Ok(())
}

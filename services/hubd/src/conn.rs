// Per-connection protocol engine.
//
// Each accepted socket gets exactly two long-lived tasks: a reader that
// decodes requests and mutates the hub, and a writer that serializes outgoing
// messages and signals back onto the socket. The reader is the sole authority
// for teardown: when it exits it fires the done signal first (so any parked
// broadcast delivery aimed at this client unblocks), then removes the
// connection's handle from every port it entered, and only then lets the
// channel senders drop so the writer can drain out and finish.
use crate::config::HubdConfig;
use portico_hub::{Hub, Message, PortId, SubscriberHandle};
use portico_wire as wire;
use portico_wire::{Request, Signal};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

pub async fn handle_connection(
    hub: Arc<Hub>,
    stream: TcpStream,
    peer: SocketAddr,
    config: HubdConfig,
) {
    metrics::gauge!("portico_connections").increment(1.0);
    let (read_half, write_half) = stream.into_split();
    let (message_tx, message_rx) = mpsc::channel(config.outgoing_queue_depth);
    let (signal_tx, signal_rx) = mpsc::channel(config.signal_queue_depth);
    let (done_tx, done_rx) = watch::channel(false);
    let handle = SubscriberHandle::new(message_tx, done_rx);

    let writer = tokio::spawn(run_writer(write_half, message_rx, signal_rx, peer));
    let entered = run_reader(&hub, read_half, &handle, &signal_tx, peer).await;

    // Done fires before membership cleanup so in-flight deliveries to this
    // client exit without enqueueing.
    let _ = done_tx.send(true);
    drop(done_tx);
    for port in entered {
        hub.exit(port, &handle);
    }
    drop(handle);
    drop(signal_tx);

    if writer.await.is_err() {
        tracing::warn!(%peer, "writer task panicked");
    }
    metrics::gauge!("portico_connections").decrement(1.0);
    tracing::debug!(%peer, "connection closed");
}

// Decode requests, apply them to the hub, and queue the signal for each.
// Returns the set of ports this connection is still entered into.
async fn run_reader(
    hub: &Hub,
    mut read_half: OwnedReadHalf,
    handle: &SubscriberHandle,
    signal_tx: &mpsc::Sender<Signal>,
    peer: SocketAddr,
) -> HashSet<PortId> {
    let mut entered = HashSet::new();
    loop {
        let request = match wire::read_request(&mut read_half).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!(%peer, "client disconnected");
                break;
            }
            Err(wire::Error::UnknownVerb(verb)) => {
                // The stream cannot be resynchronized after an unknown verb;
                // report it and drop the connection.
                metrics::counter!("portico_requests_total", "verb" => "unknown").increment(1);
                tracing::debug!(%peer, verb, "unknown verb, closing connection");
                let _ = signal_tx.send(Signal::ErrType).await;
                break;
            }
            Err(err) => {
                tracing::debug!(%peer, error = %err, "client read failed");
                break;
            }
        };
        let signal = match request {
            Request::Enter { port } => {
                metrics::counter!("portico_requests_total", "verb" => "enter").increment(1);
                tracing::debug!(%peer, port, "enter");
                hub.enter(port, handle.clone());
                entered.insert(port);
                Signal::OkEnter
            }
            Request::Exit { port } => {
                metrics::counter!("portico_requests_total", "verb" => "exit").increment(1);
                tracing::debug!(%peer, port, "exit");
                hub.exit(port, handle);
                entered.remove(&port);
                Signal::OkExit
            }
            Request::Send { port, body } => {
                metrics::counter!("portico_requests_total", "verb" => "send").increment(1);
                tracing::debug!(%peer, port, bytes = body.len(), "send");
                if hub.broadcast(port, Message { port, body }) {
                    Signal::OkSend
                } else {
                    Signal::ErrSend
                }
            }
        };
        if signal_tx.send(signal).await.is_err() {
            // Writer gone; teardown follows.
            break;
        }
    }
    entered
}

// Multiplex outgoing messages and signals onto the socket, one frame at a
// time. Write errors are logged and draining continues: the reader will hit
// the matching read error and drive teardown.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut messages: mpsc::Receiver<Message>,
    mut signals: mpsc::Receiver<Signal>,
    peer: SocketAddr,
) {
    let mut messages_open = true;
    let mut signals_open = true;
    while messages_open || signals_open {
        tokio::select! {
            message = messages.recv(), if messages_open => match message {
                Some(message) => {
                    if let Err(err) =
                        wire::write_delivery(&mut write_half, message.port, &message.body).await
                    {
                        tracing::warn!(%peer, error = %err, "write message failed");
                    }
                }
                None => messages_open = false,
            },
            signal = signals.recv(), if signals_open => match signal {
                Some(signal) => {
                    if let Err(err) = wire::write_signal(&mut write_half, signal).await {
                        tracing::warn!(%peer, error = %err, "write signal failed");
                    }
                }
                None => signals_open = false,
            },
        }
    }
}

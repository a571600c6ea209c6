// TCP client for the portico hub protocol.
// One writer task serializes requests onto the socket, one reader task decodes
// server frames into a typed event stream; the public surface is channels.
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use portico_wire as wire;
use portico_wire::Request;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

pub use portico_wire::{Delivery, Event, Signal};

const REQUEST_QUEUE_DEPTH: usize = 64;
const EVENT_QUEUE_DEPTH: usize = 256;

/// Cloneable sending side of a hub connection.
#[derive(Debug, Clone)]
pub struct Commands {
    requests: mpsc::Sender<Request>,
}

impl Commands {
    /// Subscribe to a port.
    pub async fn enter(&self, port: u32) -> Result<()> {
        self.request(Request::Enter { port }).await
    }

    /// Unsubscribe from a port.
    pub async fn exit(&self, port: u32) -> Result<()> {
        self.request(Request::Exit { port }).await
    }

    /// Publish a message to every subscriber of a port.
    pub async fn send(&self, port: u32, body: impl Into<Bytes>) -> Result<()> {
        let body = body.into();
        if body.len() > wire::MAX_BODY_LEN {
            return Err(anyhow!(
                "message body {} bytes exceeds protocol maximum {}",
                body.len(),
                wire::MAX_BODY_LEN
            ));
        }
        self.request(Request::Send { port, body }).await
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| anyhow!("hub connection closed"))
    }
}

/// Connected hub client: commands out, events (messages and signals) in.
///
/// The hub interleaves `Recv` messages with the signals acknowledging your
/// own requests; both arrive on the same event stream in wire order.
#[derive(Debug)]
pub struct Client {
    commands: Commands,
    events: mpsc::Receiver<Event>,
}

impl Client {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect to hub")?;
        let (read_half, write_half) = stream.into_split();
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        tokio::spawn(run_request_writer(write_half, request_rx));
        tokio::spawn(run_event_reader(read_half, event_tx));
        Ok(Self {
            commands: Commands {
                requests: request_tx,
            },
            events: event_rx,
        })
    }

    pub fn commands(&self) -> Commands {
        self.commands.clone()
    }

    pub async fn enter(&self, port: u32) -> Result<()> {
        self.commands.enter(port).await
    }

    pub async fn exit(&self, port: u32) -> Result<()> {
        self.commands.exit(port).await
    }

    pub async fn send(&self, port: u32, body: impl Into<Bytes>) -> Result<()> {
        self.commands.send(port, body).await
    }

    /// Next server frame; `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Split into the cloneable command side and the raw event stream.
    pub fn into_parts(self) -> (Commands, mpsc::Receiver<Event>) {
        (self.commands, self.events)
    }
}

async fn run_request_writer(mut write_half: OwnedWriteHalf, mut requests: mpsc::Receiver<Request>) {
    while let Some(request) = requests.recv().await {
        if let Err(err) = wire::write_request(&mut write_half, &request).await {
            tracing::warn!(error = %err, "hub connection write failed");
            break;
        }
    }
    // Drain after a write failure so command senders are never left parked
    // on a dead connection.
    while requests.recv().await.is_some() {}
}

async fn run_event_reader(mut read_half: OwnedReadHalf, events: mpsc::Sender<Event>) {
    loop {
        match wire::read_event(&mut read_half).await {
            Ok(Some(event)) => {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("hub closed the connection");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "hub connection read failed");
                break;
            }
        }
    }
}

// Wire codec for the portico hub protocol.
// All multi-byte integers are little-endian; bodies carry a u16 size prefix.
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest body that fits the u16 size field.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

// Frame type bytes. Exit/Enter/Send flow client -> server,
// Recv/Sig flow server -> client.
pub const VERB_EXIT: u8 = 0x00;
pub const VERB_ENTER: u8 = 0x01;
pub const VERB_RECV: u8 = 0x02;
pub const VERB_SEND: u8 = 0x03;
pub const VERB_SIG: u8 = 0xFF;

// Signals with bit 7 set are errors.
pub const SIGNAL_ERROR_BIT: u8 = 0x80;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("unknown verb byte 0x{0:02x}")]
    UnknownVerb(u8),
    #[error("unknown signal byte 0x{0:02x}")]
    UnknownSignal(u8),
    #[error("body length {0} exceeds {MAX_BODY_LEN}")]
    BodyTooLarge(usize),
    #[error("incomplete frame")]
    Incomplete,
}

/// Client request frame.
///
/// ```
/// use bytes::BytesMut;
/// use portico_wire::Request;
///
/// let mut buf = BytesMut::new();
/// Request::Enter { port: 42 }.encode(&mut buf).expect("encode");
/// assert_eq!(buf.as_ref(), &[0x01, 0x2A, 0x00, 0x00, 0x00]);
/// let mut bytes = buf.freeze();
/// let decoded = Request::decode(&mut bytes).expect("decode");
/// assert_eq!(decoded, Request::Enter { port: 42 });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Enter { port: u32 },
    Exit { port: u32 },
    Send { port: u32, body: Bytes },
}

impl Request {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Request::Enter { port } => {
                buf.extend_from_slice(&[VERB_ENTER]);
                buf.extend_from_slice(&port.to_le_bytes());
            }
            Request::Exit { port } => {
                buf.extend_from_slice(&[VERB_EXIT]);
                buf.extend_from_slice(&port.to_le_bytes());
            }
            Request::Send { port, body } => {
                if body.len() > MAX_BODY_LEN {
                    return Err(Error::BodyTooLarge(body.len()));
                }
                buf.extend_from_slice(&[VERB_SEND]);
                buf.extend_from_slice(&port.to_le_bytes());
                buf.extend_from_slice(&(body.len() as u16).to_le_bytes());
                buf.extend_from_slice(body);
            }
        }
        Ok(())
    }

    /// Decode one request from the front of `buf`, advancing past it.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(Error::Incomplete);
        }
        let verb = buf.get_u8();
        if !matches!(verb, VERB_ENTER | VERB_EXIT | VERB_SEND) {
            // Nothing past an unknown verb can be trusted; leave it unread.
            return Err(Error::UnknownVerb(verb));
        }
        if buf.remaining() < 4 {
            return Err(Error::Incomplete);
        }
        let port = buf.get_u32_le();
        match verb {
            VERB_ENTER => Ok(Request::Enter { port }),
            VERB_EXIT => Ok(Request::Exit { port }),
            VERB_SEND => {
                if buf.remaining() < 2 {
                    return Err(Error::Incomplete);
                }
                let size = buf.get_u16_le() as usize;
                if buf.remaining() < size {
                    return Err(Error::Incomplete);
                }
                let body = buf.split_to(size);
                Ok(Request::Send { port, body })
            }
            other => Err(Error::UnknownVerb(other)),
        }
    }
}

/// A message handed to a subscriber: the Recv frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub port: u32,
    pub body: Bytes,
}

impl Delivery {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(Error::BodyTooLarge(self.body.len()));
        }
        buf.extend_from_slice(&[VERB_RECV]);
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf.extend_from_slice(&(self.body.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.body);
        Ok(())
    }
}

/// Outcome of a prior request, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    OkEnter,
    OkExit,
    OkSend,
    ErrType,
    ErrSend,
}

impl Signal {
    pub fn as_byte(self) -> u8 {
        match self {
            Signal::OkEnter => 0x01,
            Signal::OkExit => 0x02,
            Signal::OkSend => 0x03,
            Signal::ErrType => 0x80,
            Signal::ErrSend => 0x83,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Signal::OkEnter),
            0x02 => Ok(Signal::OkExit),
            0x03 => Ok(Signal::OkSend),
            0x80 => Ok(Signal::ErrType),
            0x83 => Ok(Signal::ErrSend),
            other => Err(Error::UnknownSignal(other)),
        }
    }

    pub fn is_error(self) -> bool {
        self.as_byte() & SIGNAL_ERROR_BIT != 0
    }

    pub fn encode(self, buf: &mut BytesMut) {
        buf.extend_from_slice(&[VERB_SIG, self.as_byte()]);
    }
}

/// Server-to-client frame as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(Delivery),
    Signal(Signal),
}

impl Event {
    /// Decode one server frame from the front of `buf`, advancing past it.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(Error::Incomplete);
        }
        match buf.get_u8() {
            VERB_RECV => {
                if buf.remaining() < 6 {
                    return Err(Error::Incomplete);
                }
                let port = buf.get_u32_le();
                let size = buf.get_u16_le() as usize;
                if buf.remaining() < size {
                    return Err(Error::Incomplete);
                }
                let body = buf.split_to(size);
                Ok(Event::Message(Delivery { port, body }))
            }
            VERB_SIG => {
                if buf.remaining() < 1 {
                    return Err(Error::Incomplete);
                }
                Ok(Event::Signal(Signal::from_byte(buf.get_u8())?))
            }
            other => Err(Error::UnknownVerb(other)),
        }
    }
}

// A clean disconnect is only observable at a frame boundary; inside a frame a
// short read is a protocol error.
fn eof_at_boundary(err: io::Error) -> Result<()> {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Ok(())
    } else {
        Err(err.into())
    }
}

async fn read_port<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).await?;
    Ok(u32::from_le_bytes(bytes))
}

async fn read_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut size_bytes = [0u8; 2];
    reader.read_exact(&mut size_bytes).await?;
    let size = u16::from_le_bytes(size_bytes) as usize;
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Read one request frame, loop-completing partial reads.
///
/// Returns `Ok(None)` when the peer closed the connection at a frame
/// boundary. An unknown verb byte is reported without consuming further
/// bytes; the stream cannot be resynchronized after it.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Request>> {
    let verb = match reader.read_u8().await {
        Ok(verb) => verb,
        Err(err) => {
            eof_at_boundary(err)?;
            return Ok(None);
        }
    };
    match verb {
        VERB_ENTER => {
            let port = read_port(reader).await?;
            Ok(Some(Request::Enter { port }))
        }
        VERB_EXIT => {
            let port = read_port(reader).await?;
            Ok(Some(Request::Exit { port }))
        }
        VERB_SEND => {
            let port = read_port(reader).await?;
            let body = read_body(reader).await?;
            Ok(Some(Request::Send { port, body }))
        }
        other => Err(Error::UnknownVerb(other)),
    }
}

/// Read one server frame (message or signal) on the client side.
pub async fn read_event<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Event>> {
    let verb = match reader.read_u8().await {
        Ok(verb) => verb,
        Err(err) => {
            eof_at_boundary(err)?;
            return Ok(None);
        }
    };
    match verb {
        VERB_RECV => {
            let port = read_port(reader).await?;
            let body = read_body(reader).await?;
            Ok(Some(Event::Message(Delivery { port, body })))
        }
        VERB_SIG => {
            let byte = reader.read_u8().await?;
            Ok(Some(Event::Signal(Signal::from_byte(byte)?)))
        }
        other => Err(Error::UnknownVerb(other)),
    }
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(8);
    request.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}

pub async fn write_delivery<W: AsyncWrite + Unpin>(
    writer: &mut W,
    port: u32,
    body: &[u8],
) -> Result<()> {
    if body.len() > MAX_BODY_LEN {
        return Err(Error::BodyTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(7 + body.len());
    buf.extend_from_slice(&[VERB_RECV]);
    buf.extend_from_slice(&port.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u16).to_le_bytes());
    buf.extend_from_slice(body);
    writer.write_all(&buf).await?;
    Ok(())
}

pub async fn write_signal<W: AsyncWrite + Unpin>(writer: &mut W, signal: Signal) -> Result<()> {
    writer.write_all(&[VERB_SIG, signal.as_byte()]).await?;
    Ok(())
}

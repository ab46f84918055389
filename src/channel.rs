//! Transport channels
//!
//! A [`Channel`] is an ordered, blocking transport for protocol messages
//! with byte counters for both directions. [`StreamChannel`] frames over
//! any `Read`/`Write` pair (a TCP stream, files, or the in-memory
//! [`duplex`] used by tests). Closing the peer surfaces as
//! [`ProtocolError::ChannelClosed`] on the next receive, which is how
//! callers cancel blocked operations.
//!
//! Where one stream carries several logical clients, [`RoutedStreamChannel`]
//! prepends a `client_id` byte string to every frame; per client, frames
//! are delivered in send order. [`RoutedClientChannel`] binds one client id
//! onto a routed stream and speaks the plain [`Channel`] interface.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::messages::{
    self, FrameType, ProtocolError, Response, ResultPackage, SenderOperation,
};

/// Blocking, ordered message transport.
pub trait Channel {
    fn send_operation(&mut self, op: &SenderOperation) -> Result<(), ProtocolError>;
    fn receive_operation(&mut self) -> Result<SenderOperation, ProtocolError>;
    fn send_response(&mut self, response: &Response) -> Result<(), ProtocolError>;
    fn receive_response(&mut self) -> Result<Response, ProtocolError>;
    fn send_result_package(&mut self, package: &ResultPackage) -> Result<(), ProtocolError>;
    fn receive_result_package(&mut self) -> Result<ResultPackage, ProtocolError>;
    /// Bytes written so far.
    fn bytes_sent(&self) -> u64;
    /// Bytes read so far.
    fn bytes_received(&self) -> u64;
}

// ============================================================================
// StreamChannel
// ============================================================================

/// Frame transport over any `Read`/`Write` pair.
pub struct StreamChannel<R: Read, W: Write> {
    reader: R,
    writer: W,
    bytes_sent: u64,
    bytes_received: u64,
}

impl<R: Read, W: Write> StreamChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer, bytes_sent: 0, bytes_received: 0 }
    }

    fn send_frame<M: serde::Serialize>(
        &mut self,
        frame_type: FrameType,
        message: &M,
    ) -> Result<(), ProtocolError> {
        let written = messages::write_frame(&mut self.writer, frame_type, message)?;
        self.bytes_sent += written;
        Ok(())
    }

    fn receive_frame<M: serde::de::DeserializeOwned>(
        &mut self,
        expect: impl Fn(FrameType) -> bool,
    ) -> Result<M, ProtocolError> {
        let (frame_type, body_len) = messages::read_frame_header(&mut self.reader)?;
        if !expect(frame_type) {
            return Err(ProtocolError::UnexpectedMessageType(frame_type));
        }
        let message = messages::read_frame_body(&mut self.reader, body_len)?;
        self.bytes_received += messages::frame_bytes(body_len);
        Ok(message)
    }
}

impl<R: Read, W: Write> Channel for StreamChannel<R, W> {
    fn send_operation(&mut self, op: &SenderOperation) -> Result<(), ProtocolError> {
        self.send_frame(op.frame_type(), op)
    }

    fn receive_operation(&mut self) -> Result<SenderOperation, ProtocolError> {
        self.receive_frame(FrameType::is_operation)
    }

    fn send_response(&mut self, response: &Response) -> Result<(), ProtocolError> {
        self.send_frame(response.frame_type(), response)
    }

    fn receive_response(&mut self) -> Result<Response, ProtocolError> {
        self.receive_frame(FrameType::is_response)
    }

    fn send_result_package(&mut self, package: &ResultPackage) -> Result<(), ProtocolError> {
        self.send_frame(FrameType::ResultPackage, package)
    }

    fn receive_result_package(&mut self) -> Result<ResultPackage, ProtocolError> {
        self.receive_frame(|t| t == FrameType::ResultPackage)
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

// ============================================================================
// TCP transport
// ============================================================================

/// A stream channel over a buffered TCP connection.
pub type TcpChannel = StreamChannel<io::BufReader<TcpStream>, io::BufWriter<TcpStream>>;

fn tcp_channel(stream: TcpStream) -> io::Result<TcpChannel> {
    stream.set_nodelay(true)?;
    let reader = io::BufReader::new(stream.try_clone()?);
    Ok(StreamChannel::new(reader, io::BufWriter::new(stream)))
}

/// Connect to a listening sender.
pub fn connect_tcp(addr: impl ToSocketAddrs) -> io::Result<TcpChannel> {
    tcp_channel(TcpStream::connect(addr)?)
}

/// Accept one receiver connection.
pub fn accept_tcp(listener: &TcpListener) -> io::Result<TcpChannel> {
    let (stream, _peer) = listener.accept()?;
    tcp_channel(stream)
}

// ============================================================================
// Routed framing (client_id-prefixed)
// ============================================================================

/// Opaque client identity prepended to frames on multiplexed streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub Vec<u8>);

impl ClientId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

/// A stream carrying frames for several clients: every frame is preceded by
/// a length-prefixed `client_id`. Per client id, delivery order equals send
/// order (the stream itself is ordered).
pub struct RoutedStreamChannel<R: Read, W: Write> {
    reader: R,
    writer: W,
    bytes_sent: u64,
    bytes_received: u64,
}

impl<R: Read, W: Write> RoutedStreamChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer, bytes_sent: 0, bytes_received: 0 }
    }

    fn write_client_id(&mut self, id: &ClientId) -> Result<(), ProtocolError> {
        self.writer.write_all(&(id.0.len() as u32).to_le_bytes())?;
        self.writer.write_all(&id.0)?;
        self.bytes_sent += 4 + id.0.len() as u64;
        Ok(())
    }

    fn read_client_id(&mut self) -> Result<ClientId, ProtocolError> {
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        let mut id = vec![0u8; len];
        self.reader.read_exact(&mut id)?;
        self.bytes_received += 4 + len as u64;
        Ok(ClientId(id))
    }

    fn send_frame_to<M: serde::Serialize>(
        &mut self,
        id: &ClientId,
        frame_type: FrameType,
        message: &M,
    ) -> Result<(), ProtocolError> {
        self.write_client_id(id)?;
        let written = messages::write_frame(&mut self.writer, frame_type, message)?;
        self.bytes_sent += written;
        Ok(())
    }

    fn receive_frame_from<M: serde::de::DeserializeOwned>(
        &mut self,
        expect: impl Fn(FrameType) -> bool,
    ) -> Result<(ClientId, M), ProtocolError> {
        let id = self.read_client_id()?;
        let (frame_type, body_len) = messages::read_frame_header(&mut self.reader)?;
        if !expect(frame_type) {
            return Err(ProtocolError::UnexpectedMessageType(frame_type));
        }
        let message = messages::read_frame_body(&mut self.reader, body_len)?;
        self.bytes_received += messages::frame_bytes(body_len);
        Ok((id, message))
    }

    pub fn send_operation_as(
        &mut self,
        id: &ClientId,
        op: &SenderOperation,
    ) -> Result<(), ProtocolError> {
        self.send_frame_to(id, op.frame_type(), op)
    }

    pub fn receive_operation_from(
        &mut self,
    ) -> Result<(ClientId, SenderOperation), ProtocolError> {
        self.receive_frame_from(FrameType::is_operation)
    }

    pub fn send_response_to(
        &mut self,
        id: &ClientId,
        response: &Response,
    ) -> Result<(), ProtocolError> {
        self.send_frame_to(id, response.frame_type(), response)
    }

    pub fn receive_response_from(&mut self) -> Result<(ClientId, Response), ProtocolError> {
        self.receive_frame_from(FrameType::is_response)
    }

    pub fn send_result_package_to(
        &mut self,
        id: &ClientId,
        package: &ResultPackage,
    ) -> Result<(), ProtocolError> {
        self.send_frame_to(id, FrameType::ResultPackage, package)
    }

    pub fn receive_result_package_from(
        &mut self,
    ) -> Result<(ClientId, ResultPackage), ProtocolError> {
        self.receive_frame_from(|t| t == FrameType::ResultPackage)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

/// One client's view of a routed stream: sends carry its id, receives
/// demand it.
pub struct RoutedClientChannel<R: Read, W: Write> {
    inner: RoutedStreamChannel<R, W>,
    id: ClientId,
}

impl<R: Read, W: Write> RoutedClientChannel<R, W> {
    pub fn new(id: ClientId, reader: R, writer: W) -> Self {
        Self { inner: RoutedStreamChannel::new(reader, writer), id }
    }

    fn expect_own<M>(&self, (id, message): (ClientId, M)) -> Result<M, ProtocolError> {
        if id != self.id {
            return Err(ProtocolError::MalformedMessage(format!(
                "frame routed to foreign client id ({} bytes)",
                id.0.len()
            )));
        }
        Ok(message)
    }
}

impl<R: Read, W: Write> Channel for RoutedClientChannel<R, W> {
    fn send_operation(&mut self, op: &SenderOperation) -> Result<(), ProtocolError> {
        let id = self.id.clone();
        self.inner.send_operation_as(&id, op)
    }

    fn receive_operation(&mut self) -> Result<SenderOperation, ProtocolError> {
        let got = self.inner.receive_operation_from()?;
        self.expect_own(got)
    }

    fn send_response(&mut self, response: &Response) -> Result<(), ProtocolError> {
        let id = self.id.clone();
        self.inner.send_response_to(&id, response)
    }

    fn receive_response(&mut self) -> Result<Response, ProtocolError> {
        let got = self.inner.receive_response_from()?;
        self.expect_own(got)
    }

    fn send_result_package(&mut self, package: &ResultPackage) -> Result<(), ProtocolError> {
        let id = self.id.clone();
        self.inner.send_result_package_to(&id, package)
    }

    fn receive_result_package(&mut self) -> Result<ResultPackage, ProtocolError> {
        let got = self.inner.receive_result_package_from()?;
        self.expect_own(got)
    }

    fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent()
    }

    fn bytes_received(&self) -> u64 {
        self.inner.bytes_received()
    }
}

// ============================================================================
// In-memory pipe (blocking, for tests and in-process wiring)
// ============================================================================

struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

struct PipeShared {
    state: Mutex<PipeState>,
    ready: Condvar,
}

/// Writing half of an in-memory pipe. Cloning shares the same stream;
/// the stream closes when the last writer drops.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl Clone for PipeWriter {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

/// Reading half of an in-memory pipe.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

/// A unidirectional in-memory byte pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState { buf: VecDeque::new(), closed: false }),
        ready: Condvar::new(),
    });
    (PipeWriter { shared: shared.clone() }, PipeReader { shared })
}

/// A connected pair of stream channels over in-memory pipes.
pub fn duplex() -> (
    StreamChannel<PipeReader, PipeWriter>,
    StreamChannel<PipeReader, PipeWriter>,
) {
    let (a_writer, b_reader) = pipe();
    let (b_writer, a_reader) = pipe();
    (StreamChannel::new(a_reader, a_writer), StreamChannel::new(b_reader, b_writer))
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.buf.extend(data);
        self.shared.ready.notify_all();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        // Last writer closes the stream; readers then observe EOF.
        if Arc::strong_count(&self.shared) <= 2 {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.ready.notify_all();
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        while state.buf.is_empty() && !state.closed {
            self.shared.ready.wait(&mut state);
        }
        if state.buf.is_empty() {
            return Ok(0); // EOF
        }
        let n = out.len().min(state.buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = state.buf.pop_front().expect("n <= len");
        }
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        self.shared.ready.notify_all();
    }
}

// ============================================================================
// Tests
// ============================================================================

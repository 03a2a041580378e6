//! Byte-level instrument I/O with per-operation deadlines.
//!
//! A [Transport] owns exactly one [ByteStream] and layers the line-oriented
//! framing of the instrument protocol on top of it: every frame is ASCII and
//! terminated by the `0x0D` end-of-line sentinel ([EOL](crate::EOL)).
//!
//! The concrete stream is an external collaborator: anything implementing
//! `AsyncRead + AsyncWrite` (a TCP tunnel, a named pipe, a USB-serial
//! adapter) is a [ByteStream], and [SerialStream](crate::serial::SerialStream)
//! bridges a blocking serial port.

use std::time::Duration;

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, SerialPortBuilder, StopBits};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::{Error, Result, BAUD_RATES, DEFAULT_BAUD, DEFAULT_TIMEOUT_MS, EOL};

/// Serial link parameters for an instrument port.
///
/// Instruments ship with 115200 baud, 8 data bits, one stop bit, no parity,
/// no flow control. Only the baud rate and deadline are adjustable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialConfig {
    port: String,
    baud: u32,
    timeout: Duration,
}

impl SerialConfig {
    /// Creates a config for the given port with default baud and deadline.
    pub fn new<S>(port: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            port: port.into(),
            baud: DEFAULT_BAUD,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Sets the baud rate, validated against the instrument's supported set.
    pub fn with_baud(mut self, baud: u32) -> Result<Self> {
        if !BAUD_RATES.contains(&baud) {
            return Err(Error::invalid_argument(format!(
                "unsupported baud rate: {baud}, valid: {BAUD_RATES:?}"
            )));
        }

        self.baud = baud;
        Ok(self)
    }

    /// Sets the per-operation deadline in milliseconds.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Duration::from_millis(ms);
        self
    }

    /// Get the port identifier.
    pub fn port(&self) -> &str {
        self.port.as_str()
    }

    /// Get the baud rate.
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Get the per-operation deadline.
    pub fn deadline(&self) -> Duration {
        self.timeout
    }

    /// Builds the `serialport` settings for this config (8N1, no flow control).
    pub fn builder(&self) -> SerialPortBuilder {
        serialport::new(self.port.as_str(), self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
    }
}

/// Raw byte stream under a [Transport].
///
/// Implementations must not buffer across calls: `recv` returns as soon as
/// at least one byte is available.
#[async_trait]
pub trait ByteStream: Send {
    /// Send the full buffer.
    async fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Receive up to `len` bytes, waiting for at least one.
    async fn recv(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Release the stream.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl<S> ByteStream for S
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf).await?;
        self.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let read = self.read(&mut buf).await?;

        if read == 0 {
            return Err(Error::closed("stream reached end of input"));
        }

        buf.truncate(read);
        Ok(buf)
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown().await?;
        Ok(())
    }
}

/// One instrument link: a [ByteStream] plus deadline-bounded frame primitives.
///
/// The stream is opened once per handle and released by [close](Self::close);
/// every operation on a closed transport fails with `TransportClosed`. On a
/// timeout the partial buffer is discarded and the transport remains usable.
pub struct Transport {
    stream: Option<Box<dyn ByteStream>>,
    deadline: Duration,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("stream", &self.stream.as_ref().map(|_| ".."))
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Transport {
    /// Creates a transport over an already-open stream.
    pub fn new(stream: Box<dyn ByteStream>, deadline: Duration) -> Self {
        Self {
            stream: Some(stream),
            deadline,
        }
    }

    /// Creates a transport from any async byte stream.
    pub fn from_stream<S>(stream: S, deadline: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(Box::new(stream), deadline)
    }

    /// Gets whether the transport still owns its stream.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Get the per-operation deadline.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    fn stream_mut(&mut self) -> Result<&mut Box<dyn ByteStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::closed("transport already closed"))
    }

    /// Releases the underlying stream.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.close().await?;
        }

        Ok(())
    }

    /// Sends `payload` followed by the end-of-line sentinel.
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        if !payload.is_ascii() {
            return Err(Error::decode("non-ASCII byte in command payload"));
        }

        let deadline = self.deadline;
        let stream = self.stream_mut()?;

        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.extend_from_slice(payload);
        frame.push(EOL);

        timeout(deadline, stream.send(&frame))
            .await
            .map_err(|_| Error::timeout("write not drained within deadline"))?
    }

    /// Reads up to `len` bytes, failing if none arrive before the deadline.
    pub async fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let deadline = self.deadline;
        let stream = self.stream_mut()?;

        timeout(deadline, stream.recv(len))
            .await
            .map_err(|_| Error::timeout("no byte arrived within deadline"))?
    }

    /// Reads one line, decoded as ASCII without the end-of-line sentinel.
    ///
    /// Terminates at the sentinel, or at a deadline gap after at least one
    /// byte arrived (the partial line is returned). A deadline gap with zero
    /// bytes received fails with `Timeout`.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();

        loop {
            match self.read(1).await {
                Ok(bytes) => {
                    if bytes.first() == Some(&EOL) {
                        break;
                    }

                    line.extend_from_slice(&bytes);
                }
                Err(err) if err.is_timeout() => {
                    if line.is_empty() {
                        return Err(err);
                    }

                    break;
                }
                Err(err) => return Err(err),
            }
        }

        decode_ascii(&line)
    }

    /// Reads until an inter-byte gap of one deadline elapses, splitting on
    /// the end-of-line sentinel.
    ///
    /// Returns the complete lines received; a silent device yields an empty
    /// list rather than an error.
    pub async fn read_all(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut line = Vec::new();

        loop {
            match self.read(1).await {
                Ok(bytes) => {
                    if bytes.first() == Some(&EOL) {
                        lines.push(decode_ascii(&line)?);
                        line.clear();
                    } else {
                        line.extend_from_slice(&bytes);
                    }
                }
                Err(err) if err.is_timeout() => break,
                Err(err) => return Err(err),
            }
        }

        Ok(lines)
    }

    /// Atomically write a command and read one reply line.
    pub async fn write_read_line(&mut self, command: &str) -> Result<String> {
        self.write(command.as_bytes()).await?;
        self.read_line().await
    }

    /// Atomically write a command and read every reply line until idle.
    pub async fn write_read_all(&mut self, command: &str) -> Result<Vec<String>> {
        self.write(command.as_bytes()).await?;
        self.read_all().await
    }
}

fn decode_ascii(bytes: &[u8]) -> Result<String> {
    if !bytes.is_ascii() {
        return Err(Error::decode(format!(
            "non-ASCII byte in response: {bytes:?}"
        )));
    }

    Ok(std::str::from_utf8(bytes)?.to_string())
}

//! Bridge from a blocking `serialport` stream to the async [ByteStream]
//! contract.
//!
//! Each operation runs on the blocking pool and is bounded by the port's
//! native timeout, so a caller cancelled at the transport deadline never
//! leaves the port in a torn state: the orphaned operation finishes in the
//! background and releases the port for the next call.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::transport::{ByteStream, SerialConfig, Transport};
use crate::{Error, Result};

type SharedPort = Arc<Mutex<Option<Box<dyn serialport::SerialPort>>>>;

/// A blocking serial port adapted to [ByteStream].
pub struct SerialStream {
    port: SharedPort,
}

impl SerialStream {
    /// Opens the port described by `config`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = config.builder().open()?;

        Ok(Self {
            port: Arc::new(Mutex::new(Some(port))),
        })
    }

    fn shared(&self) -> SharedPort {
        Arc::clone(&self.port)
    }
}

/// Opens a serial port and wraps it in a [Transport] with the config's
/// deadline.
pub fn connect(config: &SerialConfig) -> Result<Transport> {
    let stream = SerialStream::open(config)?;
    Ok(Transport::new(Box::new(stream), config.deadline()))
}

fn lock_port(
    port: &SharedPort,
) -> Result<std::sync::MutexGuard<'_, Option<Box<dyn serialport::SerialPort>>>> {
    port.lock()
        .map_err(|_| Error::failure("serial worker panicked while holding the port"))
}

#[async_trait]
impl ByteStream for SerialStream {
    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let shared = self.shared();
        let frame = buf.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = lock_port(&shared)?;
            let port = guard
                .as_mut()
                .ok_or_else(|| Error::closed("serial port released"))?;

            port.write_all(&frame)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|err| Error::failure(format!("serial worker: {err}")))?
    }

    async fn recv(&mut self, len: usize) -> Result<Vec<u8>> {
        let shared = self.shared();

        tokio::task::spawn_blocking(move || {
            let mut guard = lock_port(&shared)?;
            let port = guard
                .as_mut()
                .ok_or_else(|| Error::closed("serial port released"))?;

            let mut buf = vec![0u8; len];
            let read = port.read(&mut buf)?;

            if read == 0 {
                return Err(Error::closed("serial port reached end of input"));
            }

            buf.truncate(read);
            Ok(buf)
        })
        .await
        .map_err(|err| Error::failure(format!("serial worker: {err}")))?
    }

    async fn close(&mut self) -> Result<()> {
        let shared = self.shared();

        tokio::task::spawn_blocking(move || {
            // Dropping the port closes the file descriptor.
            lock_port(&shared)?.take();
            Ok(())
        })
        .await
        .map_err(|err| Error::failure(format!("serial worker: {err}")))?
    }
}

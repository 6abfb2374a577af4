//! Serial channel with exclusive read and write handles.
//!
//! A [`Channel`] owns the two halves of an open port. At most one
//! [`ReadHandle`] and one [`WriteHandle`] can be out at a time; a second
//! acquisition fails immediately instead of queueing. Each handle carries a
//! lease token so a stuck holder can be forced off the port.

use bytes::{Bytes, BytesMut};
use fidget_core::Command;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;

const READ_CHUNK: usize = 1024;

/// A byte stream a port can be driven through.
pub trait PortStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PortStream for T {}

pub type BoxedStream = Box<dyn PortStream>;

/// Opens the device port.
pub trait PortOpener: Send + Sync {
    fn open(&self) -> Result<Channel, TransportError>;
}

enum Slot<T> {
    Free(T),
    Leased(CancellationToken),
    Closed,
}

impl<T> Slot<T> {
    fn is_leased(&self) -> bool {
        matches!(self, Slot::Leased(_))
    }
}

struct ChannelInner {
    name: String,
    reader: Mutex<Slot<ReadHalf<BoxedStream>>>,
    writer: Mutex<Slot<WriteHalf<BoxedStream>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An open port. Cloning shares the same port.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("reader_locked", &self.is_reader_locked())
            .field("writer_locked", &self.is_writer_locked())
            .finish()
    }
}

/// Which handles a force unlock found leased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForceUnlock {
    pub reader: bool,
    pub writer: bool,
}

impl ForceUnlock {
    pub fn exercised(&self) -> bool {
        self.reader || self.writer
    }
}

impl Channel {
    pub fn new(name: impl Into<String>, stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                reader: Mutex::new(Slot::Free(read_half)),
                writer: Mutex::new(Slot::Free(write_half)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn acquire_reader(&self) -> Result<ReadHandle, TransportError> {
        let mut slot = lock(&self.inner.reader);
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Free(half) => {
                let lease = CancellationToken::new();
                *slot = Slot::Leased(lease.clone());
                Ok(ReadHandle {
                    half: Some(half),
                    lease,
                    channel: self.clone(),
                })
            }
            Slot::Leased(lease) => {
                *slot = Slot::Leased(lease);
                Err(TransportError::ReaderLocked)
            }
            Slot::Closed => Err(TransportError::Closed),
        }
    }

    pub fn acquire_writer(&self) -> Result<WriteHandle, TransportError> {
        let mut slot = lock(&self.inner.writer);
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Free(half) => {
                let lease = CancellationToken::new();
                *slot = Slot::Leased(lease.clone());
                Ok(WriteHandle {
                    half: Some(half),
                    lease,
                    channel: self.clone(),
                })
            }
            Slot::Leased(lease) => {
                *slot = Slot::Leased(lease);
                Err(TransportError::WriterLocked)
            }
            Slot::Closed => Err(TransportError::Closed),
        }
    }

    pub fn is_reader_locked(&self) -> bool {
        lock(&self.inner.reader).is_leased()
    }

    pub fn is_writer_locked(&self) -> bool {
        lock(&self.inner.writer).is_leased()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*lock(&self.inner.reader), Slot::Closed)
            && matches!(*lock(&self.inner.writer), Slot::Closed)
    }

    /// Breaks outstanding leases so their holders' pending operations return
    /// [`TransportError::Aborted`], then proves each lock is free by taking
    /// and returning a temporary handle.
    pub fn force_unlock(&self) -> ForceUnlock {
        let mut report = ForceUnlock::default();

        if let Slot::Leased(lease) = &*lock(&self.inner.reader) {
            lease.cancel();
            report.reader = true;
        }
        if let Slot::Leased(lease) = &*lock(&self.inner.writer) {
            lease.cancel();
            report.writer = true;
        }

        if report.reader {
            match self.acquire_reader() {
                Ok(temp) => temp.release(),
                Err(e) => warn!("could not force unlock readable stream: {}", e),
            }
        }
        if report.writer {
            match self.acquire_writer() {
                Ok(temp) => temp.release(),
                Err(e) => warn!("could not force unlock writable stream: {}", e),
            }
        }
        report
    }

    /// Closes the port. Fails with [`TransportError::StillLocked`] while a
    /// handle is out; closing twice is a no-op.
    pub fn close(&self) -> Result<(), TransportError> {
        let mut reader = lock(&self.inner.reader);
        let mut writer = lock(&self.inner.writer);
        match (reader.is_leased(), writer.is_leased()) {
            (true, true) => return Err(TransportError::StillLocked("readable and writable")),
            (true, false) => return Err(TransportError::StillLocked("readable")),
            (false, true) => return Err(TransportError::StillLocked("writable")),
            (false, false) => {}
        }
        // Dropping both halves drops the port.
        *reader = Slot::Closed;
        *writer = Slot::Closed;
        debug!("closed port {}", self.inner.name);
        Ok(())
    }

    fn return_reader(&self, half: ReadHalf<BoxedStream>) {
        let mut slot = lock(&self.inner.reader);
        if slot.is_leased() {
            *slot = Slot::Free(half);
        }
    }

    fn return_writer(&self, half: WriteHalf<BoxedStream>) {
        let mut slot = lock(&self.inner.writer);
        if slot.is_leased() {
            *slot = Slot::Free(half);
        }
    }
}

/// Exclusive read access. Released on drop.
pub struct ReadHandle {
    half: Option<ReadHalf<BoxedStream>>,
    lease: CancellationToken,
    channel: Channel,
}

impl ReadHandle {
    /// Reads the next chunk. `None` means the device closed the stream.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        let half = self.half.as_mut().ok_or(TransportError::Aborted)?;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        tokio::select! {
            biased;
            _ = self.lease.cancelled() => Err(TransportError::Aborted),
            read = half.read_buf(&mut buf) => match read? {
                0 => Ok(None),
                _ => Ok(Some(buf.freeze())),
            },
        }
    }

    pub fn release(self) {}
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if let Some(half) = self.half.take() {
            self.channel.return_reader(half);
        }
    }
}

/// Exclusive write access. Released on drop.
pub struct WriteHandle {
    half: Option<WriteHalf<BoxedStream>>,
    lease: CancellationToken,
    channel: Channel,
}

impl WriteHandle {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let half = self.half.as_mut().ok_or(TransportError::Aborted)?;
        tokio::select! {
            biased;
            _ = self.lease.cancelled() => Err(TransportError::Aborted),
            written = async {
                half.write_all(bytes).await?;
                half.flush().await
            } => Ok(written?),
        }
    }

    pub async fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        debug!("sending {}", command);
        self.write(&command.encode()).await
    }

    pub fn release(self) {}
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if let Some(half) = self.half.take() {
            self.channel.return_writer(half);
        }
    }
}

/// In-memory port backed by `tokio::io::duplex`.
///
/// Each [`MemoryPort::attach`] queues one host-side stream for the next
/// `open` and returns the device side.
#[derive(Clone, Default)]
pub struct MemoryPort {
    pending: Arc<Mutex<VecDeque<DuplexStream>>>,
}

impl MemoryPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, max_buf_size: usize) -> DuplexStream {
        let (host, device) = tokio::io::duplex(max_buf_size);
        lock(&self.pending).push_back(host);
        device
    }
}

impl PortOpener for MemoryPort {
    fn open(&self) -> Result<Channel, TransportError> {
        let stream = lock(&self.pending)
            .pop_front()
            .ok_or_else(|| TransportError::PortUnavailable("no device attached".into()))?;
        Ok(Channel::new("memory", Box::new(stream)))
    }
}

/// A serial port the host can see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub usb: bool,
    pub description: Option<String>,
}

/// Opens a serial port, by name or the first USB serial port found.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    port: Option<String>,
    baud_rate: u32,
}

impl SerialOpener {
    pub fn new(port: Option<String>, baud_rate: u32) -> Self {
        Self { port, baud_rate }
    }
}

#[cfg(feature = "serial")]
mod serial {
    use super::*;
    use tokio_serial::{SerialPortBuilderExt, SerialPortType};
    use tracing::info;

    pub fn available_ports() -> Result<Vec<PortInfo>, TransportError> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| TransportError::PortUnavailable(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    name: port.port_name,
                    usb: true,
                    description: usb.product.or(usb.manufacturer),
                },
                _ => PortInfo {
                    name: port.port_name,
                    usb: false,
                    description: None,
                },
            })
            .collect())
    }

    fn detect_port() -> Result<String, TransportError> {
        let ports = available_ports()?;
        ports
            .iter()
            .find(|p| p.usb)
            .or_else(|| ports.first())
            .map(|p| p.name.clone())
            .ok_or_else(|| TransportError::PortUnavailable("no serial ports found".into()))
    }

    impl PortOpener for SerialOpener {
        fn open(&self) -> Result<Channel, TransportError> {
            let name = match &self.port {
                Some(name) => name.clone(),
                None => detect_port()?,
            };
            let stream = tokio_serial::new(&name, self.baud_rate)
                .open_native_async()
                .map_err(|e| TransportError::PortUnavailable(format!("{}: {}", name, e)))?;
            info!("opened serial port {} at {} baud", name, self.baud_rate);
            Ok(Channel::new(name, Box::new(stream)))
        }
    }
}

#[cfg(not(feature = "serial"))]
mod serial {
    use super::*;

    pub fn available_ports() -> Result<Vec<PortInfo>, TransportError> {
        Err(TransportError::NoHardwareSupport)
    }

    impl PortOpener for SerialOpener {
        fn open(&self) -> Result<Channel, TransportError> {
            debug!(
                "serial support not built; cannot open {:?} at {} baud",
                self.port, self.baud_rate
            );
            Err(TransportError::NoHardwareSupport)
        }
    }
}

pub use serial::available_ports;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn second_acquire_fails_fast() {
        let port = MemoryPort::new();
        let _device = port.attach(64);
        let channel = port.open().unwrap();

        let reader = channel.acquire_reader().unwrap();
        let writer = channel.acquire_writer().unwrap();
        assert!(matches!(
            channel.acquire_reader(),
            Err(TransportError::ReaderLocked)
        ));
        assert!(matches!(
            channel.acquire_writer(),
            Err(TransportError::WriterLocked)
        ));

        reader.release();
        writer.release();
        assert!(!channel.is_reader_locked());
        assert!(channel.acquire_reader().is_ok());
    }

    #[tokio::test]
    async fn close_refuses_while_locked() {
        let port = MemoryPort::new();
        let _device = port.attach(64);
        let channel = port.open().unwrap();

        let writer = channel.acquire_writer().unwrap();
        assert!(matches!(
            channel.close(),
            Err(TransportError::StillLocked("writable"))
        ));
        drop(writer);
        channel.close().unwrap();
        assert!(channel.is_closed());
        channel.close().unwrap();
        assert!(matches!(channel.acquire_reader(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn close_ends_device_stream() {
        let port = MemoryPort::new();
        let mut device = port.attach(64);
        let channel = port.open().unwrap();
        channel.close().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(device.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reads_and_writes_reach_the_device() {
        let port = MemoryPort::new();
        let mut device = port.attach(64);
        let channel = port.open().unwrap();

        let mut writer = channel.acquire_writer().unwrap();
        writer.send(&Command::Connect).await.unwrap();
        let mut buf = [0u8; 8];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"C");

        device.write_all(b"N\r\n").await.unwrap();
        let mut reader = channel.acquire_reader().unwrap();
        let chunk = reader.read_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"N\r\n");

        drop(device);
        assert!(reader.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_unlock_aborts_pending_read() {
        let port = MemoryPort::new();
        let _device = port.attach(64);
        let channel = port.open().unwrap();

        let mut reader = channel.acquire_reader().unwrap();
        let holder = tokio::spawn(async move {
            let result = reader.read_chunk().await;
            drop(reader);
            result
        });
        tokio::task::yield_now().await;

        let report = channel.force_unlock();
        assert!(report.reader);
        assert!(!report.writer);
        assert!(matches!(
            holder.await.unwrap(),
            Err(TransportError::Aborted)
        ));
        assert!(!channel.is_reader_locked());
        channel.close().unwrap();
    }

    #[test]
    fn open_without_device_is_unavailable() {
        let port = MemoryPort::new();
        assert!(matches!(
            port.open(),
            Err(TransportError::PortUnavailable(_))
        ));
    }
}

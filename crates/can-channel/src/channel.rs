use crate::{
    CanId, CanMessage, CanSocketApi, ChannelConfig, ChannelError, RawCanFilter, Result,
    Timestamp, CAN_EFF_FLAG, CAN_MAX_DATA_LENGTH, CAN_SFF_MASK,
};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

#[cfg(feature = "metrics")]
use crate::ChannelMetrics;

/// Readiness wait used when no timeout is given.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(3000);
/// Spacing between batch sends when no delay is given.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(20);

// Upper bound on the up-front allocation for a batch receive.
const BATCH_PREALLOC: usize = 64;

// Everything behind the receive guard.
#[derive(Debug)]
struct RxState {
    filter_mask: u32,
    filter_id: u32,
    default_sender_id: CanId,
    pending: i32,
}

/// A raw CAN socket bound to one interface.
///
/// All methods take `&self`; share the channel between threads with an
/// `Arc`. Receiving, waiting, filter changes and `close` serialise on one
/// guard while sends serialise on another, so a reader parked in
/// [`wait_for_frames`](Self::wait_for_frames) never holds up a writer.
///
/// A channel that exists is bound: construction either completes every
/// setup step or returns the error and releases the socket. Dropping an
/// open channel closes it.
pub struct CanChannel<S: CanSocketApi> {
    api: S,
    interface: String,
    protocol: i32,
    socket: AtomicI32,
    wait_timeout: Duration,
    batch_delay: Duration,
    rx: Mutex<RxState>,
    tx: Mutex<()>,
    #[cfg(feature = "metrics")]
    metrics: Option<ChannelMetrics>,
}

impl<S: CanSocketApi> CanChannel<S> {
    /// Open and bind `interface`, installing `{default_sender_id, filter_mask}`
    /// as the acceptance filter before the bind.
    pub fn new(
        api: S,
        interface: impl Into<String>,
        protocol: i32,
        filter_mask: u32,
        default_sender_id: CanId,
    ) -> Result<Self> {
        let channel = Self {
            api,
            interface: interface.into(),
            protocol,
            socket: AtomicI32::new(-1),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            batch_delay: DEFAULT_BATCH_DELAY,
            rx: Mutex::new(RxState {
                filter_mask,
                filter_id: 0,
                default_sender_id,
                pending: 0,
            }),
            tx: Mutex::new(()),
            #[cfg(feature = "metrics")]
            metrics: None,
        };
        // On error `channel` drops here, which closes a socket already created.
        channel.initialise()?;
        Ok(channel)
    }

    pub fn open(api: S, config: &ChannelConfig) -> Result<Self> {
        let mut channel = Self::new(
            api,
            config.interface.clone(),
            config.protocol,
            config.filter_mask,
            config.default_sender()?,
        )?;
        channel.wait_timeout = config.wait_timeout();
        channel.batch_delay = config.batch_delay();
        Ok(channel)
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: ChannelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn initialise(&self) -> Result<()> {
        let fd = self
            .api
            .open_socket(self.protocol)
            .map_err(|e| ChannelError::init("FAILED to initialise socketcan", &e))?;
        self.socket.store(fd, Ordering::Release);

        let ifindex = self.api.interface_index(fd, &self.interface).map_err(|e| {
            ChannelError::init(
                format!("FAILED to resolve interface {}", self.interface),
                &e,
            )
        })?;
        self.api.set_nonblocking(fd).map_err(|e| {
            ChannelError::init(format!("FAILED to set socket {fd} non-blocking"), &e)
        })?;

        {
            let mut rx = self.rx.lock();
            let mask = rx.filter_mask;
            self.install_filter(fd, &mut rx, mask, 0)?;
        }

        self.api
            .bind(fd, ifindex)
            .map_err(|e| ChannelError::init(format!("FAILED to bind to {}", self.interface), &e))?;
        debug!(
            interface = %self.interface,
            protocol = self.protocol,
            fd,
            ifindex,
            "CAN channel bound"
        );
        Ok(())
    }

    fn require_open(&self) -> Result<i32> {
        let fd = self.socket.load(Ordering::Acquire);
        if fd < 0 {
            return Err(ChannelError::InvalidSocket { socket: fd });
        }
        Ok(fd)
    }

    /// Close the socket. Closing a channel that is not open is an error.
    ///
    /// Only the receive guard is held, so callers must not close while a
    /// [`send_frame`](Self::send_frame) is in flight on another thread.
    pub fn close(&self) -> Result<()> {
        let _rx = self.rx.lock();
        let fd = self.socket.load(Ordering::Acquire);
        if fd < 0 {
            return Err(ChannelError::close(
                "cannot close an invalid socket",
                fd,
                None,
            ));
        }
        self.api
            .close(fd)
            .map_err(|e| ChannelError::close("FAILED to close CAN socket", fd, Some(&e)))?;
        self.socket.store(-1, Ordering::Release);
        debug!(interface = %self.interface, fd, "CAN channel closed");
        Ok(())
    }

    /// Block up to `timeout` (default 3 s) until at least one frame is
    /// readable. A zero timeout polls.
    ///
    /// The readiness count is kept as [`pending_frame_count`](Self::pending_frame_count)
    /// for the next [`receive_frame_batch`](Self::receive_frame_batch).
    pub fn wait_for_frames(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut rx = self.rx.lock();
        let fd = self.require_open()?;
        let timeout = timeout.unwrap_or(self.wait_timeout);
        match self.api.poll_readable(fd, timeout) {
            Ok(ready) => {
                rx.pending = ready;
                trace!(fd, ready, ?timeout, "readiness wait");
                Ok(ready > 0)
            }
            Err(e) => {
                rx.pending = 0;
                self.record_error();
                Err(ChannelError::io("FAILED to wait for CAN frames", fd, &e))
            }
        }
    }

    /// Read one frame.
    pub fn receive_frame(&self) -> Result<CanMessage> {
        let rx = self.rx.lock();
        let fd = self.require_open()?;
        self.read_one(fd, &rx).map_err(|e| {
            self.record_error();
            ChannelError::io("FAILED to read from CAN", fd, &e)
        })
    }

    /// Read the frames the last [`wait_for_frames`](Self::wait_for_frames)
    /// reported, in arrival order, under a single hold of the receive guard.
    ///
    /// The count is a hint: reading stops early once the socket has nothing
    /// left, and the count is cleared by the drain.
    pub fn receive_frame_batch(&self) -> Result<Vec<CanMessage>> {
        let mut rx = self.rx.lock();
        let fd = self.require_open()?;
        let expected = usize::try_from(rx.pending).unwrap_or(0);
        rx.pending = 0;

        let mut frames = Vec::with_capacity(expected.min(BATCH_PREALLOC));
        for _ in 0..expected {
            match self.read_one(fd, &rx) {
                Ok(msg) => frames.push(msg),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    warn!(fd, expected, read = frames.len(), "pending count was stale");
                    break;
                }
                Err(e) => {
                    self.record_error();
                    return Err(ChannelError::io("FAILED to read from CAN", fd, &e));
                }
            }
        }
        debug!(fd, frames = frames.len(), "batch receive");
        Ok(frames)
    }

    // Never locks; the `RxState` borrow is only reachable through the held guard.
    fn read_one(&self, fd: i32, _rx: &RxState) -> io::Result<CanMessage> {
        let raw = self.api.read_frame(fd)?;
        let msg = CanMessage::from_raw(raw).with_timestamp(Timestamp::now());
        trace!(fd, id = %msg.id(), len = msg.len(), "frame received");
        self.record_rx();
        Ok(msg)
    }

    /// Send one frame and return the bytes written (one full kernel frame).
    ///
    /// The extended-format flag is set when `force_extended` is true or the
    /// identifier does not fit in 11 bits. An identifier built with
    /// [`CanId::extended`] keeps the flag even when `force_extended` is false.
    ///
    /// The send guard does not exclude [`close`](Self::close); do not close
    /// the channel while sends are in flight.
    pub fn send_frame(&self, message: &CanMessage, force_extended: bool) -> Result<usize> {
        let fd = self.require_open()?;
        let _tx = self.tx.lock();

        if message.len() > CAN_MAX_DATA_LENGTH {
            return Err(ChannelError::Validation {
                message: format!(
                    "INVALID data length {}! Message must be at most {CAN_MAX_DATA_LENGTH} bytes",
                    message.len()
                ),
                socket: fd,
            });
        }

        let mut raw = message.raw_frame();
        if force_extended || message.id().raw() > CAN_SFF_MASK {
            raw.can_id |= CAN_EFF_FLAG;
        }

        let written = self.api.write_frame(fd, &raw).map_err(|e| {
            self.record_error();
            ChannelError::io("FAILED to write data to socket", fd, &e)
        })?;
        trace!(fd, can_id = raw.can_id, written, "frame sent");
        self.record_tx(written);
        Ok(written)
    }

    /// Send `messages` in order, sleeping `delay` (default 20 ms) between
    /// consecutive frames. Returns the total bytes written.
    ///
    /// Stops at the first failure; frames before it stay sent and frames
    /// after it are never attempted.
    pub fn send_frame_batch<I>(
        &self,
        messages: I,
        delay: Option<Duration>,
        force_extended: bool,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = CanMessage>,
    {
        self.require_open()?;
        let delay = delay.unwrap_or(self.batch_delay);
        let mut total = 0;
        for (i, msg) in messages.into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                thread::sleep(delay);
            }
            total += self.send_frame(&msg, force_extended)?;
        }
        debug!(interface = %self.interface, total, "batch send");
        Ok(total)
    }

    /// Replace the acceptance filter. An `id` of 0 means the default sender id.
    pub fn set_filter(&self, mask: u32, id: u32) -> Result<()> {
        let mut rx = self.rx.lock();
        let fd = self.require_open()?;
        self.install_filter(fd, &mut rx, mask, id)
    }

    fn install_filter(&self, fd: i32, rx: &mut RxState, mask: u32, id: u32) -> Result<()> {
        let can_id = if id == 0 {
            rx.default_sender_id.raw()
        } else {
            id
        };
        let filter = RawCanFilter {
            can_id,
            can_mask: mask,
        };
        self.api.set_filter(fd, &filter).map_err(|e| {
            ChannelError::init(
                format!("FAILED to set CAN filter mask {mask:#x} on socket {fd}"),
                &e,
            )
        })?;
        rx.filter_mask = mask;
        rx.filter_id = can_id;
        debug!(fd, can_id, mask, "CAN filter installed");
        Ok(())
    }

    pub fn interface_name(&self) -> &str {
        &self.interface
    }
    pub fn protocol(&self) -> i32 {
        self.protocol
    }
    pub fn filter_mask(&self) -> u32 {
        self.rx.lock().filter_mask
    }
    pub fn filter_id(&self) -> u32 {
        self.rx.lock().filter_id
    }
    pub fn default_sender_id(&self) -> CanId {
        self.rx.lock().default_sender_id
    }

    /// Takes effect on the next filter change that passes id 0.
    pub fn set_default_sender_id(&self, id: CanId) -> &Self {
        self.rx.lock().default_sender_id = id;
        self
    }

    /// Readiness count from the last wait. Advisory only.
    pub fn pending_frame_count(&self) -> i32 {
        self.rx.lock().pending
    }
    /// OS handle, or -1 when not open.
    pub fn socket_handle(&self) -> i32 {
        self.socket.load(Ordering::Acquire)
    }
    pub fn is_open(&self) -> bool {
        self.socket_handle() >= 0
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    fn record_tx(&self, bytes: usize) {
        #[cfg(feature = "metrics")]
        {
            if let Some(m) = &self.metrics {
                m.tx_frames.inc();
                m.tx_bytes.inc_by(bytes as u64);
            }
        }
    }

    fn record_rx(&self) {
        #[cfg(feature = "metrics")]
        {
            if let Some(m) = &self.metrics {
                m.rx_frames.inc();
            }
        }
    }

    fn record_error(&self) {
        #[cfg(feature = "metrics")]
        {
            if let Some(m) = &self.metrics {
                m.errors.inc();
            }
        }
    }
}

impl<S: CanSocketApi> Drop for CanChannel<S> {
    fn drop(&mut self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.close() {
            warn!(interface = %self.interface, error = %e, "closing CAN channel on drop failed");
        }
    }
}

impl<S: CanSocketApi> fmt::Debug for CanChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanChannel")
            .field("interface", &self.interface)
            .field("protocol", &self.protocol)
            .field("socket", &self.socket_handle())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::{MockSocketApi, Syscall, CAN_SOCK_RAW};

    fn open(api: &MockSocketApi) -> CanChannel<MockSocketApi> {
        CanChannel::new(api.clone(), "mock0", CAN_SOCK_RAW, 0, CanId::default()).unwrap()
    }

    #[test]
    fn setup_runs_in_order_with_filter_before_bind() {
        let api = MockSocketApi::new();
        let _ch = open(&api);
        assert_eq!(
            api.calls(),
            vec![
                Syscall::Open,
                Syscall::InterfaceIndex,
                Syscall::SetNonblocking,
                Syscall::SetFilter,
                Syscall::Bind,
            ]
        );
        assert_eq!(api.bound_interface(), Some(1));
    }

    #[test]
    fn failed_bind_releases_the_socket() {
        let api = MockSocketApi::new();
        api.fail_next(Syscall::Bind, 98);
        let err = CanChannel::new(api.clone(), "mock0", CAN_SOCK_RAW, 0, CanId::default())
            .unwrap_err();
        assert!(matches!(err, ChannelError::Init { os_code: Some(98), .. }));
        assert!(!api.is_fd_open(3));
        assert_eq!(api.call_count(Syscall::Close), 1);
    }

    #[test]
    fn unknown_interface_is_an_init_failure() {
        let api = MockSocketApi::new();
        let err = CanChannel::new(api.clone(), "can7", CAN_SOCK_RAW, 0, CanId::default())
            .unwrap_err();
        assert!(matches!(err, ChannelError::Init { .. }));
        assert!(err.to_string().contains("can7"));
        assert_eq!(api.call_count(Syscall::Bind), 0);
    }

    #[test]
    fn drop_closes_open_socket() {
        let api = MockSocketApi::new();
        let fd = {
            let ch = open(&api);
            ch.socket_handle()
        };
        assert!(!api.is_fd_open(fd));
    }

    #[test]
    fn drop_after_close_does_not_close_again() {
        let api = MockSocketApi::new();
        let ch = open(&api);
        ch.close().unwrap();
        drop(ch);
        assert_eq!(api.call_count(Syscall::Close), 1);
    }

    #[test]
    fn failed_poll_clears_pending_count() {
        let api = MockSocketApi::new();
        let ch = open(&api);
        api.push_inbound_message(&CanMessage::new(CanId::default(), &[1]));
        assert!(ch.wait_for_frames(Some(Duration::ZERO)).unwrap());
        assert_eq!(ch.pending_frame_count(), 1);
        api.fail_next(Syscall::Poll, 4);
        let err = ch.wait_for_frames(Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, ChannelError::Io { os_code: Some(4), .. }));
        assert_eq!(ch.pending_frame_count(), 0);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn metrics_count_frames_and_errors() {
        let api = MockSocketApi::new();
        let metrics = ChannelMetrics::new().unwrap();
        let ch = open(&api).with_metrics(metrics.clone());
        ch.send_frame(&CanMessage::new(CanId::default(), &[1, 2]), false)
            .unwrap();
        api.push_inbound_message(&CanMessage::new(CanId::default(), &[3]));
        ch.receive_frame().unwrap();
        assert!(ch.receive_frame().is_err());
        assert_eq!(metrics.tx_frames.get(), 1);
        assert_eq!(metrics.tx_bytes.get(), 16);
        assert_eq!(metrics.rx_frames.get(), 1);
        assert_eq!(metrics.errors.get(), 1);
    }

    #[test]
    fn wait_uses_configured_default_timeout() {
        let api = MockSocketApi::new();
        let cfg = ChannelConfig::new("mock0").with_wait_timeout(Duration::from_millis(75));
        let ch = CanChannel::open(api.clone(), &cfg).unwrap();
        ch.wait_for_frames(None).unwrap();
        assert_eq!(api.last_poll_timeout(), Some(Duration::from_millis(75)));
    }
}

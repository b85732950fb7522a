use crate::{CanMessage, CanSocketApi, RawCanFilter, RawCanFrame, CAN_MTU};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Syscall kinds recorded by [`MockSocketApi`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Syscall {
    Open,
    InterfaceIndex,
    SetNonblocking,
    SetFilter,
    Bind,
    Poll,
    Read,
    Write,
    Close,
}

#[derive(Debug)]
struct MockState {
    next_fd: i32,
    open: HashSet<i32>,
    interfaces: HashMap<String, i32>,
    inbound: VecDeque<RawCanFrame>,
    written: Vec<RawCanFrame>,
    filters: Vec<RawCanFilter>,
    calls: Vec<Syscall>,
    failures: HashMap<Syscall, i32>,
    ready_override: Option<i32>,
    last_poll_timeout: Option<Duration>,
    poll_delay: Duration,
    bound: Option<i32>,
}

/// A scripted in-process socket layer. Clones share state, so a test can
/// keep one handle while the channel owns another.
///
/// Every instance knows the interface `mock0` (index 1).
#[derive(Clone, Debug)]
pub struct MockSocketApi {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockSocketApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSocketApi {
    pub fn new() -> Self {
        let mut interfaces = HashMap::new();
        interfaces.insert("mock0".to_string(), 1);
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_fd: 3,
                open: HashSet::new(),
                interfaces,
                inbound: VecDeque::new(),
                written: Vec::new(),
                filters: Vec::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                ready_override: None,
                last_poll_timeout: None,
                poll_delay: Duration::ZERO,
                bound: None,
            })),
        }
    }

    pub fn with_interface(self, name: &str, index: i32) -> Self {
        self.state.lock().interfaces.insert(name.to_string(), index);
        self
    }

    /// Queue a frame for the next read.
    pub fn push_inbound(&self, frame: RawCanFrame) {
        self.state.lock().inbound.push_back(frame);
    }

    pub fn push_inbound_message(&self, msg: &CanMessage) {
        self.push_inbound(msg.raw_frame());
    }

    pub fn inbound_len(&self) -> usize {
        self.state.lock().inbound.len()
    }

    /// Frames written so far, oldest first.
    pub fn written(&self) -> Vec<RawCanFrame> {
        self.state.lock().written.clone()
    }

    /// Filters installed so far, oldest first.
    pub fn filters(&self) -> Vec<RawCanFilter> {
        self.state.lock().filters.clone()
    }

    pub fn calls(&self) -> Vec<Syscall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, kind: Syscall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == kind).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make the next `kind` call fail with `errno`.
    pub fn fail_next(&self, kind: Syscall, errno: i32) {
        self.state.lock().failures.insert(kind, errno);
    }

    /// Report `count` from the next polls instead of the inbound queue length.
    pub fn set_ready_override(&self, count: Option<i32>) {
        self.state.lock().ready_override = count;
    }

    /// Make every poll sleep for `delay` (capped at the poll timeout) before
    /// answering. The mock's own state is not locked while sleeping.
    pub fn set_poll_delay(&self, delay: Duration) {
        self.state.lock().poll_delay = delay;
    }

    pub fn last_poll_timeout(&self) -> Option<Duration> {
        self.state.lock().last_poll_timeout
    }

    pub fn bound_interface(&self) -> Option<i32> {
        self.state.lock().bound
    }

    pub fn is_fd_open(&self, fd: i32) -> bool {
        self.state.lock().open.contains(&fd)
    }

    // Records the call, then applies any injected failure and the fd check.
    fn enter(&self, kind: Syscall, fd: Option<i32>) -> io::Result<MutexGuard<'_, MockState>> {
        let mut st = self.state.lock();
        st.calls.push(kind);
        if let Some(errno) = st.failures.remove(&kind) {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if let Some(fd) = fd {
            if !st.open.contains(&fd) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("bad file descriptor {fd}"),
                ));
            }
        }
        Ok(st)
    }
}

impl CanSocketApi for MockSocketApi {
    fn open_socket(&self, _protocol: i32) -> io::Result<i32> {
        let mut st = self.enter(Syscall::Open, None)?;
        let fd = st.next_fd;
        st.next_fd += 1;
        st.open.insert(fd);
        Ok(fd)
    }

    fn interface_index(&self, fd: i32, name: &str) -> io::Result<i32> {
        let st = self.enter(Syscall::InterfaceIndex, Some(fd))?;
        st.interfaces.get(name).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such device {name}"))
        })
    }

    fn set_nonblocking(&self, fd: i32) -> io::Result<()> {
        self.enter(Syscall::SetNonblocking, Some(fd))?;
        Ok(())
    }

    fn set_filter(&self, fd: i32, filter: &RawCanFilter) -> io::Result<()> {
        let mut st = self.enter(Syscall::SetFilter, Some(fd))?;
        st.filters.push(*filter);
        Ok(())
    }

    fn bind(&self, fd: i32, ifindex: i32) -> io::Result<()> {
        let mut st = self.enter(Syscall::Bind, Some(fd))?;
        st.bound = Some(ifindex);
        Ok(())
    }

    fn poll_readable(&self, fd: i32, timeout: Duration) -> io::Result<i32> {
        let delay = {
            let mut st = self.enter(Syscall::Poll, Some(fd))?;
            st.last_poll_timeout = Some(timeout);
            st.poll_delay.min(timeout)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let st = self.state.lock();
        Ok(st
            .ready_override
            .unwrap_or_else(|| i32::try_from(st.inbound.len()).unwrap_or(i32::MAX)))
    }

    fn read_frame(&self, fd: i32) -> io::Result<RawCanFrame> {
        let mut st = self.enter(Syscall::Read, Some(fd))?;
        st.inbound
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no frame queued"))
    }

    fn write_frame(&self, fd: i32, frame: &RawCanFrame) -> io::Result<usize> {
        let mut st = self.enter(Syscall::Write, Some(fd))?;
        st.written.push(*frame);
        Ok(CAN_MTU)
    }

    fn close(&self, fd: i32) -> io::Result<()> {
        let mut st = self.enter(Syscall::Close, None)?;
        if !st.open.remove(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("bad file descriptor {fd}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_failure_fires_once() {
        let api = MockSocketApi::new();
        api.fail_next(Syscall::Open, 97);
        let err = api.open_socket(1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(97));
        assert_eq!(api.open_socket(1).unwrap(), 3);
        assert_eq!(api.call_count(Syscall::Open), 2);
    }

    #[test]
    fn reads_drain_in_order_then_would_block() {
        let api = MockSocketApi::new();
        let fd = api.open_socket(1).unwrap();
        for id in [1u32, 2] {
            api.push_inbound(RawCanFrame {
                can_id: id,
                ..RawCanFrame::default()
            });
        }
        assert_eq!(api.poll_readable(fd, Duration::ZERO).unwrap(), 2);
        assert_eq!(api.read_frame(fd).unwrap().can_id, 1);
        assert_eq!(api.read_frame(fd).unwrap().can_id, 2);
        let err = api.read_frame(fd).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn closed_descriptor_is_rejected() {
        let api = MockSocketApi::new();
        let fd = api.open_socket(1).unwrap();
        api.close(fd).unwrap();
        assert!(api.close(fd).is_err());
        assert!(api.write_frame(fd, &RawCanFrame::default()).is_err());
    }
}

use crate::{RawCanFilter, RawCanFrame};
use std::io;
use std::time::Duration;

/// The syscalls a [`CanChannel`](crate::CanChannel) issues, one method per call.
///
/// Handles are plain integers so the channel can keep `-1` as "not open".
/// Implementations must be callable from several threads at once; the
/// channel serialises access with its own guards.
pub trait CanSocketApi: Send + Sync {
    /// Create a raw CAN socket for `protocol`.
    fn open_socket(&self, protocol: i32) -> io::Result<i32>;

    /// Resolve a network interface name to its kernel index.
    fn interface_index(&self, fd: i32, name: &str) -> io::Result<i32>;

    /// Switch the descriptor to non-blocking mode.
    fn set_nonblocking(&self, fd: i32) -> io::Result<()>;

    /// Install a single acceptance filter, replacing the previous one.
    fn set_filter(&self, fd: i32, filter: &RawCanFilter) -> io::Result<()>;

    fn bind(&self, fd: i32, ifindex: i32) -> io::Result<()>;

    /// Wait up to `timeout` for the descriptor to become readable.
    /// Returns the readiness count the OS reported (0 on timeout).
    fn poll_readable(&self, fd: i32, timeout: Duration) -> io::Result<i32>;

    /// Read exactly one frame record.
    fn read_frame(&self, fd: i32) -> io::Result<RawCanFrame>;

    /// Write one frame record, returning the byte count written.
    fn write_frame(&self, fd: i32, frame: &RawCanFrame) -> io::Result<usize>;

    fn close(&self, fd: i32) -> io::Result<()>;
}

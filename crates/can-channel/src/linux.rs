//! libc-backed SocketCAN implementation of [`CanSocketApi`].

use crate::{CanSocketApi, RawCanFilter, RawCanFrame, CAN_MTU};
use libc::{c_char, c_int, c_void, sa_family_t, sockaddr, socklen_t};
use std::io;
use std::mem::size_of;
use std::time::{Duration, Instant};

const SOL_CAN_RAW: c_int = 101;
const CAN_RAW_FILTER: c_int = 1;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct SockAddrCan {
    can_family: sa_family_t,
    can_ifindex: c_int,
    rx_id: u32,
    tx_id: u32,
}

// Only the name and the ifindex arm of the `ifr_ifru` union are used.
#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_ifindex: c_int,
    _pad: [u8; 20],
}

/// Raw SocketCAN through the kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxSocketApi;

impl LinuxSocketApi {
    pub fn new() -> Self {
        Self
    }
}

fn check(rv: c_int) -> io::Result<c_int> {
    if rv < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rv)
    }
}

impl CanSocketApi for LinuxSocketApi {
    fn open_socket(&self, protocol: i32) -> io::Result<i32> {
        check(unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, protocol) })
    }

    fn interface_index(&self, fd: i32, name: &str) -> io::Result<i32> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= IFNAMSIZ || bytes.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name {name:?}"),
            ));
        }
        let mut req = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_ifindex: 0,
            _pad: [0; 20],
        };
        for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
            *dst = *src as c_char;
        }
        check(unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX as _, &mut req as *mut IfReq) })?;
        Ok(req.ifr_ifindex)
    }

    fn set_nonblocking(&self, fd: i32) -> io::Result<()> {
        let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
        Ok(())
    }

    fn set_filter(&self, fd: i32, filter: &RawCanFilter) -> io::Result<()> {
        check(unsafe {
            libc::setsockopt(
                fd,
                SOL_CAN_RAW,
                CAN_RAW_FILTER,
                filter as *const RawCanFilter as *const c_void,
                size_of::<RawCanFilter>() as socklen_t,
            )
        })?;
        Ok(())
    }

    fn bind(&self, fd: i32, ifindex: i32) -> io::Result<()> {
        let addr = SockAddrCan {
            can_family: libc::AF_CAN as sa_family_t,
            can_ifindex: ifindex,
            rx_id: 0,
            tx_id: 0,
        };
        check(unsafe {
            libc::bind(
                fd,
                &addr as *const SockAddrCan as *const sockaddr,
                size_of::<SockAddrCan>() as socklen_t,
            )
        })?;
        Ok(())
    }

    fn poll_readable(&self, fd: i32, timeout: Duration) -> io::Result<i32> {
        // A timeout past the end of `Instant` waits forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut fds = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let timeout_ms = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    c_int::try_from(remaining.as_millis()).unwrap_or(c_int::MAX)
                }
                None => -1,
            };
            let res = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
            if res >= 0 {
                return Ok(res);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn read_frame(&self, fd: i32) -> io::Result<RawCanFrame> {
        let mut frame = RawCanFrame::default();
        let n = unsafe {
            libc::read(
                fd,
                &mut frame as *mut RawCanFrame as *mut c_void,
                CAN_MTU,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != CAN_MTU {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("short CAN frame read: {n} of {CAN_MTU} bytes"),
            ));
        }
        Ok(frame)
    }

    fn write_frame(&self, fd: i32, frame: &RawCanFrame) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                fd,
                frame as *const RawCanFrame as *const c_void,
                CAN_MTU,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn close(&self, fd: i32) -> io::Result<()> {
        check(unsafe { libc::close(fd) })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_structs_have_kernel_sizes() {
        assert_eq!(size_of::<SockAddrCan>(), 16);
        assert_eq!(size_of::<IfReq>(), 40);
    }

    #[test]
    fn rejects_overlong_interface_name() {
        let api = LinuxSocketApi::new();
        let err = api
            .interface_index(-1, "an-interface-name-too-long")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn unbounded_timeout_polls_without_overflow() {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let byte = 1u8;
        let n = unsafe { libc::write(fds[1], &byte as *const u8 as *const c_void, 1) };
        assert_eq!(n, 1);

        let api = LinuxSocketApi::new();
        let ready = api.poll_readable(fds[0], Duration::MAX);
        let idle = api.poll_readable(fds[1], Duration::ZERO);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        assert_eq!(ready.unwrap(), 1);
        // The write end never reports POLLIN.
        assert_eq!(idle.unwrap(), 0);
    }
}

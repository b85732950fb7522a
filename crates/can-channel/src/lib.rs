//! can-channel: a thread-safe SocketCAN raw channel
//!
//! [`CanChannel`] owns one raw CAN socket bound to a named interface and
//! offers single and batch frame I/O, a readiness wait and an `{id, mask}`
//! acceptance filter. The syscalls sit behind [`CanSocketApi`]: the
//! `socketcan` feature provides the Linux implementation and the default
//! `mock` feature a scripted one so everything builds and tests on any host.

mod types;
pub use types::{
    CanId, CanMessage, RawCanFilter, RawCanFrame, Timestamp, CAN_EFF_FLAG, CAN_EFF_MASK,
    CAN_ERR_FLAG, CAN_MAX_DATA_LENGTH, CAN_MTU, CAN_RTR_FLAG, CAN_SFF_MASK, CAN_SOCK_RAW,
    CAN_SOCK_SEVEN,
};

mod error;
pub use error::{ChannelError, Result};

mod traits;
pub use traits::CanSocketApi;

mod config;
pub use config::{load_config_file, ChannelConfig};

mod channel;
pub use channel::{CanChannel, DEFAULT_BATCH_DELAY, DEFAULT_WAIT_TIMEOUT};

#[cfg(feature = "metrics")]
mod metrics;

#[cfg(feature = "metrics")]
pub use metrics::ChannelMetrics;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockSocketApi, Syscall};

#[cfg(all(feature = "socketcan", target_os = "linux"))]
#[allow(unsafe_code)]
mod linux;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub use linux::LinuxSocketApi;

/// A channel on the kernel's SocketCAN stack.
#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub type SocketCanChannel = CanChannel<LinuxSocketApi>;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
impl SocketCanChannel {
    /// Open `config.interface` through the kernel.
    pub fn open_socketcan(config: &ChannelConfig) -> Result<Self> {
        CanChannel::open(LinuxSocketApi::new(), config)
    }
}

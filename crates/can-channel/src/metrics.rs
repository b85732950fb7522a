use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Frame and error counters for one channel.
#[derive(Clone)]
pub struct ChannelMetrics {
    pub registry: Registry,
    pub tx_frames: IntCounter,
    pub tx_bytes: IntCounter,
    pub rx_frames: IntCounter,
    pub errors: IntCounter,
}

impl ChannelMetrics {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let tx_frames = IntCounter::new("can_channel_tx_frames", "Total CAN frames sent")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let tx_bytes = IntCounter::new("can_channel_tx_bytes", "Total bytes written to the socket")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let rx_frames = IntCounter::new("can_channel_rx_frames", "Total CAN frames received")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let errors = IntCounter::new("can_channel_errors", "Failed channel I/O operations")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let _ = registry.register(Box::new(tx_frames.clone()));
        let _ = registry.register(Box::new(tx_bytes.clone()));
        let _ = registry.register(Box::new(rx_frames.clone()));
        let _ = registry.register(Box::new(errors.clone()));
        Ok(Self {
            registry,
            tx_frames,
            tx_bytes,
            rx_frames,
            errors,
        })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

use std::sync::Arc;

use btlink_frame::{FrameError, HciPacket, PacketType};
use bytes::BytesMut;

/// The Bluetooth host stack that consumes controller traffic.
pub trait HciHost: Send + Sync {
    /// Provide a receive buffer of at least `len` bytes for an incoming
    /// packet. `None` drops the packet.
    fn get_buffer(&self, packet_type: PacketType, event_code: Option<u8>, len: usize)
        -> Option<BytesMut>;

    /// A complete packet arrived.
    fn on_receive(&self, packet: HciPacket);

    /// A frame was drained without delivery.
    fn on_dropped(&self, _error: &FrameError) {}
}

/// Callback for TWS timing interrupts: `(bt_clock, intra_offset)`.
pub type TwsCallback = Arc<dyn Fn(u32, u16) + Send + Sync>;

/// Destination for controller log lines.
pub trait LogSink: Send + Sync {
    fn log_line(&self, line: &str);
}

/// Forwards controller logs to `tracing` under `btlink::controller`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log_line(&self, line: &str) {
        tracing::info!(target: "btlink::controller", "{}", line.trim_end());
    }
}

/// Prefix added to controller log records that carry no tag of their own.
pub const CONTROLLER_LOG_PREFIX: &str = "<CT-I>";

/// Turn one raw log record into a printable line.
pub fn format_log_record(record: &[u8]) -> String {
    let text = String::from_utf8_lossy(record);
    let text = text.trim_end_matches('\0');
    if record.first() == Some(&b'<') {
        text.to_string()
    } else {
        format!("{CONTROLLER_LOG_PREFIX}{text}")
    }
}

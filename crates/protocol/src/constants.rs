use std::time::Duration;

/// Separates fields inside a control or reply line.
pub const FIELD_SEPARATOR: char = '|';

/// Separates a command name from its single parameter.
pub const PARAM_DELIMITER: char = ':';

/// Terminator appended to every outgoing line.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Default payload bytes per `CHUNK`.
///
/// Serial links are slow and noisy; small chunks bound how much data is
/// resent after a glitch.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Time the sender waits for `READY` after `HEADER`.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the sender waits for `CHUNK_READY` and then `ACK` for one chunk.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Time the sender waits for `DONE` after `VERIFY`.
///
/// Longer than [`ACK_TIMEOUT`] since the receiver may have to decompress
/// and hash the whole file.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts per chunk before the session fails.
pub const MAX_RETRIES_PER_CHUNK: u32 = 3;

/// Longest line the reader accepts before discarding the buffer.
pub const MAX_LINE_LENGTH: usize = 4096;

/// Finished sessions kept for status reporting.
pub const HISTORY_LIMIT: usize = 100;

/// Announced by the device when the link comes up.
pub const CAMERA_READY: &str = "CAMERA_READY";

/// Announced by the device when it shuts down.
pub const CAMERA_OFFLINE: &str = "CAMERA_OFFLINE";

/// Prefix of the idle heartbeat line (`HEARTBEAT|<uptime_secs>`).
pub const HEARTBEAT: &str = "HEARTBEAT";

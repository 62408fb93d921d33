use std::time;

/// How long an SSH session may sit idle before the reaper closes it.
pub const SESSION_TIMEOUT: time::Duration = time::Duration::from_secs(300);

/// Max bytes read off the client socket per recv().
pub const BUFF_SIZE: usize = 512;

/// Max bytes written to the client socket per write, matching the
/// chunk size the client is expected to read in one go.
pub const OUT_BUFF_SIZE: usize = 512;

/// If the client's input accumulator grows past this without hitting
/// a CRLF delimiter, it is reset and a warning logged.
pub const MAX_INBUF: usize = 1024;

/// Bytes read from a pager pty per check_response() call.
pub const PTY_READ_CHUNK: usize = 256;

/// Poll timeout for the client event loop; also the cadence of the
/// idle-session sweep.
pub const POLL_TICK: time::Duration = time::Duration::from_millis(500);

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9999";
pub const DEFAULT_PAGER_BIN: &str = "less";

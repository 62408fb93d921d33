use anyhow::bail;
use tracing::{info, instrument, warn};

use crate::consts;
use crate::remote_shell::Pty;
use crate::screen_buffer::ScreenBuffer;
use crate::tty;

/// `less` repaints the screen bottom-up after a backward scroll,
/// making wrap detection unreliable. When set, `Back`/`Pos` responses
/// are only scanned for their anchor (never rendered) and are
/// followed by an automatic `Redraw` that produces a clean top-down
/// repaint.
const REDRAW_AFTER_BACK: bool = true;

const ESC_POSITIVE: &[u8] = b"\x1b[m";
const ESC_ERASE_RIGHT: &[u8] = b"\x1b[K";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Open,
    Close,
    Forward,
    Redraw,
    Back,
    Pos,
}

impl TaskKind {
    fn name(&self) -> &'static str {
        match self {
            TaskKind::Open => "open",
            TaskKind::Close => "close",
            TaskKind::Forward => "fwd",
            TaskKind::Redraw => "redraw",
            TaskKind::Back => "back",
            TaskKind::Pos => "pos",
        }
    }

    /// The anchor tuple associated with this task. Index 1 is the
    /// "reached the far end" anchor (checked for every task except
    /// `Close`); index 2, present only on `Open`/`Pos`, carries a
    /// secondary meaning (not-found for `Open`).
    fn anchors(&self) -> &'static [&'static [u8]] {
        match self {
            TaskKind::Open => &[b"\x1b[m\x1b[K", b"(END) \x1b", b"No such file"],
            TaskKind::Close => &[b"\x1b[K", b""],
            TaskKind::Forward => &[b":\x1b[K", b"(END) \x1b"],
            TaskKind::Redraw => &[b":\x1b[K", b"(END) \x1b"],
            TaskKind::Back => &[b":\x1b[K", b"\x07\x0D\x1b"],
            TaskKind::Pos => &[b";1H\x0D\x1b[K:", b"(END) \x1b", b":\x1b[K"],
        }
    }
}

/// Drives a single `less` invocation through a pty: translates client
/// commands into keystrokes, watches the pty's output for the anchor
/// bytes that mark command completion, and tracks first/last-screen
/// and launched state.
pub struct LogSession {
    pty: Box<dyn Pty>,
    path: String,
    pager_bin: String,
    screen: ScreenBuffer,
    launched: bool,
    first_screen: bool,
    last_screen: bool,
    current_task: Option<TaskKind>,
}

impl LogSession {
    pub fn new(pty: Box<dyn Pty>, path: String, pager_bin: String, size: tty::Size) -> Self {
        LogSession {
            pty,
            path,
            pager_bin,
            screen: ScreenBuffer::new(size.cols as usize, size.rows as usize),
            launched: false,
            first_screen: true,
            last_screen: false,
            current_task: None,
        }
    }

    pub fn launched(&self) -> bool {
        self.launched
    }

    pub fn has_task(&self) -> bool {
        self.current_task.is_some()
    }

    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.pty.as_raw_fd()
    }

    pub fn exit_status_ready(&self) -> bool {
        self.pty.exit_status_ready()
    }

    pub fn close(&mut self) -> anyhow::Result<()> {
        self.pty.close()
    }

    #[instrument(skip(self), fields(path = %self.path))]
    pub fn put_request(&mut self, task: TaskKind, position: Option<f64>) -> anyhow::Result<()> {
        if self.current_task.is_some() {
            bail!("unable to add a new request: in progress");
        }
        if self.first_screen && task == TaskKind::Back {
            bail!("cannot move beyond");
        }
        if self.last_screen && task == TaskKind::Forward {
            bail!("cannot move beyond");
        }
        if !self.launched && task != TaskKind::Open {
            bail!("open first");
        }

        self.flush()?;

        info!(task = task.name(), "new task");
        self.current_task = Some(task);
        self.screen.wait_new_anchor(task.anchors());
        self.screen.reset_line_counter();

        match task {
            TaskKind::Open => {
                let cmd = format!("{} {}\n", self.pager_bin, self.path);
                self.pty.write_all(cmd.as_bytes())?;
            }
            TaskKind::Close => {
                self.pty.write_all(b"q")?;
                self.launched = false;
            }
            TaskKind::Forward => self.pty.write_all(b"f")?,
            TaskKind::Redraw => self.pty.write_all(b"r")?,
            TaskKind::Back => self.pty.write_all(b"b")?,
            TaskKind::Pos => {
                let pos = position.unwrap_or(0.0);
                let pos = if (0.0..=100.0).contains(&pos) {
                    pos
                } else {
                    warn!(pos, "wrong position to move, moving to 0%");
                    0.0
                };
                self.pty.write_all(format!("{:.6}%", pos).as_bytes())?;
                self.screen.set_skip_prompt();
            }
        }

        Ok(())
    }

    /// Drains any bytes already sitting in the pty buffer before a
    /// new command is issued, so stale output from the previous
    /// command can't be mistaken for the new one's anchors.
    fn flush(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; consts::PTY_READ_CHUNK];
        loop {
            let n = self.pty.read_nonblocking(&mut buf)?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Processes the next chunk of pty output. Returns `Ok(true)` if a
    /// task finished (or there was no task outstanding), `Ok(false)`
    /// if more data is still awaited.
    #[instrument(skip(self))]
    pub fn check_response(&mut self) -> anyhow::Result<bool> {
        let mut chunk = [0u8; consts::PTY_READ_CHUNK];
        let n = self.pty.read_nonblocking(&mut chunk)?;
        let buf = &chunk[..n];

        let Some(task) = self.current_task else {
            return Ok(true);
        };

        if buf.is_empty() {
            return Ok(false);
        }

        let anchor_only = REDRAW_AFTER_BACK && matches!(task, TaskKind::Back | TaskKind::Pos);
        self.screen.put_data(buf, anchor_only);

        if !self.screen.anchor_found() {
            return Ok(false);
        }

        if matches!(task, TaskKind::Forward | TaskKind::Pos) {
            self.first_screen = false;
        }
        if matches!(task, TaskKind::Back | TaskKind::Pos) {
            self.last_screen = false;
        }

        let anchors = task.anchors();
        if self.screen.last_anchor() == Some(anchors[1]) {
            if matches!(task, TaskKind::Open | TaskKind::Forward | TaskKind::Pos) {
                self.last_screen = true;
                info!("last screen is reached");
            }
            if task == TaskKind::Back {
                self.first_screen = true;
                info!("first screen is reached");
            }
        }

        if task == TaskKind::Open {
            if self.screen.last_anchor() != Some(anchors[2]) {
                info!("file is open");
                self.launched = true;
            } else {
                warn!("file was not found");
            }
        }

        if REDRAW_AFTER_BACK && matches!(task, TaskKind::Back | TaskKind::Pos) {
            self.current_task = None;
            self.put_request(TaskKind::Redraw, None)?;
            return Ok(false);
        }

        self.current_task = None;
        Ok(true)
    }

    pub fn get_result(&self) -> String {
        if self.current_task.is_some() {
            warn!("reading result while task is not completed");
        }
        self.screen.render()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::os::unix::io::RawFd;

    use super::*;

    struct MockPty {
        // queue of reads the remote side will hand back, one Vec per call
        reads: VecDeque<Vec<u8>>,
        written: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    }

    impl MockPty {
        fn new(reads: Vec<&[u8]>) -> (Self, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
            let written = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
            let pty = MockPty {
                reads: reads.into_iter().map(|r| r.to_vec()).collect(),
                written: written.clone(),
            };
            (pty, written)
        }
    }

    impl Pty for MockPty {
        fn read_nonblocking(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
            match self.reads.pop_front() {
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn write_all(&mut self, buf: &[u8]) -> anyhow::Result<()> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn resize(&mut self, _size: tty::Size) -> anyhow::Result<()> {
            Ok(())
        }

        fn exit_status_ready(&self) -> bool {
            false
        }

        fn as_raw_fd(&self) -> RawFd {
            -1
        }

        fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn small_size() -> tty::Size {
        tty::Size::new(5, 5)
    }

    #[test]
    fn open_launches_on_success() {
        let mut response = Vec::new();
        response.extend_from_slice(b"xyz\r\n(END)");
        response.extend_from_slice(ESC_POSITIVE);
        response.extend_from_slice(ESC_ERASE_RIGHT);

        let (pty, _written) = MockPty::new(vec![&response]);
        let mut session = LogSession::new(Box::new(pty), "path".to_string(), "less".to_string(), small_size());

        session.put_request(TaskKind::Open, None).unwrap();
        assert!(session.check_response().unwrap());
        assert!(session.launched());

        // calling again with no data available is a no-op completion
        assert!(session.check_response().unwrap());
    }

    #[test]
    fn open_reports_missing_file() {
        let (pty, _written) = MockPty::new(vec![b"aaa: No such file or directory\r\n"]);
        let mut session = LogSession::new(Box::new(pty), "path".to_string(), "less".to_string(), small_size());

        session.put_request(TaskKind::Open, None).unwrap();
        assert!(session.check_response().unwrap());
        assert!(!session.launched());
    }

    #[test]
    fn rejects_commands_before_launch() {
        let (pty, _written) = MockPty::new(vec![]);
        let mut session = LogSession::new(Box::new(pty), "path".to_string(), "less".to_string(), small_size());
        assert!(session.put_request(TaskKind::Forward, None).is_err());
    }

    #[test]
    fn rejects_back_at_first_screen() {
        let (pty, _written) = MockPty::new(vec![]);
        let mut session = LogSession::new(Box::new(pty), "path".to_string(), "less".to_string(), small_size());
        session.launched = true;
        assert!(session.put_request(TaskKind::Back, None).is_err());
    }

    #[test]
    fn pos_out_of_range_clamps_to_zero() {
        let (pty, written) = MockPty::new(vec![]);
        let mut session = LogSession::new(Box::new(pty), "path".to_string(), "less".to_string(), small_size());
        session.launched = true;
        session.put_request(TaskKind::Pos, Some(250.0)).unwrap();
        assert_eq!(*written.lock().unwrap(), b"0.000000%");
    }
}

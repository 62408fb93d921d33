use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, BorrowedFd};

use anyhow::Context;
use nix::poll::{self, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::consts;
use crate::log_session::{LogSession, TaskKind};
use crate::protocol::{FrameReader, Request, Response};
use crate::remote_shell::SshRemoteShell;
use crate::session_table::SessionTable;
use crate::tty;

/// Drives one accepted TCP connection end to end: reads request frames,
/// dispatches them against this client's private `SessionTable`, pumps
/// pager output back out, and sweeps idle sessions. Runs on its own
/// thread; nothing here is shared with any other client.
pub struct ClientLoop {
    stream: TcpStream,
    config: std::sync::Arc<Config>,
    frames: FrameReader,
    out_queue: Vec<Vec<u8>>,
    table: SessionTable,
    running: bool,
    // log_ids awaiting their log_open response, which is only sent once
    // check_response() observes the pager's opening screen.
    pending_open_acks: Vec<(String, String)>,
}

impl ClientLoop {
    pub fn new(stream: TcpStream, config: std::sync::Arc<Config>) -> Self {
        stream.set_nonblocking(true).ok();
        let timeout = config.session_timeout();
        ClientLoop {
            stream,
            config,
            frames: FrameReader::new(),
            out_queue: Vec::new(),
            table: SessionTable::new(timeout),
            running: true,
            pending_open_acks: Vec::new(),
        }
    }

    #[instrument(skip(self), fields(peer = ?self.stream.peer_addr().ok()))]
    pub fn run(&mut self) {
        info!("client loop starting");
        while self.running {
            if let Err(e) = self.tick() {
                error!(error = ?e, "client loop error, disconnecting");
                break;
            }
        }
        self.shutdown();
        info!("client loop exiting");
    }

    fn tick(&mut self) -> anyhow::Result<()> {
        let log_ids = self.table.iter_log_ids();

        // SAFETY: each fd stays open and owned by its LogSession/socket
        // for the duration of this poll call; nothing in this function
        // closes them before `poll::poll` returns.
        let sock_fd = unsafe { BorrowedFd::borrow_raw(self.stream.as_raw_fd()) };
        let mut poll_fds = vec![PollFd::new(sock_fd, PollFlags::POLLIN)];
        for log_id in &log_ids {
            let fd = self.table.log_mut(log_id)?.as_raw_fd();
            // SAFETY: the LogSession (and its underlying pty) outlives this poll call.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            poll_fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
        }
        if !self.out_queue.is_empty() {
            poll_fds[0] = PollFd::new(sock_fd, PollFlags::POLLIN | PollFlags::POLLOUT);
        }

        let ms: u16 = consts::POLL_TICK.as_millis().try_into().unwrap_or(u16::MAX);
        let nready = poll::poll(&mut poll_fds, PollTimeout::from(ms)).context("polling client fds")?;

        if nready > 0 {
            let sock_revents = poll_fds[0].revents().unwrap_or(PollFlags::empty());
            if sock_revents.contains(PollFlags::POLLIN) {
                self.read_from_client()?;
            }
            if sock_revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                info!("client socket error/hangup");
                self.running = false;
                return Ok(());
            }
            if sock_revents.contains(PollFlags::POLLOUT) {
                self.send_to_client()?;
            }

            for (i, log_id) in log_ids.iter().enumerate() {
                let revents = poll_fds[i + 1].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLIN) {
                    // a pager I/O error is scoped to that one log session,
                    // not the whole client loop
                    if let Err(e) = self.pump_log(log_id) {
                        warn!(log_id, error = ?e, "log channel I/O error, closing log session");
                        let _ = self.table.close_log(log_id);
                    }
                }
            }
        }

        self.sweep_expired();
        Ok(())
    }

    fn read_from_client(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; consts::BUFF_SIZE];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                info!("client disconnected");
                self.running = false;
            }
            Ok(n) => {
                let frames = self.frames.push(&buf[..n]);
                for frame in frames {
                    self.handle_frame(&frame);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e).context("reading from client socket"),
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let req: Request = match serde_json::from_slice(frame) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = ?e, "not valid JSON, ignoring");
                return;
            }
        };

        debug!(cmd = %req.cmd, "dispatching command");
        match req.cmd.as_str() {
            "connect" => self.handle_connect(&req),
            "get_dir" if self.conn_valid(&req) => self.handle_get_dir(&req),
            "log_open" if self.conn_valid(&req) => self.handle_log_open(&req),
            "close" if self.conn_valid(&req) => self.handle_close(&req),
            "log_page" | "log_next" | "log_prev" | "log_pos" | "log_close" if self.log_valid(&req) => {
                self.handle_log_cmd(&req)
            }
            other => warn!(cmd = other, "unable to execute command"),
        }
    }

    fn conn_valid(&self, req: &Request) -> bool {
        req.conn_id.as_deref().map(|id| self.table.has_ssh(id)).unwrap_or(false)
    }

    fn log_valid(&self, req: &Request) -> bool {
        req.log_id.as_deref().map(|id| self.table.has_log(id)).unwrap_or(false)
    }

    fn handle_connect(&mut self, req: &Request) {
        let host = req.host.clone().unwrap_or_default();
        let port = req.port.unwrap_or(22);
        let user = req.user.clone().unwrap_or_default();
        let secret = req.secret.clone().unwrap_or_default();

        let resp = match SshRemoteShell::connect(&host, port, &user, &secret) {
            Ok(shell) => {
                let conn_id = self.table.register_ssh(Box::new(shell));
                Response::ok(&req.cmd).with_conn_id(conn_id)
            }
            Err(e) => {
                warn!(error = ?e, "unable to start ssh session");
                Response::error(&req.cmd)
            }
        };
        self.enqueue(resp);
    }

    fn handle_get_dir(&mut self, req: &Request) {
        let conn_id = req.conn_id.clone().unwrap_or_default();
        let path = req.path.clone().unwrap_or_default();
        if self.table.touch_conn(&conn_id).is_err() {
            self.enqueue(Response::error(&req.cmd));
            return;
        }

        let resp = match self.table.shell_mut(&conn_id) {
            Ok(shell) => {
                let command = format!("ls -1 -d --color=never {}", path);
                match shell.exec(&command) {
                    Ok((out, err)) if err.is_empty() => Response::ok(&req.cmd).with_lines(out),
                    Ok((_, err)) => Response::error(&req.cmd).with_lines(err),
                    Err(e) => {
                        warn!(error = ?e, "unable to run ls");
                        Response::error(&req.cmd)
                    }
                }
            }
            Err(e) => {
                warn!(error = ?e, "unable to run ls");
                Response::error(&req.cmd)
            }
        };
        self.enqueue(resp);
    }

    fn handle_log_open(&mut self, req: &Request) {
        let conn_id = req.conn_id.clone().unwrap_or_default();
        let path = req.path.clone().unwrap_or_default();
        let size = tty::Size::new(
            req.cols.unwrap_or_else(|| self.config.default_cols()),
            req.rows.unwrap_or_else(|| self.config.default_rows()),
        );

        if self.table.touch_conn(&conn_id).is_err() {
            self.enqueue(Response::error(&req.cmd));
            return;
        }

        let pty = match self.table.shell_mut(&conn_id).and_then(|shell| shell.open_shell(size)) {
            Ok(pty) => pty,
            Err(e) => {
                warn!(error = ?e, "unable to open pty for log session");
                self.enqueue(Response::error(&req.cmd));
                return;
            }
        };

        let mut session = LogSession::new(pty, path, self.config.pager_bin(), size);
        if let Err(e) = session.put_request(TaskKind::Open, None) {
            warn!(error = ?e, "unable to open log");
            self.enqueue(Response::error(&req.cmd));
            return;
        }

        match self.table.register_log(&conn_id, session, &req.cmd) {
            Ok(log_id) => {
                info!(log_id, "new log was registered");
                // the response is emitted once check_response() observes
                // the pager's opening screen, not here
                self.pending_open_acks.push((log_id, req.cmd.clone()));
            }
            Err(e) => {
                warn!(error = ?e, "unable to register log session");
                self.enqueue(Response::error(&req.cmd));
            }
        }
    }

    fn handle_log_cmd(&mut self, req: &Request) {
        let log_id = req.log_id.clone().unwrap_or_default();
        let cmd = req.cmd.as_str();

        if cmd == "log_close" {
            let _ = self.table.close_log(&log_id);
            self.enqueue(Response::ok(cmd).with_log_id(log_id));
            return;
        }

        let task = match cmd {
            "log_page" => TaskKind::Redraw,
            "log_next" => TaskKind::Forward,
            "log_prev" => TaskKind::Back,
            "log_pos" => TaskKind::Pos,
            _ => return,
        };
        let position = req.position;

        if self.table.touch_log(&log_id, true, cmd).is_err() {
            self.enqueue(Response::error(cmd).with_log_id(log_id));
            return;
        }

        let result = self.table.log_mut(&log_id).and_then(|s| s.put_request(task, position));
        if let Err(e) = result {
            warn!(error = ?e, log_id, "log command rejected");
            let _ = self.table.touch_log(&log_id, false, cmd);
            self.enqueue(Response::error(cmd).with_log_id(log_id));
        }
    }

    fn handle_close(&mut self, req: &Request) {
        let conn_id = req.conn_id.clone().unwrap_or_default();
        if let Err(e) = self.table.close_conn(&conn_id) {
            warn!(error = ?e, "error while closing connection");
        }
        self.enqueue(Response::ok(&req.cmd).with_conn_id(conn_id));
    }

    fn pump_log(&mut self, log_id: &str) -> anyhow::Result<()> {
        let done = match self.table.log_mut(log_id) {
            Ok(session) => session.check_response()?,
            Err(_) => return Ok(()),
        };

        if done && self.table.is_log_active(log_id) {
            let cmd = self.table.log_cmd(log_id)?;
            let (data, launched) = {
                let session = self.table.log_mut(log_id)?;
                (session.get_result(), session.launched())
            };
            info!(log_id, "log is ready");

            let resp = if let Some(idx) = self.pending_open_acks.iter().position(|(id, _)| id == log_id) {
                let (_, open_cmd) = self.pending_open_acks.remove(idx);
                if launched {
                    Response::ok(&open_cmd).with_log_id(log_id.to_string()).with_text(data)
                } else {
                    Response::error(&open_cmd).with_log_id(log_id.to_string())
                }
            } else {
                Response::ok(&cmd).with_log_id(log_id.to_string()).with_text(data)
            };
            self.enqueue(resp);

            self.table.touch_log(log_id, false, &cmd)?;
        }
        Ok(())
    }

    fn sweep_expired(&mut self) {
        let (expired_logs, expired_conns) = self.table.sweep_expired();
        for log_id in expired_logs {
            warn!(log_id, "log channel has been unexpectedly closed");
            let _ = self.table.close_log(&log_id);
        }
        for conn_id in expired_conns {
            warn!(conn_id, "ssh session has expired");
            let _ = self.table.close_conn(&conn_id);
        }
    }

    fn enqueue(&mut self, resp: Response) {
        self.out_queue.extend(resp.into_chunks());
    }

    fn send_to_client(&mut self) -> anyhow::Result<()> {
        if let Some(chunk) = self.out_queue.first().cloned() {
            match self.stream.write(&chunk) {
                Ok(_) => {
                    self.out_queue.remove(0);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e).context("writing to client socket"),
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for conn_id in self.table.iter_ssh_ids() {
            let _ = self.table.close_conn(&conn_id);
        }
    }
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::log_session::LogSession;
use crate::remote_shell::RemoteShell;

struct SshEntry {
    shell: Box<dyn RemoteShell>,
    last_touched: Instant,
}

struct LogEntry {
    session: LogSession,
    active: bool,
    current_cmd: String,
    parent_conn_id: String,
}

/// Owns every SSH connection and log (pager) session belonging to one
/// client. Private per client loop: nothing here is shared across
/// connections.
#[derive(Default)]
pub struct SessionTable {
    ssh: HashMap<String, SshEntry>,
    logs: HashMap<String, LogEntry>,
    session_timeout: Option<Duration>,
}

impl SessionTable {
    pub fn new(session_timeout: Duration) -> Self {
        SessionTable { ssh: HashMap::new(), logs: HashMap::new(), session_timeout: Some(session_timeout) }
    }

    pub fn register_ssh(&mut self, shell: Box<dyn RemoteShell>) -> String {
        let conn_id = Uuid::new_v4().to_string();
        self.ssh.insert(conn_id.clone(), SshEntry { shell, last_touched: Instant::now() });
        info!(conn_id, "new ssh session registered");
        conn_id
    }

    pub fn register_log(&mut self, conn_id: &str, session: LogSession, cmd: &str) -> anyhow::Result<String> {
        if !self.ssh.contains_key(conn_id) {
            return Err(anyhow!("unknown conn_id {}", conn_id));
        }
        let log_id = Uuid::new_v4().to_string();
        self.logs.insert(
            log_id.clone(),
            LogEntry { session, active: true, current_cmd: cmd.to_string(), parent_conn_id: conn_id.to_string() },
        );
        info!(log_id, conn_id, "new log session registered");
        Ok(log_id)
    }

    pub fn has_ssh(&self, conn_id: &str) -> bool {
        self.ssh.contains_key(conn_id)
    }

    pub fn has_log(&self, log_id: &str) -> bool {
        self.logs.contains_key(log_id)
    }

    pub fn shell_mut(&mut self, conn_id: &str) -> anyhow::Result<&mut Box<dyn RemoteShell>> {
        self.ssh.get_mut(conn_id).map(|e| &mut e.shell).ok_or_else(|| anyhow!("unknown conn_id {}", conn_id))
    }

    pub fn log_mut(&mut self, log_id: &str) -> anyhow::Result<&mut LogSession> {
        self.logs.get_mut(log_id).map(|e| &mut e.session).ok_or_else(|| anyhow!("unknown log_id {}", log_id))
    }

    pub fn log_cmd(&self, log_id: &str) -> anyhow::Result<String> {
        self.logs.get(log_id).map(|e| e.current_cmd.clone()).ok_or_else(|| anyhow!("unknown log_id {}", log_id))
    }

    pub fn is_log_active(&self, log_id: &str) -> bool {
        self.logs.get(log_id).map(|e| e.active).unwrap_or(false)
    }

    pub fn iter_log_ids(&self) -> Vec<String> {
        self.logs.keys().cloned().collect()
    }

    pub fn iter_ssh_ids(&self) -> Vec<String> {
        self.ssh.keys().cloned().collect()
    }

    /// Updates an SSH connection's idle timer and, if present, a
    /// child log session's state tag. Mirrors the original
    /// implementation touching the parent connection any time one of
    /// its log sessions is referenced.
    pub fn touch_log(&mut self, log_id: &str, active: bool, cmd: &str) -> anyhow::Result<()> {
        let conn_id = {
            let entry = self.logs.get_mut(log_id).ok_or_else(|| anyhow!("unknown log_id {}", log_id))?;
            entry.active = active;
            entry.current_cmd = cmd.to_string();
            entry.parent_conn_id.clone()
        };
        self.touch_conn(&conn_id)
    }

    pub fn touch_conn(&mut self, conn_id: &str) -> anyhow::Result<()> {
        let entry = self.ssh.get_mut(conn_id).ok_or_else(|| anyhow!("unknown conn_id {}", conn_id))?;
        entry.last_touched = Instant::now();
        Ok(())
    }

    /// Closes a log session, swallowing pty teardown errors the same
    /// way the original best-effort close does.
    #[instrument(skip(self))]
    pub fn close_log(&mut self, log_id: &str) -> anyhow::Result<()> {
        if let Some(mut entry) = self.logs.remove(log_id) {
            if let Err(e) = entry.session.close() {
                warn!(log_id, error = ?e, "error closing log session, ignoring");
            }
        }
        Ok(())
    }

    /// Closes an SSH connection and cascades to every log session it
    /// owns.
    #[instrument(skip(self))]
    pub fn close_conn(&mut self, conn_id: &str) -> anyhow::Result<()> {
        let dependents: Vec<String> =
            self.logs.iter().filter(|(_, e)| e.parent_conn_id == conn_id).map(|(id, _)| id.clone()).collect();
        for log_id in dependents {
            self.close_log(&log_id)?;
        }

        if let Some(mut entry) = self.ssh.remove(conn_id) {
            entry.shell.close().context("closing ssh session")?;
        }
        info!(conn_id, "connection closed");
        Ok(())
    }

    /// Returns the ids of SSH connections that have sat idle past the
    /// configured timeout and log sessions whose remote process has
    /// exited. Does not remove anything; the caller decides ordering
    /// (log exits first, then idle ssh connections) via `close_log`/
    /// `close_conn`.
    pub fn sweep_expired(&self) -> (Vec<String>, Vec<String>) {
        let now = Instant::now();
        let timeout = self.session_timeout.unwrap_or(crate::consts::SESSION_TIMEOUT);

        let expired_logs = self
            .logs
            .iter()
            .filter(|(_, e)| e.session.exit_status_ready())
            .map(|(id, _)| id.clone())
            .collect();

        let expired_conns = self
            .ssh
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_touched) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        (expired_logs, expired_conns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_shell::Pty;
    use std::os::unix::io::RawFd;

    struct NoopShell;
    impl RemoteShell for NoopShell {
        fn open_shell(&mut self, _size: crate::tty::Size) -> anyhow::Result<Box<dyn Pty>> {
            unimplemented!()
        }
        fn exec(&mut self, _cmd: &str) -> anyhow::Result<(Vec<String>, Vec<String>)> {
            unimplemented!()
        }
        fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoopPty;
    impl Pty for NoopPty {
        fn read_nonblocking(&mut self, _buf: &mut [u8]) -> anyhow::Result<usize> {
            Ok(0)
        }
        fn write_all(&mut self, _buf: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        fn resize(&mut self, _size: crate::tty::Size) -> anyhow::Result<()> {
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

    #[test]
    fn closing_conn_cascades_to_its_logs() {
        let mut table = SessionTable::new(Duration::from_secs(300));
        let conn_id = table.register_ssh(Box::new(NoopShell));
        let other_conn_id = table.register_ssh(Box::new(NoopShell));

        let log = LogSession::new(Box::new(NoopPty), "/var/log/x".to_string(), "less".to_string(), crate::tty::Size::new(80, 24));
        let log_id = table.register_log(&conn_id, log, "log_open").unwrap();
        let other_log =
            LogSession::new(Box::new(NoopPty), "/var/log/y".to_string(), "less".to_string(), crate::tty::Size::new(80, 24));
        let other_log_id = table.register_log(&other_conn_id, other_log, "log_open").unwrap();

        table.close_conn(&conn_id).unwrap();

        assert!(!table.has_ssh(&conn_id));
        assert!(!table.has_log(&log_id));
        assert!(table.has_ssh(&other_conn_id));
        assert!(table.has_log(&other_log_id));
    }

    #[test]
    fn unknown_conn_id_rejects_log_open() {
        let mut table = SessionTable::new(Duration::from_secs(300));
        let log = LogSession::new(Box::new(NoopPty), "/var/log/x".to_string(), "less".to_string(), crate::tty::Size::new(80, 24));
        assert!(table.register_log("does-not-exist", log, "log_open").is_err());
    }
}

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{anyhow, Context};
use tracing::{info, instrument, warn};

use crate::tty;

/// Pty is the narrow interface LogSession needs from a remote pty:
/// non-blocking byte shuffling, resize, and a way to tell that the
/// remote process has gone away.
pub trait Pty: Send {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> anyhow::Result<()>;
    fn resize(&mut self, size: tty::Size) -> anyhow::Result<()>;
    fn exit_status_ready(&self) -> bool;
    fn as_raw_fd(&self) -> RawFd;
    fn close(&mut self) -> anyhow::Result<()>;
}

/// RemoteShell is the external collaborator this gateway drives: a
/// single SSH connection capable of handing out an interactive pty
/// (`open_shell`) or running a one-shot command (`exec`).
pub trait RemoteShell: Send {
    fn open_shell(&mut self, size: tty::Size) -> anyhow::Result<Box<dyn Pty>>;
    fn exec(&mut self, cmd: &str) -> anyhow::Result<(Vec<String>, Vec<String>)>;
    fn close(&mut self) -> anyhow::Result<()>;
}

/// SshRemoteShell is the default RemoteShell backed by libssh2. Host
/// key verification is accept-and-log: this gateway is a control
/// plane operated by trusted operators, and a stricter policy is a
/// deployment concern that sits outside it.
pub struct SshRemoteShell {
    session: ssh2::Session,
    // the raw fd backing the session's single multiplexed TCP stream;
    // every channel opened off this session shares it for poll readiness.
    tcp_fd: RawFd,
    connected: bool,
}

impl SshRemoteShell {
    #[instrument(skip(secret))]
    pub fn connect(host: &str, port: u16, user: &str, secret: &str) -> anyhow::Result<Self> {
        let tcp = TcpStream::connect((host, port))
            .with_context(|| format!("connecting to {}:{}", host, port))?;
        tcp.set_nodelay(true).ok();
        let tcp_fd = tcp.as_raw_fd();

        let mut session = ssh2::Session::new().context("creating ssh session")?;
        session.set_tcp_stream(tcp);
        session.handshake().context("ssh handshake")?;

        if let Ok(mut known_hosts) = session.known_hosts() {
            // Best-effort host key bookkeeping; unknown or mismatched
            // keys are logged, not rejected, matching the accept-and-log
            // policy documented above.
            if let Some((key, _)) = session.host_key() {
                if let Err(e) = known_hosts.add(host, key, "logview-gatewayd", ssh2::KnownHostKeyFormat::SshRsa)
                {
                    warn!(%host, error = ?e, "could not record host key");
                }
            }
        }

        session.userauth_password(user, secret).context("ssh password auth")?;
        if !session.authenticated() {
            return Err(anyhow!("ssh authentication failed for {}@{}", user, host));
        }

        info!(%host, %user, "ssh session established");
        Ok(SshRemoteShell { session, tcp_fd, connected: true })
    }
}

impl RemoteShell for SshRemoteShell {
    #[instrument(skip(self))]
    fn open_shell(&mut self, size: tty::Size) -> anyhow::Result<Box<dyn Pty>> {
        if !self.connected {
            return Err(anyhow!("not connected"));
        }

        let mut channel = self.session.channel_session().context("opening channel")?;
        channel
            .request_pty(
                "xterm",
                None,
                Some((size.cols as u32, size.rows as u32, 0, 0)),
            )
            .context("requesting pty")?;
        channel.shell().context("starting shell")?;

        // non-blocking so the event loop never stalls on a pty read/write
        self.session.set_blocking(false);

        Ok(Box::new(SshPty { channel, size, tcp_fd: self.tcp_fd }))
    }

    #[instrument(skip(self))]
    fn exec(&mut self, cmd: &str) -> anyhow::Result<(Vec<String>, Vec<String>)> {
        if !self.connected {
            return Err(anyhow!("not connected"));
        }

        self.session.set_blocking(true);
        let mut channel = self.session.channel_session().context("opening exec channel")?;
        channel.exec(cmd).context("exec")?;

        let mut out = String::new();
        channel.read_to_string(&mut out).context("reading stdout")?;
        let mut err = String::new();
        channel.stderr().read_to_string(&mut err).context("reading stderr")?;

        channel.wait_close().ok();

        // the original implementation strips the trailing newline off
        // each line rather than leaving it in
        let out_lines = split_lines(&out);
        let err_lines = split_lines(&err);

        Ok((out_lines, err_lines))
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.connected = false;
        self.session.disconnect(None, "closing", None).context("ssh disconnect")
    }
}

fn split_lines(s: &str) -> Vec<String> {
    s.lines().map(|l| l.to_string()).collect()
}

pub struct SshPty {
    channel: ssh2::Channel,
    size: tty::Size,
    // shared with the owning SshRemoteShell: one TCP socket multiplexes
    // every channel opened against a single ssh2::Session.
    tcp_fd: RawFd,
}

impl Pty for SshPty {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        match self.channel.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e).context("reading from pty"),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        loop {
            match self.channel.write(buf) {
                Ok(_) => return self.channel.flush().context("flushing pty write"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e).context("writing to pty"),
            }
        }
    }

    fn resize(&mut self, size: tty::Size) -> anyhow::Result<()> {
        self.channel
            .request_pty_size(size.cols as u32, size.rows as u32, None, None)
            .context("resizing pty")?;
        self.size = size;
        Ok(())
    }

    fn exit_status_ready(&self) -> bool {
        self.channel.eof()
    }

    fn as_raw_fd(&self) -> RawFd {
        self.tcp_fd
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.channel.close().context("closing pty channel")
    }
}

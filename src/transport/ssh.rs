//! SSH transport built on libssh2.
//!
//! One [`SshTransport`] owns one authenticated [`ssh2::Session`]. Commands run
//! on fresh exec channels of that session; files move over SCP. Nothing is
//! retried: once authentication fails the transport is never constructed.

use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use ssh2::Session;

use super::{SshAuth, Transport, TransportError, command_result};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Wait between polls of a command's output streams when neither had data.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Authenticated SSH session to a single host.
pub struct SshTransport {
    session: Session,
    user: String,
    host: String,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("user", &self.user)
            .field("host", &self.host)
            .finish()
    }
}

impl SshTransport {
    /// Open a TCP connection, perform the handshake and authenticate.
    ///
    /// Authentication order: private key (with the secret as passphrase),
    /// then password (the secret), then a running ssh-agent.
    pub fn connect(
        user: &str,
        host: &str,
        port: u16,
        auth: &SshAuth,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let start = Instant::now();
        let connect_err = |source| TransportError::Connect {
            host: host.to_string(),
            port,
            source,
        };

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "host name did not resolve to an address",
                ))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(connect_err)?;

        let mut session = Session::new().map_err(|e| TransportError::Handshake {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| TransportError::Handshake {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        authenticate(&session, user, auth).map_err(|reason| TransportError::Authentication {
            user: user.to_string(),
            host: host.to_string(),
            reason,
        })?;

        tracing::info!(
            user = %user,
            host = %host,
            port,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "ssh session established"
        );

        Ok(Self {
            session,
            user: user.to_string(),
            host: host.to_string(),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

fn authenticate(session: &Session, user: &str, auth: &SshAuth) -> Result<(), String> {
    let mut failures = Vec::new();

    if let Some(key) = auth.usable_key() {
        match session.userauth_pubkey_file(user, None, key, auth.secret.as_deref()) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => failures.push(format!("key {} rejected", key.display())),
            Err(e) => failures.push(format!("key {}: {}", key.display(), e.message())),
        }
    } else if let Some(key) = &auth.private_key {
        tracing::debug!(key = %key.display(), "private key not found, skipping");
    }

    if let Some(secret) = auth.secret.as_deref() {
        match session.userauth_password(user, secret) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => failures.push("password rejected".to_string()),
            Err(e) => failures.push(format!("password: {}", e.message())),
        }
    }

    match session.userauth_agent(user) {
        Ok(()) if session.authenticated() => return Ok(()),
        Ok(()) => failures.push("agent identities rejected".to_string()),
        Err(e) => failures.push(format!("agent: {}", e.message())),
    }

    Err(failures.join("; "))
}

impl Transport for SshTransport {
    fn exec(&mut self, command: &str) -> Result<String, TransportError> {
        let channel_err = |e: ssh2::Error| TransportError::Channel(e.to_string());
        let io_err = |e: io::Error| TransportError::Channel(e.to_string());

        let mut channel = self.session.channel_session().map_err(channel_err)?;
        channel.exec(command).map_err(channel_err)?;

        // stdout and stderr are read in turn until both reach EOF.
        self.session.set_blocking(false);
        let drained = (|| -> io::Result<OutputDrain> {
            let mut drain = OutputDrain::default();
            while !drain.finished() {
                let mut progressed = drain.pump_stdout(&mut channel)?;
                progressed |= drain.pump_stderr(&mut channel.stderr())?;
                if !progressed {
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            Ok(drain)
        })();
        self.session.set_blocking(true);
        let drain = drained.map_err(io_err)?;
        let stdout = String::from_utf8_lossy(&drain.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&drain.stderr).into_owned();

        channel.wait_close().map_err(channel_err)?;
        let exit_status = channel.exit_status().map_err(channel_err)?;

        tracing::debug!(host = %self.host, exit_status, "remote command finished");
        command_result(exit_status, &stdout, &stderr)
    }

    fn get_file(
        &mut self,
        remote_pathname: &str,
        local_pathname: &Path,
    ) -> Result<(), TransportError> {
        let from = format!("{}:{}", self.host, remote_pathname);
        let to = local_pathname.display().to_string();
        let fail = |reason: &dyn ToString| TransportError::transfer(&from, &to, reason.to_string());

        let (mut remote, stat) = self
            .session
            .scp_recv(Path::new(remote_pathname))
            .map_err(|e| fail(&e))?;
        let mut local = File::create(local_pathname).map_err(|e| fail(&e))?;
        let copied = io::copy(&mut remote, &mut local).map_err(|e| fail(&e))?;

        if copied != stat.size() {
            return Err(fail(&format!(
                "received {copied} of {} bytes",
                stat.size()
            )));
        }

        remote.send_eof().map_err(|e| fail(&e))?;
        remote.wait_eof().map_err(|e| fail(&e))?;
        remote.close().map_err(|e| fail(&e))?;
        remote.wait_close().map_err(|e| fail(&e))?;

        tracing::info!(from = %from, to = %to, bytes = copied, "downloaded file");
        Ok(())
    }

    fn put_file(
        &mut self,
        local_pathname: &Path,
        remote_pathname: &str,
    ) -> Result<(), TransportError> {
        let from = local_pathname.display().to_string();
        let to = format!("{}:{}", self.host, remote_pathname);
        let fail = |reason: &dyn ToString| TransportError::transfer(&from, &to, reason.to_string());

        let mut local = File::open(local_pathname).map_err(|e| fail(&e))?;
        let size = local.metadata().map_err(|e| fail(&e))?.len();

        let mut remote = self
            .session
            .scp_send(Path::new(remote_pathname), 0o644, size, None)
            .map_err(|e| fail(&e))?;
        let copied = io::copy(&mut local, &mut remote).map_err(|e| fail(&e))?;

        remote.send_eof().map_err(|e| fail(&e))?;
        remote.wait_eof().map_err(|e| fail(&e))?;
        remote.close().map_err(|e| fail(&e))?;
        remote.wait_close().map_err(|e| fail(&e))?;

        tracing::info!(from = %from, to = %to, bytes = copied, "uploaded file");
        Ok(())
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Output collected from a remote command's stdout and stderr.
#[derive(Debug, Default)]
struct OutputDrain {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_eof: bool,
    stderr_eof: bool,
}

impl OutputDrain {
    fn finished(&self) -> bool {
        self.stdout_eof && self.stderr_eof
    }

    fn pump_stdout(&mut self, reader: &mut impl Read) -> io::Result<bool> {
        pump(reader, &mut self.stdout, &mut self.stdout_eof)
    }

    fn pump_stderr(&mut self, reader: &mut impl Read) -> io::Result<bool> {
        pump(reader, &mut self.stderr, &mut self.stderr_eof)
    }
}

/// Read whatever `reader` has ready. Returns whether anything happened.
fn pump(reader: &mut impl Read, buf: &mut Vec<u8>, eof: &mut bool) -> io::Result<bool> {
    if *eof {
        return Ok(false);
    }
    let mut chunk = [0u8; 8192];
    match reader.read(&mut chunk) {
        Ok(0) => {
            *eof = true;
            Ok(true)
        }
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
        Err(e) => Err(e),
    }
}

//! SFTP transport backend, grounded on `transfer::session` (TCP connect +
//! handshake + pubkey auth) and `transfer::sftp_like::Ssh2Adapter` from the
//! teacher crate.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::SyncError;

use super::{EntryKind, ExecHandle, ListEntry, Transport, TransportFactory};

fn wrap<E: std::fmt::Display>(e: E) -> SyncError {
    let msg = e.to_string();
    if crate::error::looks_like_connection_loss(&msg) {
        SyncError::TransientTransport(msg)
    } else {
        SyncError::Protocol(msg)
    }
}

fn try_key_authentication(sess: &mut ssh2::Session, username: &str) -> bool {
    if sess.authenticated() {
        return true;
    }
    if let Some(home) = dirs::home_dir() {
        for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
            let p = home.join(".ssh").join(name);
            if p.exists() {
                let _ = sess.userauth_pubkey_file(username, None, &p, None);
                if sess.authenticated() {
                    return true;
                }
            }
        }
    }
    false
}

fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, SyncError> {
    let addr = format!("{host}:{port}");
    let mut addrs = addr.to_socket_addrs().map_err(|e| SyncError::Fatal(e.to_string()))?;
    let sock = addrs.next().ok_or_else(|| SyncError::Fatal(format!("cannot resolve {addr}")))?;
    let tcp = TcpStream::connect_timeout(&sock, Duration::from_secs(10))
        .map_err(|e| SyncError::TransientTransport(e.to_string()))?;
    let _ = tcp.set_read_timeout(Some(Duration::from_secs(300)));
    let _ = tcp.set_write_timeout(Some(Duration::from_secs(300)));
    Ok(tcp)
}

pub struct SftpTransport {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
}

impl SftpTransport {
    /// Same `connect(host, port, user, password)` signature as
    /// [`crate::transport::ftp::FtpTransport::connect`] (§4.1): key auth is
    /// tried first, falling back to `password` only when it's `Some` and the
    /// key attempt didn't authenticate.
    pub fn connect(host: &str, port: u16, user: &str, password: Option<&str>) -> Result<Self, SyncError> {
        let tcp = connect_tcp(host, port)?;
        let mut session = ssh2::Session::new().map_err(wrap)?;
        session.set_tcp_stream(tcp);
        session.set_keepalive(true, 30);
        session.handshake().map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        if !try_key_authentication(&mut session, user) {
            if let Some(password) = password {
                let _ = session.userauth_password(user, password);
            }
            if !session.authenticated() {
                return Err(SyncError::Fatal(format!("ssh auth failed for {user}@{host}")));
            }
        }
        let sftp = session.sftp().map_err(wrap)?;
        Ok(Self { session, sftp })
    }
}

impl Transport for SftpTransport {
    fn has_shell(&self) -> bool {
        true
    }

    fn list(&mut self, dir: &str) -> Result<Vec<ListEntry>, SyncError> {
        let entries = self.sftp.readdir(std::path::Path::new(dir)).map_err(wrap)?;
        let mut out = Vec::with_capacity(entries.len());
        for (path, stat) in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if name == "." || name == ".." {
                continue;
            }
            let kind = if stat.is_dir() {
                EntryKind::Dir
            } else if stat.file_type().is_symlink() {
                EntryKind::Link
            } else {
                EntryKind::File
            };
            let mtime = stat.mtime.map(|t| crate::model::format_epoch_seconds(t as i64));
            out.push(ListEntry { name: name.to_string(), kind, size: stat.size.unwrap_or(0), mtime });
        }
        Ok(out)
    }

    fn stat(&mut self, path: &str) -> Result<Option<ListEntry>, SyncError> {
        match self.sftp.stat(std::path::Path::new(path)) {
            Ok(stat) => {
                let kind = if stat.is_dir() {
                    EntryKind::Dir
                } else if stat.file_type().is_symlink() {
                    EntryKind::Link
                } else {
                    EntryKind::File
                };
                let mtime = stat.mtime.map(|t| crate::model::format_epoch_seconds(t as i64));
                let name = path.rsplit('/').next().unwrap_or(path).to_string();
                Ok(Some(ListEntry { name, kind, size: stat.size.unwrap_or(0), mtime }))
            }
            Err(e) if e.code() == ssh2::ErrorCode::SFTP(2) => Ok(None),
            Err(e) => Err(wrap(e)),
        }
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        let file = self.sftp.open(std::path::Path::new(path)).map_err(wrap)?;
        Ok(Box::new(file))
    }

    fn noop(&mut self) -> Result<(), SyncError> {
        self.sftp.stat(std::path::Path::new(".")).map(|_| ()).map_err(wrap)
    }

    fn exec(&mut self, cmd: &str) -> Result<Box<dyn ExecHandle>, SyncError> {
        let mut channel = self.session.channel_session().map_err(wrap)?;
        channel.exec(cmd).map_err(wrap)?;
        Ok(Box::new(SshExecHandle { channel }))
    }
}

pub struct SshExecHandle {
    channel: ssh2::Channel,
}

impl ExecHandle for SshExecHandle {
    fn write_stdin(&mut self, data: &[u8]) -> Result<(), SyncError> {
        use std::io::Write;
        self.channel.write_all(data).map_err(|e| SyncError::TransientTransport(e.to_string()))
    }

    fn close_stdin(&mut self) -> Result<(), SyncError> {
        self.channel.send_eof().map_err(wrap)
    }

    fn read_stdout(&mut self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        self.channel.read_to_end(&mut buf).map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        Ok(buf)
    }

    fn read_stdout_to(&mut self, sink: &mut dyn std::io::Write) -> Result<(), SyncError> {
        std::io::copy(&mut self.channel, sink)
            .map(|_| ())
            .map_err(|e| SyncError::TransientTransport(e.to_string()))
    }

    fn reader(&mut self) -> &mut dyn Read {
        &mut self.channel
    }

    fn finish(mut self: Box<Self>) -> Result<(Vec<u8>, i32), SyncError> {
        let mut buf = Vec::new();
        self.channel.read_to_end(&mut buf).map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        self.channel.wait_close().map_err(wrap)?;
        let code = self.channel.exit_status().map_err(wrap)?;
        Ok((buf, code))
    }
}

pub struct SftpTransportFactory {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

impl TransportFactory for SftpTransportFactory {
    fn connect(&self) -> Result<Box<dyn Transport>, SyncError> {
        Ok(Box::new(SftpTransport::connect(&self.host, self.port, &self.user, self.password.as_deref())?))
    }
}

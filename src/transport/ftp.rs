//! FTP transport backend, built on the `suppaftp` crate. The teacher carries
//! no FTP dependency; `suppaftp` is the ecosystem's pure-Rust FTP client, in
//! the same spirit as the MLSD/LIST/RETR/NOOP vocabulary sketched by
//! `sorng-ftp` in the reference pack.

use std::io::Read;

use suppaftp::FtpStream;

use crate::error::SyncError;

use super::{EntryKind, ExecHandle, ListEntry, Transport, TransportFactory};

fn wrap(e: suppaftp::FtpError) -> SyncError {
    let msg = e.to_string();
    if crate::error::looks_like_connection_loss(&msg) {
        SyncError::TransientTransport(msg)
    } else {
        SyncError::Protocol(msg)
    }
}

pub struct FtpTransport {
    stream: FtpStream,
}

impl FtpTransport {
    pub fn connect(host: &str, port: u16, user: &str, password: &str) -> Result<Self, SyncError> {
        let mut stream = FtpStream::connect(format!("{host}:{port}"))
            .map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        stream.login(user, password).map_err(wrap)?;
        let _ = stream.transfer_type(suppaftp::types::FileType::Binary);
        Ok(Self { stream })
    }
}

impl Transport for FtpTransport {
    fn has_shell(&self) -> bool {
        false
    }

    /// MLSD (RFC 3659) first, since its facts are unambiguous across server
    /// vendors; only a server that rejects MLSD entirely falls back to the
    /// old `LIST` text parsing.
    fn list(&mut self, dir: &str) -> Result<Vec<ListEntry>, SyncError> {
        match self.stream.mlsd(Some(dir)) {
            Ok(lines) => Ok(lines.iter().filter_map(|line| parse_mlsd_line(line)).collect()),
            Err(_) => {
                let lines = self.stream.list(Some(dir)).map_err(wrap)?;
                Ok(lines.iter().filter_map(|line| parse_unix_list_line(line)).collect())
            }
        }
    }

    fn stat(&mut self, path: &str) -> Result<Option<ListEntry>, SyncError> {
        let (parent, name) = match path.rsplit_once('/') {
            Some((p, n)) => (if p.is_empty() { "/" } else { p }, n),
            None => (".", path),
        };
        let entries = self.list(parent)?;
        Ok(entries.into_iter().find(|e| e.name == name))
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        let stream = self.stream.retr_as_stream(path).map_err(wrap)?;
        Ok(Box::new(stream))
    }

    fn noop(&mut self) -> Result<(), SyncError> {
        self.stream.noop().map_err(wrap)
    }

    fn exec(&mut self, _cmd: &str) -> Result<Box<dyn ExecHandle>, SyncError> {
        Err(SyncError::Unsupported("exec"))
    }
}

/// Parse one MLSD line: `fact=val;fact=val; name` (RFC 3659 §7.1). Facts are
/// case-insensitive and unordered; unrecognized facts are ignored.
fn parse_mlsd_line(line: &str) -> Option<ListEntry> {
    let mut parts = line.trim_end_matches(['\r', '\n']).splitn(2, ' ');
    let facts = parts.next()?;
    let name = parts.next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    let mut kind = EntryKind::File;
    let mut size: u64 = 0;
    let mut mtime = None;
    for fact in facts.split(';') {
        let Some((key, val)) = fact.split_once('=') else { continue };
        match key.trim().to_ascii_lowercase().as_str() {
            "type" => {
                kind = match val.trim().to_ascii_lowercase().as_str() {
                    "dir" | "cdir" | "pdir" => EntryKind::Dir,
                    "file" => EntryKind::File,
                    _ => EntryKind::Link,
                };
            }
            "size" => size = val.trim().parse().unwrap_or(0),
            "modify" => mtime = Some(val.trim().to_string()),
            _ => {}
        }
    }
    Some(ListEntry { name: name.to_string(), kind, size, mtime })
}

/// Parse a Unix-style `LIST` response line: permissions, link count, owner,
/// group, size, month, day, time-or-year, name. Links are reported so the
/// scanner can skip them per §4.1.
fn parse_unix_list_line(line: &str) -> Option<ListEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }
    let perms = parts[0];
    let kind = match perms.chars().next()? {
        'd' => EntryKind::Dir,
        'l' => EntryKind::Link,
        _ => EntryKind::File,
    };
    let size: u64 = parts[4].parse().unwrap_or(0);
    let name = parts[8..].join(" ");
    if name == "." || name == ".." {
        return None;
    }
    let mtime = Some(parts[5..8].join(" "));
    Some(ListEntry { name, kind, size, mtime })
}

pub struct FtpTransportFactory {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl TransportFactory for FtpTransportFactory {
    fn connect(&self) -> Result<Box<dyn Transport>, SyncError> {
        Ok(Box::new(FtpTransport::connect(&self.host, self.port, &self.user, &self.password)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regular_file_line() {
        let e = parse_unix_list_line("-rw-r--r-- 1 user group 1234 Jan 01 12:00 report.csv").unwrap();
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 1234);
        assert_eq!(e.name, "report.csv");
    }

    #[test]
    fn flags_symlinks() {
        let e = parse_unix_list_line("lrwxrwxrwx 1 user group 7 Jan 01 12:00 current -> v1").unwrap();
        assert_eq!(e.kind, EntryKind::Link);
    }

    #[test]
    fn skips_dot_entries() {
        assert!(parse_unix_list_line("drwxr-xr-x 2 user group 4096 Jan 01 12:00 .").is_none());
    }

    #[test]
    fn parses_mlsd_file_line() {
        let e = parse_mlsd_line("type=file;size=1234;modify=20260101120000; report.csv").unwrap();
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 1234);
        assert_eq!(e.mtime.as_deref(), Some("20260101120000"));
        assert_eq!(e.name, "report.csv");
    }

    #[test]
    fn parses_mlsd_dir_line() {
        let e = parse_mlsd_line("type=dir;size=0;modify=20260101120000; sub").unwrap();
        assert_eq!(e.kind, EntryKind::Dir);
    }

    #[test]
    fn mlsd_skips_dot_entries() {
        assert!(parse_mlsd_line("type=cdir;modify=20260101120000; .").is_none());
    }
}

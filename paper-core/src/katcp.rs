//! KATCP device handle
//!
//! ROACH2 boards expose their FPGA registers through tcpborphserver, a KATCP
//! line protocol on port 7147: `?request args..` answered by zero or more
//! `#request` informs and a final `!request ok|fail ..` reply.

use crate::device::{Device, DeviceError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

pub const DEFAULT_PORT: u16 = 7147;

/// Escapes one argument for the wire.
pub fn escape(arg: &[u8]) -> Vec<u8> {
    if arg.is_empty() {
        return b"\\@".to_vec();
    }
    let mut out = Vec::with_capacity(arg.len());
    for &b in arg {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b' ' => out.extend_from_slice(b"\\_"),
            0 => out.extend_from_slice(b"\\0"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0x1b => out.extend_from_slice(b"\\e"),
            b'\t' => out.extend_from_slice(b"\\t"),
            _ => out.push(b),
        }
    }
    out
}

pub fn unescape(arg: &str) -> String {
    if arg == "\\@" {
        return String::new();
    }
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('_') => out.push(' '),
            Some('0') => out.push('\0'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('e') => out.push('\x1b'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Final reply plus the informs that preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub args: Vec<String>,
    pub informs: Vec<Vec<String>>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.args.first().map(String::as_str) == Some("ok")
    }
}

pub struct KatcpDevice {
    host: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl KatcpDevice {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, DeviceError> {
        let unreachable = |reason: String| DeviceError::Unreachable { host: host.to_string(), reason };
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| unreachable("connect timed out".into()))?
            .map_err(|e| unreachable(e.to_string()))?;
        stream.set_nodelay(true).map_err(|e| unreachable(e.to_string()))?;
        let (r, w) = stream.into_split();
        debug!("connected to {}:{}", host, port);
        Ok(Self { host: host.to_string(), reader: BufReader::new(r), writer: w, timeout })
    }

    fn unreachable(&self, reason: impl ToString) -> DeviceError {
        DeviceError::Unreachable { host: self.host.clone(), reason: reason.to_string() }
    }

    pub async fn request(&mut self, name: &str, args: &[&[u8]]) -> Result<Reply, DeviceError> {
        let mut line = format!("?{name}").into_bytes();
        for arg in args {
            line.push(b' ');
            line.extend(escape(arg));
        }
        line.push(b'\n');
        trace!("{} <- ?{} ({} bytes)", self.host, name, line.len());

        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout, self.exchange(name, &line)).await;
        outcome.unwrap_or_else(|_| Err(self.unreachable(format!("?{name} timed out after {timeout:?}"))))
    }

    async fn exchange(&mut self, name: &str, line: &[u8]) -> Result<Reply, DeviceError> {
        self.writer.write_all(line).await.map_err(|e| self.unreachable(e))?;

        let mut informs = Vec::new();
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = self.reader.read_line(&mut buf).await.map_err(|e| self.unreachable(e))?;
            if n == 0 {
                return Err(self.unreachable("connection closed"));
            }
            let mut words = buf.split_whitespace();
            let Some(head) = words.next() else { continue };
            let args: Vec<String> = words.map(unescape).collect();
            if head.strip_prefix('!') == Some(name) {
                return Ok(Reply { args, informs });
            } else if head.strip_prefix('#') == Some(name) {
                informs.push(args);
            } else {
                // version-connect, log and other unsolicited informs
                trace!("{} -> {}", self.host, buf.trim_end());
            }
        }
    }

    async fn request_ok(&mut self, name: &str, args: &[&[u8]]) -> Result<Reply, DeviceError> {
        let reply = self.request(name, args).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(DeviceError::Rejected {
                host: self.host.clone(),
                request: name.to_string(),
                reply: reply.args.join(" "),
            })
        }
    }
}

fn parse_word(text: &str) -> Option<u32> {
    match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

impl Device for KatcpDevice {
    fn host(&self) -> &str {
        &self.host
    }

    async fn is_programmed(&mut self) -> Result<bool, DeviceError> {
        Ok(self.request("fpgastatus", &[]).await?.is_ok())
    }

    async fn list_features(&mut self) -> Result<Vec<String>, DeviceError> {
        let reply = self.request_ok("listdev", &[]).await?;
        Ok(reply.informs.into_iter().filter_map(|mut i| (!i.is_empty()).then(|| i.swap_remove(0))).collect())
    }

    async fn read_register(&mut self, name: &str) -> Result<u32, DeviceError> {
        let reply = self.request_ok("wordread", &[name.as_bytes(), b"0"]).await?;
        reply.args.get(1).and_then(|w| parse_word(w)).ok_or_else(|| DeviceError::Malformed {
            host: self.host.clone(),
            request: format!("wordread {name}"),
            reply: reply.args.join(" "),
        })
    }

    async fn write_register(&mut self, name: &str, value: u32) -> Result<(), DeviceError> {
        let value = format!("0x{value:x}");
        self.request_ok("wordwrite", &[name.as_bytes(), b"0", value.as_bytes()]).await?;
        Ok(())
    }

    async fn write_block(&mut self, name: &str, offset: u32, data: &[u8]) -> Result<(), DeviceError> {
        let offset = offset.to_string();
        self.request_ok("write", &[name.as_bytes(), offset.as_bytes(), data]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_escape_roundtrip_specials() {
        assert_eq!(escape(b""), b"\\@");
        assert_eq!(escape(b"a b\\c\n"), b"a\\_b\\\\c\\n");
        assert_eq!(unescape("a\\_b\\\\c\\n"), "a b\\c\n");
        assert_eq!(unescape("\\@"), "");
    }

    /// Answers each request line with canned replies keyed by request name.
    async fn fake_board(replies: &'static [(&'static str, &'static str)]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (r, mut w) = sock.into_split();
            w.write_all(b"#version-connect katcp-protocol 5.0-MI\n").await.unwrap();
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let name = line[1..].split(' ').next().unwrap().to_string();
                for (req, reply) in replies {
                    if *req == name {
                        w.write_all(reply.as_bytes()).await.unwrap();
                    }
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_katcp_requests() {
        let port = fake_board(&[
            ("fpgastatus", "!fpgastatus ok\n"),
            ("listdev", "#listdev eth_0_xip\n#listdev sync_count\n!listdev ok 2\n"),
            ("wordread", "!wordread ok 0x0000002a\n"),
            ("wordwrite", "!wordwrite fail\n"),
            ("write", "!write ok\n"),
        ])
        .await;

        let mut dev = KatcpDevice::connect("127.0.0.1", port, Duration::from_secs(2)).await.unwrap();
        assert!(dev.is_programmed().await.unwrap());
        assert_eq!(dev.list_features().await.unwrap(), vec!["eth_0_xip", "sync_count"]);
        assert_eq!(dev.read_register("sync_count").await.unwrap(), 42);
        assert!(matches!(
            dev.write_register("fid", 1).await,
            Err(DeviceError::Rejected { .. })
        ));
        dev.write_block("eq_0_coeffs", 0, &[0, 0, 0x4b, 0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = KatcpDevice::connect("127.0.0.1", port, Duration::from_secs(1)).await.err();
        assert!(matches!(err, Some(DeviceError::Unreachable { .. })));
    }
}

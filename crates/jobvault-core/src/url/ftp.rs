//! Minimal passive-mode FTP client (binary transfers only).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::io::{ReaderStream, StreamReader};

use super::{BoxAsyncRead, Url, UrlAccess};
use crate::error::{StoreError, StoreResult};

const DEFAULT_PORT: u16 = 21;

/// `ftp:` URLs. Credentials come from the URL, anonymous otherwise.
#[derive(Debug, Clone)]
pub struct FtpAccess {
    timeout: Duration,
}

impl Default for FtpAccess {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl FtpAccess {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn login(&self, url: &Url) -> StoreResult<Control> {
        let host = url
            .host_str()
            .ok_or_else(|| StoreError::UnsupportedUrl(format!("{url}: missing host")))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| StoreError::Transient(format!("{url}: connect timed out")))??;
        let (read, write) = stream.into_split();
        let mut control = Control {
            host,
            reader: BufReader::new(read),
            writer: write,
        };
        control.expect(&[220]).await?;

        let user = match url.username() {
            "" => "anonymous".to_string(),
            u => percent_decode(u),
        };
        let pass = url
            .password()
            .map(percent_decode)
            .unwrap_or_else(|| "anonymous@".to_string());
        let (code, _) = control.command(&format!("USER {user}")).await?;
        match code {
            230 => {}
            331 => {
                control.command_expect(&format!("PASS {pass}"), &[230, 202]).await?;
            }
            _ => return Err(StoreError::Backend(format!("{url}: login rejected ({code})"))),
        }
        control.command_expect("TYPE I", &[200]).await?;
        Ok(control)
    }
}

/// The control connection.
struct Control {
    host: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Control {
    async fn reply(&mut self) -> StoreResult<(u16, String)> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(StoreError::Transient("FTP control connection closed".to_string()));
        }
        let code = parse_code(&line)?;
        let mut text = line.trim_end().to_string();
        if line.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                line.clear();
                if self.reader.read_line(&mut line).await? == 0 {
                    return Err(StoreError::Transient(
                        "FTP control connection closed".to_string(),
                    ));
                }
                text.push('\n');
                text.push_str(line.trim_end());
                if line.starts_with(&terminator) {
                    break;
                }
            }
        }
        Ok((code, text))
    }

    async fn expect(&mut self, codes: &[u16]) -> StoreResult<String> {
        let (code, text) = self.reply().await?;
        if codes.contains(&code) {
            Ok(text)
        } else if code == 550 {
            Err(StoreError::NoSuchFile(text))
        } else if (400..500).contains(&code) {
            Err(StoreError::Transient(format!("FTP: {text}")))
        } else {
            Err(StoreError::Backend(format!("FTP: {text}")))
        }
    }

    async fn command(&mut self, command: &str) -> StoreResult<(u16, String)> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.reply().await
    }

    async fn command_expect(&mut self, command: &str, codes: &[u16]) -> StoreResult<String> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.expect(codes).await
    }

    /// Final reply of a data transfer. Anything but 226/250 means the data
    /// connection did not carry the whole file.
    async fn transfer_complete(&mut self) -> StoreResult<()> {
        let (code, text) = self.reply().await?;
        match code {
            226 | 250 => Ok(()),
            400..=499 => Err(StoreError::Transient(format!("FTP transfer aborted: {text}"))),
            _ => Err(StoreError::Backend(format!("FTP transfer failed: {text}"))),
        }
    }

    async fn passive(&mut self) -> StoreResult<TcpStream> {
        let text = self.command_expect("PASV", &[227]).await?;
        let port = parse_pasv_port(&text)?;
        Ok(TcpStream::connect((self.host.as_str(), port)).await?)
    }

    async fn quit(mut self) {
        let _ = self.command("QUIT").await;
    }
}

fn parse_code(line: &str) -> StoreResult<u16> {
    line.get(..3)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| StoreError::Backend(format!("malformed FTP reply: {}", line.trim_end())))
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
fn parse_pasv_port(text: &str) -> StoreResult<u16> {
    let malformed = || StoreError::Backend(format!("malformed PASV reply: {text}"));
    let start = text.find('(').ok_or_else(malformed)?;
    let end = text[start..].find(')').ok_or_else(malformed)? + start;
    let fields: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|f| f.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .map_err(|_| malformed())?;
    match fields.as_slice() {
        [_, _, _, _, hi, lo] if *hi < 256 && *lo < 256 => Ok(hi * 256 + lo),
        _ => Err(malformed()),
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(b) = input
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn remote_path(url: &Url) -> String {
    percent_decode(url.path())
}

/// Body of a running `RETR`. The control reply is checked once the data
/// connection reaches EOF, so a transfer the server aborted fails the read.
fn download(data: TcpStream, mut control: Control) -> BoxAsyncRead {
    let finish = futures::stream::once(async move {
        control.transfer_complete().await?;
        control.quit().await;
        Ok::<_, StoreError>(())
    })
    .filter_map(|done| async move { done.err().map(|e| Err::<Bytes, _>(e.into_io())) });
    let body = ReaderStream::new(data).chain(finish);
    Box::new(StreamReader::new(Box::pin(body)))
}

#[async_trait]
impl UrlAccess for FtpAccess {
    fn schemes(&self) -> &[&'static str] {
        &["ftp"]
    }

    async fn exists(&self, url: &Url) -> StoreResult<bool> {
        let mut control = self.login(url).await?;
        let (code, text) = control
            .command(&format!("SIZE {}", remote_path(url)))
            .await?;
        control.quit().await;
        match code {
            213 => Ok(true),
            550 => Ok(false),
            _ => Err(StoreError::Backend(format!("FTP: {text}"))),
        }
    }

    async fn open_read(&self, url: &Url) -> StoreResult<BoxAsyncRead> {
        let mut control = self.login(url).await?;
        let data = control.passive().await?;
        control
            .command_expect(&format!("RETR {}", remote_path(url)), &[125, 150])
            .await
            .map_err(|e| match e {
                StoreError::NoSuchFile(_) => StoreError::NoSuchFile(url.to_string()),
                e => e,
            })?;
        tracing::debug!(url = %url, "Streaming FTP download");
        Ok(download(data, control))
    }

    async fn write_from(&self, url: &Url, mut content: BoxAsyncRead) -> StoreResult<u64> {
        let mut control = self.login(url).await?;
        let mut data = control.passive().await?;
        control
            .command_expect(&format!("STOR {}", remote_path(url)), &[125, 150])
            .await?;
        let written = tokio::io::copy(&mut content, &mut data).await?;
        data.shutdown().await?;
        drop(data);
        control.transfer_complete().await?;
        control.quit().await;
        Ok(written)
    }
}

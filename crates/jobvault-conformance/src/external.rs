//! External resources used by import/export cases.
//!
//! [`ExternalStores`] is created empty and passed by reference to every
//! case. Resources (an HTTP server, an FTP server, secondary stores) are
//! started on first use and released together by [`ExternalStores::teardown`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use jobvault_core::JobStore;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::fixture::{StoreFixture, initialized};

type Files = Arc<Mutex<HashMap<String, Bytes>>>;

/// Lazily started external resources shared by one case.
#[derive(Default)]
pub struct ExternalStores {
    http: OnceCell<HttpStub>,
    ftp: OnceCell<FtpStub>,
    secondary: tokio::sync::Mutex<Vec<Arc<dyn JobStore>>>,
}

impl ExternalStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// The HTTP server, started on first use.
    pub async fn http(&self) -> &HttpStub {
        self.http
            .get_or_init(|| async { HttpStub::start().await.unwrap() })
            .await
    }

    /// The FTP server, started on first use.
    pub async fn ftp(&self) -> &FtpStub {
        self.ftp
            .get_or_init(|| async { FtpStub::start().await.unwrap() })
            .await
    }

    /// A further initialized store of the fixture's backend, destroyed on
    /// teardown.
    pub async fn secondary(&self, fixture: &dyn StoreFixture) -> Arc<dyn JobStore> {
        let store: Arc<dyn JobStore> = Arc::from(initialized(fixture).await);
        self.secondary.lock().await.push(store.clone());
        store
    }

    /// Release everything that was started.
    pub async fn teardown(self) {
        for store in self.secondary.lock().await.drain(..) {
            if let Err(e) = store.destroy().await {
                tracing::warn!(locator = %store.locator(), error = %e, "Failed to destroy secondary store");
            }
        }
        if let Some(http) = self.http.get() {
            http.task.abort();
        }
        if let Some(ftp) = self.ftp.get() {
            ftp.task.abort();
        }
    }
}

/// In-memory HTTP server answering `GET`, `HEAD` and `PUT` on any path.
pub struct HttpStub {
    addr: SocketAddr,
    files: Files,
    task: JoinHandle<()>,
}

impl HttpStub {
    pub async fn start() -> std::io::Result<Self> {
        let files: Files = Arc::default();
        let app = Router::new()
            .route("/{*path}", get(http_get).put(http_put))
            .with_state(files.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!(error = %e, "HTTP stub stopped");
            }
        });
        Ok(Self { addr, files, task })
    }

    /// URL of `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{path}", self.addr)
    }

    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        self.files.lock().unwrap().insert(path.to_string(), data.into());
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

async fn http_get(
    State(files): State<Files>,
    UrlPath(path): UrlPath<String>,
) -> Result<Bytes, StatusCode> {
    files
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

async fn http_put(
    State(files): State<Files>,
    UrlPath(path): UrlPath<String>,
    body: Bytes,
) -> StatusCode {
    files.lock().unwrap().insert(path, body);
    StatusCode::CREATED
}

/// In-memory FTP server: anonymous login, passive mode, `RETR`, `STOR`
/// and `SIZE`.
pub struct FtpStub {
    addr: SocketAddr,
    files: Files,
    task: JoinHandle<()>,
}

impl FtpStub {
    pub async fn start() -> std::io::Result<Self> {
        let files: Files = Arc::default();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let served = files.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let files = served.clone();
                tokio::spawn(async move {
                    if let Err(e) = ftp_session(stream, files).await {
                        tracing::debug!(error = %e, "FTP stub session ended");
                    }
                });
            }
        });
        Ok(Self { addr, files, task })
    }

    /// URL of `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("ftp://{}/{path}", self.addr)
    }

    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        self.files.lock().unwrap().insert(path.to_string(), data.into());
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

async fn ftp_session(stream: TcpStream, files: Files) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut passive: Option<TcpListener> = None;

    write.write_all(b"220 stub ready\r\n").await?;
    while let Some(line) = lines.next_line().await? {
        let (command, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let key = arg.trim_start_matches('/').to_string();
        match command.to_ascii_uppercase().as_str() {
            "USER" => write.write_all(b"331 password please\r\n").await?,
            "PASS" => write.write_all(b"230 logged in\r\n").await?,
            "TYPE" => write.write_all(b"200 binary\r\n").await?,
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                passive = Some(listener);
                let reply = format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                    port / 256,
                    port % 256
                );
                write.write_all(reply.as_bytes()).await?;
            }
            "SIZE" => {
                let size = files.lock().unwrap().get(&key).map(|d| d.len());
                let reply = match size {
                    Some(n) => format!("213 {n}\r\n"),
                    None => "550 no such file\r\n".to_string(),
                };
                write.write_all(reply.as_bytes()).await?;
            }
            "RETR" => {
                let data = files.lock().unwrap().get(&key).cloned();
                let (Some(data), Some(listener)) = (data, passive.take()) else {
                    write.write_all(b"550 no such file\r\n").await?;
                    continue;
                };
                write.write_all(b"150 sending\r\n").await?;
                let (mut conn, _) = listener.accept().await?;
                // The client may stop reading early; that ends the transfer.
                let _ = conn.write_all(&data).await;
                let _ = conn.shutdown().await;
                drop(conn);
                write.write_all(b"226 done\r\n").await?;
            }
            "STOR" => {
                let Some(listener) = passive.take() else {
                    write.write_all(b"425 use PASV first\r\n").await?;
                    continue;
                };
                write.write_all(b"150 receiving\r\n").await?;
                let (mut conn, _) = listener.accept().await?;
                let mut data = Vec::new();
                conn.read_to_end(&mut data).await?;
                files.lock().unwrap().insert(key, Bytes::from(data));
                write.write_all(b"226 stored\r\n").await?;
            }
            "QUIT" => {
                write.write_all(b"221 bye\r\n").await?;
                break;
            }
            _ => write.write_all(b"502 not implemented\r\n").await?,
        }
    }
    Ok(())
}

//! Minimal HTTP/1.1 front end
//!
//! Parses one request line per connection and routes it. Streaming clients
//! get a [`ChannelTransport`] registered with the capture loop; this task
//! only copies queued chunks onto the socket.

use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use super::transport::ChannelTransport;
use crate::error::{CaptureError, StorageError};
use crate::pipeline::OrchestratorHandle;
use crate::storage::ImageCatalog;

const MAX_HEADER_LINES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
}

impl Request {
    /// Parse `GET /path?query HTTP/1.1`
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?;
        parts.next().filter(|v| v.starts_with("HTTP/"))?;

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        Some(Self {
            method,
            path,
            query,
        })
    }

    /// Value of a query parameter, `Some("")` for a bare flag
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }
}

pub struct HttpServer {
    listener: TcpListener,
    handle: OrchestratorHandle,
    catalog: Option<ImageCatalog>,
    stream_buffer: usize,
}

impl HttpServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        handle: OrchestratorHandle,
        catalog: Option<ImageCatalog>,
        stream_buffer: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handle,
            catalog,
            stream_buffer,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task each
    pub async fn serve(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "HTTP server listening");

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };

            let handle = self.handle.clone();
            let catalog = self.catalog.clone();
            let stream_buffer = self.stream_buffer;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handle, catalog, stream_buffer).await {
                    debug!(%peer, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    handle: OrchestratorHandle,
    catalog: Option<ImageCatalog>,
    stream_buffer: usize,
) -> io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }
    let Some(request) = Request::parse(&line) else {
        let mut stream = reader.into_inner();
        return respond(&mut stream, 400, "Bad Request", "text/plain", b"Bad request\n").await;
    };

    // Drain the remaining header lines; none of them matter here
    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
    }
    let mut stream = reader.into_inner();

    debug!(method = %request.method, path = %request.path, "Request");
    if request.method != "GET" {
        return respond(&mut stream, 405, "Method Not Allowed", "text/plain", b"GET only\n").await;
    }

    match request.path.as_str() {
        "/" => respond(&mut stream, 200, "OK", "text/plain", index().as_bytes()).await,
        "/stream" => stream_to(stream, &handle, stream_buffer).await,
        "/capture" => {
            let flash = matches!(request.param("flash"), Some("" | "1" | "true" | "on"));
            capture(&mut stream, &handle, flash).await
        }
        "/list" => list(&mut stream, catalog).await,
        "/download" => download(&mut stream, catalog, request.param("file")).await,
        _ => respond(&mut stream, 404, "Not Found", "text/plain", b"Not found\n").await,
    }
}

fn index() -> String {
    [
        "/               - this list",
        "/stream         - live MJPEG stream",
        "/capture        - take a picture now (?flash=1 to light the flash)",
        "/list           - saved images",
        "/download?file= - download an image",
    ]
    .join("\n")
        + "\n"
}

async fn stream_to(
    mut stream: TcpStream,
    handle: &OrchestratorHandle,
    stream_buffer: usize,
) -> io::Result<()> {
    let (transport, rx) = ChannelTransport::new(stream_buffer);
    if handle.open_stream(Box::new(transport)).is_err() {
        return respond(&mut stream, 503, "Service Unavailable", "text/plain", b"Camera offline\n")
            .await;
    }

    // Dropping `rx` on a failed write is how the session learns the peer left
    while let Ok(chunks) = rx.recv_async().await {
        for chunk in chunks {
            stream.write_all(&chunk).await?;
        }
    }
    stream.flush().await
}

async fn capture(stream: &mut TcpStream, handle: &OrchestratorHandle, flash: bool) -> io::Result<()> {
    match handle.capture(flash).await {
        Ok(name) => {
            let body = format!("Image saved successfully: {name}\n");
            respond(stream, 200, "OK", "text/plain", body.as_bytes()).await
        }
        Err(CaptureError::Unavailable) => {
            respond(stream, 503, "Service Unavailable", "text/plain", b"Camera offline\n").await
        }
        Err(e) => {
            let body = format!("Capture failed: {e}\n");
            respond(stream, 500, "Internal Server Error", "text/plain", body.as_bytes()).await
        }
    }
}

async fn list(stream: &mut TcpStream, catalog: Option<ImageCatalog>) -> io::Result<()> {
    let Some(catalog) = catalog else {
        return respond(stream, 404, "Not Found", "text/plain", b"No image storage\n").await;
    };

    let listed = tokio::task::spawn_blocking(move || catalog.list())
        .await
        .map_err(io::Error::other)?;

    match listed {
        Ok(images) if images.is_empty() => {
            respond(stream, 200, "OK", "text/plain", b"No images found\n").await
        }
        Ok(images) => {
            let mut body = String::new();
            for image in &images {
                let _ = writeln!(body, "{}\t{} KB", image.filename, image.size / 1024);
            }
            let _ = writeln!(body, "Total images: {}", images.len());
            respond(stream, 200, "OK", "text/plain", body.as_bytes()).await
        }
        Err(e) => {
            let body = format!("Listing failed: {e}\n");
            respond(stream, 500, "Internal Server Error", "text/plain", body.as_bytes()).await
        }
    }
}

async fn download(
    stream: &mut TcpStream,
    catalog: Option<ImageCatalog>,
    file: Option<&str>,
) -> io::Result<()> {
    let (Some(catalog), Some(file)) = (catalog, file) else {
        return respond(stream, 400, "Bad Request", "text/plain", b"Missing file parameter\n").await;
    };

    let name = file.to_string();
    let read = tokio::task::spawn_blocking(move || catalog.read(&name))
        .await
        .map_err(io::Error::other)?;

    match read {
        Ok(bytes) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: image/jpeg\r\n\
                 Content-Length: {}\r\n\
                 Content-Disposition: attachment; filename={}\r\n\
                 Connection: close\r\n\r\n",
                bytes.len(),
                file.trim_start_matches('/')
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&bytes).await?;
            stream.flush().await
        }
        Err(StorageError::NotFound(_)) => {
            respond(stream, 404, "Not Found", "text/plain", b"File not found\n").await
        }
        Err(StorageError::InvalidName(_)) => {
            respond(stream, 400, "Bad Request", "text/plain", b"Invalid file name\n").await
        }
        Err(e) => {
            let body = format!("Read failed: {e}\n");
            respond(stream, 500, "Internal Server Error", "text/plain", body.as_bytes()).await
        }
    }
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

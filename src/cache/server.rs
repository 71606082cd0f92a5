//! Loopback HTTP responder for the delivery cache.
//!
//! Engine code that can only issue ordinary HTTP requests loads its binary
//! assets from here. Only `GET`/`HEAD` under `/voice/` are answered; the
//! responder never goes to the network itself.

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::{DeliveryCache, FetchOutcome, RequestRoute};

/// Serve registered voice URLs on an already bound listener. Binding is left
/// to the caller so a failed bind can fall back to ephemeral delivery.
pub async fn serve(listener: TcpListener, cache: DeliveryCache) {
    loop {
        match listener.accept().await {
            Ok((socket, _addr)) => {
                let cache = cache.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, cache).await {
                        log::warn!("Delivery cache connection error: {}", e);
                    }
                });
            }
            Err(e) => log::error!("Delivery cache accept error: {}", e),
        }
    }
}

async fn handle_connection(mut socket: TcpStream, cache: DeliveryCache) -> std::io::Result<()> {
    let (reader, mut writer) = socket.split();
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }

    // Drain headers; nothing in them changes the response.
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 || header.trim().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_uppercase();
    let target = parts.next().unwrap_or_default();

    if method != "GET" && method != "HEAD" {
        return write_status(&mut writer, "405 Method Not Allowed").await;
    }

    let url = match cache.origin().join(target) {
        Ok(url) if super::classify(cache.config(), &url) == RequestRoute::Voice => url,
        _ => return write_status(&mut writer, "404 Not Found").await,
    };

    match cache.fetch(&url).await {
        Ok(FetchOutcome::Hit(asset)) => {
            log::debug!("Delivery cache served {}", url);
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\
                 Connection: close\r\n\r\n",
                asset.mime,
                asset.bytes.len()
            );
            writer.write_all(head.as_bytes()).await?;
            if method == "GET" {
                writer.write_all(&asset.bytes).await?;
            }
            writer.flush().await
        }
        Ok(_) => write_status(&mut writer, "404 Not Found").await,
        Err(e) => {
            log::warn!("Delivery cache lookup for {} failed: {}", url, e);
            write_status(&mut writer, "503 Service Unavailable").await
        }
    }
}

async fn write_status<W: AsyncWrite + Unpin>(writer: &mut W, status: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

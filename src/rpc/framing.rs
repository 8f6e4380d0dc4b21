//! Content-Length framing as defined by the LSP base protocol.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Reads one framed payload. Returns `Ok(None)` on a clean end-of-stream at a
/// message boundary; EOF inside headers or body is an error.
pub async fn read_message<R>(reader: &mut BufReader<R>) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    let mut saw_header = false;

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            if saw_header {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside a header section",
                ));
            }
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        saw_header = true;
        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed header line: {:?}", trimmed),
            ));
        };
        if name.eq_ignore_ascii_case("content-length") {
            let parsed = value.trim().parse::<usize>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid Content-Length {:?}: {}", value.trim(), e),
                )
            })?;
            content_length = Some(parsed);
        }
        // Content-Type is the only other defined header; it carries no
        // information we act on.
    }

    let Some(length) = content_length else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "header section ended without Content-Length",
        ));
    };

    let mut payload = vec![0u8; length];
    tokio::io::AsyncReadExt::read_exact(reader, &mut payload).await?;
    Ok(Some(payload))
}

/// Writes one framed payload and flushes.
pub async fn write_message<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_payload() {
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, _keep) = tokio::io::split(client);
        let (_keep2, mut write_half) = tokio::io::split(server);

        write_message(&mut write_half, br#"{"jsonrpc":"2.0","method":"x"}"#)
            .await
            .unwrap();

        let mut reader = BufReader::new(read_half);
        let payload = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(payload, br#"{"jsonrpc":"2.0","method":"x"}"#);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let (read_half, _w) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_content_length_is_an_error() {
        let (client, server) = tokio::io::duplex(256);
        let (read_half, _w) = tokio::io::split(client);
        let (_r, mut write_half) = tokio::io::split(server);

        tokio::io::AsyncWriteExt::write_all(&mut write_half, b"Content-Type: application/json\r\n\r\n")
            .await
            .unwrap();
        drop(write_half);

        let mut reader = BufReader::new(read_half);
        assert!(read_message(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn header_names_are_case_insensitive() {
        let (client, server) = tokio::io::duplex(256);
        let (read_half, _w) = tokio::io::split(client);
        let (_r, mut write_half) = tokio::io::split(server);

        tokio::io::AsyncWriteExt::write_all(&mut write_half, b"CONTENT-LENGTH: 2\r\n\r\n{}")
            .await
            .unwrap();

        let mut reader = BufReader::new(read_half);
        let payload = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(payload, b"{}");
    }
}

// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

use crate::Error;
use crate::protocol::{RequestMessage, Response};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// A connection to a running daemon.
pub struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// # Errors
    ///
    /// Returns error if no daemon is listening on `path`.
    pub async fn connect(path: &Path) -> Result<Self, Error> {
        let (reader, writer) = UnixStream::connect(path).await?.into_split();

        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// # Errors
    ///
    /// Returns error if the message could not be written.
    pub async fn send(&mut self, message: &RequestMessage) -> Result<(), Error> {
        let mut buffer = serde_json::to_vec(message)?;
        buffer.push(b'\n');
        self.writer.write_all(&buffer).await?;
        Ok(())
    }

    /// Next message from the daemon, or `None` once it closed the connection.
    ///
    /// # Errors
    ///
    /// Returns error on a read failure or a malformed message.
    pub async fn recv(&mut self) -> Result<Option<Response>, Error> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };

            if line.trim().is_empty() {
                continue;
            }

            return Ok(Some(serde_json::from_str(&line)?));
        }
    }

    /// Sends `message` and waits for its reply, skipping broadcasts on the way.
    ///
    /// # Errors
    ///
    /// Returns error if the daemon closed the connection before replying.
    pub async fn request(&mut self, message: &RequestMessage) -> Result<Response, Error> {
        self.send(message).await?;

        while let Some(response) = self.recv().await? {
            if !response.is_broadcast() {
                return Ok(response);
            }

            tracing::debug!(?response, "skipping broadcast while awaiting reply");
        }

        Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()))
    }
}

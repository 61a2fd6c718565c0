//! Byte-stream plumbing between sockets and the node.
//!
//! Every connection is split into a reader task and a writer task. The reader
//! decodes frames and forwards them to the node; the writer drains an
//! unbounded queue of messages into the socket. Neither touches node state.

use futures_util::{SinkExt, StreamExt};
use meshlink_core::{CodecError, Contact, DecodeError, Message, MessageCodec};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Identifies one connection for its whole lifetime. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnId(u64);

impl From<u64> for ConnId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Traffic arriving at the node from outside its own task.
pub(crate) enum Inbound {
    /// A complete frame, well-formed or not.
    Frame {
        conn: ConnId,
        frame: Result<Message, DecodeError>,
    },
    /// The reader reached end of stream, or stopped on a framing error.
    Closed {
        conn: ConnId,
        error: Option<CodecError>,
    },
    /// An outbound dial finished.
    Dialed {
        contact: Contact,
        result: std::io::Result<TcpStream>,
    },
}

/// Handle to a connection's I/O tasks.
pub(crate) struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    reader: Option<AbortHandle>,
}

impl Link {
    /// Queue a message for the writer.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Abort the reader and drop the queue; the writer flushes and shuts the
    /// socket down once the queue is drained.
    pub fn close(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }

    /// A link backed by nothing but a channel.
    #[cfg(test)]
    pub fn detached(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            outbound,
            reader: None,
        }
    }
}

/// Spawn the reader and writer tasks for `stream`.
pub(crate) fn spawn<S>(stream: S, conn: ConnId, inbound: mpsc::UnboundedSender<Inbound>) -> Link
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let mut sink = FramedWrite::new(write, MessageCodec::new());
        while let Some(message) = queue.recv().await {
            if let Err(e) = sink.send(message).await {
                tracing::warn!(%conn, error = %e, "write failed");
                return;
            }
        }
        if let Err(e) = sink.close().await {
            tracing::debug!(%conn, error = %e, "shutdown failed");
        }
    });

    let reader = tokio::spawn(async move {
        let mut frames = FramedRead::new(read, MessageCodec::new());
        let mut error = None;
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    if inbound.send(Inbound::Frame { conn, frame }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(%conn, error = %e, "read failed");
                    error = Some(e);
                    break;
                }
            }
        }
        let _ = inbound.send(Inbound::Closed { conn, error });
    });

    Link {
        outbound,
        reader: Some(reader.abort_handle()),
    }
}

/// Dial `contact` off the node task and report back through `inbound`.
pub(crate) fn dial(contact: Contact, inbound: mpsc::UnboundedSender<Inbound>) {
    tokio::spawn(async move {
        let result = match contact.socket_addr() {
            Some(addr) => TcpStream::connect(addr).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("contact {contact} has no valid port"),
            )),
        };
        let _ = inbound.send(Inbound::Dialed { contact, result });
    });
}

use std::net::SocketAddr;

use futures::SinkExt;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_util::codec::{FramedWrite, LinesCodec};
use tracing::debug;

use super::{MAX_FRAME_BYTES, TransportError};
use crate::domain::record::{ContentRecord, Fields, IncomingRecord, Record};

/// Worker-side connection to a listener's record transport.
pub struct RecordClient {
  sink: FramedWrite<TcpStream, LinesCodec>,
}

impl RecordClient {
  /// Connect to the rendezvous address the listener published.
  pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!(%addr, "Connected to record transport");
    Ok(Self {
      sink: FramedWrite::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
    })
  }

  pub async fn send(&mut self, record: impl Into<IncomingRecord>) -> Result<(), TransportError> {
    let json = serde_json::to_string(&record.into())?;
    self.sink.send(json).await?;
    Ok(())
  }

  /// Send a structured row for `table`.
  pub async fn send_record(&mut self, table: &str, data: Fields) -> Result<(), TransportError> {
    self.send(Record::new(table, data)).await
  }

  /// Send a content blob; the hash is computed here.
  pub async fn send_content(&mut self, table: &str, content: Vec<u8>) -> Result<(), TransportError> {
    self.send(ContentRecord::new(table, content)).await
  }

  /// Flush and half-close the connection.
  pub async fn close(self) -> Result<(), TransportError> {
    let mut stream = self.sink.into_inner();
    stream.shutdown().await?;
    Ok(())
  }
}

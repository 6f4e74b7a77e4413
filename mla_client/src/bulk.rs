use crate::channel::BulkChannel;
use crate::error::ChannelError;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{timeout, Duration},
};
use tonic::async_trait;

pub const DEFAULT_BULK_PORT: u16 = 43777;

/// Raw TCP stream carrying buffer payloads next to the control channel.
pub struct TcpBulkChannel {
    stream: TcpStream,
    peer: String,
}

impl TcpBulkChannel {
    pub async fn connect(address: String, connect_timeout: Duration) -> Result<Self, ChannelError> {
        let stream = match timeout(connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ChannelError::Closed(format!(
                    "bulk channel {}: {}",
                    address, e
                )))
            }
            Err(_) => return Err(ChannelError::Timeout(format!("bulk channel {}", address))),
        };
        stream
            .set_nodelay(true)
            .map_err(|e| ChannelError::Closed(format!("bulk channel {}: {}", address, e)))?;

        tracing::debug!("Bulk channel connected to {}", address);
        Ok(Self {
            stream,
            peer: address,
        })
    }

    fn closed(&self, e: std::io::Error) -> ChannelError {
        ChannelError::Closed(format!("bulk channel {}: {}", self.peer, e))
    }
}

#[async_trait]
impl BulkChannel for TcpBulkChannel {
    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if let Err(e) = self.stream.write_all(data).await {
            return Err(self.closed(e));
        }
        if let Err(e) = self.stream.flush().await {
            return Err(self.closed(e));
        }
        Ok(())
    }

    async fn recv(&mut self, length: u64) -> Result<Vec<u8>, ChannelError> {
        let mut buffer = vec![0u8; length as usize];
        if let Err(e) = self.stream.read_exact(&mut buffer).await {
            return Err(self.closed(e));
        }
        Ok(buffer)
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Bulk channel {} shutdown: {}", self.peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_exact_length_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let echo = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0u8; 6];
            socket.read_exact(&mut buffer).await.unwrap();
            socket.write_all(&buffer).await.unwrap();
        });

        let mut channel = TcpBulkChannel::connect(address, Duration::from_secs(1))
            .await
            .unwrap();
        channel.send(b"abc").await.unwrap();
        channel.send(b"def").await.unwrap();
        let received = channel.recv(6).await.unwrap();
        assert_eq!(received, b"abcdef");

        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_on_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut channel = TcpBulkChannel::connect(address, Duration::from_secs(1))
            .await
            .unwrap();
        server.await.unwrap();

        let result = channel.recv(4).await;
        assert!(matches!(result, Err(ChannelError::Closed(_))));
    }
}

use crate::channel::{BulkChannel, ControlChannel};
use crate::error::ChannelError;
use tonic::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Payloads travel on the bulk channel; the control channel only carries
    /// byte counts.
    #[default]
    Bulk,
    /// Payloads are serialized into the control request itself.
    Control,
}

/// Moves buffer payloads between host and device.
///
/// Picked once when the device is bound, so the session never has to choose
/// between parallel upload/download paths afterwards.
#[async_trait]
pub trait BufferTransport: Send {
    fn mode(&self) -> TransferMode;

    async fn upload(
        &mut self,
        control: &mut dyn ControlChannel,
        handle: u64,
        data: &[u8],
    ) -> Result<(), ChannelError>;

    async fn download(
        &mut self,
        control: &mut dyn ControlChannel,
        handle: u64,
        length: u64,
    ) -> Result<Vec<u8>, ChannelError>;

    async fn close(&mut self) {}
}

pub struct ControlTransfer;

#[async_trait]
impl BufferTransport for ControlTransfer {
    fn mode(&self) -> TransferMode {
        TransferMode::Control
    }

    async fn upload(
        &mut self,
        control: &mut dyn ControlChannel,
        handle: u64,
        data: &[u8],
    ) -> Result<(), ChannelError> {
        control.upload(handle, data).await
    }

    async fn download(
        &mut self,
        control: &mut dyn ControlChannel,
        handle: u64,
        length: u64,
    ) -> Result<Vec<u8>, ChannelError> {
        control.download(handle, length).await
    }
}

pub struct BulkTransfer {
    bulk: Box<dyn BulkChannel>,
}

impl BulkTransfer {
    pub fn new(bulk: Box<dyn BulkChannel>) -> Self {
        Self { bulk }
    }
}

#[async_trait]
impl BufferTransport for BulkTransfer {
    fn mode(&self) -> TransferMode {
        TransferMode::Bulk
    }

    async fn upload(
        &mut self,
        control: &mut dyn ControlChannel,
        handle: u64,
        data: &[u8],
    ) -> Result<(), ChannelError> {
        // Payload must be fully sent before the device is told to expect it.
        self.bulk.send(data).await?;
        control.upload_announce(handle, data.len() as u64).await
    }

    async fn download(
        &mut self,
        control: &mut dyn ControlChannel,
        handle: u64,
        length: u64,
    ) -> Result<Vec<u8>, ChannelError> {
        control.download_announce(handle, length).await?;
        self.bulk.recv(length).await
    }

    async fn close(&mut self) {
        self.bulk.close().await;
    }
}

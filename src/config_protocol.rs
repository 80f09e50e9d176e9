use crate::sample_decoder::SampleWidth;
use crate::transport::{AcquisitionError, LinkReader, ReadStage};
use std::io::{Read, Write};

/// Sent by the host to ask the device for its channel configuration
pub const CONFIG_REQUEST: u8 = 0xFF;

/// Precedes every configuration block, oldest byte first
pub const SYNC_MARKER: [u8; 4] = [0x0D, 0xF0, 0xAD, 0xBA];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub width: SampleWidth,
    pub title: String,
}

/// Channel layout announced by the device, in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    channels: Vec<ChannelDescriptor>,
}

impl ChannelConfig {
    pub fn new(channels: Vec<ChannelDescriptor>) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|channel| channel.title.as_str())
    }

    /// Bytes per frame, i.e. one sample from every channel
    pub fn frame_len(&self) -> usize {
        self.channels.iter().map(|channel| channel.width.byte_len()).sum()
    }
}

/// Watches a byte stream for [`SYNC_MARKER`]
#[derive(Debug, Clone, Default)]
pub struct SyncDetector {
    window: [u8; 4],
}

impl SyncDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next byte; true once the last four bytes are the marker
    pub fn push(&mut self, byte: u8) -> bool {
        self.window.rotate_left(1);
        self.window[3] = byte;
        self.window == SYNC_MARKER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingSync,
    Synchronized,
    ConfigRead,
    Done,
    Failed,
}

/// Request, synchronize and parse one channel configuration
#[derive(Debug)]
pub struct ConfigProtocol {
    state: HandshakeState,
}

impl ConfigProtocol {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the whole handshake.
    ///
    /// Yields either a complete configuration or an error; a cleared run
    /// flag surfaces as [`AcquisitionError::Cancelled`] and leaves the
    /// protocol back in `Idle` rather than `Failed`.
    pub fn negotiate<T: Read + Write>(
        &mut self,
        link: &mut LinkReader<T>,
    ) -> Result<ChannelConfig, AcquisitionError> {
        let result = self.handshake(link);
        self.state = match &result {
            Ok(_) => HandshakeState::Done,
            Err(AcquisitionError::Cancelled) => HandshakeState::Idle,
            Err(e) => {
                log::error!("Handshake failed in state {:?}: {}", self.state, e);
                HandshakeState::Failed
            }
        };
        result
    }

    fn handshake<T: Read + Write>(
        &mut self,
        link: &mut LinkReader<T>,
    ) -> Result<ChannelConfig, AcquisitionError> {
        log::debug!("Asking for serial config");
        link.write_all(&[CONFIG_REQUEST])?;
        self.state = HandshakeState::AwaitingSync;

        Self::synchronize(link)?;
        self.state = HandshakeState::Synchronized;
        log::debug!("Synchronized");

        let config = Self::read_config(link)?;
        self.state = HandshakeState::ConfigRead;
        Ok(config)
    }

    fn synchronize<T: Read + Write>(link: &mut LinkReader<T>) -> Result<(), AcquisitionError> {
        let mut detector = SyncDetector::new();
        loop {
            let byte = link.read_byte(ReadStage::Synchronization)?;
            log::trace!("Waiting for sync: {:#04x}", byte);
            if detector.push(byte) {
                return Ok(());
            }
            if !link.is_running() {
                return Err(AcquisitionError::Cancelled);
            }
        }
    }

    fn read_config<T: Read + Write>(
        link: &mut LinkReader<T>,
    ) -> Result<ChannelConfig, AcquisitionError> {
        let count = link.read_byte(ReadStage::ChannelCount)?;
        log::debug!("numChannels: {}", count);

        let mut widths = vec![0u8; usize::from(count)];
        link.read_exact(&mut widths, ReadStage::ChannelWidth)?;

        let mut channels = Vec::with_capacity(widths.len());
        for (i, &width) in widths.iter().enumerate() {
            let len = link.read_byte(ReadStage::TitleLength)?;
            let mut raw = vec![0u8; usize::from(len)];
            link.read_exact(&mut raw, ReadStage::Title)?;
            let title = String::from_utf8_lossy(&raw).into_owned();

            let width = SampleWidth::from(width);
            if !width.is_supported() {
                log::warn!("Channel {} ({}) has unsupported width {:?}", i, title, width);
            }
            log::debug!("channel[{}]: '{}' width {}", i, title, width.byte_len());
            channels.push(ChannelDescriptor { width, title });
        }

        Ok(ChannelConfig::new(channels))
    }
}

impl Default for ConfigProtocol {
    fn default() -> Self {
        Self::new()
    }
}

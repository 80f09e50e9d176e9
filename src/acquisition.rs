use crate::config_protocol::ChannelConfig;
use crate::transport::{AcquisitionError, LinkReader, ReadStage};
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

const IDLE_POLL: Duration = Duration::from_millis(10);

/// One decoded value and the channel it belongs to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample<'a> {
    pub channel: usize,
    pub title: &'a str,
    pub value: f32,
}

/// Why a session handed control back
#[derive(Debug)]
pub enum SessionEnd {
    /// The run flag was cleared
    Stopped,
    /// Transport or protocol failure
    Failed(AcquisitionError),
}

impl SessionEnd {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn error(&self) -> Option<&AcquisitionError> {
        match self {
            Self::Stopped => None,
            Self::Failed(e) => Some(e),
        }
    }
}

impl From<AcquisitionError> for SessionEnd {
    fn from(error: AcquisitionError) -> Self {
        if error.is_cancellation() {
            Self::Stopped
        } else {
            Self::Failed(error)
        }
    }
}

/// Continuous decode loop for one configuration
#[derive(Debug)]
pub struct AcquisitionSession {
    config: ChannelConfig,
    frames: u64,
    scratch: Vec<u8>,
}

impl AcquisitionSession {
    pub fn new(config: ChannelConfig) -> Self {
        let widest = config
            .channels()
            .iter()
            .map(|channel| channel.width.byte_len())
            .max()
            .unwrap_or(0);
        Self {
            config,
            frames: 0,
            scratch: vec![0; widest],
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Complete frames decoded so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Read one sample from every channel in configuration order and
    /// forward each as soon as it is decoded.
    pub fn read_frame<T, F>(
        &mut self,
        link: &mut LinkReader<T>,
        forward: &mut F,
    ) -> Result<(), AcquisitionError>
    where
        T: Read + Write,
        F: FnMut(Sample<'_>),
    {
        for (channel, descriptor) in self.config.channels().iter().enumerate() {
            let raw = &mut self.scratch[..descriptor.width.byte_len()];
            link.read_exact(raw, ReadStage::Sample)?;
            forward(Sample {
                channel,
                title: &descriptor.title,
                value: descriptor.width.decode(raw),
            });
        }
        self.frames += 1;
        mark_frame();
        Ok(())
    }

    /// Decode frames until the run flag clears or a read fails.
    ///
    /// Consumes the session: its configuration is gone once this returns.
    pub fn run<T, F>(mut self, link: &mut LinkReader<T>, mut forward: F) -> SessionEnd
    where
        T: Read + Write,
        F: FnMut(Sample<'_>),
    {
        log::info!(
            "Streaming {} channel(s), {} bytes per frame",
            self.config.len(),
            self.config.frame_len()
        );

        let end = loop {
            if !link.is_running() {
                break SessionEnd::Stopped;
            }
            if let Err(e) = self.read_frame(link, &mut forward) {
                break SessionEnd::from(e);
            }
            if self.config.is_empty() {
                // nothing to read, just wait to be stopped
                thread::sleep(IDLE_POLL);
            }
        };

        match end.error() {
            Some(e) => log::error!("Session ended after {} frames: {}", self.frames, e),
            None => log::info!("Session stopped after {} frames", self.frames),
        }
        end
    }
}

#[cfg(feature = "cpu-profiling")]
fn mark_frame() {
    if let Some(client) = tracy_client::Client::running() {
        client.frame_mark();
    }
}

#[cfg(not(feature = "cpu-profiling"))]
fn mark_frame() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_protocol::{ChannelDescriptor, ConfigProtocol};
    use crate::sample_decoder::SampleWidth;
    use crate::transport::testing::ScriptedLink;
    use crate::transport::RunFlag;

    fn two_channel_script() -> Vec<u8> {
        let mut script = vec![0x0D, 0xF0, 0xAD, 0xBA];
        script.extend_from_slice(&[2, 1, 2, 1, b'A', 1, b'B']);
        script
    }

    #[test]
    fn test_single_frame_is_forwarded_in_order() {
        let mut script = two_channel_script();
        script.extend_from_slice(&[0x80, 0x00, 0x80]);
        let mut link = LinkReader::new(ScriptedLink::new(script), RunFlag::new());

        let config = ConfigProtocol::new().negotiate(&mut link).unwrap();
        let mut received = Vec::new();
        let end = AcquisitionSession::new(config).run(&mut link, |sample| {
            received.push((sample.title.to_string(), sample.value));
        });

        assert_eq!(
            received,
            vec![("A".to_string(), 0.0), ("B".to_string(), 0.0)]
        );
        // the script runs dry right after the first frame
        assert!(matches!(
            end,
            SessionEnd::Failed(AcquisitionError::ShortRead {
                stage: ReadStage::Sample
            })
        ));
    }

    #[test]
    fn test_short_read_mid_frame_ends_session() {
        let mut script = two_channel_script();
        script.extend_from_slice(&[0x80, 0x00, 0x80, 0xFF, 0x00]);
        let mut link = LinkReader::new(ScriptedLink::new(script), RunFlag::new());

        let config = ConfigProtocol::new().negotiate(&mut link).unwrap();
        let mut session = AcquisitionSession::new(config);
        let mut titles = Vec::new();
        let mut forward = |sample: Sample<'_>| titles.push(sample.title.to_string());

        assert!(session.read_frame(&mut link, &mut forward).is_ok());
        assert!(session.read_frame(&mut link, &mut forward).is_err());
        assert_eq!(session.frames(), 1);
        // channel A of the second frame was already forwarded
        assert_eq!(titles, vec!["A", "B", "A"]);
    }

    #[test]
    fn test_cleared_flag_stops_session() {
        let run = RunFlag::new();
        let mut link = LinkReader::new(ScriptedLink::new(vec![0x80; 64]), run.clone());
        let config = ChannelConfig::new(vec![ChannelDescriptor {
            width: SampleWidth::One,
            title: "A".to_string(),
        }]);

        let mut count = 0;
        let end = AcquisitionSession::new(config).run(&mut link, |_| {
            count += 1;
            if count == 3 {
                run.request_stop();
            }
        });

        assert!(matches!(end, SessionEnd::Stopped));
        assert_eq!(count, 3);
    }

    #[test]
    fn test_unsupported_width_consumes_its_bytes() {
        let config = ChannelConfig::new(vec![
            ChannelDescriptor {
                width: SampleWidth::Unsupported(3),
                title: "odd".to_string(),
            },
            ChannelDescriptor {
                width: SampleWidth::One,
                title: "A".to_string(),
            },
        ]);
        let mut link = LinkReader::new(ScriptedLink::new([9, 9, 9, 0x00]), RunFlag::new());
        let mut session = AcquisitionSession::new(config);
        let mut values = Vec::new();

        session
            .read_frame(&mut link, &mut |sample: Sample<'_>| values.push(sample.value))
            .unwrap();
        assert_eq!(values, vec![0.0, -0.5]);
    }
}

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use nix::fcntl::OFlag;
#[cfg(unix)]
use nix::sys::termios::{self, SetArg};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// How long a read may block before the run flag is consulted again
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Stream ended early while reading {stage}")]
    ShortRead { stage: ReadStage },

    #[error("Acquisition was stopped")]
    Cancelled,

    #[error("Acquisition thread panicked")]
    ThreadPanicked,
}

impl AcquisitionError {
    /// Whether this error only reports that the run flag was cleared
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Which part of the wire protocol a read belonged to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStage {
    Synchronization,
    ChannelCount,
    ChannelWidth,
    TitleLength,
    Title,
    Sample,
}

impl ReadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStage::Synchronization => "synchronization marker",
            ReadStage::ChannelCount => "channel count",
            ReadStage::ChannelWidth => "channel width",
            ReadStage::TitleLength => "title length",
            ReadStage::Title => "channel title",
            ReadStage::Sample => "sample data",
        }
    }
}

impl fmt::Display for ReadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative stop signal shared between the consumer and the acquisition thread
#[derive(Debug, Clone)]
pub struct RunFlag {
    running: Arc<AtomicBool>,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.set_running(false);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// A raw byte stream to the device
pub trait Transport: Read + Write + Send {
    /// Put the line back the way it was before acquisition configured it.
    /// Called once by the acquisition thread right before the link is dropped.
    fn restore(&mut self) -> Result<(), AcquisitionError> {
        Ok(())
    }
}

/// Opens a fresh [`Transport`] for every acquisition session
pub trait Connect: Send {
    type Link: Transport + 'static;

    fn connect(&mut self) -> Result<Self::Link, AcquisitionError>;
}

impl<F, L> Connect for F
where
    F: FnMut() -> Result<L, AcquisitionError> + Send,
    L: Transport + 'static,
{
    type Link = L;

    fn connect(&mut self) -> Result<L, AcquisitionError> {
        self()
    }
}

/// Where and how to open the serial line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub path: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl LinkSettings {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

/// Terminal attributes the line had before acquisition opened it.
///
/// Captured through a separate descriptor before `serialport` switches the
/// line to raw 8N1, and written back through the same descriptor.
#[cfg(unix)]
struct SavedLine {
    tty: std::fs::File,
    attributes: termios::Termios,
}

#[cfg(unix)]
impl SavedLine {
    fn capture(path: &str) -> Result<Self, AcquisitionError> {
        let tty = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(path)?;
        let attributes = termios::tcgetattr(tty.as_raw_fd()).map_err(io::Error::from)?;
        Ok(Self { tty, attributes })
    }

    fn restore(&self) -> Result<(), AcquisitionError> {
        termios::tcsetattr(self.tty.as_raw_fd(), SetArg::TCSANOW, &self.attributes)
            .map_err(io::Error::from)?;
        Ok(())
    }
}

/// Terminal attributes cannot be saved on this platform; restoring is skipped
#[cfg(not(unix))]
struct SavedLine;

#[cfg(not(unix))]
impl SavedLine {
    fn capture(_path: &str) -> Result<Self, AcquisitionError> {
        Ok(Self)
    }

    fn restore(&self) -> Result<(), AcquisitionError> {
        log::warn!("Line settings are not restored on this platform");
        Ok(())
    }
}

/// Serial line to the acquisition device
pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
    saved: SavedLine,
}

impl SerialTransport {
    /// Save the line's current settings, then open it raw at 8N1 without
    /// flow control
    pub fn open(settings: &LinkSettings) -> Result<Self, AcquisitionError> {
        let saved = SavedLine::capture(&settings.path)?;

        log::debug!("Opening {} at {} baud", settings.path, settings.baud_rate);
        let serial = serialport::new(&settings.path, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout)
            .open()?;
        serial.clear(ClearBuffer::Input)?;

        Ok(Self { serial, saved })
    }

    pub fn name(&self) -> Option<String> {
        self.serial.name()
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.serial.name())
            .finish_non_exhaustive()
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.serial.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.serial.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.serial.flush()
    }
}

impl Transport for SerialTransport {
    fn restore(&mut self) -> Result<(), AcquisitionError> {
        log::debug!("Restoring line settings of {:?}", self.serial.name());
        self.saved.restore()
    }
}

/// Opens [`SerialTransport`]s from fixed [`LinkSettings`]
#[derive(Debug, Clone)]
pub struct SerialConnector {
    settings: LinkSettings,
}

impl SerialConnector {
    pub fn new(settings: LinkSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }
}

impl Connect for SerialConnector {
    type Link = SerialTransport;

    fn connect(&mut self) -> Result<SerialTransport, AcquisitionError> {
        SerialTransport::open(&self.settings)
    }
}

/// A serial port found on this machine
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub description: Option<String>,
}

/// List the serial ports the operating system reports
pub fn available_ports() -> Result<Vec<PortInfo>, AcquisitionError> {
    let ports = serialport::available_ports()?
        .into_iter()
        .map(|port| {
            let description = match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => usb
                    .product
                    .or(usb.manufacturer)
                    .or_else(|| Some(format!("{:04x}:{:04x}", usb.vid, usb.pid))),
                serialport::SerialPortType::BluetoothPort => Some("Bluetooth".to_string()),
                _ => None,
            };
            PortInfo {
                name: port.port_name,
                description,
            }
        })
        .collect();
    Ok(ports)
}

/// Blocking reads that give up as soon as the run flag is cleared.
///
/// The underlying transport is expected to time out periodically
/// (`io::ErrorKind::TimedOut` or `WouldBlock`); each timeout is a chance to
/// notice a stop request.
pub struct LinkReader<T> {
    link: T,
    run: RunFlag,
}

impl<T: Read + Write> LinkReader<T> {
    pub fn new(link: T, run: RunFlag) -> Self {
        Self { link, run }
    }

    pub fn is_running(&self) -> bool {
        self.run.is_running()
    }

    pub fn run_flag(&self) -> &RunFlag {
        &self.run
    }

    /// Fill `buf` completely or fail
    pub fn read_exact(&mut self, buf: &mut [u8], stage: ReadStage) -> Result<(), AcquisitionError> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.run.is_running() {
                return Err(AcquisitionError::Cancelled);
            }
            match self.link.read(&mut buf[filled..]) {
                Ok(0) => return Err(AcquisitionError::ShortRead { stage }),
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn read_byte(&mut self, stage: ReadStage) -> Result<u8, AcquisitionError> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte, stage)?;
        Ok(byte[0])
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), AcquisitionError> {
        self.link.write_all(bytes)?;
        self.link.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.link
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedLink;
    use super::*;

    #[test]
    fn test_link_settings_defaults() {
        let settings = LinkSettings::new("/dev/ttyUSB0");
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.read_timeout, Duration::from_millis(10));

        let settings = settings.with_baud_rate(9600);
        assert_eq!(settings.baud_rate, 9600);
    }

    #[test]
    fn test_read_exact_reports_short_read() {
        let mut reader = LinkReader::new(ScriptedLink::new([1, 2]), RunFlag::new());
        let mut buf = [0u8; 3];
        match reader.read_exact(&mut buf, ReadStage::Title) {
            Err(AcquisitionError::ShortRead { stage }) => assert_eq!(stage, ReadStage::Title),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_read_stops_when_flag_cleared() {
        let run = RunFlag::new();
        let mut reader = LinkReader::new(ScriptedLink::new([1, 2, 3]), run.clone());
        assert_eq!(reader.read_byte(ReadStage::Sample).ok(), Some(1));

        run.request_stop();
        assert!(matches!(
            reader.read_byte(ReadStage::Sample),
            Err(AcquisitionError::Cancelled)
        ));
    }

    #[test]
    fn test_write_all_reaches_link() {
        let mut reader = LinkReader::new(ScriptedLink::new(Vec::new()), RunFlag::new());
        reader.write_all(&[0xFF]).ok();
        assert_eq!(reader.into_inner().written, vec![0xFF]);
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_brings_back_settings_found_before_open() {
        use serialport::TTYPort;

        let (_master, mut slave) = TTYPort::pair().expect("Unable to create pseudo terminal");
        slave.set_baud_rate(9600).unwrap();
        let path = slave.name().expect("pseudo terminal has no path");

        let mut transport = SerialTransport::open(&LinkSettings::new(&path)).unwrap();
        assert_eq!(slave.baud_rate().unwrap(), 115_200);
        assert_eq!(slave.data_bits().unwrap(), DataBits::Eight);

        transport.restore().unwrap();
        drop(transport);
        assert_eq!(slave.baud_rate().unwrap(), 9600);
    }

    #[test]
    fn test_open_missing_port_fails() {
        let result = SerialTransport::open(&LinkSettings::new("/dev/does-not-exist-serialplot"));
        assert!(result.is_err());
    }

    #[test]
    fn test_available_ports() {
        // Depends on the machine; only check that whatever is found looks sane
        match available_ports() {
            Ok(ports) => {
                for port in ports {
                    assert!(!port.name.is_empty());
                }
            }
            Err(AcquisitionError::SerialPort(_)) => {
                // Expected where enumeration is not supported
            }
            Err(e) => {
                panic!("Unexpected error: {:?}", e);
            }
        }
    }
}

use std::time::Duration;

use crate::Error;

pub const DEFAULT_CHRDEV_NAME: &str = "xilinx_dma_bridge";

// The SG descriptor length field has 26 bits.
pub const DEFAULT_MAX_SEGMENT_LEN: usize = 0x3ff_ffff;
pub const DEFAULT_MAX_DESCRIPTORS: usize = 256;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Direction a buffer is mapped for, or a channel moves data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host memory to FPGA logic (MM2S).
    ToDevice,
    /// FPGA logic to host memory (S2MM).
    FromDevice,
    /// Only valid for buffers.
    Bidirectional,
}

impl Direction {
    /// Whether a buffer mapped for `self` may be used on a channel moving
    /// data in `channel` direction.
    pub fn allows(self, channel: Direction) -> bool {
        self == Direction::Bidirectional || self == channel
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Direction> {
        match raw {
            0 => Some(Direction::ToDevice),
            1 => Some(Direction::FromDevice),
            2 => Some(Direction::Bidirectional),
            _ => None,
        }
    }

    pub(crate) fn as_raw(self) -> u32 {
        match self {
            Direction::ToDevice => 0,
            Direction::FromDevice => 1,
            Direction::Bidirectional => 2,
        }
    }
}

/// Transfer mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Scatter-gather chain that runs once.
    OneShot,
    /// Descriptor ring that repeats until stopped, one frame per lap.
    Cyclic,
}

impl Mode {
    pub(crate) fn from_raw(raw: u32) -> Option<Mode> {
        match raw {
            0 => Some(Mode::OneShot),
            1 => Some(Mode::Cyclic),
            _ => None,
        }
    }
}

/// Xilinx IP a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    AxiDma,
    Vdma,
}

impl ChannelKind {
    pub(crate) fn as_raw(self) -> u32 {
        match self {
            ChannelKind::AxiDma => 0,
            ChannelKind::Vdma => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub id: u32,
    pub direction: Direction,
    pub kind: ChannelKind,
    /// Channel can cycle over a descriptor ring.
    pub cyclic: bool,
}

impl ChannelConfig {
    pub fn axi_dma(id: u32, direction: Direction) -> ChannelConfig {
        ChannelConfig {
            id,
            direction,
            kind: ChannelKind::AxiDma,
            cyclic: false,
        }
    }

    pub fn vdma(id: u32, direction: Direction) -> ChannelConfig {
        ChannelConfig {
            id,
            direction,
            kind: ChannelKind::Vdma,
            cyclic: true,
        }
    }

    pub fn supports(&self, mode: Mode) -> bool {
        match mode {
            Mode::OneShot => true,
            Mode::Cyclic => self.cyclic,
        }
    }
}

/// Device configuration, passed to [`DeviceContext::init`](crate::DeviceContext::init).
#[derive(Debug, Clone)]
pub struct Config {
    pub chrdev_name: String,
    pub minor: u32,
    pub num_devices: u32,
    pub channels: Vec<ChannelConfig>,
    pub max_segment_len: usize,
    pub max_descriptors: usize,
    pub default_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            chrdev_name: DEFAULT_CHRDEV_NAME.to_string(),
            minor: 0,
            num_devices: 1,
            channels: Vec::new(),
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Config {
    pub fn with_channel(mut self, channel: ChannelConfig) -> Config {
        self.channels.push(channel);
        self
    }

    pub fn with_max_segment_len(mut self, len: usize) -> Config {
        self.max_segment_len = len;
        self
    }

    pub fn with_max_descriptors(mut self, n: usize) -> Config {
        self.max_descriptors = n;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Config {
        self.default_timeout = timeout;
        self
    }

    /// Applies module-parameter style settings, e.g.
    /// `"CHARACTER_DEVICE_NAME=axidma MINOR_NUMBER=2"`.
    pub fn apply_params(&mut self, params: &str) -> Result<(), Error> {
        for param in params.split_whitespace() {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| Error::InvalidParam(param.to_string()))?;
            match key {
                "CHARACTER_DEVICE_NAME" => {
                    if value.is_empty() {
                        return Err(Error::InvalidParam(param.to_string()));
                    }
                    self.chrdev_name = value.to_string();
                }
                "MINOR_NUMBER" => self.minor = value.parse::<u32>()?,
                "MAX_SEGMENT_LEN" => self.max_segment_len = parse_size(value)?,
                "MAX_DESCRIPTORS" => self.max_descriptors = value.parse::<usize>()?,
                "TIMEOUT_MS" => {
                    self.default_timeout = Duration::from_millis(value.parse::<u64>()?)
                }
                _ => return Err(Error::InvalidParam(param.to_string())),
            }
        }
        Ok(())
    }

    /// Checks the configuration for inconsistencies.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_segment_len == 0 {
            return Err(Error::InvalidParam("MAX_SEGMENT_LEN must be > 0".into()));
        }
        if self.max_descriptors == 0 {
            return Err(Error::InvalidParam("MAX_DESCRIPTORS must be > 0".into()));
        }
        for (i, c) in self.channels.iter().enumerate() {
            if c.direction == Direction::Bidirectional {
                return Err(Error::InvalidParam(format!(
                    "channel {} cannot be bidirectional",
                    c.id
                )));
            }
            if self.channels[..i].iter().any(|o| o.id == c.id) {
                return Err(Error::InvalidParam(format!("duplicate channel id {}", c.id)));
            }
        }
        Ok(())
    }
}

// Sizes in sysfs and parameters come either as decimal or as 0x-prefixed hex.
pub(crate) fn parse_size(s: &str) -> Result<usize, Error> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(hex) => Ok(usize::from_str_radix(hex, 16)?),
        None => Ok(s.parse::<usize>()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_override_defaults() {
        let mut config = Config::default();
        config
            .apply_params("CHARACTER_DEVICE_NAME=axidma MINOR_NUMBER=3 MAX_SEGMENT_LEN=0x1000 TIMEOUT_MS=250")
            .unwrap();
        assert_eq!(config.chrdev_name, "axidma");
        assert_eq!(config.minor, 3);
        assert_eq!(config.max_segment_len, 0x1000);
        assert_eq!(config.default_timeout, Duration::from_millis(250));
    }

    #[test]
    fn unknown_param_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.apply_params("FOO=1"),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            config.apply_params("MINOR_NUMBER=x"),
            Err(Error::ParseInt(_))
        ));
        assert_eq!(config.minor, 0);
    }

    #[test]
    fn bidirectional_channel_is_invalid() {
        let config = Config::default().with_channel(ChannelConfig::axi_dma(0, Direction::Bidirectional));
        assert!(config.validate().is_err());
        let config = Config::default()
            .with_channel(ChannelConfig::axi_dma(0, Direction::ToDevice))
            .with_channel(ChannelConfig::vdma(0, Direction::FromDevice));
        assert!(config.validate().is_err());
    }

    #[test]
    fn buffer_directions() {
        assert!(Direction::Bidirectional.allows(Direction::FromDevice));
        assert!(Direction::ToDevice.allows(Direction::ToDevice));
        assert!(!Direction::ToDevice.allows(Direction::FromDevice));
    }
}

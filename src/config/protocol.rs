//! Per-protocol configuration.

use std::time::Duration;

use crate::error::Error;
use crate::protocols::h1::H1Limits;

/// HTTP/1.1 options.
#[derive(Debug, Clone)]
pub struct H1Config {
    pub limits: H1Limits,
    /// Accept bare-LF line endings on requests.
    pub lenient_lf: bool,
    /// How long a client waits on `Expect: 100-continue` before
    /// sending the body anyway.
    pub continue_timeout: Duration,
}

impl Default for H1Config {
    fn default() -> Self {
        H1Config {
            limits: H1Limits::default(),
            lenient_lf: false,
            continue_timeout: Duration::from_secs(1),
        }
    }
}

/// HTTP/2 options, advertised via SETTINGS.
#[derive(Debug, Clone)]
pub struct H2Config {
    pub header_table_size: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_concurrent_streams: u32,
    pub max_header_list_size: u32,
}

impl Default for H2Config {
    fn default() -> Self {
        H2Config {
            header_table_size: 4096,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_concurrent_streams: 100,
            max_header_list_size: 64 * 1024,
        }
    }
}

impl H2Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.initial_window_size > 0x7fff_ffff {
            return Err(Error::InvalidConfig("h2 initial_window_size above 2^31-1".into()));
        }
        if !(16_384..=16_777_215).contains(&self.max_frame_size) {
            return Err(Error::InvalidConfig(
                "h2 max_frame_size outside [16384, 16777215]".into(),
            ));
        }
        if self.max_concurrent_streams == 0 {
            return Err(Error::InvalidConfig("h2 max_concurrent_streams of zero".into()));
        }
        Ok(())
    }
}

/// HTTP/3 options, advertised via SETTINGS on the control stream.
#[derive(Debug, Clone)]
pub struct H3Config {
    pub qpack_max_table_capacity: u64,
    pub qpack_blocked_streams: u64,
    pub max_field_section_size: u64,
}

impl Default for H3Config {
    fn default() -> Self {
        H3Config {
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 16,
            max_field_section_size: 64 * 1024,
        }
    }
}

impl H3Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_field_section_size == 0 {
            return Err(Error::InvalidConfig("h3 max_field_section_size of zero".into()));
        }
        Ok(())
    }
}

use bytes::{BufMut, BytesMut};

use crate::frame::{Error, Frame, Head, Kind, StreamId};

const ACK: u8 = 0x1;

/// SETTINGS frame.
///
/// Unset parameters are simply absent from the encoded frame; the receiver
/// keeps its previous value for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    flags: SettingsFlag,
    header_table_size: Option<u32>,
    enable_push: Option<u32>,
    max_concurrent_streams: Option<u32>,
    initial_window_size: Option<u32>,
    max_frame_size: Option<u32>,
    max_header_list_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsFlag(u8);

/// The peer's settings, with every parameter resolved to a concrete value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingSet {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

pub const DEFAULT_SETTINGS_HEADER_TABLE_SIZE: u32 = 4_096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;

impl Default for SettingSet {
    fn default() -> SettingSet {
        SettingSet {
            header_table_size: DEFAULT_SETTINGS_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: u32::max_value(),
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::max_value(),
        }
    }
}

/// Why a SETTINGS frame could not be applied. An oversized
/// INITIAL_WINDOW_SIZE is a flow-control violation; everything else is a
/// plain protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    InvalidEnablePush,
    WindowSizeOverflow,
    InvalidMaxFrameSize,
}

impl SettingSet {
    /// Apply a received SETTINGS frame on top of the current values.
    pub fn apply(&mut self, frame: &Settings) -> Result<(), SettingsError> {
        if let Some(val) = frame.header_table_size {
            self.header_table_size = val;
        }
        if let Some(val) = frame.enable_push {
            match val {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return Err(SettingsError::InvalidEnablePush),
            }
        }
        if let Some(val) = frame.max_concurrent_streams {
            self.max_concurrent_streams = val;
        }
        if let Some(val) = frame.initial_window_size {
            if val > MAX_INITIAL_WINDOW_SIZE {
                return Err(SettingsError::WindowSizeOverflow);
            }
            self.initial_window_size = val;
        }
        if let Some(val) = frame.max_frame_size {
            if val < DEFAULT_MAX_FRAME_SIZE || val > MAX_MAX_FRAME_SIZE {
                return Err(SettingsError::InvalidMaxFrameSize);
            }
            self.max_frame_size = val;
        }
        if let Some(val) = frame.max_header_list_size {
            self.max_header_list_size = val;
        }
        Ok(())
    }
}

impl Settings {
    pub fn ack() -> Settings {
        Settings {
            flags: SettingsFlag(ACK),
            ..Settings::default()
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags.is_ack()
    }

    pub fn set_max_concurrent_streams(&mut self, val: Option<u32>) {
        self.max_concurrent_streams = val;
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Settings, Error> {
        debug_assert_eq!(head.kind(), Kind::Settings);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        if head.flag() & ACK != 0 {
            if !payload.is_empty() {
                return Err(Error::InvalidPayloadAckSettings);
            }
            return Ok(Settings::ack());
        }

        let mut settings = Settings::load_payload(payload)?;
        settings.flags = SettingsFlag(head.flag() & ACK);
        Ok(settings)
    }

    /// Parse a bare run of settings parameters; also used for the value of
    /// the `HTTP2-Settings` header during an h2c upgrade.
    pub fn load_payload(payload: &[u8]) -> Result<Settings, Error> {
        if payload.len() % 6 != 0 {
            return Err(Error::PartialSettingLength);
        }

        let mut settings = Settings::default();

        for raw in payload.chunks(6) {
            let id = ((raw[0] as u16) << 8) | raw[1] as u16;
            let val = unpack_octets_4!(raw, 2, u32);

            match id {
                1 => settings.header_table_size = Some(val),
                2 => settings.enable_push = Some(val),
                3 => settings.max_concurrent_streams = Some(val),
                4 => settings.initial_window_size = Some(val),
                5 => settings.max_frame_size = Some(val),
                6 => settings.max_header_list_size = Some(val),
                // Unknown identifiers must be ignored.
                _ => {}
            }
        }

        Ok(settings)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::Settings, self.flags.into(), StreamId::ZERO);
        let payload_len = self.payload_len();

        log::trace!("encoding SETTINGS; len={}", payload_len);

        head.encode(payload_len, dst);

        self.for_each(|id, val| {
            dst.put_u16(id);
            dst.put_u32(val);
        });
    }

    fn payload_len(&self) -> usize {
        let mut len = 0;
        self.for_each(|_, _| len += 6);
        len
    }

    fn for_each<F: FnMut(u16, u32)>(&self, mut f: F) {
        if let Some(v) = self.header_table_size {
            f(1, v);
        }
        if let Some(v) = self.enable_push {
            f(2, v);
        }
        if let Some(v) = self.max_concurrent_streams {
            f(3, v);
        }
        if let Some(v) = self.initial_window_size {
            f(4, v);
        }
        if let Some(v) = self.max_frame_size {
            f(5, v);
        }
        if let Some(v) = self.max_header_list_size {
            f(6, v);
        }
    }
}

impl From<Settings> for Frame {
    fn from(src: Settings) -> Frame {
        Frame::Settings(src)
    }
}

// ===== impl SettingsFlag =====

impl SettingsFlag {
    pub fn is_ack(&self) -> bool {
        self.0 & ACK == ACK
    }
}

impl From<SettingsFlag> for u8 {
    fn from(src: SettingsFlag) -> u8 {
        src.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_rejects_bad_enable_push() {
        let mut frame = Settings::default();
        frame.enable_push = Some(2);

        let mut set = SettingSet::default();
        assert!(set.apply(&frame).is_err());
    }

    #[test]
    fn apply_keeps_unset_parameters() {
        let mut frame = Settings::default();
        frame.initial_window_size = Some(16_384);

        let mut set = SettingSet::default();
        set.apply(&frame).unwrap();

        assert_eq!(set.initial_window_size, 16_384);
        assert_eq!(set.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(set.enable_push);
    }

    #[test]
    fn load_payload_ignores_unknown_identifiers() {
        let payload = [0, 9, 0, 0, 0, 1, 0, 3, 0, 0, 0, 8];
        let settings = Settings::load_payload(&payload).unwrap();
        assert_eq!(settings.max_concurrent_streams, Some(8));
    }

    #[test]
    fn ack_with_payload_is_invalid() {
        let head = Head::new(Kind::Settings, ACK, StreamId::ZERO);
        assert_eq!(
            Settings::load(head, &[0; 6]),
            Err(Error::InvalidPayloadAckSettings)
        );
    }
}

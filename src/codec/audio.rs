// src/codec/audio.rs - Audio codec capabilities

use bytes::Bytes;

/// FLV sound format ids.
pub const CODEC_ADPCM: u8 = 1;
pub const CODEC_MP3: u8 = 2;
pub const CODEC_NELLYMOSER: u8 = 6;
pub const CODEC_AAC: u8 = 10;
pub const CODEC_SPEEX: u8 = 11;

pub trait AudioCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn codec_id(&self) -> u8;

    fn can_handle_data(&self, data: &Bytes) -> bool {
        data.first().map(|b| b >> 4) == Some(self.codec_id())
    }

    fn add_data(&mut self, data: &Bytes) -> bool;

    fn decoder_configuration(&self) -> Option<Bytes> {
        None
    }

    fn reset(&mut self) {}
}

/// AAC: the AudioSpecificConfig packet is the decoder configuration.
#[derive(Default)]
pub struct AacAudio {
    decoder_configuration: Option<Bytes>,
}

impl AacAudio {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioCodec for AacAudio {
    fn name(&self) -> &'static str {
        "AAC"
    }

    fn codec_id(&self) -> u8 {
        CODEC_AAC
    }

    fn add_data(&mut self, data: &Bytes) -> bool {
        if !self.can_handle_data(data) {
            return false;
        }
        if data.get(1) == Some(&0) {
            self.decoder_configuration = Some(data.clone());
        }
        true
    }

    fn decoder_configuration(&self) -> Option<Bytes> {
        self.decoder_configuration.clone()
    }

    fn reset(&mut self) {
        self.decoder_configuration = None;
    }
}

/// Formats without out-of-band setup: MP3, Nellymoser, Speex, ADPCM.
pub struct PassthroughAudio {
    codec_id: u8,
}

impl PassthroughAudio {
    pub fn new(codec_id: u8) -> Self {
        Self { codec_id }
    }
}

impl AudioCodec for PassthroughAudio {
    fn name(&self) -> &'static str {
        match self.codec_id {
            CODEC_ADPCM => "ADPCM",
            CODEC_MP3 => "MP3",
            CODEC_NELLYMOSER => "Nellymoser",
            CODEC_SPEEX => "Speex",
            _ => "Audio",
        }
    }

    fn codec_id(&self) -> u8 {
        self.codec_id
    }

    fn add_data(&mut self, data: &Bytes) -> bool {
        self.can_handle_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aac_config() {
        let mut aac = AacAudio::new();
        assert!(aac.add_data(&Bytes::from_static(&[0xaf, 0x01, 0x21])));
        assert!(aac.decoder_configuration().is_none());
        assert!(aac.add_data(&Bytes::from_static(&[0xaf, 0x00, 0x12, 0x10])));
        assert_eq!(aac.decoder_configuration().unwrap().len(), 4);
        assert!(!aac.add_data(&Bytes::from_static(&[0x2f, 0x00])));
        aac.reset();
        assert!(aac.decoder_configuration().is_none());
    }

    #[test]
    fn test_passthrough() {
        let mut mp3 = PassthroughAudio::new(CODEC_MP3);
        assert_eq!(mp3.name(), "MP3");
        assert!(mp3.add_data(&Bytes::from_static(&[0x2f, 0xff])));
        assert!(!mp3.add_data(&Bytes::from_static(&[0xaf, 0x01])));
        assert!(mp3.decoder_configuration().is_none());
    }
}

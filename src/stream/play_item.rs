// src/stream/play_item.rs - Play items

/// Start value asking for live, then recorded, then waiting for a publisher.
pub const START_LIVE_OR_RECORDED: i64 = -2000;
/// Start value asking for live only.
pub const START_LIVE_ONLY: i64 = -1000;
/// Length value meaning "until the end".
pub const LENGTH_ALL: i64 = -1;

/// One entry of a playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayItem {
    pub name: String,
    /// Start in milliseconds; `-2000` and `-1000` select the live modes.
    pub start: i64,
    /// Length in milliseconds, `-1` for everything, `0` for a single frame.
    pub length: i64,
}

impl PlayItem {
    pub fn new(name: impl Into<String>, start: i64, length: i64) -> Self {
        Self {
            name: name.into(),
            start,
            length,
        }
    }

    /// Live first, then recorded, then wait.
    pub fn live(name: impl Into<String>) -> Self {
        Self::new(name, START_LIVE_OR_RECORDED, LENGTH_ALL)
    }

    /// Builds an item from the client's `play` arguments, start in seconds.
    pub fn from_client(name: impl Into<String>, start_seconds: f64, length_seconds: f64) -> Self {
        let start = if start_seconds <= -2.0 {
            START_LIVE_OR_RECORDED
        } else if start_seconds < 0.0 {
            START_LIVE_ONLY
        } else {
            (start_seconds * 1000.0) as i64
        };
        let length = if length_seconds < 0.0 {
            LENGTH_ALL
        } else {
            (length_seconds * 1000.0) as i64
        };
        Self::new(name, start, length)
    }

    /// `-2`, `-1`, or the start in whole seconds.
    pub fn play_type(&self) -> i64 {
        self.start / 1000
    }

    /// Start offset for recorded playback.
    pub fn start_position(&self) -> u32 {
        self.start.max(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_type() {
        assert_eq!(PlayItem::live("cam1").play_type(), -2);
        assert_eq!(PlayItem::new("cam1", START_LIVE_ONLY, -1).play_type(), -1);
        assert_eq!(PlayItem::new("vod", 0, -1).play_type(), 0);
        assert_eq!(PlayItem::new("vod", 5500, -1).play_type(), 5);
        assert_eq!(PlayItem::live("cam1").start_position(), 0);
    }

    #[test]
    fn test_from_client_arguments() {
        let item = PlayItem::from_client("cam1", -2.0, -1.0);
        assert_eq!(item.start, START_LIVE_OR_RECORDED);
        assert_eq!(item.length, LENGTH_ALL);
        let item = PlayItem::from_client("vod", 1.5, 0.0);
        assert_eq!(item.start, 1500);
        assert_eq!(item.length, 0);
        assert_eq!(PlayItem::from_client("x", -1.0, 2.0).start, START_LIVE_ONLY);
    }
}

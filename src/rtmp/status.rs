// src/rtmp/status.rs - NetConnection / NetStream status objects

use rml_rtmp::rml_amf0::Amf0Value;
use std::collections::HashMap;

pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
pub const NC_CONNECT_REJECTED: &str = "NetConnection.Connect.Rejected";
pub const NC_CONNECT_CLOSED: &str = "NetConnection.Connect.Closed";
pub const NC_CALL_FAILED: &str = "NetConnection.Call.Failed";

pub const NS_PLAY_START: &str = "NetStream.Play.Start";
pub const NS_PLAY_STOP: &str = "NetStream.Play.Stop";
pub const NS_PLAY_RESET: &str = "NetStream.Play.Reset";
pub const NS_PLAY_FAILED: &str = "NetStream.Play.Failed";
pub const NS_PLAY_STREAMNOTFOUND: &str = "NetStream.Play.StreamNotFound";
pub const NS_PLAY_INSUFFICIENT_BW: &str = "NetStream.Play.InsufficientBW";
pub const NS_PLAY_COMPLETE: &str = "NetStream.Play.Complete";
pub const NS_PLAY_SWITCH: &str = "NetStream.Play.Switch";
pub const NS_PLAY_PUBLISHNOTIFY: &str = "NetStream.Play.PublishNotify";
pub const NS_PLAY_UNPUBLISHNOTIFY: &str = "NetStream.Play.UnpublishNotify";
pub const NS_SEEK_NOTIFY: &str = "NetStream.Seek.Notify";
pub const NS_SEEK_FAILED: &str = "NetStream.Seek.Failed";
pub const NS_PAUSE_NOTIFY: &str = "NetStream.Pause.Notify";
pub const NS_UNPAUSE_NOTIFY: &str = "NetStream.Unpause.Notify";
pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NS_PUBLISH_BADNAME: &str = "NetStream.Publish.BadName";
pub const NS_UNPUBLISHED_SUCCESS: &str = "NetStream.Unpublish.Success";
pub const NS_RECORD_FAILED: &str = "NetStream.Record.Failed";

pub const SO_NO_READ_ACCESS: &str = "SharedObject.NoReadAccess";
pub const SO_NO_WRITE_ACCESS: &str = "SharedObject.NoWriteAccess";
pub const SO_CREATION_FAILED: &str = "SharedObject.ObjectCreationFailed";
pub const SO_PERSISTENCE_MISMATCH: &str = "SharedObject.BadPersistence";

pub const STATUS_LEVEL: &str = "status";
pub const ERROR_LEVEL: &str = "error";
pub const WARNING_LEVEL: &str = "warning";

#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub code: String,
    pub level: String,
    pub description: String,
    pub details: Option<String>,
    pub client_id: Option<u32>,
}

impl Status {
    /// Builds a status with the level implied by its code.
    pub fn new(code: &str) -> Self {
        let level = if code.ends_with(".Failed")
            || code.ends_with(".StreamNotFound")
            || code.ends_with(".Rejected")
            || code.ends_with(".BadName")
            || code.starts_with("SharedObject.")
        {
            ERROR_LEVEL
        } else if code == NS_PLAY_INSUFFICIENT_BW {
            WARNING_LEVEL
        } else {
            STATUS_LEVEL
        };
        Self {
            code: code.to_string(),
            level: level.to_string(),
            description: String::new(),
            details: None,
            client_id: None,
        }
    }

    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn set_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn set_client_id(mut self, client_id: u32) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Play.Complete and Play.Switch travel as `onPlayStatus` notifies.
    pub fn is_play_status(&self) -> bool {
        self.code == NS_PLAY_COMPLETE || self.code == NS_PLAY_SWITCH
    }

    pub fn to_amf0(&self) -> Amf0Value {
        let mut properties = HashMap::new();
        properties.insert("code".to_string(), Amf0Value::Utf8String(self.code.clone()));
        properties.insert("level".to_string(), Amf0Value::Utf8String(self.level.clone()));
        properties.insert(
            "description".to_string(),
            Amf0Value::Utf8String(self.description.clone()),
        );
        if let Some(details) = &self.details {
            properties.insert("details".to_string(), Amf0Value::Utf8String(details.clone()));
        }
        if let Some(client_id) = self.client_id {
            properties.insert("clientid".to_string(), Amf0Value::Number(client_id as f64));
        }
        Amf0Value::Object(properties)
    }

    /// Reads the `code` back out of a status object.
    pub fn code_of(value: &Amf0Value) -> Option<&str> {
        match value {
            Amf0Value::Object(properties) => match properties.get("code") {
                Some(Amf0Value::Utf8String(code)) => Some(code.as_str()),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_follow_code() {
        assert_eq!(Status::new(NS_PLAY_START).level, STATUS_LEVEL);
        assert_eq!(Status::new(NS_PLAY_STREAMNOTFOUND).level, ERROR_LEVEL);
        assert_eq!(Status::new(NS_RECORD_FAILED).level, ERROR_LEVEL);
        assert_eq!(Status::new(NS_PLAY_INSUFFICIENT_BW).level, WARNING_LEVEL);
    }

    #[test]
    fn test_to_amf0() {
        let status = Status::new(NS_PLAY_RESET)
            .set_description("Playing and resetting cam1.")
            .set_details("cam1")
            .set_client_id(3);
        let value = status.to_amf0();
        assert_eq!(Status::code_of(&value), Some(NS_PLAY_RESET));
        match value {
            Amf0Value::Object(properties) => {
                assert_eq!(properties.get("details"), Some(&Amf0Value::Utf8String("cam1".into())));
                assert_eq!(properties.get("clientid"), Some(&Amf0Value::Number(3.0)));
            }
            _ => panic!("status must be an object"),
        }
        assert!(Status::new(NS_PLAY_COMPLETE).is_play_status());
        assert!(!status.is_play_status());
    }
}

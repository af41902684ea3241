// src/application.rs - Application hooks around the connection lifecycle

use crate::error::{Error, Result};
use crate::rtmp::connection::RtmpConnection;
use log::debug;
use rml_rtmp::rml_amf0::Amf0Value;
use std::collections::HashMap;

/// Connect parameters sent by the client (`app`, `tcUrl`, `flashVer`, ...).
pub type ConnectParams = HashMap<String, Amf0Value>;

/// Server side application logic.
///
/// Connections call into it with themselves as an explicit argument, there
/// is no ambient "current connection".
pub trait Application: Send + Sync {
    /// Decides whether a client may join `scope`.
    ///
    /// # Returns
    /// `Err(Error::ClientRejected)` to refuse the client.
    fn app_connect(
        &self,
        connection: &RtmpConnection,
        scope: &str,
        params: &ConnectParams,
    ) -> Result<()> {
        let _ = (connection, scope, params);
        Ok(())
    }

    fn app_disconnect(&self, connection: &RtmpConnection) {
        let _ = connection;
    }
}

/// Accepts every client, optionally limited to a set of scope names.
#[derive(Debug, Default, Clone)]
pub struct DefaultApplication {
    scopes: Option<Vec<String>>,
}

impl DefaultApplication {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only clients connecting to one of `scopes` are accepted.
    pub fn set_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = Some(scopes);
        self
    }
}

impl Application for DefaultApplication {
    fn app_connect(
        &self,
        connection: &RtmpConnection,
        scope: &str,
        _params: &ConnectParams,
    ) -> Result<()> {
        match &self.scopes {
            Some(scopes) if !scopes.iter().any(|s| s == scope) => {
                debug!("{} asked for unknown scope {scope}", connection.session_id());
                Err(Error::ClientRejected(format!("Unknown scope: {scope}")))
            }
            _ => Ok(()),
        }
    }
}

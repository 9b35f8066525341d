//! Server coordinates and per-connection tuning.
use crate::{Error, Result, DEFAULT_PORT};
use std::str::FromStr;
use std::time::Duration;

/// Where and how to connect: host, port, optional password, database index,
/// and the optional inactivity-probe knobs.
///
/// Parsed from a URI of shape `redis://[:password@]host[:port][/db]`; the
/// port defaults to 6379 and the database index to 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    password: Option<String>,
    db: u32,
    inactivity_trigger: Option<Duration>,
    inactivity_response: Option<Duration>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            db: 0,
            inactivity_trigger: None,
            inactivity_response: None,
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        let invalid = || Error::InvalidUri(uri.to_string());

        let rest = uri.strip_prefix("redis://").ok_or_else(invalid)?;

        let (userinfo, rest) = match rest.split_once('@') {
            Some((userinfo, rest)) => (Some(userinfo), rest),
            None => (None, rest),
        };
        // Only the password half of the userinfo is meaningful.
        let password = match userinfo {
            Some(userinfo) => {
                let password = match userinfo.split_once(':') {
                    Some((_user, password)) => password,
                    None => userinfo,
                };
                if password.is_empty() {
                    return Err(invalid());
                }
                Some(password.to_string())
            }
            None => None,
        };

        let (hostport, path) = match rest.split_once('/') {
            Some((hostport, path)) => (hostport, Some(path)),
            None => (rest, None),
        };

        let (host, port) = match hostport.split_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (hostport, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        // An empty or absent path means database 0.
        let db = match path {
            None | Some("") => 0,
            Some(path) => path.parse::<u32>().map_err(|_| invalid())?,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            password,
            db,
            inactivity_trigger: None,
            inactivity_response: None,
        })
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    /// Enables the inactivity probe: after `trigger` of silence a probe
    /// command is issued, and after `trigger + response` of total silence the
    /// connection is torn down.
    pub fn with_inactivity(mut self, trigger: Duration, response: Duration) -> Self {
        self.inactivity_trigger = Some(trigger);
        self.inactivity_response = Some(response);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn db(&self) -> u32 {
        self.db
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn inactivity(&self) -> Option<(Duration, Duration)> {
        match (self.inactivity_trigger, self.inactivity_response) {
            (Some(trigger), Some(response)) => Some((trigger, response)),
            _ => None,
        }
    }

    pub(crate) fn set_password(&mut self, password: impl Into<String>) {
        self.password = Some(password.into());
    }

    pub(crate) fn set_db(&mut self, db: u32) {
        self.db = db;
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::from_uri(s)
    }
}

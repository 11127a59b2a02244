//! Relay connection strings.
//!
//! Format: `Endpoint=sb://ns.example.net/;EntityPath=name;SharedAccessKeyName=k;SharedAccessKey=s`.
//! Keys are case-insensitive and `Entity` is accepted for `EntityPath`.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    endpoint: Url,
    entity: String,
    shared_access_key_name: Option<String>,
    shared_access_key: Option<String>,
    shared_access_signature: Option<String>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut entity = None;
        let mut key_name = None;
        let mut key = None;
        let mut signature = None;

        for part in input.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                Error::connection_string(format!("expected Key=Value, got {:?}", part))
            })?;
            let value = value.trim().to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value),
                "entitypath" | "entity" => entity = Some(value),
                "sharedaccesskeyname" => key_name = Some(value),
                "sharedaccesskey" => key = Some(value),
                "sharedaccesssignature" => signature = Some(value),
                other => {
                    return Err(Error::connection_string(format!(
                        "unknown key {:?}",
                        other
                    )))
                }
            }
        }

        let endpoint = endpoint.ok_or_else(|| Error::connection_string("missing Endpoint"))?;
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| Error::connection_string(format!("invalid Endpoint {:?}: {}", endpoint, e)))?;
        if endpoint.host_str().is_none() {
            return Err(Error::connection_string("Endpoint has no host"));
        }

        let entity = match entity {
            Some(entity) => entity,
            None => endpoint
                .path_segments()
                .and_then(|mut segments| segments.find(|s| !s.is_empty()))
                .map(str::to_string)
                .ok_or_else(|| Error::connection_string("missing EntityPath"))?,
        };
        let entity = entity.trim_matches('/').to_string();
        if entity.is_empty() {
            return Err(Error::connection_string("EntityPath is empty"));
        }

        if key_name.is_some() != key.is_some() {
            return Err(Error::connection_string(
                "SharedAccessKeyName and SharedAccessKey must be given together",
            ));
        }

        Ok(Self {
            endpoint,
            entity,
            shared_access_key_name: key_name,
            shared_access_key: key,
            shared_access_signature: signature,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Host part of the endpoint, i.e. the relay namespace.
    pub fn namespace(&self) -> &str {
        self.endpoint.host_str().unwrap_or_default()
    }

    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.shared_access_key_name.as_deref()
    }

    pub fn shared_access_key(&self) -> Option<&str> {
        self.shared_access_key.as_deref()
    }

    pub fn shared_access_signature(&self) -> Option<&str> {
        self.shared_access_signature.as_deref()
    }

    /// Base address of the channel: `scheme://host[:port]/entity/`.
    pub fn address(&self) -> Url {
        let mut address = self.endpoint.clone();
        address.set_path(&format!("/{}/", self.entity));
        address.set_query(None);
        address.set_fragment(None);
        address
    }

    /// Address shown to callers; `sb` endpoints are reached over https.
    pub fn public_url(&self) -> Url {
        let address = self.address();
        if address.scheme() != "sb" {
            return address;
        }
        let rewritten = format!("https{}", &address.as_str()["sb".len()..]);
        Url::parse(&rewritten).unwrap_or(address)
    }
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint={};EntityPath={}", self.endpoint, self.entity)?;
        if let Some(name) = &self.shared_access_key_name {
            write!(f, ";SharedAccessKeyName={};SharedAccessKey=***", name)?;
        }
        if self.shared_access_signature.is_some() {
            write!(f, ";SharedAccessSignature=***")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionString({})", self)
    }
}

use arbor_value::Value;
use serde::{Deserialize, Serialize};

use crate::codes;

/// Optional credentials attached to a request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub user: String,
    pub passwd: String,
}

/// The logical message every transport carries.
///
/// Absent optional fields are skipped on encode rather than written as null,
/// so the same struct round-trips byte-for-byte through map-shaped codecs
/// (JSON, named MessagePack).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Request code or response code, see [`codes`].
    pub code: u16,
    /// Correlation id linking a response to its request.
    pub cid: u32,
    /// Target address for requests, source address context for events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adr: Option<String>,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Redirects the response to a different endpoint than the request origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
}

impl Message {
    /// A code-10 request for `adr` with an optional payload.
    pub fn request(cid: u32, adr: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code: codes::REQUEST,
            cid,
            adr: Some(adr.into()),
            data,
            ..Self::default()
        }
    }

    /// A code-80 fire-and-forget event sourced from `adr`.
    pub fn event(adr: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code: codes::EVENT,
            cid: 0,
            adr: Some(adr.into()),
            data,
            ..Self::default()
        }
    }

    /// A response correlated to `cid`.
    pub fn response(cid: u32, code: u16, data: Option<Value>) -> Self {
        Self {
            code,
            cid,
            data,
            ..Self::default()
        }
    }

    /// An empty-payload error response.
    pub fn error_response(cid: u32, code: u16) -> Self {
        Self::response(cid, code, None)
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// `true` when `code` is from the request-code set.
    pub fn is_request(&self) -> bool {
        codes::is_request(self.code)
    }

    /// `true` when `code` is an error response code.
    pub fn is_error(&self) -> bool {
        codes::is_error(self.code)
    }
}

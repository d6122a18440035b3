//! JSON control frames exchanged over the terminal websocket.
//!
//! Raw terminal bytes travel as binary websocket messages in both directions.
//! Everything else is a text message holding one of the frames below,
//! discriminated by its `type` field.
//!
//! An `upload` frame either carries the file inline as `payload_b64`, or omits
//! it, in which case the next binary message is the raw file body. Only the
//! binary form can use the full message size limit for file content.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Keyboard input sent as text instead of a binary message.
    Data { data: String },
    Resize { cols: u16, rows: u16 },
    Upload {
        id: String,
        name: String,
        #[serde(default)]
        payload_b64: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    NotReady,
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
    },
    UploadAck {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerFrame {
    pub fn upload_result(id: String, res: &cloudshell_core::Result<()>) -> Self {
        match res {
            Ok(()) => Self::UploadAck {
                id,
                ok: true,
                code: None,
                error: None,
            },
            Err(err) => Self::UploadAck {
                id,
                ok: false,
                code: Some(err.code()),
                error: Some(err.to_string()),
            },
        }
    }
}

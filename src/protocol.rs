//! JSON frames exchanged with the server.
//!
//! Every websocket frame carries a `kind` tag. [`ServerFrame`] covers the
//! frames the server pushes, [`ClientFrame`] the frames this client sends.
//! The HTTP side of the protocol uses [`Bootstrap`] (response to the page
//! `POST`) and [`CallResponse`] (response to a binding `PATCH`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::binding::{BindingTable, Tie};
use crate::error::ProtocolError;
use crate::requirements::{Package, Requirement};
use crate::storage::StorageArea;
use crate::store::Aspects;

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Merge `payload` into one store (`identity`) or every store whose
    /// identity matches `regex`.
    SetAspect {
        /// Exact target identity.
        #[serde(default)]
        identity: Option<String>,
        /// Identity pattern, used when `identity` is absent.
        #[serde(default)]
        regex: Option<String>,
        /// Aspects to merge.
        #[serde(default)]
        payload: Aspects,
    },
    /// Ask for the current value of one aspect.
    GetAspect {
        /// Component identity.
        identity: String,
        /// Aspect name.
        aspect: String,
        /// Echoed back in the reply.
        #[serde(default)]
        request_id: Value,
    },
    /// Store `payload` (as JSON text) under `identity`.
    SetStorage {
        /// Storage key.
        identity: String,
        /// Value to stringify and store.
        #[serde(default)]
        payload: Value,
        /// Target area.
        storage: StorageArea,
    },
    /// Ask for a stored value.
    GetStorage {
        /// Storage key.
        identity: String,
        /// Area to read from.
        storage: StorageArea,
        /// Echoed back in the reply.
        #[serde(default)]
        request_id: Value,
    },
    /// Assets or code changed on the server.
    Reload {
        /// Changed asset file names.
        #[serde(default)]
        filenames: Vec<String>,
        /// Deleted asset file names.
        #[serde(default)]
        deleted: Vec<String>,
        /// Code changed: remount the whole tree.
        #[serde(default)]
        hot: bool,
        /// A full document reload is required.
        #[serde(default)]
        refresh: bool,
    },
    /// Liveness probe; no reply.
    Ping {},
}

impl ServerFrame {
    /// Every `kind` this client understands.
    pub const KINDS: &'static [&'static str] = &[
        "set-aspect",
        "get-aspect",
        "set-storage",
        "get-storage",
        "reload",
        "ping",
    ];

    /// Parse one websocket text frame.
    ///
    /// # Errors
    ///
    /// * [`ProtocolError::Malformed`] -- not JSON, or fields don't fit the kind.
    /// * [`ProtocolError::MissingKind`] -- no string `kind` field.
    /// * [`ProtocolError::UnknownKind`] -- a kind not in [`KINDS`](Self::KINDS).
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingKind)?;
        if !Self::KINDS.contains(&kind) {
            return Err(ProtocolError::UnknownKind(kind.to_owned()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// An aspect address together with its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectValue {
    /// Component identity.
    pub identity: String,
    /// Aspect name.
    pub aspect: String,
    /// Current value (`null` when unknown).
    pub value: Value,
}

impl AspectValue {
    /// Bundle an address and a value.
    pub fn new(identity: impl Into<String>, aspect: impl Into<String>, value: Value) -> Self {
        Self {
            identity: identity.into(),
            aspect: aspect.into(),
            value,
        }
    }
}

/// Body of an outgoing `binding` frame or binding `PATCH` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingMessage {
    /// The aspect that fired, with its new value.
    pub trigger: AspectValue,
    /// Collected state values.
    pub states: Vec<AspectValue>,
    /// Page name from the bootstrap.
    pub page: String,
    /// The binding's server-side key.
    pub key: String,
}

/// Frames sent by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// A binding fired.
    Binding(BindingMessage),
    /// Reply to [`ServerFrame::GetAspect`].
    GetAspect {
        /// Echo of the request's id.
        request_id: Value,
        /// Requested identity.
        identity: String,
        /// Requested aspect.
        aspect: String,
        /// The value, when found.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// `"Aspect not found"` when the identity or aspect does not exist.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Reply to [`ServerFrame::GetStorage`].
    GetStorage {
        /// Echo of the request's id.
        request_id: Value,
        /// Requested key.
        identity: String,
        /// Parsed stored value, `null` when absent.
        value: Value,
    },
}

impl ClientFrame {
    /// Serialize to websocket text.
    pub fn to_text(&self) -> String {
        // Serializing these shapes cannot fail: all keys are strings.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Response to the bootstrap `POST`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    /// Page name used in binding frames and the socket path.
    #[serde(default)]
    pub page: String,
    /// Dry component tree.
    #[serde(default)]
    pub layout: Value,
    /// Server round-trip rules.
    #[serde(default)]
    pub bindings: BindingTable,
    /// Client-only rules.
    #[serde(default)]
    pub ties: Vec<Tie>,
    /// Packages whose requirements load first.
    #[serde(default)]
    pub packages: BTreeMap<String, Package>,
    /// Page-level requirements, loaded in order after all packages.
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    /// The server watches for reloads; a socket is needed even without
    /// websocket bindings.
    #[serde(default)]
    pub reload: bool,
}

/// Response to a binding `PATCH`: per-identity aspect patches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    /// Identity to aspects to merge.
    #[serde(default)]
    pub output: BTreeMap<String, Aspects>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_set_aspect_by_identity() {
        let frame =
            ServerFrame::parse(r#"{"kind":"set-aspect","identity":"t","payload":{"text":"hi"}}"#)
                .unwrap();
        let ServerFrame::SetAspect {
            identity,
            regex,
            payload,
        } = frame
        else {
            panic!("wrong variant");
        };
        assert_eq!(identity.as_deref(), Some("t"));
        assert!(regex.is_none());
        assert_eq!(payload.get("text"), Some(&json!("hi")));
    }

    #[test]
    fn parse_reload_defaults_flags() {
        let frame = ServerFrame::parse(r#"{"kind":"reload","filenames":["a.css"]}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Reload {
                filenames: vec!["a.css".into()],
                deleted: vec![],
                hot: false,
                refresh: false,
            }
        );
    }

    #[test]
    fn parse_ping_ignores_extra_fields() {
        let frame = ServerFrame::parse(r#"{"kind":"ping","ts":1}"#).unwrap();
        assert_eq!(frame, ServerFrame::Ping {});
    }

    #[test]
    fn parse_rejects_unknown_and_missing_kind() {
        assert!(matches!(
            ServerFrame::parse(r#"{"kind":"teleport"}"#),
            Err(ProtocolError::UnknownKind(kind)) if kind == "teleport"
        ));
        assert!(matches!(
            ServerFrame::parse(r#"{"identity":"x"}"#),
            Err(ProtocolError::MissingKind)
        ));
        assert!(matches!(
            ServerFrame::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ServerFrame::parse(r#"{"kind":"get-aspect"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn binding_frame_wire_shape() {
        let frame = ClientFrame::Binding(BindingMessage {
            trigger: AspectValue::new("btn", "clicks", json!(1)),
            states: vec![AspectValue::new("input", "value", json!("x"))],
            page: "home".into(),
            key: "submit".into(),
        });
        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "binding",
                "trigger": {"identity": "btn", "aspect": "clicks", "value": 1},
                "states": [{"identity": "input", "aspect": "value", "value": "x"}],
                "page": "home",
                "key": "submit"
            })
        );
    }

    #[test]
    fn get_aspect_error_reply_omits_value() {
        let frame = ClientFrame::GetAspect {
            request_id: json!(7),
            identity: "gone".into(),
            aspect: "text".into(),
            value: None,
            error: Some("Aspect not found".into()),
        };
        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "get-aspect",
                "request_id": 7,
                "identity": "gone",
                "aspect": "text",
                "error": "Aspect not found"
            })
        );
    }

    #[test]
    fn bootstrap_tolerates_missing_sections() {
        let boot: Bootstrap = serde_json::from_value(json!({
            "page": "home",
            "layout": {"identity": "root", "package_name": "p", "component_name": "C"},
            "packages": {"p": {"requirements": [{"url": "/p.js", "kind": "js"}]}}
        }))
        .unwrap();
        assert_eq!(boot.page, "home");
        assert!(boot.bindings.into_bindings().is_empty());
        assert_eq!(boot.packages["p"].requirements.len(), 1);
        assert!(!boot.reload);
    }

    #[test]
    fn call_response_output_by_identity() {
        let response: CallResponse =
            serde_json::from_value(json!({"output": {"label": {"text": "done"}}})).unwrap();
        assert_eq!(response.output["label"].get("text"), Some(&json!("done")));
    }
}

//! Control protocol types.
//!
//! Newline-delimited JSON: one request object per line, one response object
//! per line. Requests are tagged by `op`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::ApplicationDecl;

/// One inbound control operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ControlRequest {
    #[serde(rename_all = "camelCase")]
    AddRepository {
        name: String,
        url: String,
        #[serde(default)]
        private_key_secret: String,
        #[serde(default)]
        insecure_ignore_host_key: bool,
    },
    DeleteRepository {
        name: String,
    },
    AddOrUpdateApplication {
        #[serde(flatten)]
        decl: ApplicationDecl,
    },
    DeleteApplication {
        name: String,
        url: String,
    },
    ListApplications,
    GetApplicationRevisions {
        name: String,
        url: String,
    },
}

/// Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    /// Success without a payload.
    pub fn done() -> Self {
        Self {
            ok: true,
            data: None,
            error: None,
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// One row of `listApplications`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSummary {
    pub name: String,
    pub namespace: String,
    pub url: String,
    pub reference: String,
    pub revision: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_repository_round_trip() {
        let json = r#"{"op":"addRepository","name":"r","url":"ssh://git@h/r.git","privateKeySecret":"k","insecureIgnoreHostKey":true}"#;
        let request: ControlRequest = serde_json::from_str(json).unwrap();

        match &request {
            ControlRequest::AddRepository {
                name,
                url,
                private_key_secret,
                insecure_ignore_host_key,
            } => {
                assert_eq!(name, "r");
                assert_eq!(url, "ssh://git@h/r.git");
                assert_eq!(private_key_secret, "k");
                assert!(insecure_ignore_host_key);
            }
            other => panic!("unexpected request: {other:?}"),
        }

        let back = serde_json::to_string(&request).unwrap();
        assert!(back.contains("\"op\":\"addRepository\""));
    }

    #[test]
    fn application_decl_flattens_into_request() {
        let json = r#"{
            "op": "addOrUpdateApplication",
            "name": "a",
            "url": "ssh://git@h/r.git",
            "namespace": "ns",
            "reference": "main",
            "sparsePath": "deploy",
            "helm": {"atomic": true, "valuesFiles": ["values.yaml"]}
        }"#;
        let request: ControlRequest = serde_json::from_str(json).unwrap();

        match request {
            ControlRequest::AddOrUpdateApplication { decl } => {
                assert_eq!(decl.name, "a");
                assert_eq!(decl.sparse_path, "deploy");
                assert!(decl.helm.atomic);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn optional_fields_default() {
        let json = r#"{"op":"addRepository","name":"r","url":"https://h/r.git"}"#;
        let request: ControlRequest = serde_json::from_str(json).unwrap();

        match request {
            ControlRequest::AddRepository {
                private_key_secret,
                insecure_ignore_host_key,
                ..
            } => {
                assert!(private_key_secret.is_empty());
                assert!(!insecure_ignore_host_key);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn response_envelope_omits_empty_fields() {
        let ok = serde_json::to_string(&ControlResponse::done()).unwrap();
        assert_eq!(ok, r#"{"ok":true}"#);

        let err = serde_json::to_string(&ControlResponse::error("boom")).unwrap();
        assert_eq!(err, r#"{"ok":false,"error":"boom"}"#);
    }
}

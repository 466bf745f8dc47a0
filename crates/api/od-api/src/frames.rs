//! Wire frames: one request in, progress lines + one response out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use od_common::progress::ProgressUpdate;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRequest {
    pub auth: String,
    pub action: String,
    #[serde(default)]
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub id: String,
    pub result: bool,
    pub message: String,
}

impl ApiResponse {
    pub fn ok(id: &str, message: impl Into<String>) -> Self {
        Self { id: id.to_string(), result: true, message: message.into() }
    }

    pub fn fail(id: &str, message: impl Into<String>) -> Self {
        Self { id: id.to_string(), result: false, message: message.into() }
    }
}

/// Progress frames carry the request id plus the update fields and end
/// with `\r\n` so the CLI can stream them line by line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressFrame {
    pub id: String,
    #[serde(flatten)]
    pub update: ProgressUpdate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_with_and_without_data() {
        let req: ApiRequest =
            serde_json::from_str(r#"{"auth":"k","action":"app.list"}"#).unwrap();
        assert!(req.data.is_empty());

        let req: ApiRequest = serde_json::from_str(
            r#"{"auth":"k","action":"domain.add","data":["example.com","myapp"]}"#,
        )
        .unwrap();
        assert_eq!(req.data.len(), 2);
    }

    #[test]
    fn progress_frame_flattens_update() {
        let frame = ProgressFrame {
            id: "abc".into(),
            update: ProgressUpdate {
                process: "build".into(),
                status: od_common::progress::ProgressStatus::Progress,
                message: "compiling".into(),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"process\":\"build\""));
        assert!(json.contains("\"status\":\"progress\""));
        assert!(json.contains("\"id\":\"abc\""));
    }
}

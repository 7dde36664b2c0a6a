use serde::{Deserialize, Deserializer, Serialize};

/// Server-side exam identifier. Browsers send it as a number or a numeric
/// string; it goes back to the server as a number.
pub type ExamId = i64;

/// Accepts `42` or `"42"`.
pub fn deserialize_exam_id<'de, D>(deserializer: D) -> Result<ExamId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(id) => Ok(id),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Credentials for one logged-in exam: the cookie the server set at login,
/// replayed on later calls and on the hub handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSession {
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExamDetails {
    pub allow_books: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Proctor {
    #[serde(deserialize_with = "deserialize_viewer_id")]
    pub id: String,
}

fn deserialize_viewer_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(id) => Ok(id),
        serde_json::Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected proctor id {other}"))),
    }
}

/// Body of `SendEvent`. `type` 1 is a detection event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamEvent {
    pub exam_id: ExamId,
    #[serde(rename = "type")]
    pub kind: u8,
    pub receipt: Option<String>,
    pub message: String,
    pub attachment: Option<String>,
}

impl ExamEvent {
    pub const DETECTION: u8 = 1;

    pub fn detection(exam_id: ExamId, message: impl Into<String>, attachment: Option<String>) -> Self {
        Self {
            exam_id,
            kind: Self::DETECTION,
            receipt: None,
            message: message.into(),
            attachment,
        }
    }
}

/// Envelope shared by the server's JSON answers; `code == 0` is success.
#[derive(Debug, Deserialize)]
pub(crate) struct CodeResponse {
    pub code: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExamDetailsResponse {
    pub code: i64,
    #[serde(default)]
    pub body: Option<ExamDetailsBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExamDetailsBody {
    #[serde(default)]
    pub allow_book: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProctorsResponse {
    pub code: i64,
    #[serde(default)]
    pub proctors: Vec<Proctor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResponse {
    pub file_name: Option<String>,
}

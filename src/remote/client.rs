use async_trait::async_trait;
use reqwest::{
    header::{COOKIE, SET_COOKIE},
    multipart::{Form, Part},
    RequestBuilder, Response,
};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::settings::ServerSettings;

use super::types::{
    AuthSession, CodeResponse, ExamDetails, ExamDetailsResponse, ExamEvent, ExamId, Proctor,
    ProctorsResponse, UploadResponse,
};

/// The remote proctoring server, as seen by an exam session.
#[async_trait]
pub trait ProctorServer: Send + Sync {
    /// Exchanges the one-time token from the taker's browser for a session.
    async fn login(&self, token: &str) -> Result<AuthSession>;

    async fn exam_details(&self, auth: &AuthSession, exam_id: ExamId) -> Result<ExamDetails>;

    async fn proctors(&self, auth: &AuthSession, exam_id: ExamId) -> Result<Vec<Proctor>>;

    /// Uploads an evidence image and returns the server's file name for it.
    async fn upload_attachment(&self, auth: &AuthSession, jpeg: Vec<u8>) -> Result<String>;

    async fn send_event(&self, auth: &AuthSession, event: &ExamEvent) -> Result<()>;
}

/// HTTP client for the proctoring server's REST API.
pub struct ServerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ServerClient {
    pub fn new(settings: &ServerSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder, auth: &AuthSession) -> RequestBuilder {
        match &auth.cookie {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }

    async fn send(&self, call: &'static str, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|err| Error::remote(call, err.to_string()))?;
        response
            .error_for_status()
            .map_err(|err| Error::remote(call, err.to_string()))
    }

    async fn json<T: DeserializeOwned>(call: &'static str, response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|err| Error::remote(call, format!("unreadable response: {err}")))
    }
}

fn ensure_ok(call: &'static str, code: i64) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(Error::remote(call, format!("server returned code {code}")))
    }
}

/// Folds every `Set-Cookie` into a single `Cookie` header value, keeping
/// only the `name=value` pairs.
pub fn cookie_header<'a>(set_cookies: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let pairs: Vec<&str> = set_cookies
        .into_iter()
        .filter_map(|cookie| cookie.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect();

    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

#[async_trait]
impl ProctorServer for ServerClient {
    async fn login(&self, token: &str) -> Result<AuthSession> {
        const CALL: &str = "login";
        let request = self.client.get(self.url(&format!("/api/user/DeepLensLogin/{token}")));
        let response = self.send(CALL, request).await?;

        let cookie = cookie_header(
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        );
        let body: CodeResponse = Self::json(CALL, response).await?;
        ensure_ok(CALL, body.code)?;

        Ok(AuthSession { cookie })
    }

    async fn exam_details(&self, auth: &AuthSession, exam_id: ExamId) -> Result<ExamDetails> {
        const CALL: &str = "exam details";
        let request = self.authed(
            self.client.get(self.url(&format!("/api/exam/GetExamDetails/{exam_id}"))),
            auth,
        );
        let body: ExamDetailsResponse = Self::json(CALL, self.send(CALL, request).await?).await?;
        ensure_ok(CALL, body.code)?;

        Ok(ExamDetails {
            allow_books: body.body.map(|b| b.allow_book).unwrap_or(false),
        })
    }

    async fn proctors(&self, auth: &AuthSession, exam_id: ExamId) -> Result<Vec<Proctor>> {
        const CALL: &str = "proctor roster";
        let request = self.authed(
            self.client.get(self.url(&format!("/api/exam/GetProctors/{exam_id}"))),
            auth,
        );
        let body: ProctorsResponse = Self::json(CALL, self.send(CALL, request).await?).await?;
        ensure_ok(CALL, body.code)?;
        Ok(body.proctors)
    }

    async fn upload_attachment(&self, auth: &AuthSession, jpeg: Vec<u8>) -> Result<String> {
        const CALL: &str = "upload attachment";
        let part = Part::bytes(jpeg)
            .file_name("detection.jpg")
            .mime_str("image/jpeg")
            .map_err(|err| Error::remote(CALL, err.to_string()))?;
        let form = Form::new().part("file", part);

        let request = self.authed(
            self.client
                .post(self.url("/api/exam/UploadEventAttachment"))
                .multipart(form),
            auth,
        );
        let body: UploadResponse = Self::json(CALL, self.send(CALL, request).await?).await?;
        body.file_name
            .ok_or_else(|| Error::remote(CALL, "response carried no fileName"))
    }

    async fn send_event(&self, auth: &AuthSession, event: &ExamEvent) -> Result<()> {
        const CALL: &str = "send event";
        let request = self.authed(
            self.client.post(self.url("/api/exam/SendEvent")).json(event),
            auth,
        );
        self.send(CALL, request).await?;
        Ok(())
    }
}

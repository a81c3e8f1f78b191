//! HTTP seam between the dispatcher and the network.

use super::request::FileUpload;
use crate::error::{Error, TimeoutKind};
use bytes::Bytes;
use http::{HeaderMap, Method};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::future::Future;

/// Request body as handed to a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpBody {
    /// No body
    Empty,
    /// Serialized JSON
    Json(String),
    /// Multipart form: optional `payload_json` part plus `files[n]` parts
    Multipart {
        payload_json: Option<String>,
        files: Vec<FileUpload>,
    },
}

/// A fully built request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: HttpBody,
}

/// A received response with the body read in full.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Header value as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the body is JSON per `content-type`.
    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.starts_with("application/json"))
    }
}

/// Sends one HTTP request.
///
/// Implementations do not retry or rate limit; the dispatcher does both.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(&self, request: HttpRequest) -> impl Future<Output = Result<HttpResponse, Error>> + Send;
}

/// [`HttpTransport`] over a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a transport with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the HTTP client cannot be created.
    pub fn new() -> Result<Self, Error> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn form(payload_json: Option<String>, files: Vec<FileUpload>) -> Result<Form, Error> {
        let mut form = Form::new();
        for (index, file) in files.into_iter().enumerate() {
            let mut part = Part::bytes(file.data.to_vec()).file_name(file.filename);
            if let Some(content_type) = &file.content_type {
                part = part
                    .mime_str(content_type)
                    .map_err(|e| Error::Transport(format!("Invalid content type: {e}")))?;
            }
            form = form.part(format!("files[{index}]"), part);
        }
        if let Some(payload) = payload_json {
            let part = Part::text(payload)
                .mime_str("application/json")
                .map_err(|e| Error::Transport(e.to_string()))?;
            form = form.part("payload_json", part);
        }
        Ok(form)
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> impl Future<Output = Result<HttpResponse, Error>> + Send {
        async move {
            let mut builder = self
                .client
                .request(request.method, &request.url)
                .headers(request.headers);

            builder = match request.body {
                HttpBody::Empty => builder,
                HttpBody::Json(body) => builder.body(body),
                HttpBody::Multipart {
                    payload_json,
                    files,
                } => builder.multipart(Self::form(payload_json, files)?),
            };

            let response = builder.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(map_reqwest_error)?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            kind: TimeoutKind::Request,
            context: e.url().map(|u| u.path().to_string()),
        }
    } else {
        Error::Transport(e.to_string())
    }
}

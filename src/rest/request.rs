use crate::error::Error;
use bytes::Bytes;
use http::Method;
use serde::Serialize;
use serde_json::Value;

/// A file attached to a multipart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    /// File name reported to the server
    pub filename: String,
    /// File contents
    pub data: Bytes,
    /// MIME type, guessed by the server when absent
    pub content_type: Option<String>,
}

impl FileUpload {
    /// Attach `data` as `filename`.
    pub fn new(filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
            content_type: None,
        }
    }

    /// Set the MIME type.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// One REST call, relative to the versioned API path.
///
/// ```ignore
/// let request = RestRequest::post("/channels/123/messages")
///     .json(serde_json::json!({ "content": "hello" }))
///     .reason("greeting");
/// let message = dispatcher.request(request).await?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) auth: bool,
    pub(crate) body: Option<Value>,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) files: Vec<FileUpload>,
    pub(crate) reason: Option<String>,
    pub(crate) priority: bool,
}

impl RestRequest {
    /// Authenticated request for `path` (e.g. `/users/@me`).
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            auth: true,
            body: None,
            query: Vec::new(),
            files: Vec::new(),
            reason: None,
            priority: false,
        }
    }

    /// Creates a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Creates a POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Creates a PUT request.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// Creates a PATCH request.
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// Creates a DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Send without the `Authorization` header.
    #[must_use]
    pub fn unauthenticated(mut self) -> Self {
        self.auth = false;
        self
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serializes `body` as the JSON body.
    pub fn try_json<T: Serialize>(self, body: &T) -> Result<Self, Error> {
        Ok(self.json(serde_json::to_value(body)?))
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Attaches a file; the request is then sent as a multipart form.
    #[must_use]
    pub fn file(mut self, file: FileUpload) -> Self {
        self.files.push(file);
        self
    }

    /// Sets the audit log reason.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Jump ahead of queued requests on the same route.
    #[must_use]
    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path relative to the API base.
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let request = RestRequest::get("/users/@me");

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.path(), "/users/@me");
        assert!(request.auth);
        assert!(!request.priority);
        assert!(request.body.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let request = RestRequest::post("/channels/1/messages")
            .json(json!({ "content": "hi" }))
            .query("wait", true)
            .reason("cleanup")
            .file(FileUpload::new("a.txt", "hello").content_type("text/plain"))
            .priority()
            .unauthenticated();

        assert_eq!(request.body, Some(json!({ "content": "hi" })));
        assert_eq!(request.query, vec![("wait".to_string(), "true".to_string())]);
        assert_eq!(request.reason.as_deref(), Some("cleanup"));
        assert_eq!(request.files[0].data, Bytes::from_static(b"hello"));
        assert!(request.priority);
        assert!(!request.auth);
    }

    #[test]
    fn test_try_json() {
        #[derive(Serialize)]
        struct Edit {
            name: &'static str,
        }

        let request = RestRequest::patch("/guilds/1").try_json(&Edit { name: "x" }).unwrap();
        assert_eq!(request.body, Some(json!({ "name": "x" })));
    }
}

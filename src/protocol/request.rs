//! HTTP/3 request types and builders.

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

use crate::error::{H3Error, H3Result};
use crate::protocol::frame::HeaderBlock;

/// An HTTP/3 request.
#[derive(Debug, Clone)]
pub struct H3Request {
    /// HTTP method
    pub method: Method,

    /// Request URI
    pub uri: Uri,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body
    pub body: Option<Bytes>,
}

impl H3Request {
    /// Create a new request with the given method and URI.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get<T>(uri: T) -> H3RequestBuilder
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        H3RequestBuilder::new(Method::GET, uri)
    }

    /// Create a POST request.
    pub fn post<T>(uri: T) -> H3RequestBuilder
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        H3RequestBuilder::new(Method::POST, uri)
    }

    /// Create a PUT request.
    pub fn put<T>(uri: T) -> H3RequestBuilder
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        H3RequestBuilder::new(Method::PUT, uri)
    }

    /// Create a DELETE request.
    pub fn delete<T>(uri: T) -> H3RequestBuilder
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        H3RequestBuilder::new(Method::DELETE, uri)
    }

    /// Check if the request has a body.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Get the request authority (host).
    pub fn authority(&self) -> Option<&str> {
        self.uri.authority().map(|a| a.as_str())
    }

    /// Get the request path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Build and validate the field section for this request.
    pub fn header_block(&self) -> H3Result<HeaderBlock> {
        let authority = self
            .authority()
            .ok_or_else(|| H3Error::InvalidInput("request URI without authority".into()))?;
        let mut block = if self.method == Method::CONNECT {
            HeaderBlock::connect(authority)
        } else {
            let scheme = self.uri.scheme_str().unwrap_or("https");
            let path = self
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            HeaderBlock::request(self.method.as_str(), scheme, authority, path)
        };
        for (name, value) in &self.headers {
            let value = value
                .to_str()
                .map_err(|_| H3Error::InvalidInput(format!("non-ASCII value for '{name}'")))?;
            block.add_field(name.as_str(), value)?;
        }
        block.validate_request()?;
        Ok(block)
    }
}

/// Builder for constructing H3 requests.
#[derive(Debug)]
pub struct H3RequestBuilder {
    method: Method,
    uri: Result<Uri, http::Error>,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl H3RequestBuilder {
    /// Create a new request builder.
    pub fn new<T>(method: Method, uri: T) -> Self
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        Self {
            method,
            uri: uri.try_into().map_err(Into::into),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Add a header to the request.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: TryInto<http::HeaderName>,
        V: TryInto<http::HeaderValue>,
    {
        if let (Ok(key), Ok(value)) = (key.try_into(), value.try_into()) {
            self.headers.insert(key, value);
        }
        self
    }

    /// Set the request body.
    pub fn body<B>(mut self, body: B) -> Self
    where
        B: Into<Bytes>,
    {
        self.body = Some(body.into());
        self
    }

    /// Build the request.
    pub fn build(self) -> Result<H3Request, http::Error> {
        Ok(H3Request {
            method: self.method,
            uri: self.uri?,
            headers: self.headers,
            body: self.body,
        })
    }
}

//! Request builder for dashboard API calls
//!
//! Every request goes through the domain's [`Interceptor`], so it carries the
//! current credential and gets one refresh-and-replay on a 401.

use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use tenderdesk_auth::Interceptor;

use crate::error::Error;

/// Helper for building and executing HTTP requests
pub struct FetchBuilder<'a> {
    interceptor: &'a Interceptor,
    path: String,
    method: Method,
    headers: HeaderMap,
    query_params: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl<'a> FetchBuilder<'a> {
    pub fn new(interceptor: &'a Interceptor, method: Method, path: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Self {
            interceptor,
            path: path.to_string(),
            method,
            headers,
            query_params: Vec::new(),
            body: None,
        }
    }

    /// Add a header to the request
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::general(format!("Invalid header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::general(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Add a query parameter
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query_params.push((key.to_string(), value.to_string()));
        self
    }

    /// Add a JSON body to the request
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, Error> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    fn build(&self) -> reqwest::RequestBuilder {
        let mut req = self
            .interceptor
            .request(self.method.clone(), &self.path)
            .headers(self.headers.clone());

        if !self.query_params.is_empty() {
            req = req.query(&self.query_params);
        }
        if let Some(body) = &self.body {
            req = req.body(body.clone());
        }
        req
    }

    /// Execute the request and parse the response as JSON
    pub async fn execute<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let response = self.execute_raw().await?;
        Ok(response.json::<T>().await?)
    }

    /// Execute the request and return the raw response
    pub async fn execute_raw(&self) -> Result<reqwest::Response, Error> {
        debug!("{} {}", self.method, self.path);
        Ok(self.interceptor.send(self.build()).await?)
    }
}

/// Entry point for requests of one session domain.
#[derive(Clone, Copy)]
pub struct Fetch<'a> {
    interceptor: &'a Interceptor,
}

impl<'a> Fetch<'a> {
    pub fn new(interceptor: &'a Interceptor) -> Self {
        Self { interceptor }
    }

    /// Create a GET request
    pub fn get(&self, path: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(self.interceptor, Method::GET, path)
    }

    /// Create a POST request
    pub fn post(&self, path: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(self.interceptor, Method::POST, path)
    }

    /// Create a PUT request
    pub fn put(&self, path: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(self.interceptor, Method::PUT, path)
    }

    /// Create a PATCH request
    pub fn patch(&self, path: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(self.interceptor, Method::PATCH, path)
    }

    /// Create a DELETE request
    pub fn delete(&self, path: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(self.interceptor, Method::DELETE, path)
    }
}

use std::io::Read;
use std::time::Duration;

use tracing::debug;

use crate::codec;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Request, Response};
use crate::transport::Transport;

/// Response header carrying the `getmany` size list.
pub const SIZES_HEADER: &str = "X-Sizes";

/// Byte-store transport over HTTP(S).
///
/// Every request goes to the same script URL; the operation and its
/// arguments travel in the query string (`?r=<op>&n=<name>...`) and
/// payloads in a POST body. All file names are prefixed with `path`, so one
/// server can host several stores.
pub struct HttpTransport {
    agent: ureq::Agent,
    url: String,
    path: String,
    max_body: Option<usize>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_agent(ureq::Agent::new(), url, path)
    }

    pub fn with_agent(agent: ureq::Agent, url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            agent,
            url: url.into(),
            path: path.into(),
            max_body: None,
        }
    }

    /// Build an agent honouring an optional proxy URL and request timeout.
    pub fn build_agent(proxy: Option<&str>, timeout: Option<Duration>) -> ProtocolResult<ureq::Agent> {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(proxy) = proxy {
            let proxy = ureq::Proxy::new(proxy).map_err(|e| ProtocolError::Transport(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder.build())
    }

    /// Declare the server's body limit so clients can split ahead of time.
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = Some(max_body);
        self
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}{}", self.path, name)
    }

    fn query(&self, request: &Request) -> ProtocolResult<Vec<(&'static str, String)>> {
        let mut params = vec![("r", request.op().to_string())];
        match request {
            Request::List => {}
            Request::Stat { name }
            | Request::Get { name }
            | Request::Put { name, .. }
            | Request::Append { name, .. }
            | Request::Delete { name } => {
                codec::validate_name(name)?;
                params.push(("n", self.full_name(name)));
            }
            Request::GetParts { name, ranges } => {
                codec::validate_name(name)?;
                params.push(("n", self.full_name(name)));
                params.push(("parts", codec::encode_parts(ranges)));
            }
            Request::PutMany { files } => {
                let names: Vec<String> = files.iter().map(|(n, _)| self.full_name(n)).collect();
                let (sizes, _) = codec::pack_many(files);
                params.push(("names", codec::encode_names(&names)?));
                params.push(("sizes", codec::encode_sizes(&sizes)));
            }
            Request::GetMany { names } => {
                let names: Vec<String> = names.iter().map(|n| self.full_name(n)).collect();
                params.push(("names", codec::encode_names(&names)?));
            }
        }
        Ok(params)
    }

    fn body(request: &Request) -> Option<Vec<u8>> {
        match request {
            Request::Put { body, .. } | Request::Append { body, .. } => Some(body.clone()),
            Request::PutMany { files } => Some(codec::pack_many(files).1),
            _ => None,
        }
    }

    fn strip_prefix(&self, body: Vec<u8>) -> Vec<u8> {
        if self.path.is_empty() {
            return body;
        }
        let mut out = String::new();
        for name in codec::parse_list(&body) {
            if let Some(rest) = name.strip_prefix(&self.path) {
                out.push_str(rest);
                out.push('\n');
            }
        }
        out.into_bytes()
    }
}

impl Transport for HttpTransport {
    fn call(&self, request: &Request) -> ProtocolResult<Response> {
        let params = self.query(request)?;
        let body = Self::body(request);
        let method = if body.is_some() { "POST" } else { "GET" };
        debug!(op = request.op(), method, bytes = request.body_len(), "byte-store request");

        let mut req = self.agent.request(method, &self.url).set("Connection", "keep-alive");
        for (key, value) in &params {
            req = req.query(key, value);
        }
        let result = match &body {
            Some(body) => req.send_bytes(body),
            None => req.call(),
        };

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => {
                return Err(ProtocolError::NotFound(
                    request.name().unwrap_or_default().to_string(),
                ))
            }
            Err(ureq::Error::Status(413, _)) => {
                return Err(ProtocolError::MessageTooLarge {
                    size: request.body_len(),
                    max: self.max_body.unwrap_or_default(),
                })
            }
            Err(ureq::Error::Status(status, response)) => {
                let message = response.into_string().unwrap_or_default();
                return Err(ProtocolError::Remote { status, message });
            }
            Err(ureq::Error::Transport(e)) => return Err(ProtocolError::Transport(e.to_string())),
        };

        let sizes = match response.header(SIZES_HEADER) {
            Some(raw) => Some(codec::parse_sizes(raw)?),
            None => None,
        };
        let mut buffer = Vec::new();
        response.into_reader().read_to_end(&mut buffer)?;

        let body = match request {
            Request::List => self.strip_prefix(buffer),
            _ => buffer,
        };
        Ok(Response { body, sizes })
    }

    fn max_body(&self) -> Option<usize> {
        self.max_body
    }
}

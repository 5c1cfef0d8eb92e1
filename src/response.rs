use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;
use crate::request::RequestDescriptor;
use crate::util::truncate_body;

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Bytes(Bytes),
}

impl ResponseBody {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Bytes(bytes) => bytes.clone(),
            Self::Json(value) => Bytes::from(value.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResponseDescriptor {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
    request: Arc<RequestDescriptor>,
}

impl ResponseDescriptor {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: ResponseBody,
        request: Arc<RequestDescriptor>,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            request,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn set_body(&mut self, body: ResponseBody) {
        self.body = body;
    }

    /// The request that produced this response, as sent on the final attempt.
    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    pub fn text_lossy(&self) -> String {
        match &self.body {
            ResponseBody::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            ResponseBody::Json(value) => value.to_string(),
        }
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        match &self.body {
            ResponseBody::Json(value) => {
                serde_json::from_value(value.clone()).map_err(|source| Error::Deserialize {
                    message: source.to_string(),
                    body: truncate_body(value.to_string().as_bytes()),
                })
            }
            ResponseBody::Bytes(bytes) => {
                serde_json::from_slice(bytes).map_err(|source| Error::Deserialize {
                    message: source.to_string(),
                    body: truncate_body(bytes),
                })
            }
        }
    }
}

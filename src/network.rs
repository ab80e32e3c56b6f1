/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: MIT
 *
 * Permission is hereby granted, free of charge, to any person obtaining a
 * copy of this software and associated documentation files (the "Software"),
 * to deal in the Software without restriction, including without limitation
 * the rights to use, copy, modify, merge, publish, distribute, sublicense,
 * and/or sell copies of the Software, and to permit persons to whom the
 * Software is furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL
 * THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
 * DEALINGS IN THE SOFTWARE.
 */
use std::{collections::HashMap, time::Duration};

use reqwest::{
    header::HeaderValue, header::ACCEPT, header::CONTENT_TYPE, header::LOCATION,
    Client as HttpClient, ClientBuilder as HttpClientBuilder, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{jsonmap, Controller, ControllerError};

pub const REDFISH_ENDPOINT: &str = "redfish/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug)]
pub struct RedfishClientPoolBuilder {
    timeout: Duration,
    accept_invalid_certs: bool,
}

impl RedfishClientPoolBuilder {
    /// Prevents the Redfish Client from accepting self signed certificates
    /// and other invalid certificates.
    ///
    /// By default self signed certificates will be accepted, since BMCs usually
    /// use those.
    pub fn reject_invalid_certs(mut self) -> RedfishClientPoolBuilder {
        self.accept_invalid_certs = false;
        self
    }

    /// Overwrites the timeout that will be applied to every request
    pub fn timeout(mut self, timeout: Duration) -> RedfishClientPoolBuilder {
        self.timeout = timeout;
        self
    }

    pub fn build(&self) -> Result<RedfishClientPool, ControllerError> {
        let http_client = HttpClientBuilder::new()
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .timeout(self.timeout)
            .build()
            .map_err(|e| ControllerError::NetworkError {
                url: String::new(),
                source: e,
            })?;
        Ok(RedfishClientPool { http_client })
    }
}

/// The endpoint that the redfish client connects to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or IP address of BMC
    pub host: String,
    /// BMC port. If absent the default HTTPS port 443 will be used
    pub port: Option<u16>,
    /// BMC username
    pub user: Option<String>,
    /// BMC password
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RedfishClientPool {
    http_client: HttpClient,
}

impl RedfishClientPool {
    /// Returns Builder for configuring a Redfish HTTP connection pool
    pub fn builder() -> RedfishClientPoolBuilder {
        RedfishClientPoolBuilder {
            timeout: DEFAULT_TIMEOUT,
            // BMCs often have a self-signed cert, so usually this has to be true
            accept_invalid_certs: true,
        }
    }

    /// Creates a controller client for a certain endpoint
    ///
    /// Creating the client immediately reads the service root to determine
    /// the BMC vendor, then the Systems and Managers collections.
    pub async fn create_client(
        &self,
        endpoint: Endpoint,
    ) -> Result<Box<dyn Controller>, ControllerError> {
        let client = RedfishHttpClient::new(self.http_client.clone(), endpoint);
        let (_status_code, root): (_, HashMap<String, serde_json::Value>) = client.get("").await?;
        match jsonmap::get_str(&root, "Vendor", &client.url("")).ok() {
            // Older iDRAC firmware does not report a vendor
            Some("Dell") | None => Ok(Box::new(crate::dell::Bmc::new(client).await?)),
            Some(vendor) => Err(ControllerError::NotSupported(format!(
                "BIOS and RAID reconciliation on {vendor} BMCs"
            ))),
        }
    }
}

/// A HTTP client which targets a single Redfish endpoint
pub struct RedfishHttpClient {
    endpoint: Endpoint,
    http_client: HttpClient,
}

impl RedfishHttpClient {
    pub fn new(http_client: HttpClient, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            http_client,
        }
    }

    pub async fn get<T>(&self, api: &str) -> Result<(StatusCode, T), ControllerError>
    where
        T: DeserializeOwned + ::std::fmt::Debug,
    {
        let (status_code, resp_opt, _) = self.req::<T, String>(Method::GET, api, None, None).await?;
        match resp_opt {
            Some(response_body) => Ok((status_code, response_body)),
            None => Err(ControllerError::NoContent),
        }
    }

    /// POST returning the `Location` header, where BMCs point at the job or
    /// resource the request created.
    pub async fn post<B>(
        &self,
        api: &str,
        data: B,
    ) -> Result<(StatusCode, Option<String>), ControllerError>
    where
        B: Serialize + ::std::fmt::Debug,
    {
        let (status_code, _resp_body, location): (_, Option<HashMap<String, serde_json::Value>>, _) =
            self.req(Method::POST, api, Some(data), None).await?;
        Ok((status_code, location))
    }

    pub async fn patch<T>(&self, api: &str, data: T) -> Result<StatusCode, ControllerError>
    where
        T: Serialize + ::std::fmt::Debug,
    {
        let (status_code, _resp_body, _): (_, Option<HashMap<String, serde_json::Value>>, _) =
            self.req(Method::PATCH, api, Some(data), None).await?;
        Ok(status_code)
    }

    pub async fn delete<B>(
        &self,
        api: &str,
        data: Option<B>,
    ) -> Result<(StatusCode, Option<String>), ControllerError>
    where
        B: Serialize + ::std::fmt::Debug,
    {
        let (status_code, _resp_body, location): (_, Option<HashMap<String, serde_json::Value>>, _) =
            self.req(Method::DELETE, api, data, None).await?;
        Ok((status_code, location))
    }

    /// Full URL of `api`. Absolute paths, as found in `@odata.id` and
    /// `Location`, are taken as is.
    pub fn url(&self, api: &str) -> String {
        let path = match api.strip_prefix('/') {
            Some(absolute) => absolute.to_string(),
            None => format!("{REDFISH_ENDPOINT}/{api}"),
        };
        match self.endpoint.port {
            Some(p) => format!("https://{}:{}/{}", self.endpoint.host, p, path),
            None => format!("https://{}/{}", self.endpoint.host, path),
        }
    }

    // All the HTTP requests happen from here.
    pub async fn req<T, B>(
        &self,
        method: Method,
        api: &str,
        body: Option<B>,
        override_timeout: Option<Duration>,
    ) -> Result<(StatusCode, Option<T>, Option<String>), ControllerError>
    where
        T: DeserializeOwned + ::std::fmt::Debug,
        B: Serialize + ::std::fmt::Debug,
    {
        let url = self.url(api);
        let body_enc = match body {
            Some(b) => {
                let url = url.clone();
                let body_enc =
                    serde_json::to_string(&b).map_err(|e| ControllerError::JsonSerializeError {
                        url,
                        object_debug: format!("{b:?}"),
                        source: e,
                    })?;
                Some(body_enc)
            }
            None => None,
        };
        debug!(
            "TX {} {} {}",
            method,
            url,
            body_enc.as_deref().unwrap_or_default()
        );

        let mut req_b = self.http_client.request(method, &url);
        req_b = req_b
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(user) = &self.endpoint.user {
            req_b = req_b.basic_auth(user, self.endpoint.password.as_ref());
        }
        if let Some(t) = override_timeout {
            req_b = req_b.timeout(t);
        }
        if let Some(b) = body_enc {
            req_b = req_b.body(b);
        }
        let response = req_b
            .send()
            .await
            .map_err(|e| ControllerError::NetworkError {
                url: url.clone(),
                source: e,
            })?;
        let status_code = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        // read the body even if not status 2XX, because BMCs give useful error messages as JSON
        let response_body = response
            .text()
            .await
            .map_err(|e| ControllerError::NetworkError {
                url: url.clone(),
                source: e,
            })?;
        let mut res = None;
        if !response_body.is_empty() {
            debug!("RX {status_code} {response_body}");
            match serde_json::from_str(&response_body) {
                Ok(v) => res = Some(v),
                // Error bodies are not always JSON. The status code is what matters then.
                Err(_) if !status_code.is_success() => {}
                Err(e) => {
                    return Err(ControllerError::JsonDeserializeError {
                        url,
                        body: response_body,
                        source: e,
                    });
                }
            };
        } else {
            debug!("RX {status_code}");
        }

        if !status_code.is_success() {
            return Err(ControllerError::HTTPErrorCode { url, status_code });
        }
        Ok((status_code, res, location))
    }
}

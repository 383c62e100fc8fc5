use std::io::{Read, Write};
use std::time::Duration;

use super::retry::retry_http;
use super::Backend;
use crate::config::RetryConfig;
use crate::error::{Result, StrataError};

/// HTTP REST backend. Objects live directly under the base URL; listing is a
/// `GET <base>?list` returning one `name size` pair per line.
pub struct RestBackend {
    base_url: String,
    agent: ureq::Agent,
    token: Option<String>,
    retry: RetryConfig,
}

impl RestBackend {
    pub fn new(base_url: &str, token: Option<&str>, retry: RetryConfig) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
            token: token.map(|t| t.to_string()),
            retry,
        })
    }

    fn url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name.trim_start_matches('/'))
    }

    fn apply_auth(&self, req: ureq::Request) -> ureq::Request {
        if let Some(ref token) = self.token {
            req.set("Authorization", &format!("Bearer {token}"))
        } else {
            req
        }
    }

    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        retry_http(&self.retry, op_name, "REST", f)
    }
}

impl Backend for RestBackend {
    fn list(&self) -> Result<Vec<(String, u64)>> {
        let url = format!("{}?list", self.base_url);
        let resp = self.retry_call("list", || {
            self.apply_auth(self.agent.get(&url)).call()
        })?;
        let body = resp
            .into_string()
            .map_err(|e| StrataError::Other(format!("REST list read: {e}")))?;
        let mut out = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let (name, size) = line.rsplit_once(' ').ok_or_else(|| {
                StrataError::Other(format!("REST list: malformed line '{line}'"))
            })?;
            let size: u64 = size
                .parse()
                .map_err(|_| StrataError::Other(format!("REST list: bad size in '{line}'")))?;
            out.push((name.to_string(), size));
        }
        Ok(out)
    }

    fn get(&self, name: &str, out: &mut dyn Write) -> Result<Option<u64>> {
        let url = self.url(name);
        let resp = match self.retry_call("get", || {
            self.apply_auth(self.agent.get(&url)).call()
        }) {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = resp.into_reader();
        let n = std::io::copy(&mut reader, out)?;
        Ok(Some(n))
    }

    fn put(&self, name: &str, data: &mut dyn Read) -> Result<u64> {
        // ureq needs an owned reader per attempt; buffer once and retry the
        // send.
        let mut body = Vec::new();
        data.read_to_end(&mut body)?;
        let url = self.url(name);
        self.retry_call("put", || {
            self.apply_auth(self.agent.put(&url))
                .send_bytes(&body)
                .map(|_| ())
        })?;
        Ok(body.len() as u64)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let url = self.url(name);
        match self.retry_call("delete", || {
            self.apply_auth(self.agent.delete(&url)).call()
        }) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let url = format!("{}?rename-to={}", self.url(old), new);
        self.retry_call("rename", || {
            self.apply_auth(self.agent.post(&url)).call()
        })?;
        Ok(())
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        let url = self.url(name);
        let resp = match self.retry_call("head", || {
            self.apply_auth(self.agent.head(&url)).call()
        }) {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = resp
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StrataError::Other(format!("REST head '{name}': no length")))?;
        Ok(Some(len))
    }
}

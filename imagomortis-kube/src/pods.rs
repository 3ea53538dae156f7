//! v1 Pod endpoints and container log streaming

use crate::KubeClient;
use crate::error::Result;
use crate::model::{ObjectList, Pod};

/// Options for reading a container log
#[derive(Debug, Clone)]
pub struct LogParams {
    pub container: String,
    /// Keep the connection open and receive new lines as they are written
    pub follow: bool,
    /// Only return this many trailing lines of the existing log
    pub tail_lines: Option<u32>,
}

impl KubeClient {
    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, namespace)
    }

    /// List pods matching a label selector (e.g. `job-name=imagetask-1b4e28ba`)
    pub async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let response = self
            .client
            .get(self.pods_url(namespace))
            .query(&[("labelSelector", label_selector)])
            .timeout(self.request_timeout)
            .send()
            .await?;

        let list: ObjectList<Pod> = self.handle_response(response).await?;
        Ok(list.items)
    }

    /// Read a single pod
    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let url = format!("{}/{}", self.pods_url(namespace), name);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Open a container log
    ///
    /// With `follow` set the request has no timeout: the stream ends when the
    /// container exits or when the returned [`LogStream`] is dropped.
    pub async fn stream_logs(&self, namespace: &str, pod: &str, params: &LogParams) -> Result<LogStream> {
        let url = format!("{}/{}/log", self.pods_url(namespace), pod);

        let mut query = vec![
            ("container", params.container.clone()),
            ("follow", params.follow.to_string()),
        ];
        if let Some(tail) = params.tail_lines {
            query.push(("tailLines", tail.to_string()));
        }

        let mut request = self.client.get(&url).query(&query);
        if !params.follow {
            request = request.timeout(self.request_timeout);
        }

        let response = request.send().await?;
        let response = self.check_status(response).await?;
        tracing::debug!(pod = %pod, container = %params.container, follow = params.follow, "Opened container log");

        Ok(LogStream {
            response,
            buffer: LineBuffer::default(),
            finished: false,
        })
    }
}

/// A container log read line by line
///
/// Dropping the stream closes the underlying connection.
#[derive(Debug)]
pub struct LogStream {
    response: reqwest::Response,
    buffer: LineBuffer,
    finished: bool,
}

impl LogStream {
    /// Next complete line, or `None` once the log has ended
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.buffer.next_line() {
                return Ok(Some(line));
            }

            if self.finished {
                return Ok(self.buffer.take_remainder());
            }

            match self.response.chunk().await? {
                Some(chunk) => self.buffer.push(&chunk),
                None => self.finished = true,
            }
        }
    }
}

/// Longest line kept by [`LineBuffer`]; longer lines are dropped
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into lines
///
/// Bytes are buffered until a newline arrives so multi-byte characters split
/// across chunks decode correctly. Invalid UTF-8 is replaced, not rejected.
/// A line longer than `max_line` is discarded up to its newline so an
/// unterminated stream cannot grow the buffer without bound.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line: usize,
    /// Inside an oversized line, skipping until its newline
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Pops the next complete line without its terminator
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.pending.iter().position(|b| *b == b'\n') else {
                if self.pending.len() > self.max_line {
                    tracing::warn!(bytes = self.pending.len(), "Dropping oversized log line");
                    self.pending.clear();
                    self.discarding = true;
                }
                return None;
            };

            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            if std::mem::take(&mut self.discarding) || line.len() > self.max_line + 1 {
                continue;
            }

            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Some(String::from_utf8_lossy(&line).into_owned());
        }
    }

    /// Returns a trailing line that was never terminated
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() || std::mem::take(&mut self.discarding) {
            self.pending.clear();
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

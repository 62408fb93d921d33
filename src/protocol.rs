use serde::{Deserialize, Serialize};

use crate::consts;

/// A single request frame from the client. The `cmd` field selects
/// which other fields are meaningful; unused fields are left `None`.
#[derive(Deserialize, Debug, Clone)]
pub struct Request {
    pub cmd: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub secret: Option<String>,
    pub conn_id: Option<String>,
    pub log_id: Option<String>,
    pub path: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub position: Option<f64>,
}

/// Outcome tag shared by every response.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Data payload carried in a response. `None` serializes the key away
/// entirely so bare acks (e.g. `close`) stay minimal.
#[derive(Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum Data {
    Text(String),
    Lines(Vec<String>),
}

#[derive(Serialize, Debug, Clone)]
pub struct Response {
    pub cmd: String,
    pub res: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
}

impl Response {
    pub fn ok(cmd: &str) -> Self {
        Response { cmd: cmd.to_string(), res: Status::Ok, conn_id: None, log_id: None, data: None }
    }

    pub fn error(cmd: &str) -> Self {
        Response {
            cmd: cmd.to_string(),
            res: Status::Error,
            conn_id: None,
            log_id: None,
            data: None,
        }
    }

    pub fn with_conn_id(mut self, conn_id: String) -> Self {
        self.conn_id = Some(conn_id);
        self
    }

    pub fn with_log_id(mut self, log_id: String) -> Self {
        self.log_id = Some(log_id);
        self
    }

    pub fn with_text(mut self, text: String) -> Self {
        self.data = Some(Data::Text(text));
        self
    }

    pub fn with_lines(mut self, lines: Vec<String>) -> Self {
        self.data = Some(Data::Lines(lines));
        self
    }

    /// Serializes this response as a CRLF terminated JSON line, split
    /// into chunks no larger than `consts::OUT_BUFF_SIZE`, matching the
    /// wire chunking the client is expected to reassemble.
    pub fn into_chunks(&self) -> Vec<Vec<u8>> {
        let mut encoded = serde_json::to_vec(self).expect("Response always serializes");
        encoded.extend_from_slice(b"\r\n");
        encoded.chunks(consts::OUT_BUFF_SIZE).map(|c| c.to_vec()).collect()
    }
}

/// Accumulates bytes from a client socket and yields complete,
/// CRLF-delimited frames. Mirrors the original implementation's
/// buffer-overrun guard: if no delimiter shows up before the buffer
/// grows past `MAX_INBUF`, the buffer is dropped and a warning logged.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader { buf: Vec::new() }
    }

    /// Feed newly read bytes in; returns every complete frame found,
    /// oldest first. Leaves any trailing partial frame buffered.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(pos) = find_crlf(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..pos).collect();
            // drop the CRLF itself
            self.buf.drain(..2);
            frames.push(frame);
        }

        if frames.is_empty() && self.buf.len() > consts::MAX_INBUF {
            tracing::warn!(len = self.buf.len(), "input buffer overrun, resetting");
            self.buf.clear();
        }

        frames
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_frame() {
        let mut reader = FrameReader::new();
        let frames = reader.push(b"{\"cmd\":\"connect\"}\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], b"{\"cmd\":\"connect\"}");
    }

    #[test]
    fn buffers_partial_frame() {
        let mut reader = FrameReader::new();
        assert!(reader.push(b"{\"cmd\":\"conn").is_empty());
        let frames = reader.push(b"ect\"}\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], b"{\"cmd\":\"connect\"}");
    }

    #[test]
    fn splits_multiple_frames_in_one_push() {
        let mut reader = FrameReader::new();
        let frames = reader.push(b"{\"cmd\":\"a\"}\r\n{\"cmd\":\"b\"}\r\n");
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn resets_on_overrun() {
        let mut reader = FrameReader::new();
        let huge = vec![b'x'; consts::MAX_INBUF + 1];
        assert!(reader.push(&huge).is_empty());
        // buffer should have been reset; a well formed frame now parses cleanly
        let frames = reader.push(b"{\"cmd\":\"connect\"}\r\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn response_ok_roundtrips_conn_id() {
        let resp = Response::ok("connect").with_conn_id("abc".to_string());
        let chunks = resp.into_chunks();
        assert_eq!(chunks.len(), 1);
        let s = String::from_utf8(chunks[0].clone()).unwrap();
        assert!(s.contains("\"conn_id\":\"abc\""));
        assert!(s.ends_with("\r\n"));
    }

    #[test]
    fn response_chunks_large_payload() {
        let big = "x".repeat(consts::OUT_BUFF_SIZE * 2 + 5);
        let resp = Response::ok("log_page").with_log_id("l".to_string()).with_text(big);
        let chunks = resp.into_chunks();
        assert!(chunks.len() >= 3);
        for c in &chunks[..chunks.len() - 1] {
            assert_eq!(c.len(), consts::OUT_BUFF_SIZE);
        }
    }
}

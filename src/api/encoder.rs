//! Response encoders: JSON or MsgPack, each in simple or stream mode.
//!
//! Simple JSON is written incrementally as
//! `{"results":[...],"errors":[...],"stats":{...}}`; errors are buffered
//! until the end. Stream JSON is a sequence of tagged items closed by
//! `"end"`. Stream MsgPack is the inter-node wire protocol.

use crate::search::wire::{self, TAG_ERROR, TAG_RECORD, TAG_STAT};
use crate::Result;
use bytes::Bytes;
use serde_json::{Map, Value};

pub const JSON_MIME: &str = "application/json";
pub const MSGPACK_MIME: &str = "application/msgpack";
pub const MSGPACK_ALT_MIME: &str = "application/x-msgpack";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mime {
    Json,
    MsgPack,
}

/// Pick the encoder from an `Accept` header. Anything unsupported is JSON.
pub fn negotiate(accept: Option<&str>) -> Mime {
    let Some(accept) = accept else {
        return Mime::Json;
    };
    for item in accept.split(',') {
        let mime = item.split(';').next().unwrap_or_default().trim();
        match mime.to_ascii_lowercase().as_str() {
            JSON_MIME | "*/*" | "application/*" => return Mime::Json,
            MSGPACK_MIME | MSGPACK_ALT_MIME => return Mime::MsgPack,
            _ => {}
        }
    }
    Mime::Json
}

pub struct Encoder {
    mime: Mime,
    stream: bool,
    started: bool,
    need_separator: bool,
    results: Vec<Value>,
    errors: Vec<String>,
    finished: bool,
}

impl Encoder {
    pub fn new(mime: Mime, stream: bool) -> Self {
        Self {
            mime,
            stream,
            started: false,
            need_separator: false,
            results: Vec::new(),
            errors: Vec::new(),
            finished: false,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self.mime {
            Mime::Json => JSON_MIME,
            Mime::MsgPack => MSGPACK_MIME,
        }
    }

    /// Stream mode reports errors inline.
    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn prologue(&mut self, out: &mut Vec<u8>) {
        if !self.started {
            self.started = true;
            if self.mime == Mime::Json && !self.stream {
                out.extend_from_slice(br#"{"results":["#);
            }
        }
    }

    pub fn record(&mut self, value: &Value) -> Result<Bytes> {
        let mut out = Vec::new();
        self.prologue(&mut out);
        match (self.mime, self.stream) {
            (Mime::Json, false) => {
                if self.need_separator {
                    out.push(b',');
                }
                serde_json::to_writer(&mut out, value)?;
                self.need_separator = true;
            }
            (Mime::Json, true) => tagged_json(&mut out, "rec", Some(value))?,
            (Mime::MsgPack, false) => self.results.push(value.clone()),
            (Mime::MsgPack, true) => out.extend(wire::encode(TAG_RECORD, value)?),
        }
        Ok(Bytes::from(out))
    }

    pub fn error(&mut self, message: &str) -> Result<Bytes> {
        let mut out = Vec::new();
        self.prologue(&mut out);
        match (self.mime, self.stream) {
            (_, false) => self.errors.push(message.to_string()),
            (Mime::Json, true) => {
                tagged_json(&mut out, "err", Some(&Value::String(message.to_string())))?
            }
            (Mime::MsgPack, true) => out.extend(wire::encode(TAG_ERROR, message)?),
        }
        Ok(Bytes::from(out))
    }

    /// Close the response, with the stat when given.
    pub fn finish(&mut self, stat: Option<&Value>) -> Result<Bytes> {
        let mut out = Vec::new();
        if self.finished {
            return Ok(Bytes::new());
        }
        self.prologue(&mut out);
        self.finished = true;
        match (self.mime, self.stream) {
            (Mime::Json, false) => {
                out.push(b']');
                if !self.errors.is_empty() {
                    out.extend_from_slice(br#","errors":"#);
                    serde_json::to_writer(&mut out, &self.errors)?;
                }
                if let Some(stat) = stat {
                    out.extend_from_slice(br#","stats":"#);
                    serde_json::to_writer(&mut out, stat)?;
                }
                out.push(b'}');
            }
            (Mime::Json, true) => {
                if let Some(stat) = stat {
                    tagged_json(&mut out, "stat", Some(stat))?;
                }
                tagged_json(&mut out, "end", None)?;
            }
            (Mime::MsgPack, false) => {
                let mut map = Map::new();
                map.insert(
                    "results".to_string(),
                    Value::Array(std::mem::take(&mut self.results)),
                );
                if !self.errors.is_empty() {
                    map.insert(
                        "errors".to_string(),
                        Value::Array(self.errors.drain(..).map(Value::String).collect()),
                    );
                }
                if let Some(stat) = stat {
                    map.insert("stats".to_string(), stat.clone());
                }
                out.extend(rmp_serde::to_vec_named(&Value::Object(map))?);
            }
            (Mime::MsgPack, true) => {
                if let Some(stat) = stat {
                    out.extend(wire::encode(TAG_STAT, stat)?);
                }
                out.extend(wire::encode_eof());
            }
        }
        Ok(Bytes::from(out))
    }
}

fn tagged_json(out: &mut Vec<u8>, tag: &str, value: Option<&Value>) -> Result<()> {
    serde_json::to_writer(&mut *out, tag)?;
    if let Some(value) = value {
        out.push(b' ');
        serde_json::to_writer(&mut *out, value)?;
    }
    out.push(b'\n');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::wire::{Item, StreamDecoder};
    use serde_json::json;

    fn text(chunks: &[Bytes]) -> String {
        chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    #[test]
    fn accept_negotiation() {
        assert_eq!(negotiate(None), Mime::Json);
        assert_eq!(negotiate(Some("application/msgpack")), Mime::MsgPack);
        assert_eq!(negotiate(Some("text/html, application/x-msgpack;q=0.9")), Mime::MsgPack);
        assert_eq!(negotiate(Some("text/html")), Mime::Json);
    }

    #[test]
    fn simple_json_buffers_errors() {
        let mut enc = Encoder::new(Mime::Json, false);
        let chunks = vec![
            enc.record(&json!({"a": 1})).unwrap(),
            enc.error("oops").unwrap(),
            enc.record(&json!({"a": 2})).unwrap(),
            enc.finish(Some(&json!({"matches": 2}))).unwrap(),
        ];
        let body: Value = serde_json::from_str(&text(&chunks)).unwrap();
        assert_eq!(
            body,
            json!({"results": [{"a": 1}, {"a": 2}], "errors": ["oops"], "stats": {"matches": 2}})
        );
    }

    #[test]
    fn empty_simple_json_is_valid() {
        let mut enc = Encoder::new(Mime::Json, false);
        let body = enc.finish(None).unwrap();
        assert_eq!(&body[..], br#"{"results":[]}"#);
        assert!(enc.finish(None).unwrap().is_empty());
    }

    #[test]
    fn stream_json_is_tagged() {
        let mut enc = Encoder::new(Mime::Json, true);
        let chunks = vec![
            enc.record(&json!({"a": 1})).unwrap(),
            enc.error("oops").unwrap(),
            enc.finish(Some(&json!({"matches": 1}))).unwrap(),
        ];
        assert_eq!(
            text(&chunks),
            "\"rec\" {\"a\":1}\n\"err\" \"oops\"\n\"stat\" {\"matches\":1}\n\"end\"\n"
        );
    }

    #[test]
    fn stream_msgpack_decodes_with_wire_decoder() {
        let mut enc = Encoder::new(Mime::MsgPack, true);
        let rec = json!({"_index": {"file": "a", "offset": 0, "length": 1, "fuzziness": 0}, "data": "eA=="});
        let mut dec = StreamDecoder::new();
        dec.push(&enc.record(&rec).unwrap());
        dec.push(&enc.error("bad").unwrap());
        dec.push(&enc.finish(Some(&json!({"matches": 1, "totalBytes": 1}))).unwrap());

        assert!(matches!(dec.next_item().unwrap(), Some(Item::Record(r)) if r.data == b"x"));
        assert!(matches!(dec.next_item().unwrap(), Some(Item::Error(e)) if e == "bad"));
        assert!(matches!(dec.next_item().unwrap(), Some(Item::Stat(s)) if s.matches == 1));
        assert!(matches!(dec.next_item().unwrap(), Some(Item::Eof)));
    }
}

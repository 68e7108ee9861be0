use crate::prelude::*;

use adapter_protocol::ProtocolMessage;
use bytes::BytesMut;
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Write;
use std::io;
use std::str;
use tokio_util::codec;

pub struct DAPCodec {
    state: State,
    content_len: usize,
}

enum State {
    ReadingHeaders,
    ReadingBody,
}

impl DAPCodec {
    pub fn new() -> DAPCodec {
        DAPCodec {
            state: State::ReadingHeaders,
            content_len: 0,
        }
    }
}

/// A decoded frame: the typed envelope, plus the raw JSON for observers.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message: ProtocolMessage,
    pub raw: Value,
}

pub type DecoderResult = Result<InboundMessage, DecoderError>;

#[derive(Debug)]
pub enum DecoderError {
    SerdeError {
        error: serde_json::error::Error,
        value: Value,
    },
}

impl codec::Decoder for DAPCodec {
    type Item = DecoderResult;
    type Error = io::Error;

    fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<DecoderResult>, Self::Error> {
        // Case-insensitive
        fn has_prefix<'s>(line: &'s str, prefix: &str) -> Option<&'s str> {
            if line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix) {
                Some(&line[prefix.len()..])
            } else {
                None
            }
        }

        loop {
            match self.state {
                State::ReadingHeaders => match buffer.windows(2).position(|b| b == &[b'\r', b'\n']) {
                    None => return Ok(None),
                    Some(pos) => {
                        let line = buffer.split_to(pos + 2);
                        if line.len() == 2 {
                            self.state = State::ReadingBody;
                        } else if let Ok(line) = str::from_utf8(&line) {
                            if let Some(rest) = has_prefix(line, "Content-Length:") {
                                if let Ok(content_len) = rest.trim().parse::<usize>() {
                                    self.content_len = content_len;
                                }
                            }
                        }
                    }
                },
                State::ReadingBody => {
                    if buffer.len() < self.content_len {
                        return Ok(None);
                    }
                    let message_bytes = buffer.split_to(self.content_len);
                    self.state = State::ReadingHeaders;
                    self.content_len = 0;

                    debug!("<-- {}", String::from_utf8_lossy(&message_bytes));
                    let raw: Value = match serde_json::from_slice(&message_bytes) {
                        Ok(raw) => raw,
                        Err(error) => {
                            return Ok(Some(Err(DecoderError::SerdeError {
                                error,
                                value: Value::Null,
                            })))
                        }
                    };
                    return match ProtocolMessage::deserialize(&raw) {
                        Ok(message) => Ok(Some(Ok(InboundMessage { message, raw }))),
                        Err(error) => Ok(Some(Err(DecoderError::SerdeError { error, value: raw }))),
                    };
                }
            }
        }
    }
}

impl codec::Encoder<ProtocolMessage> for DAPCodec {
    type Error = io::Error;

    fn encode(&mut self, message: ProtocolMessage, buffer: &mut BytesMut) -> Result<(), Self::Error> {
        let message_bytes = serde_json::to_vec(&message)?;
        debug!("--> {}", String::from_utf8_lossy(&message_bytes));

        buffer.reserve(32 + message_bytes.len());
        write!(buffer, "Content-Length: {}\r\n\r\n", message_bytes.len())
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        buffer.extend_from_slice(&message_bytes);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapter_protocol::{ProtocolMessageType, RequestMessage};
    use tokio_util::codec::{Decoder, Encoder};

    fn frame(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    #[test]
    fn decodes_split_frames() {
        let body = r#"{"seq":3,"type":"event","event":"stopped","body":{"reason":"step"}}"#;
        let text = frame(body);
        let mut codec = DAPCodec::new();
        let mut buffer = BytesMut::new();

        let (head, tail) = text.split_at(10);
        buffer.extend_from_slice(head.as_bytes());
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(tail.as_bytes());
        let inbound = codec.decode(&mut buffer).unwrap().unwrap().unwrap();
        assert_eq!(inbound.message.seq, 3);
        assert_eq!(inbound.raw["body"]["reason"], "step");
        assert!(buffer.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let first = r#"{"seq":1,"type":"event","event":"initialized"}"#;
        let second = r#"{"seq":2,"type":"response","request_seq":1,"command":"initialize","success":true}"#;
        let mut buffer = BytesMut::from(format!("{}{}", frame(first), frame(second)).as_str());
        let mut codec = DAPCodec::new();
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().unwrap().message.seq, 1);
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().unwrap().message.seq, 2);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn header_case_and_extra_headers() {
        let body = r#"{"seq":1,"type":"event","event":"initialized"}"#;
        let text = format!("content-length: {}\r\nContent-Type: application/json\r\n\r\n{}", body.len(), body);
        let mut buffer = BytesMut::from(text.as_str());
        assert!(DAPCodec::new().decode(&mut buffer).unwrap().unwrap().is_ok());
    }

    #[test]
    fn reports_malformed_envelopes() {
        let mut codec = DAPCodec::new();
        let mut buffer = BytesMut::from(frame(r#"{"seq":1,"type":"bogus"}"#).as_str());
        match codec.decode(&mut buffer).unwrap().unwrap() {
            Err(DecoderError::SerdeError { value, .. }) => assert_eq!(value["type"], "bogus"),
            Ok(_) => panic!("decoded a bogus message"),
        }

        let mut buffer = BytesMut::from(frame("{not json").as_str());
        assert!(matches!(
            codec.decode(&mut buffer).unwrap().unwrap(),
            Err(DecoderError::SerdeError { value: Value::Null, .. })
        ));
    }

    #[test]
    fn encodes_with_header() {
        let message = ProtocolMessage {
            seq: 5,
            type_: ProtocolMessageType::Request(RequestMessage {
                command: "threads".into(),
                arguments: None,
            }),
        };
        let mut buffer = BytesMut::new();
        DAPCodec::new().encode(message, &mut buffer).unwrap();
        let text = str::from_utf8(&buffer).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        let value: Value = serde_json::from_str(body).unwrap();
        assert_eq!(value["command"], "threads");

        let mut buffer = BytesMut::from(text);
        let inbound = DAPCodec::new().decode(&mut buffer).unwrap().unwrap().unwrap();
        assert_eq!(inbound.message.seq, 5);
    }
}

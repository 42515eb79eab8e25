// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_FRAME_LENGTH;
use crate::error::{Error, FrameError};

/// Size of the little-endian length prefix in front of every payload.
pub const FRAME_HEADER_SZ: usize = 4;

/// Ordered values of a single header.
#[derive(Clone, PartialEq, Message)]
pub struct HeaderValues {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

pub type Headers = HashMap<String, HeaderValues>;

#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub id: String,
    /// Promise id; empty when no response is expected.
    #[prost(string, tag = "2")]
    pub pid: String,
    #[prost(string, tag = "3")]
    pub method: String,
    #[prost(string, tag = "4")]
    pub endpoint: String,
    #[prost(bytes = "vec", tag = "5")]
    pub body: Vec<u8>,
    #[prost(map = "string, message", tag = "6")]
    pub headers: HashMap<String, HeaderValues>,
}

// Field 5 once carried trailers and stays unused.
#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(uint32, tag = "1")]
    pub status: u32,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(string, tag = "3")]
    pub pid: String,
    #[prost(bytes = "vec", tag = "4")]
    pub body: Vec<u8>,
    #[prost(map = "string, message", tag = "6")]
    pub headers: HashMap<String, HeaderValues>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Head,
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Head,
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Patch,
        Method::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Head => "HEAD",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or(())
    }
}

/// A fresh UUID v4 in its hyphenated string form.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn first_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.values.first())
        .map(String::as_str)
}

fn push_header(headers: &mut Headers, name: &str, value: String) {
    headers
        .entry(name.to_string())
        .or_default()
        .values
        .push(value);
}

impl Request {
    pub fn new(method: Method, endpoint: &str) -> Request {
        Request {
            id: new_id(),
            method: method.as_str().to_string(),
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    /// First value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        first_header(&self.headers, name)
    }

    pub fn add_header<V: Into<String>>(&mut self, name: &str, value: V) {
        push_header(&mut self.headers, name, value.into());
    }
}

impl Response {
    /// An empty response correlated with `req`. Status starts at zero so
    /// the router can tell whether a handler set one.
    pub fn for_request(req: &Request) -> Response {
        Response {
            id: req.id.clone(),
            pid: req.pid.clone(),
            ..Default::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        first_header(&self.headers, name)
    }

    pub fn add_header<V: Into<String>>(&mut self, name: &str, value: V) {
        push_header(&mut self.headers, name, value.into());
    }
}

fn encode_message<M: Message>(msg: &M) -> Result<Bytes, Error> {
    let mut buf = BytesMut::with_capacity(msg.encoded_len());
    msg.encode(&mut buf)?;
    Ok(buf.freeze())
}

pub fn encode_request(req: &Request) -> Result<Bytes, Error> {
    encode_message(req)
}

pub fn encode_response(resp: &Response) -> Result<Bytes, Error> {
    encode_message(resp)
}

pub fn decode_request(buf: &[u8]) -> Result<Request, Error> {
    Ok(Request::decode(buf)?)
}

pub fn decode_response(buf: &[u8]) -> Result<Response, Error> {
    Ok(Response::decode(buf)?)
}

/// Splits a byte stream into `[length: u32 LE][payload]` frames and writes
/// payloads back out the same way. The codec only deals in raw payloads;
/// turning them into requests or responses is left to the caller so a bad
/// payload can be skipped without losing the stream.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_length: usize,
}

impl FrameCodec {
    pub fn new(max_length: usize) -> FrameCodec {
        FrameCodec { max_length }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, Error> {
        if buf.len() < FRAME_HEADER_SZ {
            return Ok(None);
        }

        let data_len = LittleEndian::read_u32(&buf[..FRAME_HEADER_SZ]) as usize;
        if data_len > self.max_length {
            return Err(FrameError::TooLarge {
                length: data_len,
                max: self.max_length,
            }
            .into());
        }

        let frame_len = FRAME_HEADER_SZ + data_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SZ);
        Ok(Some(buf.split_to(data_len)))
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<BytesMut>, Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None if buf.len() < FRAME_HEADER_SZ => {
                Err(FrameError::ShortLength(buf.len()).into())
            }
            None => {
                let expected =
                    LittleEndian::read_u32(&buf[..FRAME_HEADER_SZ]) as usize;
                Err(FrameError::ShortPayload {
                    expected,
                    actual: buf.len() - FRAME_HEADER_SZ,
                }
                .into())
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, buf: &mut BytesMut) -> Result<(), Error> {
        if payload.len() > self.max_length {
            return Err(FrameError::TooLarge {
                length: payload.len(),
                max: self.max_length,
            }
            .into());
        }
        buf.reserve(FRAME_HEADER_SZ + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put(payload);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};

    fn arbitrary_headers(g: &mut Gen) -> Headers {
        HashMap::<String, Vec<String>>::arbitrary(g)
            .into_iter()
            .map(|(k, values)| (k, HeaderValues { values }))
            .collect()
    }

    impl Arbitrary for Request {
        fn arbitrary(g: &mut Gen) -> Request {
            Request {
                id: String::arbitrary(g),
                pid: String::arbitrary(g),
                method: String::arbitrary(g),
                endpoint: String::arbitrary(g),
                body: Vec::<u8>::arbitrary(g),
                headers: arbitrary_headers(g),
            }
        }
    }

    impl Arbitrary for Response {
        fn arbitrary(g: &mut Gen) -> Response {
            Response {
                status: u32::arbitrary(g),
                id: String::arbitrary(g),
                pid: String::arbitrary(g),
                body: Vec::<u8>::arbitrary(g),
                headers: arbitrary_headers(g),
            }
        }
    }

    quickcheck! {
        fn prop_request_roundtrip(req: Request) -> bool {
            let encoded = encode_request(&req).unwrap();
            decode_request(&encoded).unwrap() == req
        }

        fn prop_response_roundtrip(resp: Response) -> bool {
            let encoded = encode_response(&resp).unwrap();
            decode_response(&encoded).unwrap() == resp
        }

        // However the byte stream is chopped up, the decoder yields the
        // payloads that were written, in order, and nothing else.
        fn prop_frames_survive_arbitrary_splits(
            payloads: Vec<Vec<u8>>,
            chunk: u8
        ) -> bool {
            let mut codec = FrameCodec::default();
            let mut wire = BytesMut::new();
            for p in &payloads {
                codec.encode(Bytes::from(p.clone()), &mut wire).unwrap();
            }

            let chunk = chunk as usize + 1;
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    decoded.push(frame.to_vec());
                }
            }
            buf.is_empty() && decoded == payloads
        }
    }

    #[test]
    fn frame_prefix_is_little_endian_payload_length() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"STATUS"), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[6, 0, 0, 0]);
        assert_eq!(&buf[4..], b"STATUS");
    }

    #[test]
    fn zero_length_frames_are_legal() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frames_are_refused() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::from(&[9u8, 0, 0, 0][..]);
        match codec.decode(&mut buf) {
            Err(Error::Frame(FrameError::TooLarge { length: 9, max: 8 })) => (),
            other => panic!("unexpected decode result: {:?}", other),
        }
        assert!(codec
            .encode(Bytes::from_static(b"123456789"), &mut BytesMut::new())
            .is_err());
    }

    #[test]
    fn truncated_streams_report_where_they_ended() {
        let mut codec = FrameCodec::default();

        let mut buf = BytesMut::from(&[5u8, 0][..]);
        match codec.decode_eof(&mut buf) {
            Err(Error::Frame(FrameError::ShortLength(2))) => (),
            other => panic!("unexpected decode result: {:?}", other),
        }

        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, b'a', b'b'][..]);
        match codec.decode_eof(&mut buf) {
            Err(Error::Frame(FrameError::ShortPayload {
                expected: 5,
                actual: 2,
            })) => (),
            other => panic!("unexpected decode result: {:?}", other),
        }

        assert!(codec.decode_eof(&mut BytesMut::new()).unwrap().is_none());
    }

    #[test]
    fn garbage_payloads_fail_to_decode() {
        // A field header announcing a length-delimited string that never
        // arrives.
        assert!(matches!(decode_request(&[0x0a, 0x10]), Err(Error::Decode(_))));
        assert!(matches!(
            decode_response(&[0xff, 0xff, 0xff]),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn header_values_keep_their_order() {
        let mut req = Request::new(Method::Get, "/v1/status");
        req.add_header("Accept", "text/plain");
        req.add_header("Accept", "application/json");
        let decoded = decode_request(&encode_request(&req).unwrap()).unwrap();
        assert_eq!(decoded.header("Accept"), Some("text/plain"));
        assert_eq!(
            decoded.headers["Accept"].values,
            vec!["text/plain", "application/json"]
        );
        assert_eq!(decoded.header("accept"), None);
    }

    #[test]
    fn methods_parse_case_insensitively() {
        assert_eq!("get".parse::<Method>(), Ok(Method::Get));
        assert_eq!("PATCH".parse::<Method>(), Ok(Method::Patch));
        assert!("OPTIONS".parse::<Method>().is_err());
    }

    #[test]
    fn responses_carry_request_identity() {
        let mut req = Request::new(Method::Post, "/v1/echo");
        req.pid = new_id();
        let resp = Response::for_request(&req);
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.pid, req.pid);
        assert_eq!(resp.status, 0);
        assert!(Uuid::parse_str(&req.id).is_ok());
    }
}

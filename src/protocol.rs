// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::str;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::error::{DecodeError, Error, ProtocolError};

pub const SERVICE_HEADER: &str = "PsyService";
pub const REQUEST_ID_HEADER: &str = "PsyRequestID";
pub const RESPONSE_ID_HEADER: &str = "PsyResponseID";
pub const SIGNATURE_HEADER: &str = "PsySig";
pub const PING_HEADER: &str = "PsyPing";

/// Leading token of a liveness-probe reply. Such frames carry no JSON body.
pub const PONG_PREFIX: &[u8] = b"PsyPong:";

pub const DEFAULT_REQUEST_ID_PREFIX: &str = "PsyNetMessage_X";

const CRLF: &[u8] = b"\r\n";
const DELIMITER: &[u8] = b"\r\n\r\n";
const SIGNATURE_SALT: &[u8] = b"-";

type HmacSha256 = Hmac<Sha256>;

/// Computes `base64(HMAC-SHA256(key, "-" ++ payload))`.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl Signer {
    pub fn new(key: &[u8]) -> Result<Signer, Error> {
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|_| Error::InvalidSigningKey)?;
        Ok(Signer { mac })
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(SIGNATURE_SALT);
        mac.update(payload);
        BASE64.encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Signer { .. }")
    }
}

/*
 * Request ids are scoped to an authenticated session. A single allocator may
 * be shared between the HTTP bootstrap and the WebSocket session so that the
 * numbering continues across both.
 */
#[derive(Debug)]
pub struct RequestIdAllocator {
    prefix: String,
    next: AtomicU64,
}

impl RequestIdAllocator {
    pub fn new<S: Into<String>>(prefix: S) -> RequestIdAllocator {
        RequestIdAllocator {
            prefix: prefix.into(),
            next: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", self.prefix, id)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        RequestIdAllocator::new(DEFAULT_REQUEST_ID_PREFIX)
    }
}

/// An outbound frame: ordered header lines and an optional JSON payload.
#[derive(Debug, Clone, Default)]
pub struct PsyRequest {
    headers: Vec<(String, String)>,
    payload: Option<Bytes>,
}

impl PsyRequest {
    pub fn new() -> PsyRequest {
        PsyRequest::default()
    }

    pub fn call<T>(
        service: &str,
        request_id: &str,
        body: &T,
    ) -> Result<PsyRequest, Error>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)?;
        Ok(PsyRequest::new()
            .header(SERVICE_HEADER, service)
            .header(REQUEST_ID_HEADER, request_id)
            .with_payload(payload))
    }

    /// A liveness probe: a single empty `PsyPing` header and no body.
    pub fn ping() -> PsyRequest {
        PsyRequest::new().header(PING_HEADER, "")
    }

    pub fn header<K, V>(mut self, key: K, value: V) -> PsyRequest
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_payload<B: Into<Bytes>>(mut self, payload: B) -> PsyRequest {
        self.payload = Some(payload.into());
        self
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn encode(&self, signer: &Signer, buf: &mut BytesMut) {
        let signature = self.payload.as_ref().map(|p| signer.sign(p));
        let signature_header =
            signature.as_deref().map(|sig| (SIGNATURE_HEADER, sig));

        for (key, value) in self.headers().chain(signature_header) {
            buf.reserve(key.len() + value.len() + 4);
            buf.put_slice(key.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(CRLF);
        }
        buf.put_slice(CRLF);

        if let Some(payload) = &self.payload {
            buf.put_slice(payload);
        }
    }

    pub fn to_bytes(&self, signer: &Signer) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(signer, &mut buf);
        buf.freeze()
    }
}

#[derive(Deserialize)]
struct ResponseBody {
    #[serde(rename = "Result", default)]
    result: Option<Value>,
    #[serde(rename = "Error", default)]
    error: Option<ProtocolError>,
}

/// A decoded response envelope. `response_id` is empty for unsolicited
/// frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PsyResponse {
    pub response_id: String,
    pub result: Option<Value>,
    pub error: Option<ProtocolError>,
}

impl PsyResponse {
    /// Parses the `{"Result": ..} | {"Error": ..}` body shared by the
    /// WebSocket frames and the HTTP bootstrap.
    pub fn from_body(body: &[u8]) -> Result<PsyResponse, DecodeError> {
        let body: ResponseBody = serde_json::from_slice(body)?;
        Ok(PsyResponse {
            response_id: String::new(),
            result: body.result,
            error: body.error,
        })
    }

    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, Error> {
        if let Some(err) = self.error {
            return Err(Error::Protocol(err));
        }
        let result = self.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(Error::Json)
    }
}

/// What the reader loop can make of one inbound frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Pong,
    Response(PsyResponse),
}

pub fn decode(frame: &[u8]) -> Result<Inbound, DecodeError> {
    if frame.starts_with(PONG_PREFIX) {
        return Ok(Inbound::Pong);
    }
    parse_response(frame).map(Inbound::Response)
}

pub fn parse_response(frame: &[u8]) -> Result<PsyResponse, DecodeError> {
    let split = find_delimiter(frame).ok_or(DecodeError::MissingDelimiter)?;
    let header_block = str::from_utf8(&frame[..split])?;
    let body = &frame[split + DELIMITER.len()..];

    let response_id = parse_headers(header_block)
        .filter(|(key, _)| *key == RESPONSE_ID_HEADER)
        .last()
        .map(|(_, value)| value.to_string())
        .unwrap_or_default();

    let mut response = PsyResponse::from_body(body)?;
    response.response_id = response_id;
    Ok(response)
}

/// Splits a header block into `(key, value)` pairs on the first colon of
/// each line. Lines without a colon are skipped.
pub fn parse_headers(block: &str) -> impl Iterator<Item = (&str, &str)> {
    block
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
}

fn find_delimiter(frame: &[u8]) -> Option<usize> {
    frame
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use quickcheck::{quickcheck, TestResult};
    use serde_json::json;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn signer() -> Signer {
        Signer::new(KEY).unwrap()
    }

    fn frame_str(request: &PsyRequest) -> String {
        String::from_utf8(request.to_bytes(&signer()).to_vec()).unwrap()
    }

    #[test]
    fn encode_call_frame() {
        let request =
            PsyRequest::call("Foo/Bar v1", "X_0", &json!({"a": 1})).unwrap();
        let frame = frame_str(&request);
        let (headers, body) = frame.split_once("\r\n\r\n").unwrap();

        let lines: Vec<&str> = headers.split("\r\n").collect();
        assert_eq!(lines[0], "PsyService: Foo/Bar v1");
        assert_eq!(lines[1], "PsyRequestID: X_0");
        assert_eq!(
            lines[2],
            format!("PsySig: {}", signer().sign(br#"{"a":1}"#))
        );
        assert_eq!(lines.len(), 3);
        assert_eq!(body, r#"{"a":1}"#);
    }

    #[test]
    fn encode_ping_frame() {
        assert_eq!(frame_str(&PsyRequest::ping()), "PsyPing: \r\n\r\n");
    }

    #[test]
    fn no_signature_without_payload() {
        let request = PsyRequest::new()
            .header(SERVICE_HEADER, "Foo/Bar v1")
            .header(REQUEST_ID_HEADER, "X_3");
        let frame = frame_str(&request);
        assert!(!frame.contains(SIGNATURE_HEADER));
        assert!(frame.ends_with("\r\n\r\n"));
    }

    #[test]
    fn signature_matches_hmac() {
        let mut mac = HmacSha256::new_from_slice(KEY).unwrap();
        mac.update(b"-{}");
        let expected = BASE64.encode(mac.finalize().into_bytes());
        assert_eq!(signer().sign(b"{}"), expected);
    }

    #[test]
    fn signature_determinism() {
        fn prop(key: Vec<u8>, payload: Vec<u8>) -> bool {
            let a = Signer::new(&key).unwrap();
            let b = Signer::new(&key).unwrap();
            a.sign(&payload) == b.sign(&payload)
                && a.sign(&payload) == a.sign(&payload)
        }
        quickcheck(prop as fn(Vec<u8>, Vec<u8>) -> bool);
    }

    #[test]
    fn signature_depends_on_key() {
        fn prop(key_a: Vec<u8>, key_b: Vec<u8>, payload: Vec<u8>) -> TestResult {
            if key_a == key_b {
                return TestResult::discard();
            }
            let a = Signer::new(&key_a).unwrap();
            let b = Signer::new(&key_b).unwrap();
            TestResult::from_bool(a.sign(&payload) != b.sign(&payload))
        }
        quickcheck(prop as fn(Vec<u8>, Vec<u8>, Vec<u8>) -> TestResult);
    }

    #[test]
    fn signature_ignores_header_order() {
        fn prop(service: String, id: String) -> TestResult {
            if service.contains(['\r', '\n']) || id.contains(['\r', '\n']) {
                return TestResult::discard();
            }
            let payload = br#"{"k":"v"}"#.to_vec();
            let a = PsyRequest::new()
                .header(SERVICE_HEADER, service.clone())
                .header(REQUEST_ID_HEADER, id.clone())
                .with_payload(payload.clone());
            let b = PsyRequest::new()
                .header(REQUEST_ID_HEADER, id)
                .header(SERVICE_HEADER, service)
                .with_payload(payload);
            let sig = |r: &PsyRequest| {
                let frame = r.to_bytes(&signer());
                let text = String::from_utf8_lossy(&frame).into_owned();
                text.lines()
                    .find(|l| l.starts_with("PsySig: "))
                    .map(str::to_string)
            };
            TestResult::from_bool(sig(&a).is_some() && sig(&a) == sig(&b))
        }
        quickcheck(prop as fn(String, String) -> TestResult);
    }

    #[test]
    fn decode_result() {
        let frame = b"PsyTime: 1700000000\r\nPsySig: test_sig\r\n\
                      PsyResponseID: X_0\r\n\r\n{\"Result\":{\"ok\":true}}";
        let response = match decode(frame).unwrap() {
            Inbound::Response(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(response.response_id, "X_0");
        assert_eq!(response.result, Some(json!({"ok": true})));
        assert!(response.error.is_none());
    }

    #[test]
    fn decode_error_payload() {
        let frame = b"PsyResponseID: PsyNetMessage_X_1\r\n\r\n\
                      {\"Error\":{\"Type\":\"InvalidParameters\",\"Message\":\"\"}}";
        let response = parse_response(frame).unwrap();
        assert_eq!(response.response_id, "PsyNetMessage_X_1");
        assert!(response.result.is_none());
        let err = response.error.clone().unwrap();
        assert_eq!(err.kind, "InvalidParameters");

        match response.into_result::<Value>() {
            Err(Error::Protocol(e)) => assert_eq!(e.kind, "InvalidParameters"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_without_response_id() {
        let response =
            parse_response(b"\r\n\r\n{\"Result\":{\"Message\":\"ok\"}}")
                .unwrap();
        assert_eq!(response.response_id, "");
        let result: Value = response.into_result().unwrap();
        assert_eq!(result["Message"], "ok");
    }

    #[test]
    fn decode_failures() {
        match decode(b"this is not a valid psynet message") {
            Err(DecodeError::MissingDelimiter) => (),
            other => panic!("unexpected {:?}", other),
        }
        match decode(b"PsyResponseID: X_1\r\n\r\n{not json") {
            Err(DecodeError::InvalidJson(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
        match decode(b"PsyResponseID: \xff\r\n\r\n{}") {
            Err(DecodeError::InvalidUtf8(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_pong_skips_json() {
        assert_eq!(decode(b"PsyPong: \r\n\r\n").unwrap(), Inbound::Pong);
        assert_eq!(decode(b"PsyPong:garbage").unwrap(), Inbound::Pong);
    }

    #[test]
    fn null_result_decodes_to_unit() {
        let response = PsyResponse::from_body(b"{\"Result\":null}").unwrap();
        let () = response.into_result().unwrap();
    }

    #[test]
    fn result_shape_mismatch_is_json_error() {
        let response =
            PsyResponse::from_body(b"{\"Result\":{\"a\":\"x\"}}").unwrap();
        match response.into_result::<Vec<u32>>() {
            Err(Error::Json(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn header_parsing_splits_on_first_colon() {
        let headers: Vec<(&str, &str)> =
            parse_headers("A: b:c\r\nnocolon\r\n D :  e ").collect();
        assert_eq!(headers, vec![("A", "b:c"), ("D", "e")]);
    }

    fn suffix(id: &str) -> u64 {
        id.rsplit('_').next().unwrap().parse().unwrap()
    }

    #[test]
    fn request_ids_increase() {
        let ids = RequestIdAllocator::new("X");
        assert_eq!(ids.next_id(), "X_0");
        assert_eq!(ids.next_id(), "X_1");

        let mut last = 1;
        for _ in 0..1000 {
            let next = suffix(&ids.next_id());
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn request_ids_unique_across_threads() {
        let ids = Arc::new(RequestIdAllocator::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || {
                    (0..500).map(|_| ids.next_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(id.starts_with(DEFAULT_REQUEST_ID_PREFIX));
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }
}

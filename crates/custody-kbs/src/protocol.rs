//! Wire protocol between broker clients and the daemon
//!
//! Every message is a 4-byte big-endian length followed by a bincode body.
//! Enum variant indices are the wire values, so variants are only ever
//! appended.

use std::fmt;
use std::str::FromStr;

use custody_crypto::OperationKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroize;

use crate::error::{BrokerError, Result};

/// Protocol constants
pub mod constants {
    /// Largest frame body accepted by default
    pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

    /// Length prefix size
    pub const FRAME_HEADER_LEN: usize = 4;

    /// Version selector for the highest published version
    pub const LATEST_VERSION: u32 = 0;
}

/// Request operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Ping,
    Encrypt,
    Decrypt,
    Hmac,
    Sign,
    Verify,
    Retrieve,
}

impl Operation {
    /// Whether the operation runs through the engine under `operate`
    pub fn is_operate(&self) -> bool {
        self.engine_kind().is_some()
    }

    pub fn engine_kind(&self) -> Option<OperationKind> {
        match self {
            Operation::Encrypt => Some(OperationKind::Encrypt),
            Operation::Decrypt => Some(OperationKind::Decrypt),
            Operation::Hmac => Some(OperationKind::Hmac),
            Operation::Sign => Some(OperationKind::Sign),
            Operation::Verify => Some(OperationKind::Verify),
            Operation::Ping | Operation::Retrieve => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Ping => "ping",
            Operation::Encrypt => "encrypt",
            Operation::Decrypt => "decrypt",
            Operation::Hmac => "hmac",
            Operation::Sign => "sign",
            Operation::Verify => "verify",
            Operation::Retrieve => "retrieve",
        };
        f.write_str(name)
    }
}

/// A single broker request. Payloads are wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub operation: Operation,
    /// Empty for `Ping`
    pub set_name: String,
    /// `0` selects the latest version
    pub version: u32,
    /// Algorithm ordinal; `None` means the operation's default
    pub algorithm: Option<u32>,
    pub payload: Vec<u8>,
    /// Signature for `Verify`
    pub aux_payload: Option<Vec<u8>>,
}

impl Request {
    pub fn new(operation: Operation, set_name: impl Into<String>, version: u32) -> Self {
        Self {
            operation,
            set_name: set_name.into(),
            version,
            algorithm: None,
            payload: Vec::new(),
            aux_payload: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(Operation::Ping, "", constants::LATEST_VERSION)
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_algorithm(mut self, algorithm: Option<u32>) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_aux_payload(mut self, aux: impl Into<Vec<u8>>) -> Self {
        self.aux_payload = Some(aux.into());
        self
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.payload.zeroize();
        self.aux_payload.zeroize();
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("operation", &self.operation)
            .field("set_name", &self.set_name)
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .field("payload_len", &self.payload.len())
            .field("aux_len", &self.aux_payload.as_ref().map(Vec::len))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Result carried by a successful response. Key bytes are wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    Bytes(Vec<u8>),
    Bool(bool),
    SymmetricKey {
        version: u32,
        secret: Vec<u8>,
    },
    /// PKCS#1 DER encodings
    KeyPair {
        version: u32,
        public_der: Vec<u8>,
        private_der: Vec<u8>,
    },
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        match self {
            ResponseBody::Bytes(bytes) => bytes.zeroize(),
            ResponseBody::Bool(_) => {}
            ResponseBody::SymmetricKey { secret, .. } => secret.zeroize(),
            ResponseBody::KeyPair { private_der, .. } => private_der.zeroize(),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            ResponseBody::Bool(value) => write!(f, "Bool({})", value),
            ResponseBody::SymmetricKey { version, .. } => {
                write!(f, "SymmetricKey {{ version: {}, secret: [REDACTED] }}", version)
            }
            ResponseBody::KeyPair { version, .. } => {
                write!(f, "KeyPair {{ version: {}, private_der: [REDACTED] }}", version)
            }
        }
    }
}

/// Error classification, sent as a stable string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unreachable,
    Denied,
    NotFound,
    KindMismatch,
    UnsupportedAlgorithm,
    AlgorithmFailure,
    Malformed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Denied => "denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::KindMismatch => "kind_mismatch",
            ErrorKind::UnsupportedAlgorithm => "unsupported_algorithm",
            ErrorKind::AlgorithmFailure => "algorithm_failure",
            ErrorKind::Malformed => "malformed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unreachable" => Ok(ErrorKind::Unreachable),
            "denied" => Ok(ErrorKind::Denied),
            "not_found" => Ok(ErrorKind::NotFound),
            "kind_mismatch" => Ok(ErrorKind::KindMismatch),
            "unsupported_algorithm" => Ok(ErrorKind::UnsupportedAlgorithm),
            "algorithm_failure" => Ok(ErrorKind::AlgorithmFailure),
            "malformed" => Ok(ErrorKind::Malformed),
            other => Err(BrokerError::Protocol(format!("unknown error kind {:?}", other))),
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    pub result: Option<ResponseBody>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            status: ResponseStatus::Ok,
            result: Some(body),
            error_kind: None,
            message: None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            result: None,
            error_kind: Some(kind),
            message: Some(message.into()),
        }
    }

    pub fn from_error(err: &BrokerError) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Turn an error response into `BrokerError::Remote`
    pub fn into_result(mut self) -> Result<ResponseBody> {
        match self.status {
            ResponseStatus::Ok => self
                .result
                .take()
                .ok_or_else(|| BrokerError::Protocol("ok response without a result".to_string())),
            ResponseStatus::Error => Err(BrokerError::Remote {
                kind: self.error_kind.unwrap_or(ErrorKind::Malformed),
                message: self.message.take().unwrap_or_default(),
            }),
        }
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Read one frame body. `Ok(None)` when the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; constants::FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_bytes {
        return Err(BrokerError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_bytes
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max_frame_bytes {
        return Err(BrokerError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            max_frame_bytes
        )));
    }

    let len = u32::try_from(body.len())
        .map_err(|_| BrokerError::Protocol("frame length overflows u32".to_string()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use constants::DEFAULT_MAX_FRAME_BYTES;

    #[test]
    fn test_operation_wire_indices() {
        // Indices are wire values and must never shift
        let expected = [
            Operation::Ping,
            Operation::Encrypt,
            Operation::Decrypt,
            Operation::Hmac,
            Operation::Sign,
            Operation::Verify,
            Operation::Retrieve,
        ];
        for (index, op) in expected.iter().enumerate() {
            let bytes = encode(op).unwrap();
            assert_eq!(bytes, (index as u32).to_le_bytes());
        }
    }

    #[test]
    fn test_error_kind_is_a_string_on_the_wire() {
        let response = Response::error(ErrorKind::NotFound, "missing");
        let bytes = encode(&response).unwrap();
        let needle = b"not_found";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));

        let decoded: Response = decode(&bytes).unwrap();
        assert_eq!(decoded.error_kind, Some(ErrorKind::NotFound));
    }

    #[test]
    fn test_debug_hides_payloads() {
        let request = Request::new(Operation::Encrypt, "org.example.sym", 0)
            .with_payload(b"plaintext secret".to_vec());
        let printed = format!("{:?}", request);
        assert!(!printed.contains("112"));
        assert!(printed.contains("payload_len: 16"));

        let body = ResponseBody::SymmetricKey { version: 2, secret: vec![9; 32] };
        assert!(format!("{:?}", body).contains("REDACTED"));
    }

    #[test]
    fn test_garbage_body_is_malformed() {
        let err = decode::<Request>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn test_into_result() {
        let body = Response::ok(ResponseBody::Bool(true)).into_result().unwrap();
        assert_eq!(body, ResponseBody::Bool(true));

        let err = Response::error(ErrorKind::Denied, "no").into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Denied);
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = Request::ping();
        let body = encode(&request).unwrap();
        write_frame(&mut a, &body, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        drop(a);

        let frame = read_frame(&mut b, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap();
        let decoded: Request = decode(&frame).unwrap();
        assert_eq!(decoded, request);

        // Clean close between frames
        assert!(read_frame(&mut b, DEFAULT_MAX_FRAME_BYTES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(1u32 << 30).to_be_bytes()).await.unwrap();

        let err = read_frame(&mut b, DEFAULT_MAX_FRAME_BYTES).await.unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(_)));
    }
}

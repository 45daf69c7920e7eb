//! Client handle for the broker daemon

use std::path::Path;
use std::time::Duration;

use custody_crypto::{AlgorithmId, KeyKind, RsaKeyPair, SecretBytes};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use zeroize::Zeroizing;

use crate::error::{BrokerError, Result};
use crate::protocol::constants::DEFAULT_MAX_FRAME_BYTES;
use crate::protocol::{
    decode, encode, read_frame, write_frame, Operation, Request, Response, ResponseBody,
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Budget for connect plus the initial ping, per attempt
    pub ping_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(2),
            connect_attempts: 3,
            retry_delay: Duration::from_millis(100),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Key material returned by `retrieve`
#[derive(Debug)]
pub enum RetrievedKey {
    Symmetric { version: u32, secret: SecretBytes },
    Asymmetric { version: u32, pair: RsaKeyPair },
}

impl RetrievedKey {
    pub fn version(&self) -> u32 {
        match self {
            RetrievedKey::Symmetric { version, .. } | RetrievedKey::Asymmetric { version, .. } => {
                *version
            }
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            RetrievedKey::Symmetric { .. } => KeyKind::Symmetric,
            RetrievedKey::Asymmetric { .. } => KeyKind::Asymmetric,
        }
    }
}

/// Connection to a broker. Requests are sent one at a time and are never
/// retried once written.
pub struct BrokerClient<S = UnixStream> {
    stream: S,
    max_frame_bytes: usize,
}

impl BrokerClient<UnixStream> {
    /// Connect and ping. Only connection establishment is retried; a broker
    /// that stays silent yields `Unreachable`.
    pub async fn connect(path: impl AsRef<Path>, options: ClientOptions) -> Result<Self> {
        let path = path.as_ref();
        let attempts = options.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Self::try_connect(path, &options).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    debug!("connect attempt {}/{} to {} failed: {}", attempt, attempts, path.display(), e);
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        Err(BrokerError::Unreachable(format!("{}: {}", path.display(), last_error)))
    }

    async fn try_connect(path: &Path, options: &ClientOptions) -> Result<Self> {
        let establish = async {
            let stream = UnixStream::connect(path).await?;
            let mut client = BrokerClient::from_stream(stream, options.max_frame_bytes);
            client.ping().await?;
            Ok::<_, BrokerError>(client)
        };

        tokio::time::timeout(options.ping_timeout, establish)
            .await
            .map_err(|_| {
                BrokerError::Unreachable(format!("no ping reply within {:?}", options.ping_timeout))
            })?
    }
}

impl<S> BrokerClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected transport
    pub fn from_stream(stream: S, max_frame_bytes: usize) -> Self {
        Self {
            stream,
            max_frame_bytes,
        }
    }

    /// Send one request and wait for its response
    pub async fn call(&mut self, request: Request) -> Result<ResponseBody> {
        let body = Zeroizing::new(encode(&request)?);
        drop(request);
        write_frame(&mut self.stream, &body, self.max_frame_bytes).await?;

        let frame = read_frame(&mut self.stream, self.max_frame_bytes)
            .await?
            .ok_or_else(|| BrokerError::Unreachable("broker closed the connection".to_string()))?;
        let frame = Zeroizing::new(frame);
        let response: Response = decode(&frame)
            .map_err(|e| BrokerError::Protocol(format!("undecodable response: {}", e)))?;
        response.into_result()
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.call(Request::ping()).await? {
            ResponseBody::Bool(true) => Ok(()),
            other => Err(unexpected(Operation::Ping, &other)),
        }
    }

    pub async fn encrypt(
        &mut self,
        set: &str,
        version: u32,
        algorithm: Option<AlgorithmId>,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        self.bytes_op(Operation::Encrypt, set, version, algorithm, plaintext).await
    }

    pub async fn decrypt(
        &mut self,
        set: &str,
        version: u32,
        algorithm: Option<AlgorithmId>,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        self.bytes_op(Operation::Decrypt, set, version, algorithm, ciphertext).await
    }

    pub async fn hmac(
        &mut self,
        set: &str,
        version: u32,
        algorithm: Option<AlgorithmId>,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.bytes_op(Operation::Hmac, set, version, algorithm, data).await
    }

    pub async fn sign(
        &mut self,
        set: &str,
        version: u32,
        algorithm: Option<AlgorithmId>,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.bytes_op(Operation::Sign, set, version, algorithm, data).await
    }

    /// `Ok(false)` when the signature does not match
    pub async fn verify(
        &mut self,
        set: &str,
        version: u32,
        algorithm: Option<AlgorithmId>,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let request = Request::new(Operation::Verify, set, version)
            .with_algorithm(algorithm.map(AlgorithmId::ordinal))
            .with_payload(data.to_vec())
            .with_aux_payload(signature.to_vec());
        match self.call(request).await? {
            ResponseBody::Bool(valid) => Ok(valid),
            other => Err(unexpected(Operation::Verify, &other)),
        }
    }

    pub async fn retrieve(&mut self, set: &str, version: u32) -> Result<RetrievedKey> {
        let mut body = self.call(Request::new(Operation::Retrieve, set, version)).await?;
        match &mut body {
            ResponseBody::SymmetricKey { version, secret } => Ok(RetrievedKey::Symmetric {
                version: *version,
                secret: SecretBytes::new(std::mem::take(secret)),
            }),
            ResponseBody::KeyPair {
                version,
                private_der,
                ..
            } => Ok(RetrievedKey::Asymmetric {
                version: *version,
                pair: RsaKeyPair::from_pkcs1_der(private_der)?,
            }),
            other => Err(unexpected(Operation::Retrieve, other)),
        }
    }

    async fn bytes_op(
        &mut self,
        operation: Operation,
        set: &str,
        version: u32,
        algorithm: Option<AlgorithmId>,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let request = Request::new(operation, set, version)
            .with_algorithm(algorithm.map(AlgorithmId::ordinal))
            .with_payload(payload.to_vec());
        let mut body = self.call(request).await?;
        match &mut body {
            ResponseBody::Bytes(bytes) => Ok(std::mem::take(bytes)),
            other => Err(unexpected(operation, other)),
        }
    }
}

fn unexpected(operation: Operation, body: &ResponseBody) -> BrokerError {
    BrokerError::Protocol(format!("unexpected {} result: {:?}", operation, body))
}

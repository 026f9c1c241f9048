//! Length-prefixed command loop on a pair of byte streams.
//!
//! Request frame: 4-byte request code, 4-byte payload length, payload.
//! Reply frame: 4-byte length, payload. Integers are host-endian; this is
//! local IPC between processes on one machine, not a wire protocol.

use std::io;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::session_token::{
    check_token, generate_session_token, get_token_public_id, TokenError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    Quit,
    Echo,
    GenerateToken,
    GetTokenId,
    CheckToken,
    SubmitPayload,
    Error,
}

impl Request {
    pub fn code(&self) -> u32 {
        match self {
            Request::Quit => 0,
            Request::Echo => 1,
            Request::GenerateToken => 2,
            Request::GetTokenId => 3,
            Request::CheckToken => 4,
            Request::SubmitPayload => 5,
            Request::Error => 6,
        }
    }

    fn from_code(code: u32) -> Request {
        match code {
            0 => Request::Quit,
            1 => Request::Echo,
            2 => Request::GenerateToken,
            3 => Request::GetTokenId,
            4 => Request::CheckToken,
            5 => Request::SubmitPayload,
            _ => Request::Error,
        }
    }
}

pub struct Reactor<R, W> {
    input: R,
    output: W,
}

impl<R, W> Reactor<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Serve requests until a quit frame arrives or a request cannot be
    /// handled.
    pub async fn run(mut self) -> io::Result<()> {
        loop {
            let (request, body) = self.read_request().await?;
            self.handle_request(request, &body).await?;
            if request == Request::Quit {
                return Ok(());
            }
        }
    }

    async fn read_request(&mut self) -> io::Result<(Request, Vec<u8>)> {
        let code = read_u32_native(&mut self.input).await?;
        let len = read_u32_native(&mut self.input).await? as usize;

        // An empty payload ends the session, whatever the code says.
        if len == 0 {
            return Ok((Request::Quit, Vec::new()));
        }
        let mut body = vec![0u8; len];
        self.input.read_exact(&mut body).await?;
        Ok((Request::from_code(code), body))
    }

    async fn write_reply(&mut self, data: &[u8]) -> io::Result<()> {
        self.output
            .write_all(&(data.len() as u32).to_ne_bytes())
            .await?;
        self.output.write_all(data).await?;
        self.output.flush().await
    }

    async fn handle_request(&mut self, request: Request, body: &[u8]) -> io::Result<()> {
        debug!(?request, len = body.len(), "handling request");
        match request {
            Request::Quit => self.write_reply(b"ok").await,
            Request::Echo => self.write_reply(body).await,
            Request::GenerateToken => {
                let reply = handle_generate_token(body)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                self.write_reply(reply.as_bytes()).await
            }
            Request::GetTokenId => {
                let reply = handle_get_token_id(body);
                self.write_reply(reply.as_bytes()).await
            }
            Request::CheckToken => {
                let reply = handle_check_token(body)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                self.write_reply(reply.as_bytes()).await
            }
            // Stubbed: the frame is consumed and no reply is written.
            Request::SubmitPayload => Ok(()),
            Request::Error => {
                warn!("unknown command received");
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unknown request code",
                ))
            }
        }
    }
}

fn handle_generate_token(body: &[u8]) -> Result<String, String> {
    let request: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("malformed request: {e}"))?;
    let key_id = request
        .get("key_id")
        .and_then(|v| v.as_str())
        .ok_or("missing key_id")?;
    let path = request
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or("missing path")?;
    let max_lease_time = request
        .get("max_lease_time")
        .and_then(|v| v.as_u64())
        .ok_or("missing max_lease_time")?;

    let issued = generate_session_token(key_id, path, max_lease_time)
        .map_err(|e| format!("token generation failed: {e}"))?;
    Ok(json!({
        "token": issued.token,
        "id": issued.public_id,
        "secret": issued.secret,
    })
    .to_string())
}

fn handle_get_token_id(body: &[u8]) -> String {
    let token = String::from_utf8_lossy(body);
    match get_token_public_id(&token) {
        Ok(id) => json!({ "status": "ok", "id": id }).to_string(),
        Err(_) => json!({ "status": "error", "reason": "invalid_token" }).to_string(),
    }
}

fn handle_check_token(body: &[u8]) -> Result<String, String> {
    let request: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("malformed request: {e}"))?;
    let token = request
        .get("token")
        .and_then(|v| v.as_str())
        .ok_or("missing token")?;
    let secret = request
        .get("secret")
        .and_then(|v| v.as_str())
        .ok_or("missing secret")?;

    Ok(match check_token(token, secret) {
        Ok(path) => json!({ "status": "ok", "path": path }).to_string(),
        Err(TokenError::Expired) => {
            json!({ "status": "error", "reason": "expired_token" }).to_string()
        }
        Err(_) => json!({ "status": "error", "reason": "invalid_token" }).to_string(),
    })
}

/// Client-side framing: send one request.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: Request,
    data: &[u8],
) -> io::Result<()> {
    writer.write_all(&request.code().to_ne_bytes()).await?;
    writer.write_all(&(data.len() as u32).to_ne_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Client-side framing: read one reply.
pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u32_native(reader).await? as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_u32_native<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_ne_bytes(buf))
}

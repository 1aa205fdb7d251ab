//! Terminal stage writing processed buffers to the peers
//!
//! Decrypted TLS traffic is re-encrypted with the engine facing the
//! destination: requests with the client-role codec towards the real server,
//! responses with the server-role codec towards the local client. Everything
//! else is written as is.

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use super::session::HttpSession;
use super::{HttpInterceptChain, HttpInterceptor};
use crate::error::Result;
use crate::interceptor::tunnel::Tunnel;
use crate::tls::{CodecCallback, TlsCodec};

struct ToRemote<'t>(&'t dyn Tunnel);

impl CodecCallback for ToRemote<'_> {
    fn encrypt_success(&mut self, buffer: Bytes) -> Result<()> {
        self.0.write_to_remote_server(buffer)
    }
}

struct ToLocal<'t>(&'t dyn Tunnel);

impl CodecCallback for ToLocal<'_> {
    fn encrypt_success(&mut self, buffer: Bytes) -> Result<()> {
        self.0.write_to_local_client(buffer)
    }
}

/// Writes every buffer that reaches the end of the HTTP chain
#[derive(Debug, Default)]
pub struct HttpFlushInterceptor {
    request_codec: Option<Arc<TlsCodec>>,
    response_codec: Option<Arc<TlsCodec>>,
}

impl HttpFlushInterceptor {
    /// # Arguments
    ///
    /// * `request_codec` - Server-role codec; encrypts responses for the local client
    /// * `response_codec` - Client-role codec; encrypts requests for the real server
    #[must_use]
    pub const fn new(request_codec: Option<Arc<TlsCodec>>, response_codec: Option<Arc<TlsCodec>>) -> Self {
        Self {
            request_codec,
            response_codec,
        }
    }
}

impl HttpInterceptor for HttpFlushInterceptor {
    fn on_request(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let decrypted = {
            let request = session.request();
            request.is_https == Some(true) && request.is_plaintext == Some(true)
        };
        if decrypted {
            match &self.response_codec {
                Some(codec) => codec.encode(session.key(), &buffer, &mut ToRemote(tunnel))?,
                None => warn!("Decrypted request on {} but no TLS codec to re-encrypt", session.key()),
            }
        } else {
            tunnel.write_to_remote_server(buffer.clone())?;
        }
        chain.process_request_next(buffer, session, tunnel)
    }

    fn on_response(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let decrypted = {
            let response = session.response();
            response.is_https == Some(true) && response.is_plaintext == Some(true)
        };
        if decrypted {
            match &self.request_codec {
                Some(codec) => codec.encode(session.key(), &buffer, &mut ToLocal(tunnel))?,
                None => warn!("Decrypted response on {} but no TLS codec to re-encrypt", session.key()),
            }
        } else {
            tunnel.write_to_local_client(buffer.clone())?;
        }
        chain.process_response_next(buffer, session, tunnel)
    }
}

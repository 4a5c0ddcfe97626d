//! CoAP request engine
//!
//! Builds CORECONF requests, pushes them through a [`Transport`] and turns
//! the replies into [`Response`]s. Block-wise GET reassembles a body from
//! strictly sequential Block2 requests.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::coap_types::{
    Block2, CoapOption, ContentFormat, Message, MessageType, Method, QueryParams, Response,
    option,
};
use crate::error::{CoreconfError, Result};
use crate::transport::Transport;

/// CORECONF datastore resource
pub const DATASTORE_PATH: &str = "c";

/// CoAP client bound to one transport
#[derive(Debug)]
pub struct CoapClient {
    transport: Transport,
    next_message_id: AtomicU16,
    next_token: AtomicU32,
    block_szx: u8,
}

impl CoapClient {
    pub fn new(transport: Transport, block_szx: u8) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        Self {
            transport,
            next_message_id: AtomicU16::new(seed as u16),
            next_token: AtomicU32::new(seed.rotate_left(16)),
            block_szx: block_szx.min(6),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn block_szx(&self) -> u8 {
        self.block_szx
    }

    fn allocate(&self) -> (u16, Vec<u8>) {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        (message_id, token.to_be_bytes().to_vec())
    }

    /// Send a request and return the parsed (unchecked) response.
    ///
    /// The message ID and token of `request` are replaced.
    pub async fn send(&self, mut request: Message) -> Result<Response> {
        let (message_id, token) = self.allocate();
        request.message_id = message_id;
        request.token = token;

        let wire = request.build()?;
        debug!(
            method = request.code,
            message_id,
            bytes = wire.len(),
            "CoAP request"
        );
        let reply = Message::parse(&self.transport.send_request(&wire, message_id).await?)?;

        match reply.message_type {
            MessageType::Reset => {
                return Err(CoreconfError::Protocol {
                    code: "RST".into(),
                    diagnostic: Some(format!("device reset message {message_id}")),
                });
            }
            MessageType::Acknowledgement if reply.code == 0 => {
                return Err(CoreconfError::MalformedMessage(
                    "separate responses are not supported".into(),
                ));
            }
            _ => {}
        }
        if reply.token != request.token {
            return Err(CoreconfError::MalformedMessage(format!(
                "token mismatch on message {message_id}"
            )));
        }

        let response = Response::from_message(&reply)?;
        debug!(code = %response.code, bytes = response.payload.len(), "CoAP response");
        Ok(response)
    }

    /// Single GET, failing on a non-2.xx code
    pub async fn send_get(&self, path: &str, accept: ContentFormat) -> Result<Response> {
        let mut request = Message::request(Method::Get, 0, Vec::new());
        request.set_path(path);
        request.add_option(accept_option(accept));
        self.send(request).await?.into_result()
    }

    /// GET a body of any size using Block2 transfer.
    ///
    /// Blocks are requested one after the other; any failed block, a block
    /// number out of sequence, or a body shorter than the announced Size2
    /// fails the whole transfer.
    ///
    /// Truncation can only be detected when the device sends Size2. Without
    /// it, a final block that arrives early with the more-flag cleared is
    /// indistinguishable from a genuine end and the shorter body is returned.
    pub async fn send_blockwise_get(
        &self,
        path: &str,
        query: QueryParams,
        accept: ContentFormat,
    ) -> Result<Vec<u8>> {
        let mut szx = self.block_szx;
        let mut body = Vec::new();
        let mut expected_total = None;
        let mut num = 0u32;

        loop {
            let mut request = Message::request(Method::Get, 0, Vec::new());
            request.set_path(path);
            request.set_query(&query.to_query_string());
            request.add_option(accept_option(accept));
            request.add_option(Block2::new(num, false, szx).to_option());

            let response = self.send(request).await?.into_result()?;
            if response.size2.is_some() {
                expected_total = response.size2;
            }

            let Some(block) = response.block2 else {
                if num == 0 {
                    return Ok(response.payload);
                }
                return Err(CoreconfError::BlockTransfer(format!(
                    "block {num} response has no Block2 option"
                )));
            };

            if block.num != num {
                return Err(CoreconfError::BlockTransfer(format!(
                    "requested block {num}, received block {}",
                    block.num
                )));
            }
            if num == 0 && block.szx < szx {
                debug!(requested = szx, granted = block.szx, "device reduced block size");
                szx = block.szx;
            } else if block.szx != szx {
                return Err(CoreconfError::BlockTransfer(format!(
                    "block size changed mid-transfer at block {num}"
                )));
            }
            if block.more && response.payload.len() != block.size() {
                return Err(CoreconfError::BlockTransfer(format!(
                    "block {num} carries {} bytes, expected {}",
                    response.payload.len(),
                    block.size()
                )));
            }

            body.extend_from_slice(&response.payload);
            debug!(block = num, more = block.more, total = body.len(), "block received");

            if !block.more {
                if let Some(total) = expected_total
                    && body.len() < total as usize
                {
                    return Err(CoreconfError::BlockTransfer(format!(
                        "truncated: received {} of {total} bytes",
                        body.len()
                    )));
                }
                return Ok(body);
            }
            num += 1;
        }
    }

    /// FETCH specific nodes: `queries` are encoded instance identifiers,
    /// sent as one CBOR sequence; the combined instances are returned.
    pub async fn send_ifetch_request(&self, queries: &[Vec<u8>]) -> Result<Vec<u8>> {
        let mut request = Message::request(Method::Fetch, 0, Vec::new());
        request.set_path(DATASTORE_PATH);
        request.set_payload(queries.concat(), ContentFormat::YangIdentifiersCborSeq);
        request.add_option(accept_option(ContentFormat::YangInstancesCborSeq));
        Ok(self.send(request).await?.into_result()?.payload)
    }

    /// iPATCH the datastore with encoded instances
    pub async fn send_ipatch_request(&self, instances: &[Vec<u8>]) -> Result<()> {
        let mut request = Message::request(Method::IPatch, 0, Vec::new());
        request.set_path(DATASTORE_PATH);
        request.set_payload(instances.concat(), ContentFormat::YangInstancesCborSeq);
        self.send(request).await?.into_result()?;
        Ok(())
    }

    /// POST an RPC invocation; returns the output instances (may be empty)
    pub async fn send_post_request(&self, path: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let mut request = Message::request(Method::Post, 0, Vec::new());
        request.set_path(path);
        request.set_payload(payload, ContentFormat::YangInstancesCborSeq);
        request.add_option(accept_option(ContentFormat::YangInstancesCborSeq));
        Ok(self.send(request).await?.into_result()?.payload)
    }
}

fn accept_option(format: ContentFormat) -> CoapOption {
    CoapOption::uint(option::ACCEPT, u32::from(format.as_u16()))
}

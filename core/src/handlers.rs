//! Built-in receive handling for packets addressed to this node.

use crate::buffer::PacketBuf;
use crate::pipeline::Engine;
use crate::transport::ReceiveHandler;
use crate::types::{Auth, Destination, PacketType};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hand-off point to the RPC server's command and data queues.
///
/// Submission transfers buffer ownership; the server frees the buffer
/// once the command or data transfer completes.
pub trait RpcSink: Send + Sync {
    fn submit_command(&self, buf: PacketBuf);
    fn submit_data(&self, buf: PacketBuf);
}

/// The receive handler installed on every interface by default.
pub struct DefaultHandler;

#[async_trait]
impl ReceiveHandler for DefaultHandler {
    async fn handle(self: Arc<Self>, engine: &Arc<Engine>, buf: PacketBuf) {
        if buf.rx().auth == Auth::Failure {
            debug!(
                interface = %buf.rx().interface_id,
                "dropping unauthenticated packet"
            );
            return;
        }

        match buf.rx().packet_type {
            PacketType::EchoReq => echo_response(engine, &buf),
            PacketType::RpcCmd => {
                if let Some(rpc) = engine.rpc_sink() {
                    rpc.submit_command(buf);
                } else {
                    debug!("RPC command with no RPC server registered");
                }
            }
            PacketType::RpcData => {
                if let Some(rpc) = engine.rpc_sink() {
                    rpc.submit_data(buf);
                } else {
                    debug!("RPC data with no RPC server registered");
                }
            }
            other => {
                debug!(packet_type = ?other, "no handler for packet, dropping");
            }
        }
    }
}

/// Mirror an ECHO_REQ back on the interface it arrived on.
fn echo_response(engine: &Arc<Engine>, req: &PacketBuf) {
    let Some(iface) = req.rx().interface else {
        return;
    };
    // Allocation must not block the pipeline; drop the echo on exhaustion.
    let Some(mut rsp) = engine.tx_pool().try_alloc() else {
        warn!("echo response dropped, TX pool exhausted");
        return;
    };
    rsp.data_mut().extend_from_slice(req.data());
    let meta = rsp.tx_mut();
    meta.packet_type = PacketType::EchoRsp;
    meta.auth = req.rx().auth;
    meta.destination = Destination::AllPeers;

    if engine.queue(rsp, iface).is_err() {
        warn!("echo response dropped, TX queue full");
    }
}

//! Blind CONNECT tunnel relay.
//!
//! Handles bidirectional data transfer between the client and the upstream
//! once a tunnel is established and the proxy is no longer interpreting the
//! byte stream.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::Result;

/// Copy data bidirectionally between two streams until both directions close.
///
/// Returns `(client_to_server, server_to_client)` byte counts.
pub async fn copy_bidirectional<C, S>(client: C, server: S) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let client_to_server = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (client_to_server_result, server_to_client_result) =
        tokio::join!(client_to_server, server_to_client);

    let bytes_sent = client_to_server_result.unwrap_or_else(|e| {
        debug!("Client to server copy ended: {}", e);
        0
    });

    let bytes_received = server_to_client_result.unwrap_or_else(|e| {
        debug!("Server to client copy ended: {}", e);
        0
    });

    debug!(
        bytes_sent = bytes_sent,
        bytes_received = bytes_received,
        "Tunnel closed"
    );

    Ok((bytes_sent, bytes_received))
}

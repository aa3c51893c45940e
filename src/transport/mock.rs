//! In-memory transport for tests.
//!
//! `pair()` hands back a connection-runtime-facing [`Transport`] and a
//! server-facing [`tokio::io::DuplexStream`] a test can drive directly —
//! write a CONNACK into it, read the CONNECT the runtime sent, etc.

use tokio::io::{duplex, DuplexStream};

use super::Transport;

/// Default buffer size for the in-memory duplex pipe; generous enough that
/// tests never block on a full buffer mid-packet.
const MOCK_BUFFER_SIZE: usize = 64 * 1024;

/// Returns `(client_side, server_side)`. `client_side` implements
/// [`Transport`] and is what the connection runtime is handed; `server_side`
/// is kept by the test to assert on outbound bytes and inject inbound ones.
pub fn pair() -> (Box<dyn Transport>, DuplexStream) {
    let (client, server) = duplex(MOCK_BUFFER_SIZE);
    (Box::new(client), server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_written_on_one_side_are_readable_on_the_other() {
        let (mut client, mut server) = pair();
        client.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}

//! Capabilities the session consumes from the client-facing side.

use crate::downstream::Downstream;
use std::io;

/// The upstream (client-facing) half of one proxied request.
///
/// Methods returning `Err` signal that the client handler cannot recover;
/// the session responds by destroying the downstream registration. The
/// session never touches a `Downstream` after a callback that may have
/// invalidated it in the same turn.
pub trait Upstream {
    /// The final (or 1xx interim) response header block is complete.
    fn on_downstream_header_complete(&mut self, downstream: &mut Downstream) -> io::Result<()>;

    /// A chunk of response body. `last` is set when the chunk arrived
    /// with END_STREAM.
    fn on_downstream_body(
        &mut self,
        downstream: &mut Downstream,
        data: &[u8],
        last: bool,
    ) -> io::Result<()>;

    /// The response body finished cleanly.
    fn on_downstream_body_complete(&mut self, downstream: &mut Downstream) -> io::Result<()>;

    /// The downstream response state changed; flush whatever is pending
    /// toward the client.
    fn on_downstream_read(&mut self, downstream: &mut Downstream) -> io::Result<()>;

    /// The request cannot be forwarded; answer the client with `status`.
    fn on_downstream_abort_request(&mut self, downstream: &mut Downstream, status: u16);

    /// The session went away. `hard` means retrying on this session is
    /// pointless (it never reached CONNECTED).
    fn on_downstream_reset(&mut self, downstream: &mut Downstream, hard: bool) -> io::Result<()>;
}

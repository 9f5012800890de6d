//! Per-stream engine state.

use super::BodyProvider;

/// Engine-side record for one stream we opened.
pub(crate) struct StreamRec {
    /// Send-direction flow-control credit.
    pub(crate) send_window: i32,
    /// Received bytes the application has consumed but we have not yet
    /// refunded with a WINDOW_UPDATE.
    pub(crate) consumed: u32,
    /// First HEADERS block seen (distinguishes RESPONSE from trailers).
    pub(crate) got_headers: bool,
    /// Delivery suppressed after a temporal callback failure or a locally
    /// submitted RST_STREAM. Incoming data is auto-consumed.
    pub(crate) ignore: bool,
    pub(crate) local_closed: bool,
    pub(crate) remote_closed: bool,
    /// Body provider for the request side, if any.
    pub(crate) provider: Option<Box<dyn BodyProvider>>,
    /// Provider signalled it has nothing to send until resumed.
    pub(crate) deferred: bool,
}

impl StreamRec {
    pub(crate) fn new(send_window: i32, provider: Option<Box<dyn BodyProvider>>) -> Self {
        let local_closed = provider.is_none();
        Self {
            send_window,
            consumed: 0,
            got_headers: false,
            ignore: false,
            local_closed,
            remote_closed: false,
            provider,
            deferred: false,
        }
    }

    /// True when the send path may produce DATA for this stream.
    pub(crate) fn sendable(&self) -> bool {
        self.provider.is_some()
            && !self.deferred
            && !self.ignore
            && !self.local_closed
            && self.send_window > 0
    }
}

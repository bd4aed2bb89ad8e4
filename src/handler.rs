//! The callback surface a channel reports into.
//!
//! Implement [`ChannelHandler`] to receive lifecycle and data notifications.
//! Every method is invoked on the channel's owning loop thread, in the order
//! the underlying completions happened; it is safe to call back into the
//! channel (write, close, read) from any of them.

use crate::channel::TcpChannel;
use crate::error::Error;

pub trait ChannelHandler: Send + Sync + 'static {
    /// The channel finished connecting or was adopted from an accept
    /// handoff. Fired even when a racing connect timeout already failed the
    /// connect future: the connection did become active, and that is what is
    /// reported.
    fn on_active(&self, channel: &TcpChannel) {
        let _ = channel;
    }

    /// A read completed with `data` bytes. The buffer is only valid for the
    /// duration of the call; it returns to the reactor's pool afterwards.
    fn on_read(&self, channel: &TcpChannel, data: &[u8]);

    /// The current read burst drained (the socket would block). Not called
    /// for bursts that ended in close.
    fn on_read_complete(&self, channel: &TcpChannel) {
        let _ = channel;
    }

    /// The channel is no longer active. Fired once, after the underlying
    /// handle's close confirmed.
    fn on_inactive(&self, channel: &TcpChannel) {
        let _ = channel;
    }

    /// An I/O error other than clean end-of-stream. The channel closes right
    /// after this returns.
    fn on_exception(&self, channel: &TcpChannel, error: Error) {
        log::error!(
            "channel {:?} error: {error}",
            channel.remote_addr().map(|a| a.to_string())
        );
    }
}

//! L2CAP boundary of the BR/EDR core
//!
//! The channel runtime lives in an external L2CAP layer; this module holds
//! the configuration-option codec used at that boundary, the channel
//! parameter types callers pass through `open_l2cap_channel`, and the
//! factory trait the external layer implements.

pub mod config;
pub mod psm;

#[cfg(test)]
mod tests;

pub use config::ChannelConfiguration;
pub use psm::Psm;

use crate::hci::ConnectionHandle;

/// Channel modes selectable through `ChannelParameters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Basic,
    EnhancedRetransmission,
}

/// Parameters requested when opening an outbound channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelParameters {
    pub mode: Option<ChannelMode>,
    pub max_rx_sdu_size: Option<u16>,
    pub flush_timeout: Option<u16>,
}

/// A channel delivered by the external L2CAP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capChannel {
    pub local_cid: u16,
    pub remote_cid: u16,
    pub handle: ConnectionHandle,
    pub psm: Psm,
}

/// Callback delivering the opened channel, or `None` when the peer refused
/// the connection or configuration failed.
pub type ChannelCallback = Box<dyn FnOnce(Option<L2capChannel>)>;

/// Factory surface of the external L2CAP layer.
pub trait ChannelFactory {
    /// Open an outbound channel on `handle` for `psm` with the requested
    /// parameters. The callback fires exactly once.
    fn open_channel(
        &mut self,
        handle: ConnectionHandle,
        psm: Psm,
        parameters: ChannelParameters,
        callback: ChannelCallback,
    );
}

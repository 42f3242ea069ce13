//! HCI transport abstraction
//!
//! The command/event transport is an external collaborator; the core only
//! needs to hand it outbound commands. Events flow back through
//! `BrEdrConnectionManager::handle_event`.

use crate::error::Result;
use crate::hci::packet::HciCommand;

/// Outbound command surface of the HCI transport.
pub trait HciTransport {
    /// Queue a command for transmission to the controller. Status and
    /// completion arrive later as Command Status / Command Complete events.
    fn send_command(&mut self, command: HciCommand) -> Result<()>;
}

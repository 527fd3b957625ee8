//! Transport used to hand messages to remote subscription listeners.

pub mod framed;

use async_trait::async_trait;

use crate::error::RowLogError;
use crate::message::Message;
use crate::types::{HostAddress, SubscriptionId};

/// Client side of the remote listener protocol: `deliver(message) -> done`.
#[async_trait]
pub trait ListenerTransport: Send + Sync {
    async fn deliver(
        &self,
        address: &HostAddress,
        subscription: &SubscriptionId,
        message: &Message,
    ) -> Result<bool, RowLogError>;
}

use thiserror::Error;

use crate::hub::TopicError;
use crate::protocol::ProtocolError;
use crate::rpc::RpcError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Topic(#[from] TopicError),
}

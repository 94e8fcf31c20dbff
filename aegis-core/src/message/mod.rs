//! Message envelopes and the subject grammar they travel on.

pub mod envelope;
pub mod subject;

pub use envelope::{
    Command, CommandProgress, CommandResult, CommandStatus, Event, RpcRequest, RpcResponse,
};
pub use subject::{conforms_to_grammar, Subject, SubjectPattern};

//! Control plane: connection state machine, completion queue and control loop

mod acks;
pub mod completion;
pub mod event_loop;
pub mod notification;
pub mod plane;
mod requests;


pub use completion::{completion_channel, Completion, CompletionReceiver, CompletionSender};
pub use event_loop::{Command, CommandExecutor, CommandResult, ControlHandle, ControlLoop, TopologySnapshot};
pub use notification::Notification;
pub use plane::{ControlPlane, ControlSettings};

use crate::network::ike::message::IKEMessage;
use crate::network::ike::sa::IKESession;

pub mod ike_init;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task finished its job and can be removed.
    Success,
    /// The task needs another exchange round.
    NeedMore,
    /// The task failed; the IKE_SA is unusable.
    Failed,
}

/// One unit of IKE negotiation work, driven by the session one hook at a
/// time: `build` populates outgoing messages, `process` consumes incoming
/// ones. `pre_process` may reject a message before it is processed;
/// `post_build`/`post_process` run after the message has been handled and
/// may override the exchange result (None leaves it as is).
pub trait Task {
    fn pre_process(&mut self, _sa: &mut IKESession, _message: &IKEMessage) -> TaskStatus {
        TaskStatus::Success
    }

    fn process(&mut self, sa: &mut IKESession, message: &IKEMessage) -> TaskStatus;

    fn build(&mut self, sa: &mut IKESession, message: &mut IKEMessage) -> TaskStatus;

    fn post_build(&mut self, _sa: &mut IKESession, _message: &IKEMessage) -> Option<TaskStatus> {
        None
    }

    fn post_process(&mut self, _sa: &mut IKESession, _message: &IKEMessage) -> Option<TaskStatus> {
        None
    }

    /// Re-bind the task to a recovered IKE_SA, dropping per-attempt state.
    fn migrate(&mut self);
}

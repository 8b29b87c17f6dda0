//! Operator-issued pending actions and the mailbox that delivers them.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingAction {
    None,
    Activate,
    Abort,
    Suspend,
    Resume,
    Stop,
    Terminate,
    Remove,
}

impl PendingAction {
    /// Unknown codes decode to `None`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Activate,
            2 => Self::Abort,
            3 => Self::Suspend,
            4 => Self::Resume,
            5 => Self::Stop,
            6 => Self::Terminate,
            7 => Self::Remove,
            _ => Self::None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::Activate => 1,
            Self::Abort => 2,
            Self::Suspend => 3,
            Self::Resume => 4,
            Self::Stop => 5,
            Self::Terminate => 6,
            Self::Remove => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Activate => "Activate",
            Self::Abort => "Abort",
            Self::Suspend => "Suspend",
            Self::Resume => "Resume",
            Self::Stop => "Stop",
            Self::Terminate => "Terminate",
            Self::Remove => "Remove",
        }
    }
}

/// Single-slot mailbox between the dispatcher and a running job.
///
/// Delivery never blocks and the latest pending action wins. A job only reads
/// the slot from its supervision loop, so an action delivered after the job
/// left that loop is never observed.
#[derive(Debug, Default)]
pub struct ActionMailbox {
    slot: Mutex<Option<PendingAction>>,
}

impl ActionMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the action that was overwritten, if any.
    pub fn deliver(&self, action: PendingAction) -> Option<PendingAction> {
        self.slot.lock().replace(action)
    }

    pub fn try_take(&self) -> Option<PendingAction> {
        self.slot.lock().take()
    }
}

//! Call bounded context - manages the lifecycle of SIP dialogs

pub mod aggregate;
pub mod dtmf;
pub mod event;
pub mod value_object;

pub use aggregate::{AckReceipt, Dialog};
pub use dtmf::DtmfDigit;
pub use event::CallEvent;
pub use value_object::{CallDirection, DialogState, EndReason};

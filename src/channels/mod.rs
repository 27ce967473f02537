//! External mailbox / calendar collaborators.

pub mod mailbox;

pub use mailbox::{
    CalendarEvent, DryRunMailbox, MailboxProvider, MeetingRequest, OutgoingEmail,
    ScheduleReceipt, SendReceipt,
};

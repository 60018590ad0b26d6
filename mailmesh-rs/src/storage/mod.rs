//! Message storage modules
//!
//! - [`maildir`]: `storage.maildir`, delivery into per-recipient maildirs

pub mod maildir;

pub use maildir::MaildirStorage;

//! Factories for the modules shipped with the server

use crate::error::Result;
use crate::module::{Factories, Module};
use crate::smtp::SmtpEndpoint;
use crate::storage::MaildirStorage;
use crate::table::StaticTable;
use std::sync::Arc;

/// Register every built-in endpoint and module into `factories`.
pub fn register_all(factories: &mut Factories) -> Result<()> {
    factories.register_endpoint("smtp", |_name, args| {
        Ok(Arc::new(SmtpEndpoint::new(args)?) as Arc<dyn Module>)
    })?;
    factories.register_module("storage.maildir", |spec| {
        Ok(Arc::new(MaildirStorage::new(spec)?) as Arc<dyn Module>)
    })?;
    factories.register_module("table.static", |spec| {
        Ok(Arc::new(StaticTable::new(spec)?) as Arc<dyn Module>)
    })?;
    Ok(())
}

/// Factory tables holding only the built-in modules.
pub fn factories() -> Result<Factories> {
    let mut factories = Factories::new();
    register_all(&mut factories)?;
    Ok(factories)
}
